//! Cross-domain wakeup
//!
//! An [`EventTrigger`] is how a background producer thread tells a
//! single-threaded event loop that something is ready. Implementations must
//! never block and must not lose a signal raised before the loop starts
//! waiting.

use std::sync::Arc;

use tokio::sync::Notify;

/// Wakeup signal raised from a non-scheduler thread
pub trait EventTrigger: Send + Sync {
    fn trigger(&self);
}

impl<F> EventTrigger for F
where
    F: Fn() + Send + Sync,
{
    fn trigger(&self) {
        self()
    }
}

/// Trigger backed by [`tokio::sync::Notify`]
///
/// `notify_one` stores a permit when nobody is waiting, so a wakeup raised
/// between a failed pull and the next `notified().await` is not lost.
#[derive(Debug, Clone, Default)]
pub struct NotifyTrigger {
    notify: Arc<Notify>,
}

impl NotifyTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next wakeup
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl EventTrigger for NotifyTrigger {
    fn trigger(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_closure_trigger() {
        let count = Arc::new(AtomicUsize::new(0));
        let trigger: Arc<dyn EventTrigger> = {
            let count = count.clone();
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        trigger.trigger();
        trigger.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permit_survives_early_trigger() {
        let trigger = NotifyTrigger::new();
        // Raised before anyone waits
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(100), trigger.notified())
            .await
            .expect("stored permit should complete immediately");
    }

    #[tokio::test]
    async fn test_trigger_from_thread() {
        let trigger = NotifyTrigger::new();
        let remote = trigger.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        tokio::time::timeout(Duration::from_secs(2), trigger.notified())
            .await
            .expect("wakeup from producer thread");
    }
}
