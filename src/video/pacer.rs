//! Frame-rate governor
//!
//! Reduces the negotiated capture rate to the configured output rate before
//! frames reach the compressor. Two strategies are available: fixed-stride
//! decimation, and time-budget pacing which also sleeps away the rest of each
//! frame interval so an idle pipeline does not spin the CPU.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{AppError, Result};

/// How frames are selected for compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateStrategy {
    /// Forward every frame
    Passthrough,
    /// Keep every ceil(R_in / R_out)-th frame
    Stride,
    /// Forward once at least 1/R_out has elapsed, sleeping when ahead
    #[default]
    TimeBudget,
}

impl std::fmt::Display for RateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateStrategy::Passthrough => write!(f, "passthrough"),
            RateStrategy::Stride => write!(f, "stride"),
            RateStrategy::TimeBudget => write!(f, "time_budget"),
        }
    }
}

/// Per-frame governor verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorDecision {
    Forward,
    Skip,
}

impl GovernorDecision {
    pub fn is_forward(&self) -> bool {
        matches!(self, GovernorDecision::Forward)
    }
}

/// Governor statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GovernorStats {
    pub forwarded: u64,
    pub skipped: u64,
}

/// Decides which captured frames proceed to compression
pub struct FrameRateGovernor {
    strategy: RateStrategy,
    stride: u64,
    interval: Duration,
    frame_index: u64,
    last_accepted: Option<Instant>,
    stats: GovernorStats,
}

impl FrameRateGovernor {
    /// Create a governor for `input_fps` → `output_fps`
    ///
    /// Asking for more output frames than the source delivers is a
    /// configuration error, never silently clamped.
    pub fn new(input_fps: u32, output_fps: u32, strategy: RateStrategy) -> Result<Self> {
        if input_fps == 0 {
            return Err(AppError::Config("Input frame rate must be > 0".to_string()));
        }
        if output_fps == 0 {
            return Err(AppError::Config("Output frame rate must be > 0".to_string()));
        }
        if output_fps > input_fps {
            return Err(AppError::Config(format!(
                "Output frame rate {} exceeds negotiated input rate {}",
                output_fps, input_fps
            )));
        }

        // Equal rates need no decimation; a time budget would only drop
        // frames that arrive with a little jitter.
        let strategy = if input_fps == output_fps {
            RateStrategy::Passthrough
        } else {
            strategy
        };

        let stride = input_fps.div_ceil(output_fps) as u64;
        let interval = Duration::from_secs(1) / output_fps;
        debug!(
            "Frame-rate governor: {} -> {} fps, strategy={}, stride={}, interval={:?}",
            input_fps, output_fps, strategy, stride, interval
        );

        Ok(Self {
            strategy,
            stride,
            interval,
            frame_index: 0,
            last_accepted: None,
            stats: GovernorStats::default(),
        })
    }

    /// Effective strategy (equal rates collapse to passthrough)
    pub fn strategy(&self) -> RateStrategy {
        self.strategy
    }

    /// Decide for a frame captured now
    pub fn decide(&mut self) -> GovernorDecision {
        self.decide_at(Instant::now())
    }

    /// Decide for a frame observed at `now`
    pub fn decide_at(&mut self, now: Instant) -> GovernorDecision {
        let forward = match self.strategy {
            RateStrategy::Passthrough => true,
            RateStrategy::Stride => {
                let index = self.frame_index;
                self.frame_index += 1;
                index % self.stride == 0
            }
            RateStrategy::TimeBudget => match self.last_accepted {
                Some(last) => now.saturating_duration_since(last) >= self.interval,
                None => true,
            },
        };

        if forward {
            self.last_accepted = Some(now);
            self.stats.forwarded += 1;
            GovernorDecision::Forward
        } else {
            self.stats.skipped += 1;
            trace!("Governor skipped frame");
            GovernorDecision::Skip
        }
    }

    /// Time left in the current budget at `now`
    ///
    /// Zero unless the strategy is `TimeBudget` and the last forwarded frame
    /// was processed in less than one interval.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match (self.strategy, self.last_accepted) {
            (RateStrategy::TimeBudget, Some(last)) => {
                (last + self.interval).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Sleep away the rest of the budget after a forwarded frame
    pub fn pace(&self) {
        let remaining = self.remaining_at(Instant::now());
        if !remaining.is_zero() {
            trace!("Governor ahead of schedule, sleeping {:?}", remaining);
            thread::sleep(remaining);
        }
    }

    pub fn stats(&self) -> GovernorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_output_above_input() {
        let err = FrameRateGovernor::new(15, 20, RateStrategy::TimeBudget);
        assert!(matches!(err, Err(AppError::Config(_))));
        assert!(FrameRateGovernor::new(15, 0, RateStrategy::Stride).is_err());
        assert!(FrameRateGovernor::new(0, 0, RateStrategy::Stride).is_err());
    }

    #[test]
    fn test_stride_keeps_one_in_three() {
        let mut governor = FrameRateGovernor::new(30, 10, RateStrategy::Stride).unwrap();
        let now = Instant::now();
        let decisions: Vec<bool> = (0..90).map(|_| governor.decide_at(now).is_forward()).collect();

        for window in decisions.windows(9) {
            let forwarded = window.iter().filter(|f| **f).count();
            assert!((2..=4).contains(&forwarded), "window forwarded {}", forwarded);
        }
        assert_eq!(governor.stats().forwarded, 30);
        assert_eq!(governor.stats().skipped, 60);
    }

    #[test]
    fn test_stride_rounds_up() {
        // 30 -> 7 fps: stride ceil(30/7) = 5
        let mut governor = FrameRateGovernor::new(30, 7, RateStrategy::Stride).unwrap();
        let now = Instant::now();
        let forwarded = (0..30).filter(|_| governor.decide_at(now).is_forward()).count();
        assert_eq!(forwarded, 6);
    }

    #[test]
    fn test_time_budget_spacing() {
        let mut governor = FrameRateGovernor::new(30, 10, RateStrategy::TimeBudget).unwrap();
        let t0 = Instant::now();
        let ms = Duration::from_millis;

        let mut accepted = Vec::new();
        for offset in (0..=600).step_by(33) {
            let at = t0 + ms(offset);
            if governor.decide_at(at).is_forward() {
                accepted.push(at);
            }
        }
        assert!(accepted.len() >= 4);
        for pair in accepted.windows(2) {
            assert!(pair[1] - pair[0] >= ms(100));
        }
    }

    #[test]
    fn test_time_budget_remaining() {
        let mut governor = FrameRateGovernor::new(30, 10, RateStrategy::TimeBudget).unwrap();
        let t0 = Instant::now();
        assert_eq!(governor.remaining_at(t0), Duration::ZERO);
        governor.decide_at(t0);
        assert_eq!(governor.remaining_at(t0 + Duration::from_millis(30)), Duration::from_millis(70));
        assert_eq!(governor.remaining_at(t0 + Duration::from_millis(150)), Duration::ZERO);
    }

    #[test]
    fn test_equal_rates_forward_everything() {
        let mut governor = FrameRateGovernor::new(5, 5, RateStrategy::TimeBudget).unwrap();
        assert_eq!(governor.strategy(), RateStrategy::Passthrough);
        let now = Instant::now();
        assert!((0..5).all(|_| governor.decide_at(now).is_forward()));
        assert_eq!(governor.remaining_at(now), Duration::ZERO);
    }
}
