//! Pipeline controller
//!
//! Owns the worker thread(s) that run capture → convert → govern → compress
//! and feed the output queue. The source is opened and the rates validated on
//! the caller's thread, so configuration errors surface from `start()` before
//! anything is spawned.
//!
//! Two layouts are supported:
//!
//! ```text
//! Single:     [source → governor → converter → engine → queue]      one thread
//!
//! Decoupled:  [source → latest slot]  capture thread
//!                        ↓ (newest frame only)
//!             [governor → converter → engine → queue]               encode thread
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::convert::FormatConverter;
use super::encoder::{CompressOutcome, CompressionEngine, EncoderFactory};
use super::frame::{CompressedUnit, ConvertedFrame, RawFrame};
use super::pacer::FrameRateGovernor;
use super::queue::{OutputQueue, PushOutcome};
use super::source::{FrameSource, SourceEvent};
use crate::config::{PipelineConfig, ThreadingMode};
use crate::error::{AppError, Result};
use crate::stream::UnitCallback;
use crate::utils::LogThrottler;

/// How long the encode thread waits for a frame before re-checking the stop flag
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Device identity, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineIdentity {
    device_name: String,
    alias: String,
}

impl PipelineIdentity {
    pub fn new(device_name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            alias: alias.into(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started, or stopped
    Stopped,
    /// Worker thread(s) running
    Running,
    /// Source reported end of stream
    Finished,
    /// A fatal error ended the pipeline
    Failed(String),
}

/// Pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_converted: u64,
    /// Frames discarded by the governor or overwritten before encoding
    pub frames_skipped: u64,
    /// Units produced by the compression engine
    pub frames_encoded: u64,
    pub units_queued: u64,
    pub units_dropped: u64,
    pub conversion_errors: u64,
    pub encode_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_converted: AtomicU64,
    frames_skipped: AtomicU64,
    frames_encoded: AtomicU64,
    units_queued: AtomicU64,
    units_dropped: AtomicU64,
    conversion_errors: AtomicU64,
    encode_errors: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_converted: self.frames_converted.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            units_queued: self.units_queued.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the controller and its workers
struct Shared {
    alias: String,
    queue: Arc<OutputQueue>,
    on_unit: RwLock<Option<UnitCallback>>,
    stop_flag: AtomicBool,
    state: watch::Sender<PipelineState>,
    counters: Counters,
    /// Source is parked here while no worker owns it
    source: Mutex<Option<Box<dyn FrameSource>>>,
    throttler: LogThrottler,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    fn emit(&self, unit: CompressedUnit) {
        Counters::inc(&self.counters.frames_encoded);
        let sequence = unit.sequence;
        let outcome = self.queue.push(unit);
        if outcome.is_queued() {
            Counters::inc(&self.counters.units_queued);
            trace!("Queued unit {}", sequence);
            let callback = self.on_unit.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        if outcome != PushOutcome::Queued {
            Counters::inc(&self.counters.units_dropped);
        }
    }

    fn throttled_warn(&self, key: &str, message: std::fmt::Arguments<'_>) {
        if let Some(suppressed) = self.throttler.check(key) {
            if suppressed > 0 {
                warn!("[{}] {} (suppressed {} repeats)", self.alias, message, suppressed);
            } else {
                warn!("[{}] {}", self.alias, message);
            }
        }
    }

    /// Record how a worker ended; the first terminal state wins
    fn finish(&self, result: Result<Exit>) {
        match result {
            Ok(Exit::Stopped) => {}
            Ok(Exit::EndOfStream) => {
                info!("[{}] Pipeline finished: end of stream", self.alias);
                self.state.send_if_modified(|state| {
                    if *state == PipelineState::Running {
                        *state = PipelineState::Finished;
                        true
                    } else {
                        false
                    }
                });
            }
            Err(e) => {
                error!("[{}] Pipeline failed: {}", self.alias, e);
                self.stop_flag.store(true, Ordering::SeqCst);
                self.state.send_if_modified(|state| {
                    if matches!(state, PipelineState::Running) {
                        *state = PipelineState::Failed(e.to_string());
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }

    /// Close the source and park it for the next start
    fn park_source(&self, mut source: Box<dyn FrameSource>) {
        source.close();
        *self.source.lock() = Some(source);
    }
}

/// Why a worker loop returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    EndOfStream,
}

/// Convert + compress stage, owned by exactly one worker thread
struct EncodeStage {
    converter: FormatConverter,
    governor: FrameRateGovernor,
    engine: CompressionEngine,
    /// The single reused conversion buffer
    converted: ConvertedFrame,
}

impl EncodeStage {
    /// Run one forwarded frame through conversion and compression
    ///
    /// Only fatal errors are returned; per-frame failures are counted.
    fn process(&mut self, shared: &Shared, raw: &RawFrame) -> Result<()> {
        if let Err(e) = self.converter.convert(raw, &mut self.converted) {
            Counters::inc(&shared.counters.conversion_errors);
            shared.throttled_warn(
                "convert",
                format_args!("Dropping frame {}: conversion failed: {}", raw.sequence, e),
            );
            return Ok(());
        }
        Counters::inc(&shared.counters.frames_converted);

        match self.engine.compress(&self.converted) {
            Ok(CompressOutcome::Unit(unit)) => shared.emit(unit),
            Ok(CompressOutcome::NeedsMoreInput) => {}
            Err(e) if !e.is_fatal() => {
                Counters::inc(&shared.counters.encode_errors);
                shared.throttled_warn(
                    "encode",
                    format_args!("Dropping frame {}: {}", raw.sequence, e),
                );
            }
            Err(e) => return Err(e),
        }
        while let Some(unit) = self.engine.pop_pending() {
            shared.emit(unit);
        }
        Ok(())
    }

    /// Forward the frame if the governor allows it, then pace
    fn offer(&mut self, shared: &Shared, raw: &RawFrame) -> Result<()> {
        if self.governor.decide().is_forward() {
            self.process(shared, raw)?;
            self.governor.pace();
        } else {
            Counters::inc(&shared.counters.frames_skipped);
        }
        Ok(())
    }

    /// Flush held-back units at end of stream
    fn drain(&mut self, shared: &Shared) -> Result<()> {
        for unit in self.engine.finish()? {
            shared.emit(unit);
        }
        Ok(())
    }
}

/// Newest captured frame, handed from the capture thread to the encode thread
#[derive(Default)]
struct LatestFrame {
    slot: Mutex<Slot>,
    ready: Condvar,
}

#[derive(Default)]
struct Slot {
    frame: Option<RawFrame>,
    ended: bool,
}

impl LatestFrame {
    /// Store a frame, returning whether an unconsumed one was overwritten
    fn put(&self, frame: RawFrame) -> bool {
        let replaced = self.slot.lock().frame.replace(frame).is_some();
        self.ready.notify_one();
        replaced
    }

    fn end(&self) {
        self.slot.lock().ended = true;
        self.ready.notify_one();
    }

    /// Wait briefly for the next frame
    fn take(&self, timeout: Duration) -> Take {
        let mut slot = self.slot.lock();
        if slot.frame.is_none() && !slot.ended {
            self.ready.wait_for(&mut slot, timeout);
        }
        match slot.frame.take() {
            Some(frame) => Take::Frame(frame),
            None if slot.ended => Take::Ended,
            None => Take::Empty,
        }
    }
}

enum Take {
    Frame(RawFrame),
    Empty,
    /// Capture has ended and the slot is drained
    Ended,
}

struct Workers {
    handles: Vec<JoinHandle<()>>,
    latest: Option<Arc<LatestFrame>>,
}

impl Workers {
    fn is_alive(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }
}

/// Capture/compress pipeline with a start/stop lifecycle
pub struct PipelineController {
    identity: PipelineIdentity,
    config: PipelineConfig,
    factory: Arc<dyn EncoderFactory>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<PipelineState>,
    workers: Mutex<Option<Workers>>,
}

impl PipelineController {
    /// Create a controller; nothing is opened until `start()`
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        factory: Arc<dyn EncoderFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(OutputQueue::new(
            config.queue.capacity,
            config.queue.drop_policy,
        )?);
        let identity =
            PipelineIdentity::new(config.device.display().to_string(), config.alias.clone());
        let (state_tx, state_rx) = watch::channel(PipelineState::Stopped);

        Ok(Self {
            identity,
            factory,
            shared: Arc::new(Shared {
                alias: config.alias.clone(),
                queue,
                on_unit: RwLock::new(None),
                stop_flag: AtomicBool::new(false),
                state: state_tx,
                counters: Counters::default(),
                source: Mutex::new(Some(source)),
                throttler: LogThrottler::with_secs(5),
            }),
            config,
            state_rx,
            workers: Mutex::new(None),
        })
    }

    /// Register the callback invoked from the producer thread once per queued unit
    pub fn set_on_unit_available(&self, callback: UnitCallback) {
        *self.shared.on_unit.write() = Some(callback);
    }

    pub fn device_name(&self) -> &str {
        self.identity.device_name()
    }

    pub fn alias(&self) -> &str {
        self.identity.alias()
    }

    pub fn output_queue(&self) -> Arc<OutputQueue> {
        self.shared.queue.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state_rx.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().as_ref().is_some_and(Workers::is_alive)
    }

    /// Open the source and spawn the worker thread(s)
    ///
    /// Calling it while already running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if let Some(running) = workers.as_ref() {
            if running.is_alive() {
                warn!("[{}] Pipeline already running", self.alias());
                return Ok(());
            }
        }
        // Reap workers that ended on their own (end of stream / failure)
        if let Some(old) = workers.take() {
            join_all(old.handles, self.alias());
        }

        let mut source = self.shared.source.lock().take().ok_or_else(|| {
            AppError::VideoError(format!("[{}] Frame source unavailable", self.alias()))
        })?;

        let stage = match self.prepare(&mut *source) {
            Ok(stage) => stage,
            Err(e) => {
                error!("[{}] Failed to start pipeline: {}", self.alias(), e);
                self.shared.park_source(source);
                self.shared.state.send_replace(PipelineState::Failed(e.to_string()));
                return Err(e);
            }
        };

        self.shared.stop_flag.store(false, Ordering::SeqCst);
        self.shared.state.send_replace(PipelineState::Running);

        let spawned = match self.config.threading {
            ThreadingMode::Single => self.spawn_single(source, stage),
            ThreadingMode::Decoupled => self.spawn_decoupled(source, stage),
        };
        match spawned {
            Ok(running) => {
                info!(
                    "[{}] Pipeline started on {} ({:?} threading)",
                    self.alias(),
                    self.device_name(),
                    self.config.threading
                );
                *workers = Some(running);
                Ok(())
            }
            Err(e) => {
                self.shared.state.send_replace(PipelineState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Open the source and build every stage; runs on the caller's thread
    fn prepare(&self, source: &mut dyn FrameSource) -> Result<EncodeStage> {
        let actual = source.open(&self.config.capture_request())?;

        let output_fps = self.config.output_fps(&actual);
        let governor = FrameRateGovernor::new(actual.fps, output_fps, self.config.rate.strategy)?;

        let output_resolution = self.config.output_resolution(&actual);
        let input_format = self.config.encoder.input_format;
        let converter = FormatConverter::new(
            actual.format,
            actual.resolution,
            input_format,
            output_resolution,
        )?;

        let encoder = self.factory.create(&self.config.encoder_config(&actual))?;
        if encoder.input_format() != input_format {
            return Err(AppError::Config(format!(
                "Encoder {} expects {}, pipeline produces {}",
                encoder.name(),
                encoder.input_format(),
                input_format
            )));
        }

        info!(
            "[{}] {} {} @ {} fps -> {} {} @ {} fps via {}",
            self.alias(),
            actual.resolution,
            actual.format,
            actual.fps,
            output_resolution,
            input_format,
            output_fps,
            encoder.name()
        );

        Ok(EncodeStage {
            converter,
            governor,
            engine: CompressionEngine::new(encoder),
            converted: ConvertedFrame::new(output_resolution, input_format),
        })
    }

    fn spawn_single(&self, mut source: Box<dyn FrameSource>, mut stage: EncodeStage) -> Result<Workers> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("livecam-{}", self.alias()))
            .spawn(move || {
                let result = run_single(&shared, &mut *source, &mut stage);
                shared.park_source(source);
                shared.finish(result);
            })?;
        Ok(Workers {
            handles: vec![handle],
            latest: None,
        })
    }

    fn spawn_decoupled(
        &self,
        mut source: Box<dyn FrameSource>,
        mut stage: EncodeStage,
    ) -> Result<Workers> {
        let latest = Arc::new(LatestFrame::default());

        let capture = {
            let shared = self.shared.clone();
            let latest = latest.clone();
            thread::Builder::new()
                .name(format!("livecam-{}-cap", self.alias()))
                .spawn(move || {
                    let result = run_capture(&shared, &mut *source, &latest);
                    latest.end();
                    shared.park_source(source);
                    // End of stream is reported by the encode thread once drained
                    if let Err(e) = result {
                        shared.finish(Err(e));
                    }
                })?
        };

        let encode = {
            let shared = self.shared.clone();
            let latest = latest.clone();
            thread::Builder::new()
                .name(format!("livecam-{}-enc", self.alias()))
                .spawn(move || {
                    let result = run_encode(&shared, &latest, &mut stage);
                    shared.finish(result);
                })
        };

        match encode {
            Ok(encode) => Ok(Workers {
                handles: vec![capture, encode],
                latest: Some(latest),
            }),
            Err(e) => {
                self.shared.stop_flag.store(true, Ordering::SeqCst);
                join_all(vec![capture], self.alias());
                Err(e.into())
            }
        }
    }

    /// Signal the workers, wait for them and release the device
    ///
    /// The unit callback stays registered for the next `start()`. Safe to
    /// call repeatedly. A source stuck in a read with no timeout delays this
    /// until the read returns.
    pub fn stop(&self) {
        let Some(running) = self.workers.lock().take() else {
            debug!("[{}] Pipeline not running", self.alias());
            return;
        };

        self.shared.stop_flag.store(true, Ordering::SeqCst);
        if let Some(latest) = &running.latest {
            latest.ready.notify_all();
        }
        join_all(running.handles, self.alias());

        self.shared.state.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::Stopped;
                true
            } else {
                false
            }
        });
        info!("[{}] Pipeline stopped", self.alias());
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
        *self.shared.on_unit.write() = None;
    }
}

fn join_all(handles: Vec<JoinHandle<()>>, alias: &str) {
    for handle in handles {
        if handle.join().is_err() {
            error!("[{}] Pipeline worker panicked", alias);
        }
    }
}

/// Single-thread loop: capture, govern, convert, compress
fn run_single(shared: &Shared, source: &mut dyn FrameSource, stage: &mut EncodeStage) -> Result<Exit> {
    while !shared.stopping() {
        match source.next_frame()? {
            SourceEvent::Frame(raw) => {
                Counters::inc(&shared.counters.frames_captured);
                stage.offer(shared, &raw)?;
            }
            SourceEvent::EndOfStream => {
                stage.drain(shared)?;
                return Ok(Exit::EndOfStream);
            }
        }
    }
    Ok(Exit::Stopped)
}

/// Decoupled capture loop: keep only the newest frame
fn run_capture(shared: &Shared, source: &mut dyn FrameSource, latest: &LatestFrame) -> Result<Exit> {
    while !shared.stopping() {
        match source.next_frame()? {
            SourceEvent::Frame(raw) => {
                Counters::inc(&shared.counters.frames_captured);
                if latest.put(raw) {
                    // Encoder had not picked up the previous frame
                    Counters::inc(&shared.counters.frames_skipped);
                }
            }
            SourceEvent::EndOfStream => return Ok(Exit::EndOfStream),
        }
    }
    Ok(Exit::Stopped)
}

/// Decoupled encode loop: take the newest frame at the governed rate
fn run_encode(shared: &Shared, latest: &LatestFrame, stage: &mut EncodeStage) -> Result<Exit> {
    while !shared.stopping() {
        match latest.take(FRAME_WAIT) {
            Take::Frame(raw) => stage.offer(shared, &raw)?,
            Take::Empty => {}
            Take::Ended => {
                stage.drain(shared)?;
                return Ok(Exit::EndOfStream);
            }
        }
    }
    Ok(Exit::Stopped)
}
