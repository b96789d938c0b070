//! Progress reporting and cancellation service
//!
//! This module separates progress reporting concerns from the tiling logic,
//! allowing different frontends to implement their own progress handling.

use crate::types::ProcessingTimings;
use instant::Instant;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Progress stages of a tiled processing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Computing base and extended extents
    Planning,
    /// Rasterizing the area mask
    MaskBuilding,
    /// Sampling and running inference tile by tile
    Tiling,
    /// Masking and cropping the assembled output
    Assembly,
    /// Processing completed
    Completed,
}

impl ProcessingStage {
    /// Get a human-readable description of the processing stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Planning => "Computing processing extents",
            ProcessingStage::MaskBuilding => "Building area mask",
            ProcessingStage::Tiling => "Processing tiles",
            ProcessingStage::Assembly => "Assembling result",
            ProcessingStage::Completed => "Processing completed",
        }
    }
}

/// Observer notified about progress and polled for cancellation
///
/// Progress is reported on a 0-100 scale after every tile. Implementations
/// must be cheap: they are called once per tile from the processing thread.
pub trait ProgressObserver: Send + Sync {
    /// Report tile progress in percent
    fn report_progress(&self, percent: f64);

    /// Whether the host asked the run to stop
    fn is_cancel_requested(&self) -> bool {
        false
    }

    /// Report entering a new stage
    fn report_stage(&self, stage: ProcessingStage) {
        drop(stage);
    }

    /// Report processing completion with final timings
    fn report_completion(&self, timings: &ProcessingTimings) {
        drop(timings);
    }

    /// Report an error during processing
    fn report_error(&self, stage: ProcessingStage, error: &str) {
        drop((stage, error));
    }
}

/// No-op observer that discards all updates and never cancels
pub struct NoOpProgressObserver;

impl ProgressObserver for NoOpProgressObserver {
    fn report_progress(&self, _percent: f64) {
        // Intentionally empty - discards progress updates
    }
}

/// Observer that logs progress through the `log` facade
pub struct ConsoleProgressObserver {
    verbose: bool,
    /// Last whole percent logged, -1 before the first update
    last_percent: AtomicI32,
}

impl ConsoleProgressObserver {
    /// Create a new console observer
    ///
    /// # Arguments
    /// * `verbose` - Whether to log every whole percent and detailed timings
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_percent: AtomicI32::new(-1),
        }
    }
}

impl ProgressObserver for ConsoleProgressObserver {
    fn report_progress(&self, percent: f64) {
        let whole = percent.floor() as i32;
        let step = if self.verbose { 1 } else { 10 };
        let last = self.last_percent.load(Ordering::Relaxed);
        if last < 0 || whole / step > last / step {
            self.last_percent.store(whole, Ordering::Relaxed);
            log::info!("[{:>3}%] {}", whole, ProcessingStage::Tiling.description());
        }
    }

    fn report_stage(&self, stage: ProcessingStage) {
        log::info!("{}", stage.description());
    }

    fn report_completion(&self, timings: &ProcessingTimings) {
        log::info!("✅ Tiled processing completed in {}ms", timings.total_ms);

        if self.verbose {
            log::info!("  📊 Detailed timings:");
            log::info!("    • Planning: {}ms", timings.planning_ms);
            log::info!("    • Mask: {}ms", timings.mask_ms);
            log::info!("    • Sampling: {}ms", timings.sampling_ms);
            log::info!("    • Inference: {}ms", timings.inference_ms);
            log::info!("    • Assembly: {}ms", timings.assembly_ms);
        }
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        log::error!("❌ Error during {}: {}", stage.description(), error);
    }
}

/// Shared cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next tile boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Progress tracker that combines an observer with a cancellation token
#[derive(Clone)]
pub struct ProgressTracker {
    observer: Arc<dyn ProgressObserver>,
    token: CancellationToken,
    stage: Arc<Mutex<ProcessingStage>>,
    start_time: Instant,
}

impl ProgressTracker {
    /// Create a new tracker with the specified observer
    #[must_use]
    pub fn new(observer: Arc<dyn ProgressObserver>, token: CancellationToken) -> Self {
        Self {
            observer,
            token,
            stage: Arc::new(Mutex::new(ProcessingStage::Planning)),
            start_time: Instant::now(),
        }
    }

    /// Create a tracker with a no-op observer (for testing/disabled progress)
    #[must_use]
    pub fn no_op() -> Self {
        Self::new(Arc::new(NoOpProgressObserver), CancellationToken::new())
    }

    /// Create a tracker with a console observer
    #[must_use]
    pub fn console(verbose: bool) -> Self {
        Self::new(
            Arc::new(ConsoleProgressObserver::new(verbose)),
            CancellationToken::new(),
        )
    }

    /// Report tile progress as `tile_no / total * 100`
    pub fn report_tile(&self, tile_no: usize, total_tiles: usize) {
        let percent = if total_tiles == 0 {
            100.0
        } else {
            tile_no as f64 / total_tiles as f64 * 100.0
        };
        self.observer.report_progress(percent);
    }

    pub fn report_stage(&self, stage: ProcessingStage) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
        self.observer.report_stage(stage);
    }

    /// Stage most recently entered
    #[must_use]
    pub fn current_stage(&self) -> ProcessingStage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report_completion(&self, timings: &ProcessingTimings) {
        self.observer.report_completion(timings);
    }

    pub fn report_error(&self, stage: ProcessingStage, error: &str) {
        self.observer.report_error(stage, error);
    }

    /// Cancellation requested through the token or the observer
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.observer.is_cancel_requested()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Get the elapsed time since tracking started
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("stage", &self.current_stage())
            .field("cancelled", &self.is_cancelled())
            .field("elapsed_ms", &self.elapsed_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        percents: Mutex<Vec<f64>>,
        stop: AtomicBool,
    }

    impl ProgressObserver for Recording {
        fn report_progress(&self, percent: f64) {
            self.percents.lock().unwrap().push(percent);
        }

        fn is_cancel_requested(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_tracker_remembers_current_stage() {
        let tracker = ProgressTracker::no_op();
        assert_eq!(tracker.current_stage(), ProcessingStage::Planning);
        let shared = tracker.clone();
        tracker.report_stage(ProcessingStage::Assembly);
        assert_eq!(shared.current_stage(), ProcessingStage::Assembly);
    }

    #[test]
    fn test_stage_descriptions() {
        assert_eq!(ProcessingStage::Tiling.description(), "Processing tiles");
        assert_eq!(
            ProcessingStage::Completed.description(),
            "Processing completed"
        );
    }

    #[test]
    fn test_tile_progress_scale() {
        let observer = Arc::new(Recording::default());
        let tracker = ProgressTracker::new(observer.clone(), CancellationToken::new());
        tracker.report_tile(0, 4);
        tracker.report_tile(2, 4);
        tracker.report_tile(3, 4);
        assert_eq!(*observer.percents.lock().unwrap(), vec![0.0, 50.0, 75.0]);
    }

    #[test]
    fn test_cancellation_sources() {
        let observer = Arc::new(Recording::default());
        let token = CancellationToken::new();
        let tracker = ProgressTracker::new(observer.clone(), token.clone());
        assert!(!tracker.is_cancelled());

        observer.stop.store(true, Ordering::SeqCst);
        assert!(tracker.is_cancelled());
        observer.stop.store(false, Ordering::SeqCst);

        token.cancel();
        assert!(tracker.is_cancelled());
        assert!(tracker.token().is_cancelled());
    }

    #[test]
    fn test_no_op_and_console_observers() {
        let tracker = ProgressTracker::no_op();
        tracker.report_tile(1, 2);
        tracker.report_stage(ProcessingStage::Planning);
        assert!(!tracker.is_cancelled());

        let console = ConsoleProgressObserver::new(false);
        console.report_progress(5.0);
        console.report_progress(15.0);
        assert_eq!(console.last_percent.load(Ordering::Relaxed), 15);
        console.report_progress(17.0);
        assert_eq!(console.last_percent.load(Ordering::Relaxed), 15);
        console.report_completion(&ProcessingTimings::default());
    }
}
