//! Progress-callback trait for per-unit pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the scheduler moves units through their stages.
//!
//! Callbacks run on the worker that produced the event, so with
//! `unit_concurrency > 1` they are called concurrently. Implementations must
//! protect shared mutable state (`Mutex`, atomics).
//!
//! # Example
//!
//! ```rust
//! use edgequake_audiobook::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl PipelineProgressCallback for Counter {
//!     fn on_unit_complete(&self, _index: usize, _title: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::unit::Stage;
use std::sync::Arc;

/// Called by the scheduler as it processes each unit.
///
/// All methods have default no-op implementations.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any worker starts.
    fn on_run_start(&self, total_units: usize) {
        let _ = total_units;
    }

    /// Called before a stage runs (or is skipped as already done) for a unit.
    fn on_stage_start(&self, index: usize, stage: Stage) {
        let _ = (index, stage);
    }

    /// Called when a unit finished every stage.
    fn on_unit_complete(&self, index: usize, title: &str) {
        let _ = (index, title);
    }

    /// Called when a unit failed; the run continues.
    fn on_unit_error(&self, index: usize, error: &str) {
        let _ = (index, error);
    }

    /// Called once after all workers drained.
    fn on_run_complete(&self, total_units: usize, succeeded: usize) {
        let _ = (total_units, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
