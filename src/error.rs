//! Error types for the edgequake-audiobook library.
//!
//! Three error types reflect three failure scopes:
//!
//! * [`AudiobookError`] — **Fatal**: the run cannot continue safely
//!   (checkpoint cannot be persisted, a reindex shift failed half-way, the
//!   configuration is invalid). Returned as `Err(AudiobookError)` from the
//!   scheduler and the [`crate::run::Pipeline`] facade.
//!
//! * [`UnitError`] — **Non-fatal**: one unit failed a stage but every other
//!   unit is unaffected. Stored inside [`crate::output::UnitResult`] so
//!   callers can inspect partial success.
//!
//! * [`SynthesisError`] — a single sub-unit synthesis call failed. Collected
//!   per sub-unit; escalates to [`UnitError::AllSubUnitsFailed`] only when
//!   every sub-unit of a unit failed.

use crate::unit::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-audiobook library.
///
/// Unit-level failures use [`UnitError`] and are stored in
/// [`crate::output::UnitResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum AudiobookError {
    // ── Source errors ─────────────────────────────────────────────────────
    /// The source document could not be read for fingerprinting.
    #[error("Cannot read source '{path}' for fingerprinting: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// The checkpoint document exists but could not be read.
    #[error("Failed to read checkpoint '{path}': {source}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint document could not be written to durable storage.
    ///
    /// Never swallowed: losing checkpoint state silently breaks resume.
    #[error("Failed to persist checkpoint '{path}': {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint could not be serialised.
    #[error("Failed to serialise checkpoint: {0}")]
    CheckpointEncode(#[from] serde_json::Error),

    // ── Structured unit errors ────────────────────────────────────────────
    /// A structured unit document could not be written or reloaded.
    #[error("Structured unit {index} at '{path}': {detail}")]
    UnitStore {
        index: usize,
        path: PathBuf,
        detail: String,
    },

    // ── Reindex errors ────────────────────────────────────────────────────
    /// Renaming or rewriting an artifact failed during a front insertion.
    ///
    /// The shift is not transactional: artifacts and checkpoint keys above
    /// `index` may already be renumbered. Inspect the output directory
    /// before re-running.
    #[error("Reindex failed at unit {index} ('{path}'): {detail}\nThe output directory may be in a mixed-index state; inspect it before re-running.")]
    Reindex {
        index: usize,
        path: PathBuf,
        detail: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The output directory tree could not be created.
    #[error("Cannot create output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The requested synthesis backend is not registered.
    #[error("Unknown synthesis backend '{name}'. Registered: {available}")]
    UnknownEngine { name: String, available: String },

    /// The LLM provider for normalization or summaries is not initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// A synthesis backend could not be constructed.
    #[error("Synthesis backend '{name}' is not configured: {hint}")]
    EngineNotConfigured { name: String, hint: String },

    // ── Worker errors ─────────────────────────────────────────────────────
    /// A scheduler worker task could not be joined.
    #[error("Worker task failed: {0}")]
    WorkerJoin(String),
}

/// A non-fatal error for a single unit.
///
/// Stored alongside [`crate::output::UnitResult`] when a unit fails.
/// The run continues for every other unit.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum UnitError {
    /// Both the primary normalizer and its fallback failed.
    #[error("Unit {index}: normalization failed (primary: {primary}; fallback: {fallback})")]
    NormalizationFailed {
        index: usize,
        primary: String,
        fallback: String,
    },

    /// The segmentation collaborator rejected the text.
    #[error("Unit {index}: segmentation failed: {detail}")]
    SegmentationFailed { index: usize, detail: String },

    /// Reading or writing a stage artifact failed.
    #[error("Unit {index}: {stage} artifact I/O failed at '{path}': {detail}")]
    ArtifactIo {
        index: usize,
        stage: Stage,
        path: PathBuf,
        detail: String,
    },

    /// Every sub-unit synthesis call failed.
    #[error("Unit {index}: all {failed} sub-units failed synthesis. First error: {first_error}")]
    AllSubUnitsFailed {
        index: usize,
        failed: usize,
        first_error: String,
    },

    /// Processing the unit panicked; the worker recovered.
    #[error("Unit {index}: processing panicked: {detail}")]
    Panicked { index: usize, detail: String },
}

impl UnitError {
    /// Index of the unit this error belongs to.
    pub fn index(&self) -> usize {
        match self {
            UnitError::NormalizationFailed { index, .. }
            | UnitError::SegmentationFailed { index, .. }
            | UnitError::ArtifactIo { index, .. }
            | UnitError::AllSubUnitsFailed { index, .. }
            | UnitError::Panicked { index, .. } => *index,
        }
    }
}

/// Failure of one sub-unit synthesis call.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum SynthesisError {
    /// The backend request could not be sent or timed out.
    #[error("request to '{backend}' failed: {detail}")]
    Request { backend: String, detail: String },

    /// The backend answered with a non-success status.
    #[error("'{backend}' returned HTTP {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    /// The synthesized audio could not be written.
    #[error("failed to write '{path}': {detail}")]
    Write { path: PathBuf, detail: String },

    /// Any other engine-specific failure.
    #[error("{0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reindex_display_mentions_mixed_state() {
        let e = AudiobookError::Reindex {
            index: 4,
            path: PathBuf::from("out/cleaned/chapter_004.txt"),
            detail: "permission denied".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("unit 4"), "got: {msg}");
        assert!(msg.contains("mixed-index"), "got: {msg}");
    }

    #[test]
    fn all_sub_units_failed_display() {
        let e = UnitError::AllSubUnitsFailed {
            index: 2,
            failed: 7,
            first_error: "HTTP 500".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("all 7"), "got: {msg}");
        assert!(msg.contains("HTTP 500"), "got: {msg}");
        assert_eq!(e.index(), 2);
    }

    #[test]
    fn artifact_io_display_names_stage() {
        let e = UnitError::ArtifactIo {
            index: 1,
            stage: Stage::Segmented,
            path: PathBuf::from("chunks/chapter_001.json"),
            detail: "disk full".into(),
        };
        assert!(e.to_string().contains("segmented"));
    }

    #[test]
    fn unit_error_serialises() {
        let e = UnitError::Panicked {
            index: 9,
            detail: "boom".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: UnitError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index(), 9);
    }
}
