//! # edgequake-audiobook
//!
//! A resumable, checkpointed, concurrent engine that turns a document's
//! chapters into per-sentence audio.
//!
//! ## Why this crate?
//!
//! Narrating a long document is slow and fails in pieces: one LLM call times
//! out, one speech request returns HTTP 500, the process is killed an hour in.
//! This crate records every finished stage of every chapter in a checkpoint,
//! so re-running against the same source and output directory picks up where
//! it stopped, and a failure in one chapter never stops the others.
//!
//! ## Pipeline Overview
//!
//! ```text
//! units (structured externally)
//!  │
//!  ├─ 0. Record     persist units, mark `structured`
//!  ├─ 0b. Summary   optional executive summary inserted at index 0 (Reindexer)
//!  ├─ 1. Normalize  LLM → regex fallback chain        ┐ concurrent across
//!  ├─ 2. Segment    sentence packing into sub-units   ┘ units (default 2)
//!  └─ 3. Synthesize one audio file per sub-unit        single-flight engine
//! ```
//!
//! Every stage is checkpointed. Artifacts follow a fixed naming convention
//! (see [`layout`]) so the assembly step can address them without asking the
//! engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_audiobook::{EngineRegistry, Pipeline, PipelineConfig, Section, Unit};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().output_dir("out").build()?;
//!     let pipeline = Pipeline::open("paper.pdf", config)?;
//!
//!     let mut units = match pipeline.restore_units()? {
//!         Some(units) => units,
//!         None => {
//!             // Produced by your own structuring step.
//!             let units = vec![Unit::new(0, "Introduction", vec![Section::body("…")])];
//!             pipeline.record_units(&units, "toc")?;
//!             units
//!         }
//!     };
//!     pipeline.insert_summary(&mut units).await?;
//!
//!     let stages = pipeline.build_stages(&EngineRegistry::with_builtins())?;
//!     let report = pipeline.run(units, stages).await?;
//!     eprintln!("{}/{} units ready", report.succeeded(), report.results.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! Two global exclusive sections exist: the checkpoint document (every
//! `mark` rewrites and syncs it under one lock) and the speech engine
//! ([`SingleFlight`]). Everything else a worker touches is owned by that
//! worker or keyed by a unit index no other worker holds.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod reindex;
pub mod run;
pub mod scheduler;
pub mod summary;
pub mod unit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use checkpoint::{fingerprint_source, Checkpoint, CheckpointStore};
pub use config::{NormalizeConfig, PipelineConfig, PipelineConfigBuilder, SynthesisConfig};
pub use engine::{EngineRegistry, SharedEngine, SingleFlight, SpeechEngine};
pub use error::{AudiobookError, SynthesisError, UnitError};
pub use layout::ArtifactLayout;
pub use output::{NormalizationSource, PipelineReport, UnitArtifacts, UnitResult, UsageTotals};
pub use pipeline::normalize::{FallbackChain, NormalizeOutcome, Normalizer, RegexNormalizer};
pub use pipeline::segment::{SentenceSegmenter, Segmenter};
pub use pipeline::synthesize::{ChunkSynthesizer, SynthesisManifest};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use reindex::{InsertedUnit, Reindexer};
pub use run::Pipeline;
pub use scheduler::{PipelineScheduler, Stages};
pub use unit::{Section, SectionKind, SegmentedUnit, Stage, StageStatus, SubUnit, Unit};
