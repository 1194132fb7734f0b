//! Bounded-concurrency driver for the per-unit stage sequence.
//!
//! `unit_concurrency` worker tasks pull units from one shared queue. Each
//! worker runs a unit through normalize → segment → synthesize before it takes
//! the next one. Stages already marked in the checkpoint are skipped and their
//! artifact locations reconstructed from the [`ArtifactLayout`].
//!
//! Normalization and segmentation run concurrently across workers. Synthesis
//! goes through the engine's [`crate::engine::SingleFlight`] guard, so one
//! unit's LLM call overlaps another unit's synthesis without two synthesis
//! calls ever reaching the engine at once.
//!
//! ## Failure scopes
//!
//! * Anything that fails for one unit (including a panic) becomes a
//!   [`UnitResult`] carrying a [`UnitError`]; other workers keep going.
//! * A checkpoint persistence failure aborts every worker and is returned as
//!   `Err`, because continuing would produce work the next run cannot see.

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::engine::SharedEngine;
use crate::error::{AudiobookError, UnitError};
use crate::layout::ArtifactLayout;
use crate::output::{NormalizationSource, PipelineReport, UnitResult, UsageTotals};
use crate::pipeline::normalize::{FallbackChain, NormalizeOutcome, Normalized};
use crate::pipeline::segment::Segmenter;
use crate::pipeline::synthesize::{ChunkSynthesizer, SynthesisManifest};
use crate::progress::ProgressCallback;
use crate::unit::{SegmentedUnit, Stage, Unit};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The collaborators each unit is driven through.
#[derive(Clone)]
pub struct Stages {
    pub normalizer: FallbackChain,
    pub segmenter: Arc<dyn Segmenter>,
    pub engine: SharedEngine,
    /// Sub-unit fan-out used while the engine is held.
    pub synthesizer: ChunkSynthesizer,
}

impl std::fmt::Debug for Stages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stages")
            .field("normalizer", &self.normalizer)
            .field("segmenter", &self.segmenter.name())
            .field("engine", &self.engine)
            .field("synthesis_workers", &self.synthesizer.workers())
            .finish()
    }
}

/// Drives units through the stage sequence.
#[derive(Clone)]
pub struct PipelineScheduler {
    ctx: Arc<Context>,
}

struct Context {
    checkpoint: Arc<CheckpointStore>,
    layout: ArtifactLayout,
    stages: Stages,
    unit_concurrency: usize,
    skip_references: bool,
    progress: Option<ProgressCallback>,
}

/// Why a unit stopped: its own failure, or one that ends the run.
enum StageFailure {
    Unit(UnitError),
    Fatal(AudiobookError),
}

impl From<UnitError> for StageFailure {
    fn from(e: UnitError) -> Self {
        StageFailure::Unit(e)
    }
}

impl From<AudiobookError> for StageFailure {
    fn from(e: AudiobookError) -> Self {
        StageFailure::Fatal(e)
    }
}

#[derive(Default)]
struct WorkerOutput {
    results: Vec<UnitResult>,
    usage: UsageTotals,
}

type UnitQueue = Arc<Mutex<VecDeque<Unit>>>;

impl PipelineScheduler {
    pub fn new(
        checkpoint: Arc<CheckpointStore>,
        layout: ArtifactLayout,
        stages: Stages,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                checkpoint,
                layout,
                stages,
                unit_concurrency: config.unit_concurrency.max(1),
                skip_references: config.skip_references,
                progress: config.progress_callback.clone(),
            }),
        }
    }

    /// Process every unit to completion or per-unit failure.
    ///
    /// Results are sorted by unit index, not completion order. Returns `Err`
    /// only for fatal failures (checkpoint persistence, worker join).
    pub async fn run(&self, units: Vec<Unit>) -> Result<PipelineReport, AudiobookError> {
        let start = Instant::now();
        let total = units.len();
        let workers = self.ctx.unit_concurrency.min(total.max(1));
        info!("Scheduling {} units on {} workers", total, workers);
        if let Some(ref cb) = self.ctx.progress {
            cb.on_run_start(total);
        }

        let queue: UnitQueue = Arc::new(Mutex::new(VecDeque::from(units)));
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&queue);
            set.spawn(async move { ctx.worker(worker_id, queue).await });
        }

        let mut report = PipelineReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(output)) => {
                    report.results.extend(output.results);
                    report.usage.merge(&output.usage);
                }
                Ok(Err(fatal)) => {
                    error!("Aborting run: {}", fatal);
                    set.abort_all();
                    return Err(fatal);
                }
                Err(join_err) => {
                    set.abort_all();
                    return Err(AudiobookError::WorkerJoin(join_err.to_string()));
                }
            }
        }

        report.results.sort_by_key(|r| r.index);
        report.duration_ms = start.elapsed().as_millis() as u64;
        let succeeded = report.succeeded();
        info!(
            "Run complete: {}/{} units succeeded in {}ms ({} LLM calls, {} fallbacks)",
            succeeded, total, report.duration_ms, report.usage.llm_calls, report.usage.fallbacks
        );
        if let Some(ref cb) = self.ctx.progress {
            cb.on_run_complete(total, succeeded);
        }
        Ok(report)
    }
}

impl Context {
    async fn worker(&self, worker_id: usize, queue: UnitQueue) -> Result<WorkerOutput, AudiobookError> {
        let mut output = WorkerOutput::default();
        loop {
            let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(unit) = next else { break };

            debug!("Worker {} took unit {}", worker_id, unit.index);
            let unit_start = Instant::now();
            let mut result = UnitResult::new(unit.index, unit.title.clone());

            let outcome = AssertUnwindSafe(self.process_unit(&unit, &mut result, &mut output.usage))
                .catch_unwind()
                .await;
            result.duration_ms = unit_start.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(StageFailure::Unit(e))) => Some(e),
                Ok(Err(StageFailure::Fatal(e))) => return Err(e),
                Err(payload) => Some(UnitError::Panicked {
                    index: unit.index,
                    detail: panic_message(payload.as_ref()),
                }),
            };

            match failure {
                None => {
                    info!("Unit {} ready: {}", unit.index, unit.title);
                    if let Some(ref cb) = self.progress {
                        cb.on_unit_complete(unit.index, &unit.title);
                    }
                }
                Some(e) => {
                    warn!("Unit {} failed: {}", unit.index, e);
                    if let Some(ref cb) = self.progress {
                        cb.on_unit_error(unit.index, &e.to_string());
                    }
                    result.error = Some(e);
                }
            }
            output.results.push(result);
        }
        Ok(output)
    }

    async fn process_unit(
        &self,
        unit: &Unit,
        result: &mut UnitResult,
        usage: &mut UsageTotals,
    ) -> Result<(), StageFailure> {
        let index = unit.index;
        if self.checkpoint.is_done(index, Stage::Structured) {
            result.artifacts.structured = Some(self.layout.structured_json(index));
        }

        // ── Normalize ──────────────────────────────────────────────────────
        self.stage_start(index, Stage::Normalized);
        let text_path = self.layout.normalized_text(index);
        let mut text: Option<String> = None;
        if self.checkpoint.is_done(index, Stage::Normalized) {
            debug!("Unit {}: normalized already done", index);
            result.normalization = Some(NormalizationSource::Resumed);
        } else {
            let (cleaned, source) = self.normalize(unit, usage).await?;
            write_artifact(index, Stage::Normalized, &text_path, cleaned.as_bytes()).await?;
            self.checkpoint.mark_async(index, Stage::Normalized).await?;
            result.normalization = Some(source);
            text = Some(cleaned);
        }
        result.artifacts.normalized = Some(text_path.clone());

        // ── Segment ────────────────────────────────────────────────────────
        self.stage_start(index, Stage::Segmented);
        let segments_path = self.layout.segments(index);
        let mut segmented: Option<SegmentedUnit> = None;
        if self.checkpoint.is_done(index, Stage::Segmented) {
            debug!("Unit {}: segmented already done", index);
        } else {
            let text = match text {
                Some(t) => t,
                None => read_text(index, Stage::Normalized, &text_path).await?,
            };
            let sub_units = self
                .stages
                .segmenter
                .segment(index, &text)
                .map_err(|detail| UnitError::SegmentationFailed { index, detail })?;
            let seg = SegmentedUnit {
                unit_index: index,
                title: unit.title.clone(),
                sub_units,
            };
            write_json(index, Stage::Segmented, &segments_path, &seg).await?;
            self.checkpoint.mark_async(index, Stage::Segmented).await?;
            segmented = Some(seg);
        }
        result.artifacts.segments = Some(segments_path.clone());

        // ── Synthesize (single-flight) ─────────────────────────────────────
        self.stage_start(index, Stage::Finalized);
        let manifest_path = self.layout.synthesis_manifest(index);
        if self.checkpoint.is_done(index, Stage::Finalized) {
            debug!("Unit {}: finalized already done", index);
            let manifest =
                read_json::<SynthesisManifest>(index, Stage::Finalized, &manifest_path).await?;
            result.failed_sub_units = manifest.failed;
        } else {
            let seg = match segmented {
                Some(s) => s,
                None => read_json::<SegmentedUnit>(index, Stage::Segmented, &segments_path).await?,
            };
            let report = {
                let engine = self.stages.engine.acquire().await;
                self.stages
                    .synthesizer
                    .synthesize(&**engine, index, &seg.sub_units, &self.layout)
                    .await?
            };
            result.failed_sub_units = report.failed_indices();

            let manifest = SynthesisManifest::from_report(index, unit.title.clone(), &report);
            write_json(index, Stage::Finalized, &manifest_path, &manifest).await?;
            self.checkpoint.mark_async(index, Stage::Finalized).await?;
        }
        result.artifacts.manifest = Some(manifest_path);
        Ok(())
    }

    async fn normalize(
        &self,
        unit: &Unit,
        usage: &mut UsageTotals,
    ) -> Result<(String, NormalizationSource), UnitError> {
        if self.skip_references && unit.is_references() {
            info!("Unit {}: '{}' is a references section, skipping narration", unit.index, unit.title);
            return Ok((String::new(), NormalizationSource::Skipped));
        }

        match self.stages.normalizer.run(&unit.to_markdown()).await {
            NormalizeOutcome::Primary(n) => {
                record_usage(usage, &n);
                Ok((n.text, NormalizationSource::Primary))
            }
            NormalizeOutcome::Fallback {
                normalized,
                primary_error,
            } => {
                debug!("Unit {}: used fallback after: {}", unit.index, primary_error);
                usage.fallbacks += 1;
                record_usage(usage, &normalized);
                Ok((normalized.text, NormalizationSource::Fallback))
            }
            NormalizeOutcome::Failed {
                primary_error,
                fallback_error,
            } => Err(UnitError::NormalizationFailed {
                index: unit.index,
                primary: primary_error.to_string(),
                fallback: fallback_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "none configured".to_string()),
            }),
        }
    }

    fn stage_start(&self, index: usize, stage: Stage) {
        if let Some(ref cb) = self.progress {
            cb.on_stage_start(index, stage);
        }
    }
}

fn record_usage(usage: &mut UsageTotals, n: &Normalized) {
    usage.llm_calls += u64::from(n.llm_calls);
    usage.input_tokens += n.input_tokens as u64;
    usage.output_tokens += n.output_tokens as u64;
}

fn artifact_io(index: usize, stage: Stage, path: &Path, e: impl std::fmt::Display) -> UnitError {
    UnitError::ArtifactIo {
        index,
        stage,
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

async fn write_artifact(index: usize, stage: Stage, path: &Path, bytes: &[u8]) -> Result<(), UnitError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| artifact_io(index, stage, path, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| artifact_io(index, stage, path, e))
}

async fn write_json<T: serde::Serialize>(
    index: usize,
    stage: Stage,
    path: &Path,
    value: &T,
) -> Result<(), UnitError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| artifact_io(index, stage, path, e))?;
    write_artifact(index, stage, path, &json).await
}

async fn read_text(index: usize, stage: Stage, path: &Path) -> Result<String, UnitError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| artifact_io(index, stage, path, e))
}

async fn read_json<T: DeserializeOwned>(index: usize, stage: Stage, path: &Path) -> Result<T, UnitError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| artifact_io(index, stage, path, e))?;
    serde_json::from_slice(&raw).map_err(|e| artifact_io(index, stage, path, e))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SingleFlight, SpeechEngine};
    use crate::error::SynthesisError;
    use crate::pipeline::normalize::{NormalizeError, Normalizer};
    use crate::pipeline::segment::SentenceSegmenter;
    use crate::unit::{Section, SubUnit};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct WavEngine;

    #[async_trait]
    impl SpeechEngine for WavEngine {
        fn name(&self) -> &str {
            "wav"
        }

        async fn synthesize(&self, text: &str, output: &Path) -> Result<(), SynthesisError> {
            std::fs::write(output, text).map_err(|e| SynthesisError::Engine(e.to_string()))
        }
    }

    struct Refuse;

    #[async_trait]
    impl Normalizer for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn normalize(&self, _text: &str) -> Result<Normalized, NormalizeError> {
            Err(NormalizeError {
                normalizer: "refuse".into(),
                detail: "no".into(),
            })
        }
    }

    struct Explode;

    impl Segmenter for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn segment(&self, _unit_index: usize, _text: &str) -> Result<Vec<SubUnit>, String> {
            panic!("segmenter blew up")
        }
    }

    fn setup(tmp: &TempDir) -> (Arc<CheckpointStore>, ArtifactLayout) {
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, b"%PDF-1.7 test").unwrap();
        let layout = ArtifactLayout::new(tmp.path().join("out"));
        let store = CheckpointStore::load_or_create(layout.checkpoint_path(), &source).unwrap();
        (Arc::new(store), layout)
    }

    fn stages(normalizer: FallbackChain, segmenter: Arc<dyn Segmenter>) -> Stages {
        Stages {
            normalizer,
            segmenter,
            engine: SingleFlight::new(Box::new(WavEngine) as Box<dyn SpeechEngine>),
            synthesizer: ChunkSynthesizer::new(1),
        }
    }

    fn unit(index: usize, title: &str, body: &str) -> Unit {
        Unit::new(index, title, vec![Section::body(body)])
    }

    #[tokio::test]
    async fn references_unit_finalizes_with_no_audio() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let scheduler = PipelineScheduler::new(
            Arc::clone(&store),
            layout.clone(),
            stages(FallbackChain::rules_only(), Arc::new(SentenceSegmenter::default())),
            &PipelineConfig::default(),
        );

        let report = scheduler
            .run(vec![unit(0, "References", "[1] Smith, J. 2020.")])
            .await
            .unwrap();

        let r = report.get(0).unwrap();
        assert!(r.is_success());
        assert_eq!(r.normalization, Some(NormalizationSource::Skipped));
        assert_eq!(std::fs::read_to_string(layout.normalized_text(0)).unwrap(), "");
        let manifest = SynthesisManifest::load(&layout.synthesis_manifest(0)).unwrap();
        assert!(manifest.produced.is_empty());
        assert!(store.is_done(0, Stage::Finalized));
    }

    #[tokio::test]
    async fn normalization_failure_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let scheduler = PipelineScheduler::new(
            Arc::clone(&store),
            layout,
            stages(
                FallbackChain::new(Arc::new(Refuse)),
                Arc::new(SentenceSegmenter::default()),
            ),
            &PipelineConfig::default(),
        );

        let report = scheduler
            .run(vec![unit(0, "A", "Text."), unit(1, "B", "More.")])
            .await
            .unwrap();

        assert_eq!(report.failed_indices(), vec![0, 1]);
        match report.get(1).and_then(|r| r.error.clone()) {
            Some(UnitError::NormalizationFailed { fallback, .. }) => {
                assert_eq!(fallback, "none configured")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!store.is_done(0, Stage::Normalized));
    }

    #[tokio::test]
    async fn panicking_stage_becomes_unit_error() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        let scheduler = PipelineScheduler::new(
            Arc::clone(&store),
            layout,
            stages(FallbackChain::rules_only(), Arc::new(Explode)),
            &PipelineConfig::default(),
        );

        let report = scheduler.run(vec![unit(0, "A", "Text.")]).await.unwrap();

        match &report.results[0].error {
            Some(UnitError::Panicked { detail, .. }) => {
                assert!(detail.contains("blew up"), "got: {detail}")
            }
            other => panic!("unexpected {other:?}"),
        }
        // Normalization completed before the panic and stays recorded.
        assert!(store.is_done(0, Stage::Normalized));
    }

    #[tokio::test]
    async fn checkpoint_write_failure_aborts_run() {
        let tmp = TempDir::new().unwrap();
        let (store, layout) = setup(&tmp);
        // A non-empty directory where the checkpoint file should go.
        std::fs::create_dir_all(layout.checkpoint_path().join("blocker")).unwrap();

        let scheduler = PipelineScheduler::new(
            store,
            layout,
            stages(FallbackChain::rules_only(), Arc::new(SentenceSegmenter::default())),
            &PipelineConfig::default(),
        );

        let err = scheduler
            .run(vec![unit(0, "A", "Text.")])
            .await
            .unwrap_err();
        assert!(matches!(err, AudiobookError::CheckpointWrite { .. }), "got: {err}");
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
    }
}
