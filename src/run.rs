//! Top-level entry point tying checkpoint, layout and scheduler together.
//!
//! A typical run:
//!
//! ```text
//! open ──▶ restore_units? ──(none)──▶ structure externally ──▶ record_units
//!                │                                                   │
//!                └────────────────────┬──────────────────────────────┘
//!                                     ▼
//!                       insert_summary (optional, once)
//!                                     ▼
//!                          build_stages ──▶ run
//! ```
//!
//! Every step is safe to repeat against the same output directory and
//! source: finished stages are skipped, and the summary is inserted once.

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::engine::{EngineRegistry, SingleFlight, SpeechEngine};
use crate::error::AudiobookError;
use crate::layout::ArtifactLayout;
use crate::output::{PipelineReport, UsageTotals};
use crate::pipeline::normalize::{build_chain, resolve_provider, FallbackChain};
use crate::pipeline::segment::SentenceSegmenter;
use crate::pipeline::synthesize::ChunkSynthesizer;
use crate::reindex::{InsertedUnit, Reindexer};
use crate::scheduler::{PipelineScheduler, Stages};
use crate::summary::{generate_summary, SUMMARY_SENTINEL};
use crate::unit::{Section, Stage, Unit};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A resumable run bound to one source and one output directory.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    layout: ArtifactLayout,
    checkpoint: Arc<CheckpointStore>,
    source: PathBuf,
}

impl Pipeline {
    /// Create the output tree and load (or start) the checkpoint for `source`.
    pub fn open(source: impl AsRef<Path>, config: PipelineConfig) -> Result<Self, AudiobookError> {
        let source = source.as_ref().to_path_buf();
        let layout = ArtifactLayout::new(&config.output_dir);
        layout.ensure_dirs().map_err(|e| AudiobookError::OutputDir {
            path: layout.root().to_path_buf(),
            source: e,
        })?;

        let checkpoint = CheckpointStore::load_or_create_with_prefix(
            layout.checkpoint_path(),
            &source,
            config.fingerprint_prefix_bytes,
        )?;
        info!(
            "Opened run for {} (fingerprint {}) in {}",
            source.display(),
            checkpoint.fingerprint(),
            layout.root().display()
        );

        Ok(Self {
            config,
            layout,
            checkpoint: Arc::new(checkpoint),
            source,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Reload the structured units of a previous run.
    ///
    /// Returns `None` when structuring has not completed for every unit, or
    /// when a unit has neither its JSON nor its Markdown on disk. A unit with
    /// only Markdown is rebuilt as one body section titled "Chapter N".
    pub fn restore_units(&self) -> Result<Option<Vec<Unit>>, AudiobookError> {
        let total = self.checkpoint.total_units();
        if total == 0 || !self.checkpoint.all_done(Stage::Structured, total) {
            return Ok(None);
        }

        let mut units = Vec::with_capacity(total);
        for i in 0..total {
            let json = self.layout.structured_json(i);
            let md = self.layout.structured_markdown(i);
            let mut unit = if json.exists() {
                Unit::load_json(&json).map_err(|e| AudiobookError::UnitStore {
                    index: i,
                    path: json.clone(),
                    detail: e.to_string(),
                })?
            } else if md.exists() {
                let text = std::fs::read_to_string(&md).map_err(|e| AudiobookError::UnitStore {
                    index: i,
                    path: md.clone(),
                    detail: e.to_string(),
                })?;
                Unit::new(i, format!("Chapter {}", i + 1), vec![Section::body(text)])
            } else {
                warn!("Unit {} is marked structured but has no artifact; re-structure needed", i);
                return Ok(None);
            };
            unit.index = i;
            units.push(unit);
        }

        info!(
            "Restored {} units (strategy '{}')",
            units.len(),
            self.checkpoint.strategy()
        );
        Ok(Some(units))
    }

    /// Persist freshly structured units and mark them `structured`.
    ///
    /// Each unit's index must equal its position.
    pub fn record_units(&self, units: &[Unit], strategy: &str) -> Result<(), AudiobookError> {
        for (position, unit) in units.iter().enumerate() {
            let json = self.layout.structured_json(position);
            if unit.index != position {
                return Err(AudiobookError::UnitStore {
                    index: unit.index,
                    path: json,
                    detail: format!("index does not match position {position}"),
                });
            }
            let store_err = |path: &Path, e: std::io::Error| AudiobookError::UnitStore {
                index: position,
                path: path.to_path_buf(),
                detail: e.to_string(),
            };
            unit.save_json(&json).map_err(|e| store_err(&json, e))?;
            let md = self.layout.structured_markdown(position);
            unit.save_markdown(&md).map_err(|e| store_err(&md, e))?;
            self.checkpoint.mark(position, Stage::Structured)?;
        }
        self.checkpoint.set_structure(units.len(), strategy)?;
        info!("Recorded {} units (strategy '{}')", units.len(), strategy);
        Ok(())
    }

    /// Insert `inserted` at index 0, renumbering everything already persisted.
    pub fn insert_front(&self, units: &mut Vec<Unit>, inserted: InsertedUnit) -> Result<bool, AudiobookError> {
        Reindexer::new(&self.checkpoint, &self.layout).insert_front(units, inserted)
    }

    /// Generate the executive summary and insert it at index 0, once.
    ///
    /// Returns whether a unit was inserted, with the LLM usage it cost.
    pub async fn insert_summary(&self, units: &mut Vec<Unit>) -> Result<(bool, UsageTotals), AudiobookError> {
        if Reindexer::already_inserted(units, SUMMARY_SENTINEL) {
            info!("Executive summary already present");
            return Ok((false, UsageTotals::default()));
        }

        let provider = if self.config.normalize.use_llm {
            match resolve_provider(&self.config.normalize) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("No LLM for the summary: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let summary = generate_summary(units, provider.as_ref()).await;
        if summary.text.trim().is_empty() {
            warn!("Summary is empty; not inserting it");
            return Ok((false, summary.usage));
        }
        let inserted = self.insert_front(units, InsertedUnit::summary(summary.text))?;
        Ok((inserted, summary.usage))
    }

    /// Stages from the configuration: LLM/rules normalizer chain, sentence
    /// segmenter, and the configured backend from `registry`.
    pub fn build_stages(&self, registry: &EngineRegistry) -> Result<Stages, AudiobookError> {
        let engine = registry.create(&self.config.synthesis)?;
        Ok(self.stages(build_chain(&self.config.normalize), engine))
    }

    /// Stages around a caller-supplied normalizer chain and engine.
    ///
    /// The segmenter's limit follows [`PipelineConfig::effective_max_chars`]
    /// and the sub-unit fan-out [`PipelineConfig::effective_synthesis_workers`].
    pub fn stages(&self, normalizer: FallbackChain, engine: Box<dyn SpeechEngine>) -> Stages {
        let max_chars = self.config.effective_max_chars(engine.max_input_chars());
        let workers = self.config.effective_synthesis_workers(engine.preferred_workers());
        debug!(
            "Engine '{}': {} chars per sub-unit, {} synthesis workers",
            engine.name(),
            max_chars,
            workers
        );
        Stages {
            normalizer,
            segmenter: Arc::new(SentenceSegmenter::new(max_chars)),
            engine: SingleFlight::new(engine),
            synthesizer: ChunkSynthesizer::new(workers),
        }
    }

    /// Drive `units` through the remaining stages.
    pub async fn run(&self, units: Vec<Unit>, stages: Stages) -> Result<PipelineReport, AudiobookError> {
        PipelineScheduler::new(
            Arc::clone(&self.checkpoint),
            self.layout.clone(),
            stages,
            &self.config,
        )
        .run(units)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizeConfig;
    use crate::error::SynthesisError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct RemoteLike;

    #[async_trait]
    impl SpeechEngine for RemoteLike {
        fn name(&self) -> &str {
            "remote"
        }

        async fn synthesize(&self, _text: &str, _output: &Path) -> Result<(), SynthesisError> {
            Ok(())
        }

        fn preferred_workers(&self) -> Option<usize> {
            Some(8)
        }
    }

    fn open(tmp: &TempDir) -> Pipeline {
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, b"%PDF source").unwrap();
        let config = PipelineConfig::builder()
            .output_dir(tmp.path().join("out"))
            .normalize(NormalizeConfig {
                use_llm: false,
                ..NormalizeConfig::default()
            })
            .build()
            .unwrap();
        Pipeline::open(&source, config).unwrap()
    }

    fn units() -> Vec<Unit> {
        vec![
            Unit::new(0, "Intro", vec![Section::body("An introduction long enough to summarise.")]),
            Unit::new(1, "Method", vec![Section::body("We measured things.")]),
        ]
    }

    #[test]
    fn nothing_to_restore_on_first_run() {
        let tmp = TempDir::new().unwrap();
        assert!(open(&tmp).restore_units().unwrap().is_none());
    }

    #[test]
    fn record_then_restore() {
        let tmp = TempDir::new().unwrap();
        let pipeline = open(&tmp);
        pipeline.record_units(&units(), "toc").unwrap();

        let reopened = open(&tmp);
        assert_eq!(reopened.checkpoint().strategy(), "toc");
        assert_eq!(reopened.restore_units().unwrap(), Some(units()));
    }

    #[test]
    fn restore_falls_back_to_markdown() {
        let tmp = TempDir::new().unwrap();
        let pipeline = open(&tmp);
        pipeline.record_units(&units(), "toc").unwrap();
        std::fs::remove_file(pipeline.layout().structured_json(1)).unwrap();

        let restored = pipeline.restore_units().unwrap().unwrap();
        assert_eq!(restored[1].title, "Chapter 2");
        assert!(restored[1].sections[0].content.contains("We measured things."));
    }

    #[test]
    fn record_rejects_misnumbered_units() {
        let tmp = TempDir::new().unwrap();
        let mut bad = units();
        bad[1].index = 5;
        assert!(matches!(
            open(&tmp).record_units(&bad, "toc"),
            Err(AudiobookError::UnitStore { index: 5, .. })
        ));
    }

    #[tokio::test]
    async fn summary_is_inserted_once() {
        let tmp = TempDir::new().unwrap();
        let pipeline = open(&tmp);
        let mut list = units();
        pipeline.record_units(&list, "toc").unwrap();

        let (inserted, _) = pipeline.insert_summary(&mut list).await.unwrap();
        assert!(inserted);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].sentinel.as_deref(), Some(SUMMARY_SENTINEL));

        let mut restored = open(&tmp).restore_units().unwrap().unwrap();
        let (again, _) = pipeline.insert_summary(&mut restored).await.unwrap();
        assert!(!again);
        assert_eq!(restored.len(), 3);
        assert_eq!(pipeline.checkpoint().total_units(), 3);
    }

    #[test]
    fn stages_follow_the_engine_worker_hint() {
        let tmp = TempDir::new().unwrap();
        let stages = open(&tmp).stages(FallbackChain::rules_only(), Box::new(RemoteLike));
        assert_eq!(stages.synthesizer.workers(), 8);
    }

    #[test]
    fn unknown_backend_is_reported() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, b"x").unwrap();
        let config = PipelineConfig::builder()
            .output_dir(tmp.path().join("out"))
            .synthesis(crate::config::SynthesisConfig {
                backend: "missing".into(),
                ..Default::default()
            })
            .build()
            .unwrap();
        let pipeline = Pipeline::open(&source, config).unwrap();
        assert!(matches!(
            pipeline.build_stages(&EngineRegistry::with_builtins()),
            Err(AudiobookError::UnknownEngine { .. })
        ));
    }
}
