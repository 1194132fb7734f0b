//! Final stage: one audio artifact per sub-unit.
//!
//! [`ChunkSynthesizer`] skips sub-units whose artifact already exists, then
//! dispatches the rest either strictly in order (`workers <= 1`) or through a
//! bounded `buffer_unordered` pool. Each sub-unit writes to its own
//! pre-determined location, so completion order does not matter.
//!
//! Failures are collected per sub-unit. The unit escalates to
//! [`UnitError::AllSubUnitsFailed`] only when every sub-unit failed.
//!
//! ## Known limitation
//!
//! The caller holds the engine's single-flight guard for the whole call, so
//! parallel dispatch overlaps backend calls only when the backend itself is
//! reentrant (a remote HTTP service is; a loaded local model usually is not).

use crate::engine::SpeechEngine;
use crate::error::{SynthesisError, UnitError};
use crate::layout::ArtifactLayout;
use crate::unit::{Stage, SubUnit};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One failed sub-unit.
#[derive(Debug, Clone)]
pub struct SubUnitFailure {
    pub index: usize,
    pub error: SynthesisError,
}

/// What a [`ChunkSynthesizer`] call produced.
#[derive(Debug, Clone, Default)]
pub struct SynthesisReport {
    /// Sub-unit indices with an artifact on disk, ascending. Includes skipped ones.
    pub produced: Vec<usize>,
    /// Sub-units whose artifact already existed.
    pub skipped: usize,
    pub failures: Vec<SubUnitFailure>,
}

impl SynthesisReport {
    pub fn failed_indices(&self) -> Vec<usize> {
        let mut failed: Vec<usize> = self.failures.iter().map(|f| f.index).collect();
        failed.sort_unstable();
        failed
    }
}

/// Persisted list of the sub-unit artifacts the assembly step should use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisManifest {
    pub unit_index: usize,
    pub title: String,
    pub produced: Vec<usize>,
    #[serde(default)]
    pub failed: Vec<usize>,
}

impl SynthesisManifest {
    pub fn from_report(unit_index: usize, title: impl Into<String>, report: &SynthesisReport) -> Self {
        Self {
            unit_index,
            title: title.into(),
            produced: report.produced.clone(),
            failed: report.failed_indices(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Sub-unit fan-out for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSynthesizer {
    workers: usize,
}

impl ChunkSynthesizer {
    /// `workers <= 1` means strictly sequential, in sub-unit order.
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn synthesize(
        &self,
        engine: &dyn SpeechEngine,
        unit_index: usize,
        sub_units: &[SubUnit],
        layout: &ArtifactLayout,
    ) -> Result<SynthesisReport, UnitError> {
        let mut report = SynthesisReport::default();
        if sub_units.is_empty() {
            return Ok(report);
        }

        let dir = layout.sub_unit_dir(unit_index);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UnitError::ArtifactIo {
                index: unit_index,
                stage: Stage::Finalized,
                path: dir.clone(),
                detail: e.to_string(),
            })?;

        let mut pending: Vec<(usize, &str, PathBuf)> = Vec::new();
        for sub in sub_units {
            let path = layout.sub_unit_audio(unit_index, sub.index);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                report.skipped += 1;
                report.produced.push(sub.index);
            } else {
                pending.push((sub.index, sub.text.as_str(), path));
            }
        }

        if report.skipped > 0 {
            debug!(
                "Unit {}: {} of {} sub-units already synthesized",
                unit_index,
                report.skipped,
                sub_units.len()
            );
        }

        let outcomes: Vec<(usize, Result<(), SynthesisError>)> = if self.workers <= 1 {
            let mut outcomes = Vec::with_capacity(pending.len());
            for (index, text, path) in &pending {
                outcomes.push((*index, engine.synthesize(text, path).await));
            }
            outcomes
        } else {
            let calls: Vec<BoxFuture<'_, (usize, Result<(), SynthesisError>)>> = pending
                .iter()
                .map(|(index, text, path)| {
                    let index = *index;
                    async move { (index, engine.synthesize(text, path).await) }.boxed()
                })
                .collect();
            stream::iter(calls)
                .buffer_unordered(self.workers)
                .collect()
                .await
        };

        for (index, outcome) in outcomes {
            match outcome {
                Ok(()) => report.produced.push(index),
                Err(error) => {
                    warn!("Unit {}: sub-unit {} failed: {}", unit_index, index, error);
                    report.failures.push(SubUnitFailure { index, error });
                }
            }
        }
        report.produced.sort_unstable();

        if report.produced.is_empty() {
            let first_error = report
                .failures
                .iter()
                .min_by_key(|f| f.index)
                .map(|f| f.error.to_string())
                .unwrap_or_default();
            return Err(UnitError::AllSubUnitsFailed {
                index: unit_index,
                failed: report.failures.len(),
                first_error,
            });
        }

        if !report.failures.is_empty() {
            warn!(
                "Unit {}: {} of {} sub-units missing; assembling from the rest",
                unit_index,
                report.failures.len(),
                sub_units.len()
            );
        }
        Ok(report)
    }
}
