//! Results of a pipeline run.
//!
//! [`UnitResult`] is what the scheduler produces per unit, whether it
//! succeeded or not. [`PipelineReport`] collects them by index, together
//! with the merged [`UsageTotals`] of every worker.

use crate::error::UnitError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which normalizer produced a unit's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationSource {
    /// The primary (LLM) normalizer succeeded.
    Primary,
    /// The primary failed and the fallback rules were used.
    Fallback,
    /// Nothing to narrate (references section); empty text written.
    Skipped,
    /// Loaded from a previous run.
    Resumed,
}

/// LLM usage accumulated by one worker, merged by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub llm_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Units (or summaries) that fell back to the non-LLM path.
    pub fallbacks: u64,
}

impl UsageTotals {
    pub fn record_call(&mut self, input_tokens: usize, output_tokens: usize) {
        self.llm_calls += 1;
        self.input_tokens += input_tokens as u64;
        self.output_tokens += output_tokens as u64;
    }

    pub fn merge(&mut self, other: &UsageTotals) {
        self.llm_calls += other.llm_calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.fallbacks += other.fallbacks;
    }

    /// Estimated cost in dollars at per-million-token rates.
    pub fn estimated_cost(&self, input_per_million: f64, output_per_million: f64) -> f64 {
        (self.input_tokens as f64 * input_per_million
            + self.output_tokens as f64 * output_per_million)
            / 1_000_000.0
    }
}

/// Artifact locations per stage; `None` when the stage was not reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitArtifacts {
    pub structured: Option<PathBuf>,
    pub normalized: Option<PathBuf>,
    pub segments: Option<PathBuf>,
    /// Synthesis manifest listing produced sub-unit indices.
    pub manifest: Option<PathBuf>,
}

/// Outcome of processing one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub index: usize,
    pub title: String,
    pub artifacts: UnitArtifacts,
    pub normalization: Option<NormalizationSource>,
    /// Sub-unit indices whose synthesis failed in this run.
    pub failed_sub_units: Vec<usize>,
    pub duration_ms: u64,
    pub error: Option<UnitError>,
}

impl UnitResult {
    pub fn new(index: usize, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            artifacts: UnitArtifacts::default(),
            normalization: None,
            failed_sub_units: Vec::new(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a run produced, sorted by unit index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub results: Vec<UnitResult>,
    pub usage: UsageTotals,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.index)
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&UnitResult> {
        self.results
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.results[pos])
    }
}
