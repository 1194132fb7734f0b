//! Units, sub-units and stage flags.
//!
//! A [`Unit`] is one chapter-equivalent item produced by the structuring
//! collaborator. Its `index` is the identity every persisted artifact and
//! checkpoint key is derived from; only [`crate::reindex`] may change it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Ordered processing stages a unit passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Produced by the structuring collaborator and persisted.
    Structured,
    /// Cleaned text written by the normalization stage.
    Normalized,
    /// Sub-units written by the segmentation stage.
    Segmented,
    /// Sub-unit audio synthesized and manifest written.
    Finalized,
}

impl Stage {
    /// All stages in processing order.
    pub const ALL: [Stage; 4] = [
        Stage::Structured,
        Stage::Normalized,
        Stage::Segmented,
        Stage::Finalized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Structured => "structured",
            Stage::Normalized => "normalized",
            Stage::Segmented => "segmented",
            Stage::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Per-unit stage completion flags. Monotonic: the engine only ever sets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageStatus {
    pub structured: bool,
    pub normalized: bool,
    pub segmented: bool,
    pub finalized: bool,
}

impl StageStatus {
    pub fn get(&self, stage: Stage) -> bool {
        match stage {
            Stage::Structured => self.structured,
            Stage::Normalized => self.normalized,
            Stage::Segmented => self.segmented,
            Stage::Finalized => self.finalized,
        }
    }

    pub fn set(&mut self, stage: Stage) {
        match stage {
            Stage::Structured => self.structured = true,
            Stage::Normalized => self.normalized = true,
            Stage::Segmented => self.segmented = true,
            Stage::Finalized => self.finalized = true,
        }
    }
}

/// Kind of a structural section inside a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Heading,
    #[default]
    Body,
    Footnote,
    FigureCaption,
    Table,
}

/// One structural section of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(rename = "type")]
    pub kind: SectionKind,
    pub content: String,
    /// Heading level 1–6; 0 for non-headings.
    #[serde(default)]
    pub level: u8,
    #[serde(default)]
    pub page: usize,
}

impl Section {
    pub fn body(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Body,
            content: content.into(),
            level: 0,
            page: 0,
        }
    }

    pub fn heading(level: u8, content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Heading,
            content: content.into(),
            level,
            page: 0,
        }
    }
}

/// A chapter-equivalent work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub index: usize,
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub start_page: usize,
    #[serde(default)]
    pub end_page: usize,
    /// Marker set on units injected at the front of an existing run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentinel: Option<String>,
}

impl Unit {
    pub fn new(index: usize, title: impl Into<String>, sections: Vec<Section>) -> Self {
        Self {
            index,
            title: title.into(),
            sections,
            start_page: 0,
            end_page: 0,
            sentinel: None,
        }
    }

    /// Render the unit's sections as Markdown, the input of normalization.
    pub fn to_markdown(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let line = match section.kind {
                SectionKind::Heading => {
                    let prefix = "#".repeat(usize::from(section.level.max(1)));
                    format!("{prefix} {}\n", section.content)
                }
                SectionKind::Body => format!("{}\n", section.content),
                SectionKind::Footnote => format!("> [footnote] {}\n", section.content),
                SectionKind::FigureCaption => format!("*[figure] {}*\n", section.content),
                SectionKind::Table => {
                    format!("<!-- table -->\n{}\n<!-- /table -->\n", section.content)
                }
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Write the unit as pretty JSON (embedded `index` included).
    pub fn save_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)
    }

    /// Write the Markdown rendering.
    pub fn save_markdown(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_markdown())
    }

    pub fn load_json(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Whether the title names a references or bibliography section.
    pub fn is_references(&self) -> bool {
        let t = self.title.trim().to_lowercase();
        matches!(
            t.as_str(),
            "references"
                | "bibliography"
                | "works cited"
                | "literature cited"
                | "reference"
                | "ref"
                | "refs"
        ) || t.starts_with("references")
            || t.starts_with("bibliography")
    }
}

/// One independently synthesized chunk of a unit's normalized text.
///
/// Identity is `(unit_index, index)`. The target artifact location is
/// derived from that identity by [`crate::layout::ArtifactLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubUnit {
    pub unit_index: usize,
    pub index: usize,
    pub text: String,
    pub paragraph_index: usize,
    pub is_sentence_end: bool,
    pub is_paragraph_end: bool,
    pub is_unit_end: bool,
}

/// Persisted output of the segmentation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedUnit {
    pub unit_index: usize,
    pub title: String,
    pub sub_units: Vec<SubUnit>,
}
