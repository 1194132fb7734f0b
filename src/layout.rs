//! On-disk naming convention for every stage artifact.
//!
//! ```text
//! <root>/
//!   checkpoint.json
//!   parsed/chapter_NNN.json      structured unit (embedded `index`)
//!   parsed/chapter_NNN.md        Markdown rendering
//!   cleaned/chapter_NNN.txt      normalized text
//!   chunks/chapter_NNN.json      segmented unit (embedded `unit_index`)
//!   audio/chapter_NNN/chunk_MMMM.wav
//!   audio/chapter_NNN.json       synthesis manifest (embedded `unit_index`)
//! ```
//!
//! Unit indices are 3-digit and sub-unit indices 4-digit, zero-padded, so the
//! assembly collaborator can address files without asking the engine.

use std::path::{Path, PathBuf};

const PARSED_DIR: &str = "parsed";
const CLEANED_DIR: &str = "cleaned";
const CHUNKS_DIR: &str = "chunks";
const AUDIO_DIR: &str = "audio";
const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Resolves artifact locations under one output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    /// File stem shared by every artifact of unit `index`.
    pub fn unit_stem(index: usize) -> String {
        format!("chapter_{index:03}")
    }

    pub fn parsed_dir(&self) -> PathBuf {
        self.root.join(PARSED_DIR)
    }

    pub fn cleaned_dir(&self) -> PathBuf {
        self.root.join(CLEANED_DIR)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join(AUDIO_DIR)
    }

    pub fn structured_json(&self, index: usize) -> PathBuf {
        self.parsed_dir()
            .join(format!("{}.json", Self::unit_stem(index)))
    }

    pub fn structured_markdown(&self, index: usize) -> PathBuf {
        self.parsed_dir().join(format!("{}.md", Self::unit_stem(index)))
    }

    pub fn normalized_text(&self, index: usize) -> PathBuf {
        self.cleaned_dir()
            .join(format!("{}.txt", Self::unit_stem(index)))
    }

    pub fn segments(&self, index: usize) -> PathBuf {
        self.chunks_dir()
            .join(format!("{}.json", Self::unit_stem(index)))
    }

    /// Directory holding one audio file per sub-unit.
    pub fn sub_unit_dir(&self, index: usize) -> PathBuf {
        self.audio_dir().join(Self::unit_stem(index))
    }

    pub fn sub_unit_audio(&self, index: usize, sub_index: usize) -> PathBuf {
        self.sub_unit_dir(index)
            .join(format!("chunk_{sub_index:04}.wav"))
    }

    pub fn synthesis_manifest(&self, index: usize) -> PathBuf {
        self.audio_dir()
            .join(format!("{}.json", Self::unit_stem(index)))
    }

    /// Every persisted artifact location of unit `index`, across all stages.
    ///
    /// Locations are returned whether or not they exist.
    pub fn unit_artifacts(&self, index: usize) -> Vec<PathBuf> {
        vec![
            self.structured_json(index),
            self.structured_markdown(index),
            self.normalized_text(index),
            self.segments(index),
            self.sub_unit_dir(index),
            self.synthesis_manifest(index),
        ]
    }

    /// Artifacts that carry the unit index inside their JSON body, with the
    /// field names holding it.
    pub fn indexed_documents(&self, index: usize) -> Vec<(PathBuf, IndexField)> {
        vec![
            (self.structured_json(index), IndexField::Index),
            (self.segments(index), IndexField::UnitIndex),
            (self.synthesis_manifest(index), IndexField::UnitIndex),
        ]
    }

    /// Create the stage directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.parsed_dir(),
            self.cleaned_dir(),
            self.chunks_dir(),
            self.audio_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Name of the embedded index field inside a persisted JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
    /// `{"index": N, ...}` (structured unit).
    Index,
    /// `{"unit_index": N, "sub_units": [{"unit_index": N, ...}]}`.
    UnitIndex,
}
