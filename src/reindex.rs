//! Front insertion into an already-checkpointed unit sequence.
//!
//! Inserting at index 0 shifts every existing unit up by one. Units are
//! processed from the highest index down so a shift never lands on an
//! artifact that has not moved yet:
//!
//! 1. for `i` in `N-1 ..= 0`: rename each artifact of `i` to `i+1`, then move
//!    checkpoint key `i` to `i+1`
//! 2. rewrite the index embedded in each shifted JSON document
//! 3. write the new unit at index 0, mark the stages it arrives with, and
//!    record the new total
//!
//! The shift is not transactional. If it fails part-way the output
//! directory is left with mixed indices and [`AudiobookError::Reindex`] is
//! returned. The sentinel guard only stops a *completed* insertion from
//! running twice; it does not repair a partial one.

use crate::checkpoint::CheckpointStore;
use crate::error::AudiobookError;
use crate::layout::{ArtifactLayout, IndexField};
use crate::unit::{Section, Stage, Unit};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// A unit to place at index 0, possibly with stages already computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedUnit {
    pub title: String,
    pub sections: Vec<Section>,
    /// Marker recognised on later runs to skip a repeated insertion.
    pub sentinel: String,
    /// Narration text when it needs no normalization; marks `normalized`.
    pub normalized_text: Option<String>,
}

impl InsertedUnit {
    fn into_unit(self) -> Unit {
        Unit {
            sentinel: Some(self.sentinel),
            ..Unit::new(0, self.title, self.sections)
        }
    }
}

/// Renumbers persisted artifacts and checkpoint keys.
#[derive(Debug, Clone, Copy)]
pub struct Reindexer<'a> {
    checkpoint: &'a CheckpointStore,
    layout: &'a ArtifactLayout,
}

impl<'a> Reindexer<'a> {
    pub fn new(checkpoint: &'a CheckpointStore, layout: &'a ArtifactLayout) -> Self {
        Self { checkpoint, layout }
    }

    /// Whether `units[0]` already carries `sentinel`.
    pub fn already_inserted(units: &[Unit], sentinel: &str) -> bool {
        units
            .first()
            .and_then(|u| u.sentinel.as_deref())
            .is_some_and(|s| s == sentinel)
    }

    /// Insert `inserted` at index 0 of `units`, shifting everything on disk.
    ///
    /// Returns `Ok(false)` without touching anything when the sentinel is
    /// already at index 0. On success `units` is renumbered in place.
    pub fn insert_front(&self, units: &mut Vec<Unit>, inserted: InsertedUnit) -> Result<bool, AudiobookError> {
        if Self::already_inserted(units, &inserted.sentinel) {
            debug!("'{}' already at index 0; nothing to insert", inserted.sentinel);
            return Ok(false);
        }

        let count = units.len();
        info!("Inserting '{}' before {} existing units", inserted.title, count);

        for i in (0..count).rev() {
            self.shift_unit(i)?;
            self.checkpoint.move_entry(i, i + 1)?;
        }

        for i in 1..=count {
            for (path, field) in self.layout.indexed_documents(i) {
                if path.exists() {
                    rewrite_index(&path, field, i).map_err(|detail| AudiobookError::Reindex {
                        index: i,
                        path: path.clone(),
                        detail,
                    })?;
                }
            }
        }

        for unit in units.iter_mut() {
            unit.index += 1;
        }

        let normalized_text = inserted.normalized_text.clone();
        let unit = inserted.into_unit();
        self.materialize(&unit, normalized_text.as_deref())?;
        self.checkpoint.set_total_units(count + 1)?;
        units.insert(0, unit);

        info!("Insertion complete: {} units", count + 1);
        Ok(true)
    }

    fn shift_unit(&self, i: usize) -> Result<(), AudiobookError> {
        let from = self.layout.unit_artifacts(i);
        let to = self.layout.unit_artifacts(i + 1);
        for (src, dst) in from.iter().zip(to.iter()) {
            if !src.exists() {
                continue;
            }
            std::fs::rename(src, dst).map_err(|e| AudiobookError::Reindex {
                index: i,
                path: src.clone(),
                detail: e.to_string(),
            })?;
        }
        debug!("Shifted unit {} → {}", i, i + 1);
        Ok(())
    }

    fn materialize(&self, unit: &Unit, normalized_text: Option<&str>) -> Result<(), AudiobookError> {
        let fail = |path: &Path, e: std::io::Error| AudiobookError::Reindex {
            index: 0,
            path: path.to_path_buf(),
            detail: e.to_string(),
        };

        let json = self.layout.structured_json(0);
        unit.save_json(&json).map_err(|e| fail(&json, e))?;
        let md = self.layout.structured_markdown(0);
        unit.save_markdown(&md).map_err(|e| fail(&md, e))?;
        self.checkpoint.mark(0, Stage::Structured)?;

        if let Some(text) = normalized_text {
            let path = self.layout.normalized_text(0);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| fail(&path, e))?;
            }
            std::fs::write(&path, text).map_err(|e| fail(&path, e))?;
            self.checkpoint.mark(0, Stage::Normalized)?;
        }
        Ok(())
    }
}

/// Set the embedded index of one persisted document to `index`.
fn rewrite_index(path: &Path, field: IndexField, index: usize) -> Result<(), String> {
    let raw = std::fs::read(path).map_err(|e| e.to_string())?;
    let mut doc: Value = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| "document is not a JSON object".to_string())?;

    match field {
        IndexField::Index => {
            obj.insert("index".into(), Value::from(index));
        }
        IndexField::UnitIndex => {
            obj.insert("unit_index".into(), Value::from(index));
            if let Some(Value::Array(subs)) = obj.get_mut("sub_units") {
                for sub in subs.iter_mut().filter_map(Value::as_object_mut) {
                    sub.insert("unit_index".into(), Value::from(index));
                }
            }
        }
    }

    let json = serde_json::to_vec_pretty(&doc).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::synthesize::SynthesisManifest;
    use crate::unit::{SegmentedUnit, SubUnit};
    use tempfile::TempDir;

    const MARK: &str = "front-matter";

    struct Fixture {
        _tmp: TempDir,
        layout: ArtifactLayout,
        store: CheckpointStore,
        units: Vec<Unit>,
    }

    /// `n` units with every stage artifact on disk and every stage marked.
    fn fixture(n: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, b"source bytes").unwrap();
        let layout = ArtifactLayout::new(tmp.path().join("out"));
        layout.ensure_dirs().unwrap();
        let store = CheckpointStore::load_or_create(layout.checkpoint_path(), &source).unwrap();

        let mut units = Vec::new();
        for i in 0..n {
            let unit = Unit::new(i, format!("Chapter {i}"), vec![Section::body(format!("Body {i}."))]);
            unit.save_json(&layout.structured_json(i)).unwrap();
            unit.save_markdown(&layout.structured_markdown(i)).unwrap();
            std::fs::write(layout.normalized_text(i), format!("text {i}")).unwrap();
            let seg = SegmentedUnit {
                unit_index: i,
                title: unit.title.clone(),
                sub_units: vec![SubUnit {
                    unit_index: i,
                    index: 0,
                    text: format!("text {i}"),
                    paragraph_index: 0,
                    is_sentence_end: true,
                    is_paragraph_end: true,
                    is_unit_end: true,
                }],
            };
            std::fs::write(layout.segments(i), serde_json::to_vec(&seg).unwrap()).unwrap();
            std::fs::create_dir_all(layout.sub_unit_dir(i)).unwrap();
            std::fs::write(layout.sub_unit_audio(i, 0), format!("wav {i}")).unwrap();
            SynthesisManifest {
                unit_index: i,
                title: unit.title.clone(),
                produced: vec![0],
                failed: vec![],
            }
            .save(&layout.synthesis_manifest(i))
            .unwrap();
            for stage in Stage::ALL {
                store.mark(i, stage).unwrap();
            }
            units.push(unit);
        }
        store.set_structure(n, "test").unwrap();
        Fixture {
            _tmp: tmp,
            layout,
            store,
            units,
        }
    }

    fn front(text: &str) -> InsertedUnit {
        InsertedUnit {
            title: "Front".into(),
            sections: vec![Section::body(text)],
            sentinel: MARK.into(),
            normalized_text: Some(text.into()),
        }
    }

    #[test]
    fn insertion_shifts_every_stage_area() {
        let mut f = fixture(3);
        let inserted = Reindexer::new(&f.store, &f.layout)
            .insert_front(&mut f.units, front("Overview."))
            .unwrap();
        assert!(inserted);

        // Former unit 2 now lives at 3, in every area.
        assert_eq!(
            std::fs::read_to_string(f.layout.normalized_text(3)).unwrap(),
            "text 2"
        );
        assert_eq!(
            std::fs::read_to_string(f.layout.sub_unit_audio(3, 0)).unwrap(),
            "wav 2"
        );
        assert!(f.layout.structured_markdown(3).exists());

        // Embedded indices follow the file names.
        assert_eq!(Unit::load_json(&f.layout.structured_json(1)).unwrap().index, 1);
        let seg: SegmentedUnit =
            serde_json::from_slice(&std::fs::read(f.layout.segments(2)).unwrap()).unwrap();
        assert_eq!(seg.unit_index, 2);
        assert_eq!(seg.sub_units[0].unit_index, 2);
        assert_eq!(seg.title, "Chapter 1");
        let manifest = SynthesisManifest::load(&f.layout.synthesis_manifest(3)).unwrap();
        assert_eq!(manifest.unit_index, 3);

        // New unit at 0.
        let zero = Unit::load_json(&f.layout.structured_json(0)).unwrap();
        assert_eq!(zero.sentinel.as_deref(), Some(MARK));
        assert_eq!(
            std::fs::read_to_string(f.layout.normalized_text(0)).unwrap(),
            "Overview."
        );
        assert!(!f.layout.segments(0).exists());
    }

    #[test]
    fn insertion_moves_checkpoint_keys() {
        let mut f = fixture(3);
        Reindexer::new(&f.store, &f.layout)
            .insert_front(&mut f.units, front("Overview."))
            .unwrap();

        let snap = f.store.snapshot();
        assert_eq!(snap.units.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(snap.total_units, 4);
        for i in 1..=3 {
            assert!(Stage::ALL.iter().all(|s| snap.is_done(i, *s)), "unit {i}");
        }
        assert!(snap.is_done(0, Stage::Structured));
        assert!(snap.is_done(0, Stage::Normalized));
        assert!(!snap.is_done(0, Stage::Segmented));
        assert!(!snap.is_done(0, Stage::Finalized));

        let indices: Vec<usize> = f.units.iter().map(|u| u.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(f.units[1].title, "Chapter 0");
    }

    #[test]
    fn second_insertion_is_a_no_op() {
        let mut f = fixture(2);
        let reindexer = Reindexer::new(&f.store, &f.layout);
        assert!(reindexer.insert_front(&mut f.units, front("Overview.")).unwrap());
        let before = f.store.snapshot();

        assert!(!reindexer.insert_front(&mut f.units, front("Overview.")).unwrap());
        assert_eq!(f.store.snapshot(), before);
        assert_eq!(f.units.len(), 3);
        assert!(!f.layout.structured_json(3).exists());
    }

    #[test]
    fn sentinel_survives_a_reload_from_disk() {
        let mut f = fixture(1);
        Reindexer::new(&f.store, &f.layout)
            .insert_front(&mut f.units, front("Overview."))
            .unwrap();
        let reloaded = vec![
            Unit::load_json(&f.layout.structured_json(0)).unwrap(),
            Unit::load_json(&f.layout.structured_json(1)).unwrap(),
        ];
        assert!(Reindexer::already_inserted(&reloaded, MARK));
    }

    #[test]
    fn partially_processed_units_shift_what_exists() {
        let mut f = fixture(2);
        std::fs::remove_file(f.layout.segments(1)).unwrap();
        std::fs::remove_dir_all(f.layout.sub_unit_dir(1)).unwrap();
        std::fs::remove_file(f.layout.synthesis_manifest(1)).unwrap();

        Reindexer::new(&f.store, &f.layout)
            .insert_front(&mut f.units, front("Overview."))
            .unwrap();

        assert!(f.layout.normalized_text(2).exists());
        assert!(!f.layout.segments(2).exists());
        assert!(f.layout.segments(1).exists());
    }

    #[test]
    fn empty_sequence_gets_single_unit() {
        let mut f = fixture(0);
        Reindexer::new(&f.store, &f.layout)
            .insert_front(&mut f.units, front("Only."))
            .unwrap();
        assert_eq!(f.units.len(), 1);
        assert_eq!(f.store.total_units(), 1);
    }

    #[test]
    fn rewrite_rejects_non_object() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.json");
        std::fs::write(&path, b"[1, 2]").unwrap();
        assert!(rewrite_index(&path, IndexField::Index, 1).is_err());
    }
}
