//! Persistent per-unit stage completion state.
//!
//! One checkpoint document exists per run, identified by a fingerprint of the
//! source document. Every mutation rewrites the whole document through a
//! temp-file + rename, under a single exclusive section, so concurrent
//! workers can neither interleave partial writes nor lose each other's
//! updates.
//!
//! ## Fingerprint limitation
//!
//! The fingerprint hashes only a bounded prefix of the source (1 MiB by
//! default). Two sources sharing that prefix but differing afterwards are
//! treated as the same run, so an edit past the prefix does not invalidate
//! the checkpoint.

use crate::error::AudiobookError;
use crate::unit::{Stage, StageStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Bytes of the source hashed into the run fingerprint by default.
pub const DEFAULT_FINGERPRINT_PREFIX: usize = 1024 * 1024;

/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// The persisted checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub source_path: String,
    pub fingerprint: String,
    /// Label of the structuring strategy that produced the units.
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub total_units: usize,
    #[serde(default)]
    pub units: BTreeMap<usize, StageStatus>,
}

impl Checkpoint {
    pub fn is_done(&self, index: usize, stage: Stage) -> bool {
        self.units.get(&index).is_some_and(|s| s.get(stage))
    }
}

/// Thread-safe handle to the run's checkpoint document.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// Reload the checkpoint at `path` if its fingerprint matches `source`,
    /// otherwise start a fresh one. Uses [`DEFAULT_FINGERPRINT_PREFIX`].
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        source: &Path,
    ) -> Result<Self, AudiobookError> {
        Self::load_or_create_with_prefix(path, source, DEFAULT_FINGERPRINT_PREFIX)
    }

    /// Like [`Self::load_or_create`] with an explicit fingerprint prefix size.
    ///
    /// A fresh checkpoint is held in memory only; it reaches disk on the
    /// first mutation.
    pub fn load_or_create_with_prefix(
        path: impl Into<PathBuf>,
        source: &Path,
        prefix_bytes: usize,
    ) -> Result<Self, AudiobookError> {
        let path = path.into();
        let fingerprint = fingerprint_source(source, prefix_bytes)?;
        let source_path = source.display().to_string();

        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                AudiobookError::CheckpointRead {
                    path: path.clone(),
                    source: e,
                }
            })?;
            match serde_json::from_str::<Checkpoint>(&raw) {
                Ok(existing) if existing.fingerprint == fingerprint => {
                    info!(
                        "Resuming checkpoint {} ({} units, {} tracked)",
                        path.display(),
                        existing.total_units,
                        existing.units.len()
                    );
                    let state = Checkpoint {
                        source_path,
                        ..existing
                    };
                    return Ok(Self {
                        path,
                        state: Mutex::new(state),
                    });
                }
                Ok(existing) => {
                    info!(
                        "Checkpoint fingerprint {} does not match source {}; starting fresh",
                        existing.fingerprint, fingerprint
                    );
                }
                Err(e) => {
                    warn!(
                        "Checkpoint {} is not valid JSON ({}); starting fresh",
                        path.display(),
                        e
                    );
                }
            }
        }

        debug!("New checkpoint for {} ({})", source_path, fingerprint);
        Ok(Self {
            path,
            state: Mutex::new(Checkpoint {
                source_path,
                fingerprint,
                ..Checkpoint::default()
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark `stage` done for unit `index` and persist the whole document.
    ///
    /// Idempotent. Returns only after the write reached durable storage.
    pub fn mark(&self, index: usize, stage: Stage) -> Result<(), AudiobookError> {
        self.update(|state| state.units.entry(index).or_default().set(stage))
    }

    /// [`Self::mark`] on the blocking pool, for callers running on async
    /// worker tasks. The sync write never stalls a runtime thread.
    pub async fn mark_async(self: &Arc<Self>, index: usize, stage: Stage) -> Result<(), AudiobookError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.mark(index, stage))
            .await
            .map_err(|e| AudiobookError::WorkerJoin(e.to_string()))?
    }

    /// Whether `stage` is done for unit `index`. Unknown units are not done.
    pub fn is_done(&self, index: usize, stage: Stage) -> bool {
        self.lock().is_done(index, stage)
    }

    /// Name-based variant of [`Self::is_done`]; unknown stage names are not done.
    pub fn is_done_named(&self, index: usize, stage: &str) -> bool {
        stage
            .parse::<Stage>()
            .map(|s| self.is_done(index, s))
            .unwrap_or(false)
    }

    /// Whether `stage` is done for every unit in `0..count`.
    pub fn all_done(&self, stage: Stage, count: usize) -> bool {
        let state = self.lock();
        (0..count).all(|i| state.is_done(i, stage))
    }

    pub fn total_units(&self) -> usize {
        self.lock().total_units
    }

    pub fn fingerprint(&self) -> String {
        self.lock().fingerprint.clone()
    }

    pub fn strategy(&self) -> String {
        self.lock().strategy.clone()
    }

    /// Copy of the current document.
    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    /// Record unit count and structuring strategy, then persist.
    pub fn set_structure(&self, total_units: usize, strategy: &str) -> Result<(), AudiobookError> {
        self.update(|state| {
            state.total_units = total_units;
            state.strategy = strategy.to_string();
        })
    }

    pub fn set_total_units(&self, total_units: usize) -> Result<(), AudiobookError> {
        self.update(|state| state.total_units = total_units)
    }

    /// Move the status entry of unit `from` to key `to`, then persist.
    ///
    /// Any entry already at `to` is replaced. A missing `from` is a no-op
    /// apart from the write.
    pub fn move_entry(&self, from: usize, to: usize) -> Result<(), AudiobookError> {
        self.update(|state| {
            if let Some(status) = state.units.remove(&from) {
                state.units.insert(to, status);
            }
        })
    }

    /// Apply `change` to a copy, persist the copy, then publish it.
    ///
    /// On a failed write the in-memory document is left untouched, so it
    /// never claims more than disk does.
    fn update(&self, change: impl FnOnce(&mut Checkpoint)) -> Result<(), AudiobookError> {
        let mut state = self.lock();
        let mut next = state.clone();
        change(&mut next);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Checkpoint> {
        // A panicking writer cannot leave a half-applied flag behind, so the
        // inner state is still usable after poisoning.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `state` atomically: temp file in the same directory, then rename.
    fn persist(&self, state: &Checkpoint) -> Result<(), AudiobookError> {
        let json = serde_json::to_vec_pretty(state)?;
        let write_err = |source: std::io::Error| AudiobookError::CheckpointWrite {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

/// Fingerprint a source by hashing at most `prefix_bytes` from its start.
///
/// Not a full-content hash: sources that agree on the prefix collide.
pub fn fingerprint_source(source: &Path, prefix_bytes: usize) -> Result<String, AudiobookError> {
    let unreadable = |e| AudiobookError::SourceUnreadable {
        path: source.to_path_buf(),
        source: e,
    };
    let file = File::open(source).map_err(unreadable)?;

    let mut hasher = Sha256::new();
    let mut limited = file.take(prefix_bytes as u64);
    let mut buf = [0_u8; 8192];
    loop {
        let count = limited.read(&mut buf).map_err(unreadable)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_with(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, bytes).unwrap();
        p
    }

    #[test]
    fn mark_then_is_done_survives_reload() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "book.pdf", b"%PDF-1.7 some content");
        let cp_path = dir.path().join("out/checkpoint.json");

        let store = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        store.mark(3, Stage::Normalized).unwrap();
        assert!(store.is_done(3, Stage::Normalized));
        assert!(!store.is_done(3, Stage::Segmented));

        let reloaded = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        assert!(reloaded.is_done(3, Stage::Normalized));
        assert!(!reloaded.is_done(2, Stage::Normalized));
    }

    #[test]
    fn unknown_unit_and_stage_are_not_done() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let store = CheckpointStore::load_or_create(dir.path().join("cp.json"), &src).unwrap();
        assert!(!store.is_done(99, Stage::Finalized));
        store.mark(0, Stage::Structured).unwrap();
        assert!(store.is_done_named(0, "structured"));
        assert!(!store.is_done_named(0, "no-such-stage"));
    }

    #[test]
    fn mark_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let store = CheckpointStore::load_or_create(dir.path().join("cp.json"), &src).unwrap();
        store.mark(1, Stage::Segmented).unwrap();
        store.mark(1, Stage::Segmented).unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.units.len(), 1);
        assert!(snap.units[&1].segmented);
    }

    #[test]
    fn changed_source_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let cp_path = dir.path().join("cp.json");
        let src = source_with(&dir, "a.pdf", b"first edition");
        let store = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        store.mark(0, Stage::Finalized).unwrap();

        std::fs::write(&src, b"second edition").unwrap();
        let fresh = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        assert!(!fresh.is_done(0, Stage::Finalized));
        assert_ne!(fresh.fingerprint(), store.fingerprint());
    }

    #[test]
    fn edits_past_prefix_are_invisible() {
        let dir = TempDir::new().unwrap();
        let cp_path = dir.path().join("cp.json");
        let src = source_with(&dir, "a.pdf", b"0123456789-tail-one");
        let store = CheckpointStore::load_or_create_with_prefix(&cp_path, &src, 10).unwrap();
        store.mark(0, Stage::Normalized).unwrap();

        std::fs::write(&src, b"0123456789-a-much-longer-different-tail").unwrap();
        let reloaded = CheckpointStore::load_or_create_with_prefix(&cp_path, &src, 10).unwrap();
        assert!(reloaded.is_done(0, Stage::Normalized));
    }

    #[test]
    fn corrupt_document_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let cp_path = dir.path().join("cp.json");
        std::fs::write(&cp_path, "{not json").unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let store = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        assert_eq!(store.snapshot().units.len(), 0);
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = CheckpointStore::load_or_create(
            dir.path().join("cp.json"),
            &dir.path().join("missing.pdf"),
        )
        .unwrap_err();
        assert!(matches!(err, AudiobookError::SourceUnreadable { .. }));
    }

    #[test]
    fn write_failure_propagates() {
        let dir = TempDir::new().unwrap();
        // A non-empty directory squatting on the checkpoint path makes the rename fail.
        let cp_path = dir.path().join("cp.json");
        std::fs::create_dir_all(cp_path.join("occupied")).unwrap();

        let blocked = CheckpointStore {
            path: cp_path,
            state: Mutex::new(Checkpoint::default()),
        };
        let err = blocked.mark(0, Stage::Normalized).unwrap_err();
        assert!(matches!(err, AudiobookError::CheckpointWrite { .. }));
    }

    #[test]
    fn failed_write_leaves_memory_matching_disk() {
        let dir = TempDir::new().unwrap();
        let cp_path = dir.path().join("cp.json");
        std::fs::create_dir_all(cp_path.join("occupied")).unwrap();

        let blocked = CheckpointStore {
            path: cp_path,
            state: Mutex::new(Checkpoint::default()),
        };
        assert!(blocked.mark(2, Stage::Segmented).is_err());
        assert!(!blocked.is_done(2, Stage::Segmented));
        assert!(blocked.set_structure(5, "toc").is_err());
        assert_eq!(blocked.total_units(), 0);
        assert_eq!(blocked.snapshot(), Checkpoint::default());
    }

    #[tokio::test]
    async fn mark_async_persists_from_a_worker_task() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let cp_path = dir.path().join("cp.json");
        let store = Arc::new(CheckpointStore::load_or_create(&cp_path, &src).unwrap());

        store.mark_async(4, Stage::Finalized).await.unwrap();
        assert!(store.is_done(4, Stage::Finalized));
        let reloaded = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        assert!(reloaded.is_done(4, Stage::Finalized));
    }

    #[test]
    fn concurrent_marks_are_all_persisted() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let cp_path = dir.path().join("cp.json");
        let store = Arc::new(CheckpointStore::load_or_create(&cp_path, &src).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for stage in Stage::ALL {
                        store.mark(i, stage).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reloaded = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        for i in 0..8 {
            for stage in Stage::ALL {
                assert!(reloaded.is_done(i, stage), "unit {i} stage {stage}");
            }
        }
    }

    #[test]
    fn move_entry_rekeys_status() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let cp_path = dir.path().join("cp.json");
        let store = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        store.mark(0, Stage::Segmented).unwrap();
        store.move_entry(0, 1).unwrap();
        assert!(!store.is_done(0, Stage::Segmented));
        assert!(store.is_done(1, Stage::Segmented));

        let reloaded = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        assert!(reloaded.is_done(1, Stage::Segmented));
    }

    #[test]
    fn persisted_keys_are_numeric_strings() {
        let dir = TempDir::new().unwrap();
        let src = source_with(&dir, "a.pdf", b"abc");
        let cp_path = dir.path().join("cp.json");
        let store = CheckpointStore::load_or_create(&cp_path, &src).unwrap();
        store.set_structure(2, "outline").unwrap();
        store.mark(1, Stage::Structured).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&cp_path).unwrap()).unwrap();
        assert_eq!(raw["strategy"], "outline");
        assert_eq!(raw["total_units"], 2);
        assert_eq!(raw["units"]["1"]["structured"], true);
    }
}
