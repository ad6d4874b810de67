use std::{
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tokio::{
    fs as async_fs,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, warn};

use super::ReviewStore;
use crate::detection::crop::crop_exists;
use crate::error::{ReviewError, ReviewResult};

/// A parsed document. `minted_ids` is set when some record had no
/// `detection_id` on disk and received a fresh one while loading.
#[derive(Debug, Default)]
pub(super) struct Loaded {
    pub(super) store: ReviewStore,
    pub(super) minted_ids: bool,
}

/// Owns the on-disk review document.
///
/// The lock serializes writers: a mutation holds the write guard across its
/// whole load-mutate-save. Saves go through a temp file and a rename, so a
/// reader never sees a half-written document. File work runs off the async
/// workers.
pub(super) struct StoreState {
    path: PathBuf,
    lock: RwLock<()>,
}

impl std::fmt::Debug for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreState")
            .field("path", &self.path)
            .finish()
    }
}

/// Run blocking file work on the blocking pool.
pub(super) async fn blocking<T, F>(f: F) -> ReviewResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ReviewResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReviewError::Io(std::io::Error::other(e)))?
}

fn parse_document(path: &Path, bytes: &[u8]) -> ReviewResult<Loaded> {
    let corrupt = |source| ReviewError::StoreCorrupt {
        path: path.to_path_buf(),
        source,
    };
    let raw: serde_json::Value = serde_json::from_slice(bytes).map_err(corrupt)?;
    let minted_ids = lacks_detection_ids(&raw);
    let store = serde_json::from_value(raw).map_err(corrupt)?;
    Ok(Loaded { store, minted_ids })
}

fn lacks_detection_ids(raw: &serde_json::Value) -> bool {
    raw.as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("detections")?.as_array())
        .flatten()
        .any(|d| d.get("detection_id").is_none())
}

impl StoreState {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) async fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    pub(super) async fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Raw document bytes; `None` when no document exists yet.
    async fn read_bytes(&self) -> ReviewResult<Option<Vec<u8>>> {
        match async_fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load for mutation: orphans pruned, a corrupt document is an error.
    pub(super) async fn load(&self) -> ReviewResult<Loaded> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(Loaded::default());
        };
        let path = self.path.clone();
        blocking(move || {
            let mut loaded = parse_document(&path, &bytes)?;
            let dropped = loaded.store.prune_orphans(crop_exists);
            if dropped > 0 {
                debug!(dropped, path = %path.display(), "pruned detections with missing crops");
            }
            Ok(loaded)
        })
        .await
    }

    /// Load for reading: like [`StoreState::load`], but a corrupt document
    /// reads as an empty store.
    pub(super) async fn load_for_read(&self) -> ReviewResult<Loaded> {
        match self.load().await {
            Err(e @ ReviewError::StoreCorrupt { .. }) => {
                warn!("{e}; serving an empty store");
                Ok(Loaded::default())
            }
            other => other,
        }
    }

    /// Fails with `StoreCorrupt` when a document exists but does not parse.
    pub(super) async fn ensure_parses(&self) -> ReviewResult<()> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(());
        };
        let path = self.path.clone();
        blocking(move || parse_document(&path, &bytes).map(|_| ())).await
    }

    /// Overwrite the whole document atomically and hand the saved store back.
    pub(super) async fn save(&self, mut store: ReviewStore) -> ReviewResult<ReviewStore> {
        let path = self.path.clone();
        blocking(move || {
            store.recount_all();

            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&parent)?;

            let tmp = NamedTempFile::new_in(&parent)?;
            {
                let mut writer = BufWriter::new(tmp.as_file());
                serde_json::to_writer_pretty(&mut writer, &store)?;
                writer.flush()?;
            }
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;

            debug!(
                path = %path.display(),
                images = store.len(),
                detections = store.detection_count(),
                "review store saved"
            );
            Ok(store)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_without_ids_are_flagged() {
        let legacy = br#"[{"uploaded_img": "a.jpg", "detections": [
            {"defect_id": 0, "defect_type": "BrownSpot", "confidence": 1, "bbox": [0, 0, 1, 1]}
        ]}]"#;
        let loaded = parse_document(Path::new("doc.json"), legacy).unwrap();
        assert!(loaded.minted_ids);
        assert_eq!(loaded.store.detection_count(), 1);

        let saved = serde_json::to_vec(&loaded.store).unwrap();
        let reloaded = parse_document(Path::new("doc.json"), &saved).unwrap();
        assert!(!reloaded.minted_ids);
        assert_eq!(reloaded.store, loaded.store);
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = parse_document(Path::new("doc.json"), b"{ nope").unwrap_err();
        assert!(matches!(err, ReviewError::StoreCorrupt { .. }));
    }
}
