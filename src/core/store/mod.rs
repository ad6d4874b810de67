mod document;
mod state;

use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use state::{StoreState, blocking};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

pub use document::ReviewStore;

use crate::core::merge::merge;
use crate::error::{ReviewError, ReviewResult};
use crate::models::{ClassMap, Decision, DetectionKey, DetectionRecord, ImageEntry, PixelBox};

/// Review operations over the persisted store. Every mutation is a single
/// load-mutate-save unit that is persisted before it returns.
pub trait ReviewRepository {
    /// Current store with orphaned records pruned.
    fn list(&self) -> impl Future<Output = ReviewResult<ReviewStore>>;
    fn find_detection(
        &self,
        key: &DetectionKey,
    ) -> impl Future<Output = ReviewResult<(ImageEntry, DetectionRecord)>>;
    fn upsert_image(&self, entry: ImageEntry) -> impl Future<Output = ReviewResult<()>>;
    fn validate(
        &self,
        key: &DetectionKey,
        decision: Decision,
        correction: Option<&str>,
    ) -> impl Future<Output = ReviewResult<DetectionRecord>>;
    fn update_bbox(
        &self,
        uploaded_img: &str,
        key: &DetectionKey,
        bbox: PixelBox,
        defect_type: Option<&str>,
    ) -> impl Future<Output = ReviewResult<DetectionRecord>>;
    fn delete(&self, key: &DetectionKey) -> impl Future<Output = ReviewResult<DetectionRecord>>;
    /// Reconcile a bulk run's fresh entries with the stored ones and persist
    /// the result.
    fn apply_bulk(
        &self,
        entries: Vec<ImageEntry>,
        overwrite_corrupt: bool,
    ) -> impl Future<Output = ReviewResult<ReviewStore>>;
}

/// Handle to the review document. Clones share one writer lock.
///
/// Crop files that no record references any more after a mutation are
/// removed from disk.
#[derive(Debug, Clone)]
pub struct ReviewDb {
    state: Arc<StoreState>,
    classes: ClassMap,
    upload_dir: Option<PathBuf>,
}

impl ReviewDb {
    pub fn new<P: AsRef<Path>>(store_path: P, classes: ClassMap) -> Self {
        Self {
            state: Arc::new(StoreState::new(store_path.as_ref().to_path_buf())),
            classes,
            upload_dir: None,
        }
    }

    /// Source images live here; used to bound box edits on entries that
    /// carry no recorded image size.
    pub fn with_upload_dir(mut self, upload_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(upload_dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        self.state.path()
    }

    pub fn classes(&self) -> &ClassMap {
        &self.classes
    }

    /// Overwrite the document with `store`. Refuses to replace a document
    /// that does not parse unless `overwrite_corrupt` is set.
    pub async fn replace_all(&self, store: ReviewStore, overwrite_corrupt: bool) -> ReviewResult<()> {
        let _guard = self.state.write_guard().await;
        if !overwrite_corrupt {
            self.state.ensure_parses().await?;
        }
        self.state.save(store).await.map(|_| ())
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut ReviewStore) -> ReviewResult<T>) -> ReviewResult<T> {
        let _guard = self.state.write_guard().await;
        let mut store = self.state.load().await?.store;
        let before = store.crop_paths();
        let out = f(&mut store)?;
        let store = self.state.save(store).await?;
        release_crops(&before, &store).await;
        Ok(out)
    }

    /// Read path. A legacy document whose records had no ids gets the ids
    /// minted while loading written back once, under the write lock, so the
    /// ids handed to callers stay valid for later mutations.
    async fn read_store(&self) -> ReviewResult<ReviewStore> {
        {
            let _guard = self.state.read_guard().await;
            let loaded = self.state.load_for_read().await?;
            if !loaded.minted_ids {
                return Ok(loaded.store);
            }
        }

        let _guard = self.state.write_guard().await;
        let loaded = self.state.load_for_read().await?;
        if !loaded.minted_ids {
            return Ok(loaded.store);
        }
        let store = self.state.save(loaded.store).await?;
        info!(path = %self.path().display(), "assigned ids to legacy detections");
        Ok(store)
    }

    async fn source_size(&self, uploaded_img: &str) -> Option<(u32, u32)> {
        let path = self.upload_dir.as_ref()?.join(uploaded_img);
        blocking(move || Ok(image::image_dimensions(&path).ok()))
            .await
            .ok()
            .flatten()
    }
}

/// Delete crop files referenced before a save but not after it.
async fn release_crops(before: &HashSet<String>, after: &ReviewStore) {
    let kept = after.crop_paths();
    let mut removed = 0;
    for path in before.difference(&kept) {
        match async_fs::remove_file(path.replace('\\', "/")).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(crop = %path, "failed to remove superseded crop: {e}"),
        }
    }
    if removed > 0 {
        debug!(removed, "superseded crops removed");
    }
}

impl ReviewRepository for ReviewDb {
    async fn list(&self) -> ReviewResult<ReviewStore> {
        self.read_store().await
    }

    async fn find_detection(&self, key: &DetectionKey) -> ReviewResult<(ImageEntry, DetectionRecord)> {
        let store = self.read_store().await?;
        let (entry, record) = store.find_detection(key)?;
        Ok((entry.clone(), record.clone()))
    }

    async fn upsert_image(&self, entry: ImageEntry) -> ReviewResult<()> {
        let name = entry.uploaded_img.clone();
        self.mutate(|store| {
            store.upsert_image(entry);
            Ok(())
        })
        .await?;
        info!(image = %name, "image entry stored");
        Ok(())
    }

    async fn validate(
        &self,
        key: &DetectionKey,
        decision: Decision,
        correction: Option<&str>,
    ) -> ReviewResult<DetectionRecord> {
        let record = self
            .mutate(|store| store.validate(key, decision, correction, &self.classes))
            .await?;
        info!(detection = %record.detection_id, status = ?record.status, "detection validated");
        Ok(record)
    }

    async fn update_bbox(
        &self,
        uploaded_img: &str,
        key: &DetectionKey,
        bbox: PixelBox,
        defect_type: Option<&str>,
    ) -> ReviewResult<DetectionRecord> {
        let source_size = self.source_size(uploaded_img).await;
        let record = self
            .mutate(|store| {
                if let Some((width, height)) = source_size {
                    store.backfill_size(uploaded_img, width, height);
                }
                store.update_bbox(uploaded_img, key, bbox, defect_type, &self.classes)
            })
            .await?;
        info!(image = %uploaded_img, detection = %record.detection_id, bbox = %record.bbox, "detection updated");
        Ok(record)
    }

    async fn delete(&self, key: &DetectionKey) -> ReviewResult<DetectionRecord> {
        let record = self.mutate(|store| store.delete(key)).await?;
        info!(detection = %record.detection_id, "detection deleted");
        Ok(record)
    }

    async fn apply_bulk(&self, entries: Vec<ImageEntry>, overwrite_corrupt: bool) -> ReviewResult<ReviewStore> {
        let _guard = self.state.write_guard().await;
        let old = match self.state.load().await {
            Ok(loaded) => loaded.store,
            Err(e @ ReviewError::StoreCorrupt { .. }) if overwrite_corrupt => {
                warn!("{e}; replacing it with the bulk results");
                ReviewStore::new()
            }
            Err(e) => return Err(e),
        };

        let before = old.crop_paths();
        let merged = self.state.save(merge(&old, entries)).await?;
        release_crops(&before, &merged).await;
        info!(images = merged.len(), detections = merged.detection_count(), "bulk results merged");
        Ok(merged)
    }
}
