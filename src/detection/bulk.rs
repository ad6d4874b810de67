use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::store::ReviewStore;
use crate::detection::ImageProcessor;
use crate::error::{Failure, ReviewError, ReviewResult};
use crate::models::ImageEntry;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// An image the bulk run could not process.
#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub image: String,
    #[serde(flatten)]
    pub failure: Failure,
}

/// Fresh entries from a bulk run, before reconciliation with the store.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub entries: Vec<ImageEntry>,
    pub failures: Vec<BulkFailure>,
    /// True when the run stopped early; `entries` holds the images finished
    /// before that point.
    pub cancelled: bool,
}

/// Source images in `dir`, sorted by file name.
pub fn list_source_images(dir: &Path) -> ReviewResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ReviewError::ArtifactMissing(dir.to_path_buf()));
    }
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();
    images.sort();
    Ok(images)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Run detection over every image in `source_dir`.
///
/// Per-image failures are logged and collected, never fatal. The token is
/// checked between images. Annotated-image filenames already recorded in
/// `previous` are reused.
pub fn run_bulk(
    processor: &ImageProcessor,
    source_dir: &Path,
    previous: &ReviewStore,
    cancel: &CancellationToken,
) -> ReviewResult<BulkOutcome> {
    let images = list_source_images(source_dir)?;
    info!(dir = %source_dir.display(), images = images.len(), "bulk detection started");

    let mut outcome = BulkOutcome::default();
    for path in images {
        if cancel.is_cancelled() {
            warn!(done = outcome.entries.len(), "bulk detection cancelled");
            outcome.cancelled = true;
            break;
        }

        let image_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let processed_name = previous
            .get_image(&image_name)
            .map(|e| e.processed_img.as_str())
            .filter(|name| !name.is_empty());

        match processor.process(&path, processed_name) {
            Ok(entry) => outcome.entries.push(entry),
            Err(e) => {
                error!(image = %image_name, kind = e.kind(), "failed to process image: {e}");
                outcome.failures.push(BulkFailure {
                    image: image_name,
                    failure: e.to_failure(),
                });
            }
        }
    }

    info!(
        processed = outcome.entries.len(),
        failed = outcome.failures.len(),
        cancelled = outcome.cancelled,
        "bulk detection finished"
    );
    Ok(outcome)
}
