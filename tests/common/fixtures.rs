use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use defectreview::detection::identity::DetectionId;
use defectreview::{
    ClassMap, Detector, DetectionRecord, ImageEntry, PixelBox, RawDetection, ReviewDb, ReviewResult, ReviewStatus,
};
use image::{DynamicImage, ImageBuffer, Rgb};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

/// Creates a 100x100 red test image and returns the temp file.
/// The file will be automatically cleaned up when dropped.
pub fn create_test_image() -> NamedTempFile {
    let img = ImageBuffer::from_fn(100, 100, |_, _| Rgb([255u8, 0u8, 0u8]));
    let file = tempfile::Builder::new()
        .suffix(".png")
        .tempfile()
        .expect("Failed to create temp image file");
    img.save_with_format(file.path(), image::ImageFormat::Png)
        .expect("Failed to save test image");
    file
}

/// Writes a solid green image of the given size into `dir`.
pub fn write_test_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let img = ImageBuffer::from_fn(width, height, |_, _| Rgb([40u8, 160u8, 60u8]));
    let path = dir.join(name);
    img.save(&path).expect("Failed to save test image");
    path
}

/// Creates a ReviewDb backed by a store file in a fresh temp directory.
/// Returns both the db and the temp directory (which must be kept alive).
pub fn create_test_db() -> (ReviewDb, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let db = ReviewDb::new(dir.path().join("detection_metadata.json"), ClassMap::default());
    (db, dir)
}

pub fn raw(class_id: u32, class_name: &str, bbox: [f32; 4], confidence: f32) -> RawDetection {
    RawDetection {
        class_id,
        class_name: class_name.to_string(),
        bbox: bbox.into(),
        confidence,
    }
}

/// A stored record with no crop, so orphan pruning leaves it alone.
pub fn make_record(defect_id: u32, defect_type: &str, confidence_key: i64, bbox: [f32; 4]) -> DetectionRecord {
    DetectionRecord {
        detection_id: DetectionId::new(),
        defect_id,
        defect_type: defect_type.to_string(),
        confidence_key,
        bbox: PixelBox::from(bbox),
        status: ReviewStatus::Unvalidated,
        crop_path: None,
    }
}

pub fn make_entry(image: &str, records: Vec<DetectionRecord>) -> ImageEntry {
    ImageEntry::new(image, format!("{}_processed.jpg", image.trim_end_matches(".jpg")))
        .with_size(4000, 3000)
        .with_detections(records)
}

/// Detector that returns canned predictions per image name. Optionally
/// cancels a token after a number of calls.
#[derive(Default)]
pub struct ScriptedDetector {
    predictions: HashMap<String, Vec<RawDetection>>,
    calls: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, image_name: &str, detections: Vec<RawDetection>) -> Self {
        self.predictions.insert(image_name.to_string(), detections);
        self
    }

    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn infer(
        &self,
        _image: &DynamicImage,
        image_name: &str,
        confidence_threshold: f32,
    ) -> ReviewResult<Vec<RawDetection>> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if calls >= *limit {
                token.cancel();
            }
        }
        Ok(self
            .predictions
            .get(image_name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}
