use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::Deserialize;
use tracing::info;

use crate::detection::Detector;
use crate::error::{ReviewError, ReviewResult};
use crate::models::{ClassMap, PixelBox, RawDetection};

#[derive(Debug, Deserialize)]
struct SidecarBox {
    class_id: u32,
    #[serde(default)]
    class_name: Option<String>,
    bbox: PixelBox,
    confidence: f32,
}

/// Detector backed by predictions that an external model run wrote next to
/// the corpus: one `<image stem>.json` file per image, each an array of
/// `{class_id, class_name?, bbox: [x1, y1, x2, y2], confidence}`.
#[derive(Debug)]
pub struct SidecarDetector {
    dir: PathBuf,
    classes: ClassMap,
}

impl SidecarDetector {
    /// Fails if the prediction directory does not exist.
    pub fn open(dir: impl Into<PathBuf>, classes: ClassMap) -> ReviewResult<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ReviewError::InvalidConfig(format!(
                "prediction directory {} does not exist",
                dir.display()
            )));
        }
        info!(dir = %dir.display(), classes = classes.len(), "sidecar detector ready");
        Ok(Self { dir, classes })
    }

    fn sidecar_path(&self, image_name: &str) -> PathBuf {
        let stem = Path::new(image_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| image_name.to_string());
        self.dir.join(format!("{stem}.json"))
    }
}

impl Detector for SidecarDetector {
    fn name(&self) -> &str {
        "sidecar"
    }

    fn infer(
        &self,
        _image: &DynamicImage,
        image_name: &str,
        confidence_threshold: f32,
    ) -> ReviewResult<Vec<RawDetection>> {
        let path = self.sidecar_path(image_name);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ReviewError::Detector(format!("no predictions for {image_name} at {}: {e}", path.display()))
        })?;
        let boxes: Vec<SidecarBox> = serde_json::from_str(&contents)
            .map_err(|e| ReviewError::Detector(format!("malformed predictions in {}: {e}", path.display())))?;

        Ok(boxes
            .into_iter()
            .filter(|b| b.confidence >= confidence_threshold)
            .map(|b| {
                let class_name = b
                    .class_name
                    .or_else(|| self.classes.name_of(b.class_id).map(str::to_string))
                    .unwrap_or_else(|| format!("class_{}", b.class_id));
                RawDetection {
                    class_id: b.class_id,
                    class_name,
                    bbox: b.bbox,
                    confidence: b.confidence,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(8, 8)
    }

    fn detector_with(json: &str) -> (TempDir, SidecarDetector) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("leaf.json"), json).unwrap();
        let detector = SidecarDetector::open(dir.path(), ClassMap::new(["BrownSpot", "Browning"])).unwrap();
        (dir, detector)
    }

    #[test]
    fn keeps_boxes_at_or_above_threshold() {
        let (_dir, detector) = detector_with(
            r#"[
                {"class_id": 0, "bbox": [1, 2, 3, 4], "confidence": 0.5},
                {"class_id": 1, "bbox": [5, 6, 7, 8], "confidence": 0.49},
                {"class_id": 1, "bbox": [5, 6, 9, 9], "confidence": 0.8}
            ]"#,
        );
        let found = detector.infer(&blank(), "leaf.jpg", 0.5).unwrap();
        let confidences: Vec<f32> = found.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, [0.5, 0.8]);
        assert_eq!(found[0].bbox, PixelBox::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn class_name_falls_back_to_class_map_then_id() {
        let (_dir, detector) = detector_with(
            r#"[
                {"class_id": 0, "class_name": "Custom", "bbox": [0, 0, 1, 1], "confidence": 0.9},
                {"class_id": 1, "bbox": [0, 0, 1, 1], "confidence": 0.9},
                {"class_id": 7, "bbox": [0, 0, 1, 1], "confidence": 0.9}
            ]"#,
        );
        let names: Vec<String> = detector
            .infer(&blank(), "leaf.jpg", 0.0)
            .unwrap()
            .into_iter()
            .map(|d| d.class_name)
            .collect();
        assert_eq!(names, ["Custom", "Browning", "class_7"]);
    }

    #[test]
    fn malformed_predictions_are_a_detector_error() {
        let (_dir, detector) = detector_with(r#"[{"class_id": "zero"}]"#);
        let result = detector.infer(&blank(), "leaf.jpg", 0.0);
        assert!(matches!(result, Err(ReviewError::Detector(_))));
    }

    #[test]
    fn missing_predictions_are_a_detector_error() {
        let (_dir, detector) = detector_with("[]");
        let result = detector.infer(&blank(), "other.jpg", 0.0);
        assert!(matches!(result, Err(ReviewError::Detector(_))));
    }

    #[test]
    fn open_requires_existing_dir() {
        let dir = TempDir::new().unwrap();
        let result = SidecarDetector::open(dir.path().join("absent"), ClassMap::default());
        assert!(matches!(result, Err(ReviewError::InvalidConfig(_))));
    }
}
