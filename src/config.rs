use std::path::PathBuf;

use clap::Args;

use crate::core::export::SplitRatio;
use crate::detection::crop::CropParams;
use crate::detection::suppression::DEFAULT_IOU_THRESHOLD;
use crate::error::{ReviewError, ReviewResult};
use crate::models::{ClassMap, PLANT_DEFECT_CLASSES};

/// Resolved settings shared by detection, review and export.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Source images
    pub upload_dir: PathBuf,
    /// Annotated images and crops
    pub processed_dir: PathBuf,
    /// The review document
    pub store_path: PathBuf,
    /// Parent of export directories
    pub export_root: PathBuf,
    /// Model predictions, one JSON file per image
    pub predictions_dir: PathBuf,
    pub crop: CropParams,
    pub iou_threshold: f32,
    pub confidence_threshold: f32,
    pub split: SplitRatio,
    pub classes: ClassMap,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploaded_img"),
            processed_dir: PathBuf::from("processed_img"),
            store_path: PathBuf::from("processed_img/detection_metadata.json"),
            export_root: PathBuf::from("yolov11"),
            predictions_dir: PathBuf::from("predictions"),
            crop: CropParams::default(),
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            confidence_threshold: 0.5,
            split: SplitRatio::default(),
            classes: ClassMap::default(),
        }
    }
}

impl ReviewConfig {
    pub fn validate(&self) -> ReviewResult<()> {
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ReviewError::InvalidConfig(format!(
                "IoU threshold {} outside [0, 1]",
                self.iou_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ReviewError::InvalidConfig(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.classes.is_empty() {
            return Err(ReviewError::InvalidConfig("no defect classes configured".into()));
        }
        Ok(())
    }
}

/// Command-line / environment configuration.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory of source images
    #[arg(long, env = "DEFECTREVIEW_UPLOAD_DIR", default_value = "uploaded_img")]
    pub upload_dir: PathBuf,

    /// Directory for annotated images and crops
    #[arg(long, env = "DEFECTREVIEW_PROCESSED_DIR", default_value = "processed_img")]
    pub processed_dir: PathBuf,

    /// Review document path (defaults to <processed-dir>/detection_metadata.json)
    #[arg(long, env = "DEFECTREVIEW_STORE")]
    pub store: Option<PathBuf>,

    /// Parent directory for dataset exports
    #[arg(long, env = "DEFECTREVIEW_EXPORT_ROOT", default_value = "yolov11")]
    pub export_root: PathBuf,

    /// Directory of per-image prediction files
    #[arg(long, env = "DEFECTREVIEW_PREDICTIONS_DIR", default_value = "predictions")]
    pub predictions_dir: PathBuf,

    /// Padding added around each box before cropping
    #[arg(long, env = "DEFECTREVIEW_CROP_PADDING", default_value_t = 100)]
    pub crop_padding: u32,

    /// Keep crops rectangular instead of squaring them
    #[arg(long)]
    pub no_square: bool,

    /// Border trimmed from square crops
    #[arg(long, env = "DEFECTREVIEW_CROP_TRIM", default_value_t = 20)]
    pub crop_trim: u32,

    /// Overlap above which the weaker of two boxes is dropped
    #[arg(long, env = "DEFECTREVIEW_IOU_THRESHOLD", default_value_t = DEFAULT_IOU_THRESHOLD)]
    pub iou_threshold: f32,

    /// Minimum model confidence
    #[arg(long, env = "DEFECTREVIEW_CONFIDENCE", default_value_t = 0.5)]
    pub confidence: f32,

    /// Train/valid/test split, e.g. 70/20/10
    #[arg(long, env = "DEFECTREVIEW_SPLIT", default_value = "70/20/10")]
    pub split: String,

    /// Comma-separated class names; position is the class id
    #[arg(long, env = "DEFECTREVIEW_CLASSES", value_delimiter = ',')]
    pub classes: Vec<String>,
}

impl ConfigArgs {
    pub fn into_config(self) -> ReviewResult<ReviewConfig> {
        let store_path = self
            .store
            .unwrap_or_else(|| self.processed_dir.join("detection_metadata.json"));
        let classes = if self.classes.is_empty() {
            ClassMap::new(PLANT_DEFECT_CLASSES)
        } else {
            ClassMap::new(self.classes)
        };

        let config = ReviewConfig {
            upload_dir: self.upload_dir,
            processed_dir: self.processed_dir,
            store_path,
            export_root: self.export_root,
            predictions_dir: self.predictions_dir,
            crop: CropParams {
                padding: self.crop_padding,
                square: !self.no_square,
                trim: self.crop_trim,
            },
            iou_threshold: self.iou_threshold,
            confidence_threshold: self.confidence,
            split: self.split.parse()?,
            classes,
        };
        config.validate()?;
        Ok(config)
    }
}
