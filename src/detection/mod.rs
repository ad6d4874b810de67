pub mod annotate;
pub mod bulk;
pub mod crop;
pub mod identity;
pub mod sidecar;
pub mod steps;
pub mod suppression;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use tracing::info;

use crate::config::ReviewConfig;
use crate::error::{ReviewError, ReviewResult};
use crate::models::{DetectionRecord, ImageEntry, RawDetection};
use crate::pipeline::{Pipeline, PipelineContext, PipelineData};

/// The detection model. Implementations are constructed and initialized
/// up front and handed to whatever needs inference.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Predict boxes on `image`, keeping those at or above
    /// `confidence_threshold`. `image_name` is the source file name.
    fn infer(
        &self,
        image: &DynamicImage,
        image_name: &str,
        confidence_threshold: f32,
    ) -> ReviewResult<Vec<RawDetection>>;
}

/// Runs detection on one source image and produces its review entry:
/// crops, annotated image, and fresh unvalidated records.
pub struct ImageProcessor {
    pipeline: Pipeline,
    processed_dir: PathBuf,
    line_width: u32,
}

impl ImageProcessor {
    pub fn new(detector: Arc<dyn Detector>, config: &ReviewConfig) -> Self {
        Self {
            pipeline: build_standard_pipeline(detector, config),
            processed_dir: config.processed_dir.clone(),
            line_width: annotate::DEFAULT_LINE_WIDTH,
        }
    }

    pub fn from_pipeline(pipeline: Pipeline, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            processed_dir: processed_dir.into(),
            line_width: annotate::DEFAULT_LINE_WIDTH,
        }
    }

    pub fn with_line_width(mut self, line_width: u32) -> Self {
        self.line_width = line_width;
        self
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    /// Detect on `image_path`. The annotated image is written to
    /// `processed_name` inside the processed directory, or to
    /// `<stem>_processed.jpg` when no name is given.
    pub fn process(&self, image_path: &Path, processed_name: Option<&str>) -> ReviewResult<ImageEntry> {
        if !image_path.is_file() {
            return Err(ReviewError::ArtifactMissing(image_path.to_path_buf()));
        }
        let image_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ReviewError::ArtifactMissing(image_path.to_path_buf()))?;

        let image = image::open(image_path)?;
        let (width, height) = (image.width(), image.height());
        let context = PipelineContext {
            image: Arc::new(image),
            image_name: image_name.clone(),
        };

        let records: Vec<DetectionRecord> = self
            .pipeline
            .run(&context)?
            .into_iter()
            .map(PipelineData::into_record)
            .collect();

        let processed_name = processed_name
            .map(str::to_string)
            .unwrap_or_else(|| default_processed_name(&image_name));
        std::fs::create_dir_all(&self.processed_dir)?;
        annotate::annotate(&context.image, &records, self.line_width)
            .save(self.processed_dir.join(&processed_name))?;

        info!(
            image = %image_name,
            detections = records.len(),
            processed = %processed_name,
            "image processed"
        );

        Ok(ImageEntry::new(image_name, processed_name)
            .with_size(width, height)
            .with_detections(records))
    }
}

pub fn default_processed_name(image_name: &str) -> String {
    let stem = Path::new(image_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| image_name.to_string());
    format!("{stem}_processed.jpg")
}

/// Build the standard detection pipeline from configuration
pub fn build_standard_pipeline(detector: Arc<dyn Detector>, config: &ReviewConfig) -> Pipeline {
    use crate::detection::crop::Cropper;
    use crate::detection::steps::*;

    Pipeline::new(detector)
        .with_confidence_threshold(config.confidence_threshold)
        .add_step(Arc::new(OverlapSuppressionStep {
            iou_threshold: config.iou_threshold,
        }))
        .add_step(Arc::new(IdentityStep))
        .add_step(Arc::new(CropStep {
            cropper: Cropper::new(&config.processed_dir, config.crop),
        }))
}
