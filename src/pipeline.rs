use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

use crate::detection::Detector;
use crate::detection::crop::CropArtifact;
use crate::detection::identity::{DetectionId, confidence_key};
use crate::error::ReviewResult;
use crate::models::{DetectionRecord, RawDetection, ReviewStatus};

/// Data that flows through the pipeline.
/// Each PipelineData is one candidate detection on the current image.
#[derive(Debug, Clone)]
pub struct PipelineData {
    pub detection: RawDetection,

    /// Set by the identity step.
    pub id: Option<DetectionId>,

    /// Set by the crop step.
    pub crop: Option<CropArtifact>,
}

impl PipelineData {
    pub fn from_detection(detection: RawDetection) -> Self {
        Self {
            detection,
            id: None,
            crop: None,
        }
    }

    /// Turn a finished candidate into a fresh, unreviewed record.
    pub fn into_record(self) -> DetectionRecord {
        DetectionRecord {
            detection_id: self.id.unwrap_or_default(),
            defect_id: self.detection.class_id,
            defect_type: self.detection.class_name,
            confidence_key: confidence_key(self.detection.confidence),
            bbox: self.detection.bbox,
            status: ReviewStatus::Unvalidated,
            crop_path: self
                .crop
                .map(|c| c.path.to_string_lossy().replace('\\', "/")),
        }
    }
}

/// Context available to all pipeline steps
#[derive(Clone)]
pub struct PipelineContext {
    /// Source image, shared across steps
    pub image: Arc<DynamicImage>,
    /// File name of the source image
    pub image_name: String,
}

/// Trait that all pipeline steps must implement
pub trait PipelineStep: Send + Sync {
    /// Process candidates and return the survivors.
    /// A step may drop candidates, but a failure on one candidate must not
    /// fail the whole batch.
    fn process(&self, data: Vec<PipelineData>, context: &PipelineContext) -> ReviewResult<Vec<PipelineData>>;

    /// Human-readable name for this step (used in logs)
    fn name(&self) -> &str;
}

/// Composable pipeline: model inference followed by post-processing steps.
pub struct Pipeline {
    detector: Arc<dyn Detector>,
    confidence_threshold: f32,
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self {
            detector,
            confidence_threshold: 0.5,
            steps: Vec::new(),
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Add a processing step to the pipeline
    pub fn add_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Helper method to add a step from a Box (for convenience)
    pub fn add_step_boxed(mut self, step: Box<dyn PipelineStep>) -> Self {
        self.steps.push(Arc::from(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run inference on the context image, then every step in order.
    pub fn run(&self, context: &PipelineContext) -> ReviewResult<Vec<PipelineData>> {
        let raw = self.detector.infer(
            &context.image,
            &context.image_name,
            self.confidence_threshold,
        )?;
        debug!(
            image = %context.image_name,
            detector = self.detector.name(),
            count = raw.len(),
            "inference finished"
        );

        let mut data: Vec<PipelineData> = raw.into_iter().map(PipelineData::from_detection).collect();

        for step in &self.steps {
            let before = data.len();
            data = step.process(data, context)?;
            debug!(
                image = %context.image_name,
                step = step.name(),
                before,
                after = data.len(),
                "step finished"
            );
        }

        Ok(data)
    }
}
