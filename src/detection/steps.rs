use crate::detection::crop::Cropper;
use crate::detection::identity::DetectionId;
use crate::detection::suppression;
use crate::error::{ReviewError, ReviewResult};
use crate::pipeline::{PipelineContext, PipelineData, PipelineStep};
use tracing::warn;

/// Drop near-duplicate boxes, keeping the most confident of each cluster
pub struct OverlapSuppressionStep {
    pub iou_threshold: f32,
}

impl PipelineStep for OverlapSuppressionStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> ReviewResult<Vec<PipelineData>> {
        let raw = data.into_iter().map(|item| item.detection).collect();
        Ok(suppression::suppress(raw, self.iou_threshold)
            .into_iter()
            .map(PipelineData::from_detection)
            .collect())
    }

    fn name(&self) -> &str {
        "Overlap Suppression"
    }
}

/// Give every candidate its permanent identity
pub struct IdentityStep;

impl PipelineStep for IdentityStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> ReviewResult<Vec<PipelineData>> {
        Ok(data
            .into_iter()
            .map(|mut item| {
                item.id.get_or_insert_with(DetectionId::new);
                item
            })
            .collect())
    }

    fn name(&self) -> &str {
        "Identity Assignment"
    }
}

/// Save a review crop for each candidate; candidates with unusable geometry
/// are logged and dropped.
pub struct CropStep {
    pub cropper: Cropper,
}

impl PipelineStep for CropStep {
    fn process(&self, data: Vec<PipelineData>, context: &PipelineContext) -> ReviewResult<Vec<PipelineData>> {
        let mut result = Vec::with_capacity(data.len());
        for mut item in data {
            let id = *item.id.get_or_insert_with(DetectionId::new);
            match self.cropper.crop(
                &context.image,
                &item.detection.bbox,
                &item.detection.class_name,
                &id,
            ) {
                Ok(artifact) => {
                    item.crop = Some(artifact);
                    result.push(item);
                }
                Err(e @ ReviewError::InvalidGeometry(_)) => {
                    warn!(
                        image = %context.image_name,
                        class = %item.detection.class_name,
                        bbox = %item.detection.bbox,
                        "skipping detection: {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "Crop"
    }
}
