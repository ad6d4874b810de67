pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod models;
pub mod pipeline;

pub use crate::config::{ConfigArgs, ReviewConfig};
pub use crate::core::store::{ReviewDb, ReviewRepository, ReviewStore};
pub use crate::detection::{Detector, ImageProcessor};
pub use crate::error::{Failure, ReviewError, ReviewResult};
pub use crate::models::{ClassMap, Decision, DetectionKey, DetectionRecord, ImageEntry, PixelBox, RawDetection, ReviewStatus};
pub use crate::pipeline::{Pipeline, PipelineContext, PipelineData, PipelineStep};
