use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed detection key: {0}")]
    InvalidKey(String),

    #[error("key {key} matches {matches} detections")]
    AmbiguousKey { key: String, matches: usize },

    #[error("artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("review store {} is corrupt: {source}", path.display())]
    StoreCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognized decision: {0}")]
    InvalidDecision(String),

    #[error("unknown defect class: {0}")]
    UnknownClass(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("detector failed: {0}")]
    Detector(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ReviewResult<T> = Result<T, ReviewError>;

impl ReviewError {
    /// Stable machine-readable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ReviewError::InvalidGeometry(_) => "InvalidGeometry",
            ReviewError::NotFound(_) => "NotFound",
            ReviewError::InvalidKey(_) => "InvalidKey",
            ReviewError::AmbiguousKey { .. } => "AmbiguousKey",
            ReviewError::ArtifactMissing(_) => "ArtifactMissing",
            ReviewError::StoreCorrupt { .. } => "StoreCorrupt",
            ReviewError::InvalidDecision(_) => "InvalidDecision",
            ReviewError::UnknownClass(_) => "UnknownClass",
            ReviewError::InvalidConfig(_) => "InvalidConfig",
            ReviewError::Detector(_) => "Detector",
            ReviewError::Image(_) => "Image",
            ReviewError::Io(_) => "Io",
            ReviewError::Serialization(_) => "Serialization",
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable failure surfaced to callers of the review API.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: &'static str,
    pub message: String,
}
