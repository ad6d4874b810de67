use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identity of one detection, assigned once when the record is
/// created and never derived from mutable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(Uuid);

impl DetectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short form used in artifact filenames.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for DetectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DetectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

const CONFIDENCE_SCALE: f64 = 1e10;

/// Legacy key: the confidence scaled to ten decimal places and truncated.
/// Two detections with the same confidence get the same key.
pub fn confidence_key(confidence: f32) -> i64 {
    (confidence as f64 * CONFIDENCE_SCALE) as i64
}
