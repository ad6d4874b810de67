use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detection::identity::DetectionId;
use crate::error::{ReviewError, ReviewResult};

/// Axis-aligned pixel rectangle, persisted as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection over union. A zero-area union yields 0.
    pub fn iou(&self, other: &PixelBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Rejects non-finite, inverted or degenerate rectangles.
    pub fn validate(&self) -> ReviewResult<()> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(ReviewError::InvalidGeometry(format!(
                "non-finite coordinates in {self}"
            )));
        }
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(ReviewError::InvalidGeometry(format!(
                "inverted or degenerate box {self}"
            )));
        }
        Ok(())
    }

    /// Like [`PixelBox::validate`], and additionally requires the box to lie
    /// inside a `width` x `height` image.
    pub fn validate_within(&self, width: u32, height: u32) -> ReviewResult<()> {
        self.validate()?;
        if self.x1 < 0.0 || self.y1 < 0.0 || self.x2 > width as f32 || self.y2 > height as f32 {
            return Err(ReviewError::InvalidGeometry(format!(
                "box {self} exceeds image bounds {width}x{height}"
            )));
        }
        Ok(())
    }
}

impl From<[f32; 4]> for PixelBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<PixelBox> for [f32; 4] {
    fn from(b: PixelBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl fmt::Display for PixelBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A single box as produced by the external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    pub class_name: String,
    pub bbox: PixelBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    Unvalidated,
    Validated,
    Healthy,
    Uncertain,
}

/// Reviewer verdict on one detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Correct,
    Healthy,
    Other,
    Uncertain,
}

impl Decision {
    pub fn status(self) -> ReviewStatus {
        match self {
            Decision::Correct => ReviewStatus::Validated,
            Decision::Healthy => ReviewStatus::Healthy,
            Decision::Other => ReviewStatus::Validated,
            Decision::Uncertain => ReviewStatus::Uncertain,
        }
    }
}

impl FromStr for Decision {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "correct" => Ok(Decision::Correct),
            "healthy" => Ok(Decision::Healthy),
            "other" => Ok(Decision::Other),
            "uncertain" => Ok(Decision::Uncertain),
            other => Err(ReviewError::InvalidDecision(other.to_string())),
        }
    }
}

/// Persisted, reviewable detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Per-instance identity. Records written before ids existed receive one
    /// when first loaded; it becomes durable with the next save.
    #[serde(default = "DetectionId::new")]
    pub detection_id: DetectionId,
    /// Class identity, used when reconciling re-runs.
    pub defect_id: u32,
    pub defect_type: String,
    /// Legacy key derived from the raw confidence. Not unique.
    #[serde(rename = "confidence")]
    pub confidence_key: i64,
    pub bbox: PixelBox,
    #[serde(default)]
    pub status: ReviewStatus,
    #[serde(default)]
    pub crop_path: Option<String>,
}

/// One reviewed source image and its detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub uploaded_img: String,
    #[serde(default)]
    pub processed_img: String,
    #[serde(default)]
    pub detections: Vec<DetectionRecord>,
    #[serde(default)]
    pub defect_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ImageEntry {
    pub fn new(uploaded_img: impl Into<String>, processed_img: impl Into<String>) -> Self {
        Self {
            uploaded_img: uploaded_img.into(),
            processed_img: processed_img.into(),
            detections: Vec::new(),
            defect_count: 0,
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_detections(mut self, detections: Vec<DetectionRecord>) -> Self {
        self.detections = detections;
        self.recount();
        self
    }

    pub fn recount(&mut self) {
        self.defect_count = self.detections.len();
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

/// How a mutation addresses a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKey {
    Id(DetectionId),
    /// Confidence-derived key kept for old clients; may collide.
    Legacy(i64),
}

impl DetectionKey {
    pub fn matches(&self, record: &DetectionRecord) -> bool {
        match self {
            DetectionKey::Id(id) => record.detection_id == *id,
            DetectionKey::Legacy(key) => record.confidence_key == *key,
        }
    }
}

impl FromStr for DetectionKey {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<DetectionId>() {
            return Ok(DetectionKey::Id(id));
        }
        s.parse::<i64>()
            .map(DetectionKey::Legacy)
            .map_err(|_| ReviewError::InvalidKey(s.to_string()))
    }
}

impl fmt::Display for DetectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionKey::Id(id) => write!(f, "{id}"),
            DetectionKey::Legacy(key) => write!(f, "confidence:{key}"),
        }
    }
}

/// Ordered class names; the index is the class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    names: Vec<String>,
}

pub const PLANT_DEFECT_CLASSES: [&str; 7] = [
    "BrownSpot",
    "Browning",
    "BurnedTip",
    "Curling",
    "Purpling",
    "Wilting",
    "Yellowing",
];

impl ClassMap {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id_of(&self, name: &str) -> ReviewResult<u32> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u32)
            .ok_or_else(|| ReviewError::UnknownClass(name.to_string()))
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }
}

impl Default for ClassMap {
    fn default() -> Self {
        Self::new(PLANT_DEFECT_CLASSES)
    }
}
