use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::detection::identity::DetectionId;
use crate::error::{ReviewError, ReviewResult};
use crate::models::PixelBox;

const CROP_SUBDIR: &str = "crops";

/// Crop shaping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropParams {
    pub padding: u32,
    pub square: bool,
    pub trim: u32,
}

impl Default for CropParams {
    fn default() -> Self {
        Self {
            padding: 100,
            square: true,
            trim: 20,
        }
    }
}

/// Integer pixel rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropRegion {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn is_square(&self) -> bool {
        self.width() == self.height()
    }
}

/// The padded rectangle (used for naming) and the final cropped rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropGeometry {
    pub padded: CropRegion,
    pub region: CropRegion,
}

/// Compute the crop rectangle for `bbox` inside an `img_width` x `img_height`
/// image.
pub fn crop_region(
    img_width: u32,
    img_height: u32,
    bbox: &PixelBox,
    params: &CropParams,
) -> ReviewResult<CropGeometry> {
    bbox.validate_within(img_width, img_height)?;

    let x1 = bbox.x1 as u32;
    let y1 = bbox.y1 as u32;
    let x2 = bbox.x2 as u32;
    let y2 = bbox.y2 as u32;
    if x1 >= x2 || y1 >= y2 {
        return Err(ReviewError::InvalidGeometry(format!(
            "box {bbox} collapses to an empty pixel region"
        )));
    }

    let padded = CropRegion {
        x1: x1.saturating_sub(params.padding),
        y1: y1.saturating_sub(params.padding),
        x2: (x2 + params.padding).min(img_width),
        y2: (y2 + params.padding).min(img_height),
    };

    let mut region = padded;
    if params.square {
        if !region.is_square() {
            let size = region.width().min(region.height());
            let off_x = (region.width() / 2).saturating_sub(size / 2);
            let off_y = (region.height() / 2).saturating_sub(size / 2);
            let sx = (padded.x1 + off_x).min(padded.x2 - size);
            let sy = (padded.y1 + off_y).min(padded.y2 - size);
            region = CropRegion {
                x1: sx,
                y1: sy,
                x2: sx + size,
                y2: sy + size,
            };
        }

        let trim = params.trim;
        if trim > 0 && region.width() > 2 * trim && region.height() > 2 * trim {
            region = CropRegion {
                x1: region.x1 + trim,
                y1: region.y1 + trim,
                x2: region.x2 - trim,
                y2: region.y2 - trim,
            };
        }
    }

    Ok(CropGeometry { padded, region })
}

/// A crop saved to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CropArtifact {
    pub path: PathBuf,
    pub geometry: CropGeometry,
}

/// Cuts padded, squared crops out of source images and stores them under
/// `<crop_dir>/crops/`.
#[derive(Debug, Clone)]
pub struct Cropper {
    params: CropParams,
    crop_dir: PathBuf,
}

impl Cropper {
    pub fn new(crop_dir: impl Into<PathBuf>, params: CropParams) -> Self {
        Self {
            params,
            crop_dir: crop_dir.into(),
        }
    }

    pub fn params(&self) -> &CropParams {
        &self.params
    }

    pub fn crop(
        &self,
        image: &DynamicImage,
        bbox: &PixelBox,
        class_name: &str,
        id: &DetectionId,
    ) -> ReviewResult<CropArtifact> {
        let geometry = crop_region(image.width(), image.height(), bbox, &self.params)?;
        let region = geometry.region;

        let save_dir = self.crop_dir.join(CROP_SUBDIR);
        std::fs::create_dir_all(&save_dir)?;

        let path = save_dir.join(crop_filename(class_name, id, &geometry.padded));
        image
            .crop_imm(region.x1, region.y1, region.width(), region.height())
            .to_rgb8()
            .save(&path)?;

        Ok(CropArtifact { path, geometry })
    }
}

fn crop_filename(class_name: &str, id: &DetectionId, padded: &CropRegion) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}.jpg",
        sanitize(class_name),
        id.short(),
        padded.x1,
        padded.y1,
        padded.x2,
        padded.y2
    )
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

pub fn crop_exists(path: &str) -> bool {
    Path::new(&path.replace('\\', "/")).is_file()
}
