//! Conversion of the review store into a YOLO-style training dataset.

use std::{
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use serde::Serialize;
use tar::Builder;
use tracing::{info, warn};
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::core::store::ReviewStore;
use crate::error::{ReviewError, ReviewResult};
use crate::models::{ClassMap, DetectionRecord, ReviewStatus};

const MANIFEST_FILE_NAME: &str = "manifest.json";
const DATA_YAML_FILE_NAME: &str = "data.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

/// Train/validation/test fractions; they must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitRatio {
    pub train: f64,
    pub valid: f64,
    pub test: f64,
}

impl SplitRatio {
    pub fn new(train: f64, valid: f64, test: f64) -> ReviewResult<Self> {
        let parts = [train, valid, test];
        if parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ReviewError::InvalidConfig(format!(
                "split fractions must be non-negative, got {train}/{valid}/{test}"
            )));
        }
        if (parts.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(ReviewError::InvalidConfig(format!(
                "split fractions must sum to 1, got {train}/{valid}/{test}"
            )));
        }
        Ok(Self { train, valid, test })
    }

    /// Split of each of `n` ordered items: the first `floor(n * train)` go to
    /// train, the next `floor(n * valid)` to valid, the rest to test.
    pub fn assign(&self, n: usize) -> Vec<Split> {
        let train_end = floor_share(n, self.train);
        let valid_end = (train_end + floor_share(n, self.valid)).min(n);
        (0..n)
            .map(|i| {
                if i < train_end {
                    Split::Train
                } else if i < valid_end {
                    Split::Valid
                } else {
                    Split::Test
                }
            })
            .collect()
    }
}

fn floor_share(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction) + 1e-9).floor() as usize
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            train: 0.7,
            valid: 0.2,
            test: 0.1,
        }
    }
}

/// Parses `70/20/10` (percentages) or `0.7/0.2/0.1` (fractions).
impl FromStr for SplitRatio {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split('/')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| ReviewError::InvalidConfig(format!("malformed split ratio '{s}'")))?;
        let &[train, valid, test] = parts.as_slice() else {
            return Err(ReviewError::InvalidConfig(format!(
                "split ratio '{s}' needs three parts"
            )));
        };
        if train + valid + test > 1.0 + 1e-6 {
            Self::new(train / 100.0, valid / 100.0, test / 100.0)
        } else {
            Self::new(train, valid, test)
        }
    }
}

impl fmt::Display for SplitRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.train, self.valid, self.test)
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub split: SplitRatio,
    /// Leave out records the reviewer marked healthy.
    pub exclude_healthy: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            split: SplitRatio::default(),
            exclude_healthy: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SplitSummary {
    pub images_dir: String,
    pub labels_dir: String,
    pub images: Vec<String>,
}

/// Description of a finished export, also written as `manifest.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub class_names: Vec<String>,
    pub split_ratio: SplitRatio,
    pub train: SplitSummary,
    pub valid: SplitSummary,
    pub test: SplitSummary,
    pub labels_written: usize,
    /// Source images that were missing or unreadable and were skipped.
    pub skipped: Vec<String>,
    pub data_yaml: String,
}

impl ExportManifest {
    pub fn split(&self, split: Split) -> &SplitSummary {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }

    fn split_mut(&mut self, split: Split) -> &mut SplitSummary {
        match split {
            Split::Train => &mut self.train,
            Split::Valid => &mut self.valid,
            Split::Test => &mut self.test,
        }
    }
}

/// One label line: `class cx cy w h`, normalized by the image size.
pub fn label_line(record: &DetectionRecord, width: u32, height: u32) -> String {
    let (w, h) = (width as f64, height as f64);
    let b = record.bbox;
    let (x1, y1, x2, y2) = (b.x1 as f64, b.y1 as f64, b.x2 as f64, b.y2 as f64);
    format!(
        "{} {:.6} {:.6} {:.6} {:.6}",
        record.defect_id,
        ((x1 + x2) / 2.0) / w,
        ((y1 + y2) / 2.0) / h,
        (x2 - x1) / w,
        (y2 - y1) / h
    )
}

/// Write the store as a dataset under `output_dir`.
///
/// Entries whose source image is missing from `source_dir` or cannot be
/// decoded are skipped. The remaining entries are split in store order.
/// Image sizes come from the image files, not from the store.
pub fn export(
    store: &ReviewStore,
    source_dir: &Path,
    output_dir: &Path,
    classes: &ClassMap,
    options: &ExportOptions,
) -> ReviewResult<ExportManifest> {
    for split in Split::ALL {
        fs::create_dir_all(output_dir.join(split.dir_name()).join("images"))?;
        fs::create_dir_all(output_dir.join(split.dir_name()).join("labels"))?;
    }

    let mut manifest = ExportManifest {
        class_names: classes.names().to_vec(),
        split_ratio: options.split,
        train: SplitSummary::default(),
        valid: SplitSummary::default(),
        test: SplitSummary::default(),
        labels_written: 0,
        skipped: Vec::new(),
        data_yaml: DATA_YAML_FILE_NAME.to_string(),
    };
    for split in Split::ALL {
        let summary = manifest.split_mut(split);
        summary.images_dir = format!("{}/images", split.dir_name());
        summary.labels_dir = format!("{}/labels", split.dir_name());
    }

    let mut resolvable = Vec::with_capacity(store.len());
    for entry in store.entries() {
        let src = source_dir.join(&entry.uploaded_img);
        if !src.is_file() {
            warn!(image = %entry.uploaded_img, "source image missing, skipping");
            manifest.skipped.push(entry.uploaded_img.clone());
            continue;
        }
        match image::image_dimensions(&src) {
            Ok((width, height)) => resolvable.push((entry, src, width, height)),
            Err(e) => {
                warn!(image = %entry.uploaded_img, "source image unreadable, skipping: {e}");
                manifest.skipped.push(entry.uploaded_img.clone());
            }
        }
    }

    let splits = options.split.assign(resolvable.len());
    for ((entry, src, width, height), split) in resolvable.into_iter().zip(splits) {
        let split_dir = output_dir.join(split.dir_name());

        fs::copy(&src, split_dir.join("images").join(&entry.uploaded_img))?;

        let stem = Path::new(&entry.uploaded_img)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.uploaded_img.clone());
        let label_path = split_dir.join("labels").join(format!("{stem}.txt"));
        let mut writer = BufWriter::new(File::create(&label_path)?);
        for record in entry
            .detections
            .iter()
            .filter(|d| !(options.exclude_healthy && d.status == ReviewStatus::Healthy))
        {
            writeln!(writer, "{}", label_line(record, width, height))?;
            manifest.labels_written += 1;
        }
        writer.flush()?;

        manifest.split_mut(split).images.push(entry.uploaded_img.clone());
    }

    write_data_yaml(output_dir, classes)?;
    let manifest_file = File::create(output_dir.join(MANIFEST_FILE_NAME))?;
    serde_json::to_writer_pretty(BufWriter::new(manifest_file), &manifest)?;

    info!(
        out = %output_dir.display(),
        train = manifest.train.images.len(),
        valid = manifest.valid.images.len(),
        test = manifest.test.images.len(),
        skipped = manifest.skipped.len(),
        labels = manifest.labels_written,
        "dataset exported"
    );
    Ok(manifest)
}

fn write_data_yaml(output_dir: &Path, classes: &ClassMap) -> ReviewResult<()> {
    let names: Vec<String> = classes.names().iter().map(|n| yaml_single_quoted(n)).collect();
    let yaml = format!(
        "train: ../train/images\nval: ../valid/images\ntest: ../test/images\n\nnc: {}\nnames: [{}]\n",
        classes.len(),
        names.join(", ")
    );
    fs::write(output_dir.join(DATA_YAML_FILE_NAME), yaml)?;
    Ok(())
}

fn yaml_single_quoted(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// Pack an export directory into `<dir>.tar.zst` next to it.
pub fn archive(export_dir: &Path) -> anyhow::Result<PathBuf> {
    let archive_path = export_dir.with_extension("tar.zst");

    let out = File::create(&archive_path)
        .with_context(|| format!("Failed to create export archive {:?}", archive_path))?;

    // zstd encoder wrapping the output file
    let encoder = ZstdEncoder::new(out, 3)
        .with_context(|| format!("Failed to create zstd encoder for {:?}", archive_path))?;

    // tar builder wrapping the encoder
    let mut tar = Builder::new(encoder);

    tar.append_dir_all(".", export_dir)
        .with_context(|| format!("Failed to add {:?} to tar", export_dir))?;

    // Finish tar, then finish zstd stream
    let encoder = tar
        .into_inner()
        .with_context(|| format!("Failed to finalize tar for {:?}", archive_path))?;

    encoder
        .finish()
        .with_context(|| format!("Failed to finalize zstd stream for {:?}", archive_path))?;

    info!(archive = %archive_path.display(), "export archived");
    Ok(archive_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::identity::DetectionId;
    use crate::models::PixelBox;

    #[test]
    fn default_split_populates_all_three() {
        let splits = SplitRatio::default().assign(10);
        let count = |s| splits.iter().filter(|x| **x == s).count();
        assert_eq!(count(Split::Train), 7);
        assert_eq!(count(Split::Valid), 2);
        assert_eq!(count(Split::Test), 1);
        assert_eq!(splits[0], Split::Train);
        assert_eq!(splits[9], Split::Test);
    }

    #[test]
    fn split_ratio_parses_percentages_and_fractions() {
        assert_eq!("70/20/10".parse::<SplitRatio>().unwrap(), SplitRatio::default());
        assert_eq!("0.7/0.2/0.1".parse::<SplitRatio>().unwrap(), SplitRatio::default());
        assert!("80/30/10".parse::<SplitRatio>().is_err());
        assert!("70/30".parse::<SplitRatio>().is_err());
    }

    #[test]
    fn label_line_is_normalized() {
        let record = DetectionRecord {
            detection_id: DetectionId::new(),
            defect_id: 3,
            defect_type: "Curling".into(),
            confidence_key: 0,
            bbox: PixelBox::new(100.0, 100.0, 500.0, 500.0),
            status: ReviewStatus::Validated,
            crop_path: None,
        };
        assert_eq!(
            label_line(&record, 4000, 3000),
            "3 0.075000 0.100000 0.100000 0.133333"
        );
    }
}
