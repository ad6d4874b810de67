use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ReviewError, ReviewResult};
use crate::models::{ClassMap, Decision, DetectionKey, DetectionRecord, ImageEntry, PixelBox};

/// The whole review document: one entry per source image, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewStore {
    entries: Vec<ImageEntry>,
}

impl ReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from entries; a later entry replaces an earlier one
    /// with the same `uploaded_img`.
    pub fn from_entries(entries: impl IntoIterator<Item = ImageEntry>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.upsert_image(entry);
        }
        store
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ImageEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn detection_count(&self) -> usize {
        self.entries.iter().map(|e| e.detections.len()).sum()
    }

    pub fn get_image(&self, uploaded_img: &str) -> Option<&ImageEntry> {
        self.entries.iter().find(|e| e.uploaded_img == uploaded_img)
    }

    /// Insert `entry`, or replace the entry for the same source image in place.
    pub fn upsert_image(&mut self, mut entry: ImageEntry) {
        entry.recount();
        match self
            .entries
            .iter_mut()
            .find(|e| e.uploaded_img == entry.uploaded_img)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Drop records whose crop artifact no longer exists. Records without a
    /// crop path are kept. Returns the number of records dropped.
    pub fn prune_orphans(&mut self, crop_exists: impl Fn(&str) -> bool) -> usize {
        let mut dropped = 0;
        for entry in &mut self.entries {
            let before = entry.detections.len();
            entry
                .detections
                .retain(|d| d.crop_path.as_deref().is_none_or(&crop_exists));
            if entry.detections.len() != before {
                dropped += before - entry.detections.len();
                entry.recount();
            }
        }
        dropped
    }

    /// Every crop artifact path referenced by a record.
    pub fn crop_paths(&self) -> HashSet<String> {
        self.entries
            .iter()
            .flat_map(|e| e.detections.iter())
            .filter_map(|d| d.crop_path.clone())
            .collect()
    }

    /// Record the source image size on an entry that has none.
    pub fn backfill_size(&mut self, uploaded_img: &str, width: u32, height: u32) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.uploaded_img == uploaded_img && e.size().is_none())
        {
            entry.width = Some(width);
            entry.height = Some(height);
        }
    }

    pub fn recount_all(&mut self) {
        for entry in &mut self.entries {
            entry.recount();
        }
    }

    /// Position of the single record matching `key`.
    fn locate(&self, key: &DetectionKey) -> ReviewResult<(usize, usize)> {
        let hits: Vec<(usize, usize)> = self
            .entries
            .iter()
            .enumerate()
            .flat_map(|(i, entry)| {
                entry
                    .detections
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| key.matches(d))
                    .map(move |(j, _)| (i, j))
            })
            .collect();

        match hits.as_slice() {
            [] => Err(ReviewError::NotFound(format!("detection {key}"))),
            [single] => Ok(*single),
            many => Err(ReviewError::AmbiguousKey {
                key: key.to_string(),
                matches: many.len(),
            }),
        }
    }

    /// Every record matching `key`, in document order.
    pub fn matches(&self, key: &DetectionKey) -> Vec<(&ImageEntry, &DetectionRecord)> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry
                    .detections
                    .iter()
                    .filter(|d| key.matches(d))
                    .map(move |d| (entry, d))
            })
            .collect()
    }

    /// The record addressed by `key` and its image. A key matching more than
    /// one record is an error rather than a silent first-match.
    pub fn find_detection(&self, key: &DetectionKey) -> ReviewResult<(&ImageEntry, &DetectionRecord)> {
        let (i, j) = self.locate(key)?;
        let entry = &self.entries[i];
        Ok((entry, &entry.detections[j]))
    }

    /// Apply a reviewer decision. With [`Decision::Other`] a supplied
    /// `correction` relabels the record, keeping id and label in step.
    pub fn validate(
        &mut self,
        key: &DetectionKey,
        decision: Decision,
        correction: Option<&str>,
        classes: &ClassMap,
    ) -> ReviewResult<DetectionRecord> {
        let (i, j) = self.locate(key)?;
        let relabel = match (decision, correction) {
            (Decision::Other, Some(name)) => Some((classes.id_of(name)?, name)),
            _ => None,
        };

        let record = &mut self.entries[i].detections[j];
        record.status = decision.status();
        if let Some((defect_id, name)) = relabel {
            record.defect_id = defect_id;
            record.defect_type = name.to_string();
        }
        Ok(record.clone())
    }

    /// Replace a record's box, and optionally its class, within one image.
    pub fn update_bbox(
        &mut self,
        uploaded_img: &str,
        key: &DetectionKey,
        bbox: PixelBox,
        defect_type: Option<&str>,
        classes: &ClassMap,
    ) -> ReviewResult<DetectionRecord> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.uploaded_img == uploaded_img)
            .ok_or_else(|| ReviewError::NotFound(format!("image {uploaded_img}")))?;

        let positions: Vec<usize> = entry
            .detections
            .iter()
            .enumerate()
            .filter(|(_, d)| key.matches(d))
            .map(|(j, _)| j)
            .collect();
        let j = match positions.as_slice() {
            [] => {
                return Err(ReviewError::NotFound(format!(
                    "detection {key} in image {uploaded_img}"
                )));
            }
            [single] => *single,
            many => {
                return Err(ReviewError::AmbiguousKey {
                    key: key.to_string(),
                    matches: many.len(),
                });
            }
        };

        match entry.size() {
            Some((width, height)) => bbox.validate_within(width, height)?,
            None => bbox.validate()?,
        }
        let relabel = defect_type
            .map(|name| classes.id_of(name).map(|id| (id, name)))
            .transpose()?;

        let record = &mut entry.detections[j];
        record.bbox = bbox;
        if let Some((defect_id, name)) = relabel {
            record.defect_id = defect_id;
            record.defect_type = name.to_string();
        }
        Ok(record.clone())
    }

    /// Remove the record addressed by `key`.
    pub fn delete(&mut self, key: &DetectionKey) -> ReviewResult<DetectionRecord> {
        let (i, j) = self.locate(key)?;
        let entry = &mut self.entries[i];
        let removed = entry.detections.remove(j);
        entry.recount();
        Ok(removed)
    }
}
