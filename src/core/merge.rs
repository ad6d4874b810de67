//! Reconciliation of a fresh detection run with the reviewed store.
//!
//! New records are matched to prior ones by class (`defect_id`), not by
//! per-instance identity: a re-run produces new boxes with new ids, so the
//! class is the only thing that survives. When several prior records share a
//! class, the last one in document order supplies the status.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::core::store::ReviewStore;
use crate::models::{ImageEntry, ReviewStatus};

/// Merge `new_entries` into `old`.
///
/// Every new entry replaces the stored entry for the same image, with prior
/// statuses carried onto new records of the same class; unmatched records
/// stay `unvalidated`. Images present only in `old` are kept unchanged after
/// the new entries, in their original order.
pub fn merge(old: &ReviewStore, new_entries: Vec<ImageEntry>) -> ReviewStore {
    let mut merged: Vec<ImageEntry> = Vec::with_capacity(new_entries.len() + old.len());
    let mut seen: HashSet<String> = HashSet::new();

    for mut entry in new_entries {
        let statuses: HashMap<u32, ReviewStatus> = old
            .get_image(&entry.uploaded_img)
            .map(|prior| prior.detections.iter().map(|d| (d.defect_id, d.status)).collect())
            .unwrap_or_default();

        let mut carried = 0;
        for record in &mut entry.detections {
            record.status = match statuses.get(&record.defect_id) {
                Some(status) => {
                    carried += 1;
                    *status
                }
                None => ReviewStatus::Unvalidated,
            };
        }
        if carried > 0 {
            debug!(image = %entry.uploaded_img, carried, "carried review statuses forward");
        }
        seen.insert(entry.uploaded_img.clone());
        merged.push(entry);
    }

    merged.extend(
        old.entries()
            .iter()
            .filter(|e| !seen.contains(&e.uploaded_img))
            .cloned(),
    );

    ReviewStore::from_entries(merged)
}
