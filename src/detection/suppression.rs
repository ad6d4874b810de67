use crate::models::RawDetection;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;

/// Greedy non-maximum suppression across all classes.
///
/// The highest-confidence remaining detection is kept and every remaining
/// detection whose IoU with it is strictly greater than `iou_threshold` is
/// dropped. A pair sitting exactly at the threshold both survive.
pub fn suppress(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.len() < 2 {
        return detections;
    }

    // Stable sort keeps input order among equal confidences.
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = Vec::with_capacity(detections.len());
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(i);
    }

    let mut slots: Vec<Option<RawDetection>> = detections.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| slots[i].take()).collect()
}
