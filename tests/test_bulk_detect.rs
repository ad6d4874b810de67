//! Integration tests for detection and bulk re-detection.
//!
//! Tests cover:
//! - Single-image processing: crops, annotated image, fresh records
//! - Crops of replaced or deleted records are removed
//! - Skipping boxes whose geometry cannot be cropped
//! - Collecting per-image failures without aborting the run
//! - Cancellation between images
//! - Reconciling a bulk run with prior review statuses

mod common;

use std::path::Path;

use common::*;
use defectreview::detection::bulk::{list_source_images, run_bulk};
use defectreview::detection::crop::crop_exists;
use defectreview::{
    Decision, DetectionKey, ImageEntry, ImageProcessor, ReviewConfig, ReviewDb, ReviewError, ReviewRepository,
    ReviewStatus, ReviewStore,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn test_config(root: &Path) -> ReviewConfig {
    ReviewConfig {
        upload_dir: root.join("uploaded_img"),
        processed_dir: root.join("processed_img"),
        store_path: root.join("processed_img").join("detection_metadata.json"),
        ..ReviewConfig::default()
    }
}

fn setup() -> (TempDir, ReviewConfig) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.upload_dir).expect("Failed to create upload dir");
    (dir, config)
}

#[tokio::test]
async fn test_process_single_image() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    let image = write_test_image(&config.upload_dir, "leaf1.jpg", 400, 300);

    let detector = ScriptedDetector::new()
        .with(
            "leaf1.jpg",
            vec![
                raw(0, "BrownSpot", [10.0, 10.0, 60.0, 60.0], 0.9),
                // Overlaps the first heavily and is less confident
                raw(1, "Browning", [12.0, 12.0, 62.0, 62.0], 0.7),
                raw(6, "Yellowing", [200.0, 100.0, 300.0, 200.0], 0.8),
                // Below the confidence threshold
                raw(3, "Curling", [300.0, 10.0, 350.0, 60.0], 0.3),
            ],
        )
        .into_arc();
    let processor = ImageProcessor::new(detector, &config);

    let entry = processor.process(&image, None)?;
    assert_eq!(entry.uploaded_img, "leaf1.jpg");
    assert_eq!(entry.processed_img, "leaf1_processed.jpg");
    assert_eq!(entry.size(), Some((400, 300)));
    assert_eq!(entry.defect_count, 2);
    assert!(config.processed_dir.join("leaf1_processed.jpg").is_file());

    let classes: Vec<&str> = entry.detections.iter().map(|d| d.defect_type.as_str()).collect();
    assert_eq!(classes, ["BrownSpot", "Yellowing"]);
    for record in &entry.detections {
        assert_eq!(record.status, ReviewStatus::Unvalidated);
        let crop = record.crop_path.as_deref().expect("crop written");
        assert!(crop_exists(crop));
    }
    assert_ne!(entry.detections[0].detection_id, entry.detections[1].detection_id);

    Ok(())
}

#[tokio::test]
async fn test_uncroppable_boxes_are_skipped() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    let image = write_test_image(&config.upload_dir, "leaf1.jpg", 400, 300);

    let detector = ScriptedDetector::new()
        .with(
            "leaf1.jpg",
            vec![
                raw(0, "BrownSpot", [10.0, 10.0, 60.0, 60.0], 0.9),
                raw(1, "Browning", [150.0, 150.0, 100.0, 100.0], 0.8),
                raw(2, "BurnedTip", [350.0, 250.0, 450.0, 350.0], 0.8),
            ],
        )
        .into_arc();
    let processor = ImageProcessor::new(detector, &config);

    let entry = processor.process(&image, None)?;
    assert_eq!(entry.defect_count, 1);
    assert_eq!(entry.detections[0].defect_type, "BrownSpot");

    Ok(())
}

#[tokio::test]
async fn test_missing_image_is_reported() {
    let (_dir, config) = setup();
    let processor = ImageProcessor::new(ScriptedDetector::new().into_arc(), &config);

    let result = processor.process(&config.upload_dir.join("nope.jpg"), None);
    assert!(matches!(result, Err(ReviewError::ArtifactMissing(_))));
}

#[tokio::test]
async fn test_bulk_collects_failures() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    write_test_image(&config.upload_dir, "a.jpg", 200, 200);
    write_test_image(&config.upload_dir, "c.png", 200, 200);
    std::fs::write(config.upload_dir.join("b.jpg"), b"not an image")?;
    std::fs::write(config.upload_dir.join("notes.txt"), b"ignored")?;

    let detector = ScriptedDetector::new()
        .with("a.jpg", vec![raw(0, "BrownSpot", [10.0, 10.0, 60.0, 60.0], 0.9)])
        .with("c.png", vec![raw(4, "Purpling", [50.0, 50.0, 90.0, 90.0], 0.9)])
        .into_arc();
    let processor = ImageProcessor::new(detector.clone(), &config);

    let images = list_source_images(&config.upload_dir)?;
    assert_eq!(images.len(), 3);

    let outcome = run_bulk(&processor, &config.upload_dir, &ReviewStore::new(), &CancellationToken::new())?;
    assert!(!outcome.cancelled);
    let names: Vec<&str> = outcome.entries.iter().map(|e| e.uploaded_img.as_str()).collect();
    assert_eq!(names, ["a.jpg", "c.png"]);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].image, "b.jpg");
    assert_eq!(outcome.failures[0].failure.kind, "Image");
    assert_eq!(detector.calls(), 2);

    Ok(())
}

#[tokio::test]
async fn test_bulk_stops_when_cancelled() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    for name in ["a.jpg", "b.jpg", "c.jpg"] {
        write_test_image(&config.upload_dir, name, 200, 200);
    }

    let cancel = CancellationToken::new();
    let detector = ScriptedDetector::new()
        .cancel_after(1, cancel.clone())
        .into_arc();
    let processor = ImageProcessor::new(detector.clone(), &config);

    let outcome = run_bulk(&processor, &config.upload_dir, &ReviewStore::new(), &cancel)?;
    assert!(outcome.cancelled);
    assert_eq!(outcome.entries.len(), 1);
    assert_eq!(outcome.entries[0].uploaded_img, "a.jpg");
    assert_eq!(detector.calls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_bulk_missing_source_dir() {
    let (dir, config) = setup();
    let processor = ImageProcessor::new(ScriptedDetector::new().into_arc(), &config);

    let result = run_bulk(
        &processor,
        &dir.path().join("missing"),
        &ReviewStore::new(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(ReviewError::ArtifactMissing(_))));
}

#[tokio::test]
async fn test_bulk_rerun_keeps_reviews() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    write_test_image(&config.upload_dir, "a.jpg", 400, 300);
    write_test_image(&config.upload_dir, "b.jpg", 400, 300);
    let db = ReviewDb::new(&config.store_path, config.classes.clone());

    let detector = ScriptedDetector::new()
        .with(
            "a.jpg",
            vec![
                raw(0, "BrownSpot", [10.0, 10.0, 60.0, 60.0], 0.9),
                raw(6, "Yellowing", [200.0, 100.0, 300.0, 200.0], 0.8),
            ],
        )
        .with("b.jpg", vec![raw(3, "Curling", [100.0, 100.0, 150.0, 150.0], 0.9)])
        .into_arc();
    let processor = ImageProcessor::new(detector, &config);

    // First pass and a review
    let first = run_bulk(&processor, &config.upload_dir, &db.list().await?, &CancellationToken::new())?;
    db.apply_bulk(first.entries, false).await?;
    let store = db.list().await?;
    let brown_spot = store.entries()[0].detections[0].detection_id;
    db.validate(&DetectionKey::Id(brown_spot), Decision::Healthy, None)
        .await?;

    // A stale image that is no longer in the upload directory
    db.upsert_image(ImageEntry::new("gone.jpg", "gone_processed.jpg"))
        .await?;

    // Second pass
    let previous = db.list().await?;
    let second = run_bulk(&processor, &config.upload_dir, &previous, &CancellationToken::new())?;
    let merged = db.apply_bulk(second.entries, false).await?;

    let names: Vec<&str> = merged.entries().iter().map(|e| e.uploaded_img.as_str()).collect();
    assert_eq!(names, ["a.jpg", "b.jpg", "gone.jpg"]);

    let a = merged.get_image("a.jpg").expect("a.jpg present");
    assert_eq!(a.processed_img, "a_processed.jpg");
    assert_ne!(a.detections[0].detection_id, brown_spot);
    assert_eq!(a.detections[0].status, ReviewStatus::Healthy);
    assert_eq!(a.detections[1].status, ReviewStatus::Unvalidated);

    Ok(())
}

fn crop_files(config: &ReviewConfig) -> usize {
    std::fs::read_dir(config.processed_dir.join("crops"))
        .map(|dir| dir.filter_map(Result::ok).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_superseded_crops_are_removed() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    let a = write_test_image(&config.upload_dir, "a.jpg", 400, 300);
    write_test_image(&config.upload_dir, "b.jpg", 400, 300);
    let db = ReviewDb::new(&config.store_path, config.classes.clone());

    let detector = ScriptedDetector::new()
        .with(
            "a.jpg",
            vec![
                raw(0, "BrownSpot", [10.0, 10.0, 60.0, 60.0], 0.9),
                raw(6, "Yellowing", [200.0, 100.0, 300.0, 200.0], 0.8),
            ],
        )
        .with("b.jpg", vec![raw(3, "Curling", [100.0, 100.0, 150.0, 150.0], 0.9)])
        .into_arc();
    let processor = ImageProcessor::new(detector, &config);

    for _ in 0..2 {
        let previous = db.list().await?;
        let outcome = run_bulk(&processor, &config.upload_dir, &previous, &CancellationToken::new())?;
        db.apply_bulk(outcome.entries, false).await?;
    }
    assert_eq!(crop_files(&config), 3);

    // Reprocessing one image replaces its crops
    db.upsert_image(processor.process(&a, None)?).await?;
    assert_eq!(crop_files(&config), 3);

    let store = db.list().await?;
    assert_eq!(store.detection_count(), 3);
    for record in store.entries().iter().flat_map(|e| e.detections.iter()) {
        assert!(crop_exists(record.crop_path.as_deref().expect("crop recorded")));
    }

    // Deleting a detection removes its crop
    let first = store.entries()[0].detections[0].detection_id;
    db.delete(&DetectionKey::Id(first)).await?;
    assert_eq!(crop_files(&config), 2);

    Ok(())
}

#[tokio::test]
async fn test_bulk_reuses_recorded_processed_name() -> anyhow::Result<()> {
    let (_dir, config) = setup();
    write_test_image(&config.upload_dir, "a.jpg", 200, 200);
    let previous = ReviewStore::from_entries([ImageEntry::new("a.jpg", "custom_a.jpg")]);

    let processor = ImageProcessor::new(ScriptedDetector::new().into_arc(), &config);
    let outcome = run_bulk(&processor, &config.upload_dir, &previous, &CancellationToken::new())?;

    assert_eq!(outcome.entries[0].processed_img, "custom_a.jpg");
    assert!(config.processed_dir.join("custom_a.jpg").is_file());

    Ok(())
}
