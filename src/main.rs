use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use defectreview::core::export::{self, ExportOptions};
use defectreview::detection::bulk::run_bulk;
use defectreview::detection::sidecar::SidecarDetector;
use defectreview::{
    ConfigArgs, Decision, DetectionKey, ImageProcessor, PixelBox, ReviewConfig, ReviewDb, ReviewError,
    ReviewRepository,
};

#[derive(Parser)]
#[command(name = "defectreview")]
#[command(about = "Detect, review and export plant defect annotations")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect defects on one uploaded image and store the result
    Detect {
        /// File name inside the upload directory, or a path to the image
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    /// Re-run detection over the whole upload directory, keeping prior reviews
    BulkDetect {
        /// Replace a store that does not parse instead of failing
        #[arg(long)]
        force: bool,
    },

    /// Print the review store as JSON
    List,

    /// Record a review decision on a detection
    Validate {
        /// Detection id, or a legacy confidence key
        key: String,
        /// One of: correct, healthy, other, uncertain
        decision: String,
        /// Corrected class for the `other` decision
        #[arg(long)]
        defect_type: Option<String>,
    },

    /// Remove a detection
    Delete {
        /// Detection id, or a legacy confidence key
        key: String,
    },

    /// Replace a detection's box and optionally its class
    Update {
        /// Uploaded image the detection belongs to
        image: String,
        /// Detection id, or a legacy confidence key
        key: String,
        /// New box as x1,y1,x2,y2 in pixels
        #[arg(long, required = true, value_delimiter = ',', allow_negative_numbers = true)]
        bbox: Vec<f32>,
        #[arg(long)]
        defect_type: Option<String>,
    },

    /// Export reviewed detections as a YOLO dataset
    Export {
        /// Output directory (defaults to a timestamped directory under the export root)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Keep records marked healthy
        #[arg(long)]
        include_healthy: bool,
        /// Also pack the export into a .tar.zst archive
        #[arg(long)]
        archive: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "defectreview=debug"
    } else {
        "defectreview=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<ReviewError>() {
                Some(review_error) => {
                    let failure = review_error.to_failure();
                    eprintln!("{}", serde_json::to_string(&failure).unwrap_or_else(|_| e.to_string()));
                }
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.into_config()?;
    let db = ReviewDb::new(&config.store_path, config.classes.clone()).with_upload_dir(&config.upload_dir);

    match cli.command {
        Command::Detect { image } => {
            let path = if image.is_file() {
                image
            } else {
                config.upload_dir.join(image)
            };
            let processor = build_processor(&config)?;
            let entry = tokio::task::spawn_blocking(move || processor.process(&path, None))
                .await
                .context("detection task panicked")??;
            db.upsert_image(entry.clone()).await?;
            print_json(&entry)?;
        }

        Command::BulkDetect { force } => {
            let previous = db.list().await?;
            let processor = build_processor(&config)?;
            let source_dir = config.upload_dir.clone();

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current image");
                    on_signal.cancel();
                }
            });

            let outcome = tokio::task::spawn_blocking(move || run_bulk(&processor, &source_dir, &previous, &cancel))
                .await
                .context("bulk detection task panicked")??;

            let processed = outcome.entries.len();
            let merged = db.apply_bulk(outcome.entries, force).await?;
            print_json(&json!({
                "processed": processed,
                "failures": outcome.failures,
                "cancelled": outcome.cancelled,
                "images": merged.len(),
                "detections": merged.detection_count(),
            }))?;
        }

        Command::List => {
            let store = db.list().await?;
            print_json(&store)?;
        }

        Command::Validate {
            key,
            decision,
            defect_type,
        } => {
            let key: DetectionKey = key.parse()?;
            let decision: Decision = decision.parse()?;
            let record = db.validate(&key, decision, defect_type.as_deref()).await?;
            print_json(&record)?;
        }

        Command::Delete { key } => {
            let key: DetectionKey = key.parse()?;
            let record = db.delete(&key).await?;
            print_json(&record)?;
        }

        Command::Update {
            image,
            key,
            bbox,
            defect_type,
        } => {
            let &[x1, y1, x2, y2] = bbox.as_slice() else {
                return Err(ReviewError::InvalidGeometry(format!("expected 4 coordinates, got {}", bbox.len())).into());
            };
            let key: DetectionKey = key.parse()?;
            let record = db
                .update_bbox(&image, &key, PixelBox::new(x1, y1, x2, y2), defect_type.as_deref())
                .await?;
            print_json(&record)?;
        }

        Command::Export {
            out,
            include_healthy,
            archive,
        } => {
            let store = db.list().await?;
            let output_dir = match out {
                Some(dir) => dir,
                None => config.export_root.join(export_dir_name()?),
            };
            let options = ExportOptions {
                split: config.split,
                exclude_healthy: !include_healthy,
            };
            let manifest = export::export(&store, &config.upload_dir, &output_dir, &config.classes, &options)?;
            if archive {
                let archive_path = export::archive(&output_dir)?;
                info!(archive = %archive_path.display(), "archive ready");
            }
            print_json(&manifest)?;
        }
    }

    Ok(())
}

fn build_processor(config: &ReviewConfig) -> anyhow::Result<ImageProcessor> {
    let detector = SidecarDetector::open(&config.predictions_dir, config.classes.clone())?;
    Ok(ImageProcessor::new(Arc::new(detector), config))
}

fn export_dir_name() -> anyhow::Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .context("Failed to format export timestamp")?;
    Ok(format!("dataset_{stamp}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
