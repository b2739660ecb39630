use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bike_counter::detector::Detector;
use bike_counter::session::SessionStore;
use bike_counter::storage::FileSystemStorage;
use bike_counter::tracker::iou_tracker_factory;
use bike_counter::video::VideoOpener;
use bike_counter::{PipelineConfig, TrackerConfig};
use bike_counter_server::{AppState, ServerConfig, start_server};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Upload a video, watch the annotated live feed, read the running bicycle count.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BC_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Directory uploaded videos are stored in
    #[arg(long, env = "BC_MEDIA_DIR", default_value = "media")]
    media_dir: PathBuf,

    /// YOLOv8 ONNX model
    #[arg(long, env = "BC_MODEL", default_value = "weights/best.onnx")]
    model: PathBuf,

    /// Forward only every Nth decoded frame
    #[arg(long, env = "BC_FRAME_STRIDE", default_value_t = 2)]
    frame_stride: u32,

    #[arg(long, env = "BC_JPEG_QUALITY", default_value_t = 80)]
    jpeg_quality: u8,

    /// Detections must score strictly above this
    #[arg(long, env = "BC_MIN_CONFIDENCE", default_value_t = 0.60)]
    min_confidence: f32,

    /// Detector class id that is counted
    #[arg(long, env = "BC_TARGET_CLASS", default_value_t = 0)]
    target_class: u32,

    /// Largest accepted upload, in MiB
    #[arg(long, env = "BC_MAX_UPLOAD_MB", default_value_t = 512)]
    max_upload_mb: usize,
}

#[cfg(all(feature = "opencv", feature = "onnx"))]
fn backends(model: &Path) -> anyhow::Result<(Arc<dyn VideoOpener>, Arc<dyn Detector>)> {
    use bike_counter::detector::YoloV8Detector;
    use bike_counter::video::OpenCvOpener;

    let detector = YoloV8Detector::new(model).context("failed to load detector")?;
    Ok((Arc::new(OpenCvOpener), Arc::new(detector)))
}

#[cfg(not(all(feature = "opencv", feature = "onnx")))]
fn backends(_model: &Path) -> anyhow::Result<(Arc<dyn VideoOpener>, Arc<dyn Detector>)> {
    Err(anyhow::anyhow!(
        "bike_counter_server was built without the `opencv` and `onnx` features"
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let pipeline = PipelineConfig {
        frame_stride: args.frame_stride,
        target_class: args.target_class,
        min_confidence: args.min_confidence,
        jpeg_quality: args.jpeg_quality,
    };
    pipeline.validate().context("invalid pipeline configuration")?;
    let tracker = TrackerConfig::default();
    tracker.validate().context("invalid tracker configuration")?;

    let cfg = ServerConfig {
        bind_addr: args.bind,
        media_dir: args.media_dir,
        max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
    };

    let (opener, detector) = backends(&args.model)?;
    let state = AppState::new(
        SessionStore::new(iou_tracker_factory(tracker)),
        Arc::new(FileSystemStorage::new(cfg.media_dir.clone())),
        opener,
        detector,
        pipeline,
    );

    let handle = start_server(state, &cfg).await?;
    handle.await.context("server task panicked")?;
    Ok(())
}
