use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bike_counter::annotate::render;
use bike_counter::detector::Detector;
use bike_counter::encode::encode;
use bike_counter::session::SessionStore;
use bike_counter::tracker::iou_tracker_factory;
use bike_counter::video::{VideoOpener, VideoSource};
use bike_counter::{FrameProcessor, PipelineConfig, TrackerConfig};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run the bike counter over a stored video and write the annotated frames.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video to replay
    input: PathBuf,

    /// Directory receiving frame_NNNNNN.jpg files and stats.json
    output_dir: PathBuf,

    /// YOLOv8 ONNX model
    #[arg(long, env = "BC_MODEL", default_value = "weights/best.onnx")]
    model: PathBuf,

    #[arg(long, env = "BC_FRAME_STRIDE", default_value_t = 2)]
    frame_stride: u32,

    #[arg(long, env = "BC_JPEG_QUALITY", default_value_t = 80)]
    jpeg_quality: u8,

    #[arg(long, env = "BC_MIN_CONFIDENCE", default_value_t = 0.60)]
    min_confidence: f32,

    #[arg(long, env = "BC_TARGET_CLASS", default_value_t = 0)]
    target_class: u32,
}

#[cfg(all(feature = "opencv", feature = "onnx"))]
fn backends(model: &Path) -> Result<(Arc<dyn VideoOpener>, Arc<dyn Detector>)> {
    use bike_counter::detector::YoloV8Detector;
    use bike_counter::video::OpenCvOpener;

    let detector = YoloV8Detector::new(model).context("failed to load detector")?;
    Ok((Arc::new(OpenCvOpener), Arc::new(detector)))
}

#[cfg(not(all(feature = "opencv", feature = "onnx")))]
fn backends(_model: &Path) -> Result<(Arc<dyn VideoOpener>, Arc<dyn Detector>)> {
    Err(anyhow::anyhow!(
        "replay_tester was built without the `opencv` and `onnx` features"
    ))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config = PipelineConfig {
        frame_stride: args.frame_stride,
        target_class: args.target_class,
        min_confidence: args.min_confidence,
        jpeg_quality: args.jpeg_quality,
    };
    config.validate().context("invalid pipeline configuration")?;
    let (opener, detector) = backends(&args.model)?;

    run(&args.input, &args.output_dir, opener.as_ref(), detector, config)
}

fn run(
    input: &Path,
    output_dir: &Path,
    opener: &dyn VideoOpener,
    detector: Arc<dyn Detector>,
    config: PipelineConfig,
) -> Result<()> {
    fs::create_dir_all(output_dir).with_context(|| format!("cannot create {}", output_dir.display()))?;

    // --- 1. Session and source ---
    let store = SessionStore::new(iou_tracker_factory(TrackerConfig::default()));
    store.reset(input);
    let ticket = store.current_session().context("session missing right after reset")?;
    let mut source = VideoSource::open(opener, input, config.frame_stride)
        .with_context(|| format!("cannot open {}", input.display()))?;
    let jpeg_quality = config.jpeg_quality;
    let mut processor = FrameProcessor::new(detector, store.clone(), ticket, config);

    // --- 2. Frame loop ---
    let mut written = 0u64;
    for frame in source.by_ref() {
        let outcome = processor.process(&frame)?;
        let annotated = render(&frame.image, &outcome.detections, &outcome.tracks, &outcome.snapshot);
        let jpeg = match encode(&annotated, jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(frame = frame.index, error = %e, "skipping frame");
                continue;
            }
        };
        let path = output_dir.join(format!("frame_{:06}.jpg", frame.index));
        fs::write(&path, &jpeg).with_context(|| format!("cannot write {}", path.display()))?;
        written += 1;
    }

    // --- 3. Final statistics ---
    let stats = store.statistics().unwrap_or_default();
    let stats_path = output_dir.join("stats.json");
    fs::write(&stats_path, serde_json::to_vec_pretty(&stats)?)
        .with_context(|| format!("cannot write {}", stats_path.display()))?;

    info!(
        frames_decoded = source.frames_decoded(),
        frames_written = written,
        end = ?source.end_reason(),
        count = stats.count,
        "replay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bike_counter::error::{DetectorError, SourceError};
    use bike_counter::types::{BoundingBox, Detection};
    use bike_counter::video::FrameDecoder;
    use image::RgbImage;

    struct Frames(u32);

    impl FrameDecoder for Frames {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            if self.0 == 0 {
                return Ok(None);
            }
            self.0 -= 1;
            Ok(Some(RgbImage::new(96, 64)))
        }
    }

    struct Opener(u32);

    impl VideoOpener for Opener {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameDecoder>, SourceError> {
            Ok(Box::new(Frames(self.0)))
        }
    }

    struct TwoBikes;

    impl Detector for TwoBikes {
        fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(vec![
                Detection::new(BoundingBox::new(5.0, 30.0, 25.0, 60.0), 0.8, 0),
                Detection::new(BoundingBox::new(50.0, 30.0, 70.0, 60.0), 0.8, 0),
            ])
        }

        fn name(&self) -> &str {
            "two-bikes"
        }
    }

    #[test]
    fn writes_strided_frames_and_final_stats() {
        let out = tempfile::tempdir().unwrap();
        run(Path::new("ride.mp4"), out.path(), &Opener(9), Arc::new(TwoBikes), PipelineConfig::default()).unwrap();

        for index in [2, 4, 6, 8] {
            let frame = out.path().join(format!("frame_{index:06}.jpg"));
            let bytes = fs::read(&frame).unwrap();
            assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        }
        assert!(!out.path().join("frame_000001.jpg").exists());

        let stats: serde_json::Value = serde_json::from_slice(&fs::read(out.path().join("stats.json")).unwrap()).unwrap();
        assert_eq!(stats["count"], 2);
        assert_eq!(stats["fuel_saved"], 224.0);
    }
}
