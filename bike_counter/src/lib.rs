// THEORY:
// This file is the main entry point for the `bike_counter` library crate. It
// exposes the frame pipeline that turns an uploaded video into an annotated
// MJPEG feed, together with the shared session state that the HTTP layer reads
// the running count from.
//
// The public surface is seam-shaped: decoding (`video`), detection
// (`detector`), tracking (`tracker`) and persistence (`storage`) are traits, so
// the server binary picks the production backends and the tests plug in
// synthetic ones. Everything between the seams (filtering, registry updates,
// statistics, drawing, encoding, framing) is concrete and lives here.

pub mod annotate;
pub mod config;
pub mod detector;
pub mod encode;
pub mod error;
pub mod multipart;
pub mod pipeline;
pub mod session;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod video;
#[cfg(feature = "onnx")]
mod yolov8;

pub use config::{PipelineConfig, TrackerConfig};
pub use pipeline::{FrameProcessor, StreamEnd, StreamReport, StreamWorker, spawn_stream};
pub use session::{SessionStore, SessionTicket};
pub use stats::{StatisticsSnapshot, snapshot};
