//! Object detector contract.
//!
//! The pipeline only needs boxes, scores and class labels for a frame; the
//! model behind them is a collaborator. One detector instance is shared by
//! every stream connection.

use image::RgbImage;

use crate::error::DetectorError;
use crate::types::Detection;

pub trait Detector: Send + Sync {
    /// Detect objects in one RGB frame. Boxes are in frame pixel coordinates.
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError>;

    /// Detector name, for logging.
    fn name(&self) -> &str;
}

#[cfg(feature = "onnx")]
pub use crate::yolov8::YoloV8Detector;
