//! Tunable parameters of the frame pipeline and the built-in tracker.

use crate::error::ConfigError;

/// Configuration for the per-frame pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Only every Nth physical frame is forwarded to detection.
    pub frame_stride: u32,
    /// Detector class that is counted.
    pub target_class: u32,
    /// Detections must score strictly above this value.
    pub min_confidence: f32,
    /// JPEG quality of the streamed frames.
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_stride: 2,
            target_class: 0,
            min_confidence: 0.60,
            jpeg_quality: 80,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_stride == 0 {
            return Err(ConfigError::ZeroStride);
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::JpegQuality(self.jpeg_quality));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Confidence(self.min_confidence));
        }
        Ok(())
    }
}

/// Configuration for [`crate::tracker::IouTracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Frames a confirmed track may go unmatched before it is dropped.
    pub max_age: u32,
    /// Consecutive hits before a track is confirmed.
    pub n_init: u32,
    /// Largest `1 - IoU` still accepted as a match.
    pub max_iou_distance: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            n_init: 3,
            max_iou_distance: 0.7,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_init == 0 {
            return Err(ConfigError::ZeroInit);
        }
        if !(self.max_iou_distance > 0.0 && self.max_iou_distance <= 1.0) {
            return Err(ConfigError::IouDistance(self.max_iou_distance));
        }
        Ok(())
    }
}
