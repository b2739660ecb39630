//! Error types for the bike counter engine.
//!
//! Each seam of the frame pipeline owns its own error enum so that the
//! orchestrator can decide, per failure kind, whether a frame is skipped, a
//! stream is ended, or an upload is refused.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while opening or decoding a stored video.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open video {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("failed to decode frame {frame}: {reason}")]
    Decode { frame: u64, reason: String },

    #[error("video decoding support was not compiled in (enable the `opencv` feature)")]
    Unsupported,
}

impl SourceError {
    pub fn open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Open {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(frame: u64, reason: impl ToString) -> Self {
        Self::Decode {
            frame,
            reason: reason.to_string(),
        }
    }
}

/// Failures reported by a [`crate::detector::Detector`].
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image preprocessing failed: {0}")]
    Preprocessing(String),
}

/// Failures reported by a [`crate::tracker::Tracker`].
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("tracker update failed: {0}")]
    Update(String),
}

/// JPEG compression failures.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("jpeg quality must be within 1..=100, got {0}")]
    InvalidQuality(u8),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures while persisting an uploaded video.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage directory {path} is unusable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free file name for {0} after {1} attempts")]
    NameExhausted(String, u32),
}

/// Invalid pipeline or tracker configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("frame stride must be at least 1")]
    ZeroStride,

    #[error("jpeg quality must be within 1..=100, got {0}")]
    JpegQuality(u8),

    #[error("minimum confidence must be within [0, 1], got {0}")]
    Confidence(f32),

    #[error("max IoU distance must be within (0, 1], got {0}")]
    IouDistance(f32),

    #[error("tracker n_init must be at least 1")]
    ZeroInit,
}

/// A write was attempted with a ticket from a session that has since been
/// replaced by a newer upload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("session generation {ticket} was replaced by generation {current}")]
pub struct StaleSession {
    pub ticket: u64,
    pub current: u64,
}
