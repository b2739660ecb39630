// THEORY:
// The `video` module is the acquisition layer of the pipeline. It turns a stored
// video file into a lazy, finite sequence of `Frame`s and applies rate control.
//
// Key architectural principles:
// 1.  **Decoder Seam**: Decoding is hidden behind `FrameDecoder` and `VideoOpener`
//     so the pipeline can be driven by OpenCV in production and by synthetic
//     frames in tests.
// 2.  **Stride**: Every physical frame is decoded exactly once, but only every Nth
//     one is forwarded downstream. Frame numbers are 1-based, so a stride of 2
//     forwards frames 2, 4, 6, ...
// 3.  **Scoped Handle**: The decoder is dropped on the first exit path: natural
//     end, decode failure, or the consumer dropping the `VideoSource`. A failed
//     decode ends the sequence; it is logged, never yielded.

use std::path::Path;

use image::RgbImage;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::types::Frame;

/// Produces decoded frames from one opened video, in order.
pub trait FrameDecoder: Send {
    /// Decodes the next physical frame, `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Opens stored videos by path.
pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameDecoder>, SourceError>;
}

/// Why a [`VideoSource`] stopped yielding frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEnd {
    Exhausted,
    DecodeFailure,
}

/// Lazy, non-restartable frame sequence honouring a skip stride.
pub struct VideoSource {
    decoder: Option<Box<dyn FrameDecoder>>,
    stride: u64,
    decoded: u64,
    end: Option<SourceEnd>,
}

impl VideoSource {
    pub fn new(decoder: Box<dyn FrameDecoder>, stride: u32) -> Self {
        Self {
            decoder: Some(decoder),
            stride: u64::from(stride.max(1)),
            decoded: 0,
            end: None,
        }
    }

    pub fn open(opener: &dyn VideoOpener, path: &Path, stride: u32) -> Result<Self, SourceError> {
        let decoder = opener.open(path)?;
        debug!(path = %path.display(), stride, "video opened");
        Ok(Self::new(decoder, stride))
    }

    /// Number of physical frames decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.decoded
    }

    /// `None` while frames may still follow.
    pub fn end_reason(&self) -> Option<SourceEnd> {
        self.end
    }

    fn finish(&mut self, reason: SourceEnd) {
        self.decoder = None;
        self.end = Some(reason);
    }
}

impl Iterator for VideoSource {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            let decoder = self.decoder.as_mut()?;
            match decoder.read_frame() {
                Ok(Some(image)) => {
                    self.decoded += 1;
                    if self.decoded % self.stride == 0 {
                        return Some(Frame {
                            index: self.decoded,
                            image,
                        });
                    }
                }
                Ok(None) => {
                    debug!(frames = self.decoded, "video exhausted");
                    self.finish(SourceEnd::Exhausted);
                    return None;
                }
                Err(e) => {
                    warn!(frames = self.decoded, error = %e, "video decode failed, ending stream");
                    self.finish(SourceEnd::DecodeFailure);
                    return None;
                }
            }
        }
    }
}

impl std::iter::FusedIterator for VideoSource {}

/// Placeholder opener used when no decoding backend is compiled in.
pub struct UnsupportedOpener;

impl VideoOpener for UnsupportedOpener {
    fn open(&self, _path: &Path) -> Result<Box<dyn FrameDecoder>, SourceError> {
        Err(SourceError::Unsupported)
    }
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::OpenCvOpener;

#[cfg(feature = "opencv")]
mod opencv_backend {
    use std::path::Path;

    use image::RgbImage;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture},
    };

    use super::{FrameDecoder, VideoOpener};
    use crate::error::SourceError;

    /// Opens videos with `opencv::videoio`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OpenCvOpener;

    impl VideoOpener for OpenCvOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameDecoder>, SourceError> {
            let name = path.to_string_lossy();
            let cap = VideoCapture::from_file(&name, videoio::CAP_ANY)
                .map_err(|e| SourceError::open(path, e))?;
            if !cap.is_opened().map_err(|e| SourceError::open(path, e))? {
                return Err(SourceError::open(path, "capture did not open"));
            }
            Ok(Box::new(OpenCvDecoder {
                cap,
                bgr: Mat::default(),
                read: 0,
            }))
        }
    }

    struct OpenCvDecoder {
        cap: VideoCapture,
        bgr: Mat,
        read: u64,
    }

    impl FrameDecoder for OpenCvDecoder {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            let frame_no = self.read + 1;
            let got = self
                .cap
                .read(&mut self.bgr)
                .map_err(|e| SourceError::decode(frame_no, e))?;
            if !got || self.bgr.empty() {
                return Ok(None);
            }
            self.read = frame_no;

            // OpenCV hands out BGR; the pipeline works in RGB.
            let mut rgb = Mat::default();
            imgproc::cvt_color(&self.bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
                .map_err(|e| SourceError::decode(frame_no, e))?;
            let width = rgb.cols() as u32;
            let height = rgb.rows() as u32;
            let data = rgb
                .data_bytes()
                .map_err(|e| SourceError::decode(frame_no, e))?
                .to_vec();
            RgbImage::from_raw(width, height, data)
                .map(Some)
                .ok_or_else(|| SourceError::decode(frame_no, "frame buffer size mismatch"))
        }
    }

    impl Drop for OpenCvDecoder {
        fn drop(&mut self) {
            let _ = self.cap.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Synthetic {
        remaining: u32,
        fail_after: Option<u32>,
        produced: u32,
        released: Arc<AtomicBool>,
    }

    impl Synthetic {
        fn boxed(frames: u32, fail_after: Option<u32>) -> (Box<dyn FrameDecoder>, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            let decoder = Synthetic {
                remaining: frames,
                fail_after,
                produced: 0,
                released: released.clone(),
            };
            (Box::new(decoder), released)
        }
    }

    impl FrameDecoder for Synthetic {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            if self.fail_after == Some(self.produced) {
                return Err(SourceError::decode(u64::from(self.produced) + 1, "corrupt packet"));
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.produced += 1;
            Ok(Some(RgbImage::new(4, 4)))
        }
    }

    impl Drop for Synthetic {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn stride_forwards_every_nth_frame() {
        let (decoder, _) = Synthetic::boxed(7, None);
        let source = VideoSource::new(decoder, 2);
        let indices: Vec<u64> = source.map(|f| f.index).collect();
        assert_eq!(indices, vec![2, 4, 6]);
    }

    #[test]
    fn stride_one_forwards_everything() {
        let (decoder, _) = Synthetic::boxed(3, None);
        let indices: Vec<u64> = VideoSource::new(decoder, 1).map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn empty_video_yields_nothing_and_releases_decoder() {
        let (decoder, released) = Synthetic::boxed(0, None);
        let mut source = VideoSource::new(decoder, 2);
        assert!(source.next().is_none());
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(source.end_reason(), Some(SourceEnd::Exhausted));
        assert!(source.next().is_none());
    }

    #[test]
    fn decode_failure_ends_sequence_without_partial_frames() {
        let (decoder, released) = Synthetic::boxed(10, Some(3));
        let mut source = VideoSource::new(decoder, 1);
        let indices: Vec<u64> = source.by_ref().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(source.end_reason(), Some(SourceEnd::DecodeFailure));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_the_source_releases_the_decoder() {
        let (decoder, released) = Synthetic::boxed(10, None);
        let mut source = VideoSource::new(decoder, 1);
        assert!(source.next().is_some());
        assert!(!released.load(Ordering::SeqCst));
        drop(source);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn unsupported_opener_reports_missing_backend() {
        let err = VideoSource::open(&UnsupportedOpener, Path::new("clip.mp4"), 2)
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Unsupported));
    }
}
