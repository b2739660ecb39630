//! JPEG compression of annotated frames.

use bytes::Bytes;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

use crate::error::EncodeError;

/// Compress `frame` to a baseline JPEG at `quality` (1..=100).
pub fn encode(frame: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    if !(1..=100).contains(&quality) {
        return Err(EncodeError::InvalidQuality(quality));
    }
    let mut buf = Vec::with_capacity((frame.width() * frame.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(frame)?;
    Ok(Bytes::from(buf))
}
