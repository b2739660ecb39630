//! `multipart/x-mixed-replace` framing for the live feed.
//!
//! Each part is
//! `--BOUNDARY\r\nContent-Type: image/jpeg\r\n\r\n<jpeg bytes>\r\n`.
//! A browser `<img>` element replaces the displayed image with every part.

use bytes::{BufMut, Bytes, BytesMut};

pub const DEFAULT_BOUNDARY: &str = "frame";
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone)]
pub struct MultipartFramer {
    boundary: String,
}

impl Default for MultipartFramer {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY)
    }
}

impl MultipartFramer {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    /// Value of the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Wrap one encoded frame into a part.
    pub fn part(&self, jpeg: &[u8]) -> Bytes {
        let header = format!("--{}\r\nContent-Type: {}\r\n\r\n", self.boundary, PART_CONTENT_TYPE);
        let mut buf = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
        buf.put_slice(header.as_bytes());
        buf.put_slice(jpeg);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_names_the_boundary() {
        assert_eq!(
            MultipartFramer::default().content_type(),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }

    #[test]
    fn part_layout() {
        let part = MultipartFramer::default().part(b"JPEGDATA");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n".as_slice()
        );
    }

    #[test]
    fn consecutive_parts_concatenate_into_a_valid_body() {
        let framer = MultipartFramer::new("xyz");
        let mut body = Vec::new();
        body.extend_from_slice(&framer.part(b"A"));
        body.extend_from_slice(&framer.part(b"BB"));
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.matches("--xyz\r\n").count(), 2);
        assert!(text.ends_with("BB\r\n"));
    }
}
