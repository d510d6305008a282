//! Recognition service abstraction.
//!
//! Defines the [`RecognitionService`] trait so the vision-model backend and the
//! remote scanning endpoint can be swapped via config. Both return the raw,
//! loosely shaped JSON; reconciliation happens in [`crate::normalizer`].

pub mod remote;
pub mod session;
pub mod vision;

use thiserror::Error;

/// A captured certificate image.
#[derive(Debug, Clone)]
pub struct ScanImage {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ScanImage {
    /// Build from uploaded bytes, sniffing the format from magic bytes.
    ///
    /// Returns `None` when the bytes are recognisably not a supported image.
    /// Unknown formats are passed through as JPEG.
    pub fn from_upload(filename: impl Into<String>, data: Vec<u8>) -> Option<Self> {
        let mime_type = match image::guess_format(&data) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            Ok(image::ImageFormat::Png) => "image/png",
            Ok(image::ImageFormat::WebP) => "image/webp",
            Ok(image::ImageFormat::Gif) => "image/gif",
            Ok(image::ImageFormat::Bmp) => "image/bmp",
            Ok(image::ImageFormat::Tiff) => "image/tiff",
            Ok(_) => return None,
            Err(_) => "image/jpeg",
        };

        Some(Self {
            filename: filename.into(),
            mime_type: mime_type.to_string(),
            data,
        })
    }
}

/// Transport or service failure of a recognition call. Always retryable by
/// scanning again.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("recognition request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Rejection carrying a message meant for the user.
    #[error("recognition service error ({status}): {message}")]
    Service { status: u16, message: String },
    /// Upstream provider rejection; its body is logged, never shown.
    #[error("recognition provider error ({status})")]
    Provider { status: u16 },
}

/// Async trait implemented by each recognition backend.
#[async_trait::async_trait]
pub trait RecognitionService: Send + Sync {
    fn name(&self) -> &str;

    /// Send the image and return the raw response body as JSON.
    async fn recognize(&self, image: &ScanImage) -> Result<serde_json::Value, RecognitionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniffs_png_and_jpeg() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0];
        assert_eq!(ScanImage::from_upload("a.png", png.to_vec()).unwrap().mime_type, "image/png");
        assert_eq!(ScanImage::from_upload("a.jpg", jpeg.to_vec()).unwrap().mime_type, "image/jpeg");
    }

    #[test]
    fn test_unknown_bytes_default_to_jpeg() {
        let image = ScanImage::from_upload("scan", vec![1, 2, 3, 4]).unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[test]
    fn test_rejects_non_certificate_formats() {
        // Radiance HDR header
        let hdr = b"#?RADIANCE\n".to_vec();
        assert!(ScanImage::from_upload("x.hdr", hdr).is_none());
    }
}
