//! Media download and image conversion

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::MediaError;
use crate::types::ImageMime;

/// Extension used when the URL path has none
pub const DEFAULT_EXTENSION: &str = "jpg";

const JPEG_QUALITY: u8 = 88;

/// File extension of the media at `url`, ignoring the query string
pub fn infer_extension(url: &Url) -> String {
    Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// MIME type for the upload, derived from the file extension
pub fn mime_for_extension(ext: &str) -> ImageMime {
    ImageMime::from_extension(ext)
}

/// Fetches remote media into a local file
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Write the body at `url` to `dest`, returning the byte count
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, MediaError>;
}

/// Converts arbitrary image bytes to a standard photo encoding
pub trait ImageConverter: Send + Sync {
    fn to_jpeg(&self, bytes: &[u8]) -> Result<Vec<u8>, MediaError>;
}

/// Plain HTTP GET downloader
pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, MediaError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MediaError::Download(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MediaDownloader for HttpDownloader {
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, MediaError> {
        let mut response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MediaError::Download(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| MediaError::Download(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(MediaError::Download(format!("Empty body from {}", url)));
        }

        Ok(written)
    }
}

/// Re-encodes any decodable image as an RGB JPEG
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegConverter;

impl ImageConverter for JpegConverter {
    fn to_jpeg(&self, bytes: &[u8]) -> Result<Vec<u8>, MediaError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| MediaError::Conversion(e.to_string()))?;
        let rgb = decoded.to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(|e| MediaError::Conversion(e.to_string()))?;

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(4, 3, Rgba([200, 10, 10, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_infer_extension() {
        assert_eq!(infer_extension(&url("https://pbs.twimg.com/media/abc.png")), "png");
        assert_eq!(
            infer_extension(&url("https://pbs.twimg.com/media/abc.JPG?name=large")),
            "jpg"
        );
        assert_eq!(
            infer_extension(&url("https://pbs.twimg.com/media/abc?format=webp")),
            DEFAULT_EXTENSION
        );
        assert_eq!(infer_extension(&url("https://example.com/")), DEFAULT_EXTENSION);
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension("png"), ImageMime::Png);
        assert_eq!(mime_for_extension("jpg"), ImageMime::Jpeg);
    }

    #[test]
    fn test_jpeg_converter_converts_png() {
        let jpeg = JpegConverter.to_jpeg(&png_bytes()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_jpeg_converter_rejects_garbage() {
        let result = JpegConverter.to_jpeg(b"definitely not an image");
        assert!(matches!(result, Err(MediaError::Conversion(_))));
    }
}
