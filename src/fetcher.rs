//! Image Fetcher
//!
//! Retrieves an image by URL and decodes it into a fixed-size RGB square.
//! Failures are expected (broken links, blocked origins, unsupported formats)
//! and surface as `None`, never as a pipeline error.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::time::Duration;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::{FilterError, Result};

/// RGB pixel buffer of side `size`, ready for preprocessing
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    /// Resize to `size x size` without preserving aspect ratio.
    pub fn from_dynamic(image: DynamicImage, size: u32) -> Self {
        let pixels = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        Self { pixels }
    }

    /// All-black image, equivalent to a zero-filled input.
    pub fn zeroed(size: u32) -> Self {
        Self {
            pixels: RgbImage::new(size, size),
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut RgbImage {
        &mut self.pixels
    }

    pub fn side(&self) -> u32 {
        self.pixels.width()
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch and decode `url`; `None` on any load or decode failure.
    async fn fetch(&self, url: &str) -> Option<DecodedImage>;
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
    image_size: u32,
    max_image_bytes: usize,
    allow_file_urls: bool,
}

impl HttpImageFetcher {
    pub fn new(config: &FetchConfig, image_size: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FilterError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            image_size,
            max_image_bytes: config.max_image_bytes,
            allow_file_urls: config.allow_file_urls,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<DecodedImage> {
        let bytes = self.load_bytes(url).await?;
        if bytes.is_empty() {
            return Err(FilterError::DecodeError("Image data is empty".to_string()));
        }
        if bytes.len() > self.max_image_bytes {
            return Err(too_large(bytes.len() as u64, self.max_image_bytes));
        }

        let size = self.image_size;
        tokio::task::spawn_blocking(move || decode_image(&bytes, size))
            .await
            .map_err(|e| FilterError::InternalError(format!("Decode task panicked: {}", e)))?
    }

    async fn load_bytes(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| FilterError::FetchError(format!("HTTP request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(FilterError::FetchError(format!("HTTP error: {}", response.status())));
            }

            if let Some(len) = response.content_length() {
                if len > self.max_image_bytes as u64 {
                    return Err(too_large(len, self.max_image_bytes));
                }
            }

            read_capped(response, self.max_image_bytes).await
        } else if let Some(rest) = url.strip_prefix("data:") {
            decode_data_uri(rest)
        } else if let Some(path) = url.strip_prefix("file://") {
            if !self.allow_file_urls {
                return Err(FilterError::FetchError(
                    "file:// URLs are disabled (set ALLOW_FILE_URLS=true)".to_string(),
                ));
            }
            tokio::fs::read(path)
                .await
                .map_err(|e| FilterError::FetchError(format!("Failed to read file: {}", e)))
        } else {
            Err(FilterError::FetchError(format!("Unsupported URL scheme: {}", url)))
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Option<DecodedImage> {
        match self.try_fetch(url).await {
            Ok(image) => Some(image),
            Err(e) => {
                debug!(url = %url, error = %e, "Image fetch failed");
                None
            }
        }
    }
}

/// Read a response body, failing as soon as it grows past `limit` bytes.
/// Bodies without a Content-Length are never buffered beyond the limit.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| FilterError::FetchError(format!("Failed to read response: {}", e)))?
    {
        if body.len() + chunk.len() > limit {
            return Err(too_large((body.len() + chunk.len()) as u64, limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn too_large(size: u64, limit: usize) -> FilterError {
    FilterError::FetchError(format!(
        "Image is too large: {} bytes (max: {} bytes)",
        size, limit
    ))
}

/// Decode encoded image bytes and resize to the model input square.
pub fn decode_image(bytes: &[u8], size: u32) -> Result<DecodedImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| FilterError::DecodeError(e.to_string()))?;
    Ok(DecodedImage::from_dynamic(image, size))
}

/// Payload of a `data:` URI (the part after the scheme). Only base64
/// payloads carry binary images.
fn decode_data_uri(rest: &str) -> Result<Vec<u8>> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| FilterError::FetchError("Malformed data URI".to_string()))?;

    if !meta.ends_with(";base64") {
        return Err(FilterError::FetchError(
            "Only base64 data URIs are supported".to_string(),
        ));
    }

    STANDARD
        .decode(payload.trim())
        .map_err(|e| FilterError::DecodeError(format!("Invalid base64 encoding: {}", e)))
}
