//! One-shot still capture from the camera snapshot endpoint.
//!
//! Independent of the stream: the ESP32-CAM serves `/capture` on port 80 while
//! the MJPEG stream lives on port 81, so both can run at the same time.
//!
//! Exactly one "current" image is kept. Each successful capture replaces it
//! wholesale; readers get an `Arc` snapshot and never see a half-written image.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use reqwest::blocking::Client;

use super::outcome::RequestOutcome;

/// Timeout for a snapshot request
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw snapshot bytes as returned by the camera
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    bytes: Vec<u8>,
    captured_at: DateTime<Local>,
}

impl CapturedImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, captured_at: Local::now() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn size_kb(&self) -> f64 {
        self.bytes.len() as f64 / 1024.0
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// MIME type sniffed from the magic bytes; cameras default to JPEG
    pub fn mime_type(&self) -> &'static str {
        match image::guess_format(&self.bytes) {
            Ok(ImageFormat::Png) => "image/png",
            Ok(ImageFormat::Gif) => "image/gif",
            Ok(ImageFormat::WebP) => "image/webp",
            Ok(ImageFormat::Bmp) => "image/bmp",
            _ => "image/jpeg",
        }
    }

    /// Decode for preview
    pub fn decode(&self) -> image::ImageResult<DynamicImage> {
        image::load_from_memory(&self.bytes)
    }
}

/// Snapshot fetcher + holder of the current captured image
pub struct CaptureService {
    client: Client,
    current: RwLock<Option<Arc<CapturedImage>>>,
}

impl CaptureService {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().timeout(CAPTURE_TIMEOUT).build()?;
        Ok(Self { client, current: RwLock::new(None) })
    }

    /// GET `http://{camera_ip}/capture`; success replaces the current image.
    pub fn capture_image(&self, camera_ip: &str) -> RequestOutcome<Arc<CapturedImage>> {
        let url = capture_url(camera_ip);
        info!("Requesting image from camera at {}", camera_ip);

        let response = match self.client.get(&url).send() {
            Ok(r) => r,
            Err(e) => return RequestOutcome::transport(&e),
        };

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return RequestOutcome::AuthFailure;
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return RequestOutcome::client_error(status.as_u16(), &body);
        }

        let bytes = match response.bytes() {
            Ok(b) => b.to_vec(),
            Err(e) => return RequestOutcome::transport(&e),
        };

        let image = Arc::new(CapturedImage::new(bytes));
        debug!("Captured {} bytes ({})", image.size_bytes(), image.mime_type());
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&image));
        info!("Image captured successfully ({:.1} KB)", image.size_kb());

        RequestOutcome::Success(image)
    }

    /// Most recent capture
    pub fn current(&self) -> Option<Arc<CapturedImage>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub fn capture_url(camera_ip: &str) -> String {
    format!("http://{}/capture", camera_ip)
}
