//! Loopback HTTP fixtures for tests (camera + remote service stand-ins).

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use image::{ImageFormat, Rgb, RgbImage};
use rouille::{Request, Response};

/// Stops the server when dropped
pub struct ServerGuard {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start a rouille server on an ephemeral loopback port.
///
/// Returns `http://127.0.0.1:PORT`, the guard, and a counter of handled requests.
pub fn serve<F>(handler: F) -> (String, ServerGuard, Arc<AtomicUsize>)
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let server = rouille::Server::new("127.0.0.1:0", move |req: &Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        handler(req)
    })
    .expect("failed to bind test server");

    let base = format!("http://{}", server.server_addr());
    let (handle, stop) = server.stoppable();
    (base, ServerGuard { stop: Some(stop), handle: Some(handle) }, hits)
}

/// Port of a `http://127.0.0.1:PORT` base URL
pub fn port_of(base_url: &str) -> u16 {
    base_url
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

/// `127.0.0.1:PORT` part of a base URL (what the camera settings hold)
pub fn host_of(base_url: &str) -> String {
    base_url.trim_start_matches("http://").to_string()
}

/// Small solid-color JPEG
pub fn jpeg_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    encode(width, height, shade, ImageFormat::Jpeg)
}

/// Small solid-color PNG
pub fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    encode(width, height, shade, ImageFormat::Png)
}

fn encode(width: u32, height: u32, shade: u8, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([shade, shade / 2, 255 - shade]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("encode test image");
    out.into_inner()
}

/// ESP32-CAM style multipart body holding `frames`
pub fn mjpeg_body(boundary: &str, frames: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for frame in frames {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n");
        body.extend_from_slice(format!("Content-Length: {}\r\n\r\n", frame.len()).as_bytes());
        body.extend_from_slice(frame);
        body.extend_from_slice(b"\r\n");
    }
    body
}
