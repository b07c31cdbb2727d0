//! Frame decode + aspect-preserving fit into the display viewport.
//!
//! The UI reports its viewport size whenever it changes; the stream worker reads
//! it once per frame. Until the UI has a measurable size (both sides over 50 px)
//! frames are fitted into a 640x480 box.

use std::sync::{Arc, RwLock};

use image::imageops::FilterType;
use image::RgbImage;

/// Fallback target when the viewport is unknown or too small
pub const DEFAULT_VIEWPORT: (u32, u32) = (640, 480);

/// Sides at or below this are treated as "not measured yet"
pub const MIN_VIEWPORT_SIDE: u32 = 50;

/// Display area reported by the UI, shared with the stream worker
#[derive(Clone, Debug, Default)]
pub struct Viewport {
    size: Arc<RwLock<Option<(u32, u32)>>>,
}

impl Viewport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update viewport size (called when the display area resizes)
    pub fn set(&self, width: u32, height: u32) {
        *self.size.write().unwrap_or_else(|e| e.into_inner()) = Some((width, height));
    }

    pub fn clear(&self) {
        *self.size.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Box frames should be fitted into
    pub fn target(&self) -> (u32, u32) {
        match *self.size.read().unwrap_or_else(|e| e.into_inner()) {
            Some((w, h)) if w > MIN_VIEWPORT_SIDE && h > MIN_VIEWPORT_SIDE => (w, h),
            _ => DEFAULT_VIEWPORT,
        }
    }
}

/// Largest size with the source aspect ratio that fits inside `target`.
///
/// Scales up as well as down. Never returns a zero side.
pub fn fit_size(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = source;
    let (tw, th) = target;
    if sw == 0 || sh == 0 || tw == 0 || th == 0 {
        return (tw.max(1), th.max(1));
    }

    let ratio = (tw as f64 / sw as f64).min(th as f64 / sh as f64);
    let w = ((sw as f64 * ratio) as u32).clamp(1, tw);
    let h = ((sh as f64 * ratio) as u32).clamp(1, th);
    (w, h)
}

/// Decode JPEG/PNG bytes to RGB8 and fit into `target`
pub fn decode_and_scale(bytes: &[u8], target: (u32, u32)) -> image::ImageResult<RgbImage> {
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    Ok(scale_to_fit(&rgb, target))
}

pub fn scale_to_fit(image: &RgbImage, target: (u32, u32)) -> RgbImage {
    let (w, h) = fit_size(image.dimensions(), target);
    if (w, h) == image.dimensions() {
        return image.clone();
    }
    image::imageops::resize(image, w, h, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::jpeg_bytes;

    fn aspect(size: (u32, u32)) -> f64 {
        size.0 as f64 / size.1 as f64
    }

    #[test]
    fn test_fit_preserves_aspect_and_bounds() {
        let cases = [
            ((800, 600), (640, 480)),
            ((1600, 1200), (300, 900)),
            ((320, 240), (1920, 1080)),
            ((1024, 768), (777, 333)),
            ((97, 13), (640, 480)),
        ];
        for (source, target) in cases {
            let out = fit_size(source, target);
            assert!(out.0 <= target.0 && out.1 <= target.1, "{:?} -> {:?}", source, out);
            // Floor rounding moves the ratio by at most one pixel on the shorter side
            let rel = (aspect(out) - aspect(source)).abs() / aspect(source);
            assert!(rel <= 1.0 / out.0.min(out.1) as f64 + 1e-9, "{:?} -> {:?}", source, out);
            assert!(out.0 + 1 >= target.0 || out.1 + 1 >= target.1, "{:?} -> {:?}", source, out);
        }
    }

    #[test]
    fn test_fit_exact_matches() {
        assert_eq!(fit_size((800, 600), (640, 480)), (640, 480));
        assert_eq!(fit_size((320, 240), (640, 640)), (640, 480));
        assert_eq!(fit_size((100, 400), (640, 480)), (120, 480));
    }

    #[test]
    fn test_viewport_fallback() {
        let vp = Viewport::new();
        assert_eq!(vp.target(), DEFAULT_VIEWPORT);
        vp.set(40, 900);
        assert_eq!(vp.target(), DEFAULT_VIEWPORT);
        vp.set(1024, 700);
        assert_eq!(vp.target(), (1024, 700));
        vp.clear();
        assert_eq!(vp.target(), DEFAULT_VIEWPORT);
    }

    #[test]
    fn test_decode_and_scale_jpeg() {
        let bytes = jpeg_bytes(160, 120, 80);
        let img = decode_and_scale(&bytes, (400, 400)).unwrap();
        assert_eq!(img.dimensions(), (400, 300));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_and_scale(b"definitely not a jpeg", (640, 480)).is_err());
    }
}
