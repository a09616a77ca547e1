//! Capture region handling
//!
//! Regions arrive from the UI in bottom-left-origin screen coordinates and are
//! normalized here into top-left-origin rectangles that fit the display.

use super::traits::{CaptureRequest, DisplayInfo, StreamHandle};
use crate::encoder::Resolution;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Smallest capturable width/height in points
pub const MIN_REGION_SIZE: u32 = 100;

/// Rectangle in bottom-left-origin screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Rectangle in top-left-origin display coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRect {
    /// The whole display
    pub fn full(display: &DisplayInfo) -> Self {
        Self {
            x: 0,
            y: 0,
            width: display.width,
            height: display.height,
        }
    }

    pub fn covers(&self, display: &DisplayInfo) -> bool {
        self.x == 0 && self.y == 0 && self.width >= display.width && self.height >= display.height
    }
}

/// Result of region normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    pub rect: CaptureRect,
    pub clamped: bool,
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Normalize a caller region against a display
///
/// Width and height are raised to [`MIN_REGION_SIZE`] (bounded by the display
/// itself), the origin is flipped with `y' = displayHeight - y - height`, then
/// clamped so the rectangle stays on the display.
pub fn normalize_region(region: Option<&ScreenRect>, display: &DisplayInfo) -> RegionPlan {
    let Some(region) = region else {
        return RegionPlan {
            rect: CaptureRect::full(display),
            clamped: false,
        };
    };

    let dw = display.width as f64;
    let dh = display.height as f64;
    let min_w = (MIN_REGION_SIZE as f64).min(dw);
    let min_h = (MIN_REGION_SIZE as f64).min(dh);

    let raw_w = finite_or_zero(region.width);
    let raw_h = finite_or_zero(region.height);
    let width = raw_w.clamp(min_w, dw).round();
    let height = raw_h.clamp(min_h, dh).round();

    let raw_x = finite_or_zero(region.x);
    let raw_y = dh - finite_or_zero(region.y) - height;
    let x = raw_x.clamp(0.0, dw - width).round();
    let y = raw_y.clamp(0.0, dh - height).round();

    let clamped = (width - raw_w.round()).abs() >= 1.0
        || (height - raw_h.round()).abs() >= 1.0
        || (x - raw_x.round()).abs() >= 1.0
        || (y - raw_y.round()).abs() >= 1.0;

    let rect = CaptureRect {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    };

    if clamped {
        let display_id = display.id;
        tracing::warn!(
            "Capture region {:?} clamped to {}x{} at ({}, {}) on display {}",
            region,
            rect.width,
            rect.height,
            rect.x,
            rect.y,
            display_id
        );
    }

    RegionPlan { rect, clamped }
}

fn round_even(value: f64) -> u32 {
    let even = ((value / 2.0).round() * 2.0) as u32;
    even.max(2)
}

/// Encoded frame size for a region
///
/// Full-display capture uses the preset dimensions. A sub-region is scaled to
/// the preset height, keeping its aspect ratio. Both dimensions are even.
pub fn output_size(rect: &CaptureRect, display: &DisplayInfo, resolution: Resolution) -> (u32, u32) {
    if rect.covers(display) || rect.height == 0 {
        return resolution.dimensions();
    }

    let target_h = resolution.height() as f64;
    let target_w = rect.width as f64 * target_h / rect.height as f64;
    (round_even(target_w), round_even(target_h))
}

/// Normalize a request into a stream handle
pub fn plan_stream(display: &DisplayInfo, request: &CaptureRequest) -> StreamHandle {
    let plan = normalize_region(request.region.as_ref(), display);
    let (output_width, output_height) = output_size(&plan.rect, display, request.resolution);

    StreamHandle {
        id: Uuid::new_v4(),
        display_id: display.id,
        region: plan.rect,
        output_width,
        output_height,
        frame_rate: request.frame_rate,
        show_cursor: request.show_cursor,
        clamped: plan.clamped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FrameRate;

    fn display() -> DisplayInfo {
        DisplayInfo::fallback()
    }

    #[test]
    fn test_small_region_is_clamped_to_minimum() {
        let plan = normalize_region(Some(&ScreenRect::new(200.0, 200.0, 50.0, 50.0)), &display());
        assert!(plan.clamped);
        assert_eq!(plan.rect.width, 100);
        assert_eq!(plan.rect.height, 100);
    }

    #[test]
    fn test_bottom_left_origin_is_flipped() {
        let plan = normalize_region(Some(&ScreenRect::new(100.0, 100.0, 400.0, 300.0)), &display());
        assert!(!plan.clamped);
        assert_eq!(
            plan.rect,
            CaptureRect {
                x: 100,
                y: 680,
                width: 400,
                height: 300
            }
        );
    }

    #[test]
    fn test_region_off_screen_is_pulled_back() {
        let plan = normalize_region(Some(&ScreenRect::new(1800.0, -50.0, 400.0, 300.0)), &display());
        assert!(plan.clamped);
        assert_eq!(plan.rect.x, 1520);
        assert_eq!(plan.rect.y, 780);
        assert_eq!(plan.rect.width, 400);
    }

    #[test]
    fn test_oversized_region_is_bounded_by_display() {
        let plan = normalize_region(Some(&ScreenRect::new(0.0, 0.0, 5000.0, 5000.0)), &display());
        assert!(plan.clamped);
        assert_eq!(plan.rect, CaptureRect::full(&display()));
    }

    #[test]
    fn test_non_finite_region_is_sanitized() {
        let plan = normalize_region(Some(&ScreenRect::new(f64::NAN, 0.0, f64::INFINITY, 200.0)), &display());
        assert!(plan.clamped);
        assert_eq!(plan.rect.x, 0);
        assert!(plan.rect.width >= MIN_REGION_SIZE);
    }

    #[test]
    fn test_full_display_uses_preset_dimensions() {
        let rect = CaptureRect::full(&display());
        assert_eq!(output_size(&rect, &display(), Resolution::Uhd2160), (3840, 2160));
    }

    #[test]
    fn test_sub_region_scales_to_preset_height() {
        let rect = CaptureRect {
            x: 10,
            y: 10,
            width: 401,
            height: 300,
        };
        let (w, h) = output_size(&rect, &display(), Resolution::Hd720);
        assert_eq!(h, 720);
        assert_eq!(w % 2, 0);
        assert_eq!(w, 962);
    }

    #[test]
    fn test_plan_stream_carries_request() {
        let request = CaptureRequest {
            region: Some(ScreenRect::new(0.0, 0.0, 50.0, 50.0)),
            resolution: Resolution::Hd1080,
            frame_rate: FrameRate::Fps60,
            show_cursor: false,
        };
        let handle = plan_stream(&display(), &request);
        assert!(handle.clamped);
        assert_eq!(handle.region.width, 100);
        assert_eq!((handle.output_width, handle.output_height), (1080, 1080));
        assert_eq!(handle.frame_rate, FrameRate::Fps60);
    }
}
