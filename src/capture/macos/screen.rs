//! macOS screen capture using Core Graphics
//!
//! Grabs display images with `CGDisplayCreateImageForRect` at the stream's
//! frame interval. Those images never contain the pointer, so the cursor is
//! composited from the current mouse location when the stream asks for it.

use crate::capture::polling::FrameGrabber;
use crate::capture::traits::{CaptureError, CaptureResult, DisplayInfo, StreamHandle};
use crate::capture::cursor::overlay_arrow;
use crate::capture::PixelBuffer;
use core_graphics::display::CGDisplay;
use core_graphics::event::CGEvent;
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use core_graphics::geometry::{CGPoint, CGRect, CGSize};

/// Get list of available displays
pub fn get_displays() -> Vec<DisplayInfo> {
    let display_ids = CGDisplay::active_displays().unwrap_or_default();

    display_ids
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            let display = CGDisplay::new(id);
            let bounds = display.bounds();
            let is_main = display.is_main();

            // Get refresh rate if available
            let refresh_rate = display
                .display_mode()
                .map(|mode| mode.refresh_rate() as u32)
                .filter(|&r| r > 0);

            DisplayInfo {
                id,
                name: if is_main {
                    "Main Display".to_string()
                } else {
                    format!("Display {}", index + 1)
                },
                x: bounds.origin.x as i32,
                y: bounds.origin.y as i32,
                width: bounds.size.width as u32,
                height: bounds.size.height as u32,
                scale_factor: display.pixels_high() as f64 / bounds.size.height,
                is_primary: is_main,
                refresh_rate,
            }
        })
        .collect()
}

/// Grabs a region of one display
pub struct DisplayGrabber {
    display: DisplayInfo,
    bounds: Option<CGRect>,
    show_cursor: bool,
}

/// Current pointer position in global display points
fn cursor_location() -> Option<CGPoint> {
    let source = CGEventSource::new(CGEventSourceStateID::CombinedSessionState).ok()?;
    CGEvent::new(source).ok().map(|event| event.location())
}

impl DisplayGrabber {
    pub fn new(display: DisplayInfo) -> Self {
        Self {
            display,
            bounds: None,
            show_cursor: false,
        }
    }
}

impl FrameGrabber for DisplayGrabber {
    fn open(&mut self, stream: &StreamHandle) -> CaptureResult<()> {
        if !super::permissions::has_screen_recording_permission() {
            super::permissions::request_screen_recording_permission();
            return Err(CaptureError::PermissionDenied);
        }
        if !CGDisplay::active_displays()
            .unwrap_or_default()
            .contains(&self.display.id)
        {
            return Err(CaptureError::ConfigurationFailed(format!(
                "display {} is not active",
                self.display.id
            )));
        }

        // Display-local rect in points
        let region = stream.region;
        self.bounds = Some(CGRect::new(
            &CGPoint::new(region.x as f64, region.y as f64),
            &CGSize::new(region.width as f64, region.height as f64),
        ));
        self.show_cursor = stream.show_cursor;
        Ok(())
    }

    fn grab(&mut self) -> CaptureResult<PixelBuffer> {
        let bounds = self
            .bounds
            .ok_or_else(|| CaptureError::ConfigurationFailed("grabber not opened".to_string()))?;

        let image = CGDisplay::new(self.display.id)
            .image_for_rect(bounds)
            .ok_or_else(|| {
                CaptureError::StreamTerminated(format!("display {} returned no image", self.display.id))
            })?;

        let width = image.width() as u32;
        let height = image.height() as u32;
        let stride = image.bytes_per_row() as u32;
        // Display images are 32-bit BGRA, little-endian
        let mut data = image.data().bytes().to_vec();

        if self.show_cursor {
            if let Some(location) = cursor_location() {
                let scale = width as f64 / bounds.size.width.max(1.0);
                let x = (location.x - self.display.x as f64 - bounds.origin.x) * scale;
                let y = (location.y - self.display.y as f64 - bounds.origin.y) * scale;
                overlay_arrow(&mut data, width, height, stride, x.round() as i64, y.round() as i64, scale);
            }
        }

        Ok(PixelBuffer::with_stride(width, height, stride, data))
    }
}
