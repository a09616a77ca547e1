//! Windows screen capture using GDI BitBlt
//!
//! Copies the configured region of the desktop into a top-down BGRA DIB.

use crate::capture::polling::FrameGrabber;
use crate::capture::traits::{CaptureError, CaptureResult, DisplayInfo, StreamHandle};
use crate::capture::PixelBuffer;
use windows::{
    Win32::Foundation::{BOOL, LPARAM, RECT},
    Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject,
        EnumDisplayMonitors, GetDC, GetDIBits, GetMonitorInfoW, ReleaseDC, SelectObject,
        BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HBRUSH, HDC, HMONITOR,
        MONITORINFOEXW, SRCCOPY,
    },
    Win32::UI::WindowsAndMessaging::{
        DrawIconEx, GetCursorInfo, GetDesktopWindow, CURSORINFO, CURSOR_SHOWING, DI_NORMAL, HICON,
    },
};

/// Get list of available displays on Windows
pub fn get_displays() -> Vec<DisplayInfo> {
    use std::mem::zeroed;

    let mut displays = Vec::new();
    let displays_ptr = &mut displays as *mut Vec<DisplayInfo>;

    unsafe extern "system" fn enum_monitors_callback(
        hmonitor: HMONITOR,
        _hdc: HDC,
        _rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let displays = &mut *(lparam.0 as *mut Vec<DisplayInfo>);

        let mut monitor_info: MONITORINFOEXW = unsafe { zeroed() };
        monitor_info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

        if unsafe { GetMonitorInfoW(hmonitor, &mut monitor_info.monitorInfo) }.as_bool() {
            let rect = monitor_info.monitorInfo.rcMonitor;
            let is_primary = (monitor_info.monitorInfo.dwFlags & 1) != 0; // MONITORINFOF_PRIMARY

            let name_len = monitor_info
                .szDevice
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(monitor_info.szDevice.len());
            let name = String::from_utf16_lossy(&monitor_info.szDevice[..name_len]);

            displays.push(DisplayInfo {
                id: displays.len() as u32,
                name: if is_primary {
                    "Primary Display".to_string()
                } else {
                    name
                },
                x: rect.left,
                y: rect.top,
                width: (rect.right - rect.left) as u32,
                height: (rect.bottom - rect.top) as u32,
                scale_factor: 1.0,
                is_primary,
                refresh_rate: None,
            });
        }

        BOOL::from(true)
    }

    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(enum_monitors_callback),
            LPARAM(displays_ptr as isize),
        );
    }

    if displays.is_empty() {
        displays.push(DisplayInfo::fallback());
    }

    displays
}

/// Desktop-space rectangle to copy
#[derive(Debug, Clone, Copy)]
struct Source {
    left: i32,
    top: i32,
    width: i32,
    height: i32,
}

/// Grabs a region of one monitor through the desktop DC
pub struct GdiGrabber {
    display: DisplayInfo,
    source: Option<Source>,
    show_cursor: bool,
}

impl GdiGrabber {
    pub fn new(display: DisplayInfo) -> Self {
        Self {
            display,
            source: None,
            show_cursor: false,
        }
    }
}

impl FrameGrabber for GdiGrabber {
    fn open(&mut self, stream: &StreamHandle) -> CaptureResult<()> {
        let region = stream.region;
        if region.width == 0 || region.height == 0 {
            return Err(CaptureError::ConfigurationFailed("empty capture region".to_string()));
        }

        self.source = Some(Source {
            left: self.display.x + region.x as i32,
            top: self.display.y + region.y as i32,
            width: region.width as i32,
            height: region.height as i32,
        });
        self.show_cursor = stream.show_cursor;
        Ok(())
    }

    fn grab(&mut self) -> CaptureResult<PixelBuffer> {
        use std::mem::zeroed;

        let src = self
            .source
            .ok_or_else(|| CaptureError::ConfigurationFailed("grabber not opened".to_string()))?;

        unsafe {
            let hwnd = GetDesktopWindow();
            let hdc_screen = GetDC(hwnd);
            if hdc_screen.is_invalid() {
                return Err(CaptureError::StreamTerminated("desktop DC unavailable".to_string()));
            }

            let hdc_mem = CreateCompatibleDC(hdc_screen);
            if hdc_mem.is_invalid() {
                ReleaseDC(hwnd, hdc_screen);
                return Err(CaptureError::StreamTerminated("CreateCompatibleDC failed".to_string()));
            }

            let hbitmap = CreateCompatibleBitmap(hdc_screen, src.width, src.height);
            if hbitmap.is_invalid() {
                let _ = DeleteDC(hdc_mem);
                ReleaseDC(hwnd, hdc_screen);
                return Err(CaptureError::StreamTerminated("CreateCompatibleBitmap failed".to_string()));
            }

            let old_bitmap = SelectObject(hdc_mem, hbitmap);
            let copied = BitBlt(
                hdc_mem, 0, 0, src.width, src.height, hdc_screen, src.left, src.top, SRCCOPY,
            )
            .is_ok();

            // BitBlt never includes the pointer
            if copied && self.show_cursor {
                let mut cursor = CURSORINFO {
                    cbSize: std::mem::size_of::<CURSORINFO>() as u32,
                    ..Default::default()
                };
                if GetCursorInfo(&mut cursor).is_ok() && cursor.flags == CURSOR_SHOWING {
                    let _ = DrawIconEx(
                        hdc_mem,
                        cursor.ptScreenPos.x - src.left,
                        cursor.ptScreenPos.y - src.top,
                        HICON(cursor.hCursor.0),
                        0,
                        0,
                        0,
                        HBRUSH::default(),
                        DI_NORMAL,
                    );
                }
            }

            let mut bmi: BITMAPINFO = zeroed();
            bmi.bmiHeader.biSize = std::mem::size_of::<BITMAPINFOHEADER>() as u32;
            bmi.bmiHeader.biWidth = src.width;
            bmi.bmiHeader.biHeight = -src.height; // Negative for top-down
            bmi.bmiHeader.biPlanes = 1;
            bmi.bmiHeader.biBitCount = 32; // BGRA
            bmi.bmiHeader.biCompression = BI_RGB.0;

            let mut buffer = vec![0u8; (src.width * src.height * 4) as usize];
            let lines = if copied {
                GetDIBits(
                    hdc_mem,
                    hbitmap,
                    0,
                    src.height as u32,
                    Some(buffer.as_mut_ptr() as *mut _),
                    &mut bmi,
                    DIB_RGB_COLORS,
                )
            } else {
                0
            };

            SelectObject(hdc_mem, old_bitmap);
            let _ = DeleteObject(hbitmap);
            let _ = DeleteDC(hdc_mem);
            ReleaseDC(hwnd, hdc_screen);

            if lines == 0 {
                return Err(CaptureError::StreamTerminated("BitBlt copy failed".to_string()));
            }

            Ok(PixelBuffer::new(src.width as u32, src.height as u32, buffer))
        }
    }
}
