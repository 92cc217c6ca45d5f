use std::time::Duration;

use slint::Color;

use crate::camera::CameraSelector;

// Overlay geometry, in logical pixels
pub const DEFAULT_CORNER_RADIUS: f32 = 16.0;
pub const DEFAULT_LINE_LENGTH: f32 = 72.0;
pub const DEFAULT_STROKE_WIDTH: f32 = 4.0;
/// Horizontal space left around the viewfinder when no explicit size is set.
pub const DEFAULT_OVERLAY_MARGIN: f32 = 80.0;
/// Black at 40% opacity.
pub const DEFAULT_SCRIM_ALPHA: u8 = 102;

pub const DEFAULT_PREVIEW_WIDTH: u32 = 1280;
pub const DEFAULT_PREVIEW_HEIGHT: u32 = 720;

pub const DEFAULT_UI_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_PERMISSION_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub corner_radius: f32,
    pub line_length: f32,
    pub stroke_width: f32,
    /// `None` means `viewport width - DEFAULT_OVERLAY_MARGIN`.
    pub overlay_size: Option<f32>,
    pub border_color: Color,
    pub scrim_color: Color,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            corner_radius: DEFAULT_CORNER_RADIUS,
            line_length: DEFAULT_LINE_LENGTH,
            stroke_width: DEFAULT_STROKE_WIDTH,
            overlay_size: None,
            border_color: Color::from_rgb_u8(255, 255, 255),
            scrim_color: Color::from_argb_u8(DEFAULT_SCRIM_ALPHA, 0, 0, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub overlay: OverlayConfig,
    pub camera_selector: CameraSelector,
    /// Stream size used when the viewfinder size is not known yet.
    pub preview_width: u32,
    pub preview_height: u32,
    pub ui_poll_interval: Duration,
    pub permission_poll_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            overlay: OverlayConfig::default(),
            camera_selector: CameraSelector::Back,
            preview_width: DEFAULT_PREVIEW_WIDTH,
            preview_height: DEFAULT_PREVIEW_HEIGHT,
            ui_poll_interval: Duration::from_millis(DEFAULT_UI_POLL_INTERVAL_MS),
            permission_poll_interval: Duration::from_millis(DEFAULT_PERMISSION_POLL_INTERVAL_MS),
        }
    }
}
