//! Scanner viewfinder overlay.
//!
//! The overlay is a dimmed scrim covering the whole viewport with a square,
//! rounded cut-out in the middle and a bracket at each corner of the cut-out.
//! [`ScannerOverlay::commands`] turns the overlay parameters and a viewport
//! size into a flat list of [`DrawCommand`]s; [`raster`] paints them into an
//! RGBA image that the UI layers above the camera preview.

mod raster;

use slint::Color;

use crate::config::{OverlayConfig, DEFAULT_OVERLAY_MARGIN};

pub use raster::{rasterize, OverlayImage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            origin: Point::new(x, y),
            size: Size::new(width, height),
        }
    }
}

/// A single drawing step. Angles are in degrees, clockwise from the positive
/// x axis (y points down).
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    FillRect {
        rect: Rect,
        color: Color,
    },
    /// Punch a fully transparent rounded rectangle through what was drawn so far.
    ClearRoundRect {
        rect: Rect,
        radius: f32,
    },
    StrokeArc {
        bounds: Rect,
        start_angle: f32,
        sweep_angle: f32,
        color: Color,
        stroke_width: f32,
    },
    StrokeLine {
        start: Point,
        end: Point,
        color: Color,
        stroke_width: f32,
    },
}

/// Start angle of the quarter arc for each corner:
/// top-left, top-right, bottom-left, bottom-right.
const CORNER_START_ANGLES: [f32; 4] = [180.0, 270.0, 90.0, 0.0];

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerOverlay {
    pub corner_radius: f32,
    pub line_length: f32,
    pub stroke_width: f32,
    pub overlay_size: Option<f32>,
    pub border_color: Color,
    pub scrim_color: Color,
}

impl Default for ScannerOverlay {
    fn default() -> Self {
        Self::from(&OverlayConfig::default())
    }
}

impl From<&OverlayConfig> for ScannerOverlay {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            corner_radius: config.corner_radius,
            line_length: config.line_length,
            stroke_width: config.stroke_width,
            overlay_size: config.overlay_size,
            border_color: config.border_color,
            scrim_color: config.scrim_color,
        }
    }
}

impl ScannerOverlay {
    /// Side of the viewfinder square in physical pixels.
    ///
    /// `viewport` is in physical pixels, the overlay parameters are logical and
    /// get multiplied by `scale`.
    pub fn viewfinder_side(&self, viewport: Size, scale: f32) -> f32 {
        let logical = self
            .overlay_size
            .unwrap_or(viewport.width / scale - DEFAULT_OVERLAY_MARGIN);
        (logical * scale).clamp(0.0, viewport.width.min(viewport.height).max(0.0))
    }

    pub fn commands(&self, viewport: Size, scale: f32) -> Vec<DrawCommand> {
        if viewport.is_empty() || scale <= 0.0 {
            return vec![];
        }

        let side = self.viewfinder_side(viewport, scale);
        let radius = self.corner_radius * scale;
        let line_length = self.line_length * scale;
        let stroke_width = self.stroke_width * scale;

        let origin = Point::new(
            (viewport.width - side) / 2.0,
            (viewport.height - side) / 2.0,
        );

        let mut commands = vec![DrawCommand::FillRect {
            rect: Rect::new(0.0, 0.0, viewport.width, viewport.height),
            color: self.scrim_color,
        }];

        if side <= 0.0 {
            return commands;
        }

        commands.push(DrawCommand::ClearRoundRect {
            rect: Rect::new(origin.x, origin.y, side, side),
            radius,
        });

        let arc = 2.0 * radius;
        if side < arc {
            return commands;
        }

        let at = |x: f32, y: f32| Point::new(origin.x + x, origin.y + y);
        let corners = [
            (0.0, 0.0),
            (side - arc, 0.0),
            (0.0, side - arc),
            (side - arc, side - arc),
        ];

        for (index, (x, y)) in corners.into_iter().enumerate() {
            commands.push(DrawCommand::StrokeArc {
                bounds: Rect::new(origin.x + x, origin.y + y, arc, arc),
                start_angle: CORNER_START_ANGLES[index],
                sweep_angle: 90.0,
                color: self.border_color,
                stroke_width,
            });

            // horizontal segment first, then vertical
            let (horizontal, vertical) = match index {
                0 => (
                    (at(radius, y), at(radius + line_length, y)),
                    (at(x, radius), at(x, radius + line_length)),
                ),
                1 => (
                    (at(side - radius, y), at(side - radius - line_length, y)),
                    (at(side, radius), at(side, radius + line_length)),
                ),
                2 => (
                    (at(radius, side), at(radius + line_length, side)),
                    (at(x, side - radius), at(x, side - radius - line_length)),
                ),
                _ => (
                    (at(side - radius, side), at(side - radius - line_length, side)),
                    (at(side, side - radius), at(side, side - radius - line_length)),
                ),
            };

            for (start, end) in [horizontal, vertical] {
                commands.push(DrawCommand::StrokeLine {
                    start,
                    end,
                    color: self.border_color,
                    stroke_width,
                });
            }
        }

        commands
    }

    /// Paint the overlay for a `width` x `height` physical-pixel viewport.
    pub fn render(&self, width: u32, height: u32, scale: f32) -> Option<OverlayImage> {
        let commands = self.commands(Size::new(width as f32, height as f32), scale);
        rasterize(&commands, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(commands: &[DrawCommand]) -> Vec<(Point, Point)> {
        commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::StrokeLine { start, end, .. } => Some((*start, *end)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn default_overlay_layout() {
        let overlay = ScannerOverlay::default();
        let commands = overlay.commands(Size::new(400.0, 800.0), 1.0);

        // scrim + cut-out + 4 * (arc + 2 lines)
        assert_eq!(commands.len(), 14);
        assert_eq!(
            commands[0],
            DrawCommand::FillRect {
                rect: Rect::new(0.0, 0.0, 400.0, 800.0),
                color: Color::from_argb_u8(102, 0, 0, 0),
            }
        );
        assert_eq!(
            commands[1],
            DrawCommand::ClearRoundRect {
                rect: Rect::new(40.0, 240.0, 320.0, 320.0),
                radius: 16.0,
            }
        );
    }

    #[test]
    fn arcs_sit_in_corners_with_expected_angles() {
        let overlay = ScannerOverlay::default();
        let commands = overlay.commands(Size::new(400.0, 800.0), 1.0);
        let arcs: Vec<(Rect, f32, f32)> = commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::StrokeArc {
                    bounds,
                    start_angle,
                    sweep_angle,
                    ..
                } => Some((*bounds, *start_angle, *sweep_angle)),
                _ => None,
            })
            .collect();

        assert_eq!(
            arcs,
            vec![
                (Rect::new(40.0, 240.0, 32.0, 32.0), 180.0, 90.0),
                (Rect::new(328.0, 240.0, 32.0, 32.0), 270.0, 90.0),
                (Rect::new(40.0, 528.0, 32.0, 32.0), 90.0, 90.0),
                (Rect::new(328.0, 528.0, 32.0, 32.0), 0.0, 90.0),
            ]
        );
    }

    #[test]
    fn bracket_lines_extend_from_arcs() {
        let overlay = ScannerOverlay::default();
        let lines = lines(&overlay.commands(Size::new(400.0, 800.0), 1.0));
        let p = Point::new;

        assert_eq!(
            lines,
            vec![
                (p(56.0, 240.0), p(128.0, 240.0)),
                (p(40.0, 256.0), p(40.0, 328.0)),
                (p(344.0, 240.0), p(272.0, 240.0)),
                (p(360.0, 256.0), p(360.0, 328.0)),
                (p(56.0, 560.0), p(128.0, 560.0)),
                (p(40.0, 544.0), p(40.0, 472.0)),
                (p(344.0, 560.0), p(272.0, 560.0)),
                (p(360.0, 544.0), p(360.0, 472.0)),
            ]
        );
    }

    #[test]
    fn scale_factor_applies_to_parameters() {
        let overlay = ScannerOverlay::default();
        let commands = overlay.commands(Size::new(800.0, 1600.0), 2.0);

        assert_eq!(
            commands[1],
            DrawCommand::ClearRoundRect {
                rect: Rect::new(80.0, 480.0, 640.0, 640.0),
                radius: 32.0,
            }
        );
        match &commands[2] {
            DrawCommand::StrokeArc { stroke_width, .. } => assert_eq!(*stroke_width, 8.0),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn identical_inputs_give_identical_commands() {
        let overlay = ScannerOverlay {
            overlay_size: Some(250.0),
            ..Default::default()
        };
        let viewport = Size::new(1080.0, 2340.0);
        assert_eq!(
            overlay.commands(viewport, 2.75),
            overlay.commands(viewport, 2.75)
        );
    }

    #[test]
    fn landscape_viewport_clamps_square_to_height() {
        let overlay = ScannerOverlay::default();
        assert_eq!(overlay.viewfinder_side(Size::new(1000.0, 300.0), 1.0), 300.0);
    }

    #[test]
    fn narrow_viewport_draws_only_scrim() {
        let overlay = ScannerOverlay::default();
        let commands = overlay.commands(Size::new(60.0, 400.0), 1.0);
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], DrawCommand::FillRect { .. }));
    }

    #[test]
    fn small_viewfinder_skips_brackets() {
        let overlay = ScannerOverlay {
            overlay_size: Some(20.0),
            ..Default::default()
        };
        let commands = overlay.commands(Size::new(400.0, 400.0), 1.0);
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn empty_viewport_has_no_commands() {
        let overlay = ScannerOverlay::default();
        assert!(overlay.commands(Size::new(0.0, 800.0), 1.0).is_empty());
    }
}
