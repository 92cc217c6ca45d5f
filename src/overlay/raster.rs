use slint::{Color, Image, Rgba8Pixel, SharedPixelBuffer};
use tiny_skia::{BlendMode, FillRule, Paint, PathBuilder, Pixmap, Stroke, Transform};

use super::{DrawCommand, Point, Rect};

/// Rasterized overlay, premultiplied RGBA.
pub struct OverlayImage {
    pixmap: Pixmap,
}

impl OverlayImage {
    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Premultiplied RGBA bytes of the pixel at `x`, `y`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let p = self.pixmap.pixel(x, y)?;
        Some([p.red(), p.green(), p.blue(), p.alpha()])
    }

    pub fn data(&self) -> &[u8] {
        self.pixmap.data()
    }

    pub fn to_slint_image(&self) -> Image {
        let buffer = SharedPixelBuffer::<Rgba8Pixel>::clone_from_slice(
            self.pixmap.data(),
            self.width(),
            self.height(),
        );
        Image::from_rgba8_premultiplied(buffer)
    }
}

fn paint(color: Color) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(color.red(), color.green(), color.blue(), color.alpha());
    paint.anti_alias = true;
    paint
}

/// Append a clockwise elliptical arc to `pb`, starting from the point on the
/// ellipse at `start_angle`. The current point must already be there.
fn append_arc(pb: &mut PathBuilder, bounds: &Rect, start_angle: f32, sweep_angle: f32) {
    let rx = bounds.size.width / 2.0;
    let ry = bounds.size.height / 2.0;
    let cx = bounds.origin.x + rx;
    let cy = bounds.origin.y + ry;

    let segments = (sweep_angle.abs() / 90.0).ceil().max(1.0) as usize;
    let step = sweep_angle.to_radians() / segments as f32;
    let k = 4.0 / 3.0 * (step / 4.0).tan();

    let mut a0 = start_angle.to_radians();
    for _ in 0..segments {
        let a1 = a0 + step;
        let (s0, c0) = a0.sin_cos();
        let (s1, c1) = a1.sin_cos();
        pb.cubic_to(
            cx + rx * (c0 - k * s0),
            cy + ry * (s0 + k * c0),
            cx + rx * (c1 + k * s1),
            cy + ry * (s1 - k * c1),
            cx + rx * c1,
            cy + ry * s1,
        );
        a0 = a1;
    }
}

fn arc_start(bounds: &Rect, angle: f32) -> Point {
    let rx = bounds.size.width / 2.0;
    let ry = bounds.size.height / 2.0;
    let (s, c) = angle.to_radians().sin_cos();
    Point::new(bounds.origin.x + rx + rx * c, bounds.origin.y + ry + ry * s)
}

fn round_rect(pb: &mut PathBuilder, rect: &Rect, radius: f32) {
    let Rect { origin, size } = *rect;
    let r = radius.min(size.width / 2.0).min(size.height / 2.0).max(0.0);
    let d = 2.0 * r;
    let right = origin.x + size.width;
    let bottom = origin.y + size.height;

    pb.move_to(origin.x + r, origin.y);
    pb.line_to(right - r, origin.y);
    append_arc(pb, &Rect::new(right - d, origin.y, d, d), 270.0, 90.0);
    pb.line_to(right, bottom - r);
    append_arc(pb, &Rect::new(right - d, bottom - d, d, d), 0.0, 90.0);
    pb.line_to(origin.x + r, bottom);
    append_arc(pb, &Rect::new(origin.x, bottom - d, d, d), 90.0, 90.0);
    pb.line_to(origin.x, origin.y + r);
    append_arc(pb, &Rect::new(origin.x, origin.y, d, d), 180.0, 90.0);
    pb.close();
}

fn draw(pixmap: &mut Pixmap, command: &DrawCommand) {
    match command {
        DrawCommand::FillRect { rect, color } => {
            if let Some(rect) = tiny_skia::Rect::from_xywh(
                rect.origin.x,
                rect.origin.y,
                rect.size.width,
                rect.size.height,
            ) {
                pixmap.fill_rect(rect, &paint(*color), Transform::identity(), None);
            }
        }
        DrawCommand::ClearRoundRect { rect, radius } => {
            let mut pb = PathBuilder::new();
            round_rect(&mut pb, rect, *radius);
            if let Some(path) = pb.finish() {
                let mut clear = paint(Color::from_argb_u8(0, 0, 0, 0));
                clear.blend_mode = BlendMode::Clear;
                pixmap.fill_path(&path, &clear, FillRule::Winding, Transform::identity(), None);
            }
        }
        DrawCommand::StrokeArc {
            bounds,
            start_angle,
            sweep_angle,
            color,
            stroke_width,
        } => {
            let mut pb = PathBuilder::new();
            let start = arc_start(bounds, *start_angle);
            pb.move_to(start.x, start.y);
            append_arc(&mut pb, bounds, *start_angle, *sweep_angle);
            if let Some(path) = pb.finish() {
                let stroke = Stroke {
                    width: *stroke_width,
                    ..Default::default()
                };
                pixmap.stroke_path(&path, &paint(*color), &stroke, Transform::identity(), None);
            }
        }
        DrawCommand::StrokeLine {
            start,
            end,
            color,
            stroke_width,
        } => {
            let mut pb = PathBuilder::new();
            pb.move_to(start.x, start.y);
            pb.line_to(end.x, end.y);
            if let Some(path) = pb.finish() {
                let stroke = Stroke {
                    width: *stroke_width,
                    ..Default::default()
                };
                pixmap.stroke_path(&path, &paint(*color), &stroke, Transform::identity(), None);
            }
        }
    }
}

/// Paint `commands` in order onto a transparent `width` x `height` canvas.
/// Returns `None` for a zero-sized canvas.
pub fn rasterize(commands: &[DrawCommand], width: u32, height: u32) -> Option<OverlayImage> {
    let mut pixmap = Pixmap::new(width, height)?;
    for command in commands {
        draw(&mut pixmap, command);
    }
    Some(OverlayImage { pixmap })
}

#[cfg(test)]
mod tests {
    use crate::overlay::ScannerOverlay;

    #[test]
    fn scrim_cutout_and_brackets() {
        let image = ScannerOverlay::default().render(400, 800, 1.0).unwrap();

        assert_eq!(image.pixel(0, 0), Some([0, 0, 0, 102]));
        assert_eq!(image.pixel(399, 799), Some([0, 0, 0, 102]));
        // centre of the viewfinder is see-through
        assert_eq!(image.pixel(200, 400), Some([0, 0, 0, 0]));
        // top-left horizontal bracket segment
        assert_eq!(image.pixel(90, 240), Some([255, 255, 255, 255]));
        // no bracket between the two top corners
        assert_eq!(image.pixel(200, 241), Some([0, 0, 0, 0]));
    }

    #[test]
    fn rendering_is_deterministic() {
        let overlay = ScannerOverlay::default();
        let a = overlay.render(360, 640, 1.5).unwrap();
        let b = overlay.render(360, 640, 1.5).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn zero_sized_canvas() {
        assert!(ScannerOverlay::default().render(0, 640, 1.0).is_none());
    }
}
