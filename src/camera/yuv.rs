//! CPU pixel conversions for camera frames.

use anyhow::{anyhow, Result};
use image::{imageops, RgbaImage};

/// YUV420SP (NV21: full Y plane, then interleaved V/U) to RGBA.
pub fn yuv420sp_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let (width, height) = (width as usize, height as usize);
    let frame_size = width * height;
    let expected = frame_size + 2 * ((width + 1) / 2) * ((height + 1) / 2);
    if data.len() < expected {
        return Err(anyhow!(
            "yuv buffer too small: {} bytes for {width}x{height}",
            data.len()
        ));
    }

    let mut rgba = Vec::with_capacity(frame_size * 4);
    for j in 0..height {
        let mut uvp = frame_size + (j >> 1) * width;
        let (mut u, mut v) = (0, 0);
        for i in 0..width {
            let y = (data[j * width + i] as i32 - 16).max(0);
            if i & 1 == 0 {
                v = data[uvp] as i32 - 128;
                u = data[uvp + 1] as i32 - 128;
                uvp += 2;
            }

            let y1192 = 1192 * y;
            let r = (y1192 + 1634 * v).clamp(0, 262143);
            let g = (y1192 - 833 * v - 400 * u).clamp(0, 262143);
            let b = (y1192 + 2066 * u).clamp(0, 262143);

            rgba.extend_from_slice(&[(r >> 10) as u8, (g >> 10) as u8, (b >> 10) as u8, 255]);
        }
    }
    Ok(rgba)
}

/// BGRA to RGBA, reusing `rgba` as the output buffer.
pub fn bgra_to_rgba(bgra: &[u8], rgba: &mut Vec<u8>) {
    rgba.clear();
    rgba.reserve(bgra.len());
    for px in bgra.chunks_exact(4) {
        rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
}

/// Rotate clockwise by `degrees` (a multiple of 90) and optionally mirror
/// horizontally afterwards. Returns the new buffer with its size.
pub fn orient_rgba(
    rgba: Vec<u8>,
    width: u32,
    height: u32,
    degrees: i32,
    mirror: bool,
) -> Result<(Vec<u8>, u32, u32)> {
    let image = RgbaImage::from_raw(width, height, rgba)
        .ok_or(anyhow!("rgba buffer does not match {width}x{height}"))?;

    let mut image = match degrees.rem_euclid(360) {
        0 => image,
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        other => return Err(anyhow!("unsupported rotation: {other}")),
    };
    if mirror {
        imageops::flip_horizontal_in_place(&mut image);
    }

    let (width, height) = image.dimensions();
    Ok((image.into_raw(), width, height))
}
