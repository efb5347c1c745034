use bytes::BytesMut;
use image::{ImageBuffer, Rgb, RgbImage};

use crate::error::AssemblyError;

// YUY2 packs two pixels into four bytes: Y0 U Y1 V
const BYTES_PER_PIXEL: usize = 2;

/// Turns one received buffer into a displayable image. The buffer is consumed;
/// nothing of it survives past this call.
pub fn assemble(frame: BytesMut, width: u32, height: u32) -> Result<RgbImage, AssemblyError> {
    if width == 0 || height == 0 || width % 2 != 0 {
        return Err(AssemblyError::InvalidGeometry { width, height });
    }

    let needed = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
        .ok_or(AssemblyError::InvalidGeometry { width, height })?;

    if frame.len() < needed {
        return Err(AssemblyError::BufferTooShort {
            needed,
            available: frame.len(),
        });
    }

    let rgb = yuy2_to_rgb(&frame[..needed]);

    ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .ok_or(AssemblyError::InvalidGeometry { width, height })
}

pub fn yuy2_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut image_buffer = Vec::with_capacity(data.len() / 2 * 3);

    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        image_buffer.extend_from_slice(&yuv_to_rgb(y0, u, v));
        image_buffer.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    image_buffer
}

// BT.601 studio swing, integer form
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
