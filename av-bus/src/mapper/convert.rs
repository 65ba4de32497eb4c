//! CPU colour conversion to packed RGBA, used by the fallback path.
//!
//! YUV input is treated as BT.601 limited range.

use crate::frame::{CpuPlane, Frame};
use crate::stream::PixelFormat;

use super::dmabuf::ZeroCopyError;

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn yuv_to_rgba(y: u8, u: u8, v: u8, out: &mut [u8]) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    out[0] = clamp((298 * c + 409 * e + 128) >> 8);
    out[1] = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
    out[2] = clamp((298 * c + 516 * d + 128) >> 8);
    out[3] = 255;
}

fn check_plane(plane: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<(), ZeroCopyError> {
    if rows == 0 {
        return Ok(());
    }
    let need = stride * (rows - 1) + row_bytes;
    if stride < row_bytes || plane.len() < need {
        return Err(ZeroCopyError::FormatMismatch(format!(
            "plane of {} bytes, stride {stride}, needs {need}",
            plane.len()
        )));
    }
    Ok(())
}

pub fn nv12_to_rgba(
    y: &[u8],
    y_stride: usize,
    uv: &[u8],
    uv_stride: usize,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, ZeroCopyError> {
    check_plane(y, y_stride, width, height)?;
    check_plane(uv, uv_stride, width.div_ceil(2) * 2, height.div_ceil(2))?;
    let mut out = vec![0u8; width * height * 4];
    for row in 0..height {
        let yr = &y[row * y_stride..];
        let uvr = &uv[(row / 2) * uv_stride..];
        for col in 0..width {
            let c = (col / 2) * 2;
            let i = (row * width + col) * 4;
            yuv_to_rgba(yr[col], uvr[c], uvr[c + 1], &mut out[i..i + 4]);
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
pub fn yuv420p_to_rgba(
    y: &[u8],
    y_stride: usize,
    u: &[u8],
    u_stride: usize,
    v: &[u8],
    v_stride: usize,
    width: usize,
    height: usize,
) -> Result<Vec<u8>, ZeroCopyError> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    check_plane(y, y_stride, width, height)?;
    check_plane(u, u_stride, cw, ch)?;
    check_plane(v, v_stride, cw, ch)?;
    let mut out = vec![0u8; width * height * 4];
    for row in 0..height {
        for col in 0..width {
            let i = (row * width + col) * 4;
            let ci = (row / 2, col / 2);
            yuv_to_rgba(
                y[row * y_stride + col],
                u[ci.0 * u_stride + ci.1],
                v[ci.0 * v_stride + ci.1],
                &mut out[i..i + 4],
            );
        }
    }
    Ok(out)
}

/// Repacks a 3 or 4 byte-per-pixel plane into RGBA. `order` gives the
/// source byte of R, G and B.
fn repack(
    src: &[u8],
    stride: usize,
    bpp: usize,
    order: [usize; 3],
    width: usize,
    height: usize,
) -> Result<Vec<u8>, ZeroCopyError> {
    check_plane(src, stride, width * bpp, height)?;
    let mut out = vec![0u8; width * height * 4];
    for row in 0..height {
        for col in 0..width {
            let s = row * stride + col * bpp;
            let d = (row * width + col) * 4;
            out[d] = src[s + order[0]];
            out[d + 1] = src[s + order[1]];
            out[d + 2] = src[s + order[2]];
            out[d + 3] = if bpp == 4 { src[s + 3] } else { 255 };
        }
    }
    Ok(out)
}

/// Converts a CPU video frame to tightly packed RGBA.
pub fn frame_to_rgba(frame: &Frame) -> Result<Vec<u8>, ZeroCopyError> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let planes = frame.planes();
    let plane = |i: usize| -> Result<&CpuPlane, ZeroCopyError> {
        planes
            .get(i)
            .ok_or_else(|| ZeroCopyError::FormatMismatch(format!("missing plane {i}")))
    };
    match frame.pixel_format() {
        Some(PixelFormat::Nv12) => {
            let (y, uv) = (plane(0)?, plane(1)?);
            nv12_to_rgba(&y.data, y.stride, &uv.data, uv.stride, w, h)
        }
        Some(PixelFormat::Yuv420p) => {
            let (y, u, v) = (plane(0)?, plane(1)?, plane(2)?);
            yuv420p_to_rgba(&y.data, y.stride, &u.data, u.stride, &v.data, v.stride, w, h)
        }
        Some(PixelFormat::Rgba) => {
            let p = plane(0)?;
            repack(&p.data, p.stride, 4, [0, 1, 2], w, h)
        }
        Some(PixelFormat::Bgra) => {
            let p = plane(0)?;
            repack(&p.data, p.stride, 4, [2, 1, 0], w, h)
        }
        Some(PixelFormat::Rgb24) => {
            let p = plane(0)?;
            repack(&p.data, p.stride, 3, [0, 1, 2], w, h)
        }
        other => Err(ZeroCopyError::FormatMismatch(format!(
            "no RGBA conversion from {other:?}"
        ))),
    }
}

#[cfg(test)]
#[path = "convert_test.rs"]
mod convert_test;
