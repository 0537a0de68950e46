//! Conversion of raw engine samples into the packed per-mode buffer layout
//!
//! Int modes pack one native-endian `u32` per pixel, byte modes one byte per
//! pixel. Gamma is applied to the color samples first; alpha modes other than
//! premultiplied ARGB are then un-premultiplied.

use rayon::prelude::*;
use wide::u16x8;

use super::RasterFault;
use crate::types::ColorMode;

const LUMA_R: u16 = 77;
const LUMA_G: u16 = 150;
const LUMA_B: u16 = 28;
const BINARY_THRESHOLD: i32 = 128;

/// Interleaved RGB or RGBA samples, alpha premultiplied
#[derive(Clone, Copy, Debug)]
pub struct Samples<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub channels: usize,
    pub alpha: bool,
}

/// Pack `samples` into the layout of `mode`
pub fn pack(samples: &Samples<'_>, mode: ColorMode, gamma: f32) -> Result<Vec<u8>, RasterFault> {
    let Samples {
        data,
        width,
        height,
        stride,
        channels,
        alpha,
    } = *samples;

    if channels < 3 || (alpha && channels < 4) {
        return Err(RasterFault::NoBuffer(format!(
            "unsupported sample layout: {channels} channels"
        )));
    }
    let row_bytes = width * channels;
    // The last row may end short of a full stride when cut out of a larger buffer.
    let needed = match height {
        0 => 0,
        h => stride.saturating_mul(h - 1).saturating_add(row_bytes),
    };
    if data.len() < needed || row_bytes > stride {
        return Err(RasterFault::NoBuffer("sample buffer size mismatch".into()));
    }

    let bpp = mode.bytes_per_pixel();
    let len = width * height * bpp;
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|_| RasterFault::OutOfMemory)?;
    out.resize(len, 0);
    if len == 0 {
        return Ok(out);
    }

    let lut = gamma_table(gamma);
    let lut = lut.as_ref();
    let row_of = |y: usize| &data[y * stride..y * stride + row_bytes];

    if mode.is_packed_int() {
        out.par_chunks_mut(width * 4)
            .enumerate()
            .for_each(|(y, dst)| pack_int_row(row_of(y), channels, alpha, mode, lut, dst));
        return Ok(out);
    }

    out.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, dst)| luma_row(row_of(y), channels, lut, dst));

    match mode {
        ColorMode::Binary => out
            .par_iter_mut()
            .for_each(|v| *v = if i32::from(*v) >= BINARY_THRESHOLD { 255 } else { 0 }),
        ColorMode::BinaryDither => dither(&mut out, width, height),
        _ => {}
    }
    Ok(out)
}

/// Lookup table for `gamma`; `None` when the gamma is neutral or invalid
#[must_use]
pub fn gamma_table(gamma: f32) -> Option<[u8; 256]> {
    if !gamma.is_finite() || gamma <= 0.0 || (gamma - 1.0).abs() < f32::EPSILON {
        return None;
    }
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let v = (i as f32 / 255.0).powf(gamma) * 255.0;
        *slot = v.round().clamp(0.0, 255.0) as u8;
    }
    Some(table)
}

/// Pack a binary byte buffer into 1-bit rows, MSB first, set bits are white.
/// Each row is padded to a whole byte.
#[must_use]
pub fn pack_bits(bytes: &[u8], width: usize, height: usize) -> Vec<u8> {
    let row_len = width.div_ceil(8);
    let mut out = vec![0u8; row_len * height];
    if width == 0 {
        return out;
    }
    for (src, dst) in bytes.chunks_exact(width).zip(out.chunks_exact_mut(row_len)) {
        for (x, v) in src.iter().enumerate() {
            if *v != 0 {
                dst[x / 8] |= 0x80 >> (x % 8);
            }
        }
    }
    out
}

#[inline]
fn map(lut: Option<&[u8; 256]>, v: u8) -> u8 {
    lut.map_or(v, |t| t[usize::from(v)])
}

#[inline]
fn unpremultiply(c: u8, a: u8) -> u8 {
    if a == 0 {
        0
    } else {
        ((u32::from(c) * 255 + u32::from(a) / 2) / u32::from(a)).min(255) as u8
    }
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    (((u16::from(r) + 1) * LUMA_R + (u16::from(g) + 1) * LUMA_G + (u16::from(b) + 1) * LUMA_B)
        >> 8) as u8
}

fn pack_int_row(
    row: &[u8],
    channels: usize,
    alpha: bool,
    mode: ColorMode,
    lut: Option<&[u8; 256]>,
    dst: &mut [u8],
) {
    for (px, out) in row.chunks_exact(channels).zip(dst.chunks_exact_mut(4)) {
        let mut r = map(lut, px[0]);
        let mut g = map(lut, px[1]);
        let mut b = map(lut, px[2]);
        let a = if alpha { px[channels - 1] } else { 255 };
        if alpha && mode != ColorMode::ArgbPre {
            r = unpremultiply(r, a);
            g = unpremultiply(g, a);
            b = unpremultiply(b, a);
        }
        let (r, g, b, a) = (u32::from(r), u32::from(g), u32::from(b), u32::from(a));
        let value = match mode {
            ColorMode::Rgb => (r << 16) | (g << 8) | b,
            ColorMode::Argb | ColorMode::ArgbPre => (a << 24) | (r << 16) | (g << 8) | b,
            ColorMode::Bgr => (b << 16) | (g << 8) | r,
            ColorMode::Gray | ColorMode::Binary | ColorMode::BinaryDither => {
                u32::from(luma(r as u8, g as u8, b as u8))
            }
        };
        out.copy_from_slice(&value.to_ne_bytes());
    }
}

fn luma_row(row: &[u8], channels: usize, lut: Option<&[u8; 256]>, dst: &mut [u8]) {
    let simd_end = dst.len() / 8 * 8;
    let (simd_part, remainder) = dst.split_at_mut(simd_end);

    for (chunk_idx, lanes) in simd_part.chunks_exact_mut(8).enumerate() {
        let base = chunk_idx * 8;
        let channel = |c: usize| -> u16x8 {
            u16x8::new(std::array::from_fn(|k| {
                u16::from(map(lut, row[(base + k) * channels + c])) + 1
            }))
        };
        let value: u16x8 = (channel(0) * u16x8::splat(LUMA_R)
            + channel(1) * u16x8::splat(LUMA_G)
            + channel(2) * u16x8::splat(LUMA_B))
            >> 8;
        for (out, v) in lanes.iter_mut().zip(value.to_array()) {
            *out = v as u8;
        }
    }

    for (k, out) in remainder.iter_mut().enumerate() {
        let px = &row[(simd_end + k) * channels..];
        *out = luma(map(lut, px[0]), map(lut, px[1]), map(lut, px[2]));
    }
}

/// Floyd-Steinberg error diffusion to 0/255; only interior pixels spread error.
fn dither(buf: &mut [u8], width: usize, height: usize) {
    let mut cur = load_row(buf, 0, width);
    let mut next = if height > 1 {
        load_row(buf, 1, width)
    } else {
        Vec::new()
    };

    for y in 0..height {
        for x in 0..width {
            let old = cur[x];
            let new = if old >= BINARY_THRESHOLD { 255 } else { 0 };
            buf[y * width + x] = new as u8;
            let err = old - new;
            if x > 0 && x + 1 < width && y + 1 < height {
                cur[x + 1] += err * 7 / 16;
                next[x - 1] += err * 3 / 16;
                next[x] += err * 5 / 16;
                next[x + 1] += err / 16;
            }
        }
        if y + 1 < height {
            cur = std::mem::take(&mut next);
            if y + 2 < height {
                next = load_row(buf, y + 2, width);
            }
        }
    }
}

fn load_row(buf: &[u8], y: usize, width: usize) -> Vec<i32> {
    buf[y * width..(y + 1) * width]
        .iter()
        .map(|v| i32::from(*v))
        .collect()
}
