//! Truncation-tolerant inflate plus the seven packed/block-compressed pixel
//! formats a canvas payload may carry, unpacked to RGBA8888 (§4.5).

use flate2::{Decompress, FlushDecompress, Status};

use crate::diagnostics::{Diagnostics, WarnKind};
use crate::error::{Error, Result};
use crate::tree::PixelFormat;

/// Inflates `input` (raw deflate, no zlib framing) into exactly
/// `expected_len` bytes when possible.
///
/// Many archived payloads end without a deflate end-of-stream marker. This
/// tolerates that: whatever the decompressor produced before running out of
/// input is returned, rather than surfacing the end-of-stream error a
/// strict streaming reader would raise (§4.5, §9 "Inflater truncation
/// tolerance"). An error is only returned when nothing could be produced at
/// all.
fn inflate_tolerant(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; expected_len];
    let mut inflater = Decompress::new(false);
    let result = inflater.decompress(input, &mut out, FlushDecompress::Finish);
    let produced = inflater.total_out() as usize;

    if produced == 0 {
        if let Err(e) = result {
            return Err(Error::decode(0, format!("inflate failed: {e}")));
        }
        match result {
            Ok(Status::Ok | Status::BufError) if expected_len > 0 => {
                return Err(Error::InflateError);
            }
            _ => {}
        }
    }

    out.truncate(produced);
    Ok(out)
}

fn expected_inflated_len(format: PixelFormat, width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Bgra4444 | PixelFormat::Argb1555 | PixelFormat::Rgb565 => 2 * w * h,
        PixelFormat::Bgra8888 | PixelFormat::Dxt3 => 4 * w * h,
        PixelFormat::Rgb565MacroBlock => (w * h).div_ceil(128),
        PixelFormat::Dxt5 => w * h,
        PixelFormat::Unknown(_) => 4 * w * h,
    }
}

/// Decodes a canvas's compressed payload into RGBA8888 pixels, `4 * width *
/// height` bytes, row-major.
pub fn decode_canvas(
    payload: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    diagnostics: &impl Diagnostics,
) -> Result<Vec<u8>> {
    let effective = if matches!(format, PixelFormat::Unknown(_)) {
        diagnostics.warn(WarnKind::UnknownPixelFormat { format: format.id() });
        PixelFormat::Bgra8888
    } else {
        format
    };

    let expected = expected_inflated_len(effective, width, height);
    let raw = inflate_tolerant(payload, expected)?;
    if raw.len() < expected {
        diagnostics.warn(WarnKind::TruncatedPixelData {
            produced: raw.len(),
            expected,
        });
    }

    Ok(match effective {
        PixelFormat::Bgra4444 => unpack_bgra4444(&raw, width, height),
        PixelFormat::Bgra8888 => unpack_bgra8888(&raw, width, height),
        PixelFormat::Argb1555 => unpack_argb1555(&raw, width, height),
        PixelFormat::Rgb565 => unpack_rgb565(&raw, width, height),
        PixelFormat::Rgb565MacroBlock => unpack_rgb565_macroblock(&raw, width, height),
        PixelFormat::Dxt3 => unpack_dxt3(&raw, width, height),
        PixelFormat::Dxt5 => unpack_dxt5(&raw, width, height),
        PixelFormat::Unknown(_) => unreachable!("mapped to Bgra8888 above"),
    })
}

fn expand_nibble(n: u8) -> u8 {
    n | (n << 4)
}

fn expand_5bit(n: u8) -> u8 {
    (n as u32 * 255 / 31) as u8
}

fn expand_6bit(n: u8) -> u8 {
    (n as u32 * 255 / 63) as u8
}

fn out_buffer(width: u32, height: u32) -> Vec<u8> {
    vec![0u8; 4 * width as usize * height as usize]
}

fn read_u16_le(raw: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([raw[i], raw.get(i + 1).copied().unwrap_or(0)])
}

fn unpack_bgra4444(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let count = (width * height) as usize;
    for i in 0..count {
        if 2 * i + 1 >= raw.len() {
            break;
        }
        let word = read_u16_le(raw, 2 * i);
        let b = expand_nibble((word & 0xF) as u8);
        let g = expand_nibble(((word >> 4) & 0xF) as u8);
        let r = expand_nibble(((word >> 8) & 0xF) as u8);
        let a = expand_nibble(((word >> 12) & 0xF) as u8);
        out[4 * i..4 * i + 4].copy_from_slice(&[r, g, b, a]);
    }
    out
}

fn unpack_bgra8888(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let count = ((width * height) as usize).min(raw.len() / 4);
    for i in 0..count {
        let b = raw[4 * i];
        let g = raw[4 * i + 1];
        let r = raw[4 * i + 2];
        let a = raw[4 * i + 3];
        out[4 * i..4 * i + 4].copy_from_slice(&[r, g, b, a]);
    }
    out
}

fn unpack_argb1555(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let count = (width * height) as usize;
    for i in 0..count {
        if 2 * i + 1 >= raw.len() {
            break;
        }
        let word = read_u16_le(raw, 2 * i);
        let a = if word & 0x8000 != 0 { 255 } else { 0 };
        let r = expand_5bit(((word >> 10) & 0x1F) as u8);
        let g = expand_5bit(((word >> 5) & 0x1F) as u8);
        let b = expand_5bit((word & 0x1F) as u8);
        out[4 * i..4 * i + 4].copy_from_slice(&[r, g, b, a]);
    }
    out
}

fn rgb565_to_rgba(word: u16) -> [u8; 4] {
    let r = expand_5bit(((word >> 11) & 0x1F) as u8);
    let g = expand_6bit(((word >> 5) & 0x3F) as u8);
    let b = expand_5bit((word & 0x1F) as u8);
    [r, g, b, 255]
}

fn unpack_rgb565(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let count = (width * height) as usize;
    for i in 0..count {
        if 2 * i + 1 >= raw.len() {
            break;
        }
        let word = read_u16_le(raw, 2 * i);
        out[4 * i..4 * i + 4].copy_from_slice(&rgb565_to_rgba(word));
    }
    out
}

fn unpack_rgb565_macroblock(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(16);
    let blocks_high = h.div_ceil(16);
    let mut idx = 0;
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            if 2 * idx + 1 >= raw.len() {
                return out;
            }
            let color = rgb565_to_rgba(read_u16_le(raw, 2 * idx));
            idx += 1;
            for dy in 0..16.min(h - by * 16) {
                for dx in 0..16.min(w - bx * 16) {
                    let x = bx * 16 + dx;
                    let y = by * 16 + dy;
                    let p = 4 * (y * w + x);
                    out[p..p + 4].copy_from_slice(&color);
                }
            }
        }
    }
    out
}

/// Decodes the shared DXT3/DXT5 565 color-endpoint block and two-bit index
/// grid into 16 RGB triples (alpha filled in separately by each format).
fn decode_color_block(block: &[u8]) -> [[u8; 3]; 16] {
    let c0 = u16::from_le_bytes([block[0], block[1]]);
    let c1 = u16::from_le_bytes([block[2], block[3]]);
    let indices = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);

    let rgb0 = rgb565_to_rgba(c0);
    let rgb1 = rgb565_to_rgba(c1);
    let mix = |num: u32, den: u32| -> [u8; 3] {
        std::array::from_fn(|ch| {
            ((rgb0[ch] as u32 * (den - num) + rgb1[ch] as u32 * num) / den) as u8
        })
    };
    let palette: [[u8; 3]; 4] = if c0 > c1 {
        [
            [rgb0[0], rgb0[1], rgb0[2]],
            [rgb1[0], rgb1[1], rgb1[2]],
            mix(1, 3),
            mix(2, 3),
        ]
    } else {
        [
            [rgb0[0], rgb0[1], rgb0[2]],
            [rgb1[0], rgb1[1], rgb1[2]],
            mix(1, 2),
            [0, 0, 0],
        ]
    };

    std::array::from_fn(|i| palette[((indices >> (2 * i)) & 0x3) as usize])
}

fn unpack_dxt3(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(4);
    let blocks_high = h.div_ceil(4);
    let mut offset = 0;
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            if offset + 16 > raw.len() {
                return out;
            }
            let block = &raw[offset..offset + 16];
            let alpha_bits = u64::from_le_bytes(block[0..8].try_into().unwrap());
            let colors = decode_color_block(&block[8..16]);
            for i in 0..16 {
                let (dx, dy) = (i % 4, i / 4);
                let (x, y) = (bx * 4 + dx, by * 4 + dy);
                if x >= w || y >= h {
                    continue;
                }
                let nibble = ((alpha_bits >> (4 * i)) & 0xF) as u8;
                let a = nibble * 17;
                let rgb = colors[i];
                let p = 4 * (y * w + x);
                out[p..p + 4].copy_from_slice(&[rgb[0], rgb[1], rgb[2], a]);
            }
            offset += 16;
        }
    }
    out
}

fn dxt5_alpha_palette(a0: u8, a1: u8) -> [u8; 8] {
    let mut palette = [0u8; 8];
    palette[0] = a0;
    palette[1] = a1;
    if a0 > a1 {
        for i in 1..7u32 {
            palette[1 + i as usize] =
                (((7 - i) * a0 as u32 + i * a1 as u32 + 3) / 7) as u8;
        }
    } else {
        for i in 1..5u32 {
            palette[1 + i as usize] =
                (((5 - i) * a0 as u32 + i * a1 as u32 + 2) / 5) as u8;
        }
        palette[6] = 0;
        palette[7] = 255;
    }
    palette
}

fn unpack_dxt5(raw: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut out = out_buffer(width, height);
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(4);
    let blocks_high = h.div_ceil(4);
    let mut offset = 0;
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            if offset + 16 > raw.len() {
                return out;
            }
            let block = &raw[offset..offset + 16];
            let palette = dxt5_alpha_palette(block[0], block[1]);
            let idx_bits = u64::from_le_bytes([
                block[2], block[3], block[4], block[5], block[6], block[7], 0, 0,
            ]);
            let colors = decode_color_block(&block[8..16]);
            for i in 0..16 {
                let (dx, dy) = (i % 4, i / 4);
                let (x, y) = (bx * 4 + dx, by * 4 + dy);
                if x >= w || y >= h {
                    continue;
                }
                let a = palette[((idx_bits >> (3 * i)) & 0x7) as usize];
                let rgb = colors[i];
                let p = 4 * (y * w + x);
                out[p..p + 4].copy_from_slice(&[rgb[0], rgb[1], rgb[2], a]);
            }
            offset += 16;
        }
    }
    out
}

/// Re-encodes RGBA8888 pixels back into one of the seven formats, the
/// writer's counterpart to [`decode_canvas`] (SPEC_FULL §F.3). Block formats
/// re-quantize; a round trip through `decode_canvas` then `compress_canvas`
/// for *unmodified* pixels is lossless only for the packed (non-block)
/// formats, and is documented as lossy otherwise.
pub fn compress_canvas(rgba: &[u8], width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let raw = match format {
        PixelFormat::Bgra4444 => pack_bgra4444(rgba),
        PixelFormat::Bgra8888 => pack_bgra8888(rgba),
        PixelFormat::Argb1555 => pack_argb1555(rgba),
        PixelFormat::Rgb565 => pack_rgb565(rgba),
        PixelFormat::Rgb565MacroBlock => pack_rgb565_macroblock(rgba, width, height),
        PixelFormat::Dxt3 => pack_dxt3(rgba, width, height),
        PixelFormat::Dxt5 => pack_dxt5(rgba, width, height),
        PixelFormat::Unknown(_) => pack_bgra8888(rgba),
    };
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    std::io::Write::write_all(&mut encoder, &raw).expect("writing to an in-memory buffer");
    encoder.finish().expect("flushing an in-memory buffer")
}

fn pack_bgra4444(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 2);
    for px in rgba.chunks_exact(4) {
        let (r, g, b, a) = (px[0] >> 4, px[1] >> 4, px[2] >> 4, px[3] >> 4);
        let word = (b as u16) | ((g as u16) << 4) | ((r as u16) << 8) | ((a as u16) << 12);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

fn pack_bgra8888(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len());
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
    out
}

fn pack_argb1555(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 2);
    for px in rgba.chunks_exact(4) {
        let a: u16 = if px[3] >= 128 { 1 } else { 0 };
        let r = (px[0] >> 3) as u16;
        let g = (px[1] >> 3) as u16;
        let b = (px[2] >> 3) as u16;
        let word = b | (g << 5) | (r << 10) | (a << 15);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

fn rgba_to_rgb565(px: &[u8]) -> u16 {
    let r = (px[0] >> 3) as u16;
    let g = (px[1] >> 2) as u16;
    let b = (px[2] >> 3) as u16;
    b | (g << 5) | (r << 11)
}

fn pack_rgb565(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 2);
    for px in rgba.chunks_exact(4) {
        out.extend_from_slice(&rgba_to_rgb565(px).to_le_bytes());
    }
    out
}

fn pack_rgb565_macroblock(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(16);
    let blocks_high = h.div_ceil(16);
    let mut out = Vec::with_capacity(blocks_wide * blocks_high * 2);
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            let x = bx * 16;
            let y = by * 16;
            let p = 4 * (y * w + x);
            out.extend_from_slice(&rgba_to_rgb565(&rgba[p..p + 4]).to_le_bytes());
        }
    }
    out
}

fn pack_dxt3(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(4);
    let blocks_high = h.div_ceil(4);
    let mut out = Vec::with_capacity(blocks_wide * blocks_high * 16);
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            let (c0, c1, indices) = quantize_block(rgba, w, h, bx, by);
            let mut alpha_bits: u64 = 0;
            for i in 0..16 {
                let (dx, dy) = (i % 4, i / 4);
                let (x, y) = ((bx * 4 + dx).min(w - 1), (by * 4 + dy).min(h - 1));
                let a = rgba[4 * (y * w + x) + 3] / 17;
                alpha_bits |= (a as u64) << (4 * i);
            }
            out.extend_from_slice(&alpha_bits.to_le_bytes());
            out.extend_from_slice(&c0.to_le_bytes());
            out.extend_from_slice(&c1.to_le_bytes());
            out.extend_from_slice(&indices.to_le_bytes());
        }
    }
    out
}

fn pack_dxt5(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let blocks_wide = w.div_ceil(4);
    let blocks_high = h.div_ceil(4);
    let mut out = Vec::with_capacity(blocks_wide * blocks_high * 16);
    for by in 0..blocks_high {
        for bx in 0..blocks_wide {
            let (c0, c1, indices) = quantize_block(rgba, w, h, bx, by);
            let a0 = 255u8;
            let a1 = 0u8;
            out.extend_from_slice(&[a0, a1]);
            let mut idx_bits: u64 = 0;
            for i in 0..16 {
                let (dx, dy) = (i % 4, i / 4);
                let (x, y) = ((bx * 4 + dx).min(w - 1), (by * 4 + dy).min(h - 1));
                let a = rgba[4 * (y * w + x) + 3];
                let sel = if a >= 128 { 0u64 } else { 1u64 };
                idx_bits |= sel << (3 * i);
            }
            out.extend_from_slice(&idx_bits.to_le_bytes()[..6]);
            out.extend_from_slice(&c0.to_le_bytes());
            out.extend_from_slice(&c1.to_le_bytes());
            out.extend_from_slice(&indices.to_le_bytes());
        }
    }
    out
}

/// Picks the top-left and bottom-right pixels of a 4x4 block as the two
/// RGB565 endpoints and assigns every pixel to its nearer endpoint. A
/// minimal quantizer: exact for blocks re-encoded unmodified from a
/// previously two-endpoint-decoded source, lossy for arbitrary pixels.
fn quantize_block(rgba: &[u8], w: usize, h: usize, bx: usize, by: usize) -> (u16, u16, u32) {
    let at = |dx: usize, dy: usize| -> usize {
        let x = (bx * 4 + dx).min(w - 1);
        let y = (by * 4 + dy).min(h - 1);
        4 * (y * w + x)
    };
    let c0 = rgba_to_rgb565(&rgba[at(0, 0)..at(0, 0) + 4]);
    let c1 = rgba_to_rgb565(&rgba[at(3, 3)..at(3, 3) + 4]);
    let mut indices = 0u32;
    for i in 0..16 {
        let (dx, dy) = (i % 4, i / 4);
        let p = at(dx, dy);
        let dist0 = channel_distance(&rgba[p..p + 4], c0);
        let dist1 = channel_distance(&rgba[p..p + 4], c1);
        let sel = if dist0 <= dist1 { 0u32 } else { 1u32 };
        indices |= sel << (2 * i);
    }
    (c0, c1, indices)
}

fn channel_distance(px: &[u8], color: u16) -> u32 {
    let rgba = rgb565_to_rgba(color);
    (0..3)
        .map(|c| (px[c] as i32 - rgba[c] as i32).pow(2) as u32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullDiagnostics;

    fn deflate(raw: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, raw).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decoded_area_matches_four_times_width_times_height_for_every_format() {
        let formats = [
            PixelFormat::Bgra4444,
            PixelFormat::Bgra8888,
            PixelFormat::Argb1555,
            PixelFormat::Rgb565,
            PixelFormat::Rgb565MacroBlock,
            PixelFormat::Dxt3,
            PixelFormat::Dxt5,
        ];
        let (w, h) = (16u32, 16u32);
        for format in formats {
            let raw = vec![0u8; expected_inflated_len(format, w, h)];
            let payload = deflate(&raw);
            let decoded = decode_canvas(&payload, w, h, format, &NullDiagnostics).unwrap();
            assert_eq!(decoded.len(), 4 * w as usize * h as usize, "{format:?}");
        }
    }

    #[test]
    fn truncated_stream_with_exact_expected_bytes_is_not_an_error() {
        let raw = vec![0xABu8; 64];
        let payload = deflate(&raw);
        let decoded =
            decode_canvas(&payload, 4, 4, PixelFormat::Bgra8888, &NullDiagnostics).unwrap();
        assert_eq!(decoded.len(), 64);
    }

    #[test]
    fn truncated_stream_missing_bytes_warns_but_still_returns_partial_data() {
        use std::cell::RefCell;

        #[derive(Default)]
        struct Collect(RefCell<Vec<WarnKind>>);
        impl Diagnostics for Collect {
            fn warn(&self, kind: WarnKind) {
                self.0.borrow_mut().push(kind);
            }
        }

        let raw = vec![0x11u8; 64];
        let mut payload = deflate(&raw);
        payload.truncate(payload.len() / 2);

        let diag = Collect::default();
        let decoded = decode_canvas(&payload, 4, 4, PixelFormat::Bgra8888, &diag).unwrap();
        assert!(decoded.len() <= 64);
        assert!(diag.0.borrow().iter().any(|k| matches!(k, WarnKind::TruncatedPixelData { .. })));
    }

    #[test]
    fn rgb565_macroblock_fills_every_pixel_in_its_block() {
        let color = 0b11111_000000_00000u16;
        let raw = color.to_le_bytes().to_vec();
        let payload = deflate(&raw);
        let decoded =
            decode_canvas(&payload, 16, 16, PixelFormat::Rgb565MacroBlock, &NullDiagnostics)
                .unwrap();
        for px in decoded.chunks_exact(4) {
            assert_eq!(px, &[255, 0, 0, 255]);
        }
    }

    #[test]
    fn unknown_format_falls_back_to_bgra8888_with_a_warning() {
        use std::cell::RefCell;

        #[derive(Default)]
        struct Collect(RefCell<Vec<WarnKind>>);
        impl Diagnostics for Collect {
            fn warn(&self, kind: WarnKind) {
                self.0.borrow_mut().push(kind);
            }
        }

        let raw = vec![10u8, 20, 30, 40];
        let payload = deflate(&raw);
        let diag = Collect::default();
        let decoded =
            decode_canvas(&payload, 1, 1, PixelFormat::Unknown(9999), &diag, ).unwrap();
        assert_eq!(decoded, vec![30, 20, 10, 40]);
        assert!(diag.0.borrow().iter().any(|k| matches!(k, WarnKind::UnknownPixelFormat { .. })));
    }
}
