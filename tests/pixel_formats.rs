//! Pixel codec coverage (§8.1 property 8; §8.3 E2).

use wz_archive::{NullDiagnostics, PixelFormat, compress_canvas, decode_canvas};

const FORMATS: [PixelFormat; 7] = [
    PixelFormat::Bgra4444,
    PixelFormat::Bgra8888,
    PixelFormat::Argb1555,
    PixelFormat::Rgb565,
    PixelFormat::Rgb565MacroBlock,
    PixelFormat::Dxt3,
    PixelFormat::Dxt5,
];

fn checkerboard_rgba(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let on = (x + y) % 2 == 0;
            out.extend_from_slice(if on { &[255, 0, 0, 255] } else { &[0, 0, 255, 128] });
        }
    }
    out
}

/// Property 8 — whatever a payload actually contains, the decoded buffer is
/// always exactly `4 * width * height` bytes, for every format.
#[test]
fn decoded_area_is_4wh_for_every_format() {
    let (width, height) = (8, 8);
    for format in FORMATS {
        let source = checkerboard_rgba(width, height);
        let payload = compress_canvas(&source, width, height, format);
        let decoded = decode_canvas(&payload, width, height, format, &NullDiagnostics).unwrap();
        assert_eq!(decoded.len(), (4 * width * height) as usize, "format {format:?}");
    }
}

/// An unrecognized format id falls back to BGRA8888 and still yields the
/// expected area, with a warning recorded.
#[test]
fn unknown_format_falls_back_to_bgra8888() {
    use std::cell::RefCell;
    use wz_archive::{Diagnostics, WarnKind};

    struct RecordingDiagnostics(RefCell<Vec<WarnKind>>);
    impl Diagnostics for RecordingDiagnostics {
        fn warn(&self, kind: WarnKind) {
            self.0.borrow_mut().push(kind);
        }
    }

    let (width, height) = (4, 4);
    let payload = compress_canvas(&checkerboard_rgba(width, height), width, height, PixelFormat::Bgra8888);
    let diagnostics = RecordingDiagnostics(RefCell::new(Vec::new()));
    let decoded =
        decode_canvas(&payload, width, height, PixelFormat::Unknown(0xFFFF), &diagnostics).unwrap();
    assert_eq!(decoded.len(), (4 * width * height) as usize);
    assert!(diagnostics.0.borrow().iter().any(|w| matches!(w, WarnKind::UnknownPixelFormat { format: 0xFFFF })));
}

/// A deflate stream that runs out of input before filling the expected
/// buffer does not error; it warns and returns whatever bytes were produced.
#[test]
fn truncated_payload_warns_instead_of_erroring() {
    use std::cell::RefCell;
    use wz_archive::{Diagnostics, WarnKind};

    struct RecordingDiagnostics(RefCell<Vec<WarnKind>>);
    impl Diagnostics for RecordingDiagnostics {
        fn warn(&self, kind: WarnKind) {
            self.0.borrow_mut().push(kind);
        }
    }

    let (width, height) = (4, 4);
    let full = compress_canvas(&checkerboard_rgba(width, height), width, height, PixelFormat::Bgra8888);
    let truncated = &full[..full.len() / 2];
    let diagnostics = RecordingDiagnostics(RefCell::new(Vec::new()));
    let decoded = decode_canvas(truncated, width, height, PixelFormat::Bgra8888, &diagnostics).unwrap();
    assert_eq!(decoded.len(), (4 * width * height) as usize);
    assert!(diagnostics.0.borrow().iter().any(|w| matches!(w, WarnKind::TruncatedPixelData { .. })));
}

/// BGRA4444's nibble-to-channel layout: a word's low nibble is blue, then
/// green, then red, then the high nibble is alpha, each nibble expanded by
/// replication (`n | (n << 4)`). Values here are already nibble-exact
/// (multiples of 0x11) so the pack/decode cycle is lossless, independently
/// confirming the channel ordering the implementation uses.
#[test]
fn bgra4444_channel_order_round_trips_exactly() {
    let (width, height) = (1, 1);
    let source = vec![0x22u8, 0x44, 0x66, 0x88]; // r, g, b, a
    let payload = compress_canvas(&source, width, height, PixelFormat::Bgra4444);
    let decoded = decode_canvas(&payload, width, height, PixelFormat::Bgra4444, &NullDiagnostics).unwrap();
    assert_eq!(decoded, source);
}

/// Bgra8888 is a pure byte reorder with no quantization, so it round-trips
/// for arbitrary pixel values.
#[test]
fn bgra8888_round_trips_arbitrary_values() {
    let (width, height) = (2, 2);
    let rgba = vec![
        0xF8, 0xFC, 0x37, 0x91, 0x00, 0x00, 0x00, 0xFF, 0xF8, 0x12, 0x00, 0x00, 0x04, 0xFC, 0xF8, 0xFF,
    ];
    let payload = compress_canvas(&rgba, width, height, PixelFormat::Bgra8888);
    let decoded = decode_canvas(&payload, width, height, PixelFormat::Bgra8888, &NullDiagnostics).unwrap();
    assert_eq!(decoded, rgba);
}

/// Argb1555 and Rgb565 quantize their color channels to 5/6 bits; only
/// values already on that quantization grid (here: pure black/white, whose
/// 5-and-6-bit expansion both map back to 0 and 255 exactly) round-trip
/// losslessly. Rgb565 also carries no alpha channel, so it always decodes
/// fully opaque.
#[test]
fn argb1555_and_rgb565_round_trip_black_and_white() {
    let (width, height) = (2, 2);
    let argb_source = vec![
        0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF, 0x00, 0xFF, 0xFF, 0x00,
    ];
    let payload = compress_canvas(&argb_source, width, height, PixelFormat::Argb1555);
    let decoded = decode_canvas(&payload, width, height, PixelFormat::Argb1555, &NullDiagnostics).unwrap();
    assert_eq!(decoded, argb_source);

    let rgb_source = vec![
        0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00, 0xFF, 0x00, 0xFF, 0xFF, 0xFF,
    ];
    let payload = compress_canvas(&rgb_source, width, height, PixelFormat::Rgb565);
    let decoded = decode_canvas(&payload, width, height, PixelFormat::Rgb565, &NullDiagnostics).unwrap();
    assert_eq!(decoded, rgb_source);
}
