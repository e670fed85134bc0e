//! Screen Video (FLV codec 3) keyframe encoding
//!
//! The image is split into 64x64 blocks, ordered bottom row first and left
//! to right. Each block holds its pixels as BGR, bottom line first, inside a
//! zlib stream. Blocks on the right and top edges may be smaller.
//!
//! The zlib streams use stored (uncompressed) deflate blocks, which keeps
//! the encoder dependency-free at the cost of file size.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::media::frame::BYTES_PER_PIXEL;
use crate::media::{Resolution, VideoFrame};

/// Block edge in pixels
pub const BLOCK_SIZE: u32 = 64;

/// Largest width or height the 12-bit size fields can carry
pub const MAX_DIMENSION: u32 = 0x0FFF;

/// Largest stored deflate block
const MAX_STORED_BLOCK: usize = 0xFFFF;

// A whole image block always fits in one stored deflate block
const _: () = assert!((BLOCK_SIZE * BLOCK_SIZE * 3) as usize <= MAX_STORED_BLOCK);

/// Largest prime below 2^16
const ADLER_MOD: u32 = 65_521;

/// Bytes that can be summed before the Adler-32 accumulators must be reduced
const ADLER_NMAX: usize = 5_552;

/// Encode `frame` as a Screen Video keyframe body (without the FLV video
/// tag header byte)
pub fn encode_keyframe(frame: &VideoFrame) -> Result<Bytes> {
    let (width, height) = (frame.width, frame.height);
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::RecorderUnavailable(format!(
            "frame size {}x{} not representable as screen video",
            width, height
        )));
    }
    if !frame.is_well_formed() {
        return Err(Error::RecorderUnavailable(format!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.data.len(),
            width,
            height
        )));
    }

    let block_code = ((BLOCK_SIZE / 16 - 1) as u16) << 12;
    let mut out = BytesMut::new();
    out.put_u16(block_code | width as u16);
    out.put_u16(block_code | height as u16);

    let mut block = Vec::with_capacity((BLOCK_SIZE * BLOCK_SIZE * 3) as usize);
    let stride = width as usize * BYTES_PER_PIXEL;

    let mut bottom = 0;
    while bottom < height {
        let rows = BLOCK_SIZE.min(height - bottom);
        let mut left = 0;
        while left < width {
            let cols = BLOCK_SIZE.min(width - left);

            block.clear();
            for line in 0..rows {
                // Distance from the bottom edge, converted to a top-down row
                let y = (height - 1 - (bottom + line)) as usize;
                let start = y * stride + left as usize * BYTES_PER_PIXEL;
                let end = start + cols as usize * BYTES_PER_PIXEL;
                for px in frame.data[start..end].chunks_exact(BYTES_PER_PIXEL) {
                    block.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }

            let compressed = zlib_stored(&block);
            out.put_u16(compressed.len() as u16);
            out.put_slice(&compressed);

            left += cols;
        }
        bottom += rows;
    }

    Ok(out.freeze())
}

/// Encoded size of a keyframe at `resolution`
///
/// Each block costs its BGR pixels plus a size field, the zlib header, the
/// stored block header and the checksum.
pub fn keyframe_len(resolution: Resolution) -> usize {
    let blocks = resolution.width.div_ceil(BLOCK_SIZE) as usize
        * resolution.height.div_ceil(BLOCK_SIZE) as usize;
    4 + blocks * (2 + 2 + 5 + 4) + resolution.pixel_count() * 3
}

/// Wrap `data` (at most one stored block long) in a zlib stream
fn zlib_stored(data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_STORED_BLOCK);
    let len = data.len() as u16;
    let mut out = Vec::with_capacity(data.len() + 11);

    // CMF: deflate, 32K window. FLG: no dictionary, check bits.
    out.extend_from_slice(&[0x78, 0x01]);
    // Final stored block
    out.push(0x01);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&(!len).to_le_bytes());
    out.extend_from_slice(data);

    out.extend_from_slice(&adler32(data).to_be_bytes());
    out
}

/// Adler-32 checksum
fn adler32(data: &[u8]) -> u32 {
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in data.chunks(ADLER_NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"a"), 0x0062_0062);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_adler32_long_input() {
        // Exercises the reduction between chunks
        let data = vec![0xFF; 20_000];
        let (mut a, mut b) = (1u64, 0u64);
        for &byte in &data {
            a = (a + byte as u64) % 65_521;
            b = (b + a) % 65_521;
        }
        assert_eq!(adler32(&data), ((b << 16) | a) as u32);
    }

    #[test]
    fn test_zlib_stored_layout() {
        let out = zlib_stored(b"abc");
        assert_eq!(&out[..2], &[0x78, 0x01]);
        assert_eq!((0x78u32 * 256 + 0x01) % 31, 0);
        assert_eq!(out[2], 0x01);
        assert_eq!(&out[3..7], &[3, 0, 0xFC, 0xFF]);
        assert_eq!(&out[7..10], b"abc");
        assert_eq!(&out[10..], &adler32(b"abc").to_be_bytes());
    }

    #[test]
    fn test_zlib_stored_empty() {
        let out = zlib_stored(&[]);
        assert_eq!(out, vec![0x78, 0x01, 0x01, 0x00, 0x00, 0xFF, 0xFF, 0, 0, 0, 1]);
    }

    #[test]
    fn test_keyframe_header_and_blocks() {
        // 100x70 gives 2 columns and 2 rows of blocks
        let frame = VideoFrame::solid(Resolution::new(100, 70), [10, 20, 30, 255], 0);
        let body = encode_keyframe(&frame).unwrap();

        assert_eq!(u16::from_be_bytes([body[0], body[1]]), 0x3000 | 100);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), 0x3000 | 70);

        // First block: bottom-left, full 64x64
        let size = u16::from_be_bytes([body[4], body[5]]) as usize;
        assert_eq!(size, 64 * 64 * 3 + 2 + 5 + 4);
        let pixels = &body[6 + 7..6 + 7 + 3];
        assert_eq!(pixels, &[30, 20, 10]);

        // Remaining blocks: 36x64, 64x6, 36x6
        let mut at = 6 + size;
        for expected in [36 * 64, 64 * 6, 36 * 6] {
            let size = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
            assert_eq!(size, expected * 3 + 11);
            at += 2 + size;
        }
        assert_eq!(at, body.len());
    }

    #[test]
    fn test_keyframe_len_matches_encoding() {
        let sizes = [(1, 1), (100, 70), (128, 64)];
        for resolution in sizes.map(|(w, h)| Resolution::new(w, h)) {
            let frame = VideoFrame::solid(resolution, [1, 2, 3, 255], 0);
            assert_eq!(encode_keyframe(&frame).unwrap().len(), keyframe_len(resolution));
        }
    }

    #[test]
    fn test_keyframe_bottom_up_order() {
        // Top row red, bottom row blue
        let mut data = Vec::new();
        data.extend_from_slice(&[255, 0, 0, 255]);
        data.extend_from_slice(&[0, 0, 255, 255]);
        let frame = VideoFrame::new(1, 2, 0, Bytes::from(data));
        let body = encode_keyframe(&frame).unwrap();

        // Header (4) + block size (2) + zlib header and stored header (7)
        let pixels = &body[13..19];
        assert_eq!(pixels, &[255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let frame = VideoFrame::new(5000, 1, 0, Bytes::new());
        assert!(matches!(
            encode_keyframe(&frame),
            Err(Error::RecorderUnavailable(_))
        ));
    }
}
