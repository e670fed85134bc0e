//! Off-screen RGBA frame buffer
//!
//! All drawing is plain CPU work on a packed RGBA buffer: fills, an
//! aspect-fit nearest-neighbour blit for source frames, alpha-blended
//! boxes, and text from a built-in 5x7 bitmap font.

use bytes::Bytes;

use crate::media::frame::BYTES_PER_PIXEL;
use crate::media::{Resolution, VideoFrame};

use super::layout::{safe_margin, Rect};

/// Neutral fill for absent sources
pub const PLACEHOLDER_RGBA: [u8; 4] = [0x1F, 0x1F, 0x1F, 0xFF];

/// Label text colour
pub const LABEL_TEXT_RGBA: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Watermark body colour
pub const WATERMARK_RGBA: [u8; 4] = [0x00, 0xA8, 0xE8, 0xFF];

/// Longest overlay label drawn; the rest is cut off
pub const MAX_LABEL_CHARS: usize = 32;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;
const LABEL_BACKGROUND_ALPHA: u8 = 160;

/// Packed RGBA canvas of a fixed size
pub struct Canvas {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Canvas {
    pub fn new(resolution: Resolution) -> Self {
        let mut canvas = Self {
            width: resolution.width,
            height: resolution.height,
            data: vec![0; resolution.buffer_len()],
        };
        canvas.clear(PLACEHOLDER_RGBA);
        canvas
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn clear(&mut self, rgba: [u8; 4]) {
        for px in self.data.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&rgba);
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = self.offset(x, y);
        let px = &self.data[offset..offset + BYTES_PER_PIXEL];
        Some([px[0], px[1], px[2], px[3]])
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    /// Clip a rectangle to the canvas
    fn clip(&self, rect: Rect) -> Rect {
        let x = rect.x.min(self.width);
        let y = rect.y.min(self.height);
        let width = rect.width.min(self.width - x);
        let height = rect.height.min(self.height - y);
        Rect::new(x, y, width, height)
    }

    pub fn fill_rect(&mut self, rect: Rect, rgba: [u8; 4]) {
        let rect = self.clip(rect);
        for y in rect.y..rect.y + rect.height {
            let start = self.offset(rect.x, y);
            let end = start + rect.width as usize * BYTES_PER_PIXEL;
            for px in self.data[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&rgba);
            }
        }
    }

    /// Blend `rgb` over the rectangle with the given opacity
    pub fn blend_rect(&mut self, rect: Rect, rgb: [u8; 3], alpha: u8) {
        let rect = self.clip(rect);
        let a = alpha as u32;
        for y in rect.y..rect.y + rect.height {
            let start = self.offset(rect.x, y);
            let end = start + rect.width as usize * BYTES_PER_PIXEL;
            for px in self.data[start..end].chunks_exact_mut(BYTES_PER_PIXEL) {
                for (channel, &over) in px.iter_mut().zip(rgb.iter()) {
                    *channel = ((over as u32 * a + *channel as u32 * (255 - a)) / 255) as u8;
                }
                px[3] = 0xFF;
            }
        }
    }

    /// Draw `frame` scaled to fit inside `rect`, centred, letterboxed with
    /// the placeholder fill
    ///
    /// Malformed frames are treated as absent.
    pub fn blit_fit(&mut self, frame: &VideoFrame, rect: Rect) {
        let rect = self.clip(rect);
        self.fill_rect(rect, PLACEHOLDER_RGBA);
        if !frame.is_well_formed() || frame.width == 0 || frame.height == 0 {
            return;
        }
        if rect.width == 0 || rect.height == 0 {
            return;
        }

        let (fw, fh) = (frame.width as u64, frame.height as u64);
        let (rw, rh) = (rect.width as u64, rect.height as u64);

        // Fit by the tighter dimension, compared without floating point
        let (dw, dh) = if fw * rh >= fh * rw {
            (rw, (fh * rw / fw).max(1))
        } else {
            ((fw * rh / fh).max(1), rh)
        };
        let ox = rect.x as u64 + (rw - dw) / 2;
        let oy = rect.y as u64 + (rh - dh) / 2;

        let src = &frame.data;
        for dy in 0..dh {
            let sy = dy * fh / dh;
            let dst_row = self.offset(ox as u32, (oy + dy) as u32);
            for dx in 0..dw {
                let sx = dx * fw / dw;
                let s = ((sy * fw + sx) as usize) * BYTES_PER_PIXEL;
                let d = dst_row + dx as usize * BYTES_PER_PIXEL;
                self.data[d..d + BYTES_PER_PIXEL].copy_from_slice(&src[s..s + BYTES_PER_PIXEL]);
            }
        }
    }

    /// Draw text with its top-left corner at (x, y); clipped at the edges
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, scale: u32, rgba: [u8; 4]) {
        let scale = scale.max(1);
        for (index, ch) in text.chars().enumerate() {
            let glyph = glyph(ch);
            let gx = x + index as u32 * GLYPH_ADVANCE * scale;
            for (row, bits) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (0x10 >> col) != 0 {
                        self.fill_rect(
                            Rect::new(gx + col * scale, y + row as u32 * scale, scale, scale),
                            rgba,
                        );
                    }
                }
            }
        }
    }

    /// Overlay label in the lower-left safe area
    ///
    /// Returns the rectangle covered by the label background.
    pub fn draw_label(&mut self, text: &str) -> Rect {
        let scale = label_scale(self.resolution());
        let margin = safe_margin(self.resolution());
        let padding = 2 * scale;

        let available = self.width.saturating_sub(2 * margin + 2 * padding);
        let fits = (available / (GLYPH_ADVANCE * scale)) as usize;
        let shown: String = text.chars().take(MAX_LABEL_CHARS.min(fits)).collect();

        let text_width = text_width(&shown, scale);
        let box_height = GLYPH_HEIGHT * scale + 2 * padding;
        let rect = Rect::new(
            margin,
            self.height.saturating_sub(margin + box_height),
            text_width + 2 * padding,
            box_height,
        );

        self.blend_rect(rect, [0, 0, 0], LABEL_BACKGROUND_ALPHA);
        self.draw_text(rect.x + padding, rect.y + padding, &shown, scale, LABEL_TEXT_RGBA);
        rect
    }

    /// Watermark in the top-right corner: a white frame around a coloured square
    pub fn draw_watermark(&mut self) -> Rect {
        let rect = watermark_rect(self.resolution());
        let border = (rect.width / 6).max(1);
        self.fill_rect(rect, [0xFF, 0xFF, 0xFF, 0xFF]);
        self.fill_rect(
            Rect::new(
                rect.x + border,
                rect.y + border,
                rect.width.saturating_sub(2 * border),
                rect.height.saturating_sub(2 * border),
            ),
            WATERMARK_RGBA,
        );
        rect
    }

    /// Copy the canvas into an immutable frame
    pub fn snapshot(&self, timestamp_ms: u64) -> VideoFrame {
        VideoFrame::new(
            self.width,
            self.height,
            timestamp_ms,
            Bytes::copy_from_slice(&self.data),
        )
    }
}

/// Glyph scale used for labels at this output size
pub fn label_scale(resolution: Resolution) -> u32 {
    (resolution.height / 180).max(1)
}

/// Where the watermark lands for this output size
pub fn watermark_rect(resolution: Resolution) -> Rect {
    let size = (resolution.height / 12).max(4).min(resolution.width).min(resolution.height);
    let margin = safe_margin(resolution);
    Rect::new(
        resolution.width.saturating_sub(size + margin),
        margin.min(resolution.height.saturating_sub(size)),
        size,
        size,
    )
}

/// Width in pixels of `text` rendered at `scale`
pub fn text_width(text: &str, scale: u32) -> u32 {
    let count = text.chars().count() as u32;
    if count == 0 {
        0
    } else {
        (count * GLYPH_ADVANCE - 1) * scale.max(1)
    }
}

/// Rows of a 5x7 glyph, bit 4 is the leftmost column
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ' ' => [0x00; 7],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '@' => [0x0E, 0x11, 0x17, 0x15, 0x17, 0x10, 0x0F],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04], // '?'
    }
}
