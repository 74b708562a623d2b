//! Renders face boxes and their labels onto a copy of an uploaded image.

use crate::types::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb, RgbImage};

const ACCEPTED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const REJECTED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_WIDTH: u32 = 2;
const JPEG_QUALITY: u8 = 85;

/// Glyphs are 3x5 cells drawn as `GLYPH_SCALE`-pixel squares.
const GLYPH_WIDTH: u32 = 3;
const GLYPH_HEIGHT: u32 = 5;
const GLYPH_SCALE: u32 = 2;
const GLYPH_SPACING: u32 = 2;
const LABEL_GAP: u32 = 4;

/// One face to draw: its box, whether it matched, and the caption.
#[derive(Debug, Clone)]
pub struct FaceMark {
    pub bbox: BoundingBox,
    pub accepted: bool,
    /// e.g. `Alice (0.87)`
    pub label: String,
}

/// Draw every mark and encode the result as JPEG.
///
/// Accepted matches are outlined in green, everything else in red. The label
/// sits above the box, or just inside its top edge when there is no room.
/// Everything is clipped to the image bounds.
pub fn render(image: &RgbImage, marks: &[FaceMark]) -> Result<Vec<u8>, ImageError> {
    let mut canvas = image.clone();
    for mark in marks {
        let color = if mark.accepted { ACCEPTED_COLOR } else { REJECTED_COLOR };
        draw_box(&mut canvas, &mark.bbox, color);
        let (x, y) = label_origin(&mark.bbox);
        draw_label(&mut canvas, x, y, &mark.label, color);
    }

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&canvas)?;
    Ok(jpeg)
}

fn draw_box(canvas: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }

    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let x0 = clamp_x(bbox.x);
    let y0 = clamp_y(bbox.y);
    let x1 = clamp_x(bbox.x + bbox.width);
    let y1 = clamp_y(bbox.y + bbox.height);
    if x1 <= x0 || y1 <= y0 {
        return;
    }

    for t in 0..LINE_WIDTH {
        for x in x0..=x1 {
            put(canvas, x, y0 + t, color);
            put(canvas, x, y1.saturating_sub(t), color);
        }
        for y in y0..=y1 {
            put(canvas, x0 + t, y, color);
            put(canvas, x1.saturating_sub(t), y, color);
        }
    }
}

/// Top-left corner for a box's label.
fn label_origin(bbox: &BoundingBox) -> (u32, u32) {
    let x = bbox.x.max(0.0) as u32;
    let top = bbox.y.max(0.0) as u32;
    let y = top
        .checked_sub(GLYPH_HEIGHT * GLYPH_SCALE + LABEL_GAP)
        .unwrap_or(top + LINE_WIDTH + LABEL_GAP);
    (x, y)
}

/// Draw `text` with its top-left corner at `(x, y)`.
fn draw_label(canvas: &mut RgbImage, x: u32, y: u32, text: &str, color: Rgb<u8>) {
    let advance = GLYPH_WIDTH * GLYPH_SCALE + GLYPH_SPACING;
    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i as u32 * advance;
        if origin_x >= canvas.width() {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                let px = origin_x + col * GLYPH_SCALE;
                let py = y + row as u32 * GLYPH_SCALE;
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        put(canvas, px + dx, py + dy, color);
                    }
                }
            }
        }
    }
}

/// Rows of a 3x5 glyph, most significant bit on the left. Letters are
/// case-folded; anything without a glyph renders as `?`.
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '(' => [0b001, 0b010, 0b010, 0b010, 0b001],
        ')' => [0b100, 0b010, 0b010, 0b010, 0b100],
        ' ' => [0; 5],
        _ => [0b110, 0b001, 0b010, 0b000, 0b010],
    }
}

fn put(canvas: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < canvas.width() && y < canvas.height() {
        canvas.put_pixel(x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: 0.9, landmarks: None,
        }
    }

    fn mark(b: BoundingBox, accepted: bool, label: &str) -> FaceMark {
        FaceMark {
            bbox: b,
            accepted,
            label: label.to_string(),
        }
    }

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    #[test]
    fn test_draw_box_colors_edges() {
        let mut canvas = RgbImage::new(20, 20);
        draw_box(&mut canvas, &bbox(2.0, 3.0, 10.0, 8.0), ACCEPTED_COLOR);

        assert_eq!(*canvas.get_pixel(2, 3), ACCEPTED_COLOR);
        assert_eq!(*canvas.get_pixel(12, 11), ACCEPTED_COLOR);
        assert_eq!(*canvas.get_pixel(7, 7), BLACK);
    }

    #[test]
    fn test_draw_box_clips_out_of_bounds() {
        let mut canvas = RgbImage::new(10, 10);
        draw_box(&mut canvas, &bbox(-5.0, -5.0, 100.0, 100.0), REJECTED_COLOR);
        assert_eq!(*canvas.get_pixel(0, 0), REJECTED_COLOR);
        assert_eq!(*canvas.get_pixel(9, 9), REJECTED_COLOR);
    }

    #[test]
    fn test_draw_label_follows_glyph_bits() {
        let mut canvas = RgbImage::new(20, 20);
        draw_label(&mut canvas, 2, 3, "i", ACCEPTED_COLOR);

        // Top row of `I` is solid.
        assert_eq!(*canvas.get_pixel(2, 3), ACCEPTED_COLOR);
        assert_eq!(*canvas.get_pixel(7, 4), ACCEPTED_COLOR);
        // Second row only has the centre column.
        assert_eq!(*canvas.get_pixel(2, 5), BLACK);
        assert_eq!(*canvas.get_pixel(4, 5), ACCEPTED_COLOR);
        assert_eq!(*canvas.get_pixel(6, 6), BLACK);
    }

    #[test]
    fn test_glyph_fallback_and_case_folding() {
        assert_eq!(glyph('a'), glyph('A'));
        assert_eq!(glyph('@'), glyph('?'));
        assert_eq!(glyph(' '), [0; 5]);
    }

    #[test]
    fn test_label_above_box_or_inside_when_at_top() {
        assert_eq!(label_origin(&bbox(1.0, 20.0, 10.0, 10.0)), (1, 6));
        assert_eq!(label_origin(&bbox(-3.0, 2.0, 10.0, 10.0)), (0, 8));
    }

    #[test]
    fn test_render_produces_jpeg() {
        let img = RgbImage::from_pixel(16, 16, Rgb([10, 10, 10]));
        let jpeg = render(&img, &[mark(bbox(1.0, 1.0, 8.0, 8.0), false, "Unknown (0.12)")]).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(image::load_from_memory(&jpeg).is_ok());
    }
}
