//! Frame annotation for the dashboard stream.
//!
//! Draws a box and a `PERSON NN%` tag per detection plus a `PEOPLE: N`
//! banner, then re-encodes as JPEG. Text uses a built-in 5x7 bitmap font so
//! no font file has to ship with the server.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use super::Detection;
use crate::error::DetectionError;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TAG_BG: Rgb<u8> = Rgb([0, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const ADVANCE: i32 = GLYPH_W + 1;

/// Annotate `image` in place.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }

    for d in detections {
        let [x1, y1, x2, y2] = d.bbox;
        let left = x1.min(x2).round() as i32;
        let top = y1.min(y2).round() as i32;
        let w = ((x2 - x1).abs().round() as u32).max(1);
        let h = ((y2 - y1).abs().round() as u32).max(1);

        draw_hollow_rect_mut(image, Rect::at(left, top).of_size(w, h), BOX_COLOR);
        // Second outline one pixel in, so boxes stay visible after JPEG.
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(image, Rect::at(left + 1, top + 1).of_size(w - 2, h - 2), BOX_COLOR);
        }

        let tag = format!("PERSON {:.0}%", d.confidence * 100.0);
        let tag_y = (top - GLYPH_H - 3).max(0);
        draw_tag(image, left, tag_y, &tag, 1);
    }

    let banner = format!("PEOPLE: {}", detections.len());
    draw_tag(image, 4, 4, &banner, 2);
}

/// Encode `image` as JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, DetectionError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| DetectionError::Encode(e.to_string()))?;
    Ok(Bytes::from(buffer))
}

/// Text on a filled background, scaled by `scale`.
fn draw_tag(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32) {
    let chars = text.chars().count() as i32;
    let w = (chars * ADVANCE * scale + 2) as u32;
    let h = (GLYPH_H * scale + 2) as u32;
    draw_filled_rect_mut(image, Rect::at(x, y).of_size(w, h), TAG_BG);
    draw_text(image, x + 1, y + 1, text, scale);
}

fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, scale: i32) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if (bits >> (GLYPH_W - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if (0..width).contains(&px) && (0..height).contains(&py) {
                                image.put_pixel(px as u32, py as u32, TEXT_COLOR);
                            }
                        }
                    }
                }
            }
        }
        x += ADVANCE * scale;
    }
}

/// 5x7 glyphs, MSB is the leftmost column. Covers the characters the
/// annotations use.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(bbox: [f32; 4]) -> Detection {
        Detection {
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.87,
            bbox,
        }
    }

    #[test]
    fn box_outline_is_drawn() {
        let mut img = RgbImage::new(100, 100);
        draw_detections(&mut img, &[person([40.0, 60.0, 80.0, 95.0])]);
        assert_eq!(*img.get_pixel(60, 95 - 1), BOX_COLOR);
        assert_eq!(*img.get_pixel(40, 80), BOX_COLOR);
        // Interior untouched.
        assert_eq!(*img.get_pixel(60, 80), Rgb([0, 0, 0]));
    }

    #[test]
    fn banner_is_drawn_even_without_detections() {
        let mut img = RgbImage::from_pixel(120, 40, Rgb([200, 200, 200]));
        draw_detections(&mut img, &[]);
        let lit = (4..60)
            .flat_map(|x| (4..20).map(move |y| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) == TEXT_COLOR)
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn degenerate_and_offscreen_boxes_do_not_panic() {
        let mut img = RgbImage::new(20, 20);
        draw_detections(
            &mut img,
            &[person([5.0, 5.0, 5.0, 5.0]), person([-50.0, -50.0, 500.0, 500.0])],
        );
        let mut tiny = RgbImage::new(1, 1);
        draw_detections(&mut tiny, &[person([0.0, 0.0, 0.0, 0.0])]);
    }

    #[test]
    fn jpeg_round_trips_dimensions() {
        let img = RgbImage::new(32, 24);
        let jpeg = encode_jpeg(&img, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn every_annotation_char_has_a_glyph() {
        for ch in "PERSON PEOPLE: 0123456789%".chars() {
            assert!(glyph(ch).is_some(), "missing glyph for {ch:?}");
        }
    }
}
