//! Drawing primitives for the annotated monitor frame.

use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use ml_core::{BoundingBox, SKELETON};
use video_ingest::Frame;

use crate::monitor::{adjudicator::Subject, roi::PixelPolygon};

pub(crate) const ROI_COLOR: Rgb<u8> = Rgb([0, 120, 255]);
pub(crate) const SAFE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub(crate) const BREACH_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const ARMED_COLOR: Rgb<u8> = Rgb([0, 230, 118]);
const STANDBY_COLOR: Rgb<u8> = Rgb([144, 164, 174]);
const CLOCK_COLOR: Rgb<u8> = Rgb([197, 190, 176]);
const BAR_COLOR: Rgb<u8> = Rgb([39, 14, 10]);

const GLYPH_ADVANCE: i32 = 6;

/// Convert a packed BGR8 frame into an RGB image, or `None` if the buffer is short.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Option<RgbImage> {
    let rgb = bgr_to_rgb(&frame.data);
    RgbImage::from_raw(frame.width as u32, frame.height as u32, rgb)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

/// Outline of the restricted area with its caption above the first vertex.
pub(crate) fn draw_roi(image: &mut RgbImage, polygon: &PixelPolygon) {
    let n = polygon.points.len();
    for i in 0..n {
        let a = polygon.points[i];
        let b = polygon.points[(i + 1) % n];
        draw_line(image, a, b, ROI_COLOR, 2);
    }
    if let Some(&(x, y)) = polygon.points.first() {
        draw_caption(image, x, y - 14, "RESTRICTED AREA", ROI_COLOR, 1);
    }
}

/// Box, label, skeleton and breached landmarks for one subject.
pub(crate) fn draw_subject(image: &mut RgbImage, subject: &Subject) {
    let color = if subject.breach {
        BREACH_COLOR
    } else {
        SAFE_COLOR
    };

    for (a, b) in SKELETON {
        let pa = subject.keypoints[a.index()];
        let pb = subject.keypoints[b.index()];
        if pa.confidence > 0.5 && pb.confidence > 0.5 {
            draw_line(
                image,
                (pa.x as i32, pa.y as i32),
                (pb.x as i32, pb.y as i32),
                color,
                1,
            );
        }
    }

    let frame_box = subject.face.unwrap_or(subject.bbox);
    draw_box(image, &frame_box, color);

    let label = if subject.breach {
        "INTRUDER BREACH".to_string()
    } else {
        match subject.track_id {
            Some(id) => format!("{} #{id}", subject.identity),
            None => subject.identity.clone(),
        }
    };
    draw_caption(
        image,
        frame_box.x1 as i32,
        frame_box.y1 as i32 - 12,
        &label,
        color,
        1,
    );

    for point in &subject.breach_points {
        fill_rect(
            image,
            point.0 - 3,
            point.1 - 3,
            point.0 + 3,
            point.1 + 3,
            BREACH_COLOR,
        );
    }
}

/// Status bar with ARMED/STANDBY and the wall-clock time.
pub(crate) fn draw_status_overlay(image: &mut RgbImage, armed: bool, now: DateTime<Local>) {
    let width = image.width() as i32;
    blend_rect(image, 0, 0, width - 1, 29, BAR_COLOR, 0.7);

    let (text, color) = if armed {
        ("ARMED", ARMED_COLOR)
    } else {
        ("STANDBY", STANDBY_COLOR)
    };
    draw_label(image, 12, 8, text, color, 2);

    let clock = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let clock_width = text_width(&clock, 1);
    draw_label(image, (width - clock_width - 12).max(0), 11, &clock, CLOCK_COLOR, 1);
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (x1, y1, x2, y2) = (
        bbox.x1.round() as i32,
        bbox.y1.round() as i32,
        bbox.x2.round() as i32,
        bbox.y2.round() as i32,
    );
    draw_rectangle(image, x1, y1, x2, y2, color);
    draw_rectangle(image, x1 + 1, y1 + 1, x2 - 1, y2 - 1, color);
}

fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE * scale
}

fn draw_caption(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let y = y.max(0);
    fill_rect(
        image,
        x - 1,
        y - 1,
        x + text_width(text, scale),
        y + 7 * scale,
        LABEL_BG,
    );
    draw_label(image, x, y, text, color, scale);
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < image.width() as i32 && y < image.height() as i32 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham line, `thickness` pixels wide. Endpoints are clipped to the
/// image first, so only visible pixels are walked.
pub(crate) fn draw_line(
    image: &mut RgbImage,
    from: (i32, i32),
    to: (i32, i32),
    color: Rgb<u8>,
    thickness: i32,
) {
    let Some(((mut x0, mut y0), (x1, y1))) = clip_segment(
        from,
        to,
        image.width() as i32,
        image.height() as i32,
        thickness.max(1),
    ) else {
        return;
    };
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let half = (thickness.max(1) - 1) / 2;
    let extra = (thickness.max(1) - 1) - half;

    loop {
        for ox in -half..=extra {
            for oy in -half..=extra {
                put_pixel(image, x0 + ox, y0 + oy, color);
            }
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Liang-Barsky clip of a segment against the image grown by `margin`
/// pixels on every side. `None` when the segment misses it entirely.
fn clip_segment(
    from: (i32, i32),
    to: (i32, i32),
    width: i32,
    height: i32,
    margin: i32,
) -> Option<((i32, i32), (i32, i32))> {
    let (x0, y0) = (f64::from(from.0), f64::from(from.1));
    let (dx, dy) = (f64::from(to.0) - x0, f64::from(to.1) - y0);
    let min = -f64::from(margin);
    let max_x = f64::from(width - 1 + margin);
    let max_y = f64::from(height - 1 + margin);

    let mut t0 = 0.0_f64;
    let mut t1 = 1.0_f64;
    for (p, q) in [(-dx, x0 - min), (dx, max_x - x0), (-dy, y0 - min), (dy, max_y - y0)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }

    let at = |t: f64| ((x0 + t * dx).round() as i32, (y0 + t * dy).round() as i32);
    Some((at(t0), at(t1)))
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    blend_rect(image, left, top, right, bottom, color, 1.0);
}

fn blend_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
    alpha: f32,
) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            let px = image.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                let blended = color.0[c] as f32 * alpha + px.0[c] as f32 * (1.0 - alpha);
                px.0[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let scale = scale.max(1);
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        for sy in 0..scale {
                            for sx in 0..scale {
                                put_pixel(
                                    image,
                                    x + col * scale + sx,
                                    y + row as i32 * scale + sy,
                                    color,
                                );
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let glyph = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
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
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0, 0, 0, 0, 0, 0, 0],
        _ => return None,
    };
    Some(glyph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_frame_becomes_rgb_image() {
        let frame = Frame::bgr8(vec![1, 2, 3, 4, 5, 6], 2, 1, 0).unwrap();
        let image = frame_to_rgb(&frame).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([3, 2, 1]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([6, 5, 4]));
    }

    #[test]
    fn roi_outline_is_drawn_on_its_vertices() {
        let mut image = RgbImage::new(64, 48);
        let polygon = PixelPolygon {
            points: vec![(10, 20), (50, 20), (50, 40), (10, 40)],
        };
        draw_roi(&mut image, &polygon);
        assert_eq!(image.get_pixel(30, 20), &ROI_COLOR);
        assert_eq!(image.get_pixel(50, 30), &ROI_COLOR);
        assert_eq!(image.get_pixel(30, 30), &Rgb([0, 0, 0]));
    }

    #[test]
    fn drawing_outside_the_image_is_clipped() {
        let mut image = RgbImage::new(8, 8);
        draw_line(&mut image, (-20, -20), (30, 30), SAFE_COLOR, 3);
        draw_label(&mut image, -4, 6, "ARMED", SAFE_COLOR, 2);
        draw_rectangle(&mut image, -5, -5, 100, 100, BREACH_COLOR);
        assert_eq!(image.get_pixel(0, 0), &BREACH_COLOR);
    }

    #[test]
    fn lines_with_extreme_endpoints_are_clipped() {
        let mut image = RgbImage::new(64, 48);
        draw_line(&mut image, (-3e9 as i32, 10), (3e9 as i32, 20), SAFE_COLOR, 1);
        assert!((0..48).any(|y| image.get_pixel(0, y) == &SAFE_COLOR));
        assert!((0..48).any(|y| image.get_pixel(63, y) == &SAFE_COLOR));

        // Entirely off the image: nothing is drawn.
        let mut untouched = RgbImage::new(64, 48);
        draw_line(&mut untouched, (1_000_000, -5), (2_000_000, -900), BREACH_COLOR, 2);
        assert!(untouched.pixels().all(|p| p == &Rgb([0, 0, 0])));

        assert_eq!(
            clip_segment((0, 10), (1_000_000, 10), 64, 48, 1),
            Some(((0, 10), (64, 10)))
        );
    }

    #[test]
    fn every_overlay_character_has_a_glyph() {
        for ch in "RESTRICTED AREA INTRUDER BREACH ARMED STANDBY UNKNOWN #0123456789-: ".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }
}
