//! Raster drawing primitives over stride-aware RGB8 images.

use machine_vision_formats::{pixel_format::RGB8, ImageMutStride};
use rusttype::{point, Font, Scale};

pub type Rgb = [u8; 3];

/// Alpha-blend one pixel; coordinates outside the image are ignored.
pub fn blend_pixel(image: &mut dyn ImageMutStride<RGB8>, x: i64, y: i64, color: Rgb, alpha: f32) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    let stride = image.stride();
    let start = stride * y as usize + x as usize * 3;
    let q = alpha.clamp(0.0, 1.0);
    let p = 1.0 - q;

    let data = &mut image.buffer_mut_ref().data;
    for ch in 0..3 {
        let old = data[start + ch] as f32;
        data[start + ch] = (old * p + color[ch] as f32 * q).round() as u8;
    }
}

pub fn set_pixel(image: &mut dyn ImageMutStride<RGB8>, x: i64, y: i64, color: Rgb) {
    blend_pixel(image, x, y, color, 1.0);
}

/// Bresenham line with square pen of the given thickness.
pub fn draw_line(
    image: &mut dyn ImageMutStride<RGB8>,
    from: (i64, i64),
    to: (i64, i64),
    color: Rgb,
    thickness: i64,
) {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let half = thickness.max(1) / 2;

    loop {
        for oy in -half..=half {
            for ox in -half..=half {
                set_pixel(image, x0 + ox, y0 + oy, color);
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

pub fn draw_rect(
    image: &mut dyn ImageMutStride<RGB8>,
    (x1, y1): (i64, i64),
    (x2, y2): (i64, i64),
    color: Rgb,
    thickness: i64,
) {
    draw_line(image, (x1, y1), (x2, y1), color, thickness);
    draw_line(image, (x2, y1), (x2, y2), color, thickness);
    draw_line(image, (x2, y2), (x1, y2), color, thickness);
    draw_line(image, (x1, y2), (x1, y1), color, thickness);
}

pub fn fill_rect(
    image: &mut dyn ImageMutStride<RGB8>,
    (x1, y1): (i64, i64),
    (x2, y2): (i64, i64),
    color: Rgb,
    alpha: f32,
) {
    for y in y1.min(y2)..=y1.max(y2) {
        for x in x1.min(x2)..=x1.max(x2) {
            blend_pixel(image, x, y, color, alpha);
        }
    }
}

/// Translucent scanline fill of a simple (possibly concave) polygon.
pub fn fill_polygon(
    image: &mut dyn ImageMutStride<RGB8>,
    polygon: &[(f32, f32)],
    color: Rgb,
    alpha: f32,
) {
    if polygon.len() < 3 {
        return;
    }
    let y_min = polygon.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let y_max = polygon
        .iter()
        .map(|p| p.1)
        .fold(f32::NEG_INFINITY, f32::max);
    let y_lo = y_min.floor().max(0.0) as i64;
    let y_hi = (y_max.ceil() as i64).min(image.height() as i64 - 1);

    let mut crossings: Vec<f32> = Vec::with_capacity(polygon.len());
    for y in y_lo..=y_hi {
        let fy = y as f32 + 0.5;
        crossings.clear();
        let mut j = polygon.len() - 1;
        for i in 0..polygon.len() {
            let (xi, yi) = polygon[i];
            let (xj, yj) = polygon[j];
            if (yi > fy) != (yj > fy) {
                crossings.push(xi + (fy - yi) / (yj - yi) * (xj - xi));
            }
            j = i;
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for pair in crossings.chunks_exact(2) {
            let x_start = pair[0].round() as i64;
            let x_end = pair[1].round() as i64;
            for x in x_start..=x_end {
                blend_pixel(image, x, y, color, alpha);
            }
        }
    }
}

pub fn draw_polyline(
    image: &mut dyn ImageMutStride<RGB8>,
    points: &[(f32, f32)],
    closed: bool,
    color: Rgb,
    thickness: i64,
) {
    if points.len() < 2 {
        return;
    }
    for pair in points.windows(2) {
        let a = (pair[0].0.round() as i64, pair[0].1.round() as i64);
        let b = (pair[1].0.round() as i64, pair[1].1.round() as i64);
        draw_line(image, a, b, color, thickness);
    }
    if closed {
        let first = (points[0].0.round() as i64, points[0].1.round() as i64);
        let last = points[points.len() - 1];
        let last = (last.0.round() as i64, last.1.round() as i64);
        draw_line(image, last, first, color, thickness);
    }
}

pub fn draw_disc(
    image: &mut dyn ImageMutStride<RGB8>,
    (cx, cy): (i64, i64),
    radius: i64,
    color: Rgb,
) {
    for y in -radius..=radius {
        for x in -radius..=radius {
            if x * x + y * y <= radius * radius {
                set_pixel(image, cx + x, cy + y, color);
            }
        }
    }
}

/// Width in pixels the text will occupy at the given scale.
pub fn text_width(font: &Font, text: &str, scale_px: f32) -> f32 {
    let scale = Scale::uniform(scale_px);
    font.layout(text, scale, point(0.0, 0.0))
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0)
}

/// Stamp text with its baseline anchored at `(x, y)`.
pub fn draw_text(
    image: &mut dyn ImageMutStride<RGB8>,
    font: &Font,
    text: &str,
    (x, y): (f32, f32),
    scale_px: f32,
    color: Rgb,
) {
    let scale = Scale::uniform(scale_px);
    let glyphs: Vec<_> = font.layout(text, scale, point(x, y)).collect();
    for glyph in glyphs {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, coverage| {
                blend_pixel(
                    image,
                    bb.min.x as i64 + gx as i64,
                    bb.min.y as i64 + gy as i64,
                    color,
                    coverage,
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_capture::Frame;

    #[test]
    fn out_of_bounds_pixels_are_ignored() {
        let mut f = Frame::zeros(10, 10);
        set_pixel(&mut f, -1, 5, [255, 0, 0]);
        set_pixel(&mut f, 5, 100, [255, 0, 0]);
        set_pixel(&mut f, 5, 5, [255, 0, 0]);
        assert_eq!(f.pixel(5, 5), [255, 0, 0]);
    }

    #[test]
    fn blend_mixes_colors() {
        let mut f = Frame::zeros(4, 4);
        blend_pixel(&mut f, 1, 1, [200, 100, 0], 0.5);
        assert_eq!(f.pixel(1, 1), [100, 50, 0]);
    }

    #[test]
    fn line_endpoints_are_painted() {
        let mut f = Frame::zeros(20, 20);
        draw_line(&mut f, (2, 3), (15, 12), [0, 255, 0], 1);
        assert_eq!(f.pixel(2, 3), [0, 255, 0]);
        assert_eq!(f.pixel(15, 12), [0, 255, 0]);
    }

    #[test]
    fn polygon_fill_covers_interior_not_exterior() {
        let mut f = Frame::zeros(20, 20);
        let square = [(5.0, 5.0), (15.0, 5.0), (15.0, 15.0), (5.0, 15.0)];
        fill_polygon(&mut f, &square, [255, 255, 255], 1.0);
        assert_eq!(f.pixel(10, 10), [255, 255, 255]);
        assert_eq!(f.pixel(2, 2), [0, 0, 0]);
        assert_eq!(f.pixel(18, 10), [0, 0, 0]);
    }
}
