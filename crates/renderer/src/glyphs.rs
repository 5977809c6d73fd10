//! Stroke glyphs for axis and legend text.
//!
//! Characters are drawn as simple 7-segment style strokes so charts need no
//! font file. Unsupported characters render as blank space.

use tiny_skia::{LineCap, LineJoin, Paint, PathBuilder, Pixmap, Stroke, Transform};

/// Horizontal advance per character as a fraction of the glyph height.
const ADVANCE: f32 = 0.7;

type Segment = ((f32, f32), (f32, f32));

/// Strokes for `ch` in a box of half-width `w` and half-height `h` centered on the origin.
fn segments(ch: char, w: f32, h: f32) -> Vec<Segment> {
    let top = ((-w, -h), (w, -h));
    let middle = ((-w, 0.0), (w, 0.0));
    let bottom = ((-w, h), (w, h));
    let upper_left = ((-w, -h), (-w, 0.0));
    let upper_right = ((w, -h), (w, 0.0));
    let lower_left = ((-w, 0.0), (-w, h));
    let lower_right = ((w, 0.0), (w, h));

    match ch.to_ascii_lowercase() {
        '0' => vec![top, bottom, upper_left, lower_left, upper_right, lower_right],
        '1' => vec![((0.0, -h), (0.0, h))],
        '2' => vec![top, upper_right, middle, lower_left, bottom],
        '3' => vec![top, upper_right, lower_right, bottom, middle],
        '4' => vec![upper_left, middle, upper_right, lower_right],
        '5' => vec![top, upper_left, middle, lower_right, bottom],
        '6' => vec![top, upper_left, lower_left, bottom, lower_right, middle],
        '7' => vec![top, ((w, -h), (0.0, h))],
        '8' => vec![top, middle, bottom, upper_left, lower_left, upper_right, lower_right],
        '9' => vec![middle, upper_right, top, upper_left, lower_right, bottom],
        '-' => vec![middle],
        '.' => vec![((0.0, h * 0.7), (0.0, h * 0.8))],
        ':' => vec![((0.0, -h * 0.5), (0.0, -h * 0.4)), ((0.0, h * 0.4), (0.0, h * 0.5))],
        'k' => vec![((-w, -h), (-w, h)), ((w, -h * 0.2), (-w, h * 0.3)), ((-w * 0.3, h * 0.1), (w, h))],
        'm' => vec![((-w, h), (-w, -h)), ((-w, -h), (0.0, 0.0)), ((0.0, 0.0), (w, -h)), ((w, -h), (w, h))],
        'w' => vec![((-w, -h), (-w * 0.5, h)), ((-w * 0.5, h), (0.0, 0.0)), ((0.0, 0.0), (w * 0.5, h)), ((w * 0.5, h), (w, -h))],
        _ => Vec::new(),
    }
}

/// Pixel width of `text` at glyph height `size`.
pub fn text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * ADVANCE
}

/// Draw `text` with its left edge at `x` and vertical center at `y`.
pub fn draw_text(pixmap: &mut Pixmap, text: &str, x: f32, y: f32, size: f32, color: [u8; 4]) {
    let mut paint = Paint::default();
    paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
    paint.anti_alias = true;

    let stroke = Stroke {
        width: (size * 0.12).max(1.0),
        line_cap: LineCap::Round,
        line_join: LineJoin::Round,
        ..Stroke::default()
    };

    let advance = size * ADVANCE;
    let half_w = size * 0.25;
    let half_h = size * 0.5;

    for (i, ch) in text.chars().enumerate() {
        let cx = x + i as f32 * advance + advance / 2.0;
        let strokes = segments(ch, half_w, half_h);
        if strokes.is_empty() {
            continue;
        }

        let mut pb = PathBuilder::new();
        for ((x1, y1), (x2, y2)) in strokes {
            pb.move_to(cx + x1, y + y1);
            pb.line_to(cx + x2, y + y2);
        }
        if let Some(path) = pb.finish() {
            pixmap.stroke_path(&path, &paint, &stroke, Transform::identity(), None);
        }
    }
}

/// Short axis label for a value: `950`, `1.5k`, `12M`, `0.25`.
pub fn format_value(value: f64) -> String {
    let abs = value.abs();
    let (scaled, suffix) = if abs >= 1e6 {
        (value / 1e6, "M")
    } else if abs >= 1e3 {
        (value / 1e3, "k")
    } else {
        (value, "")
    };

    let text = if (scaled - scaled.round()).abs() < 1e-9 {
        format!("{}", scaled.round() as i64)
    } else if scaled.abs() >= 10.0 {
        format!("{:.0}", scaled)
    } else if scaled.abs() >= 1.0 || !suffix.is_empty() {
        format!("{:.1}", scaled)
    } else {
        format!("{:.2}", scaled)
    };
    format!("{}{}", text, suffix)
}
