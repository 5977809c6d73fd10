//! Chart rasterization with tiny-skia.

use tiny_skia::{
    FillRule, LineCap, LineJoin, Paint, PathBuilder, Pixmap, Rect, Stroke, Transform,
};

use chart_common::{ChartKind, ChartSeries, RenderError, RenderOptions};

use crate::glyphs::{draw_text, format_value, text_width};
use crate::theme::Theme;

/// Below this size charts are drawn without text, legend or margins.
const COMPACT_WIDTH: u32 = 160;
const COMPACT_HEIGHT: u32 = 100;

const Y_TICKS: usize = 5;

/// Pixel rectangle the data is plotted in.
#[derive(Debug, Clone, Copy)]
struct PlotArea {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

impl PlotArea {
    fn width(&self) -> f32 {
        self.right - self.left
    }

    fn height(&self) -> f32 {
        self.bottom - self.top
    }

    fn slot_width(&self, slots: usize) -> f32 {
        self.width() / slots.max(1) as f32
    }

    /// Horizontal center of label slot `i` out of `slots`.
    fn x_center(&self, i: usize, slots: usize) -> f32 {
        self.left + (i as f32 + 0.5) * self.slot_width(slots)
    }

    fn y(&self, value: f64, max: f64) -> f32 {
        let ratio = (value / max).clamp(0.0, 1.0) as f32;
        self.bottom - ratio * self.height()
    }
}

fn paint(color: [u8; 4]) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
    paint.anti_alias = true;
    paint
}

fn line_stroke(width: f32) -> Stroke {
    Stroke {
        width,
        line_cap: LineCap::Round,
        line_join: LineJoin::Round,
        ..Stroke::default()
    }
}

/// Round `value` up to 1, 2, 2.5 or 5 times a power of ten.
pub fn nice_ceiling(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 1.0;
    }
    let magnitude = 10f64.powf(value.log10().floor());
    let normalized = value / magnitude;
    let nice = [1.0, 2.0, 2.5, 5.0, 10.0]
        .into_iter()
        .find(|step| normalized <= *step + 1e-9)
        .unwrap_or(10.0);
    nice * magnitude
}

/// Draw `series` into a new pixmap.
pub fn draw_chart(series: &ChartSeries, options: &RenderOptions, theme: &Theme) -> Result<Pixmap, RenderError> {
    let mut pixmap = Pixmap::new(options.width, options.height).ok_or_else(|| {
        RenderError::Encode(format!("cannot allocate {}x{} canvas", options.width, options.height))
    })?;
    let [r, g, b, a] = theme.background;
    pixmap.fill(tiny_skia::Color::from_rgba8(r, g, b, a));

    let compact = options.width < COMPACT_WIDTH || options.height < COMPACT_HEIGHT;
    let y_max = nice_ceiling(match options.kind {
        ChartKind::StackedBar => series.max_stacked_value(),
        _ => series.max_value(),
    });

    let plot = layout(series, options, theme, y_max, compact);

    if options.show_grid {
        draw_grid(&mut pixmap, &plot, theme);
    }

    let slots = series.labels.len();
    match options.kind {
        ChartKind::Line => draw_lines(&mut pixmap, &plot, series, theme, y_max, false),
        ChartKind::Area => draw_lines(&mut pixmap, &plot, series, theme, y_max, true),
        ChartKind::Bar => draw_bars(&mut pixmap, &plot, series, theme, y_max),
        ChartKind::StackedBar => draw_stacked_bars(&mut pixmap, &plot, series, theme, y_max),
    }

    draw_axes(&mut pixmap, &plot, theme);

    if !compact {
        draw_y_labels(&mut pixmap, &plot, theme, y_max);
        draw_x_labels(&mut pixmap, &plot, series, theme, slots);
        if let Some(title) = &options.title {
            let x = (options.width as f32 - text_width(title, theme.font_size)) / 2.0;
            draw_text(&mut pixmap, title, x.max(0.0), theme.font_size, theme.font_size, theme.text);
        }
        if options.show_legend && !series.datasets.is_empty() {
            draw_legend(&mut pixmap, series, theme, options.width as f32, legend_top(options, theme));
        }
    }

    Ok(pixmap)
}

fn legend_top(options: &RenderOptions, theme: &Theme) -> f32 {
    let title_rows = if options.title.is_some() { 2.0 } else { 0.0 };
    theme.font_size * (title_rows + 1.0)
}

fn layout(series: &ChartSeries, options: &RenderOptions, theme: &Theme, y_max: f64, compact: bool) -> PlotArea {
    let (width, height) = (options.width as f32, options.height as f32);
    if compact {
        return PlotArea {
            left: 2.0,
            top: 2.0,
            right: (width - 2.0).max(3.0),
            bottom: (height - 2.0).max(3.0),
        };
    }

    let font = theme.font_size;
    let widest_tick = (0..=Y_TICKS)
        .map(|i| text_width(&format_value(y_max * i as f64 / Y_TICKS as f64), font))
        .fold(0.0, f32::max);

    let mut top = font;
    if options.title.is_some() {
        top += font * 2.0;
    }
    if options.show_legend && !series.datasets.is_empty() {
        top += font * 2.0;
    }

    PlotArea {
        left: widest_tick + 12.0,
        top,
        right: width - 12.0,
        bottom: height - font * 2.5,
    }
}

fn draw_grid(pixmap: &mut Pixmap, plot: &PlotArea, theme: &Theme) {
    let mut pb = PathBuilder::new();
    for i in 1..=Y_TICKS {
        let y = plot.bottom - plot.height() * i as f32 / Y_TICKS as f32;
        pb.move_to(plot.left, y);
        pb.line_to(plot.right, y);
    }
    if let Some(path) = pb.finish() {
        pixmap.stroke_path(&path, &paint(theme.grid), &line_stroke(1.0), Transform::identity(), None);
    }
}

fn draw_axes(pixmap: &mut Pixmap, plot: &PlotArea, theme: &Theme) {
    let mut pb = PathBuilder::new();
    pb.move_to(plot.left, plot.top);
    pb.line_to(plot.left, plot.bottom);
    pb.line_to(plot.right, plot.bottom);
    if let Some(path) = pb.finish() {
        pixmap.stroke_path(&path, &paint(theme.axis), &line_stroke(1.0), Transform::identity(), None);
    }
}

fn draw_y_labels(pixmap: &mut Pixmap, plot: &PlotArea, theme: &Theme, y_max: f64) {
    for i in 0..=Y_TICKS {
        let value = y_max * i as f64 / Y_TICKS as f64;
        let text = format_value(value);
        let y = plot.bottom - plot.height() * i as f32 / Y_TICKS as f32;
        let x = plot.left - 6.0 - text_width(&text, theme.font_size);
        draw_text(pixmap, &text, x, y, theme.font_size, theme.text);
    }
}

fn draw_x_labels(pixmap: &mut Pixmap, plot: &PlotArea, series: &ChartSeries, theme: &Theme, slots: usize) {
    if slots == 0 {
        return;
    }
    let widest = series
        .labels
        .iter()
        .map(|label| text_width(label, theme.font_size))
        .fold(0.0, f32::max);
    // Skip labels so neighbours never overlap.
    let stride = (((widest + 8.0) * slots as f32) / plot.width().max(1.0)).ceil().max(1.0) as usize;

    let y = plot.bottom + theme.font_size * 1.2;
    for (i, label) in series.labels.iter().enumerate().step_by(stride) {
        let x = plot.x_center(i, slots) - text_width(label, theme.font_size) / 2.0;
        draw_text(pixmap, label, x, y, theme.font_size, theme.text);
    }
}

fn draw_lines(pixmap: &mut Pixmap, plot: &PlotArea, series: &ChartSeries, theme: &Theme, y_max: f64, filled: bool) {
    let slots = series.labels.len();
    if slots == 0 {
        return;
    }

    for (index, dataset) in series.datasets.iter().enumerate() {
        let color = theme.dataset_color(index);
        let points: Vec<(f32, f32)> = dataset
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (plot.x_center(i, slots), plot.y(*v, y_max)))
            .collect();
        if points.is_empty() {
            continue;
        }

        if filled {
            let mut pb = PathBuilder::new();
            pb.move_to(points[0].0, plot.bottom);
            for (x, y) in &points {
                pb.line_to(*x, *y);
            }
            pb.line_to(points[points.len() - 1].0, plot.bottom);
            pb.close();
            if let Some(path) = pb.finish() {
                let [r, g, b, _] = color;
                pixmap.fill_path(
                    &path,
                    &paint([r, g, b, theme.area_alpha]),
                    FillRule::Winding,
                    Transform::identity(),
                    None,
                );
            }
        }

        if points.len() == 1 {
            if let Some(dot) = PathBuilder::from_circle(points[0].0, points[0].1, theme.line_width * 1.5) {
                pixmap.fill_path(&dot, &paint(color), FillRule::Winding, Transform::identity(), None);
            }
            continue;
        }

        let mut pb = PathBuilder::new();
        pb.move_to(points[0].0, points[0].1);
        for (x, y) in &points[1..] {
            pb.line_to(*x, *y);
        }
        if let Some(path) = pb.finish() {
            pixmap.stroke_path(&path, &paint(color), &line_stroke(theme.line_width), Transform::identity(), None);
        }
    }
}

fn fill_bar(pixmap: &mut Pixmap, x: f32, top: f32, width: f32, bottom: f32, color: [u8; 4]) {
    if let Some(rect) = Rect::from_xywh(x, top, width, bottom - top) {
        pixmap.fill_rect(rect, &paint(color), Transform::identity(), None);
    }
}

fn draw_bars(pixmap: &mut Pixmap, plot: &PlotArea, series: &ChartSeries, theme: &Theme, y_max: f64) {
    let slots = series.labels.len();
    let groups = series.datasets.len();
    if slots == 0 || groups == 0 {
        return;
    }

    let slot = plot.slot_width(slots);
    let group_width = slot * 0.8;
    let bar_width = group_width / groups as f32;

    for (index, dataset) in series.datasets.iter().enumerate() {
        let color = theme.dataset_color(index);
        for (i, value) in dataset.values.iter().enumerate() {
            let x = plot.left + i as f32 * slot + (slot - group_width) / 2.0 + index as f32 * bar_width;
            fill_bar(pixmap, x, plot.y(*value, y_max), bar_width, plot.bottom, color);
        }
    }
}

fn draw_stacked_bars(pixmap: &mut Pixmap, plot: &PlotArea, series: &ChartSeries, theme: &Theme, y_max: f64) {
    let slots = series.labels.len();
    if slots == 0 {
        return;
    }

    let slot = plot.slot_width(slots);
    let bar_width = slot * 0.6;

    for i in 0..slots {
        let x = plot.left + i as f32 * slot + (slot - bar_width) / 2.0;
        let mut base = 0.0;
        for (index, dataset) in series.datasets.iter().enumerate() {
            let value = dataset.values.get(i).copied().unwrap_or(0.0).max(0.0);
            if value == 0.0 {
                continue;
            }
            let top = plot.y(base + value, y_max);
            let bottom = plot.y(base, y_max);
            fill_bar(pixmap, x, top, bar_width, bottom, theme.dataset_color(index));
            base += value;
        }
    }
}

fn draw_legend(pixmap: &mut Pixmap, series: &ChartSeries, theme: &Theme, width: f32, top: f32) {
    let font = theme.font_size;
    let swatch = font;
    let mut x = 12.0;

    for (index, dataset) in series.datasets.iter().enumerate() {
        let entry_width = swatch + 4.0 + text_width(&dataset.name, font) + 12.0;
        if x + entry_width > width {
            break;
        }
        fill_bar(pixmap, x, top - swatch / 2.0, swatch, top + swatch / 2.0, theme.dataset_color(index));
        draw_text(pixmap, &dataset.name, x + swatch + 4.0, top, font, theme.text);
        x += entry_width;
    }
}
