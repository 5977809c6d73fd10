//! Chart rendering for activity series.
//!
//! A series is drawn onto a [`tiny_skia::Pixmap`] and encoded as PNG:
//! - Line and area charts
//! - Grouped and stacked bar charts
//! - Grid, axes, tick labels and legend

pub mod chart;
pub mod glyphs;
pub mod png;
pub mod theme;

use chart_common::{ChartSeries, RenderError, RenderOptions};
use tracing::debug;

pub use chart::draw_chart;
pub use theme::Theme;

/// Render `series` to PNG bytes using the default theme.
pub fn render_chart(series: &ChartSeries, options: &RenderOptions) -> Result<Vec<u8>, RenderError> {
    render_chart_with_theme(series, options, &Theme::default())
}

/// Render `series` to PNG bytes.
pub fn render_chart_with_theme(
    series: &ChartSeries,
    options: &RenderOptions,
    theme: &Theme,
) -> Result<Vec<u8>, RenderError> {
    options.validate()?;
    series.validate().map_err(RenderError::InvalidPayload)?;

    let pixmap = draw_chart(series, options, theme)?;

    // tiny-skia stores premultiplied alpha; PNG wants straight alpha.
    let pixels: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|p| {
            let c = p.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();

    let (png, mode) = png::encode_png_with_mode(&pixels, options.width, options.height)?;
    debug!(
        kind = %options.kind,
        width = options.width,
        height = options.height,
        datasets = series.datasets.len(),
        bytes = png.len(),
        mode = ?mode,
        "Rendered chart"
    );
    Ok(png)
}
