//! Colors and layout constants for charts.

/// Dataset colors, assigned in dataset order and reused cyclically.
const DATASET_COLORS: [&str; 10] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f",
    "#edc948", "#b07aa1", "#ff9da7", "#9c755f", "#bab0ac",
];

/// Parse a `#rrggbb` color.
pub fn hex_to_rgb(hex: &str) -> Option<(u8, u8, u8)> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }

    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;

    Some((r, g, b))
}

/// Visual constants shared by every chart kind.
#[derive(Debug, Clone)]
pub struct Theme {
    pub background: [u8; 4],
    pub axis: [u8; 4],
    pub grid: [u8; 4],
    pub text: [u8; 4],
    /// Alpha used for filled areas.
    pub area_alpha: u8,
    pub line_width: f32,
    pub font_size: f32,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            background: [255, 255, 255, 255],
            axis: [60, 60, 60, 255],
            grid: [225, 225, 225, 255],
            text: [40, 40, 40, 255],
            area_alpha: 90,
            line_width: 2.0,
            font_size: 10.0,
        }
    }
}

impl Theme {
    /// Color of the `index`-th dataset.
    pub fn dataset_color(&self, index: usize) -> [u8; 4] {
        let (r, g, b) = hex_to_rgb(DATASET_COLORS[index % DATASET_COLORS.len()]).unwrap_or((0, 0, 0));
        [r, g, b, 255]
    }
}
