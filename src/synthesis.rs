//! Tiled, rotated text watermark layer synthesis.
//!
//! The text is drawn once into a transparent `step_x` x `step_y` tile, the
//! tile is rotated onto an expanded canvas so no glyph pixel is lost, and the
//! rotated tile is composited "over" the full-size layer at every grid
//! origin. Tiles hanging off the right or bottom edge are clipped at paste time.

use image::{imageops, Rgba, RgbaImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::debug;

use crate::config::{ProcessingConfig, WatermarkParams};
use crate::error::{Error, Result};
use crate::font::WatermarkFont;

/// Gray level used for watermark text on every channel.
pub const TEXT_GRAY: u8 = 128;

/// Transparent pixel used for tile and layer backgrounds.
///
/// The color matches the text so interpolation at glyph edges never pulls in
/// a foreign color.
pub const TRANSPARENT: Rgba<u8> = Rgba([TEXT_GRAY, TEXT_GRAY, TEXT_GRAY, 0]);

/// Transparent margin added on every side of a rotated tile.
const ROTATION_MARGIN: u32 = 3;

/// Upper bound on tile area, guards against absurd explicit font sizes.
const MAX_TILE_PIXELS: u64 = 64 * 1024 * 1024;

/// Spacing of the repeating watermark pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    /// Font size the grid was derived from.
    pub font_size: u32,
    /// Horizontal distance between tile origins (`font_size * 10`).
    pub step_x: u32,
    /// Vertical distance between tile origins (`font_size * 3`).
    pub step_y: u32,
}

impl TileGrid {
    /// Grid for an explicit font size; both steps are at least 1.
    #[must_use]
    pub fn for_font_size(font_size: u32) -> Self {
        Self {
            font_size,
            step_x: font_size.saturating_mul(10).max(1),
            step_y: font_size.saturating_mul(3).max(1),
        }
    }

    /// Grid for `params` on a `width` x `height` canvas.
    #[must_use]
    pub fn for_params(
        params: &WatermarkParams,
        width: u32,
        height: u32,
        config: &ProcessingConfig,
    ) -> Self {
        Self::for_font_size(params.resolved_font_size(width, height, config.font_size_factor))
    }

    /// Number of tile columns on a canvas of `width`.
    #[must_use]
    pub fn columns(&self, width: u32) -> u32 {
        width.div_ceil(self.step_x)
    }

    /// Number of tile rows on a canvas of `height`.
    #[must_use]
    pub fn rows(&self, height: u32) -> u32 {
        height.div_ceil(self.step_y)
    }

    /// Tile origins in row-major order: `x` in `0..width`, `y` in `0..height`.
    #[must_use]
    pub fn origins(&self, width: u32, height: u32) -> Vec<(u32, u32)> {
        (0..height)
            .step_by(self.step_y as usize)
            .flat_map(|y| {
                (0..width)
                    .step_by(self.step_x as usize)
                    .map(move |x| (x, y))
            })
            .collect()
    }
}

/// Draw `text` once into a transparent tile of the grid's step size.
#[must_use]
pub fn render_tile(font: &WatermarkFont, text: &str, grid: &TileGrid, alpha: u8) -> RgbaImage {
    let mut tile = RgbaImage::from_pixel(grid.step_x, grid.step_y, TRANSPARENT);
    let color = Rgba([TEXT_GRAY, TEXT_GRAY, TEXT_GRAY, alpha]);
    font.render_text(&mut tile, 0, 0, text, grid.font_size, color);
    tile
}

/// Rotate `tile` counter-clockwise by `degrees`, expanding the canvas.
///
/// The output is large enough for the rotated bounding box plus a small
/// transparent margin, so nothing drawn in `tile` is clipped. An angle that
/// normalises to 0 returns the tile unchanged.
#[must_use]
pub fn rotate_expanded(tile: &RgbaImage, degrees: f32) -> RgbaImage {
    let degrees = degrees.rem_euclid(360.0);
    if degrees == 0.0 || degrees >= 360.0 {
        return tile.clone();
    }

    let radians = degrees.to_radians();
    let (w, h) = tile.dimensions();
    let (wf, hf) = (f64::from(w), f64::from(h));
    let cos = f64::from(radians.cos().abs());
    let sin = f64::from(radians.sin().abs());

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bbox_w = (wf * cos + hf * sin).ceil() as u32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bbox_h = (wf * sin + hf * cos).ceil() as u32;
    // The tile itself must fit before rotation, e.g. a wide tile turned by 90°.
    let out_w = (bbox_w + 2 * ROTATION_MARGIN).max(w);
    let out_h = (bbox_h + 2 * ROTATION_MARGIN).max(h);

    let mut canvas = RgbaImage::from_pixel(out_w, out_h, TRANSPARENT);
    let ox = (canvas.width() - w) / 2;
    let oy = (canvas.height() - h) / 2;
    imageops::replace(&mut canvas, tile, i64::from(ox), i64::from(oy));

    // imageproc rotates clockwise for positive theta
    rotate_about_center(&canvas, -radians, Interpolation::Bilinear, TRANSPARENT)
}

/// Render the full-canvas watermark layer for `params`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for invalid parameters and
/// [`Error::ProcessingFailure`] for a zero-sized canvas or a tile too large
/// to allocate.
pub fn synthesize_layer(
    params: &WatermarkParams,
    width: u32,
    height: u32,
    font: &WatermarkFont,
    config: &ProcessingConfig,
) -> Result<RgbaImage> {
    params.validate()?;
    if width == 0 || height == 0 {
        return Err(Error::ProcessingFailure(format!(
            "cannot synthesize a watermark for a {width}x{height} image"
        )));
    }

    let grid = TileGrid::for_params(params, width, height, config);
    let tile_pixels = u64::from(grid.step_x) * u64::from(grid.step_y);
    if tile_pixels > MAX_TILE_PIXELS {
        return Err(Error::ProcessingFailure(format!(
            "font size {} gives a {}x{} tile, too large to render",
            grid.font_size, grid.step_x, grid.step_y
        )));
    }

    let angle = params.normalized_angle();
    let origins = grid.origins(width, height);
    debug!(
        width,
        height,
        font_size = grid.font_size,
        step_x = grid.step_x,
        step_y = grid.step_y,
        tiles = origins.len(),
        angle,
        "synthesizing watermark layer"
    );

    let mut layer = RgbaImage::from_pixel(width, height, TRANSPARENT);
    let alpha = params.alpha();
    if alpha == 0 {
        return Ok(layer);
    }

    let tile = render_tile(font, &params.text, &grid, alpha);
    let rotated = rotate_expanded(&tile, angle);
    for (x, y) in origins {
        imageops::overlay(&mut layer, &rotated, i64::from(x), i64::from(y));
    }
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn alpha_mass(img: &RgbaImage) -> u64 {
        img.pixels().map(|p| u64::from(p[3])).sum()
    }

    #[test]
    fn grid_for_reference_scenario() {
        let params = WatermarkParams {
            angle: 30.0,
            ..WatermarkParams::new("TEST")
        };
        let grid = TileGrid::for_params(&params, 800, 600, &ProcessingConfig::default());
        assert_eq!(grid.font_size, 28);
        assert_eq!(grid.step_x, 280);
        assert_eq!(grid.step_y, 84);
        assert_eq!(grid.columns(800), 3);
        assert_eq!(grid.rows(600), 8);
        assert_eq!(grid.origins(800, 600).len(), 24);
    }

    #[test]
    fn origins_are_row_major_and_in_bounds() {
        let grid = TileGrid::for_font_size(2);
        let origins = grid.origins(45, 13);
        assert_eq!(origins[0], (0, 0));
        assert_eq!(origins[1], (20, 0));
        assert_eq!(origins[3], (0, 6));
        assert!(origins.iter().all(|&(x, y)| x < 45 && y < 13));
        assert_eq!(origins.len(), 3 * 3);
    }

    #[test]
    fn steps_clamped_to_one() {
        let grid = TileGrid::for_font_size(0);
        assert_eq!((grid.step_x, grid.step_y), (1, 1));
    }

    #[test]
    fn tile_has_text_pixels() {
        let grid = TileGrid::for_font_size(16);
        let tile = render_tile(&WatermarkFont::Builtin, "AB", &grid, 127);
        assert_eq!(tile.dimensions(), (160, 48));
        assert!(tile.pixels().any(|p| p[3] == 127));
        assert!(tile.pixels().all(|p| p.0[..3] == [TEXT_GRAY; 3]));
    }

    #[test]
    fn zero_angle_rotation_is_identity() {
        let grid = TileGrid::for_font_size(8);
        let tile = render_tile(&WatermarkFont::Builtin, "X", &grid, 255);
        assert_eq!(rotate_expanded(&tile, 0.0), tile);
        assert_eq!(rotate_expanded(&tile, 360.0), tile);
    }

    #[rstest]
    #[case(15.0)]
    #[case(30.0)]
    #[case(45.0)]
    #[case(90.0)]
    #[case(135.0)]
    #[case(200.0)]
    #[case(333.3)]
    #[case(-30.0)]
    fn rotated_tile_contains_every_glyph_pixel(#[case] angle: f32) {
        // A fully opaque tile is the worst case: content touches every edge.
        let tile = RgbaImage::from_pixel(40, 12, Rgba([TEXT_GRAY, TEXT_GRAY, TEXT_GRAY, 255]));
        let rotated = rotate_expanded(&tile, angle);
        let (w, h) = rotated.dimensions();

        // Nothing reaches the outer frame, so nothing was cut off.
        for x in 0..w {
            assert_eq!(rotated.get_pixel(x, 0)[3], 0, "top edge at {angle}");
            assert_eq!(rotated.get_pixel(x, h - 1)[3], 0, "bottom edge at {angle}");
        }
        for y in 0..h {
            assert_eq!(rotated.get_pixel(0, y)[3], 0, "left edge at {angle}");
            assert_eq!(rotated.get_pixel(w - 1, y)[3], 0, "right edge at {angle}");
        }

        // Coverage is conserved up to interpolation error.
        let before = alpha_mass(&tile);
        let after = alpha_mass(&rotated);
        #[allow(clippy::cast_precision_loss)]
        let ratio = after as f64 / before as f64;
        assert!((0.9..=1.1).contains(&ratio), "mass ratio {ratio} at {angle}");
    }

    #[test]
    fn overlapping_tiles_compose_by_alpha() {
        let mut canvas = RgbaImage::from_pixel(4, 4, TRANSPARENT);
        let tile = RgbaImage::from_pixel(2, 2, Rgba([TEXT_GRAY, TEXT_GRAY, TEXT_GRAY, 100]));
        imageops::overlay(&mut canvas, &tile, 0, 0);
        imageops::overlay(&mut canvas, &tile, 1, 1);
        assert_eq!(*canvas.get_pixel(0, 0), Rgba([TEXT_GRAY, TEXT_GRAY, TEXT_GRAY, 100]));
        assert!(canvas.get_pixel(1, 1)[3] > 100);
        assert_eq!(canvas.get_pixel(3, 0)[3], 0);
    }

    #[test]
    fn layer_matches_canvas_and_is_not_empty() {
        let params = WatermarkParams {
            angle: 30.0,
            ..WatermarkParams::new("TEST")
        };
        let layer = synthesize_layer(
            &params,
            800,
            600,
            &WatermarkFont::Builtin,
            &ProcessingConfig::default(),
        )
        .unwrap();
        assert_eq!(layer.dimensions(), (800, 600));
        assert!(layer.pixels().any(|p| p[3] > 0));
    }

    #[test]
    fn zero_opacity_layer_is_transparent() {
        let params = WatermarkParams {
            opacity: 0.0,
            ..WatermarkParams::new("TEST")
        };
        let layer = synthesize_layer(
            &params,
            120,
            90,
            &WatermarkFont::Builtin,
            &ProcessingConfig::default(),
        )
        .unwrap();
        assert!(layer.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let params = WatermarkParams {
            angle: 47.5,
            font_size: Some(9),
            ..WatermarkParams::new("repeat me")
        };
        let cfg = ProcessingConfig::default();
        let a = synthesize_layer(&params, 200, 150, &WatermarkFont::Builtin, &cfg).unwrap();
        let b = synthesize_layer(&params, 200, 150, &WatermarkFont::Builtin, &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_sized_canvas_fails() {
        let err = synthesize_layer(
            &WatermarkParams::new("x"),
            0,
            10,
            &WatermarkFont::Builtin,
            &ProcessingConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessingFailure);
    }

    #[test]
    fn invalid_params_fail_before_rendering() {
        let err = synthesize_layer(
            &WatermarkParams::new(""),
            10,
            10,
            &WatermarkFont::Builtin,
            &ProcessingConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_font_is_rejected() {
        let params = WatermarkParams {
            font_size: Some(100_000),
            ..WatermarkParams::new("x")
        };
        let err = synthesize_layer(
            &params,
            10,
            10,
            &WatermarkFont::Builtin,
            &ProcessingConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProcessingFailure);
    }
}
