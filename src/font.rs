//! Text rendering backends for watermark tiles and preview labels.
//!
//! Two faces are available:
//!
//! - [`WatermarkFont::Builtin`]: a compiled-in 5x7 bitmap face covering
//!   printable ASCII. Needs no files and renders bit-identically everywhere.
//! - [`WatermarkFont::TrueType`]: any TrueType/OpenType font parsed by
//!   `ab_glyph`, rendered with anti-aliased coverage.

use std::fmt;
use std::path::Path;

use ab_glyph::{point, Font, FontArc, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};

use crate::blending::over;
use crate::error::{Error, Result};

/// Columns per builtin glyph cell, including one column of spacing.
const CELL_W: u32 = 6;
/// Rows per builtin glyph cell, including one row of spacing.
const CELL_H: u32 = 8;
/// Lit columns per glyph.
const GLYPH_W: u32 = 5;
/// Lit rows per glyph.
const GLYPH_H: u32 = 7;

/// Row bitmaps for `' '..='~'`; bit 4 is the leftmost column.
#[rustfmt::skip]
const BUILTIN_GLYPHS: [[u8; 7]; 95] = [
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], // ' '
    [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04], // !
    [0x0A, 0x0A, 0x0A, 0x00, 0x00, 0x00, 0x00], // "
    [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A], // #
    [0x04, 0x0F, 0x14, 0x0E, 0x05, 0x1E, 0x04], // $
    [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03], // %
    [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D], // &
    [0x0C, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00], // '
    [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02], // (
    [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08], // )
    [0x00, 0x04, 0x15, 0x0E, 0x15, 0x04, 0x00], // *
    [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00], // +
    [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08], // ,
    [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00], // -
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C], // .
    [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00], // /
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E], // 0
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E], // 1
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F], // 2
    [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E], // 3
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02], // 4
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E], // 5
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E], // 6
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08], // 7
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E], // 8
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C], // 9
    [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00], // :
    [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x04, 0x08], // ;
    [0x02, 0x04, 0x08, 0x10, 0x08, 0x04, 0x02], // <
    [0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00], // =
    [0x08, 0x04, 0x02, 0x01, 0x02, 0x04, 0x08], // >
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04], // ?
    [0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E], // @
    [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11], // A
    [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E], // B
    [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E], // C
    [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C], // D
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F], // E
    [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10], // F
    [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F], // G
    [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11], // H
    [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E], // I
    [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C], // J
    [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11], // K
    [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F], // L
    [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11], // M
    [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11], // N
    [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E], // O
    [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10], // P
    [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D], // Q
    [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11], // R
    [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E], // S
    [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04], // T
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E], // U
    [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04], // V
    [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A], // W
    [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11], // X
    [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04], // Y
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F], // Z
    [0x0E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x0E], // [
    [0x00, 0x10, 0x08, 0x04, 0x02, 0x01, 0x00], // backslash
    [0x0E, 0x02, 0x02, 0x02, 0x02, 0x02, 0x0E], // ]
    [0x04, 0x0A, 0x11, 0x00, 0x00, 0x00, 0x00], // ^
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F], // _
    [0x08, 0x04, 0x02, 0x00, 0x00, 0x00, 0x00], // `
    [0x00, 0x00, 0x0E, 0x01, 0x0F, 0x11, 0x0F], // a
    [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x1E], // b
    [0x00, 0x00, 0x0E, 0x10, 0x10, 0x11, 0x0E], // c
    [0x01, 0x01, 0x0D, 0x13, 0x11, 0x11, 0x0F], // d
    [0x00, 0x00, 0x0E, 0x11, 0x1F, 0x10, 0x0E], // e
    [0x06, 0x09, 0x08, 0x1C, 0x08, 0x08, 0x08], // f
    [0x00, 0x0F, 0x11, 0x11, 0x0F, 0x01, 0x0E], // g
    [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11], // h
    [0x04, 0x00, 0x0C, 0x04, 0x04, 0x04, 0x0E], // i
    [0x02, 0x00, 0x06, 0x02, 0x02, 0x12, 0x0C], // j
    [0x10, 0x10, 0x12, 0x14, 0x18, 0x14, 0x12], // k
    [0x0C, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E], // l
    [0x00, 0x00, 0x1A, 0x15, 0x15, 0x11, 0x11], // m
    [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11], // n
    [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E], // o
    [0x00, 0x00, 0x1E, 0x11, 0x1E, 0x10, 0x10], // p
    [0x00, 0x00, 0x0D, 0x13, 0x0F, 0x01, 0x01], // q
    [0x00, 0x00, 0x16, 0x19, 0x10, 0x10, 0x10], // r
    [0x00, 0x00, 0x0E, 0x10, 0x0E, 0x01, 0x1E], // s
    [0x08, 0x08, 0x1C, 0x08, 0x08, 0x09, 0x06], // t
    [0x00, 0x00, 0x11, 0x11, 0x11, 0x13, 0x0D], // u
    [0x00, 0x00, 0x11, 0x11, 0x11, 0x0A, 0x04], // v
    [0x00, 0x00, 0x11, 0x11, 0x15, 0x15, 0x0A], // w
    [0x00, 0x00, 0x11, 0x0A, 0x04, 0x0A, 0x11], // x
    [0x00, 0x00, 0x11, 0x11, 0x0F, 0x01, 0x0E], // y
    [0x00, 0x00, 0x1F, 0x02, 0x04, 0x08, 0x1F], // z
    [0x02, 0x04, 0x04, 0x08, 0x04, 0x04, 0x02], // {
    [0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04], // |
    [0x08, 0x04, 0x04, 0x02, 0x04, 0x04, 0x08], // }
    [0x00, 0x00, 0x08, 0x15, 0x02, 0x00, 0x00], // ~
];

/// Bitmap rows for a character; anything outside printable ASCII renders as `?`.
fn builtin_glyph(c: char) -> &'static [u8; 7] {
    let idx = match c {
        ' '..='~' => c as usize - ' ' as usize,
        _ => '?' as usize - ' ' as usize,
    };
    &BUILTIN_GLYPHS[idx]
}

/// A face used to draw watermark text.
#[derive(Clone, Default)]
pub enum WatermarkFont {
    /// Compiled-in 5x7 bitmap face.
    #[default]
    Builtin,
    /// A parsed TrueType/OpenType font.
    TrueType(FontArc),
}

impl fmt::Debug for WatermarkFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin => f.write_str("WatermarkFont::Builtin"),
            Self::TrueType(_) => f.write_str("WatermarkFont::TrueType(..)"),
        }
    }
}

impl WatermarkFont {
    /// Parse a TrueType/OpenType font from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the bytes are not a usable font.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        FontArc::try_from_vec(data)
            .map(Self::TrueType)
            .map_err(|e| Error::InvalidInput(format!("failed to parse font: {e}")))
    }

    /// Load a TrueType/OpenType font from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or
    /// [`Error::InvalidInput`] if it is not a usable font.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Draw `text` with its top-left corner at `(x, y)`.
    ///
    /// Each covered pixel is composited "over" the canvas with `color`'s alpha
    /// scaled by glyph coverage. Pixels outside the canvas are clipped.
    pub fn render_text(
        &self,
        canvas: &mut RgbaImage,
        x: i32,
        y: i32,
        text: &str,
        size: u32,
        color: Rgba<u8>,
    ) {
        match self {
            Self::Builtin => render_builtin(canvas, x, y, text, size, color),
            Self::TrueType(font) => render_truetype(font, canvas, x, y, text, size, color),
        }
    }
}

fn plot(canvas: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>, coverage: f32) {
    let (w, h) = canvas.dimensions();
    if x < 0 || y < 0 || x >= i64::from(w) || y >= i64::from(h) || coverage <= 0.0 {
        return;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (x, y) = (x as u32, y as u32);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let alpha = (f32::from(color[3]) * coverage.min(1.0)).round() as u8;
    let src = Rgba([color[0], color[1], color[2], alpha]);
    let dst = canvas.get_pixel_mut(x, y);
    *dst = over(*dst, src);
}

/// Nearest-neighbour scaling of the bitmap face: one cell is `size` pixels tall.
fn render_builtin(canvas: &mut RgbaImage, x: i32, y: i32, text: &str, size: u32, color: Rgba<u8>) {
    let glyphs: Vec<&[u8; 7]> = text.chars().map(builtin_glyph).collect();
    if glyphs.is_empty() || size == 0 {
        return;
    }
    let size = u64::from(size);
    let cell_h = u64::from(CELL_H);
    let total_cols = u64::from(CELL_W) * glyphs.len() as u64;
    let width_px = (total_cols * size).div_ceil(cell_h);

    // Only walk the part of the text box that can land on the canvas.
    let (cw, ch) = canvas.dimensions();
    let x0 = i64::from(x);
    let y0 = i64::from(y);
    let px_start = u64::try_from(-x0).unwrap_or(0);
    let py_start = u64::try_from(-y0).unwrap_or(0);
    let px_end = width_px.min(u64::try_from(i64::from(cw) - x0).unwrap_or(0));
    let py_end = size.min(u64::try_from(i64::from(ch) - y0).unwrap_or(0));

    for py in py_start..py_end {
        let row = py * cell_h / size;
        if row >= u64::from(GLYPH_H) {
            continue;
        }
        for px in px_start..px_end {
            let col = px * cell_h / size;
            let glyph_idx = usize::try_from(col / u64::from(CELL_W)).unwrap_or(usize::MAX);
            let bit = col % u64::from(CELL_W);
            if bit >= u64::from(GLYPH_W) {
                continue;
            }
            let Some(glyph) = glyphs.get(glyph_idx) else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let lit = glyph[row as usize] & (0x10 >> bit) != 0;
            if lit {
                #[allow(clippy::cast_possible_wrap)]
                plot(canvas, x0 + px as i64, y0 + py as i64, color, 1.0);
            }
        }
    }
}

fn render_truetype(
    font: &FontArc,
    canvas: &mut RgbaImage,
    x: i32,
    y: i32,
    text: &str,
    size: u32,
    color: Rgba<u8>,
) {
    #[allow(clippy::cast_precision_loss)]
    let scale = PxScale::from(size as f32);
    let scaled = font.as_scaled(scale);
    #[allow(clippy::cast_precision_loss)]
    let baseline = y as f32 + scaled.ascent();
    #[allow(clippy::cast_precision_loss)]
    let mut cursor = x as f32;
    let mut prev = None;

    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(p) = prev {
            cursor += scaled.kern(p, id);
        }
        let glyph = id.with_scale_and_position(scale, point(cursor, baseline));
        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            #[allow(clippy::cast_possible_truncation)]
            let (bx, by) = (bounds.min.x as i64, bounds.min.y as i64);
            outlined.draw(|gx, gy, coverage| {
                plot(
                    canvas,
                    bx + i64::from(gx),
                    by + i64::from(gy),
                    color,
                    coverage,
                );
            });
        }
        cursor += scaled.h_advance(id);
        prev = Some(id);
    }
}
