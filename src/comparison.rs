//! Side-by-side preview of original, watermarked and cleaned images.

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, Rgba, RgbaImage};

use crate::error::{Error, Result};
use crate::font::WatermarkFont;

/// Height every panel is scaled to.
pub const PANEL_HEIGHT: u32 = 500;
/// Black gap between panels.
pub const GUTTER: u32 = 10;

const LABEL_SIZE: u32 = 24;
const LABEL_INSET: i32 = 10;
const LABEL_TOP: i32 = 8;
const LABEL_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Panel width for an image of `width` x `height` scaled to [`PANEL_HEIGHT`].
#[must_use]
pub fn panel_width(width: u32, height: u32) -> u32 {
    let w = u64::from(PANEL_HEIGHT) * u64::from(width) / u64::from(height.max(1));
    u32::try_from(w).unwrap_or(u32::MAX).max(1)
}

/// Build the comparison canvas.
///
/// Every panel takes the original's aspect ratio. Panels are labelled
/// "Original", "Watermarked" and, when `removed` is given, "Removed".
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `original` has a zero dimension.
pub fn comparison_image(
    original: &DynamicImage,
    watermarked: &DynamicImage,
    removed: Option<&DynamicImage>,
) -> Result<RgbImage> {
    let mut panels = vec![("Original", original), ("Watermarked", watermarked)];
    if let Some(removed) = removed {
        panels.push(("Removed", removed));
    }
    labelled_panels(&panels)
}

/// Two-panel "Watermarked | Removed" preview for a removal run, where the
/// unwatermarked original is not available.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `watermarked` has a zero dimension.
pub fn removal_comparison(watermarked: &DynamicImage, removed: &DynamicImage) -> Result<RgbImage> {
    labelled_panels(&[("Watermarked", watermarked), ("Removed", removed)])
}

/// Lay `panels` out left to right, all scaled to the first panel's aspect.
fn labelled_panels(panels: &[(&str, &DynamicImage)]) -> Result<RgbImage> {
    let Some((_, first)) = panels.first() else {
        return Err(Error::InvalidInput("comparison needs at least one panel".into()));
    };
    if first.width() == 0 || first.height() == 0 {
        return Err(Error::InvalidInput(
            "cannot build a comparison from an empty image".into(),
        ));
    }
    let pw = panel_width(first.width(), first.height());

    #[allow(clippy::cast_possible_truncation)]
    let count = panels.len() as u32;
    let canvas_w = pw * count + GUTTER * (count - 1);
    let mut canvas = RgbaImage::from_pixel(canvas_w, PANEL_HEIGHT, Rgba([0, 0, 0, 255]));
    let font = WatermarkFont::Builtin;

    for (i, (label, image)) in panels.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = (pw + GUTTER) * i as u32;
        let panel = imageops::resize(&image.to_rgba8(), pw, PANEL_HEIGHT, FilterType::Triangle);
        imageops::overlay(&mut canvas, &panel, i64::from(x), 0);
        #[allow(clippy::cast_possible_wrap)]
        let label_x = x as i32 + LABEL_INSET;
        font.render_text(&mut canvas, label_x, LABEL_TOP, label, LABEL_SIZE, LABEL_COLOR);
    }

    Ok(DynamicImage::ImageRgba8(canvas).to_rgb8())
}
