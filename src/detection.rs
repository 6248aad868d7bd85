//! Heuristic watermark footprint detection for images without a known mask.
//!
//! 1. **Grayscale**: luminance `0.299*R + 0.587*G + 0.114*B`
//! 2. **Adaptive threshold** (inverse): flag pixels at least `offset` darker
//!    than the mean of their `block` x `block` neighbourhood
//! 3. **Opening** with a 3x3 square to drop isolated speckles
//!
//! There is no correctness guarantee: the output only approximates where a
//! semi-transparent overlay darkened the image.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::box_filter;
use imageproc::morphology::open;
use tracing::debug;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};

/// Value written for flagged pixels.
pub const FLAGGED: u8 = 255;

/// Convert an image to 8-bit grayscale with BT.601 luma weights.
#[must_use]
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let px = rgb.get_pixel(x, y);
        let lum = 0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lum = lum.round().clamp(0.0, 255.0) as u8;
        Luma([lum])
    })
}

/// Inverse adaptive threshold against the local box mean.
///
/// A pixel becomes [`FLAGGED`] when `value <= mean - offset`, otherwise 0.
#[must_use]
pub fn adaptive_threshold_inv(gray: &GrayImage, block_size: u32, offset: i32) -> GrayImage {
    let radius = block_size / 2;
    let mean = box_filter(gray, radius, radius);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = i32::from(gray.get_pixel(x, y)[0]);
        let local = i32::from(mean.get_pixel(x, y)[0]);
        if value <= local - offset {
            Luma([FLAGGED])
        } else {
            Luma([0])
        }
    })
}

/// Morphological opening with a 3x3 square structuring element.
#[must_use]
pub fn remove_speckles(binary: &GrayImage) -> GrayImage {
    open(binary, Norm::LInf, 1)
}

/// Fraction of non-zero pixels in a mask, in `[0, 1]`.
#[must_use]
pub fn mask_coverage(mask: &GrayImage) -> f32 {
    let total = u64::from(mask.width()) * u64::from(mask.height());
    if total == 0 {
        return 0.0;
    }
    let flagged = mask.pixels().filter(|p| p[0] > 0).count() as u64;
    #[allow(clippy::cast_precision_loss)]
    let coverage = flagged as f32 / total as f32;
    coverage
}

/// Estimate the watermark footprint of `image`.
///
/// Returns a binary mask (0 or [`FLAGGED`]) with the image's dimensions.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an invalid config and
/// [`Error::ProcessingFailure`] for a zero-sized image.
pub fn detect_watermark_mask(image: &DynamicImage, config: &ProcessingConfig) -> Result<GrayImage> {
    config.validate()?;
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::ProcessingFailure(format!(
            "cannot detect a watermark in a {}x{} image",
            image.width(),
            image.height()
        )));
    }

    let gray = to_grayscale(image);
    let binary = adaptive_threshold_inv(&gray, config.detector_block_size, config.detector_offset);
    let mask = remove_speckles(&binary);

    debug!(
        width = mask.width(),
        height = mask.height(),
        coverage = mask_coverage(&mask),
        "heuristic watermark mask"
    );
    Ok(mask)
}
