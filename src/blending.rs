//! Alpha compositing of a watermark layer over a source image.
//!
//! The layer is blended per channel with
//! `out = src * (1 - a_wm) + wm * a_wm` and alpha `a_src + a_wm * (1 - a_src)`.
//! The removal mask is the layer's alpha channel as 8-bit grayscale.

use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};

use crate::error::{Error, Result};

/// Output of [`composite`]: the watermarked image and its removal mask.
#[derive(Debug, Clone)]
pub struct Composited {
    /// Watermarked image in the source's channel layout.
    pub image: DynamicImage,
    /// Single-channel mask, same dimensions as `image`. 0 = untouched.
    pub mask: GrayImage,
}

/// Porter-Duff "over" for two straight-alpha pixels.
///
/// A fully transparent `src` leaves `dst` bit-identical.
pub(crate) fn over(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    if src[3] == 0 {
        return dst;
    }
    if src[3] == 255 || dst[3] == 0 {
        return src;
    }
    let sa = f32::from(src[3]) / 255.0;
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);

    let channel = |s: u8, d: u8| -> u8 {
        let v = (f32::from(s) * sa + f32::from(d) * da * (1.0 - sa)) / out_a;
        to_u8(v)
    };

    Rgba([
        channel(src[0], dst[0]),
        channel(src[1], dst[1]),
        channel(src[2], dst[2]),
        to_u8(out_a * 255.0),
    ])
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert any input to the 8-bit RGBA working form.
#[must_use]
pub fn to_working_rgba(image: &DynamicImage) -> RgbaImage {
    image.to_rgba8()
}

/// Convert an RGBA working buffer back to the channel layout of `like`.
///
/// 8-bit gray, gray+alpha, RGB and RGBA layouts round-trip; anything else
/// (16-bit, float) comes back as 8-bit RGB or RGBA depending on alpha.
#[must_use]
pub fn restore_layout(rgba: RgbaImage, like: &DynamicImage) -> DynamicImage {
    let working = DynamicImage::ImageRgba8(rgba);
    match like {
        DynamicImage::ImageRgba8(_) => working,
        DynamicImage::ImageRgb8(_) => DynamicImage::ImageRgb8(working.to_rgb8()),
        DynamicImage::ImageLuma8(_) => DynamicImage::ImageLuma8(working.to_luma8()),
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLumaA8(working.to_luma_alpha8()),
        other if other.color().has_alpha() => working,
        _ => DynamicImage::ImageRgb8(working.to_rgb8()),
    }
}

/// Extract the removal mask: the layer's alpha channel as grayscale.
#[must_use]
pub fn removal_mask(layer: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(layer.width(), layer.height(), |x, y| {
        Luma([layer.get_pixel(x, y)[3]])
    })
}

/// Blend a watermark layer over `source`.
///
/// `source` is not modified; a new image in its channel layout is returned
/// together with the removal mask.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the layer and source differ in size.
pub fn composite(source: &DynamicImage, layer: &RgbaImage) -> Result<Composited> {
    let dims = (source.width(), source.height());
    if layer.dimensions() != dims {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: layer.dimensions(),
        });
    }

    let mut out = to_working_rgba(source);
    for (px, wm) in out.pixels_mut().zip(layer.pixels()) {
        if wm[3] == 0 {
            continue;
        }
        let a_wm = f32::from(wm[3]) / 255.0;
        let a_src = f32::from(px[3]) / 255.0;
        for ch in 0..3 {
            let blended = f32::from(px[ch]) * (1.0 - a_wm) + f32::from(wm[ch]) * a_wm;
            px[ch] = to_u8(blended);
        }
        px[3] = to_u8((a_src + a_wm * (1.0 - a_src)) * 255.0);
    }

    Ok(Composited {
        image: restore_layout(out, source),
        mask: removal_mask(layer),
    })
}
