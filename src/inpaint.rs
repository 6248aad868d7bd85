//! Watermark removal by fast-marching inpainting.
//!
//! Pixels selected by the mask are reconstructed from their surroundings with
//! Telea's method: a front advances inward from the known boundary in order of
//! arrival time `T`, and each newly reached pixel becomes a weighted average of
//! already-known pixels within the configured radius. Weights favour
//! neighbours that are close, lie along the front normal and sit on a similar
//! level set.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use tracing::{debug, warn};

use crate::blending::{restore_layout, to_working_rgba};
use crate::config::ProcessingConfig;
use crate::detection::detect_watermark_mask;
use crate::error::{Error, Result};

const UNREACHED: f32 = 1.0e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Known,
    Band,
    Inside,
}

/// Min-heap entry ordered by arrival time, then pixel index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Front {
    t: f32,
    idx: usize,
}

impl Eq for Front {}

impl Ord for Front {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .t
            .total_cmp(&self.t)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for Front {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Field {
    width: usize,
    height: usize,
    t: Vec<f32>,
    flag: Vec<Flag>,
}

impl Field {
    fn neighbours(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        let (x, y) = (idx % self.width, idx / self.width);
        let w = self.width;
        [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < self.height).then(|| idx + w),
        ]
        .into_iter()
        .flatten()
    }

    fn known(&self, idx: usize) -> bool {
        self.flag[idx] == Flag::Known
    }

    /// Upwind solution of `|grad T| = 1` from two orthogonal neighbours.
    fn solve(&self, a: Option<usize>, b: Option<usize>) -> f32 {
        let ta = a.filter(|&i| self.known(i)).map(|i| self.t[i]);
        let tb = b.filter(|&i| self.known(i)).map(|i| self.t[i]);
        match (ta, tb) {
            (Some(t1), Some(t2)) => {
                let disc = 2.0 - (t1 - t2) * (t1 - t2);
                if disc < 0.0 {
                    return 1.0 + t1.min(t2);
                }
                let r = disc.sqrt();
                let s = (t1 + t2 - r) / 2.0;
                if s >= t1 && s >= t2 {
                    s
                } else {
                    (t1 + t2 + r) / 2.0
                }
            }
            (Some(t), None) | (None, Some(t)) => 1.0 + t,
            (None, None) => UNREACHED,
        }
    }

    fn arrival_time(&self, idx: usize) -> f32 {
        let (x, y) = (idx % self.width, idx / self.width);
        let w = self.width;
        let left = (x > 0).then(|| idx - 1);
        let right = (x + 1 < w).then(|| idx + 1);
        let up = (y > 0).then(|| idx - w);
        let down = (y + 1 < self.height).then(|| idx + w);
        self.solve(left, up)
            .min(self.solve(right, up))
            .min(self.solve(left, down))
            .min(self.solve(right, down))
    }

    /// Central difference of `T` along one axis using only non-inside samples.
    fn gradient_component(&self, idx: usize, prev: Option<usize>, next: Option<usize>) -> f32 {
        let usable = |i: Option<usize>| i.filter(|&i| self.flag[i] != Flag::Inside);
        match (usable(prev), usable(next)) {
            (Some(p), Some(n)) => (self.t[n] - self.t[p]) / 2.0,
            (None, Some(n)) => self.t[n] - self.t[idx],
            (Some(p), None) => self.t[idx] - self.t[p],
            (None, None) => 0.0,
        }
    }

    fn gradient(&self, idx: usize) -> (f32, f32) {
        let (x, y) = (idx % self.width, idx / self.width);
        let w = self.width;
        let gx = self.gradient_component(
            idx,
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
        );
        let gy = self.gradient_component(
            idx,
            (y > 0).then(|| idx - w),
            (y + 1 < self.height).then(|| idx + w),
        );
        (gx, gy)
    }
}

/// Binary fill region derived from a removal mask.
///
/// The mask is inverted (`255 - m`), thresholded at `threshold` and inverted
/// back, so a pixel is filled when `255 - m <= threshold`. With the default
/// threshold of 254 that is every pixel the watermark touched.
#[must_use]
pub fn fill_region(mask: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let inverted = 255 - mask.get_pixel(x, y)[0];
        if inverted <= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Fill every non-zero pixel of `region` from its surroundings.
///
/// Pixels outside the region are returned unchanged. When the region covers
/// the whole image there is nothing to propagate from and the input comes back
/// as-is.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if `region` and `image` differ in size
/// and [`Error::InvalidInput`] for a zero radius.
pub fn inpaint_telea(image: &RgbaImage, region: &GrayImage, radius: u32) -> Result<RgbaImage> {
    if region.dimensions() != image.dimensions() {
        return Err(Error::DimensionMismatch {
            expected: image.dimensions(),
            actual: region.dimensions(),
        });
    }
    if radius == 0 {
        return Err(Error::InvalidInput("inpaint radius must be positive".into()));
    }

    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut field = Field {
        width,
        height,
        t: vec![0.0; width * height],
        flag: vec![Flag::Known; width * height],
    };
    for (idx, px) in region.pixels().enumerate() {
        if px[0] > 0 {
            field.flag[idx] = Flag::Inside;
            field.t[idx] = UNREACHED;
        }
    }

    let inside = field.flag.iter().filter(|&&f| f == Flag::Inside).count();
    if inside == 0 {
        return Ok(image.clone());
    }
    if inside == field.flag.len() {
        warn!("inpaint region covers the whole image; returning input unchanged");
        return Ok(image.clone());
    }

    let mut heap = BinaryHeap::new();
    for idx in 0..field.flag.len() {
        if field.known(idx)
            && field
                .neighbours(idx)
                .any(|n| field.flag[n] == Flag::Inside)
        {
            field.flag[idx] = Flag::Band;
            heap.push(Front { t: 0.0, idx });
        }
    }

    let mut pixels: Vec<[f32; 4]> = image
        .pixels()
        .map(|p| [p[0], p[1], p[2], p[3]].map(f32::from))
        .collect();

    let r = i64::from(radius);
    let mut filled = 0usize;

    while let Some(Front { t, idx }) = heap.pop() {
        if field.known(idx) || t > field.t[idx] {
            continue;
        }
        field.flag[idx] = Flag::Known;

        let neighbours: Vec<usize> = field.neighbours(idx).collect();
        for n in neighbours {
            if field.known(n) {
                continue;
            }
            let first_visit = field.flag[n] == Flag::Inside;
            if first_visit {
                field.flag[n] = Flag::Band;
            }
            let arrival = field.arrival_time(n);
            if arrival < field.t[n] {
                field.t[n] = arrival;
            }
            if first_visit {
                if let Some(color) = estimate(&field, &pixels, n, r) {
                    pixels[n] = color;
                }
                filled += 1;
            }
            heap.push(Front { t: field.t[n], idx: n });
        }
    }

    debug!(filled, radius, "inpainted region");

    let mut out = image.clone();
    for (px, value) in out.pixels_mut().zip(pixels) {
        *px = Rgba(value.map(to_u8));
    }
    Ok(out)
}

/// Weighted average of known pixels within `radius` of `idx`.
#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn estimate(field: &Field, pixels: &[[f32; 4]], idx: usize, radius: i64) -> Option<[f32; 4]> {
    let x = (idx % field.width) as i64;
    let y = (idx / field.width) as i64;
    let (gx, gy) = field.gradient(idx);
    let t_here = field.t[idx];

    let mut acc = [0.0f32; 4];
    let mut total = 0.0f32;
    for ny in (y - radius).max(0)..=(y + radius).min(field.height as i64 - 1) {
        for nx in (x - radius).max(0)..=(x + radius).min(field.width as i64 - 1) {
            let (dx, dy) = (x - nx, y - ny);
            let dist2 = dx * dx + dy * dy;
            if dist2 == 0 || dist2 > radius * radius {
                continue;
            }
            let k = ny as usize * field.width + nx as usize;
            if field.flag[k] == Flag::Inside {
                continue;
            }
            let (rx, ry) = (dx as f32, dy as f32);
            let len = (dist2 as f32).sqrt();
            let direction = ((rx * gx + ry * gy) / len).abs().max(1.0e-6);
            let distance = 1.0 / dist2 as f32;
            let level = 1.0 / (1.0 + (field.t[k] - t_here).abs());
            let weight = direction * distance * level;

            for (a, v) in acc.iter_mut().zip(pixels[k]) {
                *a += weight * v;
            }
            total += weight;
        }
    }

    (total > 0.0).then(|| acc.map(|a| a / total))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Bring a mask to the image's dimensions, resizing bilinearly when needed.
fn conform_mask(mask: &GrayImage, width: u32, height: u32) -> Result<GrayImage> {
    if mask.width() == 0 || mask.height() == 0 {
        return Err(Error::DimensionMismatch {
            expected: (width, height),
            actual: mask.dimensions(),
        });
    }
    if mask.dimensions() == (width, height) {
        return Ok(mask.clone());
    }
    debug!(
        from_w = mask.width(),
        from_h = mask.height(),
        to_w = width,
        to_h = height,
        "resizing removal mask"
    );
    Ok(imageops::resize(mask, width, height, FilterType::Triangle))
}

/// Pixels to reconstruct in `image`.
///
/// With a mask, the [`fill_region`] of the mask after resizing it to the
/// image when sizes differ. Without one, the heuristic detector's output.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an invalid config,
/// [`Error::ProcessingFailure`] for a zero-sized image and
/// [`Error::DimensionMismatch`] for a zero-sized mask.
pub fn removal_region(
    image: &DynamicImage,
    mask: Option<&GrayImage>,
    config: &ProcessingConfig,
) -> Result<GrayImage> {
    config.validate()?;
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(Error::ProcessingFailure(format!(
            "cannot remove a watermark from a {width}x{height} image"
        )));
    }

    match mask {
        Some(mask) => {
            let mask = conform_mask(mask, width, height)?;
            Ok(fill_region(&mask, config.mask_threshold))
        }
        None => {
            debug!("no mask supplied, using heuristic detector");
            detect_watermark_mask(image, config)
        }
    }
}

/// Inpaint the non-zero pixels of `region` and return the result in the
/// channel layout of `image`. An empty region returns a copy of `image`.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if `region` and `image` differ in size
/// and [`Error::InvalidInput`] for an invalid config.
pub fn reconstruct(
    image: &DynamicImage,
    region: &GrayImage,
    config: &ProcessingConfig,
) -> Result<DynamicImage> {
    if region.pixels().all(|p| p[0] == 0) {
        let expected = (image.width(), image.height());
        if region.dimensions() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: region.dimensions(),
            });
        }
        debug!("empty fill region, image unchanged");
        return Ok(image.clone());
    }

    let working = to_working_rgba(image);
    let filled = inpaint_telea(&working, region, config.inpaint_radius)?;
    Ok(restore_layout(filled, image))
}

/// Remove a watermark from `image`.
///
/// Combines [`removal_region`] and [`reconstruct`]: with a mask every pixel
/// the watermark touched is inpainted, without one the heuristic detector
/// supplies the region. Pixels outside the region keep their values.
///
/// # Errors
///
/// See [`removal_region`].
pub fn remove_watermark(
    image: &DynamicImage,
    mask: Option<&GrayImage>,
    config: &ProcessingConfig,
) -> Result<DynamicImage> {
    let region = removal_region(image, mask, config)?;
    reconstruct(image, &region, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn square_region(w: u32, h: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let inside = (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    #[test]
    fn fill_region_selects_touched_pixels() {
        let mut mask = GrayImage::new(4, 1);
        mask.put_pixel(1, 0, Luma([1]));
        mask.put_pixel(2, 0, Luma([127]));
        mask.put_pixel(3, 0, Luma([255]));
        let region = fill_region(&mask, 254);
        let values: Vec<u8> = region.pixels().map(|p| p[0]).collect();
        assert_eq!(values, vec![0, 255, 255, 255]);
    }

    #[test]
    fn fill_region_threshold_is_inclusive() {
        let mask = GrayImage::from_pixel(1, 1, Luma([100]));
        // 255 - 100 = 155
        assert_eq!(fill_region(&mask, 155).get_pixel(0, 0)[0], 255);
        assert_eq!(fill_region(&mask, 154).get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn flat_color_is_restored_exactly() {
        let mut img = RgbaImage::from_pixel(30, 30, Rgba([90, 140, 200, 255]));
        for y in 10..18 {
            for x in 10..18 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let region = square_region(30, 30, 10, 10, 8);
        let out = inpaint_telea(&img, &region, 5).unwrap();
        assert!(out.pixels().all(|p| *p == Rgba([90, 140, 200, 255])));
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn pixels_outside_region_untouched() {
        let img = RgbaImage::from_fn(20, 20, |x, y| Rgba([(x * 12) as u8, (y * 12) as u8, 50, 255]));
        let region = square_region(20, 20, 5, 5, 4);
        let out = inpaint_telea(&img, &region, 3).unwrap();
        for (x, y, px) in out.enumerate_pixels() {
            if region.get_pixel(x, y)[0] == 0 {
                assert_eq!(px, img.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn fill_stays_within_neighbour_range() {
        // left half 40, right half 200; fill a band straddling the edge
        let img = RgbaImage::from_fn(24, 24, |x, _| {
            if x < 12 {
                Rgba([40, 40, 40, 255])
            } else {
                Rgba([200, 200, 200, 255])
            }
        });
        let region = square_region(24, 24, 9, 9, 6);
        let out = inpaint_telea(&img, &region, 5).unwrap();
        for y in 9..15 {
            for x in 9..15 {
                let v = out.get_pixel(x, y)[0];
                assert!((40..=200).contains(&v), "({x},{y}) = {v}");
            }
        }
        assert!(out.get_pixel(9, 12)[0] < out.get_pixel(14, 12)[0]);
    }

    #[test]
    fn whole_image_region_returns_input() {
        let img = RgbaImage::from_pixel(5, 5, Rgba([1, 2, 3, 255]));
        let region = GrayImage::from_pixel(5, 5, Luma([255]));
        assert_eq!(inpaint_telea(&img, &region, 5).unwrap(), img);
    }

    #[test]
    fn mismatched_region_is_rejected() {
        let img = RgbaImage::new(5, 5);
        let region = GrayImage::new(5, 6);
        assert!(matches!(
            inpaint_telea(&img, &region, 5),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn remove_with_zero_mask_is_identity() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(16, 16, |x, y| {
            Rgb([(x * 9) as u8, (y * 9) as u8, 7])
        }));
        let mask = GrayImage::new(16, 16);
        let out = remove_watermark(&img, Some(&mask), &ProcessingConfig::default()).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn reconstruct_checks_region_size_even_when_empty() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 6));
        let config = ProcessingConfig::default();
        let same = reconstruct(&img, &GrayImage::new(8, 6), &config).unwrap();
        assert_eq!(same, img);
        let err = reconstruct(&img, &GrayImage::new(6, 8), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: (8, 6),
                actual: (6, 8)
            }
        ));
    }

    #[test]
    fn remove_resizes_mask() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([10, 20, 30])));
        let mask = square_region(20, 20, 5, 5, 6);
        let out = remove_watermark(&img, Some(&mask), &ProcessingConfig::default()).unwrap();
        assert_eq!(out.width(), 40);
        assert_eq!(out.height(), 40);
        assert!(out.to_rgb8().pixels().all(|p| *p == Rgb([10, 20, 30])));
    }

    #[test]
    fn remove_rejects_empty_mask() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let mask = GrayImage::new(0, 0);
        let err = remove_watermark(&img, Some(&mask), &ProcessingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn remove_preserves_layout() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(12, 12, Luma([60])));
        let mask = square_region(12, 12, 4, 4, 3);
        let out = remove_watermark(&img, Some(&mask), &ProcessingConfig::default()).unwrap();
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn remove_without_mask_leaves_smooth_image() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([180, 170, 160])));
        let out = remove_watermark(&img, None, &ProcessingConfig::default()).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn heap_pops_smallest_time_first() {
        let mut heap = BinaryHeap::new();
        heap.push(Front { t: 2.0, idx: 0 });
        heap.push(Front { t: 0.5, idx: 3 });
        heap.push(Front { t: 0.5, idx: 1 });
        assert_eq!(heap.pop().map(|f| f.idx), Some(1));
        assert_eq!(heap.pop().map(|f| f.idx), Some(3));
        assert_eq!(heap.pop().map(|f| f.idx), Some(0));
    }
}
