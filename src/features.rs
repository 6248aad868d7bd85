//! Compact descriptors of watermark masks.
//!
//! A [`FeatureVector`] holds the mask's 256-bin intensity histogram, the
//! number and total area of its external contours and the polygon moments of
//! the largest contour. It serializes to the JSON record shape
//! `{histogram, num_contours, total_area, moments}`.

use std::collections::BTreeMap;

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::stats::histogram;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of histogram buckets.
pub const HISTOGRAM_BINS: usize = 256;

/// Names of the moments recorded for the dominant contour, in output order.
pub const MOMENT_NAMES: [&str; 24] = [
    "m00", "m10", "m01", "m20", "m11", "m02", "m30", "m21", "m12", "m03", "mu20", "mu11", "mu02",
    "mu30", "mu21", "mu12", "mu03", "nu20", "nu11", "nu02", "nu30", "nu21", "nu12", "nu03",
];

/// Descriptor of a single mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Intensity histogram, [`HISTOGRAM_BINS`] buckets.
    pub histogram: Vec<u32>,
    /// Number of external contours.
    pub num_contours: usize,
    /// Sum of the areas enclosed by the external contours.
    pub total_area: f64,
    /// Moments of the largest contour; empty when there are no contours.
    pub moments: BTreeMap<String, f64>,
}

impl FeatureVector {
    /// Check the shape of a vector obtained from outside the crate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a histogram that is not
    /// [`HISTOGRAM_BINS`] long or a negative or non-finite area.
    pub fn validate(&self) -> Result<()> {
        if self.histogram.len() != HISTOGRAM_BINS {
            return Err(Error::InvalidInput(format!(
                "histogram has {} buckets, expected {HISTOGRAM_BINS}",
                self.histogram.len()
            )));
        }
        if !self.total_area.is_finite() || self.total_area < 0.0 {
            return Err(Error::InvalidInput(format!(
                "total area {} must be a non-negative number",
                self.total_area
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON and
    /// [`Error::InvalidInput`] if [`FeatureVector::validate`] fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let features: Self = serde_json::from_str(json)?;
        features.validate()?;
        Ok(features)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if a moment is not representable.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Raw and derived moments of a closed polygon.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PolygonMoments {
    m: [f64; 10],
}

impl PolygonMoments {
    /// Green's-theorem moments of the polygon through `points`.
    fn of(points: &[(f64, f64)]) -> Self {
        const SCALE: [f64; 10] = [2.0, 6.0, 6.0, 12.0, 24.0, 12.0, 20.0, 60.0, 60.0, 20.0];

        let mut m = [0.0f64; 10];
        let n = points.len();
        for i in 0..n {
            let (xi, yi) = points[i];
            let (xj, yj) = points[(i + 1) % n];
            let a = xi * yj - xj * yi;
            let (xi2, xj2, yi2, yj2) = (xi * xi, xj * xj, yi * yi, yj * yj);

            m[0] += a;
            m[1] += a * (xi + xj);
            m[2] += a * (yi + yj);
            m[3] += a * (xi2 + xi * xj + xj2);
            m[4] += a * (xi * (2.0 * yi + yj) + xj * (yi + 2.0 * yj));
            m[5] += a * (yi2 + yi * yj + yj2);
            m[6] += a * (xi + xj) * (xi2 + xj2);
            m[7] += a * (xi2 * (3.0 * yi + yj) + 2.0 * xi * xj * (yi + yj) + xj2 * (yi + 3.0 * yj));
            m[8] += a * (yi2 * (3.0 * xi + xj) + 2.0 * yi * yj * (xi + xj) + yj2 * (xi + 3.0 * xj));
            m[9] += a * (yi + yj) * (yi2 + yj2);
        }

        for (v, s) in m.iter_mut().zip(SCALE) {
            *v /= s;
        }
        // orientation of the trace decides the sign
        if m[0] < 0.0 {
            for v in &mut m {
                *v = -*v;
            }
        }
        Self { m }
    }

    fn area(&self) -> f64 {
        self.m[0]
    }

    fn into_map(self) -> BTreeMap<String, f64> {
        let [m00, m10, m01, m20, m11, m02, m30, m21, m12, m03] = self.m;

        let mut central = [0.0f64; 7];
        let mut normalized = [0.0f64; 7];
        if m00.abs() > f64::EPSILON {
            let cx = m10 / m00;
            let cy = m01 / m00;
            let mu20 = m20 - cx * m10;
            let mu11 = m11 - cx * m01;
            let mu02 = m02 - cy * m01;
            let mu30 = m30 - cx * (3.0 * mu20 + cx * m10);
            let mu21 = m21 - cx * (2.0 * mu11 + cx * m01) - cy * mu20;
            let mu12 = m12 - cy * (2.0 * mu11 + cy * m10) - cx * mu02;
            let mu03 = m03 - cy * (3.0 * mu02 + cy * m01);
            central = [mu20, mu11, mu02, mu30, mu21, mu12, mu03];

            let s2 = 1.0 / (m00 * m00);
            let s3 = s2 / m00.sqrt();
            normalized = [
                mu20 * s2,
                mu11 * s2,
                mu02 * s2,
                mu30 * s3,
                mu21 * s3,
                mu12 * s3,
                mu03 * s3,
            ];
        }

        MOMENT_NAMES
            .iter()
            .zip(self.m.iter().chain(&central).chain(&normalized))
            .map(|(name, v)| ((*name).to_owned(), *v))
            .collect()
    }
}

/// Copy `mask` into a buffer with a one-pixel background frame.
///
/// `find_contours` reports blobs touching the image edge as holes, so tracing
/// always runs on the framed copy.
fn framed(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w + 2, h + 2);
    image::imageops::replace(&mut out, mask, 1, 1);
    out
}

/// Contour points of a framed mask, moved back to mask coordinates.
fn polygon(contour: &Contour<i32>) -> Vec<(f64, f64)> {
    contour
        .points
        .iter()
        .map(|p| (f64::from(p.x - 1), f64::from(p.y - 1)))
        .collect()
}

/// Compute the descriptor of `mask`. Any non-zero pixel counts as foreground.
///
/// Deterministic: the same mask always yields an identical vector.
#[must_use]
pub fn extract_features(mask: &GrayImage) -> FeatureVector {
    let hist = histogram(mask);
    let buckets = hist.channels.first().map_or_else(|| vec![0; HISTOGRAM_BINS], |c| c.to_vec());

    let external: Vec<PolygonMoments> = find_contours::<i32>(&framed(mask))
        .iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| PolygonMoments::of(&polygon(c)))
        .collect();

    let total_area = external.iter().map(PolygonMoments::area).fold(0.0_f64, |acc, a| acc + a);

    // first of equal areas wins
    let largest = external.iter().fold(None::<&PolygonMoments>, |best, m| match best {
        Some(b) if b.area() >= m.area() => Some(b),
        _ => Some(m),
    });

    tracing::debug!(
        contours = external.len(),
        total_area,
        "extracted mask features"
    );

    FeatureVector {
        histogram: buckets,
        num_contours: external.len(),
        total_area,
        moments: largest.map(|m| m.into_map()).unwrap_or_default(),
    }
}
