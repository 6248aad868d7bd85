//! Watermark parameters and processing configuration.
//!
//! Nothing in the crate reads process-wide state: every tunable lives in a
//! [`ProcessingConfig`] value handed to each call.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default font-size factor: `floor(max(w, h) / 100 * 3.5)`.
pub const DEFAULT_FONT_SIZE_FACTOR: f32 = 3.5;

/// What to stamp onto an image and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkParams {
    /// Watermark text, must contain something besides whitespace.
    pub text: String,
    /// Opacity in `[0, 1]`; scaled to `0..=255` when rendering.
    pub opacity: f32,
    /// Rotation in degrees, counter-clockwise. Any finite value.
    pub angle: f32,
    /// Explicit font size in pixels. Derived from the canvas when `None`.
    pub font_size: Option<u32>,
}

impl Default for WatermarkParams {
    fn default() -> Self {
        Self {
            text: String::new(),
            opacity: 0.5,
            angle: 30.0,
            font_size: None,
        }
    }
}

impl WatermarkParams {
    /// Convenience constructor with default opacity (0.5) and angle (30°).
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Check parameters before any buffer is allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for blank text, opacity outside `[0, 1]`,
    /// a non-finite angle, or a zero font size.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidInput("watermark text is empty".into()));
        }
        if !self.opacity.is_finite() || !(0.0..=1.0).contains(&self.opacity) {
            return Err(Error::InvalidInput(format!(
                "opacity {} outside [0, 1]",
                self.opacity
            )));
        }
        if !self.angle.is_finite() {
            return Err(Error::InvalidInput(format!(
                "angle {} is not finite",
                self.angle
            )));
        }
        if self.font_size == Some(0) {
            return Err(Error::InvalidInput("font size must be positive".into()));
        }
        Ok(())
    }

    /// Opacity scaled to an 8-bit alpha value.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn alpha(&self) -> u8 {
        (self.opacity.clamp(0.0, 1.0) * 255.0) as u8
    }

    /// Angle normalised into `[0, 360)`.
    #[must_use]
    pub fn normalized_angle(&self) -> f32 {
        let a = self.angle.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        if a >= 360.0 {
            0.0
        } else {
            a
        }
    }

    /// Font size to render with on a `width` x `height` canvas.
    #[must_use]
    pub fn resolved_font_size(&self, width: u32, height: u32, factor: f32) -> u32 {
        self.font_size
            .unwrap_or_else(|| derive_font_size(width, height, factor))
    }
}

/// Derive a font size from canvas dimensions: `floor(max(w, h) / 100 * factor)`, at least 1.
///
/// The default factor is evaluated in integer arithmetic so that e.g. 800 px
/// yields exactly 28 with no float rounding noise.
#[must_use]
#[allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn derive_font_size(width: u32, height: u32, factor: f32) -> u32 {
    let longest = u64::from(width.max(height));
    let size = if factor == DEFAULT_FONT_SIZE_FACTOR {
        longest * 35 / 1000
    } else {
        (longest as f64 / 100.0 * f64::from(factor)).floor() as u64
    };
    u32::try_from(size).unwrap_or(u32::MAX).max(1)
}

/// Tunables for detection, removal and matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Side of the square neighbourhood used by the detector's local mean (odd).
    pub detector_block_size: u32,
    /// Constant subtracted from the local mean before comparison.
    pub detector_offset: i32,
    /// Binarization threshold applied to the inverted removal mask.
    pub mask_threshold: u8,
    /// Inpainting neighbourhood radius in pixels.
    pub inpaint_radius: u32,
    /// Default threshold for similarity matching.
    pub similarity_threshold: f64,
    /// Factor used to derive the font size when none is given.
    pub font_size_factor: f32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            detector_block_size: 11,
            detector_offset: 2,
            mask_threshold: 254,
            inpaint_radius: 5,
            similarity_threshold: 0.9,
            font_size_factor: DEFAULT_FONT_SIZE_FACTOR,
        }
    }
}

impl ProcessingConfig {
    /// Check that every tunable is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an even or too-small detector block,
    /// a zero inpaint radius, a similarity threshold outside `[0, 1]`, or a
    /// non-positive font-size factor.
    pub fn validate(&self) -> Result<()> {
        if self.detector_block_size < 3 || self.detector_block_size % 2 == 0 {
            return Err(Error::InvalidInput(format!(
                "detector block size {} must be odd and at least 3",
                self.detector_block_size
            )));
        }
        if self.inpaint_radius == 0 {
            return Err(Error::InvalidInput("inpaint radius must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::InvalidInput(format!(
                "similarity threshold {} outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if !self.font_size_factor.is_finite() || self.font_size_factor <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "font size factor {} must be positive",
                self.font_size_factor
            )));
        }
        Ok(())
    }
}
