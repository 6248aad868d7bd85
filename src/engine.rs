//! High-level engine and file surface.

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, ImageFormat};
use tracing::{debug, info, warn};

use crate::blending::{self, Composited};
use crate::comparison::{comparison_image, removal_comparison};
use crate::config::{ProcessingConfig, WatermarkParams};
use crate::detection::{detect_watermark_mask, mask_coverage};
use crate::error::{Error, Result};
use crate::features::{extract_features, FeatureVector};
use crate::font::WatermarkFont;
use crate::inpaint;
use crate::similarity::{ImageRef, MaskStore, SimilarityMatch};
use crate::synthesis::synthesize_layer;

const FEATURES_SUFFIX: &str = ".features.json";
const MASK_PREFIX: &str = "mask_";
const COMPARISON_SUFFIX: &str = "_comparison";

/// Everything produced by one embed call.
#[derive(Debug, Clone)]
pub struct EmbedResult {
    /// Watermarked image, same layout as the input.
    pub image: DynamicImage,
    /// Removal mask, same dimensions as the input.
    pub mask: GrayImage,
    /// Descriptor of `mask`.
    pub features: FeatureVector,
}

/// Where `remove` gets its mask from.
#[derive(Debug, Clone, Default)]
pub enum MaskSource {
    /// Run the heuristic detector.
    #[default]
    Detect,
    /// Load this mask file for every image.
    File(PathBuf),
    /// Use `mask_<stem>.png` next to each image, falling back to the detector.
    Sidecar,
}

/// What [`WatermarkEngine::process_file`] does to each image.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Stamp a tiled text watermark.
    Embed(WatermarkParams),
    /// Reconstruct the watermarked pixels.
    Remove(MaskSource),
}

/// Options controlling file processing.
#[derive(Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ProcessOptions {
    /// Embed: write the removal mask as `mask_<stem>.png` next to the output.
    pub write_mask: bool,
    /// Embed: write `<stem>.features.json` next to the output.
    pub write_features: bool,
    /// Write a `<stem>_comparison.png` preview next to the output.
    pub comparison: bool,
    /// Enable verbose reporting.
    pub verbose: bool,
    /// Suppress non-error output.
    pub quiet: bool,
}

/// Result of processing a single image file.
#[derive(Debug)]
pub struct ProcessResult {
    /// Path of the processed file.
    pub path: PathBuf,
    /// Where the output was written, if anywhere.
    pub output: Option<PathBuf>,
    /// Whether processing succeeded.
    pub success: bool,
    /// Whether the file was skipped (detector found nothing to remove).
    pub skipped: bool,
    /// Fraction of pixels covered by the watermark mask or fill region.
    pub coverage: f32,
    /// Human-readable status message.
    pub message: String,
}

impl ProcessResult {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            output: None,
            success: false,
            skipped: false,
            coverage: 0.0,
            message: String::new(),
        }
    }

    fn failed(path: &Path, message: String) -> Self {
        Self {
            message,
            ..Self::new(path)
        }
    }
}

/// Watermark engine holding the font and processing configuration.
///
/// Create once and reuse; every call is independent and shares no mutable state.
#[derive(Debug, Clone, Default)]
pub struct WatermarkEngine {
    font: WatermarkFont,
    config: ProcessingConfig,
}

impl WatermarkEngine {
    /// Engine with the builtin font and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid.
    pub fn with_config(config: ProcessingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            font: WatermarkFont::default(),
            config,
        })
    }

    /// Replace the font used for watermark text.
    #[must_use]
    pub fn with_font(mut self, font: WatermarkFont) -> Self {
        self.font = font;
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Stamp `params` onto `image`.
    ///
    /// All-or-nothing: on error nothing is returned and `image` is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid parameters and
    /// [`Error::ProcessingFailure`] for a zero-sized image.
    pub fn embed(&self, image: &DynamicImage, params: &WatermarkParams) -> Result<EmbedResult> {
        params.validate()?;
        let layer = synthesize_layer(
            params,
            image.width(),
            image.height(),
            &self.font,
            &self.config,
        )?;
        let Composited { image, mask } = blending::composite(image, &layer)?;
        let features = extract_features(&mask);
        debug!(
            contours = features.num_contours,
            coverage = mask_coverage(&mask),
            "embedded watermark"
        );
        Ok(EmbedResult {
            image,
            mask,
            features,
        })
    }

    /// Heuristic watermark mask for `image`.
    ///
    /// # Errors
    ///
    /// See [`detect_watermark_mask`].
    pub fn detect(&self, image: &DynamicImage) -> Result<GrayImage> {
        detect_watermark_mask(image, &self.config)
    }

    /// Remove a watermark, using `mask` when given and the detector otherwise.
    ///
    /// # Errors
    ///
    /// See [`inpaint::remove_watermark`].
    pub fn remove(&self, image: &DynamicImage, mask: Option<&GrayImage>) -> Result<DynamicImage> {
        inpaint::remove_watermark(image, mask, &self.config)
    }

    /// Descriptor of a mask.
    #[must_use]
    #[allow(clippy::unused_self)] // method on `self` for API consistency
    pub fn features(&self, mask: &GrayImage) -> FeatureVector {
        extract_features(mask)
    }

    /// Best stored match for `query` at `threshold`, or the configured
    /// default threshold when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a threshold outside `[0, 1]`.
    pub fn find_similar(
        &self,
        store: &MaskStore,
        query: &FeatureVector,
        threshold: Option<f64>,
    ) -> Result<Option<SimilarityMatch>> {
        store.find_similar_mask(query, threshold.unwrap_or(self.config.similarity_threshold))
    }

    /// Process a single image file: load, embed or remove, save.
    ///
    /// Returns a [`ProcessResult`] indicating success, skip, or failure.
    #[must_use]
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        op: &Operation,
        opts: &ProcessOptions,
    ) -> ProcessResult {
        let outcome = match op {
            Operation::Embed(params) => self.embed_file(input, output, params, opts),
            Operation::Remove(source) => self.remove_file(input, output, source, opts),
        };
        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(path = %input.display(), error = %e, "processing failed");
                ProcessResult::failed(input, e.to_string())
            }
        }
    }

    fn embed_file(
        &self,
        input: &Path,
        output: &Path,
        params: &WatermarkParams,
        opts: &ProcessOptions,
    ) -> Result<ProcessResult> {
        let original = image::open(input)?;
        let embedded = self.embed(&original, params)?;
        let features = opts
            .write_features
            .then(|| embedded.features.to_json())
            .transpose()?;
        let preview = opts
            .comparison
            .then(|| comparison_image(&original, &embedded.image, None))
            .transpose()?;

        ensure_parent(output)?;
        let mut written = Written::default();
        save_image(&embedded.image, &written.track(output))?;
        if opts.write_mask {
            embedded.mask.save(written.track(&mask_path(output)))?;
        }
        if let Some(json) = features {
            fs::write(written.track(&features_path(output)), json)?;
        }
        if let Some(preview) = preview {
            preview.save(written.track(&comparison_path(output)))?;
        }
        let files = written.commit();

        let mut result = ProcessResult::new(input);
        result.success = true;
        result.coverage = mask_coverage(&embedded.mask);
        result.output = Some(output.to_path_buf());
        result.message = describe("Watermark embedded", &files[1..]);
        info!(input = %input.display(), output = %output.display(), "watermark embedded");
        Ok(result)
    }

    fn remove_file(
        &self,
        input: &Path,
        output: &Path,
        source: &MaskSource,
        opts: &ProcessOptions,
    ) -> Result<ProcessResult> {
        let image = image::open(input)?;
        let mask = match source {
            MaskSource::Detect => None,
            MaskSource::File(path) => Some(image::open(path)?.to_luma8()),
            MaskSource::Sidecar => {
                let path = mask_path(input);
                if path.is_file() {
                    Some(image::open(&path)?.to_luma8())
                } else {
                    debug!(path = %path.display(), "no mask sidecar, using detector");
                    None
                }
            }
        };

        let region = inpaint::removal_region(&image, mask.as_ref(), &self.config)?;
        let mut result = ProcessResult::new(input);
        result.coverage = mask_coverage(&region);

        if mask.is_none() && region.pixels().all(|p| p[0] == 0) {
            result.skipped = true;
            result.success = true;
            result.message = "No watermark detected".to_string();
            return Ok(result);
        }

        let cleaned = inpaint::reconstruct(&image, &region, &self.config)?;
        let preview = opts
            .comparison
            .then(|| removal_comparison(&image, &cleaned))
            .transpose()?;

        ensure_parent(output)?;
        let mut written = Written::default();
        save_image(&cleaned, &written.track(output))?;
        if let Some(preview) = preview {
            preview.save(written.track(&comparison_path(output)))?;
        }
        let files = written.commit();

        result.success = true;
        result.output = Some(output.to_path_buf());
        result.message = describe("Watermark removed", &files[1..]);
        info!(input = %input.display(), output = %output.display(), "watermark removed");
        Ok(result)
    }

    /// Process all supported images in a directory.
    ///
    /// Masks, feature sidecars and comparison previews written by earlier
    /// runs are ignored. Uses parallel iteration when the `cli` feature is
    /// enabled (via rayon). Returns a [`ProcessResult`] for each image found.
    #[must_use]
    pub fn process_directory(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        op: &Operation,
        opts: &ProcessOptions,
    ) -> Vec<ProcessResult> {
        let mut entries: Vec<PathBuf> = match fs::read_dir(input_dir) {
            Ok(rd) => rd
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
                .map(|e| e.path())
                .filter(|p| is_supported_image(p) && !is_derived_artifact(p))
                .collect(),
            Err(e) => {
                return vec![ProcessResult::failed(
                    input_dir,
                    format!("Failed to read directory: {e}"),
                )];
            }
        };
        entries.sort();

        if let Err(e) = fs::create_dir_all(output_dir) {
            return vec![ProcessResult::failed(
                output_dir,
                format!("Failed to create output directory: {e}"),
            )];
        }

        let run = |input_path: &PathBuf| match input_path.file_name() {
            Some(name) => self.process_file(input_path, &output_dir.join(name), op, opts),
            None => ProcessResult::failed(input_path, "Path has no file name".to_string()),
        };

        #[cfg(feature = "cli")]
        {
            use rayon::prelude::*;
            entries.par_iter().map(run).collect()
        }

        #[cfg(not(feature = "cli"))]
        {
            entries.iter().map(run).collect()
        }
    }
}

/// Files written by one `process_file` call. Unless committed, they are
/// deleted again when the guard drops, so a failed call leaves no output.
#[derive(Default)]
struct Written(Vec<PathBuf>);

impl Written {
    fn track(&mut self, path: &Path) -> PathBuf {
        self.0.push(path.to_path_buf());
        path.to_path_buf()
    }

    fn commit(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Written {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "could not remove partial output");
            }
        }
    }
}

fn describe(action: &str, extras: &[PathBuf]) -> String {
    if extras.is_empty() {
        return action.to_string();
    }
    let names: Vec<String> = extras
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    format!("{action} (+ {})", names.join(", "))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Whether `path` names a mask or comparison preview written by this crate.
#[must_use]
pub fn is_derived_artifact(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    name.starts_with(MASK_PREFIX) || stem.ends_with(COMPARISON_SUFFIX)
}

/// Save an image with format-specific settings.
///
/// JPEG is written at quality 100 without alpha; GIF and WebP are written as RGBA.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for an unsupported extension and
/// [`Error::Io`] or [`Error::Image`] if writing fails.
pub fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path)
        .map_err(|e| Error::InvalidInput(format!("unsupported output format: {e}")))?;

    match format {
        ImageFormat::Jpeg => {
            let file = fs::File::create(path)?;
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(&DynamicImage::ImageRgb8(img.to_rgb8()))?;
        }
        ImageFormat::Png | ImageFormat::Bmp => {
            img.save(path)?;
        }
        ImageFormat::Gif | ImageFormat::WebP => {
            DynamicImage::ImageRgba8(img.to_rgba8()).save(path)?;
        }
        _ => {
            return Err(Error::InvalidInput(format!(
                "unsupported output format: {format:?}"
            )));
        }
    }

    Ok(())
}

fn sibling(path: &Path, name: String) -> PathBuf {
    path.parent().unwrap_or(Path::new("")).join(name)
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

/// Generate a default output path from an input path.
///
/// Example: `("photo.jpg", "cleaned")` becomes `"photo_cleaned.jpg"`.
#[must_use]
pub fn default_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = stem_of(input);
    let ext = input.extension().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}_{suffix}.{ext}"))
}

/// Mask file belonging to `image`: `mask_<stem>.png` in the same directory.
#[must_use]
pub fn mask_path(image: &Path) -> PathBuf {
    sibling(image, format!("{MASK_PREFIX}{}.png", stem_of(image)))
}

/// Feature sidecar belonging to `image`: `<stem>.features.json`.
#[must_use]
pub fn features_path(image: &Path) -> PathBuf {
    sibling(image, format!("{}{FEATURES_SUFFIX}", stem_of(image)))
}

/// Comparison preview belonging to `image`: `<stem>_comparison.png`.
#[must_use]
pub fn comparison_path(image: &Path) -> PathBuf {
    sibling(image, format!("{}{COMPARISON_SUFFIX}.png", stem_of(image)))
}

/// Load a feature sidecar.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read and
/// [`Error::Serialization`] or [`Error::InvalidInput`] if it is malformed.
pub fn load_features(path: &Path) -> Result<FeatureVector> {
    FeatureVector::from_json(&fs::read_to_string(path)?)
}

/// Build a [`MaskStore`] from the `<stem>.features.json` / `mask_<stem>.png`
/// pairs in `dir`. Sidecars without a mask are skipped.
///
/// Records are inserted in file-name order and keyed by `<stem>`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the directory cannot be read and the errors of
/// [`MaskStore::from_persisted`] for malformed records.
pub fn load_mask_store(dir: &Path) -> Result<MaskStore> {
    let mut sidecars: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(FEATURES_SUFFIX))
        })
        .collect();
    sidecars.sort();

    let mut records = Vec::with_capacity(sidecars.len());
    for sidecar in sidecars {
        let name = sidecar
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let stem = name.strip_suffix(FEATURES_SUFFIX).unwrap_or(name).to_string();
        let mask_file = dir.join(format!("{MASK_PREFIX}{stem}.png"));
        if !mask_file.is_file() {
            warn!(sidecar = %sidecar.display(), "no mask next to feature sidecar, skipping");
            continue;
        }
        let mask_bytes = fs::read(&mask_file)?;
        let json = fs::read_to_string(&sidecar)?;
        records.push((ImageRef(stem), mask_bytes, json));
    }

    MaskStore::from_persisted(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn flat(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 180, 160])))
    }

    #[test]
    fn default_output_path_appends_suffix() {
        let p = default_output_path(Path::new("/tmp/photo.jpg"), "cleaned");
        assert_eq!(p, PathBuf::from("/tmp/photo_cleaned.jpg"));

        let p = default_output_path(Path::new("image.png"), "watermarked");
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "image_watermarked.png"
        );
    }

    #[test]
    fn sidecar_paths() {
        let img = Path::new("/data/out/photo_watermarked.jpg");
        assert_eq!(
            mask_path(img),
            PathBuf::from("/data/out/mask_photo_watermarked.png")
        );
        assert_eq!(
            features_path(img),
            PathBuf::from("/data/out/photo_watermarked.features.json")
        );
        assert_eq!(
            comparison_path(img),
            PathBuf::from("/data/out/photo_watermarked_comparison.png")
        );
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        for name in ["a.jpg", "a.JPEG", "a.png", "a.gif", "a.webp", "a.bmp"] {
            assert!(is_supported_image(Path::new(name)), "{name}");
        }
    }

    #[test]
    fn is_supported_image_rejects_unsupported_formats() {
        assert!(!is_supported_image(Path::new("photo.tiff")));
        assert!(!is_supported_image(Path::new("photo.txt")));
        assert!(!is_supported_image(Path::new("photo")));
    }

    #[test]
    fn derived_artifacts_are_recognized() {
        assert!(is_derived_artifact(Path::new("mask_a.png")));
        assert!(is_derived_artifact(Path::new("a_comparison.png")));
        assert!(!is_derived_artifact(Path::new("a.png")));
        assert!(!is_derived_artifact(Path::new("unmasked.png")));
    }

    #[test]
    fn embed_returns_consistent_outputs() {
        let engine = WatermarkEngine::new();
        let img = flat(120, 90);
        let params = WatermarkParams {
            font_size: Some(16),
            ..WatermarkParams::new("HELLO")
        };
        let out = engine.embed(&img, &params).unwrap();
        assert_eq!(out.image.width(), 120);
        assert_eq!(out.mask.dimensions(), (120, 90));
        assert_eq!(out.features, extract_features(&out.mask));
        assert!(out.features.num_contours > 0);
    }

    #[test]
    fn embed_rejects_invalid_params_before_work() {
        let engine = WatermarkEngine::new();
        let mut params = WatermarkParams::new("x");
        params.opacity = 2.0;
        let err = engine.embed(&flat(10, 10), &params).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn with_config_validates() {
        let bad = ProcessingConfig {
            inpaint_radius: 0,
            ..ProcessingConfig::default()
        };
        assert!(WatermarkEngine::with_config(bad).is_err());
    }

    #[test]
    fn find_similar_uses_default_threshold() {
        let engine = WatermarkEngine::new();
        let params = WatermarkParams {
            font_size: Some(12),
            ..WatermarkParams::new("AB")
        };
        let out = engine.embed(&flat(100, 80), &params).unwrap();
        let mut store = MaskStore::new();
        let id = store.insert(ImageRef::from("a"), out.mask.clone(), out.features.clone());
        let m = engine.find_similar(&store, &out.features, None).unwrap();
        assert_eq!(m.map(|m| m.id), Some(id));
        assert!(engine
            .find_similar(&store, &out.features, Some(1.5))
            .is_err());
    }

    #[test]
    fn save_image_rejects_unknown_extension() {
        let err = save_image(&flat(2, 2), Path::new("out.xyz")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn remove_preview_pairs_input_with_result() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stamped.png");
        let mut stamped = RgbImage::from_pixel(100, 50, Rgb([200, 180, 160]));
        let mut mask = GrayImage::new(100, 50);
        for y in 20..40 {
            for x in 40..60 {
                stamped.put_pixel(x, y, Rgb([20, 20, 20]));
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        stamped.save(&input).unwrap();
        let mask_file = dir.path().join("region.png");
        mask.save(&mask_file).unwrap();

        let output = dir.path().join("stamped_cleaned.png");
        let opts = ProcessOptions {
            comparison: true,
            ..ProcessOptions::default()
        };
        let result = WatermarkEngine::new().process_file(
            &input,
            &output,
            &Operation::Remove(MaskSource::File(mask_file)),
            &opts,
        );
        assert!(result.success, "{}", result.message);

        let preview = image::open(comparison_path(&output)).unwrap().to_rgb8();
        // 100x50 scales to 1000x500 panels: watermarked, then removed
        assert_eq!(preview.dimensions(), (2 * 1000 + 10, 500));
        assert_eq!(*preview.get_pixel(500, 300), Rgb([20, 20, 20]));
        assert_eq!(*preview.get_pixel(1010 + 500, 300), Rgb([200, 180, 160]));
    }

    #[test]
    fn failed_sidecar_write_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.png");
        flat(80, 60).save(&input).unwrap();
        let output = dir.path().join("photo_watermarked.png");
        // a directory where the preview should go makes the last write fail
        fs::create_dir(comparison_path(&output)).unwrap();

        let opts = ProcessOptions {
            write_mask: true,
            write_features: true,
            comparison: true,
            ..ProcessOptions::default()
        };
        let params = WatermarkParams {
            font_size: Some(12),
            ..WatermarkParams::new("PARTIAL")
        };
        let result =
            WatermarkEngine::new().process_file(&input, &output, &Operation::Embed(params), &opts);
        assert!(!result.success);
        assert!(!output.exists());
        assert!(!mask_path(&output).exists());
        assert!(!features_path(&output).exists());
    }

    #[test]
    fn describe_lists_extras() {
        assert_eq!(describe("Done", &[]), "Done");
        assert_eq!(
            describe("Done", &[PathBuf::from("/x/mask_a.png")]),
            "Done (+ mask_a.png)"
        );
    }
}
