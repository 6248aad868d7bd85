//! Tiled text watermarks: embed, remove and match.
//!
//! A watermark is a short text repeated over a grid, rotated and blended
//! semi-transparently over the image. Embedding also yields a removal mask
//! and a compact [`FeatureVector`] describing it. Removal inpaints the pixels
//! the mask marks, or the pixels a heuristic detector flags when no mask is
//! available. A [`MaskStore`] matches new descriptors against stored ones.
//!
//! # Quick Start
//!
//! ```no_run
//! use tiled_watermark::{WatermarkEngine, WatermarkParams};
//!
//! let engine = WatermarkEngine::new();
//! let img = image::open("photo.jpg").unwrap();
//! let stamped = engine.embed(&img, &WatermarkParams::new("CONFIDENTIAL")).unwrap();
//! stamped.image.save("stamped.png").unwrap();
//!
//! let cleaned = engine.remove(&stamped.image, Some(&stamped.mask)).unwrap();
//! cleaned.save("cleaned.png").unwrap();
//! ```
//!
//! # Matching
//!
//! ```no_run
//! use tiled_watermark::{ImageRef, MaskStore, WatermarkEngine, WatermarkParams};
//!
//! let engine = WatermarkEngine::new();
//! let img = image::open("photo.jpg").unwrap();
//! let stamped = engine.embed(&img, &WatermarkParams::new("DRAFT")).unwrap();
//!
//! let mut store = MaskStore::new();
//! store.insert(ImageRef::from("photo.jpg"), stamped.mask, stamped.features.clone());
//! if let Some(m) = store.find_similar_mask(&stamped.features, 0.9).unwrap() {
//!     println!("matches {} ({:.2})", m.id, m.similarity);
//! }
//! ```

#![deny(missing_docs)]

pub mod blending;
pub mod comparison;
pub mod config;
pub mod detection;
mod engine;
pub mod error;
pub mod features;
pub mod font;
pub mod inpaint;
pub mod similarity;
pub mod synthesis;

pub use config::{ProcessingConfig, WatermarkParams};
pub use engine::{
    comparison_path, default_output_path, features_path, is_derived_artifact, is_supported_image,
    load_features, load_mask_store, mask_path, save_image, EmbedResult, MaskSource, Operation,
    ProcessOptions, ProcessResult, WatermarkEngine,
};
pub use error::{Error, ErrorKind, Result};
pub use features::FeatureVector;
pub use font::WatermarkFont;
pub use similarity::{ImageRef, MaskStore, RecordId, SimilarityMatch, StoredMaskRecord};
