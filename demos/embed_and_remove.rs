//! Stamp a watermark onto an image, then remove it again with the generated mask.
//!
//! Usage:
//! ```sh
//! cargo run --example embed_and_remove -- input.png "WATERMARK TEXT"
//! ```
//!
//! Writes `<stem>_watermarked.<ext>`, `mask_<stem>_watermarked.png` and
//! `<stem>_cleaned.<ext>` next to the input.

use std::env;
use std::path::Path;
use std::process;

use tiled_watermark::{
    default_output_path, mask_path, save_image, WatermarkEngine, WatermarkParams,
};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input> <text>", args[0]);
        process::exit(1);
    }

    if let Err(e) = run(Path::new(&args[1]), &args[2]) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(input: &Path, text: &str) -> tiled_watermark::Result<()> {
    let engine = WatermarkEngine::new();
    let original = image::open(input)?;

    let stamped = engine.embed(&original, &WatermarkParams::new(text))?;
    let stamped_path = default_output_path(input, "watermarked");
    save_image(&stamped.image, &stamped_path)?;
    stamped.mask.save(mask_path(&stamped_path))?;
    println!(
        "Embedded: {} ({} contours, area {:.0})",
        stamped_path.display(),
        stamped.features.num_contours,
        stamped.features.total_area
    );

    let cleaned = engine.remove(&stamped.image, Some(&stamped.mask))?;
    let cleaned_path = default_output_path(input, "cleaned");
    save_image(&cleaned, &cleaned_path)?;
    println!("Removed: {}", cleaned_path.display());
    Ok(())
}
