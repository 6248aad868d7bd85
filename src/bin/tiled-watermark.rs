use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tiled_watermark::{
    default_output_path, load_features, load_mask_store, MaskSource, Operation, ProcessOptions,
    ProcessResult, ProcessingConfig, WatermarkEngine, WatermarkFont, WatermarkParams,
};

#[derive(Parser)]
#[command(
    name = "tiled-watermark",
    about = "Embed, remove and match tiled text watermarks",
    version,
    after_help = "Examples:\n  tiled-watermark add photo.jpg --text CONFIDENTIAL --mask --features\n  \
                  tiled-watermark remove photo_watermarked.jpg --sidecar\n  \
                  tiled-watermark match photo_watermarked.features.json --store ./out"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Processing configuration as JSON (missing fields use defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Stamp a tiled text watermark onto an image or every image in a directory
    Add(AddArgs),
    /// Remove a watermark using a mask or the heuristic detector
    Remove(RemoveArgs),
    /// Find the stored mask most similar to a feature sidecar
    Match(MatchArgs),
}

#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
struct AddArgs {
    /// Input image file or directory
    input: PathBuf,

    /// Watermark text
    #[arg(short, long)]
    text: String,

    /// Opacity (0.0-1.0)
    #[arg(long, default_value = "0.5")]
    opacity: f32,

    /// Rotation in degrees, counter-clockwise
    #[arg(long, default_value = "30")]
    angle: f32,

    /// Font size in pixels (default: derived from the image size)
    #[arg(long)]
    font_size: Option<u32>,

    /// TrueType/OpenType font file (default: builtin bitmap font)
    #[arg(long)]
    font: Option<PathBuf>,

    /// Output file or directory (default: {name}_watermarked.{ext})
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write the removal mask as mask_{name}.png
    #[arg(long)]
    mask: bool,

    /// Also write the mask descriptor as {name}.features.json
    #[arg(long)]
    features: bool,

    /// Also write a side-by-side preview as {name}_comparison.png
    #[arg(long)]
    comparison: bool,
}

#[derive(Args)]
struct RemoveArgs {
    /// Input image file or directory
    input: PathBuf,

    /// Mask image to use for every input
    #[arg(long, conflicts_with = "sidecar")]
    mask: Option<PathBuf>,

    /// Use mask_{name}.png next to each input when present
    #[arg(long)]
    sidecar: bool,

    /// Output file or directory (default: {name}_cleaned.{ext})
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write a side-by-side preview as {name}_comparison.png
    #[arg(long)]
    comparison: bool,
}

#[derive(Args)]
struct MatchArgs {
    /// Feature sidecar of the query mask
    features: PathBuf,

    /// Directory holding stored masks and their feature sidecars
    #[arg(short, long)]
    store: PathBuf,

    /// Similarity threshold (0.0-1.0, default from config)
    #[arg(short, long)]
    threshold: Option<f64>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let engine = match build_engine(cli.config.as_deref()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Fatal: Failed to initialize engine: {e}");
            process::exit(1);
        }
    };

    let code = match cli.command {
        Command::Add(args) => run_add(engine, args, cli.verbose, cli.quiet),
        Command::Remove(args) => run_remove(&engine, args, cli.verbose, cli.quiet),
        Command::Match(args) => run_match(&engine, &args, cli.quiet),
    };
    process::exit(code);
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_engine(config: Option<&Path>) -> tiled_watermark::Result<WatermarkEngine> {
    let config = match config {
        Some(path) => serde_json::from_str::<ProcessingConfig>(&std::fs::read_to_string(path)?)?,
        None => ProcessingConfig::default(),
    };
    WatermarkEngine::with_config(config)
}

fn run_add(engine: WatermarkEngine, args: AddArgs, verbose: bool, quiet: bool) -> i32 {
    let params = WatermarkParams {
        text: args.text,
        opacity: args.opacity,
        angle: args.angle,
        font_size: args.font_size,
    };
    if let Err(e) = params.validate() {
        eprintln!("Error: {e}");
        return 1;
    }

    let engine = match &args.font {
        Some(path) => match WatermarkFont::from_file(path) {
            Ok(font) => engine.with_font(font),
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        },
        None => engine,
    };

    let opts = ProcessOptions {
        write_mask: args.mask,
        write_features: args.features,
        comparison: args.comparison,
        verbose,
        quiet,
    };
    run_files(
        &engine,
        &args.input,
        args.output,
        "watermarked",
        &Operation::Embed(params),
        &opts,
    )
}

fn run_remove(engine: &WatermarkEngine, args: RemoveArgs, verbose: bool, quiet: bool) -> i32 {
    let source = match (args.mask, args.sidecar) {
        (Some(path), _) => MaskSource::File(path),
        (None, true) => MaskSource::Sidecar,
        (None, false) => MaskSource::Detect,
    };

    if !quiet {
        match &source {
            MaskSource::Detect => eprintln!("No mask given, using heuristic detection"),
            MaskSource::File(path) => eprintln!("Using mask {}", path.display()),
            MaskSource::Sidecar => eprintln!("Using mask sidecars where present"),
        }
        eprintln!();
    }

    let opts = ProcessOptions {
        comparison: args.comparison,
        verbose,
        quiet,
        ..ProcessOptions::default()
    };
    run_files(
        engine,
        &args.input,
        args.output,
        "cleaned",
        &Operation::Remove(source),
        &opts,
    )
}

fn run_files(
    engine: &WatermarkEngine,
    input: &Path,
    output: Option<PathBuf>,
    suffix: &str,
    op: &Operation,
    opts: &ProcessOptions,
) -> i32 {
    if !input.exists() {
        eprintln!("Error: Input path does not exist: {}", input.display());
        return 1;
    }

    let results = if input.is_dir() {
        let Some(output_dir) = output else {
            eprintln!("Error: Output directory is required for batch processing");
            eprintln!("Usage: tiled-watermark <command> <input_dir> -o <output_dir>");
            return 1;
        };
        engine.process_directory(input, &output_dir, op, opts)
    } else {
        let output_path = output.unwrap_or_else(|| default_output_path(input, suffix));
        vec![engine.process_file(input, &output_path, op, opts)]
    };

    let mut success_count = 0u32;
    let mut skip_count = 0u32;
    let mut fail_count = 0u32;

    for r in &results {
        print_result(r, opts);
        if r.skipped {
            skip_count += 1;
        } else if r.success {
            success_count += 1;
        } else {
            fail_count += 1;
        }
    }

    if results.len() > 1 && !opts.quiet {
        eprintln!();
        eprint!("[Summary] Processed: {success_count}");
        if skip_count > 0 {
            eprint!(", Skipped: {skip_count}");
        }
        if fail_count > 0 {
            eprint!(", Failed: {fail_count}");
        }
        eprintln!(" (Total: {})", results.len());
    }

    i32::from(fail_count > 0)
}

fn run_match(engine: &WatermarkEngine, args: &MatchArgs, quiet: bool) -> i32 {
    let query = match load_features(&args.features) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error: Failed to load {}: {e}", args.features.display());
            return 1;
        }
    };
    let store = match load_mask_store(&args.store) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: Failed to load store {}: {e}", args.store.display());
            return 1;
        }
    };
    if !quiet {
        eprintln!("Searching {} stored masks", store.len());
    }

    match engine.find_similar(&store, &query, args.threshold) {
        Ok(Some(m)) => {
            let image = store
                .get(m.id)
                .map_or_else(|_| m.id.to_string(), |r| r.image.to_string());
            println!("[MATCH] {image} (similarity {:.3})", m.similarity);
            0
        }
        Ok(None) => {
            println!("[NONE] No similar mask found");
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

fn print_result(result: &ProcessResult, opts: &ProcessOptions) {
    if opts.quiet && result.success {
        return;
    }

    let filename = result.path.file_name().map_or_else(
        || result.path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    );

    if result.skipped {
        if !opts.quiet {
            eprintln!("[SKIP] {filename}: {}", result.message);
        }
    } else if result.success {
        if !opts.quiet {
            eprintln!(
                "[OK] {filename} ({:.1}% of pixels)",
                result.coverage * 100.0
            );
        }
    } else {
        eprintln!("[FAIL] {filename}: {}", result.message);
    }

    if opts.verbose && !result.message.is_empty() {
        eprintln!("  -> {}", result.message);
        if let Some(out) = &result.output {
            eprintln!("  -> {}", out.display());
        }
    }
}
