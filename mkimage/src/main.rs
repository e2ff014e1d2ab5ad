// Licensed under the Apache-2.0 license

use std::path::{Path, PathBuf};

use aic_builder::{
    build_all, extract_image, load_config, run_pre_process, verify_boot_image, BuildOptions,
    CommandRunner,
};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

const DEFAULT_CONFIG_NAME: &str = "image_cfg.json";

/// Packs firmware components into an AIC firmware image.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct MkImage {
    /// Input image data directory
    #[arg(short, long, conflicts_with = "imgfile")]
    datadir: Option<PathBuf>,

    /// Input firmware image to unpack and rebuild from
    #[arg(short, long)]
    imgfile: Option<PathBuf>,

    /// Output image file directory. Default: datadir
    #[arg(short, long)]
    outdir: Option<PathBuf>,

    /// Image configuration file. Default: <datadir>/image_cfg.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Key material directory. Default: datadir
    #[arg(short, long)]
    keydir: Option<PathBuf>,

    /// Only unpack the image given with --imgfile
    #[arg(short, long, default_value_t = false, requires = "imgfile")]
    extract: bool,

    /// Sign image file
    #[arg(short, long, default_value_t = false)]
    sign: bool,

    /// Also generate the burner format image
    #[arg(short, long, default_value_t = false)]
    burner: bool,

    /// Run pre-processing only
    #[arg(short, long, default_value_t = false)]
    preprocess: bool,

    /// Show detail information
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Check a boot image and exit
    #[arg(long, value_name = "FILE")]
    verify: Option<PathBuf>,
}

fn verify(path: &Path) -> Result<()> {
    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let header =
        verify_boot_image(&image).with_context(|| format!("verifying {}", path.display()))?;
    info!(
        "{}: img_len {:#x}, loader {:#x} bytes at {:#010x}, sign algo {}",
        path.display(),
        header.img_len.get(),
        header.loader_length.get(),
        header.load_address.get(),
        header.sign_algo.get()
    );
    Ok(())
}

/// Directory holding this executable, searched first for helper tools.
fn tool_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn run(cli: &MkImage) -> Result<()> {
    if let Some(path) = &cli.verify {
        return verify(path);
    }

    let input_dir = cli.datadir.clone().unwrap_or_else(|| PathBuf::from("./"));
    let datadir = match &cli.imgfile {
        Some(img) => {
            let dir =
                extract_image(img).with_context(|| format!("extracting {}", img.display()))?;
            info!("Extracted {} to {}", img.display(), dir.display());
            if cli.extract {
                return Ok(());
            }
            dir
        }
        None => input_dir.clone(),
    };

    let mut opts = BuildOptions::new(&datadir);
    opts.outdir = cli.outdir.clone().unwrap_or(input_dir);
    opts.keydir = cli.keydir.clone().unwrap_or_else(|| datadir.clone());
    opts.sign = cli.sign;
    opts.burner = cli.burner;
    opts.verbose = cli.verbose;

    let config = cli
        .config
        .clone()
        .unwrap_or_else(|| datadir.join(DEFAULT_CONFIG_NAME));
    let cfg = load_config(&config).with_context(|| format!("loading {}", config.display()))?;

    run_pre_process(&cfg, &opts, &CommandRunner::new(tool_dir())).context("pre-process")?;
    if cli.preprocess {
        return Ok(());
    }

    let images = build_all(&cfg, &opts)?;
    info!("{} image(s) generated in {}", images.len(), opts.outdir.display());
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(level)
        .without_timestamps()
        .init()
        .map_err(|e| anyhow!("initializing logger: {}", e))
}

fn main() {
    let cli = MkImage::parse();
    let result = init_logging(cli.verbose).and_then(|()| run(&cli));
    result.unwrap_or_else(|e| {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    });
}
