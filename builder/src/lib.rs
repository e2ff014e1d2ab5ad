// Licensed under the Apache-2.0 license

pub mod boot_image;
pub mod bootcfg;
pub mod burner;
pub mod component;
pub mod config;
pub mod container;
pub mod crypto;
mod error;
pub mod extract;
pub mod page_table;
pub mod partition;
pub mod preprocess;
pub mod size;
pub mod variants;

pub use boot_image::{
    build_aicboot_image, build_aicimage, build_boot_image, verify_boot_image, BootImageGeneration,
    BootImageSpec,
};
pub use component::{resolve_components, Component, FileResolver};
pub use config::{load_config, parse_config, ImageConfig};
pub use container::build_container;
pub use error::{ImageError, Result};
pub use extract::extract_image;
pub use partition::{resolve_partitions, PartitionTable};
pub use preprocess::{make_extension_tar, run_pre_process, CommandRunner, ToolRunner};
pub use variants::spinand_variants;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;

/// Directories and switches for one invocation of the image builder.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Component files and pre-processing outputs.
    pub datadir: PathBuf,
    /// Key material, searched before `datadir`.
    pub keydir: PathBuf,
    pub outdir: PathBuf,
    pub sign: bool,
    pub burner: bool,
    pub verbose: bool,
}

impl BuildOptions {
    /// Options that read and write everything in `datadir`.
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        let datadir = datadir.into();
        Self {
            keydir: datadir.clone(),
            outdir: datadir.clone(),
            datadir,
            sign: false,
            burner: false,
            verbose: false,
        }
    }

    pub fn data_files(&self) -> FileResolver {
        FileResolver::new([&self.datadir])
    }

    pub fn key_files(&self) -> FileResolver {
        FileResolver::with_key_dir(&self.keydir, &self.datadir)
    }
}

/// Writes `data` to `path` and syncs it to disk.
pub(crate) fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(ImageError::file(path))?;
    file.write_all(data).map_err(ImageError::file(path))?;
    file.flush().map_err(ImageError::file(path))?;
    file.sync_all().map_err(ImageError::file(path))?;
    Ok(())
}

/// Packs one firmware image, plus its boot config and, on request, the
/// burner image. Returns the path of the packed image.
///
/// Every output is built in memory first. Nothing reaches `outdir` unless
/// all of them succeed, and the image itself is written last.
pub fn build_firmware_image(cfg: &ImageConfig, opts: &BuildOptions) -> Result<PathBuf> {
    let table = resolve_partitions(cfg)?;
    let mut components = resolve_components(cfg, &table, &opts.data_files(), opts.sign)?;
    let image = build_container(cfg, &mut components)?;
    let burner = if opts.burner {
        Some(burner::build_burner_image(cfg, &table, &components)?)
    } else {
        None
    };
    let image_name = cfg.image_file_name();
    let bootcfg = bootcfg::generate_bootcfg(&components, &image_name);

    std::fs::create_dir_all(&opts.outdir).map_err(ImageError::file(&opts.outdir))?;
    if let Some(burner) = burner {
        let dir = opts.outdir.join("burner");
        std::fs::create_dir_all(&dir).map_err(ImageError::file(&dir))?;
        let bin_path = dir.join(image_name.replace(".img", ".bin"));
        write_output(&bin_path, &burner.image)?;
        write_output(&dir.join(&cfg.image.part_table), &burner.part_table)?;
        info!("Image bin file is generated: {}", bin_path.display());
    }

    write_output(&opts.outdir.join(&cfg.image.bootcfg), bootcfg.as_bytes())?;
    if let Some(name) = variants::default_bootcfg_name(&cfg.image.bootcfg) {
        write_output(&opts.outdir.join(name), bootcfg.as_bytes())?;
    }

    let image_path = opts.outdir.join(&image_name);
    write_output(&image_path, &image)?;
    info!("Image file is generated: {}", image_path.display());
    Ok(image_path)
}

/// Builds one image per SPI-NAND geometry when the media calls for it,
/// otherwise a single image.
pub fn build_all(cfg: &ImageConfig, opts: &BuildOptions) -> Result<Vec<PathBuf>> {
    let variants = spinand_variants(cfg, &opts.data_files())?;
    if variants.is_empty() {
        return Ok(vec![build_firmware_image(cfg, opts)?]);
    }
    variants
        .iter()
        .map(|variant| build_firmware_image(&variant.config, opts))
        .collect()
}
