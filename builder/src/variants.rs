// Licensed under the Apache-2.0 license

//! One image per SPI-NAND geometry listed in `array_organization`.

use log::{info, warn};

use crate::component::FileResolver;
use crate::config::{ImageConfig, MediaType};
use crate::error::Result;

/// Geometry whose boot config is also published under the plain name.
const DEFAULT_GEOMETRY: &str = "page_2k_block_128k";

#[derive(Debug, Clone)]
pub struct NandVariant {
    /// Suffix such as "_page_2k_block_128k".
    pub param: String,
    pub config: ImageConfig,
}

/// Expands a SPI-NAND config into per-geometry configs.
///
/// Returns an empty list for other media, or when no geometry has all its
/// required UBI images, in which case a single plain build applies.
pub fn spinand_variants(cfg: &ImageConfig, files: &FileResolver) -> Result<Vec<NandVariant>> {
    if cfg.media_type()? != MediaType::SpiNand {
        return Ok(Vec::new());
    }

    let mut variants = Vec::new();
    for org in cfg.image.info.media.array_organization.iter().flatten() {
        let param = org.param_string();
        let mut variant = cfg.clone();
        let mut complete = true;

        for comp in variant.image.target.values_mut() {
            if !comp.is_ubi() || !comp.file.contains('*') {
                continue;
            }
            let file = comp.file.replace('*', &param);
            if files.resolve(&file).is_none() && comp.is_required() {
                warn!("{} is not found, skipped {}", file, param);
                complete = false;
                break;
            }
            comp.file = file;
        }
        if !complete {
            continue;
        }

        let suffix = param.trim_start_matches('_');
        let image = &mut variant.image;
        image.info.product.push_str(&param);
        image.bootcfg = format!("{}({})", cfg.image.bootcfg, suffix);
        image.part_table = format!("{}({})", cfg.image.part_table, suffix);
        image.info.media.array_organization = Some(vec![org.clone()]);
        info!("SPI-NAND variant {}", param);
        variants.push(NandVariant { param, config: variant });
    }
    Ok(variants)
}

/// Plain boot-config name for the default 2K page / 128K block variant.
pub fn default_bootcfg_name(bootcfg: &str) -> Option<String> {
    let tag = format!("({})", DEFAULT_GEOMETRY);
    bootcfg.contains(&tag).then(|| bootcfg.replace(&tag, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs;
    use tempfile::TempDir;

    const NAND: &str = r#"{
        "spi-nand": {
            "size": "128m",
            "partitions": {
                "spl": { "size": "1m" },
                "ubiroot": { "size": "-", "ubi": { "rootfs": { "size": "-" } } },
            },
        },
        "image": {
            "info": {
                "platform": "d211", "product": "demo", "version": "1.0",
                "media": {
                    "type": "spi-nand", "device_id": 0,
                    "array_organization": [
                        { "page": "2k", "block": "128k" },
                        { "page": "4K", "block": "256K" },
                    ],
                },
            },
            "target": {
                "spl":    { "file": "spl.aic", "attr": "required", "part": "spl" },
                "rootfs": { "file": "rootfs*.ubi", "attr": ["ubi", "required"], "part": "ubiroot:rootfs" },
            },
        },
    }"#;

    #[test]
    fn test_variants_per_geometry() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rootfs_page_2k_block_128k.ubi"), b"ubi").unwrap();
        fs::write(dir.path().join("rootfs_page_4k_block_256k.ubi"), b"ubi").unwrap();
        let cfg = parse_config(NAND).unwrap();
        let variants = spinand_variants(&cfg, &FileResolver::new([dir.path()])).unwrap();
        assert_eq!(variants.len(), 2);

        let second = &variants[1];
        assert_eq!(second.param, "_page_4k_block_256k");
        let image = &second.config.image;
        assert_eq!(image.info.product, "demo_page_4k_block_256k");
        assert_eq!(image.target["rootfs"].file, "rootfs_page_4k_block_256k.ubi");
        assert_eq!(image.target["spl"].file, "spl.aic");
        assert_eq!(image.bootcfg, "bootcfg.txt(page_4k_block_256k)");
        assert_eq!(image.part_table, "image_part_table.bin(page_4k_block_256k)");
        assert_eq!(image.info.media.array_org_string(), "P=4K,B=256K");
        assert_eq!(
            second.config.image_file_name(),
            "d211_demo_page_4k_block_256k_v1.0.img"
        );
    }

    #[test]
    fn test_variant_with_missing_ubi_is_dropped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rootfs_page_4k_block_256k.ubi"), b"ubi").unwrap();
        let cfg = parse_config(NAND).unwrap();
        let variants = spinand_variants(&cfg, &FileResolver::new([dir.path()])).unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].param, "_page_4k_block_256k");
        assert_eq!(
            variants[0].config.image.info.media.array_organization,
            Some(vec![cfg.image.info.media.array_organization.as_ref().unwrap()[1].clone()])
        );
    }

    #[test]
    fn test_non_nand_has_no_variants() {
        let nor = NAND.replace("spi-nand", "spi-nor");
        let cfg = parse_config(&nor).unwrap();
        assert!(spinand_variants(&cfg, &FileResolver::default()).unwrap().is_empty());
    }

    #[test]
    fn test_default_bootcfg_name() {
        assert_eq!(
            default_bootcfg_name("bootcfg.txt(page_2k_block_128k)").as_deref(),
            Some("bootcfg.txt")
        );
        assert_eq!(default_bootcfg_name("bootcfg.txt(page_4k_block_256k)"), None);
        assert_eq!(default_bootcfg_name("bootcfg.txt"), None);
    }
}
