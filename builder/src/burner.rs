// Licensed under the Apache-2.0 license

//! Flat, block-addressed image for mass-production programmers.

use std::path::PathBuf;

use aic_image::{BurnerBlockRecord, FW_DATA_ALIGN, UNUSED_SENTINEL};
use log::{debug, info, warn};
use zerocopy::IntoBytes;

use crate::component::{Component, Section};
use crate::config::{ArrayOrganization, ImageConfig, MediaType};
use crate::error::{ImageError, Result};
use crate::page_table::build_page_table;
use crate::partition::PartitionTable;
use crate::size::round_up;

/// Upper bound of the pre-allocated burner buffer.
pub const BURNER_MAX_SIZE: usize = 300 * 1024 * 1024;
pub const NOR_BLOCK_SIZE: usize = 64 * 1024;
pub const MMC_SECTOR_SIZE: usize = 512;
const SPL_COMPONENT: &str = "spl";

pub struct BurnerImage {
    pub image: Vec<u8>,
    /// Block records followed by one all-0xFF record.
    pub part_table: Vec<u8>,
}

fn nand_geometry(cfg: &ImageConfig) -> Result<&ArrayOrganization> {
    cfg.image
        .info
        .media
        .array_organization
        .as_ref()
        .and_then(|orgs| orgs.last())
        .ok_or_else(|| ImageError::config("spi-nand media requires array_organization"))
}

/// Erase/program unit used for the block records.
pub fn block_size(cfg: &ImageConfig) -> Result<usize> {
    match cfg.media_type()? {
        MediaType::SpiNand => nand_geometry(cfg)?.block_bytes(),
        MediaType::SpiNor => Ok(NOR_BLOCK_SIZE),
        MediaType::Mmc => Ok(MMC_SECTOR_SIZE),
    }
}

/// File actually burned for a component. UBIFS images are burned as the
/// matching UBI image.
fn burn_source(comp: &Component) -> Option<PathBuf> {
    let path = comp.path.as_ref()?;
    let name = path.to_string_lossy();
    if !name.contains(".ubifs") {
        return Some(path.clone());
    }
    let ubi = PathBuf::from(name.replace(".ubifs", ".ubi"));
    if ubi.is_file() {
        Some(ubi)
    } else {
        warn!("File {} is not exist, skipped", ubi.display());
        None
    }
}

fn write_at(image: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if end > image.len() {
        image.resize(end, 0xFF);
    }
    image[offset..end].copy_from_slice(data);
}

pub fn build_burner_image(
    cfg: &ImageConfig,
    table: &PartitionTable,
    components: &[Component],
) -> Result<BurnerImage> {
    let media_type = cfg.media_type()?;
    let block = block_size(cfg)?;
    let page_size = match media_type {
        MediaType::SpiNand => Some(nand_geometry(cfg)?.page_bytes()?),
        _ => None,
    };

    let capacity = (table.media_size as usize).min(BURNER_MAX_SIZE);
    let mut image = vec![0xFFu8; capacity];
    let mut records = Vec::new();

    for comp in components.iter().filter(|c| c.section == Section::Target) {
        let Some(part) = comp.partition else {
            continue;
        };
        let Some(path) = burn_source(comp) else {
            continue;
        };
        let data = std::fs::read(&path).map_err(ImageError::file(&path))?;

        let page_table = match page_size {
            Some(page_size) if comp.name == SPL_COMPONENT => {
                Some(build_page_table(&data, page_size)?)
            }
            _ => None,
        };
        let table_len = page_table.as_ref().map_or(0, Vec::len);
        let rounded = round_up(data.len(), FW_DATA_ALIGN) + table_len;
        if (data.len() + table_len) as u64 > part.size {
            return Err(ImageError::ComponentExceedsPartition {
                component: path.display().to_string(),
                partition: comp.config.part_string(),
                size: (data.len() + table_len) as u64,
                part_size: part.size,
            });
        }

        let start = part.offset as usize / block;
        let used = rounded.div_ceil(block);
        let record = BurnerBlockRecord {
            start_block: (start as u32).into(),
            last_block: ((start + used).saturating_sub(1) as u32).into(),
            used_blocks: (used as u32).into(),
            sentinel: UNUSED_SENTINEL.into(),
        };
        records.extend_from_slice(record.as_bytes());

        let mut offset = part.offset as usize;
        if let Some(page_table) = &page_table {
            write_at(&mut image, offset, page_table);
            offset += page_table.len();
        }
        write_at(&mut image, offset, &data);
        debug!(
            "Burn {} at {:#x}, blocks {}..={}",
            path.display(),
            part.offset,
            start,
            record.last_block.get()
        );
    }

    records.extend_from_slice(&[0xFF; std::mem::size_of::<BurnerBlockRecord>()]);
    info!(
        "Burner image: {:#x} bytes, {} block records",
        image.len(),
        records.len() / std::mem::size_of::<BurnerBlockRecord>() - 1
    );
    Ok(BurnerImage {
        image,
        part_table: records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{resolve_components, FileResolver};
    use crate::config::parse_config;
    use crate::partition::resolve_partitions;
    use std::fs;
    use tempfile::TempDir;
    use zerocopy::FromBytes;

    const NAND: &str = r#"{
        "spi-nand": {
            "size": "8m",
            "partitions": {
                "spl":   { "size": "1m" },
                "uboot": { "size": "1m" },
                "ubiroot": {
                    "size": "-",
                    "ubi": { "rootfs": { "size": "-" } },
                },
            },
        },
        "image": {
            "info": {
                "platform": "d211", "product": "nand", "version": "1.0",
                "media": {
                    "type": "spi-nand", "device_id": 0,
                    "array_organization": [{ "page": "2k", "block": "128k" }],
                },
            },
            "target": {
                "spl":    { "file": "spl.aic", "attr": "required", "part": ["spl"] },
                "uboot":  { "file": "u-boot.aic", "attr": "required", "part": ["uboot"] },
                "rootfs": { "file": "rootfs.ubifs", "attr": ["ubi", "optional"], "part": ["ubiroot:rootfs"] },
            },
        },
    }"#;

    fn build(dir: &TempDir) -> BurnerImage {
        let cfg = parse_config(NAND).unwrap();
        let table = resolve_partitions(&cfg).unwrap();
        let files = FileResolver::new([dir.path()]);
        let components = resolve_components(&cfg, &table, &files, false).unwrap();
        build_burner_image(&cfg, &table, &components).unwrap()
    }

    fn record(bytes: &[u8], i: usize) -> BurnerBlockRecord {
        BurnerBlockRecord::read_from_bytes(&bytes[i * 16..i * 16 + 16]).unwrap()
    }

    #[test]
    fn test_nand_burner_layout() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("spl.aic"), vec![0x11; 3000]).unwrap();
        fs::write(dir.path().join("u-boot.aic"), vec![0x22; 200 * 1024]).unwrap();
        let burner = build(&dir);

        assert_eq!(burner.image.len(), 8 * 1024 * 1024);
        assert_eq!(&burner.image[..4], b"AICP");
        assert_eq!(&burner.image[2048..2048 + 3000], &[0x11; 3000][..]);
        assert!(burner.image[2048 + 3000..1024 * 1024].iter().all(|&b| b == 0xFF));
        assert_eq!(&burner.image[1024 * 1024..1024 * 1024 + 4], &[0x22; 4]);

        // Two records plus the terminator; rootfs is optional and absent.
        assert_eq!(burner.part_table.len(), 3 * 16);
        let spl = record(&burner.part_table, 0);
        assert_eq!(
            (spl.start_block.get(), spl.last_block.get(), spl.used_blocks.get()),
            (0, 0, 1)
        );
        let uboot = record(&burner.part_table, 1);
        assert_eq!(
            (uboot.start_block.get(), uboot.last_block.get(), uboot.used_blocks.get()),
            (8, 9, 2)
        );
        assert_eq!(uboot.sentinel.get(), UNUSED_SENTINEL);
        assert!(burner.part_table[32..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_ubifs_burned_from_ubi_sibling() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("spl.aic"), vec![0x11; 100]).unwrap();
        fs::write(dir.path().join("u-boot.aic"), vec![0x22; 100]).unwrap();
        fs::write(dir.path().join("rootfs.ubifs"), vec![0x33; 100]).unwrap();
        fs::write(dir.path().join("rootfs.ubi"), vec![0x44; 4096]).unwrap();
        let burner = build(&dir);
        let root = 2 * 1024 * 1024;
        assert_eq!(&burner.image[root..root + 4096], &[0x44; 4096][..]);
        let rec = record(&burner.part_table, 2);
        assert_eq!(rec.start_block.get(), 16);
        assert_eq!(rec.used_blocks.get(), 1);
    }

    #[test]
    fn test_missing_ubi_sibling_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("spl.aic"), vec![0x11; 100]).unwrap();
        fs::write(dir.path().join("u-boot.aic"), vec![0x22; 100]).unwrap();
        fs::write(dir.path().join("rootfs.ubifs"), vec![0x33; 100]).unwrap();
        let burner = build(&dir);
        assert_eq!(burner.part_table.len(), 3 * 16);
    }

    #[test]
    fn test_block_sizes() {
        let cfg = parse_config(NAND).unwrap();
        assert_eq!(block_size(&cfg).unwrap(), 128 * 1024);
        let nor = NAND
            .replace("spi-nand", "spi-nor")
            .replace(r#""array_organization": [{ "page": "2k", "block": "128k" }],"#, "");
        assert_eq!(block_size(&parse_config(&nor).unwrap()).unwrap(), NOR_BLOCK_SIZE);
        let mmc = nor.replace("spi-nor", "mmc");
        assert_eq!(block_size(&parse_config(&mmc).unwrap()).unwrap(), MMC_SECTOR_SIZE);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("spl.aic"), vec![0x11; 100]).unwrap();
        fs::write(dir.path().join("u-boot.aic"), vec![0x22; 100]).unwrap();
        let cfg = parse_config(&NAND.replace(r#""block": "128k""#, r#""block": "0k""#)).unwrap();
        assert!(matches!(block_size(&cfg), Err(ImageError::Config(_))));

        let table = resolve_partitions(&cfg).unwrap();
        let files = FileResolver::new([dir.path()]);
        let components = resolve_components(&cfg, &table, &files, false).unwrap();
        assert!(matches!(
            build_burner_image(&cfg, &table, &components),
            Err(ImageError::Config(_))
        ));
    }

    #[test]
    fn test_buffer_grows_past_media_size() {
        let mut image = vec![0xFFu8; 16];
        write_at(&mut image, 12, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(image.len(), 18);
        assert_eq!(&image[12..], &[1, 2, 3, 4, 5, 6]);
    }
}
