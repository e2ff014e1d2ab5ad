// Licensed under the Apache-2.0 license

//! Firmware container ("AIC.FW"): header area, meta area, file area.

use aic_image::{
    bytes_field, str_field, FwHeader, MetaRecord, FW_DATA_ALIGN, FW_HEADER_AREA_SIZE,
    FW_IMAGE_MAGIC, META_MAGIC, META_RECORD_SIZE, UNUSED_SENTINEL,
};
use log::{debug, info, warn};
use zerocopy::{FromZeros, IntoBytes};

use crate::component::{Component, Section};
use crate::config::ImageConfig;
use crate::crypto::crc32;
use crate::error::{ImageError, Result};
use crate::size::{parse_hex_u32, round_up};

const INFO_RECORD_NAME: &str = "image.info";
const INFO_RECORD_FILE: &str = "info.bin";

/// Drops target components that cannot be placed and checks partition bounds.
fn checked_components(components: &[Component]) -> Result<Vec<usize>> {
    let mut included = Vec::new();
    for (i, comp) in components.iter().enumerate() {
        if comp.section == Section::Target {
            let Some(part) = comp.partition else {
                warn!(
                    "There is no partition for component '{}', skipped",
                    comp.name
                );
                continue;
            };
            if comp.file_size > part.size {
                return Err(ImageError::ComponentExceedsPartition {
                    component: comp.config.file.clone(),
                    partition: comp.config.part_string(),
                    size: comp.file_size,
                    part_size: part.size,
                });
            }
        }
        if comp.is_present() {
            included.push(i);
        }
    }
    Ok(included)
}

fn slot_size(comp: &Component) -> usize {
    round_up(comp.file_size as usize, FW_DATA_ALIGN)
}

fn fw_header(
    cfg: &ImageConfig,
    meta_size: usize,
    file_size: usize,
    ex_size: usize,
) -> Result<FwHeader> {
    let info = &cfg.image.info;
    let mut header = FwHeader::new_zeroed();
    header.magic = bytes_field(FW_IMAGE_MAGIC);
    header.platform = str_field(&info.platform);
    header.product = str_field(&info.product);
    header.version = str_field(&info.version.to_string());
    header.media_type = str_field(&info.media.media_type);
    header.media_dev_id = info.media.device_id()?.into();
    header.nand_array_org = str_field(&info.media.array_org_string());

    let meta_offset = FW_HEADER_AREA_SIZE;
    let file_offset = meta_offset + meta_size;
    header.meta_offset = (meta_offset as u32).into();
    header.meta_size = (meta_size as u32).into();
    header.file_offset = (file_offset as u32).into();
    header.file_size = (file_size as u32).into();
    header.ex_offset = ((file_offset + file_size - ex_size) as u32).into();
    header.ex_size = (ex_size as u32).into();
    Ok(header)
}

fn info_record(crc: u32) -> MetaRecord {
    MetaRecord {
        magic: bytes_field(META_MAGIC),
        name: str_field(INFO_RECORD_NAME),
        partition: [0; 64],
        offset: 0u32.into(),
        size: (FW_HEADER_AREA_SIZE as u32).into(),
        crc: crc.into(),
        ram: UNUSED_SENTINEL.into(),
        attr: str_field("required"),
        filename: str_field(INFO_RECORD_FILE),
    }
}

fn component_record(comp: &Component, offset: usize, data: &[u8]) -> Result<MetaRecord> {
    let ram = match &comp.config.ram {
        Some(ram) => parse_hex_u32(ram)?,
        None => UNUSED_SENTINEL,
    };
    Ok(MetaRecord {
        magic: bytes_field(META_MAGIC),
        name: str_field(&comp.meta_name()),
        partition: str_field(&comp.config.part_string()),
        offset: (offset as u32).into(),
        size: (data.len() as u32).into(),
        crc: crc32(data).into(),
        ram: ram.into(),
        attr: str_field(&comp.config.attr_string()),
        filename: str_field(&comp.config.file),
    })
}

/// Builds the container image in memory.
///
/// Each included component gets its `file_offset` set to the offset of its
/// slot in the returned image.
pub fn build_container(cfg: &ImageConfig, components: &mut [Component]) -> Result<Vec<u8>> {
    let included = checked_components(components)?;

    let meta_size = (included.len() + 1) * META_RECORD_SIZE;
    let file_size: usize = included.iter().map(|&i| slot_size(&components[i])).sum();
    let ex_size: usize = included
        .iter()
        .filter(|&&i| components[i].section == Section::Extension)
        .map(|&i| slot_size(&components[i]))
        .sum();

    let total = FW_HEADER_AREA_SIZE + meta_size + file_size;
    if u32::try_from(total).is_err() {
        return Err(ImageError::ComponentTooLarge(
            cfg.image_file_name(),
            format!("container size {:#x} exceeds 32-bit offsets", total),
        ));
    }
    let mut image = vec![0u8; total];

    let header = fw_header(cfg, meta_size, file_size, ex_size)?;
    let header_bytes = header.as_bytes();
    image[..header_bytes.len()].copy_from_slice(header_bytes);
    let info_crc = crc32(&image[..FW_HEADER_AREA_SIZE]);

    let mut meta_offset = FW_HEADER_AREA_SIZE;
    let mut file_offset = FW_HEADER_AREA_SIZE + meta_size;
    let mut info_written = false;

    for &i in &included {
        if !info_written && components[i].section != Section::Updater {
            let meta = info_record(info_crc);
            image[meta_offset..meta_offset + META_RECORD_SIZE].copy_from_slice(meta.as_bytes());
            meta_offset += META_RECORD_SIZE;
            info_written = true;
        }

        let comp = &mut components[i];
        let Some(path) = &comp.path else {
            continue;
        };
        let data = std::fs::read(path).map_err(ImageError::file(path))?;
        if data.len() as u64 != comp.file_size {
            return Err(ImageError::config(format!(
                "{} changed size while building the image",
                comp.config.file
            )));
        }
        let meta = component_record(comp, file_offset, &data)?;
        image[meta_offset..meta_offset + META_RECORD_SIZE].copy_from_slice(meta.as_bytes());
        image[file_offset..file_offset + data.len()].copy_from_slice(&data);
        debug!(
            "{:<32} offset {:#010x} size {:#x}",
            comp.meta_name(),
            file_offset,
            data.len()
        );

        comp.file_offset = file_offset as u64;
        meta_offset += META_RECORD_SIZE;
        file_offset += slot_size(comp);
    }

    if !info_written {
        let meta = info_record(info_crc);
        image[meta_offset..meta_offset + META_RECORD_SIZE].copy_from_slice(meta.as_bytes());
    }

    info!(
        "Container: {} components, meta {:#x} bytes, files {:#x} bytes",
        included.len(),
        meta_size,
        file_size
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{resolve_components, FileResolver};
    use crate::config::parse_config;
    use crate::partition::resolve_partitions;
    use aic_image::field_str;
    use std::fs;
    use tempfile::TempDir;
    use zerocopy::FromBytes;

    const CONFIG: &str = r#"{
        "mmc": {
            "size": "64m",
            "partitions": {
                "spl":    { "size": "1m" },
                "kernel": { "size": "8m" },
                "rootfs": { "size": "-" },
            },
        },
        "image": {
            "info": {
                "platform": "d211", "product": "demo", "version": "1.0.1",
                "media": { "type": "mmc", "device_id": 1 },
            },
            "updater": {
                "spl": { "file": "updater.aic", "attr": ["block", "required"], "ram": "0x00103100" },
            },
            "target": {
                "spl":    { "file": "spl.aic", "attr": ["block", "required"], "part": ["spl"] },
                "kernel": { "file": "kernel.itb", "attr": ["block", "optional"], "part": ["kernel"] },
                "rootfs": { "file": "rootfs.ext4", "attr": "block;required", "part": ["rootfs"] },
            },
        },
    }"#;

    fn build(dir: &TempDir) -> (Vec<u8>, Vec<Component>) {
        let cfg = parse_config(CONFIG).unwrap();
        let table = resolve_partitions(&cfg).unwrap();
        let files = FileResolver::new([dir.path()]);
        let mut components = resolve_components(&cfg, &table, &files, false).unwrap();
        let image = build_container(&cfg, &mut components).unwrap();
        (image, components)
    }

    fn records(image: &[u8]) -> Vec<MetaRecord> {
        let header = FwHeader::read_from_bytes(&image[..std::mem::size_of::<FwHeader>()]).unwrap();
        let start = header.meta_offset.get() as usize;
        (0..header.meta_size.get() as usize / META_RECORD_SIZE)
            .map(|i| {
                let off = start + i * META_RECORD_SIZE;
                MetaRecord::read_from_bytes(&image[off..off + META_RECORD_SIZE]).unwrap()
            })
            .collect()
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("updater.aic"), vec![0x11; 5000]).unwrap();
        fs::write(dir.path().join("spl.aic"), vec![0x22; 2048]).unwrap();
        fs::write(dir.path().join("rootfs.ext4"), vec![0x33; 10]).unwrap();
        dir
    }

    #[test]
    fn test_meta_order_and_missing_optional() {
        let dir = setup();
        let (image, _) = build(&dir);
        let names: Vec<String> = records(&image)
            .iter()
            .map(|m| field_str(&m.name).to_string())
            .collect();
        assert_eq!(
            names,
            [
                "image.updater.spl",
                "image.info",
                "image.target.spl",
                "image.target.rootfs"
            ]
        );
        // 6144 + 2048 + 2048 bytes of file slots
        assert_eq!(image.len(), 2048 + 4 * 256 + 10240);
    }

    #[test]
    fn test_header_and_records() {
        let dir = setup();
        let (image, components) = build(&dir);
        let header = FwHeader::read_from_bytes(&image[..std::mem::size_of::<FwHeader>()]).unwrap();
        assert!(header.verify());
        assert_eq!(field_str(&header.magic), "AIC.FW");
        assert_eq!(field_str(&header.product), "demo");
        assert_eq!(field_str(&header.media_type), "mmc");
        assert_eq!(header.media_dev_id.get(), 1);
        assert_eq!(header.meta_size.get(), 1024);
        assert_eq!(header.file_offset.get(), 3072);
        assert_eq!(header.file_size.get(), 10240);
        assert_eq!(header.ex_size.get(), 0);
        assert_eq!(header.ex_offset.get(), 3072 + 10240);

        let metas = records(&image);
        let updater = &metas[0];
        assert_eq!(updater.offset.get(), 3072);
        assert_eq!(updater.size.get(), 5000);
        assert_eq!(updater.ram.get(), 0x0010_3100);
        assert_eq!(updater.crc.get(), crc32(&[0x11; 5000]));
        assert_eq!(field_str(&updater.attr), "block;required");
        assert_eq!(field_str(&updater.filename), "updater.aic");

        let info = &metas[1];
        assert_eq!(info.offset.get(), 0);
        assert_eq!(info.size.get(), 2048);
        assert_eq!(info.ram.get(), UNUSED_SENTINEL);
        assert_eq!(info.crc.get(), crc32(&image[..2048]));

        let rootfs = &metas[3];
        assert_eq!(field_str(&rootfs.partition), "rootfs");
        assert_eq!(rootfs.offset.get(), 3072 + 6144 + 2048);
        assert_eq!(field_str(&rootfs.attr), "block;required");

        let spl = components.iter().find(|c| c.meta_name() == "image.target.spl").unwrap();
        assert_eq!(spl.file_offset, 3072 + 6144);
    }

    #[test]
    fn test_slot_padding_is_zero() {
        let dir = setup();
        let (image, _) = build(&dir);
        let start = 3072 + 6144 + 2048;
        assert_eq!(&image[start..start + 10], &[0x33; 10]);
        assert!(image[start + 10..start + 2048].iter().all(|&b| b == 0));
        assert!(image[3072 + 5000..3072 + 6144].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_component_exceeds_partition() {
        let dir = setup();
        fs::write(dir.path().join("spl.aic"), vec![0x22; 1024 * 1024 + 1]).unwrap();
        let cfg = parse_config(CONFIG).unwrap();
        let table = resolve_partitions(&cfg).unwrap();
        let files = FileResolver::new([dir.path()]);
        let mut components = resolve_components(&cfg, &table, &files, false).unwrap();
        let err = build_container(&cfg, &mut components).unwrap_err();
        assert!(matches!(
            err,
            ImageError::ComponentExceedsPartition { ref partition, .. } if partition == "spl"
        ));
    }
}
