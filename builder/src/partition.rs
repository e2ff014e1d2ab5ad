// Licensed under the Apache-2.0 license

//! Resolves the declared partition layout of a media into absolute byte ranges.

use indexmap::IndexMap;
use log::debug;

use crate::config::{ImageConfig, MediaType, PartitionConfig, VolumeConfig};
use crate::error::{ImageError, Result};
use crate::size::{parse_bytes, parse_size, SizeExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub offset: u64,
    pub size: u64,
}

impl PartitionRange {
    /// Resolved ranges never overflow; see `resolve_ranges`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Ubi,
    Nftl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub range: PartitionRange,
    pub volume_kind: Option<VolumeKind>,
    pub volumes: IndexMap<String, PartitionRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub media_type: MediaType,
    pub media_size: u64,
    pub partitions: IndexMap<String, ResolvedPartition>,
}

impl PartitionTable {
    /// Looks up `part` or `part:volume`.
    pub fn lookup(&self, reference: &str) -> Result<PartitionRange> {
        let (part_name, volume) = match reference.split_once(':') {
            Some((part, vol)) => (part, Some(vol)),
            None => (reference, None),
        };
        let part = self.partitions.get(part_name).ok_or_else(|| {
            ImageError::config(format!("Partition {} not exist in {} table", part_name, self.media_type))
        })?;
        let Some(volume) = volume else {
            return Ok(part.range);
        };
        if part.volume_kind.is_none() {
            return Err(ImageError::config(format!(
                "Partition {} has no volume table, cannot bind {}",
                part_name, reference
            )));
        }
        part.volumes.get(volume).copied().ok_or_else(|| {
            ImageError::config(format!("Volume {} not exist in partition {}", volume, part_name))
        })
    }
}

pub fn resolve_partitions(cfg: &ImageConfig) -> Result<PartitionTable> {
    let media_type = cfg.media_type()?;
    let table = cfg.media_table()?;
    let media_size = parse_bytes(&table.size)?;
    resolve_table(media_type, media_size, &table.partitions)
}

pub fn resolve_table(
    media_type: MediaType,
    media_size: u64,
    partitions: &IndexMap<String, PartitionConfig>,
) -> Result<PartitionTable> {
    if partitions.is_empty() {
        return Err(ImageError::config("Partition table is empty"));
    }

    let entries = partitions
        .iter()
        .map(|(name, part)| (name.as_str(), part.size.as_deref(), part.offset.as_deref()));
    let ranges = resolve_ranges(entries, PartitionRange { offset: 0, size: media_size }, media_type.as_str())?;

    let mut resolved = IndexMap::new();
    for ((name, part), range) in partitions.iter().zip(ranges) {
        if range.end() > media_size {
            return Err(ImageError::config(format!(
                "Partition {} ends at {:#x}, beyond media size {:#x}",
                name,
                range.end(),
                media_size
            )));
        }
        let (volume_kind, volume_table) = match (&part.ubi, &part.nftl) {
            (Some(ubi), _) => (Some(VolumeKind::Ubi), Some(ubi)),
            (None, Some(nftl)) => (Some(VolumeKind::Nftl), Some(nftl)),
            (None, None) => (None, None),
        };
        let volumes = match volume_table {
            Some(table) => resolve_volumes(name, range, table)?,
            None => IndexMap::new(),
        };
        debug!("Partition {:<16} offset {:#010x} size {:#x}", name, range.offset, range.size);
        resolved.insert(
            name.clone(),
            ResolvedPartition {
                range,
                volume_kind,
                volumes,
            },
        );
    }

    Ok(PartitionTable {
        media_type,
        media_size,
        partitions: resolved,
    })
}

fn resolve_volumes(
    part_name: &str,
    parent: PartitionRange,
    volumes: &IndexMap<String, VolumeConfig>,
) -> Result<IndexMap<String, PartitionRange>> {
    if volumes.is_empty() {
        return Err(ImageError::config(format!("Volume of {} is empty", part_name)));
    }
    let entries = volumes
        .iter()
        .map(|(name, vol)| (name.as_str(), vol.size.as_deref(), vol.offset.as_deref()));
    let ranges = resolve_ranges(entries, parent, part_name)?;

    let mut resolved = IndexMap::new();
    for (name, range) in volumes.keys().zip(ranges) {
        if range.end() > parent.end() {
            return Err(ImageError::config(format!(
                "Volume {}:{} exceeds its partition ({:#x} > {:#x})",
                part_name,
                name,
                range.end(),
                parent.end()
            )));
        }
        resolved.insert(name.clone(), range);
    }
    Ok(resolved)
}

/// Lays out entries in order inside `scope`. Explicit offsets are relative to
/// the scope start; "-" takes what is left of the scope.
fn resolve_ranges<'a>(
    entries: impl Iterator<Item = (&'a str, Option<&'a str>, Option<&'a str>)>,
    scope: PartitionRange,
    scope_name: &str,
) -> Result<Vec<PartitionRange>> {
    let mut ranges = Vec::new();
    let mut next_offset = scope.offset;
    let mut fill_entry: Option<&str> = None;

    for (name, size, offset) in entries {
        let size = size.ok_or_else(|| {
            ImageError::config(format!("No size value for partition: {}", name))
        })?;
        let offset = match offset {
            Some(offset) => scope.offset.checked_add(parse_bytes(offset)?).ok_or_else(|| {
                ImageError::config(format!("Offset of {} overflows in {}", name, scope_name))
            })?,
            None => next_offset,
        };
        let size = match parse_size(size)? {
            SizeExpr::Fixed(size) => size,
            SizeExpr::Fill => {
                if let Some(previous) = fill_entry {
                    return Err(ImageError::config(format!(
                        "Both {} and {} use '-' in {}, only one fill entry is allowed",
                        previous, name, scope_name
                    )));
                }
                fill_entry = Some(name);
                scope.end().checked_sub(offset).ok_or_else(|| {
                    ImageError::config(format!(
                        "No space left for {} in {} (offset {:#x})",
                        name, scope_name, offset
                    ))
                })?
            }
        };
        next_offset = offset.checked_add(size).ok_or_else(|| {
            ImageError::config(format!("Size of {} overflows in {}", name, scope_name))
        })?;
        ranges.push(PartitionRange { offset, size });
    }
    Ok(ranges)
}

/// Partition strings prepended to the U-Boot environment text.
pub fn partition_env_string(cfg: &ImageConfig) -> Result<String> {
    let media_type = cfg.media_type()?;
    let table = cfg.media_table()?;
    if table.partitions.is_empty() {
        return Err(ImageError::config("Partition table is empty"));
    }

    let item = |name: &str, size: Option<&str>, offset: Option<&str>| -> Result<String> {
        let size = size.ok_or_else(|| {
            ImageError::config(format!("No size value for partition: {}", name))
        })?;
        Ok(match offset {
            Some(offset) => format!("{}@{}({})", size, offset, name),
            None => format!("{}({})", size, name),
        })
    };

    let mut parts = Vec::new();
    let mut ubi = Vec::new();
    for (name, part) in &table.partitions {
        parts.push(item(name, part.size.as_deref(), part.offset.as_deref())?);
        if media_type == MediaType::Mmc {
            continue;
        }
        if let Some(volumes) = &part.ubi {
            if volumes.is_empty() {
                return Err(ImageError::config(format!("Volume of {} is empty", name)));
            }
            let vols = volumes
                .iter()
                .map(|(vol, cfg)| item(vol, cfg.size.as_deref(), cfg.offset.as_deref()))
                .collect::<Result<Vec<_>>>()?;
            ubi.push(format!("{}:{}", name, vols.join(",")));
        }
    }

    let parts = parts.join(",");
    Ok(match media_type {
        MediaType::SpiNand | MediaType::SpiNor => {
            let mut env = format!(
                "MTD=spi{}.0:{}\n",
                cfg.image.info.media.device_id()?,
                parts
            );
            if !ubi.is_empty() {
                env.push_str(&format!("UBI={}\n", ubi.join(";")));
            }
            env
        }
        MediaType::Mmc => format!("GPT={}\nparts_mmc={}\n", parts, parts),
    })
}
