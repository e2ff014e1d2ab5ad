// Licensed under the Apache-2.0 license

//! Typed view of the image configuration file.
//!
//! The file is JSON with two relaxations: `//` comments (whole-line or
//! trailing) and trailing commas before `}` or `]`. Maps are kept in
//! declaration order because partition and component order decide the layout.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{ImageError, Result};
use crate::size::{parse_bytes, parse_hex_u32, parse_kib};

pub const DEFAULT_BOOTCFG_NAME: &str = "bootcfg.txt";
pub const DEFAULT_PART_TABLE_NAME: &str = "image_part_table.bin";

pub fn load_config(path: &Path) -> Result<ImageConfig> {
    let text = std::fs::read_to_string(path).map_err(ImageError::file(path))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<ImageConfig> {
    Ok(serde_json::from_str(&normalize_json(text))?)
}

/// Strips `//` comments and trailing commas so the text is plain JSON.
pub fn normalize_json(text: &str) -> String {
    let mut json = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("//") {
            continue;
        }
        match line.find("//") {
            Some(start) if start > 0 => json.push_str(line[..start].trim()),
            _ => json.push_str(line),
        }
    }
    json.replace(",}", "}").replace(",]", "]")
}

/// A JSON value written either as a string or as a bare number.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Num(u64),
}

impl Scalar {
    pub fn as_u32(&self) -> Result<u32> {
        match self {
            Scalar::Num(n) => u32::try_from(*n)
                .map_err(|_| ImageError::config(format!("Value {} does not fit in 32 bits", n))),
            Scalar::Str(s) if s.starts_with("0x") || s.starts_with("0X") => parse_hex_u32(s),
            Scalar::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| ImageError::config(format!("Invalid number: '{}'", s))),
        }
    }

    pub fn as_bytes(&self) -> Result<u64> {
        match self {
            Scalar::Num(n) => Ok(*n),
            Scalar::Str(s) => parse_bytes(s),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scalar::Str(s) => write!(f, "{}", s),
            Scalar::Num(n) => write!(f, "{}", n),
        }
    }
}

/// A string or a list of strings, e.g. `"attr": "required"` or `"attr": ["block", "required"]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn items(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => s.split(';').map(str::trim).collect(),
            OneOrMany::Many(v) => v.iter().map(|s| s.trim()).collect(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.items().into_iter().find(|s| !s.is_empty())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.items().iter().any(|item| *item == tag)
    }

    pub fn joined(&self) -> String {
        match self {
            OneOrMany::One(s) => s.clone(),
            OneOrMany::Many(v) => v.join(";"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    SpiNand,
    SpiNor,
    Mmc,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::SpiNand => "spi-nand",
            MediaType::SpiNor => "spi-nor",
            MediaType::Mmc => "mmc",
        }
    }
}

impl FromStr for MediaType {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spi-nand" => Ok(MediaType::SpiNand),
            "spi-nor" => Ok(MediaType::SpiNor),
            "mmc" => Ok(MediaType::Mmc),
            _ => Err(ImageError::config(format!("Not supported media type: {}", s))),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub image: ImageSection,
    #[serde(rename = "spi-nand")]
    pub spi_nand: Option<MediaTable>,
    #[serde(rename = "spi-nor")]
    pub spi_nor: Option<MediaTable>,
    pub mmc: Option<MediaTable>,
    #[serde(rename = "pre-process", alias = "temporary")]
    pub pre_process: Option<PreProcessConfig>,
}

impl ImageConfig {
    pub fn media_type(&self) -> Result<MediaType> {
        self.image.info.media.media_type.parse()
    }

    /// Partition table of the media named in `image.info.media.type`.
    pub fn media_table(&self) -> Result<&MediaTable> {
        let media_type = self.media_type()?;
        let table = match media_type {
            MediaType::SpiNand => self.spi_nand.as_ref(),
            MediaType::SpiNor => self.spi_nor.as_ref(),
            MediaType::Mmc => self.mmc.as_ref(),
        };
        table.ok_or_else(|| {
            ImageError::config(format!("Cannot find partitions for {}", media_type))
        })
    }

    /// Image file name: `<platform>_<product>_v<version>[_c<anti-rollback>].img`.
    pub fn image_file_name(&self) -> String {
        let info = &self.image.info;
        let mut name = format!("{}_{}_v{}", info.platform, info.product, info.version);
        if let Some(counter) = &info.anti_rollback {
            name.push_str(&format!("_c{}", counter));
        }
        name.push_str(".img");
        name.replace(' ', "_")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSection {
    pub info: ImageInfo,
    #[serde(default)]
    pub updater: IndexMap<String, ComponentConfig>,
    #[serde(default)]
    pub target: IndexMap<String, ComponentConfig>,
    #[serde(default)]
    pub extension: IndexMap<String, ComponentConfig>,
    #[serde(skip_deserializing, default = "default_bootcfg_name")]
    pub bootcfg: String,
    #[serde(skip_deserializing, default = "default_part_table_name")]
    pub part_table: String,
}

fn default_bootcfg_name() -> String {
    DEFAULT_BOOTCFG_NAME.to_string()
}

fn default_part_table_name() -> String {
    DEFAULT_PART_TABLE_NAME.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub platform: String,
    pub product: String,
    pub version: Scalar,
    #[serde(rename = "anti-rollback")]
    pub anti_rollback: Option<Scalar>,
    pub media: MediaInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    #[serde(rename = "type")]
    pub media_type: String,
    pub device_id: Option<Scalar>,
    pub array_organization: Option<Vec<ArrayOrganization>>,
}

impl MediaInfo {
    pub fn device_id(&self) -> Result<u32> {
        self.device_id.as_ref().map_or(Ok(0), Scalar::as_u32)
    }

    /// Header string for the NAND geometry list, e.g. "P=2K,B=128K;P=4K,B=256K".
    pub fn array_org_string(&self) -> String {
        self.array_organization
            .iter()
            .flatten()
            .map(|org| format!("P={},B={}", org.page.to_uppercase(), org.block.to_uppercase()))
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ArrayOrganization {
    pub page: String,
    pub block: String,
}

fn geometry_bytes(value: &str, what: &str) -> Result<usize> {
    match parse_kib(value)? {
        0 => Err(ImageError::config(format!(
            "NAND {} size must not be zero: '{}'",
            what, value
        ))),
        kib => Ok(kib as usize * 1024),
    }
}

impl ArrayOrganization {
    pub fn page_bytes(&self) -> Result<usize> {
        geometry_bytes(&self.page, "page")
    }

    pub fn block_bytes(&self) -> Result<usize> {
        geometry_bytes(&self.block, "block")
    }

    /// Variant suffix, e.g. "_page_2k_block_128k".
    pub fn param_string(&self) -> String {
        format!("_page_{}_block_{}", self.page, self.block).to_lowercase()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub file: String,
    pub attr: OneOrMany,
    pub part: Option<OneOrMany>,
    pub ram: Option<String>,
}

impl ComponentConfig {
    pub fn is_required(&self) -> bool {
        self.attr.contains("required")
    }

    pub fn is_ubi(&self) -> bool {
        self.attr.contains("ubi")
    }

    /// Attribute string as stored in the meta record.
    pub fn attr_string(&self) -> String {
        self.attr.joined().replace(' ', "")
    }

    pub fn part_string(&self) -> String {
        self.part.as_ref().map(OneOrMany::joined).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaTable {
    pub size: String,
    #[serde(default)]
    pub partitions: IndexMap<String, PartitionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionConfig {
    pub size: Option<String>,
    pub offset: Option<String>,
    pub ubi: Option<IndexMap<String, VolumeConfig>>,
    pub nftl: Option<IndexMap<String, VolumeConfig>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub size: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreProcessConfig {
    #[serde(default)]
    pub hash_table: IndexMap<String, HashTableConfig>,
    #[serde(default)]
    pub itb: IndexMap<String, ItbConfig>,
    #[serde(default)]
    pub uboot_env: IndexMap<String, UbootEnvConfig>,
    #[serde(default)]
    pub aicboot: IndexMap<String, BootImageConfig>,
    #[serde(default)]
    pub aicimage: IndexMap<String, BootImageConfig>,
    #[serde(default)]
    pub spienc: IndexMap<String, SpiencConfig>,
    #[serde(default)]
    pub concatenate: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub extension: IndexMap<String, ExtensionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashTableConfig {
    pub file: String,
    pub dtb: String,
    pub datasize: Option<Scalar>,
    pub hashsize: Option<Scalar>,
    #[serde(rename = "priv")]
    pub private_key: Option<String>,
    pub cert: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItbConfig {
    pub its: String,
    pub dtb: Option<String>,
    pub keydir: Option<String>,
    pub bin: Option<ItbBinConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItbBinConfig {
    pub src: String,
    pub dst: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UbootEnvConfig {
    pub file: String,
    pub size: Scalar,
    pub redundant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpiencConfig {
    pub file: String,
    pub key: String,
    pub nonce: Option<String>,
    pub tweak: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionConfig {
    #[serde(default)]
    pub exfiles: Vec<String>,
    #[serde(default)]
    pub exdirs: Vec<String>,
}

/// Description of one boot ROM image, as found under `aicboot`/`aicimage`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootImageConfig {
    pub head_ver: Option<String>,
    #[serde(rename = "anti-rollback counter")]
    pub anti_rollback: Option<Scalar>,
    pub loader: Option<LoaderConfig>,
    pub resource: Option<ResourceConfig>,
    pub encryption: Option<EncryptionConfig>,
    pub signature: Option<SignatureConfig>,
    pub with_ext: Option<String>,
    pub ssk_derived_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoaderConfig {
    pub file: Option<String>,
    #[serde(rename = "load address")]
    pub load_address: Option<String>,
    #[serde(rename = "entry point")]
    pub entry_point: Option<String>,
    #[serde(rename = "load address ext")]
    pub load_address_ext: Option<String>,
    #[serde(rename = "entry point ext")]
    pub entry_point_ext: Option<String>,
    #[serde(rename = "run in dram")]
    pub run_in_dram: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceConfig {
    pub private: Option<String>,
    pub pubkey: Option<String>,
    pub pbp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub algo: String,
    pub key: Option<String>,
    pub iv: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignatureConfig {
    pub algo: String,
    pub privkey: Option<String>,
}

/// Parses a "TRUE"/"FALSE" flag, case-insensitively.
pub fn flag_value(value: Option<&str>) -> Option<bool> {
    match value.map(|v| v.trim().to_ascii_uppercase()) {
        Some(v) if v == "TRUE" => Some(true),
        Some(v) if v == "FALSE" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
{
    // Top level comment
    "spi-nand": {
        "size": "128m", // Size of SPI NAND
        "partitions": {
            "spl":    { "size": "1m" },
            "uboot":  { "size": "1m" },
            "ubiroot": {
                "size": "-",
                "ubi": {
                    "rootfs": { "size": "16m" },
                    "user":   { "size": "-" },
                },
            },
        },
    },
    "image": {
        "info": {
            "platform": "d211",
            "product": "demo board",
            "version": "1.0.0",
            "media": {
                "type": "spi-nand",
                "device_id": 0,
                "array_organization": [
                    { "page": "2k", "block": "128k" },
                    { "page": "4k", "block": "256k" },
                ],
            }
        },
        "updater": {
            "spl": { "file": "bootloader.aic", "attr": ["required", "run"], "ram": "0x00103100" },
        },
        "target": {
            "spl":    { "file": "bootloader.aic", "attr": ["block", "required"], "part": ["spl"] },
            "rootfs": { "file": "rootfs*.ubifs", "attr": ["ubi", "optional"], "part": ["ubiroot:rootfs"] },
        },
    },
    "temporary": {
        "aicimage": {
            "bootloader.aic": {
                "head_ver": "0x00010001",
                "loader": { "file": "u-boot-spl.bin", "load address": "0x103100" },
            },
        },
    },
}
"#;

    #[test]
    fn test_normalize_strips_comments_and_commas() {
        let json = normalize_json("{\n// c\n\"a\": [1, 2,], // t\n\"b\": {\"c\": 1,},\n}");
        assert_eq!(json, r#"{"a": [1, 2],"b": {"c": 1}}"#);
    }

    #[test]
    fn test_parse_sample_config() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.media_type().unwrap(), MediaType::SpiNand);
        let table = cfg.media_table().unwrap();
        let names: Vec<_> = table.partitions.keys().cloned().collect();
        assert_eq!(names, ["spl", "uboot", "ubiroot"]);
        let target: Vec<_> = cfg.image.target.keys().cloned().collect();
        assert_eq!(target, ["spl", "rootfs"]);
        assert!(cfg.image.target["spl"].is_required());
        assert!(cfg.image.target["rootfs"].is_ubi());
        assert!(!cfg.image.target["rootfs"].is_required());
        assert_eq!(cfg.image.info.media.array_org_string(), "P=2K,B=128K;P=4K,B=256K");
        assert_eq!(cfg.image.bootcfg, DEFAULT_BOOTCFG_NAME);
        assert_eq!(cfg.image.part_table, DEFAULT_PART_TABLE_NAME);
        let pre = cfg.pre_process.unwrap();
        assert_eq!(pre.aicimage.len(), 1);
    }

    #[test]
    fn test_image_file_name() {
        let mut cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.image_file_name(), "d211_demo_board_v1.0.0.img");
        cfg.image.info.anti_rollback = Some(Scalar::Num(3));
        assert_eq!(cfg.image_file_name(), "d211_demo_board_v1.0.0_c3.img");
    }

    #[test]
    fn test_unsupported_media_type() {
        let cfg = parse_config(&SAMPLE.replace("\"type\": \"spi-nand\"", "\"type\": \"sd\"")).unwrap();
        assert!(matches!(cfg.media_type(), Err(ImageError::Config(_))));
    }

    #[test]
    fn test_zero_nand_geometry_rejected() {
        let org = |page: &str, block: &str| ArrayOrganization {
            page: page.to_string(),
            block: block.to_string(),
        };
        assert_eq!(org("2k", "128k").page_bytes().unwrap(), 2048);
        assert_eq!(org("2k", "128k").block_bytes().unwrap(), 128 * 1024);
        assert!(matches!(org("0k", "128k").page_bytes(), Err(ImageError::Config(_))));
        assert!(matches!(org("2k", "0k").block_bytes(), Err(ImageError::Config(_))));
    }

    #[test]
    fn test_flag_value() {
        assert_eq!(flag_value(Some("true")), Some(true));
        assert_eq!(flag_value(Some("FALSE")), Some(false));
        assert_eq!(flag_value(Some("maybe")), None);
        assert_eq!(flag_value(None), None);
    }
}
