// Licensed under the Apache-2.0 license
#![no_std]

//! On-disk layouts shared by the boot ROM image and the firmware container.
//!
//! All multi-byte integers are little-endian. The structures only describe the
//! fixed-size parts of each format; padding up to the area size is the job of
//! the builder.

use core::mem::offset_of;

use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;

pub const BOOT_IMAGE_MAGIC: [u8; 4] = *b"AIC ";
pub const BOOT_HEADER_VERSION: u32 = 0x0001_0001;
pub const BOOT_HEADER_SIZE: usize = 256;
pub const BOOT_LOADER_ALIGN: usize = 256;
pub const BOOT_RESOURCE_ALIGN: usize = 32;
pub const BOOT_MAX_LOADER_SIZE: usize = 4 * 1024 * 1024;
/// External loaders start on this boundary after the first image.
pub const EXT_LOADER_ALIGN: usize = 512;
/// Fixed key-material block encrypted under the SSK to obtain the HSK.
pub const SSK_KEY_MATERIAL: &[u8; 16] = b"0123456789abcdef";

pub const SIGN_ALGO_MD5: u32 = 0;
pub const SIGN_ALGO_RSA2048: u32 = 1;
pub const SIGN_ALGO_SM2: u32 = 2;

pub const ENC_ALGO_NONE: u32 = 0;
pub const ENC_ALGO_AES128_CBC: u32 = 1;
pub const ENC_ALGO_SM4_ECB: u32 = 2;

pub const MD5_TRAILER_LEN: usize = 16;
pub const RSA2048_SIGNATURE_LEN: usize = 256;
pub const SM2_SIGNATURE_LEN: usize = 64;
pub const IV_LEN: usize = 16;

pub const FW_IMAGE_MAGIC: &[u8] = b"AIC.FW";
pub const FW_HEADER_AREA_SIZE: usize = 2048;
/// Every component slot in the file area is rounded to this size.
pub const FW_DATA_ALIGN: usize = 2048;
pub const META_MAGIC: &[u8] = b"META";
pub const META_RECORD_SIZE: usize = 256;

pub const PAGE_TABLE_MAGIC: [u8; 4] = *b"AICP";
pub const PAGE_TABLE_MAX_ENTRY: usize = 101;
pub const UNUSED_SENTINEL: u32 = 0xFFFF_FFFF;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BootHeader {
    pub magic: [u8; 4],
    pub checksum: Le32,
    pub header_ver: Le32,
    pub img_len: Le32,
    /// Anti-rollback counter.
    pub fw_ver: Le32,
    pub loader_length: Le32,
    pub load_address: Le32,
    pub entry_point: Le32,
    pub sign_algo: Le32,
    pub enc_algo: Le32,
    pub sign_offset: Le32,
    pub sign_length: Le32,
    pub sign_key_offset: Le32,
    pub sign_key_length: Le32,
    pub iv_offset: Le32,
    pub iv_length: Le32,
    pub priv_offset: Le32,
    pub priv_length: Le32,
    pub pbp_offset: Le32,
    pub pbp_length: Le32,
    pub loader_ext_offset: Le32,
    pub reserved: [u8; 172],
}

pub const BOOT_CHECKSUM_OFFSET: usize = offset_of!(BootHeader, checksum);

impl Default for BootHeader {
    fn default() -> Self {
        let mut header = Self::new_zeroed();
        header.magic = BOOT_IMAGE_MAGIC;
        header.header_ver = BOOT_HEADER_VERSION.into();
        header
    }
}

impl BootHeader {
    pub fn verify(&self, image_len: usize) -> bool {
        if self.magic != BOOT_IMAGE_MAGIC {
            return false;
        }
        if self.img_len.get() as usize > image_len {
            return false;
        }
        let sign_end = self.sign_offset.get() as usize + self.sign_length.get() as usize;
        sign_end == self.img_len.get() as usize
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FwHeader {
    pub magic: [u8; 8],
    pub platform: [u8; 64],
    pub product: [u8; 64],
    pub version: [u8; 64],
    pub media_type: [u8; 64],
    pub media_dev_id: Le32,
    /// NAND array organization, e.g. "P=2K,B=128K;P=4K,B=256K".
    pub nand_array_org: [u8; 64],
    pub meta_offset: Le32,
    pub meta_size: Le32,
    pub file_offset: Le32,
    pub file_size: Le32,
    pub ex_flag: Le32,
    pub ex_offset: Le32,
    pub ex_size: Le32,
}

impl FwHeader {
    pub fn verify(&self) -> bool {
        if &self.magic[..FW_IMAGE_MAGIC.len()] != FW_IMAGE_MAGIC {
            return false;
        }
        if self.meta_offset.get() as usize != FW_HEADER_AREA_SIZE {
            return false;
        }
        self.meta_size.get() as usize % META_RECORD_SIZE == 0
            && self.file_offset.get() == self.meta_offset.get() + self.meta_size.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaRecord {
    pub magic: [u8; 8],
    pub name: [u8; 64],
    pub partition: [u8; 64],
    pub offset: Le32,
    pub size: Le32,
    pub crc: Le32,
    pub ram: Le32,
    pub attr: [u8; 40],
    pub filename: [u8; 64],
}

impl MetaRecord {
    pub fn verify(&self) -> bool {
        &self.magic[..META_MAGIC.len()] == META_MAGIC
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageTableHead {
    pub magic: [u8; 4],
    pub entry_cnt: Le32,
    pub page_size: Le16,
    pub pad: [u8; 10],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageTableEntry {
    pub pageaddr1: Le32,
    pub pageaddr2: Le32,
    pub checksum2: Le32,
    pub reserved: Le32,
    pub checksum1: Le32,
}

impl PageTableEntry {
    pub const UNUSED: PageTableEntry = PageTableEntry {
        pageaddr1: Le32::from_bytes(UNUSED_SENTINEL.to_le_bytes()),
        pageaddr2: Le32::from_bytes(UNUSED_SENTINEL.to_le_bytes()),
        checksum2: Le32::from_bytes(UNUSED_SENTINEL.to_le_bytes()),
        reserved: Le32::from_bytes(UNUSED_SENTINEL.to_le_bytes()),
        checksum1: Le32::from_bytes(UNUSED_SENTINEL.to_le_bytes()),
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageTable {
    pub head: PageTableHead,
    pub entries: [PageTableEntry; PAGE_TABLE_MAX_ENTRY],
}

/// Byte offset of the page-level checksum inside the serialized table.
pub const PAGE_TABLE_CHECKSUM_OFFSET: usize =
    offset_of!(PageTable, entries) + offset_of!(PageTableEntry, checksum1);

/// One record of the burner side-car partition table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BurnerBlockRecord {
    pub start_block: Le32,
    pub last_block: Le32,
    pub used_blocks: Le32,
    pub sentinel: Le32,
}

/// Sum of little-endian 32-bit words. A trailing partial word is zero padded.
pub fn word_sum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |acc, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        acc.wrapping_add(u32::from_le_bytes(word))
    })
}

/// Value that, stored in a zeroed word slot of `data`, brings the word sum to zero.
pub fn word_checksum(data: &[u8]) -> u32 {
    0u32.wrapping_sub(word_sum(data))
}

/// Complemented word sum used by the NAND page table.
pub fn page_checksum(data: &[u8]) -> u32 {
    !word_sum(data)
}

/// Copies `bytes` into a zero-padded fixed-width field, truncating if needed.
pub fn bytes_field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut field = [0u8; N];
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

pub fn str_field<const N: usize>(s: &str) -> [u8; N] {
    bytes_field(s.as_bytes())
}

/// Reads a zero-padded string field, stopping at the first NUL.
pub fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}
