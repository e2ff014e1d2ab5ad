// Licensed under the Apache-2.0 license

//! Redundant SPL page index written in front of the SPL on SPI-NAND.
//!
//! Entry `i` names page `i` and its backup copy `PAGE_TABLE_MAX_ENTRY + i`;
//! page numbers are 1-based because page 0 holds the table itself.

use aic_image::{
    page_checksum, PageTable, PageTableEntry, PageTableHead, FW_DATA_ALIGN,
    PAGE_TABLE_CHECKSUM_OFFSET, PAGE_TABLE_MAGIC, PAGE_TABLE_MAX_ENTRY,
};
use zerocopy::IntoBytes;

use crate::error::{ImageError, Result};
use crate::size::round_up;

/// Bytes of page `addr` (1-based), zero length past the end of the SPL.
fn page(spl: &[u8], addr: usize, page_size: usize) -> &[u8] {
    let start = ((addr - 1) * page_size).min(spl.len());
    let end = (start + page_size).min(spl.len());
    &spl[start..end]
}

/// Builds the one-page table for `spl` on a NAND with `page_size` byte pages.
pub fn build_page_table(spl: &[u8], page_size: usize) -> Result<Vec<u8>> {
    if page_size < std::mem::size_of::<PageTable>() || page_size > u16::MAX as usize {
        return Err(ImageError::config(format!(
            "Unsupported NAND page size {}",
            page_size
        )));
    }
    let page_cnt = round_up(spl.len(), FW_DATA_ALIGN) / page_size;
    let last_page = page_cnt + 1;
    if last_page > 2 * PAGE_TABLE_MAX_ENTRY {
        return Err(ImageError::ComponentTooLarge(
            "SPL".to_string(),
            format!("{} pages, the page table holds {}", page_cnt, 2 * PAGE_TABLE_MAX_ENTRY - 2),
        ));
    }

    let mut table = PageTable {
        head: PageTableHead {
            magic: PAGE_TABLE_MAGIC,
            entry_cnt: (last_page as u32).into(),
            page_size: (page_size as u16).into(),
            pad: [0xFF; 10],
        },
        entries: [PageTableEntry::UNUSED; PAGE_TABLE_MAX_ENTRY],
    };

    for (i, entry) in table.entries.iter_mut().enumerate() {
        if i == 0 {
            entry.pageaddr1 = 0u32.into();
            entry.checksum1 = 0u32.into();
        } else {
            if i <= last_page {
                entry.pageaddr1 = (i as u32).into();
            }
            entry.checksum1 = page_checksum(page(spl, i, page_size)).into();
        }

        let backup = PAGE_TABLE_MAX_ENTRY + i;
        if backup <= last_page {
            entry.pageaddr2 = (backup as u32).into();
            entry.checksum2 = page_checksum(page(spl, backup, page_size)).into();
        }
    }

    let mut bytes = table.as_bytes().to_vec();
    bytes.resize(page_size, 0xFF);
    let checksum = page_checksum(&bytes);
    bytes[PAGE_TABLE_CHECKSUM_OFFSET..PAGE_TABLE_CHECKSUM_OFFSET + 4]
        .copy_from_slice(&checksum.to_le_bytes());
    Ok(bytes)
}
