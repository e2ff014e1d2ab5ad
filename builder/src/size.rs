// Licensed under the Apache-2.0 license

use crate::error::{ImageError, Result};

/// A partition or volume size as written in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeExpr {
    Fixed(u64),
    /// "-": take everything left in the enclosing range.
    Fill,
}

pub fn parse_size(expr: &str) -> Result<SizeExpr> {
    let expr = expr.trim();
    if expr == "-" {
        return Ok(SizeExpr::Fill);
    }
    parse_bytes(expr).map(SizeExpr::Fixed)
}

/// Parses "64k", "16M", "1g", "0x2000" or a plain decimal byte count.
pub fn parse_bytes(expr: &str) -> Result<u64> {
    let expr = expr.trim();
    let bad = || ImageError::config(format!("Invalid size value: '{}'", expr));

    if let Some(hex) = expr.strip_prefix("0x").or_else(|| expr.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| bad());
    }
    let lower = expr.to_ascii_lowercase();
    let shift = if lower.contains('k') {
        10
    } else if lower.contains('m') {
        20
    } else if lower.contains('g') {
        30
    } else {
        0
    };
    let digits: String = expr.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || (shift == 0 && digits.len() != expr.len()) {
        return Err(bad());
    }
    let value: u64 = digits.parse().map_err(|_| bad())?;
    value.checked_mul(1 << shift).ok_or_else(bad)
}

/// Parses a hex address; the "0x" prefix is optional.
pub fn parse_hex_u32(value: &str) -> Result<u32> {
    let value = value.trim();
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(hex, 16)
        .map_err(|_| ImageError::config(format!("Invalid hex value: '{}'", value)))
}

/// Page or block size given in KiB, e.g. "2k" or "128K".
pub fn parse_kib(value: &str) -> Result<u64> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .map_err(|_| ImageError::config(format!("Invalid NAND geometry value: '{}'", value)))
}

pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
