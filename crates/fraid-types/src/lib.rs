#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of parity levels (P, Q, R, S, T, U).
pub const LEV_MAX: usize = 6;

/// Size of a block digest in bytes.
pub const HASH_SIZE: usize = 16;

/// Default block size: 256 KiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 256 * 1024;

/// Logical block position, shared across all data disks and parity files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

impl BlockIndex {
    pub const ZERO: Self = Self(0);

    /// Next index, saturating at `u32::MAX`.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Validated block size (power of two in 4 KiB..=16 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in the valid range.
    pub fn new(value: u32) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(4 * 1024..=16 * 1024 * 1024).contains(&value) {
            return Err(TypeError::InvalidBlockSize(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of block `i` in a parity file or data file.
    #[must_use]
    pub fn block_to_byte(self, i: BlockIndex) -> u64 {
        u64::from(i.0) * u64::from(self.0)
    }

    /// Number of whole blocks contained in `bytes`.
    #[must_use]
    pub fn bytes_to_blocks(self, bytes: u64) -> u32 {
        u32::try_from(bytes / u64::from(self.0)).unwrap_or(u32::MAX)
    }

    /// Number of blocks needed to cover a file of `bytes` bytes.
    #[must_use]
    pub fn blocks_for_file(self, bytes: u64) -> u32 {
        u32::try_from(bytes.div_ceil(u64::from(self.0))).unwrap_or(u32::MAX)
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

/// A parity level, 0-based (level 0 is "parity", level 1 is "2-parity", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParityLevel(u8);

impl ParityLevel {
    pub fn new(level: u8) -> Result<Self, TypeError> {
        if usize::from(level) >= LEV_MAX {
            return Err(TypeError::InvalidParityLevel(level));
        }
        Ok(Self(level))
    }

    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Conventional level name used in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "parity",
            1 => "2-parity",
            2 => "3-parity",
            3 => "4-parity",
            4 => "5-parity",
            _ => "6-parity",
        }
    }

    /// All levels below `count`.
    pub fn up_to(count: usize) -> impl Iterator<Item = Self> {
        (0_u8..).take(count.min(LEV_MAX)).map(Self)
    }
}

impl fmt::Display for ParityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A 128-bit block digest. The all-zero value is the "no hash" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    pub const ZERO: Self = Self([0; HASH_SIZE]);

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    /// True when the digest carries an actual value.
    #[must_use]
    pub fn is_real(self) -> bool {
        !self.is_zero()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid block size {0}: must be a power of two in 4 KiB..=16 MiB")]
    InvalidBlockSize(u32),
    #[error("invalid parity level {0}: at most {LEV_MAX} levels are supported")]
    InvalidParityLevel(u8),
}

// ── LE codec helpers ────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], DecodeError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(DecodeError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(DecodeError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(256 * 1024).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(1000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(32 * 1024 * 1024).is_err());
    }

    #[test]
    fn block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.block_to_byte(BlockIndex(3)), 12288);
        assert_eq!(bs.bytes_to_blocks(12288), 3);
        assert_eq!(bs.bytes_to_blocks(12289), 3);
        assert_eq!(bs.blocks_for_file(12289), 4);
        assert_eq!(bs.blocks_for_file(0), 0);
        assert_eq!(bs.blocks_for_file(1), 1);
    }

    #[test]
    fn parity_level_names() {
        assert_eq!(ParityLevel::new(0).unwrap().name(), "parity");
        assert_eq!(ParityLevel::new(1).unwrap().name(), "2-parity");
        assert_eq!(ParityLevel::new(5).unwrap().name(), "6-parity");
        assert!(ParityLevel::new(6).is_err());
    }

    #[test]
    fn hash_zero_sentinel() {
        assert!(BlockHash::ZERO.is_zero());
        assert!(!BlockHash::ZERO.is_real());
        let mut h = BlockHash::ZERO;
        h.0[5] = 1;
        assert!(h.is_real());
    }

    #[test]
    fn le_helpers() {
        let data = [1_u8, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(read_le_u32(&data, 0).unwrap(), 1);
        assert_eq!(read_le_u64(&data, 4).unwrap(), 2);
        assert!(read_le_u64(&data, 8).is_err());
        assert_eq!(read_fixed::<4>(&data, 4).unwrap(), [2, 0, 0, 0]);
    }
}
