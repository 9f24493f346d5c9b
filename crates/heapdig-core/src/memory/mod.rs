//! Access to the raw bytes of a captured process image.
//!
//! The scanning engine never touches memory directly. Everything goes
//! through the [`MemoryProvider`] trait, which mirrors what a debugger
//! target can offer: a list of mapped regions, a byte reader, the address
//! width and the byte order of the snapshot.
//!
//! [`ProcessImage`] is the bundled implementation, backed by region dumps
//! held in memory (and loadable from a dump directory).

mod image;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use image::{ImageRegion, ProcessImage, MANIFEST_FILE, REGIONS_DIR};

/// A byte offset in the snapshotted address space
pub type Address = u64;

/// Width of a machine word in the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AddressWidth {
    /// 32-bit process
    Four,
    /// 64-bit process
    Eight,
}

impl AddressWidth {
    /// Number of bytes in one word
    pub fn bytes(self) -> u64 {
        match self {
            AddressWidth::Four => 4,
            AddressWidth::Eight => 8,
        }
    }
}

impl TryFrom<u8> for AddressWidth {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(AddressWidth::Four),
            8 => Ok(AddressWidth::Eight),
            _ => Err(Error::invalid_target(format!(
                "unsupported address width: {}",
                value
            ))),
        }
    }
}

impl From<AddressWidth> for u8 {
    fn from(width: AddressWidth) -> u8 {
        width.bytes() as u8
    }
}

/// Byte order of multi-byte values in the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

impl ByteOrder {
    /// Byte order of the machine running this code
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Decode an unsigned integer of 1..=8 bytes
    pub fn decode(self, bytes: &[u8]) -> u64 {
        let iter = bytes.iter().map(|&b| b as u64);
        match self {
            ByteOrder::Little => iter.rev().fold(0, |acc, b| (acc << 8) | b),
            ByteOrder::Big => iter.fold(0, |acc, b| (acc << 8) | b),
        }
    }

    /// Encode the low `out.len()` bytes of `value`
    pub fn encode(self, value: u64, out: &mut [u8]) {
        let len = out.len();
        for (i, byte) in out.iter_mut().enumerate() {
            let shift = match self {
                ByteOrder::Little => i * 8,
                ByteOrder::Big => (len - 1 - i) * 8,
            };
            *byte = (value >> shift) as u8;
        }
    }
}

/// A contiguous mapped range of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First address of the region
    pub base: Address,
    /// Length of the region in bytes
    pub len: u64,
}

impl Region {
    /// Creates a new region
    pub fn new(base: Address, len: u64) -> Self {
        Self { base, len }
    }

    /// One past the last address of the region
    pub fn end(&self) -> Address {
        self.base.saturating_add(self.len)
    }

    /// Returns true if `address` lies inside the region
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Stable identity of a process image.
///
/// Derived state (histograms, reference indices) is only valid for the
/// image it was computed from; sessions compare identities to decide
/// when to throw that state away.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageId(String);

impl ImageId {
    /// Creates an identity from an arbitrary string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of raw bytes for a snapshotted address space.
pub trait MemoryProvider {
    /// Writable regions, in ascending address order
    fn writable_regions(&self) -> Vec<Region>;

    /// Fill `buf` with the bytes starting at `address`
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()>;

    /// Word size of the snapshot
    fn address_width(&self) -> AddressWidth;

    /// Byte order of the snapshot
    fn byte_order(&self) -> ByteOrder;

    /// Identity of the image these bytes come from
    fn identity(&self) -> ImageId;

    /// Read one machine word
    fn read_word(&self, address: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        let len = self.address_width().bytes() as usize;
        self.read_bytes(address, &mut buf[..len])?;
        Ok(self.byte_order().decode(&buf[..len]))
    }

    /// Read a 32-bit value
    fn read_u32(&self, address: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(self.byte_order().decode(&buf) as u32)
    }

    /// Read a 16-bit value
    fn read_u16(&self, address: Address) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(self.byte_order().decode(&buf) as u16)
    }

    /// Read a single byte
    fn read_u8(&self, address: Address) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_decode() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(ByteOrder::Little.decode(&bytes), 0x0403_0201);
        assert_eq!(ByteOrder::Big.decode(&bytes), 0x0102_0304);
    }

    #[test]
    fn test_byte_order_encode() {
        let mut out = [0u8; 4];
        ByteOrder::Big.encode(0xdead_beef, &mut out);
        assert_eq!(out, [0xde, 0xad, 0xbe, 0xef]);
        ByteOrder::Little.encode(0xdead_beef, &mut out);
        assert_eq!(out, [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_address_width_conversion() {
        assert_eq!(AddressWidth::try_from(8).unwrap(), AddressWidth::Eight);
        assert_eq!(AddressWidth::try_from(4).unwrap().bytes(), 4);
        assert!(AddressWidth::try_from(2).is_err());
    }

    #[test]
    fn test_region_bounds() {
        let region = Region::new(0x1000, 0x100);
        assert!(region.contains(0x1000));
        assert!(region.contains(0x10ff));
        assert!(!region.contains(0x1100));
        assert_eq!(region.end(), 0x1100);
    }
}
