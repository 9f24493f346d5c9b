//! Brute-force memory scanning.
//!
//! The scanner walks every writable region of a [`MemoryProvider`] in
//! fixed-size blocks and hands each aligned word to a [`MemoryVisitor`].
//! It knows nothing about heap layouts; classifying candidates is the
//! visitor's job (see [`ObjectCollector`]).
//!
//! ## Algorithm Overview
//!
//! 1. Read the next block of `block_words` words starting at the cursor
//! 2. Decode the word at the cursor with the snapshot's byte order
//! 3. Ask the visitor how far to move on (0 abandons the region)
//! 4. Reload a block whenever the cursor leaves the current one
//!
//! A failed block read abandons the rest of that region only.
//!
//! ## Extensibility
//!
//! ```
//! use heapdig_core::scanner::MemoryVisitor;
//!
//! struct CountSmis(u64);
//!
//! impl MemoryVisitor for CountSmis {
//!     fn visit(&mut self, _address: u64, word: u64) -> u64 {
//!         if word & 1 == 0 {
//!             self.0 += 1;
//!         }
//!         8
//!     }
//! }
//! ```

mod collect;

use crate::error::{Error, Result};
use crate::histogram::DEFAULT_PREVIEW_PROPERTIES;
use crate::memory::{Address, MemoryProvider};
use tracing::{debug, trace, warn};

pub use collect::{ContextSet, HeapInventory, MapCache, MapInfo, ObjectCollector};

/// Default number of words read per block (8 MiB on 64-bit)
pub const DEFAULT_BLOCK_WORDS: u64 = 1024 * 1024;

/// Configuration for scanning and reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Words read from memory per block
    pub block_words: u64,
    /// Property names shown per detailed histogram bucket (0 = all)
    pub preview_properties: usize,
    /// Indentation per level of recursive reference output
    pub tree_padding: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            block_words: DEFAULT_BLOCK_WORDS,
            preview_properties: DEFAULT_PREVIEW_PROPERTIES,
            tree_padding: 2,
        }
    }
}

impl ScanConfig {
    /// Creates a new scan config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of words read per block
    pub fn block_words(mut self, words: u64) -> Self {
        self.block_words = words.max(1);
        self
    }

    /// Sets the number of property names shown per detailed bucket
    pub fn preview_properties(mut self, count: usize) -> Self {
        self.preview_properties = count;
        self
    }

    /// Sets the indentation per level of recursive output
    pub fn tree_padding(mut self, padding: usize) -> Self {
        self.tree_padding = padding;
        self
    }
}

/// Callback invoked once per scanned word
pub trait MemoryVisitor {
    /// Inspect `word`, read at `address`, and return how many bytes to
    /// advance. Returning 0 abandons the current region.
    fn visit(&mut self, address: Address, word: u64) -> u64;
}

/// Counters reported by [`scan_memory`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Regions entered
    pub regions_scanned: usize,
    /// Regions abandoned because a block could not be read
    pub regions_failed: usize,
    /// Regions abandoned because the visitor returned 0
    pub regions_aborted: usize,
    /// Words handed to the visitor
    pub words_visited: u64,
}

enum RegionOutcome {
    Done,
    ReadFailed,
    Aborted,
}

/// Walk every writable region and visit each word.
///
/// Fails only when the target has no writable memory at all.
pub fn scan_memory<M, V>(memory: &M, config: &ScanConfig, visitor: &mut V) -> Result<ScanStats>
where
    M: MemoryProvider + ?Sized,
    V: MemoryVisitor + ?Sized,
{
    let regions = memory.writable_regions();
    if regions.is_empty() {
        return Err(Error::invalid_target("no writable memory regions"));
    }

    let word = memory.address_width().bytes();
    let order = memory.byte_order();
    let block_size = config.block_words.max(1) * word;
    let mut block = Vec::new();
    let mut stats = ScanStats::default();

    debug!(
        "Starting scan of {} regions in blocks of {} bytes",
        regions.len(),
        block_size
    );

    for region in regions {
        stats.regions_scanned += 1;
        let end = region.end();
        let mut cursor = region.base;
        let mut block_start = cursor;
        let mut block_len = 0u64;

        let outcome = loop {
            match cursor.checked_add(word) {
                Some(next) if next <= end => {}
                _ => break RegionOutcome::Done,
            }

            if cursor < block_start || cursor + word > block_start + block_len {
                let len = (end - cursor).min(block_size);
                block.resize(len as usize, 0);
                if let Err(e) = memory.read_bytes(cursor, &mut block) {
                    warn!("Abandoning region 0x{:x}: {}", region.base, e);
                    break RegionOutcome::ReadFailed;
                }
                trace!("Loaded block 0x{:x} ({} bytes)", cursor, len);
                block_start = cursor;
                block_len = len;
            }

            let offset = (cursor - block_start) as usize;
            let value = order.decode(&block[offset..offset + word as usize]);
            stats.words_visited += 1;

            let stride = visitor.visit(cursor, value);
            if stride == 0 {
                break RegionOutcome::Aborted;
            }
            cursor = cursor.saturating_add(stride);
        };

        match outcome {
            RegionOutcome::Done => {}
            RegionOutcome::ReadFailed => stats.regions_failed += 1,
            RegionOutcome::Aborted => {
                trace!("Visitor abandoned region 0x{:x}", region.base);
                stats.regions_aborted += 1;
            }
        }
    }

    debug!(
        "Scan complete: {} words in {} regions",
        stats.words_visited, stats.regions_scanned
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressWidth, ByteOrder, ImageId, ImageRegion, ProcessImage, Region};
    use pretty_assertions::assert_eq;

    struct Recorder {
        seen: Vec<(Address, u64)>,
        stride: u64,
        abort_at: Option<Address>,
    }

    impl Recorder {
        fn new(stride: u64) -> Self {
            Self {
                seen: Vec::new(),
                stride,
                abort_at: None,
            }
        }
    }

    impl MemoryVisitor for Recorder {
        fn visit(&mut self, address: Address, word: u64) -> u64 {
            self.seen.push((address, word));
            if self.abort_at == Some(address) {
                return 0;
            }
            self.stride
        }
    }

    fn words_region(base: Address, words: &[u64], order: ByteOrder) -> ImageRegion {
        let mut data = vec![0u8; words.len() * 8];
        for (chunk, &w) in data.chunks_mut(8).zip(words) {
            order.encode(w, chunk);
        }
        ImageRegion::new(base, true, data)
    }

    #[test]
    fn test_visits_every_word_across_blocks() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![words_region(0x1000, &[1, 2, 3, 4, 5], ByteOrder::Little)],
        )
        .unwrap();

        let mut recorder = Recorder::new(8);
        let config = ScanConfig::new().block_words(2);
        let stats = scan_memory(&image, &config, &mut recorder).unwrap();

        let words: Vec<_> = recorder.seen.iter().map(|&(_, w)| w).collect();
        assert_eq!(words, vec![1, 2, 3, 4, 5]);
        assert_eq!(recorder.seen[4].0, 0x1020);
        assert_eq!(stats.words_visited, 5);
        assert_eq!(stats.regions_scanned, 1);
    }

    #[test]
    fn test_big_endian_snapshot() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Big,
            vec![words_region(0x1000, &[0xdead_beef], ByteOrder::Big)],
        )
        .unwrap();

        let mut recorder = Recorder::new(8);
        scan_memory(&image, &ScanConfig::new(), &mut recorder).unwrap();
        assert_eq!(recorder.seen, vec![(0x1000, 0xdead_beef)]);
    }

    #[test]
    fn test_stride_crossing_block_boundary() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![words_region(0x1000, &[10, 11, 12, 13, 14, 15, 16], ByteOrder::Little)],
        )
        .unwrap();

        let mut recorder = Recorder::new(24);
        scan_memory(&image, &ScanConfig::new().block_words(2), &mut recorder).unwrap();
        let words: Vec<_> = recorder.seen.iter().map(|&(_, w)| w).collect();
        assert_eq!(words, vec![10, 13, 16]);
    }

    #[test]
    fn test_zero_stride_abandons_region_only() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![
                words_region(0x1000, &[1, 2, 3], ByteOrder::Little),
                words_region(0x2000, &[4, 5], ByteOrder::Little),
            ],
        )
        .unwrap();

        let mut recorder = Recorder::new(8);
        recorder.abort_at = Some(0x1008);
        let stats = scan_memory(&image, &ScanConfig::new(), &mut recorder).unwrap();

        let words: Vec<_> = recorder.seen.iter().map(|&(_, w)| w).collect();
        assert_eq!(words, vec![1, 2, 4, 5]);
        assert_eq!(stats.regions_aborted, 1);
    }

    #[test]
    fn test_no_writable_regions_is_invalid_target() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![ImageRegion::new(0x1000, false, vec![0u8; 16])],
        )
        .unwrap();

        let err = scan_memory(&image, &ScanConfig::new(), &mut Recorder::new(8)).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    /// Claims a region larger than the bytes it can serve
    struct ShortMemory(ProcessImage);

    impl MemoryProvider for ShortMemory {
        fn writable_regions(&self) -> Vec<Region> {
            vec![Region::new(0x1000, 0x40), Region::new(0x2000, 0x10)]
        }

        fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
            self.0.read_bytes(address, buf)
        }

        fn address_width(&self) -> AddressWidth {
            AddressWidth::Eight
        }

        fn byte_order(&self) -> ByteOrder {
            ByteOrder::Little
        }

        fn identity(&self) -> ImageId {
            ImageId::new("short")
        }
    }

    #[test]
    fn test_read_failure_abandons_region() {
        let image = ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![
                words_region(0x1000, &[1, 2], ByteOrder::Little),
                words_region(0x2000, &[3, 4], ByteOrder::Little),
            ],
        )
        .unwrap();

        let mut recorder = Recorder::new(8);
        let config = ScanConfig::new().block_words(2);
        let stats = scan_memory(&ShortMemory(image), &config, &mut recorder).unwrap();

        let words: Vec<_> = recorder.seen.iter().map(|&(_, w)| w).collect();
        assert_eq!(words, vec![1, 2, 3, 4]);
        assert_eq!(stats.regions_failed, 1);
    }
}
