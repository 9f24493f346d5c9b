//! # heapdig-core
//!
//! A library for reconstructing the managed heap of a JavaScript runtime from
//! a static process image, such as one captured from a core dump.
//!
//! This crate provides the core functionality for:
//! - Brute-force scanning of writable memory for heap objects
//! - Type histograms, plain and keyed by object shape
//! - Reverse reference lookups by value, property name and string content
//! - Heap snapshot export in the `.heapsnapshot` JSON format
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`memory`]: The [`MemoryProvider`] trait and the on-disk [`ProcessImage`]
//! - [`layout`]: The [`LayoutModel`] trait and the tagged-pointer [`TaggedLayout`]
//! - [`scanner`]: Block-wise memory scanning and object classification
//! - [`histogram`]: Type records and their tabular output
//! - [`refs`]: Reference indices and reference-graph traversal
//! - [`snapshot`]: Heap graph construction and serialization
//! - [`session`]: All state derived from one image
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use heapdig_core::{ProcessImage, ScanConfig, ScanSession, SearchKey, TaggedLayout};
//!
//! let image = ProcessImage::load_dir("./core-image")?;
//! let layout = TaggedLayout::for_memory(&image);
//!
//! let mut session = ScanSession::new(ScanConfig::new());
//! let inventory = session.scan_heap(&image, &layout)?;
//! print!("{}", inventory.histogram.table());
//!
//! let events = session.find_references(&layout, &SearchKey::Text("secret".into()), false)?;
//! print!("{}", session.render_references(&events));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! The engine only talks to memory and to the heap layout through traits:
//!
//! - [`MemoryProvider`]: Supply regions and bytes from any capture format
//! - [`LayoutModel`]: Decode objects of a different runtime version
//! - [`scanner::MemoryVisitor`]: Run custom per-word analyses
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod error;
pub mod histogram;
pub mod layout;
pub mod memory;
pub mod pagination;
pub mod process_info;
pub mod refs;
pub mod scanner;
pub mod session;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

// Re-export primary types for convenience
pub use error::{Error, Result};
pub use histogram::{DetailedHistogram, TypeHistogram, TypeRecord};
pub use layout::{LayoutConstants, LayoutModel, TaggedLayout};
pub use memory::{Address, ImageId, MemoryProvider, ProcessImage};
pub use pagination::{Page, Pagination};
pub use process_info::{ProcessInfo, ProcessReport};
pub use refs::{IndexKind, ReferenceIndex, SearchKey, TraversalEvent};
pub use scanner::{HeapInventory, ScanConfig, ScanStats};
pub use session::{InstanceListing, ScanSession};
pub use snapshot::{HeapSnapshot, SnapshotBuilder};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
