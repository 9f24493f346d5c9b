//! Scan state for one process image.
//!
//! A [`ScanSession`] owns everything derived from an image: the map cache,
//! the histograms and context set, the three reference indices and the
//! paging state of instance listings. The first operation that needs the
//! heap triggers a scan; scanning an image with a different identity
//! discards all derived state first.

use crate::error::{Error, Result};
use crate::histogram::TypeRecord;
use crate::layout::{HeapObject, InstanceKind, LayoutModel};
use crate::memory::{Address, ImageId, MemoryProvider};
use crate::pagination::{Page, Pagination};
use crate::process_info::{find_process_info, ProcessInfo};
use crate::refs::{render_events, traverse, IndexKind, ReferenceIndex, SearchKey, TraversalEvent};
use crate::scanner::{scan_memory, HeapInventory, MapCache, ObjectCollector, ScanConfig, ScanStats};
use crate::snapshot::{HeapSnapshot, SnapshotBuilder};
use std::fmt;
use tracing::{debug, info};

/// One page of an instance listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceListing {
    /// One rendered line per instance on the page
    pub lines: Vec<String>,
    /// The page shown
    pub page: Page,
}

impl fmt::Display for InstanceListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        if self.page.has_more() {
            writeln!(f, "..........")?;
        }
        writeln!(f, "{}", self.page)
    }
}

/// All state derived from scanning one image
#[derive(Debug, Default)]
pub struct ScanSession {
    config: ScanConfig,
    cache: MapCache,
    inventory: HeapInventory,
    index: ReferenceIndex,
    pagination: Pagination,
    image: Option<ImageId>,
    stats: Option<ScanStats>,
}

impl ScanSession {
    /// Creates an empty session
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Scan and reporting configuration
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Histograms and contexts of the last scan
    pub fn inventory(&self) -> &HeapInventory {
        &self.inventory
    }

    /// Reference indices built so far
    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    /// Paging state of instance listings
    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    /// Counters of the last scan, if one completed
    pub fn stats(&self) -> Option<ScanStats> {
        self.stats
    }

    /// Identity of the scanned image
    pub fn image(&self) -> Option<&ImageId> {
        self.image.as_ref()
    }

    /// Drop every derived table
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.inventory.clear();
        self.index.clear();
        self.pagination = Pagination::new();
        self.image = None;
        self.stats = None;
    }

    /// Scan `memory` unless it was already scanned by this session
    pub fn scan_heap<M, L>(&mut self, memory: &M, layout: &L) -> Result<&HeapInventory>
    where
        M: MemoryProvider + ?Sized,
        L: LayoutModel + ?Sized,
    {
        let identity = memory.identity();
        if let Some(current) = &self.image {
            if *current == identity {
                return Ok(&self.inventory);
            }
            info!("Image changed from {} to {}, discarding scan state", current, identity);
            self.invalidate();
        }

        let stride = memory.address_width().bytes();
        let mut collector = ObjectCollector::new(layout, stride, &mut self.cache, &mut self.inventory)
            .preview_properties(self.config.preview_properties);
        let stats = scan_memory(memory, &self.config, &mut collector)?;
        debug!(
            "Accepted {} candidates, {} types, {} contexts",
            collector.accepted(),
            self.inventory.histogram.len(),
            self.inventory.contexts.len()
        );

        self.image = Some(identity);
        self.stats = Some(stats);
        Ok(&self.inventory)
    }

    /// Populate the index of `kind` if it is not loaded yet
    pub fn ensure_references<L: LayoutModel + ?Sized>(&mut self, layout: &L, kind: IndexKind) {
        if !self.index.is_loaded(kind) {
            let count = self.index.populate(layout, &self.inventory.histogram, kind);
            debug!("Loaded {} index with {} keys", kind, count);
        }
    }

    /// Referrers of `key`, expanded recursively on request.
    ///
    /// Small integers are inline values and cannot be searched by value.
    pub fn find_references<L: LayoutModel + ?Sized>(
        &mut self,
        layout: &L,
        key: &SearchKey,
        recursive: bool,
    ) -> Result<Vec<TraversalEvent>> {
        if let SearchKey::Value(value) = key {
            if layout.is_smi(*value) {
                return Err(Error::SmiSearch(*value));
            }
        }

        self.ensure_references(layout, key.kind());
        if recursive {
            self.ensure_references(layout, IndexKind::Value);
        }
        Ok(traverse(
            layout,
            &mut self.index,
            &self.inventory.contexts,
            key,
            recursive,
        ))
    }

    /// Render traversal output with the configured padding
    pub fn render_references(&self, events: &[TraversalEvent]) -> String {
        render_events(events, self.config.tree_padding)
    }

    /// The next page of instances of `type_name`, `None` if the type is unknown
    pub fn list_instances<L: LayoutModel + ?Sized>(
        &mut self,
        layout: &L,
        type_name: &str,
        limit: usize,
        detailed: bool,
    ) -> Option<InstanceListing> {
        let record: &TypeRecord = self.inventory.histogram.get(type_name)?;
        let total = record.instances().len();
        let page = self.pagination.advance(type_name, limit, total);

        let lines = record
            .instances()
            .iter()
            .skip(page.start)
            .take(page.end - page.start)
            .map(|&address| describe_instance(layout, address, detailed))
            .collect();
        Some(InstanceListing { lines, page })
    }

    /// Build a heap snapshot of the scanned instances
    pub fn heap_snapshot<L: LayoutModel + ?Sized>(&mut self, layout: &L) -> HeapSnapshot {
        SnapshotBuilder::new(layout, &self.inventory.histogram, &mut self.index).build()
    }

    /// Metadata of every `process` object
    pub fn process_info<L: LayoutModel + ?Sized>(&self, layout: &L) -> Vec<ProcessInfo> {
        find_process_info(layout, &self.inventory.histogram)
    }
}

fn describe_value<L: LayoutModel + ?Sized>(layout: &L, value: u64) -> String {
    if layout.is_smi(value) {
        format!("<Smi: {}>", layout.smi_value(value))
    } else if layout.is_hole(value) {
        "<hole>".to_string()
    } else {
        format!("0x{:x}", value)
    }
}

fn describe_instance<L: LayoutModel + ?Sized>(layout: &L, address: Address, detailed: bool) -> String {
    let Some(object) = layout.as_heap_object(address) else {
        return format!("0x{:x}:<unknown>", address);
    };
    let Ok(tag) = layout.type_tag(object) else {
        return format!("0x{:x}:<unknown>", address);
    };
    let type_name = layout.type_name(object).unwrap_or_else(|_| "???".to_string());

    if layout.is_string_tag(tag) {
        return match layout.read_string(object) {
            Ok(text) => format!("0x{:x}:<String: \"{}\">", address, text),
            Err(_) => format!("0x{:x}:<String>", address),
        };
    }
    if layout.kind_of(tag) == InstanceKind::Array {
        let length = layout.array_length(object).unwrap_or(0);
        if !detailed {
            return format!("0x{:x}:<Array: length={}>", address, length);
        }
        let elements: Vec<_> = (0..length)
            .map_while(|i| layout.array_element(object, i).ok())
            .enumerate()
            .map(|(i, value)| format!("    [{}]={}", i, describe_value(layout, value)))
            .collect();
        return format!(
            "0x{:x}:<Array: length={} {{\n{}}}>",
            address,
            length,
            elements.join(",\n")
        );
    }
    if layout.is_object_family(tag) {
        if !detailed {
            return format!("0x{:x}:<Object: {}>", address, type_name);
        }
        return format!(
            "0x{:x}:<Object: {} properties {{\n{}}}>",
            address,
            type_name,
            describe_properties(layout, object).join(",\n")
        );
    }
    format!("0x{:x}:<{}>", address, type_name)
}

fn describe_properties<L: LayoutModel + ?Sized>(layout: &L, object: HeapObject) -> Vec<String> {
    layout
        .property_entries(object)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let name = match layout.string_value(entry.key) {
                Ok(Some(name)) => name,
                _ => "???".to_string(),
            };
            format!("    .{}={}", name, describe_value(layout, entry.value))
        })
        .collect()
}
