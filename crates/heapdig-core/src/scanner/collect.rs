//! Candidate classification and histogram population.

use super::MemoryVisitor;
use crate::error::Result;
use crate::histogram::{DetailedHistogram, ObjectShape, TypeHistogram};
use crate::layout::{HeapObject, InstanceKind, LayoutModel, MapRef};
use crate::memory::Address;
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// Classification of one map, shared by every object using it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    /// Closure contexts are collected separately
    pub is_context: bool,
    /// Instances of this map go into the histograms
    pub is_histogram: bool,
    /// Instances can carry indexed elements
    pub has_elements: bool,
    /// Instance size in bytes
    pub instance_size: u64,
    /// Type name and own property names; `element_count` is left at 0
    pub shape: ObjectShape,
}

impl MapInfo {
    /// Classify `map`, using `object` (one of its instances) for the type name
    pub fn load<L: LayoutModel + ?Sized>(layout: &L, object: HeapObject, map: MapRef) -> Result<Self> {
        let tag = layout.map_type_tag(map)?;
        let kind = layout.kind_of(tag);
        let is_object = layout.is_object_family(tag);

        let mut info = Self {
            is_context: kind == InstanceKind::Context,
            is_histogram: is_object
                || layout.is_string_tag(tag)
                || matches!(kind, InstanceKind::Array | InstanceKind::TypedArray),
            has_elements: is_object || kind == InstanceKind::Array,
            instance_size: 0,
            shape: ObjectShape {
                type_name: String::new(),
                properties: Vec::new(),
                own_descriptor_count: 0,
                element_count: 0,
            },
        };
        if info.is_context || !info.is_histogram {
            return Ok(info);
        }

        info.instance_size = layout.instance_size(map)?;
        info.shape.type_name = layout.type_name(object)?;
        info.shape.own_descriptor_count = layout.own_descriptor_count(map)?;
        info.shape.properties = layout.own_descriptor_names(map)?;
        Ok(info)
    }
}

/// Side table of map classifications, keyed by map address
#[derive(Debug, Clone, Default)]
pub struct MapCache {
    entries: HashMap<Address, MapInfo>,
}

impl MapCache {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached classification of a map
    pub fn get(&self, map: Address) -> Option<&MapInfo> {
        self.entries.get(&map)
    }

    /// Store a classification
    pub fn insert(&mut self, map: Address, info: MapInfo) {
        self.entries.insert(map, info);
    }

    /// Number of cached maps
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every map
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Addresses of closure contexts found by the scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSet {
    contexts: BTreeSet<Address>,
}

impl ContextSet {
    /// Creates an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context; returns false if it was already present
    pub fn insert(&mut self, context: Address) -> bool {
        self.contexts.insert(context)
    }

    /// Returns true if `context` was found
    pub fn contains(&self, context: Address) -> bool {
        self.contexts.contains(&context)
    }

    /// Contexts in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.contexts.iter().copied()
    }

    /// Number of contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if no context was found
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Forget every context
    pub fn clear(&mut self) {
        self.contexts.clear();
    }
}

/// Everything the object scan produces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapInventory {
    /// Instances by type name
    pub histogram: TypeHistogram,
    /// Instances by shape
    pub detailed: DetailedHistogram,
    /// Closure contexts
    pub contexts: ContextSet,
}

impl HeapInventory {
    /// Creates an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the scan found nothing
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty() && self.contexts.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.histogram.clear();
        self.detailed.clear();
        self.contexts.clear();
    }
}

/// Visitor that classifies candidate words and fills a [`HeapInventory`]
pub struct ObjectCollector<'a, L: LayoutModel + ?Sized> {
    layout: &'a L,
    cache: &'a mut MapCache,
    inventory: &'a mut HeapInventory,
    stride: u64,
    preview: usize,
    accepted: u64,
}

impl<'a, L: LayoutModel + ?Sized> ObjectCollector<'a, L> {
    /// Creates a collector advancing `stride` bytes per word
    pub fn new(
        layout: &'a L,
        stride: u64,
        cache: &'a mut MapCache,
        inventory: &'a mut HeapInventory,
    ) -> Self {
        Self {
            layout,
            cache,
            inventory,
            stride,
            preview: crate::histogram::DEFAULT_PREVIEW_PROPERTIES,
            accepted: 0,
        }
    }

    /// Sets the number of property names shown per detailed bucket
    pub fn preview_properties(mut self, count: usize) -> Self {
        self.preview = count;
        self
    }

    /// Candidates that made it into the histograms or the context set
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl<L: LayoutModel + ?Sized> MemoryVisitor for ObjectCollector<'_, L> {
    fn visit(&mut self, _address: Address, word: u64) -> u64 {
        if self.layout.is_smi(word) {
            return self.stride;
        }
        let Some(object) = self.layout.as_heap_object(word) else {
            return self.stride;
        };
        let Ok(map) = self.layout.map_of(object) else {
            return self.stride;
        };

        if self.cache.get(map.raw()).is_none() {
            match MapInfo::load(self.layout, object, map) {
                Ok(info) => self.cache.insert(map.raw(), info),
                Err(e) => {
                    trace!("Skipping 0x{:x}: {}", word, e);
                    return self.stride;
                }
            }
        }
        let Some(info) = self.cache.get(map.raw()) else {
            return self.stride;
        };

        if info.is_context {
            self.inventory.contexts.insert(word);
            self.accepted += 1;
            return self.stride;
        }
        if !info.is_histogram {
            return self.stride;
        }

        let mut shape = info.shape.clone();
        if info.has_elements {
            match self.layout.array_length(object) {
                Ok(count) => shape.element_count = count,
                Err(e) => {
                    trace!("Skipping 0x{:x}: {}", word, e);
                    return self.stride;
                }
            }
        }

        self.inventory
            .histogram
            .insert(&shape.type_name, word, info.instance_size);
        self.inventory
            .detailed
            .insert(&shape, self.preview, word, info.instance_size);
        self.accepted += 1;
        self.stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TaggedLayout;
    use crate::scanner::{scan_memory, ScanConfig};
    use crate::testing::HeapBuilder;
    use pretty_assertions::assert_eq;

    fn collect(image: &crate::memory::ProcessImage, cache: &mut MapCache) -> HeapInventory {
        let layout = TaggedLayout::for_memory(image);
        let mut inventory = HeapInventory::new();
        let mut collector = ObjectCollector::new(&layout, 8, cache, &mut inventory);
        scan_memory(image, &ScanConfig::new(), &mut collector).unwrap();
        inventory
    }

    fn sample_heap() -> HeapBuilder {
        let mut heap = HeapBuilder::new();
        let ctor = heap.function("Point");
        let x = heap.string("x");
        let y = heap.string("y");
        let map = heap.object_map(ctor, &[x, y]);
        heap.object(map, &[HeapBuilder::smi(1), HeapBuilder::smi(2)], &[]);
        heap.object(map, &[HeapBuilder::smi(3), HeapBuilder::smi(4)], &[]);
        heap.array(&[x]);
        heap.array(&[x, y]);
        heap.typed_array();
        let local = heap.string("local");
        heap.context(&[(local, x)]);
        heap
    }

    #[test]
    fn test_histogram_types() {
        let image = sample_heap().build();
        let inventory = collect(&image, &mut MapCache::new());

        let point = inventory.histogram.get("Point").unwrap();
        assert_eq!(point.instance_count(), 2);
        assert_eq!(point.total_size(), 2 * 5 * 8);
        assert_eq!(inventory.histogram.get("Array").unwrap().instance_count(), 2);
        assert_eq!(
            inventory
                .histogram
                .get("(ArrayBufferView)")
                .unwrap()
                .instance_count(),
            1
        );
        // Point, x, y, local
        assert_eq!(inventory.histogram.get("(String)").unwrap().instance_count(), 4);
        assert!(inventory.histogram.get("(Function)").is_none());
        assert_eq!(inventory.contexts.len(), 1);
    }

    #[test]
    fn test_detailed_buckets_by_element_count() {
        let image = sample_heap().build();
        let inventory = collect(&image, &mut MapCache::new());

        assert!(inventory.detailed.get("Array[1]").is_some());
        assert!(inventory.detailed.get("Array[2]").is_some());
        let point = inventory.detailed.get("Point[0]: x, y").unwrap();
        assert_eq!(point.record().instance_count(), 2);
        assert_eq!(point.own_descriptor_count(), 2);
    }

    #[test]
    fn test_rescan_is_deterministic() {
        let image = sample_heap().build();
        let mut cache = MapCache::new();
        let first = collect(&image, &mut cache);
        assert!(!cache.is_empty());

        let warm = collect(&image, &mut cache);
        let cold = collect(&image, &mut MapCache::new());
        assert_eq!(first, warm);
        assert_eq!(first, cold);
    }
}
