//! Heap snapshot graph construction.
//!
//! [`SnapshotBuilder`] turns the histogram instances into a graph of
//! nodes and typed edges that heap-snapshot viewers understand. Node ids
//! start at 1 and go up in steps of 2: the synthetic root, the synthetic
//! `(GC roots)` node, then every kept instance in histogram order.
//!
//! Edges are only emitted when the by-value index confirms the reference,
//! which filters out stale slots the layout model would otherwise report.
//! Targets that did not become nodes keep the unresolved `to_node` of 0.

mod serialize;

use crate::histogram::TypeHistogram;
use crate::layout::{HeapObject, InstanceKind, LayoutModel, StringRepr};
use crate::memory::Address;
use crate::refs::{IndexKind, ReferenceIndex};
use std::collections::HashMap;
use tracing::{debug, trace};

pub use serialize::{EDGE_FIELD_COUNT, NODE_FIELD_COUNT};

/// Kind of a snapshot node, numbered as in the `node_types` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Internal object
    Hidden,
    /// Array-like object
    Array,
    /// Flat string
    String,
    /// Generic object
    Object,
    /// Compiled code
    Code,
    /// Function
    Closure,
    /// Regular expression
    RegExp,
    /// Heap number
    Number,
    /// Native object
    Native,
    /// Synthetic grouping node
    Synthetic,
    /// Cons string
    ConcatenatedString,
    /// Sliced string
    SlicedString,
    /// Symbol
    Symbol,
    /// SIMD value
    Simd,
    /// Not representable; never serialized
    Invalid,
}

impl NodeType {
    /// Position in the `node_types` table, `None` for [`NodeType::Invalid`]
    pub fn index(self) -> Option<u64> {
        Some(match self {
            NodeType::Hidden => 0,
            NodeType::Array => 1,
            NodeType::String => 2,
            NodeType::Object => 3,
            NodeType::Code => 4,
            NodeType::Closure => 5,
            NodeType::RegExp => 6,
            NodeType::Number => 7,
            NodeType::Native => 8,
            NodeType::Synthetic => 9,
            NodeType::ConcatenatedString => 10,
            NodeType::SlicedString => 11,
            NodeType::Symbol => 12,
            NodeType::Simd => 13,
            NodeType::Invalid => return None,
        })
    }
}

/// Kind of a snapshot edge, numbered as in the `edge_types` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    /// Context variable
    Context,
    /// Indexed element
    Element,
    /// Named property
    Property,
    /// Internal pointer
    Internal,
    /// Hidden pointer
    Hidden,
    /// Shortcut
    Shortcut,
    /// Weak reference
    Weak,
}

impl EdgeType {
    /// Position in the `edge_types` table
    pub fn index(self) -> u64 {
        match self {
            EdgeType::Context => 0,
            EdgeType::Element => 1,
            EdgeType::Property => 2,
            EdgeType::Internal => 3,
            EdgeType::Hidden => 4,
            EdgeType::Shortcut => 5,
            EdgeType::Weak => 6,
        }
    }
}

/// A node of the heap graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapGraphNode {
    /// Tagged address of the instance (0 for synthetic nodes)
    pub address: Address,
    /// Node kind
    pub node_type: NodeType,
    /// String table id of the type name
    pub name: u64,
    /// Node id
    pub id: u64,
    /// Instance size in bytes
    pub self_size: u64,
    /// Number of edges owned by this node
    pub edge_count: u64,
    /// Allocation trace id, always 0
    pub trace_node_id: u64,
}

/// An edge of the heap graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapGraphEdge {
    /// Edge kind
    pub edge_type: EdgeType,
    /// Element index, or string table id of the property name
    pub name_or_index: u64,
    /// Tagged address of the target
    pub to_address: Address,
    /// Offset of the target in the flat node array, 0 if unresolved
    pub to_node: u64,
}

/// De-duplicating string table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    strings: Vec<String>,
    ids: HashMap<String, u64>,
}

impl StringTable {
    /// Placeholder occupying slot 0 of the serialized table
    pub const DUMMY: &'static str = "<dummy>";

    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `s`, adding it on first use. Ids start at 1.
    pub fn intern(&mut self, s: &str) -> u64 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        self.strings.push(s.to_string());
        let id = self.strings.len() as u64;
        self.ids.insert(s.to_string(), id);
        id
    }

    /// String stored under `id`
    pub fn get(&self, id: u64) -> Option<&str> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.strings.get(index).map(String::as_str)
    }

    /// Interned strings in id order, without the placeholder
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns true if nothing was interned
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// A complete heap graph, ready to serialize
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapSnapshot {
    /// Nodes in serialization order
    pub nodes: Vec<HeapGraphNode>,
    /// Edges grouped by owning node, in node order
    pub edges: Vec<HeapGraphEdge>,
    /// Names referenced by nodes and property edges
    pub strings: StringTable,
}

const ID_STEP: u64 = 2;

/// Builds a [`HeapSnapshot`] from a populated histogram
pub struct SnapshotBuilder<'a, L: LayoutModel + ?Sized> {
    layout: &'a L,
    histogram: &'a TypeHistogram,
    index: &'a mut ReferenceIndex,
}

impl<'a, L: LayoutModel + ?Sized> SnapshotBuilder<'a, L> {
    /// Creates a builder; the by-value index is populated on demand
    pub fn new(layout: &'a L, histogram: &'a TypeHistogram, index: &'a mut ReferenceIndex) -> Self {
        Self {
            layout,
            histogram,
            index,
        }
    }

    /// Build the graph
    pub fn build(self) -> HeapSnapshot {
        if !self.index.is_loaded(IndexKind::Value) {
            self.index.populate(self.layout, self.histogram, IndexKind::Value);
        }

        let mut snapshot = HeapSnapshot::default();
        let mut visited: HashMap<Address, usize> = HashMap::new();

        let root_name = snapshot.strings.intern("");
        let gc_roots_name = snapshot.strings.intern("(GC roots)");
        snapshot.nodes.push(synthetic_node(root_name, 1));
        snapshot.nodes.push(synthetic_node(gc_roots_name, 1 + ID_STEP));
        let mut next_id = 1 + 2 * ID_STEP;

        'records: for record in self.histogram.records() {
            for &address in record.instances() {
                if visited.contains_key(&address) {
                    debug!("0x{:x} listed twice, stopping node population", address);
                    break 'records;
                }
                let Some(object) = self.layout.as_heap_object(address) else {
                    continue;
                };

                let node_type = self.node_type_of(object);
                if node_type == NodeType::Invalid {
                    trace!("No node type for 0x{:x}", address);
                    continue;
                }
                let self_size = match self
                    .layout
                    .map_of(object)
                    .and_then(|map| self.layout.instance_size(map))
                {
                    Ok(size) => size,
                    Err(e) => {
                        trace!("Skipping 0x{:x}: {}", address, e);
                        continue;
                    }
                };
                let name = snapshot.strings.intern(record.type_name());
                let edges = self.edges_of(object, node_type, &mut snapshot.strings);

                visited.insert(address, snapshot.nodes.len());
                snapshot.nodes.push(HeapGraphNode {
                    address,
                    node_type,
                    name,
                    id: next_id,
                    self_size,
                    edge_count: edges.len() as u64,
                    trace_node_id: 0,
                });
                snapshot.edges.extend(edges);
                next_id += ID_STEP;
            }
        }

        for edge in &mut snapshot.edges {
            edge.to_node = match visited.get(&edge.to_address) {
                Some(&position) if snapshot.nodes[position].address == edge.to_address => {
                    position as u64 * NODE_FIELD_COUNT
                }
                _ => 0,
            };
        }

        debug!(
            "Built snapshot with {} nodes and {} edges",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        snapshot
    }

    fn node_type_of(&self, object: HeapObject) -> NodeType {
        let layout = self.layout;
        let Ok(tag) = layout.type_tag(object) else {
            return NodeType::Invalid;
        };
        if layout.is_object_family(tag) {
            return NodeType::Object;
        }

        match layout.kind_of(tag) {
            InstanceKind::Code => NodeType::Code,
            InstanceKind::Function => NodeType::Closure,
            InstanceKind::RegExp => NodeType::RegExp,
            InstanceKind::HeapNumber => NodeType::Number,
            InstanceKind::String => match layout.string_repr(object) {
                Ok(StringRepr::Cons { .. }) => NodeType::ConcatenatedString,
                Ok(StringRepr::Sliced { .. }) => NodeType::SlicedString,
                Ok(_) => NodeType::String,
                Err(_) => NodeType::Invalid,
            },
            InstanceKind::Array
            | InstanceKind::TypedArray
            | InstanceKind::ArrayBuffer
            | InstanceKind::FixedArray => NodeType::Array,
            _ => NodeType::Invalid,
        }
    }

    fn edges_of(
        &self,
        object: HeapObject,
        node_type: NodeType,
        strings: &mut StringTable,
    ) -> Vec<HeapGraphEdge> {
        let layout = self.layout;
        let source = object.raw();
        let mut edges = Vec::new();
        let mut push = |edge_type, name_or_index, to_address| {
            edges.push(HeapGraphEdge {
                edge_type,
                name_or_index,
                to_address,
                to_node: 0,
            })
        };

        match node_type {
            NodeType::Object | NodeType::Array => {
                let length = layout.array_length(object).unwrap_or(0);
                for i in 0..length {
                    let Ok(value) = layout.array_element(object, i) else {
                        break;
                    };
                    if self.is_edge_target(value, source) {
                        push(EdgeType::Element, i, value);
                    }
                }

                for entry in layout.field_properties(object).unwrap_or_default() {
                    if !self.is_edge_target(entry.value, source) {
                        continue;
                    }
                    let Ok(Some(name)) = layout.string_value(entry.key) else {
                        continue;
                    };
                    push(EdgeType::Property, strings.intern(&name), entry.value);
                }
            }
            NodeType::String | NodeType::ConcatenatedString | NodeType::SlicedString => {
                let components = layout
                    .string_repr(object)
                    .map(|repr| repr.components())
                    .unwrap_or_default();
                for (component, target) in components {
                    if self.is_edge_target(target, source) {
                        push(EdgeType::Internal, strings.intern(component.edge_name()), target);
                    }
                }
            }
            _ => {}
        }

        edges
    }

    /// Heap objects worth an edge, confirmed by the by-value index
    fn is_edge_target(&self, value: u64, source: Address) -> bool {
        let layout = self.layout;
        if layout.is_smi(value) || layout.is_hole(value) {
            return false;
        }
        let Some(target) = layout.as_heap_object(value) else {
            return false;
        };
        match layout.kind_of_object(target) {
            Ok(InstanceKind::Function | InstanceKind::Oddball) | Err(_) => return false,
            Ok(_) => {}
        }
        self.index
            .peek_value(value)
            .is_some_and(|referrers| referrers.contains(&source))
    }
}

fn synthetic_node(name: u64, id: u64) -> HeapGraphNode {
    HeapGraphNode {
        address: 0,
        node_type: NodeType::Synthetic,
        name,
        id,
        self_size: 0,
        edge_count: 0,
        trace_node_id: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TaggedLayout;
    use crate::memory::ProcessImage;
    use crate::scanner::{scan_memory, HeapInventory, MapCache, ObjectCollector, ScanConfig};
    use crate::testing::HeapBuilder;
    use pretty_assertions::assert_eq;

    fn inventory(image: &ProcessImage) -> HeapInventory {
        let layout = TaggedLayout::for_memory(image);
        let mut inventory = HeapInventory::new();
        let mut cache = MapCache::new();
        let mut collector = ObjectCollector::new(&layout, 8, &mut cache, &mut inventory);
        scan_memory(image, &ScanConfig::new(), &mut collector).unwrap();
        inventory
    }

    #[test]
    fn test_string_table() {
        let mut strings = StringTable::new();
        assert_eq!(strings.intern(""), 1);
        assert_eq!(strings.intern("Point"), 2);
        assert_eq!(strings.intern(""), 1);
        assert_eq!(strings.get(2), Some("Point"));
        assert_eq!(strings.get(0), None);
        assert_eq!(strings.len(), 2);
    }

    #[test]
    fn test_single_object_snapshot() {
        let mut heap = HeapBuilder::new();
        let map = heap.object_map(HeapBuilder::smi(0), &[]);
        let object = heap.object(map, &[], &[]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let inventory = inventory(&image);
        let mut index = ReferenceIndex::new();

        let snapshot = SnapshotBuilder::new(&layout, &inventory.histogram, &mut index).build();

        assert!(index.is_loaded(IndexKind::Value));
        assert_eq!(snapshot.nodes.len(), 3);
        assert!(snapshot.edges.is_empty());
        let ids: Vec<_> = snapshot.nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(snapshot.nodes[2].address, object);
        assert_eq!(snapshot.nodes[2].node_type, NodeType::Object);
        assert_eq!(snapshot.strings.get(snapshot.nodes[2].name), Some("Object"));
        assert_eq!(snapshot.nodes[2].self_size, 24);
    }

    #[test]
    fn test_edges_are_confirmed_and_resolved() {
        let mut heap = HeapBuilder::new();
        let ctor = heap.function("Holder");
        let label_key = heap.string("label");
        let count_key = heap.string("count");
        let label = heap.string("hello");
        let hole = heap.hole();
        let inner = heap.array(&[label, hole, HeapBuilder::smi(4)]);
        let map = heap.object_map(ctor, &[label_key, count_key]);
        let holder = heap.object(map, &[label, HeapBuilder::smi(1)], &[inner, ctor]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let inventory = inventory(&image);
        let mut index = ReferenceIndex::new();

        let snapshot = SnapshotBuilder::new(&layout, &inventory.histogram, &mut index).build();

        // every edge source is a referrer of its target
        let mut edges = snapshot.edges.iter();
        for node in &snapshot.nodes {
            for edge in edges.by_ref().take(node.edge_count as usize) {
                let referrers = index.peek_value(edge.to_address).unwrap();
                assert!(referrers.contains(&node.address));
                if edge.to_node != 0 {
                    let target = &snapshot.nodes[(edge.to_node / NODE_FIELD_COUNT) as usize];
                    assert_eq!(target.address, edge.to_address);
                }
            }
        }

        let holder_node = snapshot.nodes.iter().find(|n| n.address == holder).unwrap();
        // inner (element 0) and label property; the function is skipped
        assert_eq!(holder_node.edge_count, 2);
        let inner_node = snapshot.nodes.iter().find(|n| n.address == inner).unwrap();
        // the hole and the small integer are skipped
        assert_eq!(inner_node.edge_count, 1);

        let property = snapshot
            .edges
            .iter()
            .find(|e| e.edge_type == EdgeType::Property)
            .unwrap();
        assert_eq!(snapshot.strings.get(property.name_or_index), Some("label"));
        assert_eq!(property.to_address, label);
        assert_ne!(property.to_node, 0);
    }

    #[test]
    fn test_scanned_image_to_json() {
        let mut heap = HeapBuilder::new();
        let map = heap.object_map(HeapBuilder::smi(0), &[]);
        heap.object(map, &[], &[]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let inventory = inventory(&image);
        let mut index = ReferenceIndex::new();

        let json = SnapshotBuilder::new(&layout, &inventory.histogram, &mut index)
            .build()
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["snapshot"]["node_count"], 3);
        assert_eq!(value["snapshot"]["edge_count"], 0);
        assert_eq!(value["snapshot"]["meta"]["node_types"].as_array().unwrap().len(), 7);
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 3 * NODE_FIELD_COUNT as usize);
        let ids: Vec<_> = nodes
            .chunks(NODE_FIELD_COUNT as usize)
            .map(|node| node[2].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(value["edges"], serde_json::json!([]));
        assert_eq!(value["strings"], serde_json::json!(["<dummy>", "", "(GC roots)", "Object"]));
    }

    #[test]
    fn test_edge_targets_in_json_are_node_offsets() {
        let mut heap = HeapBuilder::new();
        let ctor = heap.function("Holder");
        let key = heap.string("label");
        let label = heap.string("hello");
        let inner = heap.array(&[label]);
        let map = heap.object_map(ctor, &[key]);
        heap.object(map, &[label], &[inner]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let inventory = inventory(&image);
        let mut index = ReferenceIndex::new();

        let snapshot = SnapshotBuilder::new(&layout, &inventory.histogram, &mut index).build();
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();

        let node_count = value["snapshot"]["node_count"].as_u64().unwrap();
        let edge_count = value["snapshot"]["edge_count"].as_u64().unwrap();
        assert_eq!(node_count, snapshot.nodes.len() as u64);
        assert!(edge_count >= 3);

        let nodes = value["nodes"].as_array().unwrap();
        let edges = value["edges"].as_array().unwrap();
        assert_eq!(nodes.len() as u64, node_count * NODE_FIELD_COUNT);
        assert_eq!(edges.len() as u64, edge_count * EDGE_FIELD_COUNT);

        let declared: u64 = nodes
            .chunks(NODE_FIELD_COUNT as usize)
            .map(|node| node[4].as_u64().unwrap())
            .sum();
        assert_eq!(declared, edge_count);
        for edge in edges.chunks(EDGE_FIELD_COUNT as usize) {
            let to_node = edge[2].as_u64().unwrap();
            assert_eq!(to_node % NODE_FIELD_COUNT, 0);
            assert!(to_node < nodes.len() as u64);
        }
    }

    #[test]
    fn test_unreadable_instances_are_not_nodes() {
        let mut heap = HeapBuilder::new();
        let map = heap.object_map(HeapBuilder::smi(0), &[]);
        let object = heap.object(map, &[], &[]);
        let bogus = heap.raw_words(&[HeapBuilder::smi(7), HeapBuilder::smi(8)]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let mut histogram = inventory(&image).histogram;
        histogram.insert("Object", bogus, 16);
        let mut index = ReferenceIndex::new();

        let snapshot = SnapshotBuilder::new(&layout, &histogram, &mut index).build();

        let addresses: Vec<_> = snapshot.nodes.iter().map(|n| n.address).collect();
        assert_eq!(addresses, vec![0, 0, object]);
        assert_eq!(snapshot.nodes[2].id, 5);
    }

    #[test]
    fn test_composite_string_edges() {
        let mut heap = HeapBuilder::new();
        let parent = heap.string("abcdef");
        let sliced = heap.sliced_string(parent, 1, 2);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let inventory = inventory(&image);
        let mut index = ReferenceIndex::new();

        let snapshot = SnapshotBuilder::new(&layout, &inventory.histogram, &mut index).build();

        let node = snapshot.nodes.iter().find(|n| n.address == sliced).unwrap();
        assert_eq!(node.node_type, NodeType::SlicedString);
        assert_eq!(snapshot.edges.len(), 1);
        let edge = &snapshot.edges[0];
        assert_eq!(edge.edge_type, EdgeType::Internal);
        assert_eq!(snapshot.strings.get(edge.name_or_index), Some("parent"));
        assert_eq!(edge.to_address, parent);
    }
}
