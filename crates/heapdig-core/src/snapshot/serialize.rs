//! `.heapsnapshot` JSON encoding.
//!
//! The document layout is fixed: a `snapshot` header with the field and
//! type tables, then flat `nodes` and `edges` arrays, three empty trace
//! arrays and the string table. Struct field order below is the key order
//! on the wire.

use super::{HeapGraphEdge, HeapGraphNode, HeapSnapshot, StringTable};
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io;

/// Integers per node in the flat `nodes` array
pub const NODE_FIELD_COUNT: u64 = 6;

/// Integers per edge in the flat `edges` array
pub const EDGE_FIELD_COUNT: u64 = 3;

const NODE_FIELDS: [&str; 6] = ["type", "name", "id", "self_size", "edge_count", "trace_node_id"];
const NODE_TYPE_NAMES: [&str; 12] = [
    "hidden",
    "array",
    "string",
    "object",
    "code",
    "closure",
    "regexp",
    "number",
    "native",
    "synthetic",
    "concatenated string",
    "sliced string",
];
const EDGE_FIELDS: [&str; 3] = ["type", "name_or_index", "to_node"];
const EDGE_TYPE_NAMES: [&str; 7] = [
    "context", "element", "property", "internal", "hidden", "shortcut", "weak",
];
const TRACE_FUNCTION_INFO_FIELDS: [&str; 6] = [
    "function_id",
    "name",
    "script_name",
    "script_id",
    "line",
    "column",
];
const TRACE_NODE_FIELDS: [&str; 5] = ["id", "function_info_index", "count", "size", "children"];
const SAMPLE_FIELDS: [&str; 2] = ["timestamp_us", "last_assigned_id"];

#[derive(Serialize)]
struct Meta {
    node_fields: [&'static str; 6],
    node_types: Value,
    edge_fields: [&'static str; 3],
    edge_types: Value,
    trace_function_info_fields: [&'static str; 6],
    trace_node_fields: [&'static str; 5],
    sample_fields: [&'static str; 2],
}

#[derive(Serialize)]
struct Header {
    meta: Meta,
    node_count: usize,
    edge_count: usize,
    trace_function_count: usize,
}

#[derive(Serialize)]
struct Document<'a> {
    snapshot: Header,
    nodes: Vec<u64>,
    edges: Vec<u64>,
    trace_function_infos: [u64; 0],
    trace_tree: [u64; 0],
    samples: [u64; 0],
    strings: Vec<&'a str>,
}

fn meta() -> Meta {
    Meta {
        node_fields: NODE_FIELDS,
        // first entry of a type column is the enum table
        node_types: json!([
            NODE_TYPE_NAMES,
            "string",
            "number",
            "number",
            "number",
            "number",
            "number"
        ]),
        edge_fields: EDGE_FIELDS,
        edge_types: json!([EDGE_TYPE_NAMES, "string_or_number", "node"]),
        trace_function_info_fields: TRACE_FUNCTION_INFO_FIELDS,
        trace_node_fields: TRACE_NODE_FIELDS,
        sample_fields: SAMPLE_FIELDS,
    }
}

fn flatten_nodes(nodes: &[HeapGraphNode]) -> Vec<u64> {
    let mut flat = Vec::with_capacity(nodes.len() * NODE_FIELD_COUNT as usize);
    for node in nodes {
        let Some(node_type) = node.node_type.index() else {
            continue;
        };
        flat.extend([
            node_type,
            node.name,
            node.id,
            node.self_size,
            node.edge_count,
            node.trace_node_id,
        ]);
    }
    flat
}

fn flatten_edges(edges: &[HeapGraphEdge]) -> Vec<u64> {
    edges
        .iter()
        .flat_map(|edge| [edge.edge_type.index(), edge.name_or_index, edge.to_node])
        .collect()
}

fn string_column(strings: &StringTable) -> Vec<&str> {
    std::iter::once(StringTable::DUMMY)
        .chain(strings.strings().iter().map(String::as_str))
        .collect()
}

impl HeapSnapshot {
    fn document(&self) -> Document<'_> {
        Document {
            snapshot: Header {
                meta: meta(),
                node_count: self.nodes.len(),
                edge_count: self.edges.len(),
                trace_function_count: 0,
            },
            nodes: flatten_nodes(&self.nodes),
            edges: flatten_edges(&self.edges),
            trace_function_infos: [],
            trace_tree: [],
            samples: [],
            strings: string_column(&self.strings),
        }
    }

    /// Encode the snapshot as a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.document()).map_err(Error::from)
    }

    /// Encode the snapshot into `writer`
    pub fn write_json<W: io::Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &self.document()).map_err(Error::from)
    }
}
