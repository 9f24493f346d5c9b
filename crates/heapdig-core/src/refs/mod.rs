//! Cross-reference indices over the scanned heap.
//!
//! A [`ReferenceIndex`] holds three independent maps from a key to the
//! ordered list of heap objects that reference it:
//!
//! - by value: objects holding a given tagged pointer
//! - by property: objects carrying a property with a given name
//! - by text: objects holding a string with a given content
//!
//! Each map is filled by one full pass over the histogram instances
//! ([`ReferenceIndex::populate`]). Lookups never trigger a pass; callers
//! check [`ReferenceIndex::is_loaded`] first.

mod report;
mod traverse;

use crate::error::Result;
use crate::histogram::TypeHistogram;
use crate::layout::{HeapObject, InstanceKind, LayoutModel};
use crate::memory::Address;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, trace};

pub use report::{context_references, describe_refs, ReferenceLine, Slot};
pub use traverse::{render_events, traverse, TraversalEvent};

/// The three kinds of reference index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Objects pointing at a value
    Value,
    /// Objects with a named property
    Property,
    /// Objects holding a string with given content
    Text,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::Value => "value",
            IndexKind::Property => "property",
            IndexKind::Text => "text",
        })
    }
}

/// What to look for in a reference search
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SearchKey {
    /// A tagged pointer
    Value(Address),
    /// A property name
    Property(String),
    /// String content
    Text(String),
}

impl SearchKey {
    /// The index this key is looked up in
    pub fn kind(&self) -> IndexKind {
        match self {
            SearchKey::Value(_) => IndexKind::Value,
            SearchKey::Property(_) => IndexKind::Property,
            SearchKey::Text(_) => IndexKind::Text,
        }
    }
}

/// Referrer lists keyed by value, property name and string content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceIndex {
    by_value: BTreeMap<Address, Vec<Address>>,
    by_property: BTreeMap<String, Vec<Address>>,
    by_text: BTreeMap<String, Vec<Address>>,
    value_loaded: bool,
    property_loaded: bool,
    text_loaded: bool,
}

impl ReferenceIndex {
    /// Creates an empty, unloaded index
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`populate`](Self::populate) has run for `kind`
    pub fn is_loaded(&self, kind: IndexKind) -> bool {
        match kind {
            IndexKind::Value => self.value_loaded,
            IndexKind::Property => self.property_loaded,
            IndexKind::Text => self.text_loaded,
        }
    }

    fn set_loaded(&mut self, kind: IndexKind) {
        match kind {
            IndexKind::Value => self.value_loaded = true,
            IndexKind::Property => self.property_loaded = true,
            IndexKind::Text => self.text_loaded = true,
        }
    }

    /// Referrers of `key`.
    ///
    /// Looking up a key that has no entry creates an empty one, so a later
    /// [`was_queried`](Self::was_queried) reports it.
    pub fn references(&mut self, key: &SearchKey) -> &[Address] {
        match key {
            SearchKey::Value(value) => self.references_by_value(*value),
            SearchKey::Property(name) => self.references_by_property(name),
            SearchKey::Text(text) => self.references_by_text(text),
        }
    }

    /// Objects holding `value`; creates an empty entry on a miss
    pub fn references_by_value(&mut self, value: Address) -> &[Address] {
        self.by_value.entry(value).or_default()
    }

    /// Objects with a property named `name`; creates an empty entry on a miss
    pub fn references_by_property(&mut self, name: &str) -> &[Address] {
        self.by_property.entry(name.to_string()).or_default()
    }

    /// Objects holding a string equal to `text`; creates an empty entry on a miss
    pub fn references_by_text(&mut self, text: &str) -> &[Address] {
        self.by_text.entry(text.to_string()).or_default()
    }

    /// Referrers of `value` without creating an entry
    pub fn peek_value(&self, value: Address) -> Option<&[Address]> {
        self.by_value.get(&value).map(Vec::as_slice)
    }

    /// Returns true if `key` has an entry, either from population or
    /// from an earlier lookup
    pub fn was_queried(&self, key: &SearchKey) -> bool {
        match key {
            SearchKey::Value(value) => self.by_value.contains_key(value),
            SearchKey::Property(name) => self.by_property.contains_key(name),
            SearchKey::Text(text) => self.by_text.contains_key(text),
        }
    }

    /// Drop every entry and loaded flag
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn push_value(&mut self, value: Address, source: Address) {
        self.by_value.entry(value).or_default().push(source);
    }

    fn push_property(&mut self, name: String, source: Address) {
        self.by_property.entry(name).or_default().push(source);
    }

    fn push_text(&mut self, text: String, source: Address) {
        self.by_text.entry(text).or_default().push(source);
    }

    /// Fill the `kind` index from every histogram instance and mark it
    /// loaded. Returns the number of instances scanned.
    pub fn populate<L: LayoutModel + ?Sized>(
        &mut self,
        layout: &L,
        histogram: &TypeHistogram,
        kind: IndexKind,
    ) -> usize {
        debug!("Building {} index", kind);
        let mut scanned = 0;

        for (_, address) in histogram.instances() {
            let Some(object) = layout.as_heap_object(address) else {
                continue;
            };
            let Ok(tag) = layout.type_tag(object) else {
                continue;
            };

            // objects and arrays both carry elements and named properties
            let result = if layout.is_object_family(tag)
                || layout.kind_of(tag) == InstanceKind::Array
            {
                self.scan_object(layout, object, kind)
            } else if layout.is_string_tag(tag) {
                self.scan_string(layout, object, kind)
            } else {
                // typed arrays only point off-heap
                continue;
            };

            scanned += 1;
            if let Err(e) = result {
                trace!("Skipping 0x{:x} in {} index: {}", address, kind, e);
            }
        }

        self.set_loaded(kind);
        debug!("Built {} index from {} instances", kind, scanned);
        scanned
    }

    fn scan_object<L: LayoutModel + ?Sized>(
        &mut self,
        layout: &L,
        object: HeapObject,
        kind: IndexKind,
    ) -> Result<()> {
        let source = object.raw();

        match kind {
            IndexKind::Value => {
                let mut saved = BTreeSet::new();
                for value in element_values(layout, object) {
                    if !layout.is_smi(value) && saved.insert(value) {
                        self.push_value(value, source);
                    }
                }
                for entry in layout.property_entries(object)? {
                    if !layout.is_smi(entry.value) && saved.insert(entry.value) {
                        self.push_value(entry.value, source);
                    }
                }
            }
            IndexKind::Property => {
                let mut saved = BTreeSet::new();
                for entry in layout.property_entries(object)? {
                    let Some(key) = layout.as_heap_object(entry.key) else {
                        continue;
                    };
                    let Ok(name) = layout.read_string(key) else {
                        continue;
                    };
                    if saved.insert(name.clone()) {
                        self.push_property(name, source);
                    }
                }
            }
            IndexKind::Text => {
                let mut values = element_values(layout, object);
                values.extend(
                    layout
                        .property_entries(object)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|e| e.value),
                );

                let mut saved = BTreeSet::new();
                for value in values {
                    let Ok(Some(text)) = layout.string_value(value) else {
                        continue;
                    };
                    if saved.insert(text.clone()) {
                        self.push_text(text, source);
                    }
                }
            }
        }

        Ok(())
    }

    fn scan_string<L: LayoutModel + ?Sized>(
        &mut self,
        layout: &L,
        string: HeapObject,
        kind: IndexKind,
    ) -> Result<()> {
        let source = string.raw();

        match kind {
            IndexKind::Value => {
                let mut saved = BTreeSet::new();
                for (_, target) in layout.string_repr(string)?.components() {
                    if saved.insert(target) {
                        self.push_value(target, source);
                    }
                }
            }
            IndexKind::Property => {}
            IndexKind::Text => {
                let mut saved = BTreeSet::new();
                for (_, target) in layout.string_repr(string)?.components() {
                    let Ok(Some(text)) = layout.string_value(target) else {
                        continue;
                    };
                    if saved.insert(text.clone()) {
                        self.push_text(text, source);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Indexed elements of an object, stopping at the first unreadable one
pub(crate) fn element_values<L: LayoutModel + ?Sized>(layout: &L, object: HeapObject) -> Vec<u64> {
    let Ok(length) = layout.array_length(object) else {
        return Vec::new();
    };
    let mut values = Vec::new();
    for i in 0..length {
        match layout.array_element(object, i) {
            Ok(value) => values.push(value),
            Err(_) => break,
        }
    }
    values
}
