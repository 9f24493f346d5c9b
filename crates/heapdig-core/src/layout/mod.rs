//! Heap object layout model.
//!
//! The scanning engine treats the runtime's object layout as a fixed,
//! versioned capability: it asks questions through [`LayoutModel`] and
//! never decodes headers itself. [`TaggedLayout`] answers those questions
//! for a pointer-tagging runtime described by [`LayoutConstants`].
//!
//! ## Values
//!
//! Every word is either a small integer (an inline value), a tagged
//! pointer to a heap object, or garbage. A heap object starts with a
//! pointer to its map, and the map describes the object's instance type,
//! size and property layout.

mod constants;
mod tagged;

use crate::error::Result;
use crate::memory::Address;

pub use constants::LayoutConstants;
pub use tagged::{TaggedLayout, MAX_STRING_LENGTH};

/// A word that decodes as a tagged heap object pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapObject(Address);

impl HeapObject {
    /// Wraps a tagged pointer without validating it
    pub fn from_raw(raw: Address) -> Self {
        Self(raw)
    }

    /// The tagged pointer exactly as it appears in memory
    pub fn raw(self) -> Address {
        self.0
    }
}

/// A heap object known to be a map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapRef(HeapObject);

impl MapRef {
    /// Wraps a heap object that the caller has validated as a map
    pub fn new(object: HeapObject) -> Self {
        Self(object)
    }

    /// The map as a plain heap object
    pub fn object(self) -> HeapObject {
        self.0
    }

    /// The tagged pointer of the map
    pub fn raw(self) -> Address {
        self.0.raw()
    }
}

/// Coarse classification of an instance type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Any string representation
    String,
    /// Generic object family
    Object,
    /// JS array
    Array,
    /// Typed array view
    TypedArray,
    /// Array buffer backing store holder
    ArrayBuffer,
    /// Function (closure)
    Function,
    /// Regular expression
    RegExp,
    /// Compiled code
    Code,
    /// Boxed double
    HeapNumber,
    /// undefined, null, true, false, the hole, ...
    Oddball,
    /// Map (shape) object
    Map,
    /// Fixed array of tagged values
    FixedArray,
    /// Closure context
    Context,
    /// Anything else
    Other,
}

/// Physical representation of a string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRepr {
    /// Characters stored inline
    Sequential,
    /// Concatenation of two strings
    Cons {
        /// Left part
        first: Address,
        /// Right part
        second: Address,
    },
    /// Substring of a parent string
    Sliced {
        /// String the slice points into
        parent: Address,
        /// Start offset inside the parent, in characters
        offset: u64,
    },
    /// Forwarding pointer to an internalized copy
    Thin {
        /// The string this one forwards to
        actual: Address,
    },
    /// Characters live outside the heap
    External,
}

/// Named pointer from a composite string to one of its parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringComponent {
    /// Parent of a sliced string
    Parent,
    /// First part of a cons string
    First,
    /// Second part of a cons string
    Second,
    /// Target of a thin string
    Actual,
}

impl StringComponent {
    /// Label used when printing references (`<Parent>`)
    pub fn label(self) -> &'static str {
        match self {
            StringComponent::Parent => "<Parent>",
            StringComponent::First => "<First>",
            StringComponent::Second => "<Second>",
            StringComponent::Actual => "<Actual>",
        }
    }

    /// Name used for internal edges in heap snapshots
    pub fn edge_name(self) -> &'static str {
        match self {
            StringComponent::Parent => "parent",
            StringComponent::First => "first",
            StringComponent::Second => "second",
            StringComponent::Actual => "actual",
        }
    }
}

impl StringRepr {
    /// Strings this representation points to, in field order
    pub fn components(&self) -> Vec<(StringComponent, Address)> {
        match *self {
            StringRepr::Cons { first, second } => vec![
                (StringComponent::First, first),
                (StringComponent::Second, second),
            ],
            StringRepr::Sliced { parent, .. } => vec![(StringComponent::Parent, parent)],
            StringRepr::Thin { actual } => vec![(StringComponent::Actual, actual)],
            StringRepr::Sequential | StringRepr::External => Vec::new(),
        }
    }

    /// Returns true for strings that point to other strings
    pub fn is_composite(&self) -> bool {
        !self.components().is_empty()
    }
}

/// A named property slot: raw key word and raw value word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyEntry {
    /// Property name (normally a string object)
    pub key: Address,
    /// Stored value
    pub value: Address,
}

/// A closure-captured local variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLocal {
    /// Variable name (normally a string object)
    pub name: Address,
    /// Stored value
    pub value: Address,
}

/// Query interface over a versioned heap object layout.
///
/// Every accessor is read-only. Failures describe one object or one field
/// and are meant to be skipped by the caller, never escalated.
pub trait LayoutModel {
    /// Returns true if `word` is a tagged small integer
    fn is_smi(&self, word: u64) -> bool;

    /// Payload of a small integer
    fn smi_value(&self, word: u64) -> i64;

    /// Interpret `word` as a heap object pointer
    fn as_heap_object(&self, word: u64) -> Option<HeapObject>;

    /// The object's map, validated as a map
    fn map_of(&self, object: HeapObject) -> Result<MapRef>;

    /// Instance type tag stored in a map
    fn map_type_tag(&self, map: MapRef) -> Result<i64>;

    /// Classify an instance type tag
    fn kind_of(&self, tag: i64) -> InstanceKind;

    /// Returns true if `tag` belongs to the generic object family
    fn is_object_family(&self, tag: i64) -> bool;

    /// First instance type tag that is not a string
    fn first_nonstring_type(&self) -> i64;

    /// Human readable type name (constructor name for objects)
    fn type_name(&self, object: HeapObject) -> Result<String>;

    /// Instance size in bytes as recorded in the map
    fn instance_size(&self, map: MapRef) -> Result<u64>;

    /// Number of descriptors owned by the map
    fn own_descriptor_count(&self, map: MapRef) -> Result<u64>;

    /// Names of the descriptors owned by the map, skipping undecodable keys
    fn own_descriptor_names(&self, map: MapRef) -> Result<Vec<String>>;

    /// Number of indexed elements
    fn array_length(&self, object: HeapObject) -> Result<u64>;

    /// Indexed element `index`
    fn array_element(&self, object: HeapObject, index: u64) -> Result<u64>;

    /// All named properties, including descriptor-resident constants
    fn property_entries(&self, object: HeapObject) -> Result<Vec<PropertyEntry>>;

    /// Only field-backed, mutable, non-double named properties
    fn field_properties(&self, object: HeapObject) -> Result<Vec<PropertyEntry>>;

    /// Physical representation of a string
    fn string_repr(&self, object: HeapObject) -> Result<StringRepr>;

    /// Decode a string to text
    fn read_string(&self, object: HeapObject) -> Result<String>;

    /// Returns true if `word` is the hole marker
    fn is_hole(&self, word: u64) -> bool;

    /// Returns true if the object is a closure context
    fn is_context(&self, object: HeapObject) -> Result<bool>;

    /// Captured locals of a context
    fn context_locals(&self, context: HeapObject) -> Result<Vec<ContextLocal>>;

    /// Instance type tag of an object
    fn type_tag(&self, object: HeapObject) -> Result<i64> {
        self.map_type_tag(self.map_of(object)?)
    }

    /// Classification of an object
    fn kind_of_object(&self, object: HeapObject) -> Result<InstanceKind> {
        Ok(self.kind_of(self.type_tag(object)?))
    }

    /// Returns true if `tag` is any string representation
    fn is_string_tag(&self, tag: i64) -> bool {
        tag < self.first_nonstring_type()
    }

    /// Decode `word` as text if it points to a string object
    fn string_value(&self, word: u64) -> Result<Option<String>> {
        if self.is_smi(word) {
            return Ok(None);
        }
        let Some(object) = self.as_heap_object(word) else {
            return Ok(None);
        };
        if !self.is_string_tag(self.type_tag(object)?) {
            return Ok(None);
        }
        self.read_string(object).map(Some)
    }

    /// Look up a named property by its decoded name
    fn get_property(&self, object: HeapObject, name: &str) -> Result<Option<u64>> {
        for entry in self.property_entries(object)? {
            let Some(key) = self.as_heap_object(entry.key) else {
                continue;
            };
            match self.read_string(key) {
                Ok(key) if key == name => return Ok(Some(entry.value)),
                _ => continue,
            }
        }
        Ok(None)
    }
}
