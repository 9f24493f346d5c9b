//! Per-slot descriptions of why an object shows up as a referrer.

use super::{element_values, SearchKey};
use crate::layout::{HeapObject, InstanceKind, LayoutModel, StringComponent};
use crate::memory::Address;
use crate::scanner::ContextSet;
use std::fmt;

/// Where inside the referring object the match sits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Named property
    Property(String),
    /// Indexed element
    Index(u64),
    /// Internal pointer of a composite string
    Component(StringComponent),
    /// Captured variable of a closure context
    ContextLocal(String),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Property(name) | Slot::ContextLocal(name) => write!(f, ".{}", name),
            Slot::Index(index) => write!(f, "[{}]", index),
            Slot::Component(component) => write!(f, ".{}", component.label()),
        }
    }
}

/// One matching slot of one referrer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceLine {
    /// The referring object
    pub source: Address,
    /// Type name of the referring object
    pub type_name: String,
    /// The matching slot
    pub slot: Slot,
    /// Value stored in the slot
    pub target: Address,
    /// Matched string content, for text searches
    pub text: Option<String>,
}

impl fmt::Display for ReferenceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x}: {}{}=0x{:x}",
            self.source, self.type_name, self.slot, self.target
        )?;
        if let Some(text) = &self.text {
            write!(f, " '{}'", text)?;
        }
        Ok(())
    }
}

const UNKNOWN_NAME: &str = "???";

/// Every slot of `source` that matches `key`.
///
/// Objects and arrays are checked element by element and property by
/// property; composite strings by their internal pointers. Anything else
/// (and anything undecodable) yields no lines.
pub fn describe_refs<L: LayoutModel + ?Sized>(
    layout: &L,
    source: Address,
    key: &SearchKey,
) -> Vec<ReferenceLine> {
    let Some(object) = layout.as_heap_object(source) else {
        return Vec::new();
    };
    let Ok(tag) = layout.type_tag(object) else {
        return Vec::new();
    };

    if layout.is_object_family(tag) || layout.kind_of(tag) == InstanceKind::Array {
        describe_object(layout, object, key)
    } else if layout.is_string_tag(tag) {
        describe_string(layout, object, key)
    } else {
        Vec::new()
    }
}

fn describe_object<L: LayoutModel + ?Sized>(
    layout: &L,
    object: HeapObject,
    key: &SearchKey,
) -> Vec<ReferenceLine> {
    let type_name = layout
        .type_name(object)
        .unwrap_or_else(|_| UNKNOWN_NAME.to_string());
    let line = |slot: Slot, target: Address, text: Option<String>| ReferenceLine {
        source: object.raw(),
        type_name: type_name.clone(),
        slot,
        target,
        text,
    };
    let property_name = |key: u64| {
        layout
            .string_value(key)
            .ok()
            .flatten()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    };

    let mut lines = Vec::new();
    let elements = element_values(layout, object);
    let entries = layout.property_entries(object).unwrap_or_default();

    match key {
        SearchKey::Value(value) => {
            for (i, element) in elements.into_iter().enumerate() {
                if element == *value {
                    lines.push(line(Slot::Index(i as u64), element, None));
                }
            }
            for entry in entries.into_iter().filter(|e| e.value == *value) {
                lines.push(line(Slot::Property(property_name(entry.key)), entry.value, None));
            }
        }
        SearchKey::Property(name) => {
            for entry in entries {
                let Some(key) = layout.as_heap_object(entry.key) else {
                    continue;
                };
                match layout.read_string(key) {
                    Ok(decoded) if decoded == *name => {
                        lines.push(line(Slot::Property(decoded), entry.value, None));
                    }
                    _ => {}
                }
            }
        }
        SearchKey::Text(text) => {
            for (i, element) in elements.into_iter().enumerate() {
                if let Ok(Some(found)) = layout.string_value(element) {
                    if found == *text {
                        lines.push(line(Slot::Index(i as u64), element, Some(found)));
                    }
                }
            }
            for entry in entries {
                if let Ok(Some(found)) = layout.string_value(entry.value) {
                    if found == *text {
                        let slot = Slot::Property(property_name(entry.key));
                        lines.push(line(slot, entry.value, Some(found)));
                    }
                }
            }
        }
    }

    lines
}

fn describe_string<L: LayoutModel + ?Sized>(
    layout: &L,
    string: HeapObject,
    key: &SearchKey,
) -> Vec<ReferenceLine> {
    let Ok(repr) = layout.string_repr(string) else {
        return Vec::new();
    };
    let type_name = layout
        .type_name(string)
        .unwrap_or_else(|_| UNKNOWN_NAME.to_string());

    let mut lines = Vec::new();
    for (component, target) in repr.components() {
        let text = match key {
            SearchKey::Value(value) if target == *value => None,
            SearchKey::Text(text) => match layout.string_value(target) {
                Ok(Some(found)) if found == *text => Some(found),
                _ => continue,
            },
            _ => continue,
        };
        lines.push(ReferenceLine {
            source: string.raw(),
            type_name: type_name.clone(),
            slot: Slot::Component(component),
            target,
            text,
        });
    }
    lines
}

/// Context locals holding `target`, one line per matching local
pub fn context_references<L: LayoutModel + ?Sized>(
    layout: &L,
    contexts: &ContextSet,
    target: Address,
) -> Vec<ReferenceLine> {
    let mut lines = Vec::new();

    for context in contexts.iter() {
        let Some(object) = layout.as_heap_object(context) else {
            continue;
        };
        let Ok(locals) = layout.context_locals(object) else {
            continue;
        };

        for local in locals.into_iter().filter(|l| l.value == target) {
            let name = match layout.string_value(local.name) {
                Ok(Some(name)) => name,
                _ => UNKNOWN_NAME.to_string(),
            };
            lines.push(ReferenceLine {
                source: context,
                type_name: "Context".to_string(),
                slot: Slot::ContextLocal(name),
                target,
                text: None,
            });
        }
    }

    lines
}
