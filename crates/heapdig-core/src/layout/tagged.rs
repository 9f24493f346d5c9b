//! [`LayoutModel`] for pointer-tagging runtimes.

use super::{
    ContextLocal, HeapObject, InstanceKind, LayoutConstants, LayoutModel, MapRef, PropertyEntry,
    StringRepr,
};
use crate::error::{Error, Result};
use crate::memory::{AddressWidth, MemoryProvider, ProcessImage};

/// Strings longer than this many code units are treated as corrupt
pub const MAX_STRING_LENGTH: u64 = 1 << 24;

/// Longest chain of map back pointers followed when looking for a constructor
const MAX_BACK_POINTER_DEPTH: usize = 16;

/// Decoded property details of one descriptor
#[derive(Debug, Clone, Copy)]
struct PropertyDetails {
    is_accessor: bool,
    in_descriptor: bool,
    is_const: bool,
    is_double: bool,
    field_index: u64,
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    key: u64,
    details: PropertyDetails,
    value: u64,
}

/// Layout model reading objects straight out of a [`MemoryProvider`]
pub struct TaggedLayout<'m, M: MemoryProvider + ?Sized> {
    memory: &'m M,
    constants: LayoutConstants,
    word: u64,
}

impl<'m, M: MemoryProvider + ?Sized> TaggedLayout<'m, M> {
    /// Creates a layout with explicit constants
    pub fn new(memory: &'m M, constants: LayoutConstants) -> Self {
        let word = memory.address_width().bytes();
        Self {
            memory,
            constants,
            word,
        }
    }

    /// Creates a layout with the default constants for the image's word size
    pub fn for_memory(memory: &'m M) -> Self {
        Self::new(memory, LayoutConstants::for_width(memory.address_width()))
    }

    /// The constants this layout decodes with
    pub fn constants(&self) -> &LayoutConstants {
        &self.constants
    }

    fn untagged(&self, object: HeapObject) -> u64 {
        object.raw() & !self.constants.heap_object_tag_mask
    }

    fn field(&self, object: HeapObject, offset: u64) -> Result<u64> {
        self.memory.read_word(self.untagged(object) + offset)
    }

    fn smi_field(&self, object: HeapObject, offset: u64) -> Result<i64> {
        let word = self.field(object, offset)?;
        if !self.is_smi(word) {
            return Err(Error::decode(object.raw(), "small integer field"));
        }
        Ok(self.smi_value(word))
    }

    fn heap_field(&self, object: HeapObject, offset: u64, what: &str) -> Result<HeapObject> {
        let word = self.field(object, offset)?;
        self.as_heap_object(word)
            .ok_or_else(|| Error::decode(word, what))
    }

    fn expect_kind(&self, object: HeapObject, kind: InstanceKind, what: &str) -> Result<i64> {
        let tag = self.type_tag(object)?;
        if self.kind_of(tag) != kind {
            return Err(Error::decode(object.raw(), what));
        }
        Ok(tag)
    }

    fn fixed_array_length(&self, array: HeapObject) -> Result<u64> {
        let length = self.smi_field(array, self.constants.fixed_array_length)?;
        u64::try_from(length).map_err(|_| Error::decode(array.raw(), "non-negative length"))
    }

    fn fixed_array_slot(&self, array: HeapObject, index: u64) -> Result<u64> {
        self.field(array, self.constants.fixed_array_data + index * self.word)
    }

    fn bounded_slot(&self, array: HeapObject, index: u64) -> Result<u64> {
        if index >= self.fixed_array_length(array)? {
            return Err(Error::lookup_miss(format!(
                "slot {} of 0x{:x}",
                index,
                array.raw()
            )));
        }
        self.fixed_array_slot(array, index)
    }

    fn bit_field3(&self, map: MapRef) -> Result<u32> {
        self.memory
            .read_u32(self.untagged(map.object()) + self.constants.map_bit_field3)
    }

    fn is_dictionary_map(&self, map: MapRef) -> Result<bool> {
        Ok(self.bit_field3(map)? & (1 << self.constants.dictionary_map_bit) != 0)
    }

    fn in_object_properties(&self, map: MapRef) -> Result<u64> {
        let offset = self.untagged(map.object()) + self.constants.map_in_object_properties;
        Ok(self.memory.read_u8(offset)? as u64)
    }

    fn decode_details(&self, word: u64) -> Result<PropertyDetails> {
        if !self.is_smi(word) {
            return Err(Error::decode(word, "property details"));
        }
        let c = &self.constants;
        let bits = self.smi_value(word) as u64;
        let representation = (bits >> c.details_representation_shift) & c.details_representation_mask;
        Ok(PropertyDetails {
            is_accessor: bits & c.details_kind_mask != 0,
            in_descriptor: bits & c.details_location_mask != 0,
            is_const: bits & c.details_const_mask != 0,
            is_double: representation == c.representation_double,
            field_index: (bits >> c.details_field_index_shift) & c.details_field_index_mask,
        })
    }

    fn descriptors(&self, map: MapRef) -> Result<Vec<Descriptor>> {
        let count = self.own_descriptor_count(map)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let c = &self.constants;
        let array = self.heap_field(map.object(), c.map_descriptors, "descriptor array")?;
        let mut out = Vec::with_capacity(count as usize);

        for i in 0..count {
            let entry = c.descriptor_array_entries + i * c.descriptor_entry_size * self.word;
            let key = self.field(array, entry + c.descriptor_key_index * self.word)?;
            let details = self.field(array, entry + c.descriptor_details_index * self.word)?;
            let value = self.field(array, entry + c.descriptor_value_index * self.word)?;
            let Ok(details) = self.decode_details(details) else {
                continue;
            };
            out.push(Descriptor {
                key,
                details,
                value,
            });
        }

        Ok(out)
    }

    /// Load a field-backed property: negative indices live inside the
    /// object, the rest in the out-of-object properties array
    fn field_value(&self, object: HeapObject, map: MapRef, field_index: u64) -> Result<u64> {
        let in_object = self.in_object_properties(map)?;
        if field_index < in_object {
            let size = self.instance_size(map)?;
            let offset = (in_object - field_index)
                .checked_mul(self.word)
                .and_then(|back| size.checked_sub(back))
                .ok_or_else(|| Error::decode(map.raw(), "in-object property offset"))?;
            self.field(object, offset)
        } else {
            let properties =
                self.heap_field(object, self.constants.js_object_properties, "properties")?;
            self.bounded_slot(properties, field_index - in_object)
        }
    }

    fn dictionary_entries(&self, object: HeapObject) -> Result<Vec<PropertyEntry>> {
        let c = &self.constants;
        let table = self.heap_field(object, c.js_object_properties, "property dictionary")?;
        let length = self.fixed_array_length(table)?;
        let capacity = length.saturating_sub(c.dictionary_prefix_size) / c.dictionary_entry_size;

        let mut out = Vec::new();
        for i in 0..capacity {
            let slot = c.dictionary_prefix_size + i * c.dictionary_entry_size;
            let key = self.fixed_array_slot(table, slot)?;
            let Some(key_object) = self.as_heap_object(key) else {
                continue;
            };
            // empty and deleted entries hold oddballs
            match self.type_tag(key_object) {
                Ok(tag) if self.is_string_tag(tag) => {}
                _ => continue,
            }
            let value = self.fixed_array_slot(table, slot + 1)?;
            out.push(PropertyEntry { key, value });
        }
        Ok(out)
    }

    fn constructor_name(&self, map: MapRef) -> Result<Option<String>> {
        let c = &self.constants;
        let mut current = self.field(map.object(), c.map_constructor)?;

        for _ in 0..MAX_BACK_POINTER_DEPTH {
            let Some(object) = self.as_heap_object(current) else {
                return Ok(None);
            };
            let tag = self.type_tag(object)?;
            if tag == c.map_type {
                current = self.field(object, c.map_constructor)?;
                continue;
            }
            if tag != c.js_function_type {
                return Ok(None);
            }
            let shared = self.heap_field(object, c.js_function_shared, "shared function info")?;
            let name = self.heap_field(shared, c.shared_info_name, "function name")?;
            let name = self.read_string(name)?;
            return Ok((!name.is_empty()).then_some(name));
        }

        Ok(None)
    }

    fn read_flat(&self, object: HeapObject, tag: i64) -> Result<String> {
        let c = &self.constants;
        let length = self.memory.read_u32(self.untagged(object) + c.string_length)? as u64;
        if length > MAX_STRING_LENGTH {
            return Err(Error::decode(object.raw(), "string of sane length"));
        }

        let data = self.untagged(object) + c.seq_string_data;
        if tag & c.string_encoding_mask == c.one_byte_string_tag {
            let mut bytes = vec![0u8; length as usize];
            self.memory.read_bytes(data, &mut bytes)?;
            Ok(bytes.into_iter().map(char::from).collect())
        } else {
            let mut bytes = vec![0u8; length as usize * 2];
            self.memory.read_bytes(data, &mut bytes)?;
            let order = self.memory.byte_order();
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| order.decode(pair) as u16)
                .collect();
            Ok(String::from_utf16_lossy(&units))
        }
    }
}

impl<'m> TaggedLayout<'m, ProcessImage> {
    /// Creates a layout honouring the image's layout overrides
    pub fn for_image(image: &'m ProcessImage) -> Self {
        let constants = image
            .layout_constants()
            .cloned()
            .unwrap_or_else(|| LayoutConstants::for_width(image.address_width()));
        Self::new(image, constants)
    }
}

impl<M: MemoryProvider + ?Sized> LayoutModel for TaggedLayout<'_, M> {
    fn is_smi(&self, word: u64) -> bool {
        word & self.constants.smi_tag_mask == self.constants.smi_tag
    }

    fn smi_value(&self, word: u64) -> i64 {
        match self.memory.address_width() {
            AddressWidth::Eight => (word as i64) >> self.constants.smi_shift,
            AddressWidth::Four => ((word as u32 as i32) >> self.constants.smi_shift) as i64,
        }
    }

    fn as_heap_object(&self, word: u64) -> Option<HeapObject> {
        let c = &self.constants;
        if word & c.heap_object_tag_mask != c.heap_object_tag {
            return None;
        }
        let untagged = word & !c.heap_object_tag_mask;
        if untagged == 0 || untagged % self.word != 0 {
            return None;
        }
        if self.word == 4 && word > u32::MAX as u64 {
            return None;
        }
        Some(HeapObject::from_raw(word))
    }

    fn map_of(&self, object: HeapObject) -> Result<MapRef> {
        let c = &self.constants;
        let map = self.heap_field(object, c.heap_object_map, "map pointer")?;
        let meta = self.heap_field(map, c.heap_object_map, "meta map pointer")?;
        let meta_type = self
            .memory
            .read_u16(self.untagged(meta) + c.map_instance_type)? as i64;
        if meta_type != c.map_type {
            return Err(Error::decode(map.raw(), "map"));
        }
        Ok(MapRef::new(map))
    }

    fn map_type_tag(&self, map: MapRef) -> Result<i64> {
        let offset = self.untagged(map.object()) + self.constants.map_instance_type;
        Ok(self.memory.read_u16(offset)? as i64)
    }

    fn kind_of(&self, tag: i64) -> InstanceKind {
        let c = &self.constants;
        if tag < c.first_nonstring_type {
            InstanceKind::String
        } else if tag == c.js_array_type {
            InstanceKind::Array
        } else if c.object_types.contains(&tag) {
            InstanceKind::Object
        } else if tag == c.js_typed_array_type {
            InstanceKind::TypedArray
        } else if tag == c.js_array_buffer_type {
            InstanceKind::ArrayBuffer
        } else if tag == c.js_function_type {
            InstanceKind::Function
        } else if tag == c.js_regexp_type {
            InstanceKind::RegExp
        } else if tag == c.code_type {
            InstanceKind::Code
        } else if tag == c.heap_number_type {
            InstanceKind::HeapNumber
        } else if tag == c.oddball_type {
            InstanceKind::Oddball
        } else if tag == c.map_type {
            InstanceKind::Map
        } else if tag == c.fixed_array_type {
            InstanceKind::FixedArray
        } else if (c.first_context_type..=c.last_context_type).contains(&tag) {
            InstanceKind::Context
        } else {
            InstanceKind::Other
        }
    }

    fn is_object_family(&self, tag: i64) -> bool {
        self.constants.object_types.contains(&tag)
    }

    fn first_nonstring_type(&self) -> i64 {
        self.constants.first_nonstring_type
    }

    fn type_name(&self, object: HeapObject) -> Result<String> {
        let map = self.map_of(object)?;
        let tag = self.map_type_tag(map)?;
        let name = match self.kind_of(tag) {
            InstanceKind::Object => {
                return Ok(self
                    .constructor_name(map)?
                    .unwrap_or_else(|| "Object".to_string()))
            }
            InstanceKind::Array => "Array",
            InstanceKind::TypedArray => "(ArrayBufferView)",
            InstanceKind::ArrayBuffer => "(ArrayBuffer)",
            InstanceKind::String => "(String)",
            InstanceKind::Function => "(Function)",
            InstanceKind::RegExp => "(RegExp)",
            InstanceKind::Code => "(Code)",
            InstanceKind::HeapNumber => "(HeapNumber)",
            InstanceKind::Oddball => "(Oddball)",
            InstanceKind::Map => "(Map)",
            InstanceKind::FixedArray => "(FixedArray)",
            InstanceKind::Context => "Context",
            InstanceKind::Other => return Ok(format!("(Type {})", tag)),
        };
        Ok(name.to_string())
    }

    fn instance_size(&self, map: MapRef) -> Result<u64> {
        let offset = self.untagged(map.object()) + self.constants.map_instance_size;
        Ok(self.memory.read_u8(offset)? as u64 * self.word)
    }

    fn own_descriptor_count(&self, map: MapRef) -> Result<u64> {
        let c = &self.constants;
        Ok(((self.bit_field3(map)? >> c.own_descriptors_shift) & c.own_descriptors_mask) as u64)
    }

    fn own_descriptor_names(&self, map: MapRef) -> Result<Vec<String>> {
        Ok(self
            .descriptors(map)?
            .into_iter()
            .filter_map(|d| self.as_heap_object(d.key))
            .filter_map(|key| self.read_string(key).ok())
            .collect())
    }

    fn array_length(&self, object: HeapObject) -> Result<u64> {
        let c = &self.constants;
        let elements = self.heap_field(object, c.js_object_elements, "elements")?;
        let elements_tag = self.type_tag(elements)?;
        if elements_tag == c.fixed_double_array_type {
            // unboxed doubles, nothing to reference
            return Ok(0);
        }
        if elements_tag != c.fixed_array_type {
            return Err(Error::decode(elements.raw(), "fixed array"));
        }

        let capacity = self.fixed_array_length(elements)?;
        if self.type_tag(object)? == c.js_array_type {
            let length = self.smi_field(object, c.js_array_length)?;
            let length = u64::try_from(length)
                .map_err(|_| Error::decode(object.raw(), "non-negative array length"))?;
            return Ok(length.min(capacity));
        }
        Ok(capacity)
    }

    fn array_element(&self, object: HeapObject, index: u64) -> Result<u64> {
        let elements = self.heap_field(object, self.constants.js_object_elements, "elements")?;
        self.bounded_slot(elements, index)
    }

    fn property_entries(&self, object: HeapObject) -> Result<Vec<PropertyEntry>> {
        let map = self.map_of(object)?;
        if self.is_dictionary_map(map)? {
            return self.dictionary_entries(object);
        }

        let mut out = Vec::new();
        for descriptor in self.descriptors(map)? {
            let details = descriptor.details;
            let value = if details.in_descriptor {
                descriptor.value
            } else if details.is_double || details.is_accessor {
                continue;
            } else {
                match self.field_value(object, map, details.field_index) {
                    Ok(value) => value,
                    Err(_) => continue,
                }
            };
            out.push(PropertyEntry {
                key: descriptor.key,
                value,
            });
        }
        Ok(out)
    }

    fn field_properties(&self, object: HeapObject) -> Result<Vec<PropertyEntry>> {
        let map = self.map_of(object)?;
        if self.is_dictionary_map(map)? {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for descriptor in self.descriptors(map)? {
            let details = descriptor.details;
            if details.in_descriptor
                || details.is_const
                || details.is_double
                || details.is_accessor
            {
                continue;
            }
            let Ok(value) = self.field_value(object, map, details.field_index) else {
                continue;
            };
            out.push(PropertyEntry {
                key: descriptor.key,
                value,
            });
        }
        Ok(out)
    }

    fn string_repr(&self, object: HeapObject) -> Result<StringRepr> {
        let c = &self.constants;
        let tag = self.expect_kind(object, InstanceKind::String, "string")?;
        let repr = tag & c.string_representation_mask;

        if repr == c.seq_string_tag {
            Ok(StringRepr::Sequential)
        } else if repr == c.cons_string_tag {
            Ok(StringRepr::Cons {
                first: self.field(object, c.cons_string_first)?,
                second: self.field(object, c.cons_string_second)?,
            })
        } else if repr == c.sliced_string_tag {
            let offset = self.smi_field(object, c.sliced_string_offset)?;
            Ok(StringRepr::Sliced {
                parent: self.field(object, c.sliced_string_parent)?,
                offset: u64::try_from(offset)
                    .map_err(|_| Error::decode(object.raw(), "non-negative slice offset"))?,
            })
        } else if repr == c.thin_string_tag {
            Ok(StringRepr::Thin {
                actual: self.field(object, c.thin_string_actual)?,
            })
        } else if repr == c.external_string_tag {
            Ok(StringRepr::External)
        } else {
            Err(Error::decode(object.raw(), "known string representation"))
        }
    }

    fn read_string(&self, object: HeapObject) -> Result<String> {
        let mut out = String::new();
        let mut pending = vec![object];
        let mut steps = 0u64;

        while let Some(current) = pending.pop() {
            steps += 1;
            if steps > MAX_STRING_LENGTH || out.len() as u64 > MAX_STRING_LENGTH {
                return Err(Error::decode(object.raw(), "string of sane length"));
            }

            let tag = self.expect_kind(current, InstanceKind::String, "string")?;
            match self.string_repr(current)? {
                StringRepr::Sequential => out.push_str(&self.read_flat(current, tag)?),
                StringRepr::Cons { first, second } => {
                    let first = self.as_heap_object(first).ok_or_else(|| Error::decode(first, "string"))?;
                    let second =
                        self.as_heap_object(second).ok_or_else(|| Error::decode(second, "string"))?;
                    pending.push(second);
                    pending.push(first);
                }
                StringRepr::Thin { actual } => {
                    let actual =
                        self.as_heap_object(actual).ok_or_else(|| Error::decode(actual, "string"))?;
                    pending.push(actual);
                }
                StringRepr::Sliced { parent, offset } => {
                    let parent =
                        self.as_heap_object(parent).ok_or_else(|| Error::decode(parent, "string"))?;
                    if self.string_repr(parent)? == StringRepr::Sequential {
                        let length = self
                            .memory
                            .read_u32(self.untagged(current) + self.constants.string_length)?;
                        let parent_tag = self.type_tag(parent)?;
                        let text = self.read_flat(parent, parent_tag)?;
                        out.extend(text.chars().skip(offset as usize).take(length as usize));
                    } else {
                        return Err(Error::decode(parent.raw(), "flat slice parent"));
                    }
                }
                StringRepr::External => {
                    return Err(Error::decode(current.raw(), "on-heap string"));
                }
            }
        }

        Ok(out)
    }

    fn is_hole(&self, word: u64) -> bool {
        let Some(object) = self.as_heap_object(word) else {
            return false;
        };
        match self.type_tag(object) {
            Ok(tag) if tag == self.constants.oddball_type => {}
            _ => return false,
        }
        matches!(
            self.smi_field(object, self.constants.oddball_kind),
            Ok(kind) if kind == self.constants.oddball_hole
        )
    }

    fn is_context(&self, object: HeapObject) -> Result<bool> {
        Ok(self.kind_of(self.type_tag(object)?) == InstanceKind::Context)
    }

    fn context_locals(&self, context: HeapObject) -> Result<Vec<ContextLocal>> {
        let c = &self.constants;
        self.expect_kind(context, InstanceKind::Context, "context")?;
        let slots = self.fixed_array_length(context)?;

        let scope_info = self.bounded_slot(context, c.context_scope_info_index)?;
        let scope_info = self
            .as_heap_object(scope_info)
            .ok_or_else(|| Error::decode(scope_info, "scope info"))?;
        if self.type_tag(scope_info)? != c.scope_info_type {
            return Err(Error::decode(scope_info.raw(), "scope info"));
        }

        let count = self.bounded_slot(scope_info, c.scope_info_context_local_count)?;
        if !self.is_smi(count) || self.smi_value(count) < 0 {
            return Err(Error::decode(count, "context local count"));
        }
        let count = self.smi_value(count) as u64;

        let mut out = Vec::new();
        for i in 0..count {
            let slot = c.context_min_slots + i;
            if slot >= slots {
                break;
            }
            let name = self.bounded_slot(scope_info, c.scope_info_context_local_names + i)?;
            let value = self.fixed_array_slot(context, slot)?;
            out.push(ContextLocal { name, value });
        }
        Ok(out)
    }
}
