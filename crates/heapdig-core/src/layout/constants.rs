//! Versioned description of the heap object layout.
//!
//! Offsets are in bytes from the untagged start of an object and assume a
//! 64-bit image; [`LayoutConstants::for_width`] rescales the word-based
//! offsets for 32-bit images. Every field has a default, so an image
//! manifest only needs to list the values that differ.

use crate::memory::AddressWidth;
use serde::{Deserialize, Serialize};

/// Layout constants for one runtime build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConstants {
    // Tagging
    /// Mask selecting the small-integer tag bits
    pub smi_tag_mask: u64,
    /// Value of the small-integer tag bits
    pub smi_tag: u64,
    /// Shift applied to small-integer payloads (32 on 64-bit, 1 on 32-bit)
    pub smi_shift: u32,
    /// Mask selecting the heap-object tag bits
    pub heap_object_tag_mask: u64,
    /// Value of the heap-object tag bits
    pub heap_object_tag: u64,

    // HeapObject / Map
    /// Offset of the map pointer in every heap object
    pub heap_object_map: u64,
    /// Offset of the instance size (u8, in words)
    pub map_instance_size: u64,
    /// Offset of the in-object property count (u8)
    pub map_in_object_properties: u64,
    /// Offset of the instance type (u16)
    pub map_instance_type: u64,
    /// Offset of bit field 3 (u32)
    pub map_bit_field3: u64,
    /// Offset of the constructor-or-back-pointer slot
    pub map_constructor: u64,
    /// Offset of the instance descriptors slot
    pub map_descriptors: u64,
    /// Shift of the own-descriptor count inside bit field 3
    pub own_descriptors_shift: u32,
    /// Mask of the own-descriptor count (after shifting)
    pub own_descriptors_mask: u32,
    /// Bit of bit field 3 marking dictionary-mode maps
    pub dictionary_map_bit: u32,

    // JSObject / JSArray
    /// Offset of the out-of-object properties pointer
    pub js_object_properties: u64,
    /// Offset of the elements pointer
    pub js_object_elements: u64,
    /// Offset of the array length (small integer)
    pub js_array_length: u64,

    // FixedArray and friends
    /// Offset of the fixed array length (small integer)
    pub fixed_array_length: u64,
    /// Offset of the first fixed array element
    pub fixed_array_data: u64,
    /// Offset of the first descriptor entry
    pub descriptor_array_entries: u64,
    /// Number of words per descriptor entry
    pub descriptor_entry_size: u64,
    /// Word index of the key inside a descriptor entry
    pub descriptor_key_index: u64,
    /// Word index of the details inside a descriptor entry
    pub descriptor_details_index: u64,
    /// Word index of the value inside a descriptor entry
    pub descriptor_value_index: u64,

    // Property details (payload of a small integer)
    /// Mask of the property-kind bit (set for accessors)
    pub details_kind_mask: u64,
    /// Mask of the location bit (set when the value lives in the descriptor)
    pub details_location_mask: u64,
    /// Mask of the constness bit (set for constant fields)
    pub details_const_mask: u64,
    /// Shift of the representation bits
    pub details_representation_shift: u32,
    /// Mask of the representation bits (after shifting)
    pub details_representation_mask: u64,
    /// Representation value for unboxed doubles
    pub representation_double: u64,
    /// Shift of the field index bits
    pub details_field_index_shift: u32,
    /// Mask of the field index bits (after shifting)
    pub details_field_index_mask: u64,

    // Dictionary-mode properties
    /// Elements of a hash table before the first entry
    pub dictionary_prefix_size: u64,
    /// Words per dictionary entry (key, value, details)
    pub dictionary_entry_size: u64,

    // Strings
    /// Offset of the string length (u32)
    pub string_length: u64,
    /// Offset of sequential string characters
    pub seq_string_data: u64,
    /// Offset of a cons string's first part
    pub cons_string_first: u64,
    /// Offset of a cons string's second part
    pub cons_string_second: u64,
    /// Offset of a sliced string's parent
    pub sliced_string_parent: u64,
    /// Offset of a sliced string's start offset (small integer)
    pub sliced_string_offset: u64,
    /// Offset of a thin string's target
    pub thin_string_actual: u64,
    /// Mask of the representation bits of a string instance type
    pub string_representation_mask: i64,
    /// Representation tag of sequential strings
    pub seq_string_tag: i64,
    /// Representation tag of cons strings
    pub cons_string_tag: i64,
    /// Representation tag of external strings
    pub external_string_tag: i64,
    /// Representation tag of sliced strings
    pub sliced_string_tag: i64,
    /// Representation tag of thin strings
    pub thin_string_tag: i64,
    /// Mask of the encoding bit of a string instance type
    pub string_encoding_mask: i64,
    /// Encoding value for one-byte strings
    pub one_byte_string_tag: i64,

    // Oddballs
    /// Offset of the oddball kind (small integer)
    pub oddball_kind: u64,
    /// Kind of the hole oddball
    pub oddball_hole: i64,

    // Functions
    /// Offset of a function's shared info
    pub js_function_shared: u64,
    /// Offset of a shared function info's name
    pub shared_info_name: u64,

    // Contexts
    /// Slot index of a context's scope info
    pub context_scope_info_index: u64,
    /// Number of header slots before the first local
    pub context_min_slots: u64,
    /// Slot index of the context-local count inside a scope info
    pub scope_info_context_local_count: u64,
    /// Slot index of the first context-local name inside a scope info
    pub scope_info_context_local_names: u64,

    // Instance types
    /// First instance type that is not a string
    pub first_nonstring_type: i64,
    /// Heap number instance type
    pub heap_number_type: i64,
    /// Oddball instance type
    pub oddball_type: i64,
    /// Map instance type
    pub map_type: i64,
    /// Code instance type
    pub code_type: i64,
    /// Fixed array instance type
    pub fixed_array_type: i64,
    /// Fixed double array instance type
    pub fixed_double_array_type: i64,
    /// Descriptor array instance type
    pub descriptor_array_type: i64,
    /// Shared function info instance type
    pub shared_function_info_type: i64,
    /// Scope info instance type
    pub scope_info_type: i64,
    /// First context instance type
    pub first_context_type: i64,
    /// Last context instance type
    pub last_context_type: i64,
    /// Plain object instance type
    pub js_object_type: i64,
    /// Instance types treated as generic objects
    pub object_types: Vec<i64>,
    /// Array instance type
    pub js_array_type: i64,
    /// Typed array instance type
    pub js_typed_array_type: i64,
    /// Array buffer instance type
    pub js_array_buffer_type: i64,
    /// Function instance type
    pub js_function_type: i64,
    /// Regular expression instance type
    pub js_regexp_type: i64,
}

impl Default for LayoutConstants {
    fn default() -> Self {
        Self {
            smi_tag_mask: 1,
            smi_tag: 0,
            smi_shift: 32,
            heap_object_tag_mask: 3,
            heap_object_tag: 1,

            heap_object_map: 0,
            map_instance_size: 8,
            map_in_object_properties: 9,
            map_instance_type: 12,
            map_bit_field3: 16,
            map_constructor: 32,
            map_descriptors: 40,
            own_descriptors_shift: 10,
            own_descriptors_mask: 0x3ff,
            dictionary_map_bit: 21,

            js_object_properties: 8,
            js_object_elements: 16,
            js_array_length: 24,

            fixed_array_length: 8,
            fixed_array_data: 16,
            descriptor_array_entries: 24,
            descriptor_entry_size: 3,
            descriptor_key_index: 0,
            descriptor_details_index: 1,
            descriptor_value_index: 2,

            details_kind_mask: 0x1,
            details_location_mask: 0x2,
            details_const_mask: 0x4,
            details_representation_shift: 3,
            details_representation_mask: 0x7,
            representation_double: 2,
            details_field_index_shift: 6,
            details_field_index_mask: 0x3ff,

            dictionary_prefix_size: 3,
            dictionary_entry_size: 3,

            string_length: 12,
            seq_string_data: 16,
            cons_string_first: 16,
            cons_string_second: 24,
            sliced_string_parent: 16,
            sliced_string_offset: 24,
            thin_string_actual: 16,
            string_representation_mask: 0x7,
            seq_string_tag: 0x0,
            cons_string_tag: 0x1,
            external_string_tag: 0x2,
            sliced_string_tag: 0x3,
            thin_string_tag: 0x5,
            string_encoding_mask: 0x8,
            one_byte_string_tag: 0x8,

            oddball_kind: 8,
            oddball_hole: 2,

            js_function_shared: 24,
            shared_info_name: 8,

            context_scope_info_index: 0,
            context_min_slots: 4,
            scope_info_context_local_count: 2,
            scope_info_context_local_names: 3,

            first_nonstring_type: 0x80,
            heap_number_type: 0x82,
            oddball_type: 0x83,
            map_type: 0x84,
            code_type: 0x85,
            fixed_array_type: 0x86,
            fixed_double_array_type: 0x87,
            descriptor_array_type: 0x88,
            shared_function_info_type: 0x89,
            scope_info_type: 0x8a,
            first_context_type: 0x90,
            last_context_type: 0x98,
            js_object_type: 0x421,
            object_types: vec![0x421, 0x422, 0x423, 0x424, 0x425, 0x426],
            js_array_type: 0x430,
            js_typed_array_type: 0x431,
            js_array_buffer_type: 0x432,
            js_function_type: 0x433,
            js_regexp_type: 0x434,
        }
    }
}

impl LayoutConstants {
    /// Default constants adjusted for the given address width.
    ///
    /// Word-sized offsets are halved and the small-integer shift drops to 1
    /// on 32-bit images. Sub-word map fields keep their relative positions.
    pub fn for_width(width: AddressWidth) -> Self {
        let defaults = Self::default();
        match width {
            AddressWidth::Eight => defaults,
            AddressWidth::Four => Self {
                smi_shift: 1,
                map_instance_size: 4,
                map_in_object_properties: 5,
                map_instance_type: 6,
                map_bit_field3: 8,
                map_constructor: 16,
                map_descriptors: 20,
                js_object_properties: 4,
                js_object_elements: 8,
                js_array_length: 12,
                fixed_array_length: 4,
                fixed_array_data: 8,
                descriptor_array_entries: 12,
                string_length: 8,
                seq_string_data: 12,
                cons_string_first: 12,
                cons_string_second: 16,
                sliced_string_parent: 12,
                sliced_string_offset: 16,
                thin_string_actual: 12,
                oddball_kind: 4,
                js_function_shared: 12,
                shared_info_name: 4,
                ..defaults
            },
        }
    }
}
