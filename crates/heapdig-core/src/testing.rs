//! Synthetic heaps for unit tests.
//!
//! [`HeapBuilder`] lays objects out word by word in a single writable
//! region of a 64-bit little-endian image, using the default
//! [`LayoutConstants`]. Every object handed back to the caller is also
//! recorded in a roots array so a memory scan finds it even when nothing
//! else points to it.

use crate::layout::LayoutConstants;
use crate::memory::{AddressWidth, ByteOrder, ImageRegion, ProcessImage};
use std::collections::HashMap;

/// Base address of the synthetic heap region
pub(crate) const HEAP_BASE: u64 = 0x10000;

const WORD: u64 = 8;

pub(crate) struct HeapBuilder {
    c: LayoutConstants,
    words: Vec<u64>,
    roots: Vec<u64>,
    maps: HashMap<i64, u64>,
    meta_map: u64,
    empty_array: u64,
    hole: Option<u64>,
    undefined: Option<u64>,
}

impl HeapBuilder {
    pub(crate) fn new() -> Self {
        let mut heap = Self {
            c: LayoutConstants::default(),
            words: Vec::new(),
            roots: Vec::new(),
            maps: HashMap::new(),
            meta_map: 0,
            empty_array: 0,
            hole: None,
            undefined: None,
        };

        let map_type = heap.c.map_type;
        let meta = heap.alloc(vec![0; 6]);
        heap.set(meta, 0, meta);
        heap.set(meta, 1, Self::map_header(6, 0, map_type));
        heap.meta_map = meta;
        heap.maps.insert(map_type, meta);

        heap.empty_array = heap.fixed_array(&[]);
        heap
    }

    /// Tagged small integer
    pub(crate) fn smi(value: i64) -> u64 {
        (value << 32) as u64
    }

    /// Tagged address of the next allocation
    pub(crate) fn next_address(&self) -> u64 {
        HEAP_BASE + self.words.len() as u64 * WORD + 1
    }

    fn alloc(&mut self, words: Vec<u64>) -> u64 {
        let tagged = self.next_address();
        self.words.extend(words);
        tagged
    }

    fn set(&mut self, tagged: u64, index: usize, value: u64) {
        let start = ((tagged - 1 - HEAP_BASE) / WORD) as usize;
        self.words[start + index] = value;
    }

    fn root(&mut self, tagged: u64) -> u64 {
        self.roots.push(tagged);
        tagged
    }

    fn map_header(size_words: u8, in_object: u8, tag: i64) -> u64 {
        size_words as u64 | (in_object as u64) << 8 | (tag as u64) << 32
    }

    fn new_map(
        &mut self,
        tag: i64,
        size_words: u8,
        in_object: u8,
        bit_field3: u32,
        constructor: u64,
        descriptors: u64,
    ) -> u64 {
        let meta = self.meta_map;
        self.alloc(vec![
            meta,
            Self::map_header(size_words, in_object, tag),
            bit_field3 as u64,
            0,
            constructor,
            descriptors,
        ])
    }

    fn map(&mut self, tag: i64, size_words: u8) -> u64 {
        if let Some(&map) = self.maps.get(&tag) {
            return map;
        }
        let empty = self.empty_array;
        let map = self.new_map(tag, size_words, 0, 0, 0, empty);
        self.maps.insert(tag, map);
        map
    }

    fn fixed_array_typed(&mut self, tag: i64, values: &[u64]) -> u64 {
        let map = self.map(tag, 0);
        let mut words = vec![map, Self::smi(values.len() as i64)];
        words.extend_from_slice(values);
        self.alloc(words)
    }

    fn fixed_array(&mut self, values: &[u64]) -> u64 {
        let tag = self.c.fixed_array_type;
        self.fixed_array_typed(tag, values)
    }

    fn elements(&mut self, values: &[u64]) -> u64 {
        if values.is_empty() {
            self.empty_array
        } else {
            self.fixed_array(values)
        }
    }

    fn pack_bytes(bytes: &[u8]) -> Vec<u64> {
        bytes
            .chunks(WORD as usize)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect()
    }

    fn string_header(length: usize) -> u64 {
        (length as u64) << 32
    }

    /// One-byte sequential string
    pub(crate) fn string(&mut self, text: &str) -> u64 {
        let tag = self.c.seq_string_tag | self.c.one_byte_string_tag;
        let map = self.map(tag, 0);
        let bytes: Vec<u8> = text.chars().map(|c| c as u8).collect();
        let mut words = vec![map, Self::string_header(bytes.len())];
        words.extend(Self::pack_bytes(&bytes));
        let string = self.alloc(words);
        self.root(string)
    }

    /// Two-byte sequential string
    pub(crate) fn two_byte_string(&mut self, text: &str) -> u64 {
        let tag = self.c.seq_string_tag;
        let map = self.map(tag, 0);
        let units: Vec<u16> = text.encode_utf16().collect();
        let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
        let mut words = vec![map, Self::string_header(units.len())];
        words.extend(Self::pack_bytes(&bytes));
        let string = self.alloc(words);
        self.root(string)
    }

    pub(crate) fn cons_string(&mut self, first: u64, second: u64) -> u64 {
        let tag = self.c.cons_string_tag | self.c.one_byte_string_tag;
        let map = self.map(tag, 4);
        let string = self.alloc(vec![map, Self::string_header(0), first, second]);
        self.root(string)
    }

    pub(crate) fn sliced_string(&mut self, parent: u64, offset: i64, length: usize) -> u64 {
        let tag = self.c.sliced_string_tag | self.c.one_byte_string_tag;
        let map = self.map(tag, 4);
        let string = self.alloc(vec![
            map,
            Self::string_header(length),
            parent,
            Self::smi(offset),
        ]);
        self.root(string)
    }

    pub(crate) fn thin_string(&mut self, actual: u64) -> u64 {
        let tag = self.c.thin_string_tag | self.c.one_byte_string_tag;
        let map = self.map(tag, 3);
        let string = self.alloc(vec![map, Self::string_header(0), actual]);
        self.root(string)
    }

    fn oddball(&mut self, kind: i64) -> u64 {
        let tag = self.c.oddball_type;
        let map = self.map(tag, 2);
        self.alloc(vec![map, Self::smi(kind)])
    }

    pub(crate) fn hole(&mut self) -> u64 {
        if let Some(hole) = self.hole {
            return hole;
        }
        let kind = self.c.oddball_hole;
        let hole = self.oddball(kind);
        self.hole = Some(hole);
        hole
    }

    pub(crate) fn undefined(&mut self) -> u64 {
        if let Some(undefined) = self.undefined {
            return undefined;
        }
        let undefined = self.oddball(5);
        self.undefined = Some(undefined);
        undefined
    }

    pub(crate) fn heap_number(&mut self, value: f64) -> u64 {
        let tag = self.c.heap_number_type;
        let map = self.map(tag, 2);
        let number = self.alloc(vec![map, value.to_bits()]);
        self.root(number)
    }

    /// Function whose shared info carries `name`
    pub(crate) fn function(&mut self, name: &str) -> u64 {
        let name = self.string(name);
        let shared_map = self.map(self.c.shared_function_info_type, 2);
        let shared = self.alloc(vec![shared_map, name]);
        let map = self.map(self.c.js_function_type, 4);
        let empty = self.empty_array;
        let function = self.alloc(vec![map, empty, empty, shared]);
        self.root(function)
    }

    fn descriptor_array(&mut self, entries: &[(u64, u64, u64)]) -> u64 {
        let tag = self.c.descriptor_array_type;
        let map = self.map(tag, 0);
        let mut words = vec![map, Self::smi(entries.len() as i64 * 3), Self::smi(0)];
        for &(key, details, value) in entries {
            words.extend([key, details, value]);
        }
        self.alloc(words)
    }

    fn field_details(&self, index: u64) -> u64 {
        Self::smi((index << self.c.details_field_index_shift) as i64)
    }

    /// Object map with one in-object field per key
    pub(crate) fn object_map(&mut self, constructor: u64, keys: &[u64]) -> u64 {
        let entries: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, &key)| (key, self.field_details(i as u64)))
            .collect();
        let in_object = keys.len() as u8;
        self.object_map_with_details(constructor, &entries, 3 + in_object, in_object)
    }

    /// Object map with raw (key, details) descriptors and explicit header counts
    pub(crate) fn object_map_with_details(
        &mut self,
        constructor: u64,
        entries: &[(u64, u64)],
        size_words: u8,
        in_object: u8,
    ) -> u64 {
        let entries: Vec<_> = entries
            .iter()
            .map(|&(key, details)| (key, details, Self::smi(0)))
            .collect();
        let descriptors = self.descriptor_array(&entries);
        let bit_field3 = (entries.len() as u32) << self.c.own_descriptors_shift;
        self.new_map(
            self.c.js_object_type,
            size_words,
            in_object,
            bit_field3,
            constructor,
            descriptors,
        )
    }

    /// Object map with a single constant stored in the descriptor
    pub(crate) fn object_map_with_constant(&mut self, key: u64, value: u64) -> u64 {
        let details = Self::smi(self.c.details_location_mask as i64);
        let descriptors = self.descriptor_array(&[(key, details, value)]);
        let bit_field3 = 1 << self.c.own_descriptors_shift;
        self.new_map(self.c.js_object_type, 3, 0, bit_field3, 0, descriptors)
    }

    /// Object with in-object `fields` and indexed `elements`
    pub(crate) fn object(&mut self, map: u64, fields: &[u64], elements: &[u64]) -> u64 {
        let elements = self.elements(elements);
        let mut words = vec![map, self.empty_array, elements];
        words.extend_from_slice(fields);
        let object = self.alloc(words);
        self.root(object)
    }

    /// Dictionary-mode object holding `entries` in a hash table
    pub(crate) fn dictionary_object(&mut self, constructor: u64, entries: &[(u64, u64)]) -> u64 {
        let undefined = self.undefined();
        let mut table = vec![
            Self::smi(entries.len() as i64),
            Self::smi(0),
            Self::smi(entries.len() as i64 + 1),
        ];
        for &(key, value) in entries {
            table.extend([key, value, Self::smi(0)]);
        }
        table.extend([undefined, undefined, undefined]);
        let properties = self.fixed_array(&table);

        let empty = self.empty_array;
        let bit_field3 = 1 << self.c.dictionary_map_bit;
        let map = self.new_map(self.c.js_object_type, 3, 0, bit_field3, constructor, empty);
        let object = self.alloc(vec![map, properties, empty]);
        self.root(object)
    }

    pub(crate) fn array(&mut self, values: &[u64]) -> u64 {
        let map = self.map(self.c.js_array_type, 4);
        let elements = self.elements(values);
        let empty = self.empty_array;
        let array = self.alloc(vec![map, empty, elements, Self::smi(values.len() as i64)]);
        self.root(array)
    }

    pub(crate) fn typed_array(&mut self) -> u64 {
        let map = self.map(self.c.js_typed_array_type, 3);
        let empty = self.empty_array;
        let array = self.alloc(vec![map, empty, empty]);
        self.root(array)
    }

    /// Closure context with the given (name, value) locals
    pub(crate) fn context(&mut self, locals: &[(u64, u64)]) -> u64 {
        let mut scope_slots = vec![
            Self::smi(0),
            Self::smi(0),
            Self::smi(locals.len() as i64),
        ];
        scope_slots.extend(locals.iter().map(|&(name, _)| name));
        let scope_info = self.fixed_array_typed(self.c.scope_info_type, &scope_slots);

        let mut slots = vec![scope_info, Self::smi(0), Self::smi(0), Self::smi(0)];
        slots.extend(locals.iter().map(|&(_, value)| value));
        let context = self.fixed_array_typed(self.c.first_context_type, &slots);
        self.root(context)
    }

    /// Overwrite element `index` of an array built by [`Self::array`]
    pub(crate) fn patch_element(&mut self, array: u64, index: usize, value: u64) {
        let start = ((array - 1 - HEAP_BASE) / WORD) as usize;
        let elements = self.words[start + 2];
        self.set(elements, 2 + index, value);
    }

    /// Arbitrary words, rooted like any other object
    pub(crate) fn raw_words(&mut self, words: &[u64]) -> u64 {
        let object = self.alloc(words.to_vec());
        self.root(object)
    }

    /// Lay out the roots array and wrap everything in a process image
    pub(crate) fn build(&self) -> ProcessImage {
        let mut words = self.words.clone();
        let fixed_array_map = self.maps[&self.c.fixed_array_type];
        words.push(fixed_array_map);
        words.push(Self::smi(self.roots.len() as i64));
        words.extend(&self.roots);

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        ProcessImage::new(
            AddressWidth::Eight,
            ByteOrder::Little,
            vec![ImageRegion::new(HEAP_BASE, true, bytes)],
        )
        .unwrap()
    }
}
