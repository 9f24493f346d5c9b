//! Type histograms built by the heap scan.
//!
//! [`TypeHistogram`] buckets instances by bare type name.
//! [`DetailedHistogram`] buckets them by shape: type name, element count
//! and the full list of own property names. Both keep their records and
//! instance sets in ordered collections, so iteration order only depends
//! on what was inserted.

use crate::memory::Address;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Default number of property names shown for a detailed record
pub const DEFAULT_PREVIEW_PROPERTIES: usize = 3;

/// Instances of one type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRecord {
    type_name: String,
    instance_count: u64,
    total_size: u64,
    instances: BTreeSet<Address>,
}

impl TypeRecord {
    /// Creates an empty record
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            instance_count: 0,
            total_size: 0,
            instances: BTreeSet::new(),
        }
    }

    /// Name of the type
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Number of distinct instances
    pub fn instance_count(&self) -> u64 {
        self.instance_count
    }

    /// Sum of the sizes recorded for each distinct instance
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Instances in ascending address order
    pub fn instances(&self) -> &BTreeSet<Address> {
        &self.instances
    }

    /// Lowest instance address
    pub fn sample(&self) -> Option<Address> {
        self.instances.first().copied()
    }

    /// Record an instance. Returns false (and changes nothing) if the
    /// address is already present.
    pub fn add_instance(&mut self, address: Address, size: u64) -> bool {
        if !self.instances.insert(address) {
            return false;
        }
        self.instance_count += 1;
        self.total_size += size;
        true
    }

    /// Orders by instance count, then total size, then name
    pub fn compare_instance_counts(&self, other: &Self) -> Ordering {
        self.instance_count
            .cmp(&other.instance_count)
            .then(self.total_size.cmp(&other.total_size))
            .then_with(|| self.type_name.cmp(&other.type_name))
    }
}

/// Instances of one object shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailedTypeRecord {
    record: TypeRecord,
    own_descriptor_count: u64,
    indexed_property_count: u64,
}

impl DetailedTypeRecord {
    /// Creates an empty record displayed as `display_name`
    pub fn new(
        display_name: impl Into<String>,
        own_descriptor_count: u64,
        indexed_property_count: u64,
    ) -> Self {
        Self {
            record: TypeRecord::new(display_name),
            own_descriptor_count,
            indexed_property_count,
        }
    }

    /// The underlying instance record
    pub fn record(&self) -> &TypeRecord {
        &self.record
    }

    /// Number of own descriptors of the shape's map
    pub fn own_descriptor_count(&self) -> u64 {
        self.own_descriptor_count
    }

    /// Number of indexed elements of the first instance seen
    pub fn indexed_property_count(&self) -> u64 {
        self.indexed_property_count
    }

    /// Record an instance, see [`TypeRecord::add_instance`]
    pub fn add_instance(&mut self, address: Address, size: u64) -> bool {
        self.record.add_instance(address, size)
    }
}

/// Everything that distinguishes one detailed bucket from another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectShape {
    /// Bare type name
    pub type_name: String,
    /// Own property names in descriptor order
    pub properties: Vec<String>,
    /// Number of own descriptors of the map
    pub own_descriptor_count: u64,
    /// Number of indexed elements
    pub element_count: u64,
}

impl ObjectShape {
    /// Bucket key: type name, element count and every property name
    pub fn key(&self) -> String {
        let mut key = format!("{}[{}]", self.type_name, self.element_count);
        push_properties(&mut key, &self.properties, 0);
        key
    }

    /// Display name: type name and at most `preview` property names
    /// (0 shows all)
    pub fn display_name(&self, preview: usize) -> String {
        let mut name = self.type_name.clone();
        push_properties(&mut name, &self.properties, preview);
        name
    }
}

fn push_properties(out: &mut String, properties: &[String], limit: usize) {
    let shown = if limit == 0 {
        properties.len()
    } else {
        limit.min(properties.len())
    };
    for (i, property) in properties.iter().take(shown).enumerate() {
        out.push_str(if i == 0 { ": " } else { ", " });
        out.push_str(property);
    }
    if shown < properties.len() {
        out.push_str(", ...");
    }
}

/// Instances keyed by type name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeHistogram {
    records: BTreeMap<String, TypeRecord>,
}

impl TypeHistogram {
    /// Creates an empty histogram
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address` under `type_name`
    pub fn insert(&mut self, type_name: &str, address: Address, size: u64) -> bool {
        self.records
            .entry(type_name.to_string())
            .or_insert_with(|| TypeRecord::new(type_name))
            .add_instance(address, size)
    }

    /// Record for one type
    pub fn get(&self, type_name: &str) -> Option<&TypeRecord> {
        self.records.get(type_name)
    }

    /// Records in type name order
    pub fn records(&self) -> impl Iterator<Item = &TypeRecord> {
        self.records.values()
    }

    /// Every instance in histogram order: type name, then address
    pub fn instances(&self) -> impl Iterator<Item = (&str, Address)> {
        self.records
            .values()
            .flat_map(|r| r.instances.iter().map(move |&a| (r.type_name(), a)))
    }

    /// Returns true if the histogram holds `address` under any type
    pub fn contains(&self, address: Address) -> bool {
        self.records.values().any(|r| r.instances.contains(&address))
    }

    /// Records sorted by (instance count, total size, name)
    pub fn sorted(&self) -> Vec<&TypeRecord> {
        let mut sorted: Vec<_> = self.records.values().collect();
        sorted.sort_by(|a, b| a.compare_instance_counts(b));
        sorted
    }

    /// Number of distinct types
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Printable summary table with a totals row
    pub fn table(&self) -> HistogramTable<'_> {
        HistogramTable { histogram: self }
    }
}

/// Instances keyed by object shape
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailedHistogram {
    records: BTreeMap<String, DetailedTypeRecord>,
}

impl DetailedHistogram {
    /// Creates an empty histogram
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address` under its shape. The display name and counts of a
    /// bucket come from the first instance inserted into it.
    pub fn insert(&mut self, shape: &ObjectShape, preview: usize, address: Address, size: u64) -> bool {
        self.records
            .entry(shape.key())
            .or_insert_with(|| {
                DetailedTypeRecord::new(
                    shape.display_name(preview),
                    shape.own_descriptor_count,
                    shape.element_count,
                )
            })
            .add_instance(address, size)
    }

    /// Record for one bucket key, see [`ObjectShape::key`]
    pub fn get(&self, key: &str) -> Option<&DetailedTypeRecord> {
        self.records.get(key)
    }

    /// Records in key order
    pub fn records(&self) -> impl Iterator<Item = &DetailedTypeRecord> {
        self.records.values()
    }

    /// Records sorted by (instance count, total size, name)
    pub fn sorted(&self) -> Vec<&DetailedTypeRecord> {
        let mut sorted: Vec<_> = self.records.values().collect();
        sorted.sort_by(|a, b| a.record.compare_instance_counts(&b.record));
        sorted
    }

    /// Number of distinct shapes
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Printable detailed table with a totals row
    pub fn table(&self) -> DetailedTable<'_> {
        DetailedTable { histogram: self }
    }
}

/// Summary table of a [`TypeHistogram`]
pub struct HistogramTable<'a> {
    histogram: &'a TypeHistogram,
}

impl fmt::Display for HistogramTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut total_objects = 0;
        let mut total_size = 0;

        writeln!(f, " Instances  Total Size Name")?;
        writeln!(f, " ---------- ---------- ----")?;
        for record in self.histogram.sorted() {
            writeln!(
                f,
                " {:>10} {:>10} {}",
                record.instance_count(),
                record.total_size(),
                record.type_name()
            )?;
            total_objects += record.instance_count();
            total_size += record.total_size();
        }
        writeln!(f, " ---------- ---------- ")?;
        writeln!(f, " {:>10} {:>10} ", total_objects, total_size)
    }
}

/// Detailed table of a [`DetailedHistogram`]
pub struct DetailedTable<'a> {
    histogram: &'a DetailedHistogram,
}

impl fmt::Display for DetailedTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut total_objects = 0;
        let mut total_size = 0;

        writeln!(f, "   Sample Obj.  Instances  Total Size  Properties  Elements  Name")?;
        writeln!(f, " ------------- ---------- ----------- ----------- --------- -----")?;
        for detailed in self.histogram.sorted() {
            let record = detailed.record();
            writeln!(
                f,
                " {:>13x} {:>10} {:>11} {:>11} {:>9} {}",
                record.sample().unwrap_or_default(),
                record.instance_count(),
                record.total_size(),
                detailed.own_descriptor_count(),
                detailed.indexed_property_count(),
                record.type_name()
            )?;
            total_objects += record.instance_count();
            total_size += record.total_size();
        }
        writeln!(f, " ------------- ---------- ----------- ----------- --------- -----")?;
        writeln!(f, "               {:>10} {:>11} ", total_objects, total_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn shape(name: &str, properties: &[&str], elements: u64) -> ObjectShape {
        ObjectShape {
            type_name: name.to_string(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
            own_descriptor_count: properties.len() as u64,
            element_count: elements,
        }
    }

    #[test]
    fn test_add_instance_is_idempotent() {
        let mut record = TypeRecord::new("Point");
        assert!(record.add_instance(0x1001, 32));
        assert!(!record.add_instance(0x1001, 32));
        assert!(record.add_instance(0x2001, 32));
        assert_eq!(record.instance_count(), 2);
        assert_eq!(record.total_size(), 64);
        assert_eq!(record.sample(), Some(0x1001));
    }

    #[test]
    fn test_sort_order_is_total() {
        let mut histogram = TypeHistogram::new();
        histogram.insert("B", 0x11, 8);
        histogram.insert("A", 0x21, 8);
        histogram.insert("C", 0x31, 4);
        histogram.insert("D", 0x41, 8);
        histogram.insert("D", 0x51, 8);

        let names: Vec<_> = histogram.sorted().iter().map(|r| r.type_name()).collect();
        assert_eq!(names, vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn test_instances_in_histogram_order() {
        let mut histogram = TypeHistogram::new();
        histogram.insert("Zebra", 0x11, 8);
        histogram.insert("Ant", 0x51, 8);
        histogram.insert("Ant", 0x31, 8);

        let order: Vec<_> = histogram.instances().collect();
        assert_eq!(order, vec![("Ant", 0x31), ("Ant", 0x51), ("Zebra", 0x11)]);
        assert!(histogram.contains(0x51));
        assert!(!histogram.contains(0x61));
    }

    #[test]
    fn test_summary_table() {
        let mut histogram = TypeHistogram::new();
        histogram.insert("Point", 0x11, 24);
        histogram.insert("Point", 0x21, 24);
        histogram.insert("Array", 0x31, 32);

        let expected = concat!(
            " Instances  Total Size Name\n",
            " ---------- ---------- ----\n",
            "          1         32 Array\n",
            "          2         48 Point\n",
            " ---------- ---------- \n",
            "          3         80 \n",
        );
        assert_eq!(histogram.table().to_string(), expected);
    }

    #[test]
    fn test_shape_key_and_preview() {
        let s = shape("Config", &["a", "b", "c", "d"], 2);
        assert_eq!(s.key(), "Config[2]: a, b, c, d");
        assert_eq!(s.display_name(3), "Config: a, b, c, ...");
        assert_eq!(s.display_name(0), "Config: a, b, c, d");
        assert_eq!(shape("Empty", &[], 0).display_name(3), "Empty");
    }

    #[test]
    fn test_detailed_buckets_split_on_elements_and_properties() {
        let mut histogram = DetailedHistogram::new();
        histogram.insert(&shape("Array", &[], 2), 3, 0x11, 32);
        histogram.insert(&shape("Array", &[], 5), 3, 0x21, 32);
        histogram.insert(&shape("Array", &[], 5), 3, 0x31, 32);
        histogram.insert(&shape("Point", &["x", "y"], 0), 3, 0x41, 40);

        assert_eq!(histogram.len(), 3);
        let five = histogram.get("Array[5]").unwrap();
        assert_eq!(five.record().instance_count(), 2);
        assert_eq!(five.indexed_property_count(), 5);
        assert_eq!(five.record().type_name(), "Array");

        let table = histogram.table().to_string();
        assert!(table.contains("Point: x, y"));
        assert!(table.lines().last().unwrap().contains("136"));
    }
}
