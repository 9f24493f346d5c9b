//! Runtime process metadata recovered from the heap.
//!
//! Node.js keeps a single `process` object alive for the lifetime of the
//! runtime. Instances of that type carrying a `pid` property are reported
//! with their platform, versions, release info and command lines.

use crate::histogram::TypeHistogram;
use crate::layout::{HeapObject, LayoutModel};
use crate::memory::Address;
use std::fmt;
use tracing::debug;

const PROCESS_TYPE: &str = "process";

/// Named string values of a nested object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValues {
    /// Address of the nested object
    pub address: Address,
    /// `(key, value)` pairs with a string value
    pub entries: Vec<(String, String)>,
}

/// String elements of a nested array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringList {
    /// Address of the nested array
    pub address: Address,
    /// `(index, value)` pairs with a string value
    pub items: Vec<(u64, String)>,
}

/// Metadata of one `process` object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Address of the `process` object
    pub address: Address,
    /// `process.pid`
    pub pid: i64,
    /// `process.platform`
    pub platform: Option<String>,
    /// `process.arch`
    pub arch: Option<String>,
    /// `process.version`
    pub version: Option<String>,
    /// `process.versions`, sorted by key
    pub versions: Option<KeyValues>,
    /// `process.release`
    pub release: Option<KeyValues>,
    /// `process.execPath`
    pub exec_path: Option<String>,
    /// `process.argv`
    pub argv: Option<StringList>,
    /// `process.execArgv`
    pub exec_argv: Option<StringList>,
}

/// Collect every `process` instance that has a small-integer `pid`
pub fn find_process_info<L: LayoutModel + ?Sized>(
    layout: &L,
    histogram: &TypeHistogram,
) -> Vec<ProcessInfo> {
    let Some(record) = histogram.get(PROCESS_TYPE) else {
        debug!("No {} instances in the histogram", PROCESS_TYPE);
        return Vec::new();
    };

    record
        .instances()
        .iter()
        .filter_map(|&address| {
            let object = layout.as_heap_object(address)?;
            read_process(layout, object)
        })
        .collect()
}

fn read_process<L: LayoutModel + ?Sized>(layout: &L, object: HeapObject) -> Option<ProcessInfo> {
    let property = |name: &str| layout.get_property(object, name).ok().flatten();
    let string = |name: &str| property(name).and_then(|v| layout.string_value(v).ok().flatten());

    let pid = property("pid").filter(|&v| layout.is_smi(v))?;

    let mut versions = property("versions").and_then(|v| key_values(layout, v));
    if let Some(versions) = &mut versions {
        versions.entries.sort();
    }

    Some(ProcessInfo {
        address: object.raw(),
        pid: layout.smi_value(pid),
        platform: string("platform"),
        arch: string("arch"),
        version: string("version"),
        versions,
        release: property("release").and_then(|v| key_values(layout, v)),
        exec_path: string("execPath"),
        argv: property("argv").and_then(|v| string_list(layout, v)),
        exec_argv: property("execArgv").and_then(|v| string_list(layout, v)),
    })
}

fn key_values<L: LayoutModel + ?Sized>(layout: &L, value: u64) -> Option<KeyValues> {
    let object = layout.as_heap_object(value)?;
    let entries = layout
        .property_entries(object)
        .ok()?
        .into_iter()
        .filter_map(|entry| {
            let key = layout.string_value(entry.key).ok().flatten()?;
            let value = layout.string_value(entry.value).ok().flatten()?;
            Some((key, value))
        })
        .collect();
    Some(KeyValues { address: value, entries })
}

fn string_list<L: LayoutModel + ?Sized>(layout: &L, value: u64) -> Option<StringList> {
    let array = layout.as_heap_object(value)?;
    let length = layout.array_length(array).ok()?;
    let items = (0..length)
        .filter_map(|i| {
            let element = layout.array_element(array, i).ok()?;
            let text = layout.string_value(element).ok().flatten()?;
            Some((i, text))
        })
        .collect();
    Some(StringList { address: value, items })
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Information for process id {} (process=0x{:x})",
            self.pid, self.address
        )?;

        let mut summary = Vec::new();
        if let Some(platform) = &self.platform {
            summary.push(format!("Platform = {}", platform));
        }
        if let Some(arch) = &self.arch {
            summary.push(format!("Architecture = {}", arch));
        }
        if let Some(version) = &self.version {
            summary.push(format!("Node Version = {}", version));
        }
        if !summary.is_empty() {
            writeln!(f, "{}", summary.join(", "))?;
        }

        if let Some(versions) = &self.versions {
            writeln!(f, "Component versions (process.versions=0x{:x}):", versions.address)?;
            for (key, value) in &versions.entries {
                writeln!(f, "    {} = {}", key, value)?;
            }
        }
        if let Some(release) = &self.release {
            writeln!(f, "Release Info (process.release=0x{:x}):", release.address)?;
            for (key, value) in &release.entries {
                writeln!(f, "    {} = {}", key, value)?;
            }
        }
        if let Some(path) = &self.exec_path {
            writeln!(f, "Executable Path = {}", path)?;
        }
        if let Some(argv) = &self.argv {
            writeln!(f, "Command line arguments (process.argv=0x{:x}):", argv.address)?;
            for (i, arg) in &argv.items {
                writeln!(f, "    [{}] = '{}'", i, arg)?;
            }
        }
        if let Some(exec_argv) = &self.exec_argv {
            writeln!(
                f,
                "Node.js Command line arguments (process.execArgv=0x{:x}):",
                exec_argv.address
            )?;
            for (i, arg) in &exec_argv.items {
                writeln!(f, "    [{}] = '{}'", i, arg)?;
            }
        }
        Ok(())
    }
}

/// Display adapter for a list of [`ProcessInfo`]
pub struct ProcessReport<'a>(pub &'a [ProcessInfo]);

impl fmt::Display for ProcessReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "No process objects found.");
        }
        for info in self.0 {
            write!(f, "{}", info)?;
        }
        Ok(())
    }
}
