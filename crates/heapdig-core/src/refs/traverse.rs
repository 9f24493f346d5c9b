//! Reference-graph traversal.
//!
//! Direct mode lists every referrer of the search key. Recursive mode then
//! treats each referrer (and each context holding the target) as a new
//! value search, depth first. One visited set covers the whole walk, so
//! every address is expanded at most once and cycles terminate.

use super::report::{context_references, describe_refs, ReferenceLine};
use super::{ReferenceIndex, SearchKey};
use crate::layout::LayoutModel;
use crate::memory::Address;
use crate::scanner::ContextSet;
use std::collections::BTreeSet;
use std::fmt::Write as FmtWrite;

/// One line of traversal output, in depth-first order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalEvent {
    /// A matching slot of a referrer
    Reference {
        /// Nesting level (0 for direct referrers)
        depth: usize,
        /// The match
        line: ReferenceLine,
    },
    /// Start of the expansion of `address`
    Branch {
        /// Nesting level of the referrer being expanded
        depth: usize,
        /// The referrer being expanded
        address: Address,
        /// The address was already expanded earlier in the walk
        seen: bool,
    },
}

enum Task {
    Emit(ReferenceLine, usize),
    Branch(Address, usize),
    Expand(SearchKey, usize),
}

/// Walk the referrers of `key`.
///
/// The index for `key` (and the by-value index, when `recursive`) must
/// already be populated. Contexts are consulted for value searches only.
pub fn traverse<L: LayoutModel + ?Sized>(
    layout: &L,
    index: &mut ReferenceIndex,
    contexts: &ContextSet,
    key: &SearchKey,
    recursive: bool,
) -> Vec<TraversalEvent> {
    let mut events = Vec::new();
    let mut visited = BTreeSet::new();
    if let SearchKey::Value(root) = key {
        visited.insert(*root);
    }

    let mut stack = vec![Task::Expand(key.clone(), 0)];
    while let Some(task) = stack.pop() {
        match task {
            Task::Emit(line, depth) => events.push(TraversalEvent::Reference { depth, line }),
            Task::Branch(address, depth) => {
                let seen = !visited.insert(address);
                events.push(TraversalEvent::Branch {
                    depth,
                    address,
                    seen,
                });
                if !seen {
                    stack.push(Task::Expand(SearchKey::Value(address), depth + 1));
                }
            }
            Task::Expand(key, depth) => {
                let mut tasks = Vec::new();

                for source in index.references(&key).to_vec() {
                    let lines = describe_refs(layout, source, &key);
                    tasks.extend(lines.into_iter().map(|line| Task::Emit(line, depth)));
                    if recursive {
                        tasks.push(Task::Branch(source, depth));
                    }
                }

                if let SearchKey::Value(target) = key {
                    for line in context_references(layout, contexts, target) {
                        let context = line.source;
                        tasks.push(Task::Emit(line, depth));
                        if recursive {
                            tasks.push(Task::Branch(context, depth));
                        }
                    }
                }

                stack.extend(tasks.into_iter().rev());
            }
        }
    }

    events
}

/// Render traversal events, indenting `padding` spaces per level
pub fn render_events(events: &[TraversalEvent], padding: usize) -> String {
    let mut out = String::new();
    for event in events {
        // writing to a String cannot fail
        let _ = match event {
            TraversalEvent::Reference { depth, line } => {
                writeln!(out, "{:indent$}{}", "", line, indent = depth * padding)
            }
            TraversalEvent::Branch {
                depth,
                address,
                seen,
            } => {
                let suffix = if *seen { " [seen above]" } else { "" };
                writeln!(
                    out,
                    "{:indent$}+ 0x{:x}{}",
                    "",
                    address,
                    suffix,
                    indent = depth * padding
                )
            }
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TaggedLayout;
    use crate::refs::IndexKind;
    use crate::scanner::{scan_memory, HeapInventory, MapCache, ObjectCollector, ScanConfig};
    use crate::testing::HeapBuilder;
    use pretty_assertions::assert_eq;

    fn scan(image: &crate::memory::ProcessImage) -> (HeapInventory, ReferenceIndex) {
        let layout = TaggedLayout::for_memory(image);
        let mut inventory = HeapInventory::new();
        let mut cache = MapCache::new();
        let mut collector = ObjectCollector::new(&layout, 8, &mut cache, &mut inventory);
        scan_memory(image, &ScanConfig::new(), &mut collector).unwrap();

        let mut index = ReferenceIndex::new();
        index.populate(&layout, &inventory.histogram, IndexKind::Value);
        (inventory, index)
    }

    fn branches(events: &[TraversalEvent]) -> Vec<(Address, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                TraversalEvent::Branch { address, seen, .. } => Some((*address, *seen)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_direct_mode_lists_referrers_only() {
        let mut heap = HeapBuilder::new();
        let target = heap.string("target");
        let outer = heap.array(&[target]);
        heap.array(&[outer]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let (inventory, mut index) = scan(&image);

        let events = traverse(&layout, &mut index, &inventory.contexts, &SearchKey::Value(target), false);
        assert_eq!(events.len(), 1);
        assert!(branches(&events).is_empty());
        assert_eq!(
            render_events(&events, 2),
            format!("0x{:x}: Array[0]=0x{:x}\n", outer, target)
        );
    }

    #[test]
    fn test_recursive_cycle_terminates() {
        let mut heap = HeapBuilder::new();
        let target = heap.string("target");
        // a and b hold each other and both hold the target
        let a = heap.array(&[target, HeapBuilder::smi(0)]);
        let b = heap.array(&[target, a]);
        heap.patch_element(a, 1, b);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let (inventory, mut index) = scan(&image);

        let events = traverse(&layout, &mut index, &inventory.contexts, &SearchKey::Value(target), true);
        let expanded: Vec<_> = branches(&events).into_iter().filter(|(_, seen)| !seen).collect();
        assert_eq!(expanded, vec![(a, false), (b, false)]);
        assert!(branches(&events).iter().any(|&(addr, seen)| addr == b && seen));

        let rendered = render_events(&events, 2);
        assert!(rendered.contains("[seen above]"));
    }

    #[test]
    fn test_recursive_through_context() {
        let mut heap = HeapBuilder::new();
        let name = heap.string("secret");
        let value = heap.string("value");
        let context = heap.context(&[(name, value)]);
        let image = heap.build();
        let layout = TaggedLayout::for_memory(&image);
        let (inventory, mut index) = scan(&image);

        let events = traverse(&layout, &mut index, &inventory.contexts, &SearchKey::Value(value), true);
        assert_eq!(branches(&events), vec![(context, false)]);
        match &events[0] {
            TraversalEvent::Reference { line, depth } => {
                assert_eq!(*depth, 0);
                assert_eq!(line.source, context);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
