//! Paging state for instance listings.
//!
//! Repeating the same query advances one page and wraps back to the first
//! page after the last non-empty one. Any change of query or page size
//! starts over.

use std::fmt;

/// Paging state carried between commands of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    command: String,
    output_limit: usize,
    current_page: usize,
    total_entries: usize,
}

/// A window into a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// First entry shown (0-based)
    pub start: usize,
    /// One past the last entry shown
    pub end: usize,
    /// Number of entries in the listing
    pub total: usize,
}

impl Page {
    /// Returns true if entries follow this page
    pub fn has_more(&self) -> bool {
        self.end < self.total
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(Showing {} to {} of {} instances)",
            self.start + 1,
            self.end,
            self.total
        )
    }
}

impl Pagination {
    /// Creates an empty paging state
    pub fn new() -> Self {
        Self::default()
    }

    /// Query the state belongs to
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Page size, 0 for unlimited
    pub fn output_limit(&self) -> usize {
        self.output_limit
    }

    /// Index of the page last returned
    pub fn current_page(&self) -> usize {
        self.current_page
    }

    /// Listing size seen by the last call
    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    /// Move to the page to show for `command` and return it
    pub fn advance(&mut self, command: &str, output_limit: usize, total_entries: usize) -> Page {
        if command != self.command || output_limit != self.output_limit {
            self.command = command.to_string();
            self.output_limit = output_limit;
            self.current_page = 0;
        } else if output_limit == 0 || (self.current_page + 1) * output_limit >= total_entries {
            self.current_page = 0;
        } else {
            self.current_page += 1;
        }
        self.total_entries = total_entries;
        self.page()
    }

    /// The current page
    pub fn page(&self) -> Page {
        let total = self.total_entries;
        if self.output_limit == 0 {
            return Page {
                start: 0,
                end: total,
                total,
            };
        }
        let start = (self.current_page * self.output_limit).min(total);
        Page {
            start,
            end: (start + self.output_limit).min(total),
            total,
        }
    }
}
