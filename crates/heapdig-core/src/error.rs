//! Error types for the heapdig-core library.
//!
//! This module provides error handling using the `thiserror` crate. Most
//! variants describe a problem with a single candidate object; the scanning
//! code recovers from those locally (see [`Error::is_recoverable`]).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for heapdig operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all heapdig operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A value did not have the shape the layout model expected
    #[error("decode failure at 0x{address:x}: expected {expected}")]
    Decode {
        /// Address (tagged word) of the offending value
        address: u64,
        /// What the caller expected to find there
        expected: String,
    },

    /// The memory provider could not supply the requested bytes
    #[error("failed to read {len} bytes at 0x{address:x}")]
    Read {
        /// First address of the failed read
        address: u64,
        /// Number of bytes requested
        len: usize,
    },

    /// An expected property or field is absent
    #[error("lookup miss: {what}")]
    LookupMiss {
        /// Description of what was looked up
        what: String,
    },

    /// No usable process image to scan
    #[error("invalid scan target: {0}")]
    InvalidTarget(String),

    /// Small integers are inline values, not heap references
    #[error("search value 0x{0:x} is a small integer, not a heap reference")]
    SmiSearch(u64),

    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The image manifest is malformed
    #[error("invalid image manifest '{path}': {details}")]
    InvalidManifest {
        /// Path of the manifest or region file
        path: PathBuf,
        /// Detailed description of the issue
        details: String,
    },

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new decode failure
    pub fn decode(address: u64, expected: impl Into<String>) -> Self {
        Self::Decode {
            address,
            expected: expected.into(),
        }
    }

    /// Creates a new read failure
    pub fn read(address: u64, len: usize) -> Self {
        Self::Read { address, len }
    }

    /// Creates a new lookup miss
    pub fn lookup_miss(what: impl Into<String>) -> Self {
        Self::LookupMiss { what: what.into() }
    }

    /// Creates a new invalid target error
    pub fn invalid_target(reason: impl Into<String>) -> Self {
        Self::InvalidTarget(reason.into())
    }

    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new manifest error
    pub fn invalid_manifest(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error only concerns a single candidate, property
    /// or memory block and the surrounding operation should carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::Read { .. } | Self::LookupMiss { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::decode(0x1001, "string");
        assert_eq!(
            err.to_string(),
            "decode failure at 0x1001: expected string"
        );

        let err = Error::SmiSearch(0x2_0000_0000);
        assert!(err.to_string().contains("small integer"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::decode(1, "map").is_recoverable());
        assert!(Error::read(0x1000, 8).is_recoverable());
        assert!(Error::lookup_miss("pid").is_recoverable());
        assert!(!Error::invalid_target("no writable regions").is_recoverable());
        assert!(!Error::SmiSearch(0).is_recoverable());
    }
}
