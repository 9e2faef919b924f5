//! Region error taxonomy.

use nix::errno::Errno;
use pausepoint_core::CodecError;
use thiserror::Error;

/// Region error.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Invalid region name {0:?}")]
    InvalidName(String),
    #[error("Region not found: {0}")]
    NotFound(String),
    #[error("Region already exists: {0}")]
    AlreadyExists(String),
    #[error("Region {0} exists but has not been sized by its creator yet")]
    Unsized(String),
    #[error("Region {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("Decode failed for region {name}: {source}")]
    DecodeFailed {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("Encode failed for region {name}: {source}")]
    EncodeFailed {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("{op} failed for region {name}: {source}")]
    Sys {
        name: String,
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("I/O error on region {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl RegionError {
    pub(crate) fn sys(name: &str, op: &'static str, source: Errno) -> Self {
        Self::Sys {
            name: name.to_string(),
            op,
            source,
        }
    }

    /// Whether the error means the region does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the region exists but its creator has not finished sizing it.
    #[must_use]
    pub const fn is_unsized(&self) -> bool {
        matches!(self, Self::Unsized(_))
    }
}
