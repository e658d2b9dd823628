//! Error Types
//!
//! Typed failures shared by the store, search engine and registry.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::embedder::EmbedderError;

/// What kind of record a lookup failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Library,
    Member,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Library => write!(f, "library"),
            RecordKind::Member => write!(f, "member"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FaceError {
    /// A library or member id did not resolve.
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: u64 },

    /// Library name already taken by a different library.
    #[error("Library name already exists: {0}")]
    DuplicateName(String),

    /// Library or member name is empty or too long.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Embedding length differs from the store dimensionality.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A zero-norm vector has no direction to compare.
    #[error("Degenerate vector: zero norm")]
    DegenerateVector,

    /// Member id already belongs to another library.
    #[error("Member {member_id} belongs to library {library_id}")]
    MemberOwnership { member_id: u64, library_id: u64 },

    /// Dimensionality cannot be reset while members are stored.
    #[error("Cannot reset dimension: store holds {0} members")]
    DimensionInUse(usize),

    /// Page or page size out of range.
    #[error("Invalid page: page={page}, page_size={page_size}")]
    InvalidPage { page: usize, page_size: usize },

    /// Face extraction failed; surfaced unchanged.
    #[error("Face extraction failed: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot bytes did not decode.
    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

impl FaceError {
    pub fn library_not_found(id: u64) -> Self {
        FaceError::NotFound {
            kind: RecordKind::Library,
            id,
        }
    }

    pub fn member_not_found(id: u64) -> Self {
        FaceError::NotFound {
            kind: RecordKind::Member,
            id,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FaceError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, FaceError>;
