//! Records
//!
//! Library and member records plus the value types returned by search.

use chrono::{DateTime, Utc};

pub type LibraryId = u64;
pub type MemberId = u64;

/// A named face library
#[derive(Debug, Clone, PartialEq)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Library {
    pub fn new(id: LibraryId, name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update last modified time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A library member identified by its face embedding
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: MemberId,
    pub library_id: LibraryId,
    pub name: String,
    /// The embedding vector
    pub embedding: Vec<f32>,
    /// Opaque reference to the stored source image
    pub source_image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    pub fn new(
        id: MemberId,
        library_id: LibraryId,
        name: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            library_id,
            name: name.into(),
            embedding,
            source_image: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_source_image(mut self, source: impl Into<String>) -> Self {
        self.source_image = Some(source.into());
        self
    }

    /// Get embedding dimension
    pub fn dim(&self) -> usize {
        self.embedding.len()
    }
}

/// One ranked search hit
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub member_id: MemberId,
    pub name: String,
    /// Cosine similarity in [-1, 1]
    pub similarity_score: f32,
    /// Score mapped onto [0, 100]
    pub similarity_percent: f32,
}

/// Outcome of comparing two embeddings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub cosine_similarity: f32,
    pub euclidean_distance: f32,
    pub similarity_percent: f32,
    pub same_identity: bool,
}

/// A page of records plus the total count at read time
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<T>,
}
