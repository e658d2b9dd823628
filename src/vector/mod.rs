//! Vector Module
//!
//! Face records, similarity math, embedding storage and search.

mod embedding_store;
mod record;
mod search;
mod similarity;

pub use embedding_store::EmbeddingStore;
pub use record::{Comparison, Library, LibraryId, Member, MemberId, Page, QueryResult};
pub use search::SearchEngine;
pub use similarity::{
    cosine_similarity, dot_product, euclidean_distance, magnitude, similarity_to_percent,
};
