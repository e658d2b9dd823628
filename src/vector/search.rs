//! Search Engine
//!
//! Exact top-K cosine search over one library, plus pairwise comparison.

use std::cmp::Ordering;
use tracing::{debug, warn};

use super::embedding_store::EmbeddingStore;
use super::record::{Comparison, LibraryId, MemberId, QueryResult};
use super::similarity::{
    check_dimensions, cosine_similarity, cosine_with_norm, euclidean_distance, magnitude,
    similarity_to_percent,
};
use crate::config::SearchConfig;
use crate::error::{FaceError, Result};

/// Ranks query embeddings against the members of a library
#[derive(Clone)]
pub struct SearchEngine {
    store: EmbeddingStore,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(store: EmbeddingStore, config: SearchConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search with the configured threshold and top-K
    pub fn search_default(&self, library_id: LibraryId, query: &[f32]) -> Result<Vec<QueryResult>> {
        self.search(library_id, query, self.config.top_k, self.config.threshold)
    }

    /// Find the `top_k` members most similar to `query`.
    ///
    /// Hits have `similarity_score >= threshold`, sorted by descending score
    /// with ties broken by ascending member id. Zero-norm members are skipped.
    /// The scan holds the dimension and library read locks, so it sees either
    /// the whole member set or (after a cascade delete) `NotFound`, and every
    /// member has the dimension the query was checked against.
    pub fn search(
        &self,
        library_id: LibraryId,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<QueryResult>> {
        self.store.read_pinned(library_id, |dimension, members| {
            // No dimension means nothing has ever been stored
            let Some(dimension) = dimension else {
                return Ok(Vec::new());
            };
            check_dimensions(dimension, query.len())?;

            if top_k == 0 || members.is_empty() {
                return Ok(Vec::new());
            }

            let query_norm = magnitude(query);
            if !(query_norm > 0.0 && query_norm.is_finite()) {
                return Err(FaceError::DegenerateVector);
            }

            let mut hits = Vec::new();
            for member in members.values() {
                match cosine_with_norm(query, query_norm, &member.embedding) {
                    Ok(score) if score >= threshold => hits.push((member, score)),
                    Ok(_) => {}
                    Err(FaceError::DegenerateVector) => {
                        warn!(
                            library = library_id,
                            member = member.id,
                            "Skipping zero-norm embedding"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            hits.sort_by(|a, b| rank_order((a.0.id, a.1), (b.0.id, b.1)));
            hits.truncate(top_k);

            debug!(
                library = library_id,
                scanned = members.len(),
                hits = hits.len(),
                "Search complete"
            );

            Ok(hits
                .into_iter()
                .map(|(member, score)| QueryResult {
                    member_id: member.id,
                    name: member.name.clone(),
                    similarity_score: score,
                    similarity_percent: similarity_to_percent(score),
                })
                .collect())
        })?
    }

    /// Compare two embeddings directly.
    ///
    /// `same_identity` uses its own threshold, independent of search.
    pub fn compare(&self, a: &[f32], b: &[f32]) -> Result<Comparison> {
        if let Some(dimension) = self.store.dimension() {
            check_dimensions(dimension, a.len())?;
        }

        let cosine = cosine_similarity(a, b)?;
        Ok(Comparison {
            cosine_similarity: cosine,
            euclidean_distance: euclidean_distance(a, b)?,
            similarity_percent: similarity_to_percent(cosine),
            same_identity: cosine > self.config.same_identity_threshold,
        })
    }
}

/// Descending score, then ascending member id
fn rank_order(a: (MemberId, f32), b: (MemberId, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
