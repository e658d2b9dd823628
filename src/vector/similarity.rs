//! Vector Similarity Functions
//!
//! Pure scoring math used by search and pairwise comparison.

use crate::error::{FaceError, Result};

/// Compute dot product of two vectors
///
/// Uses unrolled loop for better CPU performance.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let len = a.len().min(b.len());
    let mut sum = 0.0f32;

    // Process 4 elements at a time (manual unrolling)
    let chunks = len / 4;
    let remainder = len % 4;

    for i in 0..chunks {
        let idx = i * 4;
        sum += a[idx] * b[idx];
        sum += a[idx + 1] * b[idx + 1];
        sum += a[idx + 2] * b[idx + 2];
        sum += a[idx + 3] * b[idx + 3];
    }

    for i in (len - remainder)..len {
        sum += a[i] * b[i];
    }

    sum
}

/// L2 norm of a vector
#[inline]
pub fn magnitude(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// Cosine similarity with a precomputed query norm.
///
/// Search computes the query norm once per scan instead of once per member.
#[inline]
pub fn cosine_with_norm(query: &[f32], query_norm: f32, other: &[f32]) -> Result<f32> {
    check_dimensions(query.len(), other.len())?;
    let denom = query_norm * magnitude(other);
    if denom > 0.0 && denom.is_finite() {
        Ok((dot_product(query, other) / denom).clamp(-1.0, 1.0))
    } else {
        Err(FaceError::DegenerateVector)
    }
}

/// Compute cosine similarity between two vectors
///
/// Returns value in range [-1, 1] where 1 means identical direction.
/// Fails with `DegenerateVector` when either vector has zero norm.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    cosine_with_norm(a, magnitude(a), b)
}

/// Compute Euclidean distance between two vectors
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dimensions(a.len(), b.len())?;

    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Map a cosine score onto 0..=100.
pub fn similarity_to_percent(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0)
}

#[inline]
pub(crate) fn check_dimensions(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(FaceError::DimensionMismatch { expected, actual })
    }
}
