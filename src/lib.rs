//! FACEDOME - Face Library Store and Similarity Search
//!
//! Named face libraries whose members are identified by fixed-length
//! embeddings, with exact thresholded top-K cosine search per library.

pub mod config;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod library;
pub mod metrics;
pub mod persistence;
pub mod vector;

pub use config::{EngineConfig, SearchConfig, SnapshotConfig};
pub use embedder::{DetectedFace, Embedder, EmbedderError, FaceInfo, FixedEmbedder};
pub use engine::{EnrolledMember, FaceEngine, FaceSearch, MemberUpdate};
pub use error::{FaceError, RecordKind, Result};
pub use library::LibraryRegistry;
pub use metrics::Metrics;
pub use persistence::{Snapshot, SnapshotData, SnapshotScheduler};
pub use vector::{
    Comparison, EmbeddingStore, Library, LibraryId, Member, MemberId, Page, QueryResult,
    SearchEngine,
};
