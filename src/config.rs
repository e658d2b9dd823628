//! Engine Configuration

use std::path::PathBuf;

/// Default inclusive score threshold for search hits
pub const DEFAULT_SEARCH_THRESHOLD: f32 = 0.5;

/// Default decision threshold for `compare`
pub const DEFAULT_SAME_IDENTITY_THRESHOLD: f32 = 0.5;

/// Search and comparison tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchConfig {
    /// Minimum cosine similarity kept by `search` (inclusive)
    pub threshold: f32,
    /// Number of hits returned when the caller does not say
    pub top_k: usize,
    /// `compare` reports the same identity when cosine exceeds this
    pub same_identity_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SEARCH_THRESHOLD,
            top_k: 10,
            same_identity_threshold: DEFAULT_SAME_IDENTITY_THRESHOLD,
        }
    }
}

impl SearchConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_same_identity_threshold(mut self, threshold: f32) -> Self {
        self.same_identity_threshold = threshold;
        self
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding dimension (None = fixed by the first insert)
    pub dimension: Option<usize>,

    /// Library map shard count (0 = auto-detect)
    pub shard_amount: usize,

    /// Longest accepted library name, in characters
    pub max_name_len: usize,

    /// Largest page size accepted by member listing
    pub max_page_size: usize,

    pub search: SearchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            shard_amount: 0,
            max_name_len: 100,
            max_page_size: 100,
            search: SearchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Fix the embedding dimension up front
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_shard_amount(mut self, shards: usize) -> Self {
        self.shard_amount = shards;
        self
    }

    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    pub(crate) fn effective_shards(&self) -> usize {
        if self.shard_amount == 0 {
            num_cpus::get() * 4
        } else {
            self.shard_amount
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory for snapshot files
    pub dir: PathBuf,
    /// Snapshot interval in seconds (0 = disabled)
    pub interval_secs: u64,
    /// Maximum number of snapshots to keep
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/snapshots"),
            interval_secs: 300, // 5 minutes
            max_snapshots: 5,
        }
    }
}

impl SnapshotConfig {
    pub fn with_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.max_snapshots = max;
        self
    }
}
