//! Persistence Module
//!
//! Embedding byte codec, snapshot files and periodic snapshotting.

mod codec;
mod scheduler;
mod snapshot;

pub use codec::{decode_embedding, encode_embedding};
pub use scheduler::SnapshotScheduler;
pub use snapshot::{Snapshot, SnapshotData};
