//! Snapshot Persistence
//!
//! Point-in-time copy of every library and member, used as the durable
//! metadata store.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::codec::{decode_embedding, encode_embedding};
use crate::config::SnapshotConfig;
use crate::error::{FaceError, Result};
use crate::vector::{Library, LibraryId, Member, MemberId};

/// Snapshot file format (all integers little-endian):
/// - Magic: 4 bytes "FDSN"
/// - Version: 1 byte
/// - Timestamp: 8 bytes (unix millis)
/// - Next library id: 8 bytes, next member id: 8 bytes
/// - Dimension: 4 bytes (0 = not fixed)
/// - Library count: 4 bytes, then per library:
///   [id (8) + name + description? + created (12) + updated (12)]
/// - Member count: 4 bytes, then per member:
///   [id (8) + library_id (8) + name + source? + created (12) + updated (12)
///    + embedding_len (4) + embedding bytes]
///
/// Strings are `len (4) + utf8`; optional strings carry a leading flag byte.
/// Timestamps are `secs (8) + nanos (4)`.
const SNAPSHOT_MAGIC: &[u8] = b"FDSN";
const SNAPSHOT_VERSION: u8 = 1;
const SNAPSHOT_EXT: &str = "fds";

/// Everything needed to rebuild an engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotData {
    pub next_library_id: LibraryId,
    pub next_member_id: MemberId,
    pub dimension: Option<usize>,
    pub libraries: Vec<Library>,
    pub members: Vec<Member>,
}

impl SnapshotData {
    /// Serialize to the snapshot file format.
    ///
    /// Counts and lengths are stored as `u32`; anything larger is rejected
    /// as `Corrupt` rather than truncated.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64 + self.members.len() * 64);

        buf.put_slice(SNAPSHOT_MAGIC);
        buf.put_u8(SNAPSHOT_VERSION);
        buf.put_u64_le(unix_millis());
        buf.put_u64_le(self.next_library_id);
        buf.put_u64_le(self.next_member_id);
        buf.put_u32_le(to_u32(self.dimension.unwrap_or(0), "dimension")?);

        buf.put_u32_le(to_u32(self.libraries.len(), "library count")?);
        for library in &self.libraries {
            buf.put_u64_le(library.id);
            put_str(&mut buf, &library.name)?;
            put_opt_str(&mut buf, library.description.as_deref())?;
            put_time(&mut buf, &library.created_at);
            put_time(&mut buf, &library.updated_at);
        }

        buf.put_u32_le(to_u32(self.members.len(), "member count")?);
        for member in &self.members {
            buf.put_u64_le(member.id);
            buf.put_u64_le(member.library_id);
            put_str(&mut buf, &member.name)?;
            put_opt_str(&mut buf, member.source_image.as_deref())?;
            put_time(&mut buf, &member.created_at);
            put_time(&mut buf, &member.updated_at);

            let embedding = encode_embedding(&member.embedding);
            buf.put_u32_le(to_u32(embedding.len(), "embedding length")?);
            buf.put_slice(&embedding);
        }

        Ok(buf.freeze())
    }

    /// Parse the snapshot file format
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        need(&buf, SNAPSHOT_MAGIC.len() + 1 + 8 + 8 + 8 + 4)?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SNAPSHOT_MAGIC {
            return Err(FaceError::Corrupt("invalid snapshot magic".to_string()));
        }

        let version = buf.get_u8();
        if version != SNAPSHOT_VERSION {
            return Err(FaceError::Corrupt(format!(
                "unsupported snapshot version: {}",
                version
            )));
        }

        let _timestamp = buf.get_u64_le();
        let next_library_id = buf.get_u64_le();
        let next_member_id = buf.get_u64_le();
        let dimension = match buf.get_u32_le() {
            0 => None,
            d => Some(d as usize),
        };

        let count = get_u32(&mut buf)? as usize;
        let mut libraries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let id = get_u64(&mut buf)?;
            let name = get_str(&mut buf)?;
            let description = get_opt_str(&mut buf)?;
            let created_at = get_time(&mut buf)?;
            let updated_at = get_time(&mut buf)?;
            libraries.push(Library {
                id,
                name,
                description,
                created_at,
                updated_at,
            });
        }

        let count = get_u32(&mut buf)? as usize;
        let mut members = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let id = get_u64(&mut buf)?;
            let library_id = get_u64(&mut buf)?;
            let name = get_str(&mut buf)?;
            let source_image = get_opt_str(&mut buf)?;
            let created_at = get_time(&mut buf)?;
            let updated_at = get_time(&mut buf)?;

            let len = get_u32(&mut buf)? as usize;
            need(&buf, len)?;
            let embedding = decode_embedding(&buf[..len])?;
            buf.advance(len);

            members.push(Member {
                id,
                library_id,
                name,
                embedding,
                source_image,
                created_at,
                updated_at,
            });
        }

        if buf.has_remaining() {
            return Err(FaceError::Corrupt(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            next_library_id,
            next_member_id,
            dimension,
            libraries,
            members,
        })
    }
}

/// Snapshot writer/reader
pub struct Snapshot {
    config: SnapshotConfig,
}

impl Snapshot {
    pub fn new(config: SnapshotConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Generate snapshot filename with timestamp
    fn snapshot_filename(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.config
            .dir
            .join(format!("snapshot_{:024}.{}", nanos, SNAPSHOT_EXT))
    }

    /// Write a snapshot.
    ///
    /// Written to a temporary file and renamed into place, so a crash never
    /// leaves a half-written snapshot behind.
    pub fn save(&self, data: &SnapshotData) -> Result<PathBuf> {
        let path = self.snapshot_filename();
        let tmp = path.with_extension("tmp");

        let encoded = data.encode()?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        info!(
            path = %path.display(),
            libraries = data.libraries.len(),
            members = data.members.len(),
            "Snapshot saved"
        );
        self.cleanup_old_snapshots()?;

        Ok(path)
    }

    /// Load the latest snapshot
    pub fn load_latest(&self) -> Result<Option<SnapshotData>> {
        match self.list_snapshots()?.pop() {
            Some(path) => Ok(Some(self.load(&path)?)),
            None => Ok(None),
        }
    }

    /// Load a specific snapshot file
    pub fn load(&self, path: &Path) -> Result<SnapshotData> {
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        let data = SnapshotData::decode(&raw)?;
        debug!(path = %path.display(), members = data.members.len(), "Snapshot loaded");
        Ok(data)
    }

    /// Snapshot files, oldest first (names embed a zero-padded timestamp)
    fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut snapshots: Vec<PathBuf> = fs::read_dir(&self.config.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == SNAPSHOT_EXT).unwrap_or(false))
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    /// Remove old snapshots beyond max_snapshots
    fn cleanup_old_snapshots(&self) -> Result<()> {
        let snapshots = self.list_snapshots()?;
        let keep = self.config.max_snapshots.max(1);
        let excess = snapshots.len().saturating_sub(keep);

        for path in snapshots.into_iter().take(excess) {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "Old snapshot removed");
        }

        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FaceError::Corrupt(format!("{} {} does not fit in u32", what, value)))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    buf.put_u32_le(to_u32(s.len(), "string length")?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) -> Result<()> {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_time(buf: &mut BytesMut, t: &DateTime<Utc>) {
    buf.put_i64_le(t.timestamp());
    buf.put_u32_le(t.timestamp_subsec_nanos());
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(FaceError::Corrupt(format!(
            "unexpected end of snapshot: need {} bytes, have {}",
            n,
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| FaceError::Corrupt(format!("invalid utf-8: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => get_str(buf).map(Some),
        flag => Err(FaceError::Corrupt(format!("invalid option flag: {}", flag))),
    }
}

fn get_time(buf: &mut &[u8]) -> Result<DateTime<Utc>> {
    need(buf, 12)?;
    let secs = buf.get_i64_le();
    let nanos = buf.get_u32_le();
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| FaceError::Corrupt(format!("invalid timestamp: {}.{}", secs, nanos)))
}
