//! Embedding Store
//!
//! Per-library member sets keyed by member id. Each library sits behind its
//! own `RwLock`, so writers on one library never contend with another, and
//! a reader always sees a library's complete member set or none of it.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::record::{LibraryId, Member, MemberId, Page};
use super::similarity::check_dimensions;
use crate::error::{FaceError, Result};

/// Members of one library, ordered by id (ids are allocated monotonically,
/// so id order is insertion order).
#[derive(Debug, Default)]
pub(crate) struct MemberSet {
    pub(crate) members: BTreeMap<MemberId, Member>,
    /// Set by `delete_library`; readers still holding the handle treat the
    /// library as gone.
    dropped: bool,
}

type Shard = Arc<RwLock<MemberSet>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Upsert,
    Replace,
    Restore,
}

struct StoreInner {
    libraries: DashMap<LibraryId, Shard>,
    /// Member id -> owning library
    owners: DashMap<MemberId, LibraryId>,
    /// Fixed on first insert, read-only afterwards
    dimension: RwLock<Option<usize>>,
    next_member_id: AtomicU64,
}

/// Concurrent embedding store
#[derive(Clone)]
pub struct EmbeddingStore {
    inner: Arc<StoreInner>,
}

impl Default for EmbeddingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingStore {
    /// Create a store whose dimension is fixed by the first insert
    pub fn new() -> Self {
        Self::build(None, num_cpus::get() * 4)
    }

    /// Create a store with a preconfigured dimension
    pub fn with_dimension(dimension: usize) -> Self {
        Self::build(Some(dimension), num_cpus::get() * 4)
    }

    pub(crate) fn build(dimension: Option<usize>, shard_amount: usize) -> Self {
        // DashMap requires a power of two greater than one
        let shard_amount = shard_amount.max(2).next_power_of_two();
        Self {
            inner: Arc::new(StoreInner {
                libraries: DashMap::with_shard_amount(shard_amount),
                owners: DashMap::with_shard_amount(shard_amount),
                dimension: RwLock::new(dimension.filter(|d| *d > 0)),
                next_member_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get embedding dimension, `None` until the first insert
    pub fn dimension(&self) -> Option<usize> {
        *self.inner.dimension.read()
    }

    /// Clear the fixed dimension so the next insert sets it again.
    ///
    /// Only allowed while the store holds no members.
    pub fn reset_dimension(&self) -> Result<()> {
        let mut dim = self.inner.dimension.write();
        let stored = self.len();
        if stored > 0 {
            return Err(FaceError::DimensionInUse(stored));
        }
        info!(previous = ?*dim, "Embedding dimension reset");
        *dim = None;
        Ok(())
    }

    /// Open an empty member set for a library
    pub fn create_library(&self, library_id: LibraryId) {
        self.inner
            .libraries
            .entry(library_id)
            .or_insert_with(|| Arc::new(RwLock::new(MemberSet::default())));
    }

    /// Check if the store knows a library
    pub fn contains_library(&self, library_id: LibraryId) -> bool {
        self.inner.libraries.contains_key(&library_id)
    }

    /// Allocate a fresh member id
    pub fn next_member_id(&self) -> MemberId {
        self.inner.next_member_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Id the next allocation will return
    pub fn peek_next_member_id(&self) -> MemberId {
        self.inner.next_member_id.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_member_id(&self, next: MemberId) {
        self.inner.next_member_id.fetch_max(next, Ordering::SeqCst);
    }

    /// Allocate an id and store a new member
    pub fn insert(
        &self,
        library_id: LibraryId,
        name: impl Into<String>,
        embedding: Vec<f32>,
        source_image: Option<String>,
    ) -> Result<Member> {
        let mut member = Member::new(self.next_member_id(), library_id, name, embedding);
        member.source_image = source_image;
        self.put(member)
    }

    /// Insert or replace a member by id.
    ///
    /// Replacing keeps the original `created_at`. The member must stay in the
    /// library it was first stored in.
    pub fn put(&self, member: Member) -> Result<Member> {
        self.store_member(member, PutMode::Upsert)
    }

    /// Replace an existing member; `NotFound` if it was deleted meanwhile
    pub fn replace(&self, member: Member) -> Result<Member> {
        self.store_member(member, PutMode::Replace)
    }

    /// Insert a member loaded from a snapshot, keeping its timestamps
    pub(crate) fn restore(&self, member: Member) -> Result<Member> {
        self.store_member(member, PutMode::Restore)
    }

    fn store_member(&self, mut member: Member, mode: PutMode) -> Result<Member> {
        let library_id = member.library_id;
        let shard = self.shard(library_id)?;
        let _dim = self.pin_dimension(member.dim())?;

        let mut set = Self::write_live(&shard, library_id)?;
        let existing = set.members.get(&member.id).map(|m| m.created_at);
        if mode == PutMode::Replace && existing.is_none() {
            return Err(FaceError::member_not_found(member.id));
        }

        match self.inner.owners.entry(member.id) {
            Entry::Occupied(owner) if *owner.get() != library_id => {
                return Err(FaceError::MemberOwnership {
                    member_id: member.id,
                    library_id: *owner.get(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(library_id);
            }
        }

        if mode != PutMode::Restore {
            member.updated_at = Utc::now();
            if let Some(created_at) = existing {
                member.created_at = created_at;
            }
        }
        self.advance_member_id(member.id + 1);
        set.members.insert(member.id, member.clone());

        debug!(library = library_id, member = member.id, mode = ?mode, "Member stored");
        Ok(member)
    }

    /// Get a member
    pub fn get(&self, library_id: LibraryId, member_id: MemberId) -> Result<Member> {
        self.read(library_id, |members| {
            members
                .get(&member_id)
                .cloned()
                .ok_or_else(|| FaceError::member_not_found(member_id))
        })?
    }

    /// Page through a library in insertion order
    pub fn list_by_library(
        &self,
        library_id: LibraryId,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Member>> {
        self.read(library_id, |members| Page {
            total: members.len(),
            offset,
            limit,
            items: members.values().skip(offset).take(limit).cloned().collect(),
        })
    }

    /// Members with id greater than `after`, in insertion order.
    ///
    /// Cursor pagination: inserts made between calls never shift or repeat
    /// records already returned.
    pub fn list_after(
        &self,
        library_id: LibraryId,
        after: Option<MemberId>,
        limit: usize,
    ) -> Result<Vec<Member>> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.read(library_id, |members| {
            members
                .range((lower, Bound::Unbounded))
                .take(limit)
                .map(|(_, m)| m.clone())
                .collect()
        })
    }

    /// Number of members in a library
    pub fn count(&self, library_id: LibraryId) -> Result<usize> {
        self.read(library_id, |members| members.len())
    }

    /// Delete a member
    pub fn delete(&self, library_id: LibraryId, member_id: MemberId) -> Result<Member> {
        let shard = self.shard(library_id)?;
        let mut set = Self::write_live(&shard, library_id)?;

        let removed = set
            .members
            .remove(&member_id)
            .ok_or_else(|| FaceError::member_not_found(member_id))?;
        self.inner.owners.remove(&member_id);

        debug!(library = library_id, member = member_id, "Member deleted");
        Ok(removed)
    }

    /// Remove a library and all of its members as one step.
    ///
    /// The member set is emptied and tombstoned under its write lock, so no
    /// reader can observe a partially deleted library.
    pub fn delete_library(&self, library_id: LibraryId) -> Result<usize> {
        let shard = self.shard(library_id)?;
        let removed = {
            let mut set = Self::write_live(&shard, library_id)?;
            set.dropped = true;
            for member_id in set.members.keys() {
                self.inner.owners.remove(member_id);
            }
            let removed = set.members.len();
            set.members.clear();
            removed
        };
        self.inner
            .libraries
            .remove_if(&library_id, |_, s| Arc::ptr_eq(s, &shard));

        info!(library = library_id, removed, "Library members deleted");
        Ok(removed)
    }

    /// Get number of stored members across all libraries
    pub fn len(&self) -> usize {
        self.shards().iter().map(|s| s.read().members.len()).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every library the store knows about
    pub fn library_ids(&self) -> Vec<LibraryId> {
        let mut ids: Vec<_> = self.inner.libraries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Run `f` over a consistent view of one library's members
    pub(crate) fn read<R>(
        &self,
        library_id: LibraryId,
        f: impl FnOnce(&BTreeMap<MemberId, Member>) -> R,
    ) -> Result<R> {
        let shard = self.shard(library_id)?;
        let set = shard.read();
        if set.dropped {
            return Err(FaceError::library_not_found(library_id));
        }
        Ok(f(&set.members))
    }

    /// Like [`read`](Self::read), but also hands `f` the dimension, pinned
    /// for the whole call.
    ///
    /// Locks in the same order as puts (dimension, then library), so the
    /// dimension cannot be reset and refixed while `f` runs.
    pub(crate) fn read_pinned<R>(
        &self,
        library_id: LibraryId,
        f: impl FnOnce(Option<usize>, &BTreeMap<MemberId, Member>) -> R,
    ) -> Result<R> {
        let shard = self.shard(library_id)?;
        let dim = self.inner.dimension.read();
        let set = shard.read();
        if set.dropped {
            return Err(FaceError::library_not_found(library_id));
        }
        Ok(f(*dim, &set.members))
    }

    /// Clone the shard handle so no map guard is held while locking it
    fn shard(&self, library_id: LibraryId) -> Result<Shard> {
        self.inner
            .libraries
            .get(&library_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| FaceError::library_not_found(library_id))
    }

    fn shards(&self) -> Vec<Shard> {
        self.inner
            .libraries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn write_live(shard: &Shard, library_id: LibraryId) -> Result<RwLockWriteGuard<'_, MemberSet>> {
        let set = shard.write();
        if set.dropped {
            Err(FaceError::library_not_found(library_id))
        } else {
            Ok(set)
        }
    }

    /// Validate `len` against the dimension, fixing it on first use.
    ///
    /// The returned guard is held across the insert so a concurrent
    /// `reset_dimension` cannot slip in between check and write.
    fn pin_dimension(&self, len: usize) -> Result<RwLockReadGuard<'_, Option<usize>>> {
        if len == 0 {
            return Err(FaceError::DegenerateVector);
        }

        let dim = self.inner.dimension.read();
        if let Some(expected) = *dim {
            check_dimensions(expected, len)?;
            return Ok(dim);
        }
        drop(dim);

        let mut dim = self.inner.dimension.write();
        if dim.is_none() {
            info!(dimension = len, "Embedding dimension fixed");
        }
        let expected = *dim.get_or_insert(len);
        let dim = RwLockWriteGuard::downgrade(dim);
        check_dimensions(expected, len)?;
        Ok(dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store_with_library(id: LibraryId) -> EmbeddingStore {
        let store = EmbeddingStore::new();
        store.create_library(id);
        store
    }

    #[test]
    fn test_embedding_store() {
        let store = store_with_library(1);
        let embedding = vec![0.123_456_79, -0.987_654_3, 1.0e-7, 42.5];

        let stored = store
            .insert(1, "alice", embedding.clone(), Some("uploads/a.jpg".into()))
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.dimension(), Some(4));

        let retrieved = store.get(1, stored.id).unwrap();
        assert_eq!(retrieved.name, "alice");
        assert_eq!(retrieved.source_image.as_deref(), Some("uploads/a.jpg"));
        for (a, b) in retrieved.embedding.iter().zip(embedding.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let store = store_with_library(1);
        store.insert(1, "a", vec![1.0, 0.0, 0.0, 0.0], None).unwrap();

        let result = store.insert(1, "b", vec![1.0, 0.0, 0.0], None);
        assert!(matches!(
            result,
            Err(FaceError::DimensionMismatch {
                expected: 4,
                actual: 3
            })
        ));
        assert_eq!(store.count(1).unwrap(), 1);
    }

    #[test]
    fn test_configured_dimension() {
        let store = EmbeddingStore::with_dimension(512);
        store.create_library(1);
        assert_eq!(store.dimension(), Some(512));
        assert!(store.insert(1, "a", vec![1.0; 4], None).is_err());
        assert!(store.insert(1, "a", vec![1.0; 512], None).is_ok());
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let store = store_with_library(1);
        assert!(matches!(
            store.insert(1, "a", Vec::new(), None),
            Err(FaceError::DegenerateVector)
        ));
        assert_eq!(store.dimension(), None);
    }

    #[test]
    fn test_unknown_library() {
        let store = EmbeddingStore::new();
        let err = store.insert(7, "a", vec![1.0, 0.0], None).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get(7, 1).unwrap_err().is_not_found());
        assert_eq!(store.dimension(), None);
    }

    #[test]
    fn test_replace_keeps_position_and_created_at() {
        let store = store_with_library(1);
        let a = store.insert(1, "a", vec![1.0, 0.0], None).unwrap();
        let b = store.insert(1, "b", vec![0.0, 1.0], None).unwrap();

        let mut updated = a.clone();
        updated.name = "a2".to_string();
        updated.embedding = vec![0.5, 0.5];
        let updated = store.put(updated).unwrap();

        assert_eq!(updated.created_at, a.created_at);
        assert!(updated.updated_at >= a.updated_at);

        let page = store.list_by_library(1, 0, 10).unwrap();
        let names: Vec<_> = page.items.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a2", "b"]);
        assert_eq!(page.items[1].id, b.id);
    }

    #[test]
    fn test_replace_requires_existing() {
        let store = store_with_library(1);
        let a = store.insert(1, "a", vec![1.0, 0.0], None).unwrap();
        store.delete(1, a.id).unwrap();

        assert!(store.replace(a.clone()).unwrap_err().is_not_found());
        assert!(store.get(1, a.id).is_err());
    }

    #[test]
    fn test_pagination() {
        let store = store_with_library(1);
        for i in 0..25 {
            store
                .insert(1, format!("m{}", i), vec![1.0, i as f32], None)
                .unwrap();
        }

        let page = store.list_by_library(1, 10, 10).unwrap();
        assert_eq!(page.total, 25);
        assert_eq!(page.items.len(), 10);
        assert_eq!(page.items[0].name, "m10");

        let last = store.list_by_library(1, 20, 10).unwrap();
        assert_eq!(last.items.len(), 5);
    }

    #[test]
    fn test_cursor_stable_under_inserts() {
        let store = store_with_library(1);
        for i in 0..4 {
            store.insert(1, format!("m{}", i), vec![1.0, 0.0], None).unwrap();
        }

        let first = store.list_after(1, None, 2).unwrap();
        store.insert(1, "late", vec![0.0, 1.0], None).unwrap();
        let cursor = first.last().map(|m| m.id);
        let rest = store.list_after(1, cursor, 10).unwrap();

        let mut seen: Vec<_> = first.iter().chain(rest.iter()).map(|m| m.id).collect();
        let total = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), total);
        assert_eq!(total, 5);
    }

    #[test]
    fn test_delete() {
        let store = store_with_library(1);
        let a = store.insert(1, "a", vec![1.0, 0.0], None).unwrap();

        assert_eq!(store.delete(1, a.id).unwrap().id, a.id);
        assert!(store.delete(1, a.id).unwrap_err().is_not_found());
        assert!(store.get(1, a.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_member_cannot_change_library() {
        let store = store_with_library(1);
        store.create_library(2);
        let a = store.insert(1, "a", vec![1.0, 0.0], None).unwrap();

        let mut moved = a.clone();
        moved.library_id = 2;
        assert!(matches!(
            store.put(moved),
            Err(FaceError::MemberOwnership {
                library_id: 1,
                ..
            })
        ));
        assert_eq!(store.count(2).unwrap(), 0);
    }

    #[test]
    fn test_delete_library() {
        let store = store_with_library(1);
        store.create_library(2);
        for i in 0..5 {
            store.insert(1, format!("m{}", i), vec![1.0, 0.0], None).unwrap();
        }
        let other = store.insert(2, "keep", vec![0.0, 1.0], None).unwrap();

        assert_eq!(store.delete_library(1).unwrap(), 5);
        assert!(store.list_by_library(1, 0, 10).unwrap_err().is_not_found());
        assert!(store.delete_library(1).unwrap_err().is_not_found());
        assert!(store.insert(1, "late", vec![1.0, 0.0], None).is_err());
        assert_eq!(store.get(2, other.id).unwrap().name, "keep");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_library_concurrent_readers() {
        const MEMBERS: usize = 200;

        let store = store_with_library(1);
        for i in 0..MEMBERS {
            store.insert(1, format!("m{}", i), vec![1.0, i as f32], None).unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let s = store.clone();
                thread::spawn(move || loop {
                    match s.list_by_library(1, 0, usize::MAX) {
                        Ok(page) => {
                            assert_eq!(page.total, MEMBERS);
                            assert_eq!(page.items.len(), MEMBERS);
                        }
                        Err(e) => {
                            assert!(e.is_not_found());
                            break;
                        }
                    }
                })
            })
            .collect();

        assert_eq!(store.delete_library(1).unwrap(), MEMBERS);

        for h in readers {
            h.join().unwrap();
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_across_libraries() {
        let store = EmbeddingStore::new();
        for lib in 0..8 {
            store.create_library(lib);
        }

        let handles: Vec<_> = (0..8)
            .map(|lib| {
                let s = store.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        s.insert(lib, format!("m{}", j), vec![1.0, j as f32], None)
                            .unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 800);
        assert_eq!(store.peek_next_member_id(), 801);
    }

    #[test]
    fn test_reset_dimension() {
        let store = store_with_library(1);
        let a = store.insert(1, "a", vec![1.0, 0.0], None).unwrap();

        assert!(matches!(
            store.reset_dimension(),
            Err(FaceError::DimensionInUse(1))
        ));

        store.delete(1, a.id).unwrap();
        store.reset_dimension().unwrap();
        assert_eq!(store.dimension(), None);

        store.insert(1, "b", vec![1.0, 0.0, 0.0], None).unwrap();
        assert_eq!(store.dimension(), Some(3));
    }
}
