//! Face Engine
//!
//! Service-level entry point tying the embedder, library registry,
//! embedding store and search engine together. Every call is timed into
//! [`Metrics`].

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::EngineConfig;
use crate::embedder::{Embedder, FaceInfo};
use crate::error::{FaceError, Result};
use crate::library::{validate_name, LibraryRegistry};
use crate::metrics::Metrics;
use crate::persistence::SnapshotData;
use crate::vector::{
    Comparison, EmbeddingStore, Library, LibraryId, Member, MemberId, Page, QueryResult,
    SearchEngine,
};

/// Changes applied by [`FaceEngine::update_member`]
#[derive(Debug, Clone, Default)]
pub struct MemberUpdate<'a> {
    pub name: Option<String>,
    /// New photo; re-embedded before anything is written
    pub image: Option<&'a [u8]>,
    pub source_image: Option<String>,
}

impl<'a> MemberUpdate<'a> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_image(mut self, image: &'a [u8], source_image: Option<String>) -> Self {
        self.image = Some(image);
        self.source_image = source_image;
        self
    }
}

/// A stored member and the detection its embedding came from
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledMember {
    pub member: Member,
    /// `None` when no image was embedded by the call
    pub face: Option<FaceInfo>,
}

/// Hits for a query photo, with where its face was found
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSearch {
    pub query_face: FaceInfo,
    pub results: Vec<QueryResult>,
}

/// Face library service
#[derive(Clone)]
pub struct FaceEngine {
    config: EngineConfig,
    store: EmbeddingStore,
    registry: LibraryRegistry,
    search: SearchEngine,
    embedder: Arc<dyn Embedder>,
    metrics: Arc<Metrics>,
}

impl FaceEngine {
    /// Create an empty engine.
    ///
    /// The dimension comes from the config, else from the embedder, else
    /// from the first stored member.
    pub fn new(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Self {
        let dimension = config.dimension.or_else(|| embedder.dimensions());
        Self::assemble(config, embedder, dimension)
    }

    /// Rebuild an engine from a snapshot
    pub fn from_snapshot(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        data: SnapshotData,
    ) -> Result<Self> {
        let configured = config.dimension.or_else(|| embedder.dimensions());
        let dimension = match (data.dimension, configured) {
            (Some(stored), Some(expected)) if stored != expected => {
                return Err(FaceError::DimensionMismatch {
                    expected,
                    actual: stored,
                });
            }
            (stored, expected) => stored.or(expected),
        };

        let engine = Self::assemble(config, embedder, dimension);
        for library in data.libraries {
            engine.registry.restore(library, data.next_library_id)?;
        }
        for member in data.members {
            engine.store.restore(member)?;
        }
        engine.store.advance_member_id(data.next_member_id);

        debug!(
            libraries = engine.registry.len(),
            members = engine.store.len(),
            "Engine restored from snapshot"
        );
        Ok(engine)
    }

    fn assemble(config: EngineConfig, embedder: Arc<dyn Embedder>, dimension: Option<usize>) -> Self {
        let store = EmbeddingStore::build(dimension, config.effective_shards());
        let registry = LibraryRegistry::new(store.clone(), config.max_name_len);
        let search = SearchEngine::new(store.clone(), config.search);
        Self {
            config,
            store,
            registry,
            search,
            embedder,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn registry(&self) -> &LibraryRegistry {
        &self.registry
    }

    pub fn search_engine(&self) -> &SearchEngine {
        &self.search
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn create_library(&self, name: &str, description: Option<String>) -> Result<Library> {
        self.timed("create_library", || self.registry.create(name, description))
    }

    pub fn list_libraries(&self) -> Vec<Library> {
        self.registry.list()
    }

    pub fn get_library(&self, id: LibraryId) -> Result<Library> {
        self.timed("get_library", || self.registry.get(id))
    }

    /// Change name and/or description
    pub fn update_library(
        &self,
        id: LibraryId,
        name: Option<&str>,
        description: Option<String>,
    ) -> Result<Library> {
        self.timed("update_library", || self.registry.update(id, name, description))
    }

    pub fn rename_library(&self, id: LibraryId, name: &str) -> Result<Library> {
        self.timed("rename_library", || self.registry.rename(id, name))
    }

    /// Delete a library and every member in it; returns the member count
    pub fn delete_library(&self, id: LibraryId) -> Result<usize> {
        self.timed("delete_library", || self.registry.delete(id))
    }

    /// List members with 1-based pages
    pub fn list_members(
        &self,
        library_id: LibraryId,
        page: usize,
        page_size: usize,
    ) -> Result<Page<Member>> {
        self.timed("list_members", || {
            if page == 0 || page_size == 0 || page_size > self.config.max_page_size {
                return Err(FaceError::InvalidPage { page, page_size });
            }
            let offset = (page - 1).saturating_mul(page_size);
            self.store.list_by_library(library_id, offset, page_size)
        })
    }

    pub fn get_member(&self, library_id: LibraryId, member_id: MemberId) -> Result<Member> {
        self.timed("get_member", || self.store.get(library_id, member_id))
    }

    /// Embed `image` and add the face as a new member.
    ///
    /// Nothing is stored when face extraction fails.
    pub fn add_member(
        &self,
        library_id: LibraryId,
        name: &str,
        image: &[u8],
        source_image: Option<String>,
    ) -> Result<EnrolledMember> {
        self.timed("add_member", || {
            validate_name(name, self.config.max_name_len)?;
            self.registry.get(library_id)?;
            let face = self.embedder.embed(image)?;
            let member = self
                .store
                .insert(library_id, name, face.embedding, source_image)?;
            Ok(EnrolledMember {
                member,
                face: Some(face.info),
            })
        })
    }

    /// Add a member from an already computed embedding
    pub fn add_member_embedding(
        &self,
        library_id: LibraryId,
        name: &str,
        embedding: Vec<f32>,
        source_image: Option<String>,
    ) -> Result<Member> {
        self.timed("add_member", || {
            validate_name(name, self.config.max_name_len)?;
            self.registry.get(library_id)?;
            self.store.insert(library_id, name, embedding, source_image)
        })
    }

    /// Rename and/or re-embed a member.
    ///
    /// An empty name leaves the name unchanged. A new image is embedded
    /// first; on failure the member is left as it was.
    pub fn update_member(
        &self,
        library_id: LibraryId,
        member_id: MemberId,
        update: MemberUpdate<'_>,
    ) -> Result<EnrolledMember> {
        self.timed("update_member", || {
            let name = update.name.filter(|n| !n.is_empty());
            if let Some(name) = &name {
                validate_name(name, self.config.max_name_len)?;
            }

            let mut member = self.store.get(library_id, member_id)?;
            let mut face = None;
            if let Some(image) = update.image {
                let detected = self.embedder.embed(image)?;
                member.embedding = detected.embedding;
                member.source_image = update.source_image;
                face = Some(detected.info);
            }
            if let Some(name) = name {
                member.name = name;
            }

            Ok(EnrolledMember {
                member: self.store.replace(member)?,
                face,
            })
        })
    }

    pub fn delete_member(&self, library_id: LibraryId, member_id: MemberId) -> Result<Member> {
        self.timed("delete_member", || self.store.delete(library_id, member_id))
    }

    /// Embed a query photo and search a library
    pub fn search(
        &self,
        library_id: LibraryId,
        image: &[u8],
        top_k: usize,
        threshold: f32,
    ) -> Result<FaceSearch> {
        self.timed("search", || {
            self.registry.get(library_id)?;
            let query = self.embedder.embed(image)?;
            let results = self
                .search
                .search(library_id, &query.embedding, top_k, threshold)?;
            Ok(FaceSearch {
                query_face: query.info,
                results,
            })
        })
    }

    /// Search a library with an already computed embedding
    pub fn search_embedding(
        &self,
        library_id: LibraryId,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<QueryResult>> {
        self.timed("search", || {
            self.search.search(library_id, query, top_k, threshold)
        })
    }

    /// Embed two photos and compare the faces
    pub fn compare_images(&self, a: &[u8], b: &[u8]) -> Result<Comparison> {
        self.timed("compare", || {
            let a = self.embedder.embed(a)?;
            let b = self.embedder.embed(b)?;
            self.search.compare(&a.embedding, &b.embedding)
        })
    }

    pub fn compare(&self, a: &[f32], b: &[f32]) -> Result<Comparison> {
        self.timed("compare", || self.search.compare(a, b))
    }

    /// Capture every library and member.
    ///
    /// Each library is read under its own lock; a library deleted while the
    /// snapshot is taken is left out entirely.
    pub fn snapshot(&self) -> Result<SnapshotData> {
        let mut libraries = Vec::new();
        let mut members = Vec::new();

        for library in self.registry.list() {
            match self.store.list_by_library(library.id, 0, usize::MAX) {
                Ok(page) => {
                    members.extend(page.items);
                    libraries.push(library);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(SnapshotData {
            next_library_id: self.registry.next_id(),
            next_member_id: self.store.peek_next_member_id(),
            dimension: self.store.dimension(),
            libraries,
            members,
        })
    }

    fn timed<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        self.metrics.record_operation(op, elapsed, result.is_ok());
        match &result {
            Ok(_) => debug!(op, latency = ?elapsed, "Operation complete"),
            Err(e) => debug!(op, latency = ?elapsed, error = %e, "Operation failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::embedder::{DetectedFace, EmbedderError, FixedEmbedder};
    use std::thread;
    use std::time::Duration;

    fn alice_face() -> FaceInfo {
        FaceInfo {
            bbox: [12.0, 8.0, 96.0, 120.0],
            landmarks: vec![[40.0, 50.0], [70.0, 50.0], [55.0, 70.0], [44.0, 92.0], [66.0, 92.0]],
            det_score: 0.93,
        }
    }

    fn engine() -> FaceEngine {
        let embedder = FixedEmbedder::new(2)
            .with_detection(b"alice-1", DetectedFace::new(vec![1.0, 0.0], alice_face()))
            .with_face(b"alice-2", vec![0.9, 0.1])
            .with_face(b"bob", vec![0.0, 1.0])
            .with_face(b"blank", vec![0.0, 0.0])
            .with_failure(b"empty-room", EmbedderError::NoFaceDetected)
            .with_failure(b"group", EmbedderError::MultipleFacesDetected);
        FaceEngine::new(EngineConfig::default(), Arc::new(embedder))
    }

    #[test]
    fn test_dimension_from_embedder() {
        assert_eq!(engine().store().dimension(), Some(2));
    }

    #[test]
    fn test_add_and_search() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();
        let alice = engine.add_member(lib.id, "alice", b"alice-1", None).unwrap();
        assert_eq!(alice.face, Some(alice_face()));
        engine.add_member(lib.id, "bob", b"bob", None).unwrap();

        let found = engine.search(lib.id, b"alice-2", 10, 0.5).unwrap();
        assert_eq!(found.query_face, FaceInfo::default());
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].member_id, alice.member.id);
        assert_eq!(found.results[0].name, "alice");
        assert!(found.results[0].similarity_percent > 95.0);

        let found = engine.search(lib.id, b"alice-1", 10, 0.5).unwrap();
        assert_eq!(found.query_face, alice_face());
    }

    #[test]
    fn test_failed_extraction_writes_nothing() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();

        let err = engine.add_member(lib.id, "ghost", b"empty-room", None).unwrap_err();
        assert!(matches!(
            err,
            FaceError::Embedder(EmbedderError::NoFaceDetected)
        ));
        let err = engine.add_member(lib.id, "crowd", b"group", None).unwrap_err();
        assert!(matches!(
            err,
            FaceError::Embedder(EmbedderError::MultipleFacesDetected)
        ));
        assert!(matches!(
            engine.add_member(lib.id, "x", b"garbage", None),
            Err(FaceError::Embedder(EmbedderError::UnreadableImage(_)))
        ));

        assert_eq!(engine.list_members(lib.id, 1, 10).unwrap().total, 0);
        assert_eq!(engine.metrics().failed_ops(), 3);
    }

    #[test]
    fn test_add_to_missing_library() {
        let engine = engine();
        assert!(engine
            .add_member(42, "alice", b"alice-1", None)
            .unwrap_err()
            .is_not_found());
        assert!(engine.store().is_empty());
    }

    #[test]
    fn test_member_name_validation() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();

        let too_long = "x".repeat(101);
        for bad in ["", "   ", too_long.as_str()] {
            assert!(matches!(
                engine.add_member(lib.id, bad, b"alice-1", None),
                Err(FaceError::InvalidName(_))
            ));
            assert!(matches!(
                engine.add_member_embedding(lib.id, bad, vec![1.0, 0.0], None),
                Err(FaceError::InvalidName(_))
            ));
        }
        assert!(engine.store().is_empty());

        let longest = "y".repeat(100);
        let member = engine
            .add_member_embedding(lib.id, &longest, vec![1.0, 0.0], None)
            .unwrap();
        assert_eq!(member.name, longest);

        assert!(matches!(
            engine.update_member(lib.id, member.id, MemberUpdate::default().with_name(" ")),
            Err(FaceError::InvalidName(_))
        ));
        assert!(matches!(
            engine.update_member(
                lib.id,
                member.id,
                MemberUpdate::default().with_name("z".repeat(101))
            ),
            Err(FaceError::InvalidName(_))
        ));
        assert_eq!(engine.get_member(lib.id, member.id).unwrap().name, longest);
    }

    #[test]
    fn test_update_member() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();
        let member = engine.add_member(lib.id, "alice", b"alice-1", None).unwrap().member;

        // Failed re-embedding leaves the member untouched
        let update = MemberUpdate::default()
            .with_name("renamed")
            .with_image(b"group", None);
        assert!(engine.update_member(lib.id, member.id, update).is_err());
        let unchanged = engine.get_member(lib.id, member.id).unwrap();
        assert_eq!(unchanged.name, "alice");
        assert_eq!(unchanged.embedding, vec![1.0, 0.0]);

        // An empty name is "unchanged", matching library updates
        let renamed_only = engine
            .update_member(lib.id, member.id, MemberUpdate::default().with_name(""))
            .unwrap();
        assert_eq!(renamed_only.member.name, "alice");
        assert_eq!(renamed_only.face, None);

        let update = MemberUpdate::default()
            .with_name("bob")
            .with_image(b"bob", Some("uploads/bob.jpg".to_string()));
        let updated = engine.update_member(lib.id, member.id, update).unwrap();
        assert_eq!(updated.member.name, "bob");
        assert_eq!(updated.member.embedding, vec![0.0, 1.0]);
        assert_eq!(updated.member.created_at, member.created_at);
        assert_eq!(updated.face, Some(FaceInfo::default()));

        let found = engine.search(lib.id, b"bob", 10, 0.5).unwrap();
        assert_eq!(found.results[0].member_id, member.id);

        assert!(engine
            .update_member(lib.id, 999, MemberUpdate::default().with_name("x"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_list_members_pages() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();
        for i in 0..15 {
            engine
                .add_member_embedding(lib.id, &format!("m{}", i), vec![1.0, i as f32], None)
                .unwrap();
        }

        let second = engine.list_members(lib.id, 2, 10).unwrap();
        assert_eq!(second.total, 15);
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items[0].name, "m10");

        assert!(matches!(
            engine.list_members(lib.id, 0, 10),
            Err(FaceError::InvalidPage { .. })
        ));
        assert!(matches!(
            engine.list_members(lib.id, 1, 101),
            Err(FaceError::InvalidPage { .. })
        ));
    }

    #[test]
    fn test_delete_library_cascades() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();
        let member = engine.add_member(lib.id, "alice", b"alice-1", None).unwrap().member;

        assert_eq!(engine.delete_library(lib.id).unwrap(), 1);
        assert!(engine.get_library(lib.id).unwrap_err().is_not_found());
        assert!(engine.list_members(lib.id, 1, 10).unwrap_err().is_not_found());
        assert!(engine.get_member(lib.id, member.id).unwrap_err().is_not_found());
        assert!(engine.search(lib.id, b"alice-1", 10, 0.5).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_does_not_stall_other_libraries() {
        let engine = engine();
        let slow = engine.create_library("slow", None).unwrap();
        let other = engine.create_library("other", None).unwrap();
        engine.add_member(slow.id, "alice", b"alice-1", None).unwrap();
        engine.add_member(other.id, "bob", b"bob", None).unwrap();

        let (scanning_tx, scanning_rx) = std::sync::mpsc::channel();
        let scan = {
            let engine = engine.clone();
            thread::spawn(move || {
                engine
                    .store()
                    .read(slow.id, |_| {
                        scanning_tx.send(()).unwrap();
                        thread::sleep(Duration::from_millis(800));
                    })
                    .unwrap();
            })
        };
        scanning_rx.recv().unwrap();

        let delete = {
            let engine = engine.clone();
            thread::spawn(move || engine.delete_library(slow.id))
        };
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let found = engine.search(other.id, b"bob", 10, 0.5).unwrap();
        engine.add_member(other.id, "bob-2", b"bob", None).unwrap();
        let waited = start.elapsed();

        assert_eq!(found.results.len(), 1);
        assert!(
            waited < Duration::from_millis(400),
            "library {} waited {:?} behind a delete of library {}",
            other.id,
            waited,
            slow.id
        );

        scan.join().unwrap();
        assert_eq!(delete.join().unwrap().unwrap(), 1);
        assert!(engine.get_library(slow.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_degenerate_member_does_not_abort_search() {
        let engine = engine();
        let lib = engine.create_library("staff", None).unwrap();
        engine.add_member(lib.id, "blank", b"blank", None).unwrap();
        let alice = engine.add_member(lib.id, "alice", b"alice-1", None).unwrap().member;

        let found = engine.search(lib.id, b"alice-1", 10, 0.5).unwrap();
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].member_id, alice.id);
    }

    #[test]
    fn test_compare_images() {
        let engine = engine();
        let c = engine.compare_images(b"alice-1", b"bob").unwrap();
        assert!(c.cosine_similarity.abs() < 1e-6);
        assert!((c.euclidean_distance - 2f32.sqrt()).abs() < 1e-4);
        assert!((c.similarity_percent - 50.0).abs() < 1e-4);
        assert!(!c.same_identity);

        assert!(engine.compare_images(b"alice-1", b"alice-2").unwrap().same_identity);
        assert!(engine.compare_images(b"alice-1", b"group").is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let engine = engine();
        let staff = engine
            .create_library("staff", Some("badges".to_string()))
            .unwrap();
        let visitors = engine.create_library("visitors", None).unwrap();
        engine.add_member(staff.id, "alice", b"alice-1", Some("a.jpg".into())).unwrap();
        engine.add_member(visitors.id, "bob", b"bob", None).unwrap();
        let gone = engine.create_library("gone", None).unwrap();
        engine.delete_library(gone.id).unwrap();

        let data = engine.snapshot().unwrap();
        assert_eq!(data.libraries.len(), 2);
        assert_eq!(data.members.len(), 2);

        let embedder = Arc::new(FixedEmbedder::new(2).with_face(b"alice-2", vec![0.9, 0.1]));
        let config = EngineConfig::default()
            .with_search(SearchConfig::default().with_top_k(5));
        let restored = FaceEngine::from_snapshot(config, embedder, data.clone()).unwrap();

        assert_eq!(restored.list_libraries(), engine.list_libraries());
        assert_eq!(restored.snapshot().unwrap().members, data.members);

        let hits = restored.search(staff.id, b"alice-2", 10, 0.5).unwrap().results;
        assert_eq!(hits[0].name, "alice");

        // Fresh ids never collide with restored ones
        let next = restored.create_library("new", None).unwrap();
        assert!(next.id > gone.id);
        let member = restored
            .add_member_embedding(next.id, "carol", vec![0.5, 0.5], None)
            .unwrap();
        assert!(data.members.iter().all(|m| m.id < member.id));
    }

    #[test]
    fn test_snapshot_skips_library_deleted_midway() {
        let engine = engine();
        let kept = engine.create_library("kept", None).unwrap();
        let dropped = engine.create_library("dropped", None).unwrap();
        engine.add_member(kept.id, "alice", b"alice-1", None).unwrap();
        engine.add_member(dropped.id, "bob", b"bob", None).unwrap();

        // Cascade done in the store, registry entry not yet removed
        engine.store().delete_library(dropped.id).unwrap();
        assert!(engine.registry().contains(dropped.id));

        let data = engine.snapshot().unwrap();
        assert_eq!(data.libraries.len(), 1);
        assert_eq!(data.libraries[0].id, kept.id);
        assert_eq!(data.members.len(), 1);
    }

    #[test]
    fn test_snapshot_dimension_conflict() {
        let data = SnapshotData {
            dimension: Some(3),
            ..SnapshotData::default()
        };
        let result = FaceEngine::from_snapshot(
            EngineConfig::default(),
            Arc::new(FixedEmbedder::new(2)),
            data,
        );
        assert!(matches!(
            result,
            Err(FaceError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }
}
