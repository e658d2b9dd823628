//! Library Registry
//!
//! Name-keyed library lifecycle. Deletion first tombstones the library's
//! member set in the embedding store, then drops the registry entry. The
//! registry lock is never held while waiting on a library lock, so a slow
//! scan of one library cannot stall lookups of another.

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{FaceError, Result};
use crate::vector::{EmbeddingStore, Library, LibraryId};

#[derive(Debug)]
struct RegistryInner {
    libraries: BTreeMap<LibraryId, Library>,
    /// Exact, case-sensitive name index
    names: HashMap<String, LibraryId>,
    next_id: LibraryId,
}

impl RegistryInner {
    fn library_mut(&mut self, id: LibraryId) -> Result<&mut Library> {
        self.libraries
            .get_mut(&id)
            .ok_or_else(|| FaceError::library_not_found(id))
    }

    fn check_name_free(&self, name: &str, owner: Option<LibraryId>) -> Result<()> {
        match self.names.get(name) {
            Some(existing) if Some(*existing) != owner => {
                Err(FaceError::DuplicateName(name.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Registry of face libraries
#[derive(Clone)]
pub struct LibraryRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    store: EmbeddingStore,
    max_name_len: usize,
}

impl LibraryRegistry {
    pub fn new(store: EmbeddingStore, max_name_len: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                libraries: BTreeMap::new(),
                names: HashMap::new(),
                next_id: 1,
            })),
            store,
            max_name_len,
        }
    }

    /// Register a new library
    pub fn create(&self, name: &str, description: Option<String>) -> Result<Library> {
        self.validate_name(name)?;

        let mut inner = self.inner.write();
        inner.check_name_free(name, None)?;

        let id = inner.next_id;
        inner.next_id += 1;

        let library = Library::new(id, name, description);
        self.store.create_library(id);
        inner.names.insert(library.name.clone(), id);
        inner.libraries.insert(id, library.clone());

        info!(library = id, name = %library.name, "Library created");
        Ok(library)
    }

    /// Rename a library
    pub fn rename(&self, id: LibraryId, new_name: &str) -> Result<Library> {
        self.validate_name(new_name)?;
        self.update(id, Some(new_name), None)
    }

    /// Change name and/or description.
    ///
    /// `None` or an empty name leaves the name untouched; `None` leaves the
    /// description untouched.
    pub fn update(
        &self,
        id: LibraryId,
        name: Option<&str>,
        description: Option<String>,
    ) -> Result<Library> {
        let name = name.filter(|n| !n.is_empty());
        if let Some(name) = name {
            self.validate_name(name)?;
        }

        let mut inner = self.inner.write();
        let old_name = inner.library_mut(id)?.name.clone();

        if let Some(name) = name.filter(|n| *n != old_name) {
            inner.check_name_free(name, Some(id))?;
            inner.names.remove(&old_name);
            inner.names.insert(name.to_string(), id);
            inner.library_mut(id)?.name = name.to_string();
            info!(library = id, from = %old_name, to = %name, "Library renamed");
        }

        let library = inner.library_mut(id)?;
        if description.is_some() {
            library.description = description;
        }
        library.touch();
        Ok(library.clone())
    }

    /// Delete a library and all of its members.
    ///
    /// Every registered library owns a member set, so the store cascade
    /// decides the outcome: whoever tombstones the set wins, and a concurrent
    /// second delete sees `NotFound`. Once tombstoned, lookups through the
    /// registry may still briefly return the library, but every member
    /// operation on it fails with `NotFound`.
    pub fn delete(&self, id: LibraryId) -> Result<usize> {
        if !self.contains(id) {
            return Err(FaceError::library_not_found(id));
        }

        let removed = self.store.delete_library(id)?;

        let mut inner = self.inner.write();
        if let Some(library) = inner.libraries.remove(&id) {
            inner.names.remove(&library.name);
            info!(library = id, name = %library.name, members = removed, "Library deleted");
        }
        Ok(removed)
    }

    /// Get a library by id
    pub fn get(&self, id: LibraryId) -> Result<Library> {
        self.inner
            .read()
            .libraries
            .get(&id)
            .cloned()
            .ok_or_else(|| FaceError::library_not_found(id))
    }

    /// Look up a library by exact name
    pub fn get_by_name(&self, name: &str) -> Option<Library> {
        let inner = self.inner.read();
        inner
            .names
            .get(name)
            .and_then(|id| inner.libraries.get(id))
            .cloned()
    }

    /// All libraries in ascending id order
    pub fn list(&self) -> Vec<Library> {
        self.inner.read().libraries.values().cloned().collect()
    }

    pub fn contains(&self, id: LibraryId) -> bool {
        self.inner.read().libraries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next `create` will assign
    pub fn next_id(&self) -> LibraryId {
        self.inner.read().next_id
    }

    /// Re-register a library loaded from a snapshot, keeping its id
    pub(crate) fn restore(&self, library: Library, next_id: LibraryId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_name_free(&library.name, Some(library.id))?;
        if inner.libraries.contains_key(&library.id) {
            return Err(FaceError::Corrupt(format!(
                "duplicate library id {}",
                library.id
            )));
        }

        inner.next_id = inner.next_id.max(next_id).max(library.id + 1);
        self.store.create_library(library.id);
        inner.names.insert(library.name.clone(), library.id);
        inner.libraries.insert(library.id, library);
        Ok(())
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        validate_name(name, self.max_name_len)
    }
}

/// Reject names that are blank or longer than `max_len` characters.
///
/// Shared by library and member names.
pub(crate) fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FaceError::InvalidName("name must not be empty".to_string()));
    }
    let len = name.chars().count();
    if len > max_len {
        return Err(FaceError::InvalidName(format!(
            "name is {} characters, limit is {}",
            len, max_len
        )));
    }
    Ok(())
}
