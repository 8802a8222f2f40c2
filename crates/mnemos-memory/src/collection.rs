//! A record store paired with its similarity index.
//!
//! [`Collection`] keeps the two consistent: writers hold the index write lock
//! across the store write and the index update, readers hold the read lock
//! while they resolve index hits to stored records. A reader therefore never
//! observes a record that is in one structure but not the other.
//!
//! ## Shared files
//!
//! Several collections (in this process or another) may open the same file.
//! Before a search each collection compares SQLite's `data_version` with the
//! value it last synchronised at; when another connection has committed since,
//! the index catches up by diffing its ids against the stored ones. A hit
//! whose row vanished while the search ran is skipped only if the file
//! changed underneath it; otherwise it is reported as
//! [`MemoryError::IndexUnavailable`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::index::{IndexParams, SimilarityIndex};
use crate::store::{RecordStore, StorageLocation, StoredRecord};

pub struct Collection<R: StoredRecord> {
    store: RecordStore<R>,
    index: RwLock<SimilarityIndex>,
    /// `data_version` the index was last synchronised at. Written only while
    /// holding the index write lock.
    synced_version: AtomicI64,
    /// Set by [`close`][Collection::close] under the index write lock.
    closed: AtomicBool,
}

impl<R: StoredRecord> Collection<R> {
    /// Open the store at `location` and rebuild the index from every record
    /// already persisted there.
    pub fn open(
        location: &StorageLocation,
        dimension: usize,
        params: IndexParams,
        scope: Option<String>,
    ) -> Result<Self> {
        let store: RecordStore<R> = RecordStore::open(location, dimension, scope)?;
        let version = store.data_version()?;
        let mut index = SimilarityIndex::new(dimension, params);
        let existing = store.all()?;
        for record in &existing {
            let base = record.base();
            index.insert(base.id, &base.vector, base.category.as_deref())?;
        }
        if !existing.is_empty() {
            info!(
                table = R::TABLE,
                scope = store.scope().unwrap_or("-"),
                records = existing.len(),
                "rebuilt similarity index from store"
            );
        }
        Ok(Self {
            store,
            index: RwLock::new(index),
            synced_version: AtomicI64::new(version),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dimension(&self) -> usize {
        self.store.dimension()
    }

    pub fn store(&self) -> &RecordStore<R> {
        &self.store
    }

    /// `true` once [`close`][Self::close] has succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, SimilarityIndex>> {
        self.index.read().map_err(|_| {
            warn!(table = R::TABLE, "similarity index lock poisoned");
            MemoryError::IndexUnavailable(format!("{} index lock poisoned", R::TABLE))
        })
    }

    fn write_index(&self) -> Result<RwLockWriteGuard<'_, SimilarityIndex>> {
        self.index.write().map_err(|_| {
            warn!(table = R::TABLE, "similarity index lock poisoned");
            MemoryError::IndexUnavailable(format!("{} index lock poisoned", R::TABLE))
        })
    }

    /// Bring the index up to date with commits made through other
    /// connections to the same file.
    fn refresh(&self) -> Result<()> {
        if self.store.data_version()? == self.synced_version.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut index = self.write_index()?;
        // Read the version before the ids so a commit racing the diff is
        // picked up by the next refresh.
        let version = self.store.data_version()?;
        if version == self.synced_version.load(Ordering::Acquire) || self.is_closed() {
            return Ok(());
        }

        let stored = self.store.ids()?;
        let present: HashSet<Uuid> = stored.iter().copied().collect();
        let gone: Vec<Uuid> = index.ids().filter(|id| !present.contains(id)).collect();
        for id in &gone {
            index.remove(id);
        }
        let added: Vec<Uuid> = stored.into_iter().filter(|id| !index.contains(id)).collect();
        let mut records = self.store.get_many(&added)?;
        for id in &added {
            // Deleted again between the two reads; the next refresh settles it.
            let Some(record) = records.remove(id) else {
                continue;
            };
            let base = record.base();
            index.insert(base.id, &base.vector, base.category.as_deref())?;
        }

        self.synced_version.store(version, Ordering::Release);
        debug!(
            table = R::TABLE,
            scope = self.store.scope().unwrap_or("-"),
            added = added.len(),
            removed = gone.len(),
            "similarity index caught up with store"
        );
        Ok(())
    }

    /// Number of indexed records.
    pub fn len(&self) -> Result<usize> {
        self.refresh()?;
        Ok(self.read_index()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Store and index `record`. Either both happen or neither is visible.
    ///
    /// A closed collection refuses with [`MemoryError::NotFound`].
    pub fn insert(&self, record: R) -> Result<Uuid> {
        self.store.validate(&record)?;
        let base = record.base();
        let id = base.id;

        let mut index = self.write_index()?;
        if self.is_closed() {
            return Err(MemoryError::NotFound(format!(
                "{} collection {} is closed",
                R::TABLE,
                self.store.scope().unwrap_or("-")
            )));
        }
        if index.contains(&id) {
            return Err(MemoryError::DuplicateId(id));
        }
        self.store.insert(&record)?;
        if let Err(e) = index.insert(id, &base.vector, base.category.as_deref()) {
            warn!(table = R::TABLE, %id, error = %e, "index registration failed; rolling back store write");
            if let Err(rollback) = self.store.delete(&id) {
                warn!(table = R::TABLE, %id, error = %rollback, "rollback of store write failed");
            }
            return Err(e);
        }
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Result<R> {
        self.store.get(id)
    }

    /// Remove a record and its index entry.
    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let mut index = self.write_index()?;
        self.store.delete(id)?;
        index.remove(id);
        Ok(())
    }

    /// Remove every record and refuse further inserts. Returns the number
    /// removed.
    pub fn close(&self) -> Result<usize> {
        let mut index = self.write_index()?;
        let removed = self.store.purge()?;
        index.clear();
        self.closed.store(true, Ordering::Release);
        Ok(removed)
    }

    /// Up to `k` records most similar to `query` whose category equals `key`
    /// and whose similarity is strictly above `floor` (when given), paired
    /// with their similarity, most similar first.
    ///
    /// Only hits that pass the floor are read from the store.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        key: Option<&str>,
        floor: Option<f32>,
    ) -> Result<Vec<(R, f32)>> {
        self.refresh()?;
        let index = self.read_index()?;
        let hits = index.query_above(query, k, key, floor.unwrap_or(f32::NEG_INFINITY))?;
        let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut records = self.store.get_many(&ids)?;
        drop(index);

        if records.len() < hits.len()
            && self.store.data_version()? != self.synced_version.load(Ordering::Acquire)
        {
            // Another connection deleted rows mid-search.
            return Ok(hits
                .into_iter()
                .filter_map(|hit| records.remove(&hit.id).map(|r| (r, hit.similarity)))
                .collect());
        }

        hits.into_iter()
            .map(|hit| {
                records
                    .remove(&hit.id)
                    .map(|r| (r, hit.similarity))
                    .ok_or_else(|| {
                        MemoryError::IndexUnavailable(format!(
                            "{} index entry {} has no stored record",
                            R::TABLE,
                            hit.id
                        ))
                    })
            })
            .collect()
    }
}
