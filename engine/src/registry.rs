//! Shared lookup of collections by identifier.
//!
//! There is one collection per identifier. Concurrent callers acquiring the
//! same identifier get clones of the same instance, never a copy.

use crate::{collection::Collection, error::Result, CollectionConfig, CollectionId};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of live collections, keyed by identifier.
///
/// Thread-safe and can be shared across tasks via `Arc`.
#[derive(Debug, Default)]
pub struct CollectionRegistry {
    collections: DashMap<CollectionId, Collection>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Resolve or create the collection for `config.id`, then wait until its
    /// first authoritative round has been merged.
    ///
    /// When the identifier is already registered, `config` is ignored. The
    /// sync source's `sync` runs while the registry entry is held, so it must
    /// not call back into this registry.
    pub async fn acquire(&self, config: CollectionConfig) -> Result<Collection> {
        let collection = self.get_or_create(config)?;
        collection.wait_first_commit().await;
        Ok(collection)
    }

    fn get_or_create(&self, config: CollectionConfig) -> Result<Collection> {
        match self.collections.entry(config.id.clone()) {
            Entry::Occupied(entry) => {
                debug!(collection = %entry.key(), "reusing registered collection");
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let collection = Collection::new(config)?;
                info!(collection = %collection.id(), "collection registered");
                entry.insert(collection.clone());
                Ok(collection)
            }
        }
    }

    /// Registered collection for `id`, ready or not.
    pub fn get(&self, id: &str) -> Option<Collection> {
        self.collections.get(id).map(|entry| entry.value().clone())
    }

    /// Forget the collection for `id`. Existing handles keep working.
    pub fn remove(&self, id: &str) -> Option<Collection> {
        let removed = self.collections.remove(id).map(|(_, collection)| collection);
        if removed.is_some() {
            info!(collection = %id, "collection unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
