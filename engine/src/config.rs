//! Collection configuration.

use crate::{
    error::Result, schema::StandardSchema, sync::SyncSource, CollectionId, Error, MutationFn,
    OperationType,
};
use std::sync::Arc;

/// Everything a collection needs at construction.
///
/// A sync source is mandatory. Persistence functions are only required for
/// the operations that are actually used.
#[derive(Clone)]
pub struct CollectionConfig {
    pub id: CollectionId,
    pub sync: Option<Arc<dyn SyncSource>>,
    pub on_insert: Option<MutationFn>,
    pub on_update: Option<MutationFn>,
    pub on_delete: Option<MutationFn>,
    pub schema: Option<Arc<dyn StandardSchema>>,
}

impl CollectionConfig {
    pub fn new(id: impl Into<CollectionId>) -> Self {
        Self {
            id: id.into(),
            sync: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
            schema: None,
        }
    }

    pub fn with_sync(self, sync: impl SyncSource + 'static) -> Self {
        self.with_shared_sync(Arc::new(sync))
    }

    pub fn with_shared_sync(mut self, sync: Arc<dyn SyncSource>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_on_insert(mut self, f: MutationFn) -> Self {
        self.on_insert = Some(f);
        self
    }

    pub fn with_on_update(mut self, f: MutationFn) -> Self {
        self.on_update = Some(f);
        self
    }

    pub fn with_on_delete(mut self, f: MutationFn) -> Self {
        self.on_delete = Some(f);
        self
    }

    pub fn with_schema(mut self, schema: impl StandardSchema + 'static) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Persistence function for `operation`.
    pub fn mutation_fn(&self, operation: OperationType) -> Result<MutationFn> {
        let f = match operation {
            OperationType::Insert => &self.on_insert,
            OperationType::Update => &self.on_update,
            OperationType::Delete => &self.on_delete,
        };
        f.clone().ok_or(Error::MissingMutationFn { operation })
    }
}

impl std::fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("id", &self.id)
            .field("sync", &self.sync.is_some())
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("schema", &self.schema.is_some())
            .finish()
    }
}
