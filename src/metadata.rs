//! Collection metadata reconciliation.
//!
//! On open, the WAL asks the cluster's metadata service which
//! collections are live and drops checkpoint state for the rest.

use crate::error::MetadataError;

/// A live collection as reported by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub collection_id: String,
    /// Named partitions currently present. The default (unnamed)
    /// partition is implicit.
    pub partitions: Vec<String>,
}

/// Source of truth for which collections exist.
pub trait MetadataSource: Send + Sync {
    fn live_collections(&self) -> Result<Vec<CollectionMeta>, MetadataError>;
}

/// Fixed collection list, for tests and embedded setups.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    collections: Vec<CollectionMeta>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>, partitions: &[&str]) -> Self {
        self.collections.push(CollectionMeta {
            collection_id: collection_id.into(),
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
        });
        self
    }
}

impl MetadataSource for StaticMetadata {
    fn live_collections(&self) -> Result<Vec<CollectionMeta>, MetadataError> {
        Ok(self.collections.clone())
    }
}
