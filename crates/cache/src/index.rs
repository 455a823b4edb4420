//! Index capability interface and the concrete index kinds.
//!
//! Indexers are stateless key-derivation functions of a record; they hold
//! no record references themselves and the set registered with a cache is
//! immutable after init.

use mercury_core::{Kind, Metric, Object};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use crate::error::IndexError;

pub type KeySet = SmallVec<[String; 2]>;

/// Derive the index keys one record contributes. A record may contribute
/// several keys to the same index.
pub trait Indexer<T>: Send + Sync {
    fn index_keys(&self, item: &T) -> Result<KeySet, IndexError>;
}

/// Named index registration handed to `Cache::new`.
pub struct IndexSpec<T> {
    pub name: String,
    pub indexer: Box<dyn Indexer<T>>,
    pub allow_missing: bool,
}

impl<T> IndexSpec<T> {
    pub fn new(name: impl Into<String>, indexer: Box<dyn Indexer<T>>) -> Self {
        Self { name: name.into(), indexer, allow_missing: false }
    }

    /// Records the indexer cannot key are silently excluded from this
    /// index instead of failing the mutation.
    pub fn allow_missing(mut self) -> Self {
        self.allow_missing = true;
        self
    }
}

/// Primary index over objects: keys by the immutable UID.
pub struct UidIndexer;

impl Indexer<Object> for UidIndexer {
    fn index_keys(&self, item: &Object) -> Result<KeySet, IndexError> {
        if item.metadata.uid.is_empty() {
            return Err(IndexError::Malformed("object has empty UID".into()));
        }
        Ok(smallvec![item.metadata.uid.clone()])
    }
}

/// Primary index over metrics: keys by the
/// Kind/Namespace/AddressSpace/Name/MetricName composite.
pub struct MetricIndexer;

impl Indexer<Metric> for MetricIndexer {
    fn index_keys(&self, item: &Metric) -> Result<KeySet, IndexError> {
        if item.value.name.is_empty() {
            return Err(IndexError::Malformed("metric has empty name".into()));
        }
        Ok(smallvec![item.composite_key()])
    }
}

/// Per-kind hierarchy key derivation.
pub type HierarchyKeyFn = fn(&Object) -> Result<KeySet, IndexError>;

/// Hierarchy index: keys children under a computed parent key so
/// "children of parent P" resolves as a prefix scan rather than a table
/// scan. Built from a per-kind registry of key-extraction functions;
/// several independent hierarchy indexes may coexist under distinct names.
pub struct HierarchyIndexer {
    creators: FxHashMap<Kind, HierarchyKeyFn>,
}

impl HierarchyIndexer {
    pub fn new<I>(creators: I) -> Self
    where
        I: IntoIterator<Item = (Kind, HierarchyKeyFn)>,
    {
        Self { creators: creators.into_iter().collect() }
    }
}

impl Indexer<Object> for HierarchyIndexer {
    fn index_keys(&self, item: &Object) -> Result<KeySet, IndexError> {
        match self.creators.get(&item.kind) {
            Some(f) => f(item),
            None => Err(IndexError::Unsupported(item.kind.to_string())),
        }
    }
}
