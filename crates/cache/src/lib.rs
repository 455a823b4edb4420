//! Mercury cache: the in-RAM object store backing the console query API.
//!
//! One `Cache<T>` owns a UID-keyed table plus a set of named secondary
//! indexes, all guarded by a single reader-writer lock so every query
//! observes one internally consistent snapshot: a concurrent mutation can
//! never leave a record visible in the table but missing from an index.
//! Writers serialize; readers share the lock and proceed concurrently.
//!
//! Mutations recompute a record's entries in every index as one unit.
//! Queries run the pipeline: index prefix narrowing, namespace
//! restriction, filter predicate, stable ordering, then offset/limit —
//! `total` is recorded before pagination and always reflects the filtered
//! set.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use mercury_core::Record;
use mercury_expr::{Filter, OrderBy};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

mod error;
pub mod hierarchy;
mod index;

pub use error::{CacheError, IndexError};
pub use hierarchy::{MetricCache, ObjectCache};
pub use index::{HierarchyIndexer, HierarchyKeyFn, IndexSpec, Indexer, KeySet, MetricIndexer, UidIndexer};

/// Name of the required primary index.
pub const PRIMARY_INDEX: &str = "id";

struct Row<T> {
    item: Arc<T>,
    /// Monotonic insertion sequence; unordered queries sort by it so
    /// "no orderby" means insertion order regardless of index key shape.
    seq: u64,
}

#[derive(Default)]
struct IndexState {
    /// key -> primary key. Sorted, so parent prefixes scan their subtree.
    entries: BTreeMap<String, String>,
    /// primary key -> the keys it contributed, for entry replacement.
    by_uid: FxHashMap<String, SmallVec<[String; 2]>>,
}

struct Inner<T> {
    table: FxHashMap<String, Row<T>>,
    indexes: Vec<IndexState>,
    next_seq: u64,
}

/// Per-item outcome of a batched `add`/`upsert`: accepted items are
/// committed, rejected ones reported individually.
#[derive(Debug, Default)]
pub struct AddOutcome {
    pub accepted: usize,
    pub rejected: Vec<CacheError>,
}

impl AddOutcome {
    pub fn ok(&self) -> bool {
        self.rejected.is_empty()
    }

    /// Collapse to the first rejection, for callers adding a single item.
    pub fn into_result(mut self) -> Result<usize, CacheError> {
        if self.rejected.is_empty() {
            Ok(self.accepted)
        } else {
            Err(self.rejected.remove(0))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuerySpec<'a> {
    /// Index to scan; the primary index when absent.
    pub index: Option<&'a str>,
    /// Key prefix narrowing the scan (kind, namespace or parent subtree).
    pub prefix: Option<&'a str>,
    /// Exact namespace restriction, applied before the filter.
    pub namespace: Option<&'a str>,
    /// Filter expression source; `None` keeps everything.
    pub filter: Option<&'a str>,
    /// Order-by expression source; `None` preserves insertion order.
    pub order_by: Option<&'a str>,
    /// 0-based pagination offset, default 0.
    pub offset: Option<usize>,
    /// Page size, default unlimited.
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct QueryResult<T> {
    pub items: Vec<Arc<T>>,
    /// Size of the filtered set, independent of offset/limit.
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub records: usize,
    pub index_entries: Vec<(String, usize)>,
}

pub struct Cache<T: Record> {
    specs: Vec<IndexSpec<T>>,
    primary: usize,
    inner: RwLock<Inner<T>>,
}

impl<T: Record> Cache<T> {
    /// Register the named indexes. Fails on a duplicate name or when no
    /// `id` index is supplied; the registry is immutable afterwards.
    pub fn new(specs: Vec<IndexSpec<T>>) -> Result<Self, CacheError> {
        let mut seen = FxHashSet::default();
        for spec in &specs {
            if !seen.insert(spec.name.clone()) {
                return Err(CacheError::IndexBuild {
                    index: spec.name.clone(),
                    reason: "duplicate index name".into(),
                });
            }
        }
        let primary = specs
            .iter()
            .position(|s| s.name == PRIMARY_INDEX)
            .ok_or_else(|| CacheError::IndexBuild {
                index: PRIMARY_INDEX.into(),
                reason: "primary index not registered".into(),
            })?;
        let indexes = specs.iter().map(|_| IndexState::default()).collect();
        Ok(Self {
            specs,
            primary,
            inner: RwLock::new(Inner { table: FxHashMap::default(), indexes, next_seq: 0 }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compute the primary key and every index's key set for one record,
    /// before any state is touched. `None` marks exclusion from an
    /// allow-missing index.
    fn derive_keys(&self, item: &T) -> Result<(String, Vec<Option<KeySet>>), CacheError> {
        let mut keys: Vec<Option<KeySet>> = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            match spec.indexer.index_keys(item) {
                Ok(ks) => keys.push(Some(ks)),
                Err(IndexError::Unsupported(_)) if spec.allow_missing => keys.push(None),
                Err(e) => {
                    return Err(CacheError::IndexBuild { index: spec.name.clone(), reason: e.to_string() })
                }
            }
        }
        let primary_keys = keys[self.primary].as_ref().ok_or_else(|| CacheError::IndexBuild {
            index: PRIMARY_INDEX.into(),
            reason: "primary index produced no key".into(),
        })?;
        if primary_keys.len() != 1 {
            return Err(CacheError::IndexBuild {
                index: PRIMARY_INDEX.into(),
                reason: format!("primary index produced {} keys", primary_keys.len()),
            });
        }
        Ok((primary_keys[0].clone(), keys))
    }

    /// Strict insert: a primary key already present rejects that item and
    /// leaves every index untouched for it. Accepted items commit fully.
    pub fn add<I>(&self, items: I) -> AddOutcome
    where
        I: IntoIterator<Item = T>,
    {
        self.insert_batch(items, false)
    }

    /// Insert-or-replace: an existing record's payload and index entries
    /// are superseded; its insertion sequence is retained.
    pub fn upsert<I>(&self, items: I) -> AddOutcome
    where
        I: IntoIterator<Item = T>,
    {
        self.insert_batch(items, true)
    }

    fn insert_batch<I>(&self, items: I, replace: bool) -> AddOutcome
    where
        I: IntoIterator<Item = T>,
    {
        let mut out = AddOutcome::default();
        let mut inner = self.write();
        for item in items {
            let (uid, keys) = match self.derive_keys(&item) {
                Ok(v) => v,
                Err(e) => {
                    out.rejected.push(e);
                    continue;
                }
            };
            let existing_seq = match inner.table.get(&uid) {
                Some(_) if !replace => {
                    out.rejected.push(CacheError::DuplicateKey { key: uid });
                    continue;
                }
                Some(row) => Some(row.seq),
                None => None,
            };
            if existing_seq.is_some() {
                Self::remove_entries(&mut inner, &uid);
            }
            let seq = existing_seq.unwrap_or_else(|| {
                let s = inner.next_seq;
                inner.next_seq += 1;
                s
            });
            Self::install(&mut inner, uid, Arc::new(item), keys, seq);
            out.accepted += 1;
        }
        self.publish_gauges(&inner);
        if !out.rejected.is_empty() {
            metrics::counter!("cache_add_rejected_total", out.rejected.len() as u64);
            warn!(accepted = out.accepted, rejected = out.rejected.len(), "batch insert partially rejected");
        } else {
            debug!(accepted = out.accepted, "batch insert committed");
        }
        out
    }

    fn install(inner: &mut Inner<T>, uid: String, item: Arc<T>, keys: Vec<Option<KeySet>>, seq: u64) {
        for (state, keyset) in inner.indexes.iter_mut().zip(keys) {
            if let Some(ks) = keyset {
                for k in ks.iter() {
                    state.entries.insert(k.clone(), uid.clone());
                }
                state.by_uid.insert(uid.clone(), ks);
            }
        }
        inner.table.insert(uid, Row { item, seq });
    }

    fn remove_entries(inner: &mut Inner<T>, uid: &str) {
        for state in inner.indexes.iter_mut() {
            if let Some(keys) = state.by_uid.remove(uid) {
                for k in keys.iter() {
                    state.entries.remove(k);
                }
            }
        }
    }

    /// Apply an in-place mutation to the record with the given primary
    /// key, then recompute all of its index entries. The mutation must
    /// not change the primary key.
    pub fn update<F>(&self, key: &str, mutate: F) -> Result<Arc<T>, CacheError>
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let mut inner = self.write();
        let row = inner
            .table
            .get(key)
            .ok_or_else(|| CacheError::NotFound { key: key.to_string() })?;
        let seq = row.seq;
        let mut item = (*row.item).clone();
        mutate(&mut item);
        let (new_key, keys) = self.derive_keys(&item)?;
        if new_key != key {
            return Err(CacheError::IndexBuild {
                index: PRIMARY_INDEX.into(),
                reason: "primary key changed by update".into(),
            });
        }
        Self::remove_entries(&mut inner, key);
        let item = Arc::new(item);
        Self::install(&mut inner, new_key, Arc::clone(&item), keys, seq);
        Ok(item)
    }

    /// Remove records and their index entries. An absent key is a no-op,
    /// not an error; the count of records actually removed is returned.
    pub fn delete<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut inner = self.write();
        let mut removed = 0usize;
        for key in keys {
            let key = key.as_ref();
            if inner.table.remove(key).is_some() {
                Self::remove_entries(&mut inner, key);
                removed += 1;
            }
        }
        self.publish_gauges(&inner);
        removed
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.read().table.get(key).map(|row| Arc::clone(&row.item))
    }

    pub fn len(&self) -> usize {
        self.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.read();
        CacheStats {
            records: inner.table.len(),
            index_entries: self
                .specs
                .iter()
                .zip(inner.indexes.iter())
                .map(|(spec, state)| (spec.name.clone(), state.entries.len()))
                .collect(),
        }
    }

    /// Filtered, ordered, paginated query over one index.
    pub fn query(&self, spec: QuerySpec<'_>) -> Result<QueryResult<T>, CacheError> {
        self.query_filtered(spec, |_| true)
    }

    /// `query` with an additional caller-supplied restriction evaluated
    /// before the filter expression (e.g. a kind check on a hierarchy
    /// subtree shared by several kinds).
    pub fn query_filtered<P>(&self, spec: QuerySpec<'_>, pre: P) -> Result<QueryResult<T>, CacheError>
    where
        P: Fn(&T) -> bool,
    {
        // Parse before taking the lock; a malformed expression is the
        // caller's error, reported without touching the data.
        let filter = spec.filter.map(Filter::parse).transpose()?;
        let order = spec.order_by.map(OrderBy::parse).transpose()?;
        let started = Instant::now();

        let inner = self.read();
        let idx = match spec.index {
            None => self.primary,
            Some(name) => self
                .specs
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| CacheError::UnknownIndex(name.to_string()))?,
        };
        let state = &inner.indexes[idx];

        // Narrow through the index, dedup records contributing several
        // keys under the same prefix.
        let mut seen: FxHashSet<&String> = FxHashSet::default();
        let mut rows: Vec<(&String, &Row<T>)> = Vec::new();
        match spec.prefix {
            Some(prefix) => {
                for (key, uid) in state.entries.range::<str, _>((Bound::Included(prefix), Bound::Unbounded)) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if let Some(row) = inner.table.get(uid) {
                        if seen.insert(uid) {
                            rows.push((uid, row));
                        }
                    }
                }
            }
            None => {
                for uid in state.by_uid.keys() {
                    if let Some(row) = inner.table.get(uid) {
                        if seen.insert(uid) {
                            rows.push((uid, row));
                        }
                    }
                }
            }
        }

        if let Some(ns) = spec.namespace {
            rows.retain(|(_, row)| row.item.namespace() == Some(ns));
        }
        rows.retain(|(_, row)| pre(&*row.item));

        // Decorate with the serialized tree only when an expression needs it.
        let needs_doc = filter.is_some() || order.is_some();
        let mut candidates: Vec<(&String, &Row<T>, Option<serde_json::Value>)> = Vec::with_capacity(rows.len());
        for (uid, row) in rows {
            let doc = if needs_doc {
                Some(
                    serde_json::to_value(&*row.item)
                        .map_err(|e| CacheError::Internal(format!("serializing record: {}", e)))?,
                )
            } else {
                None
            };
            candidates.push((uid, row, doc));
        }

        if let Some(f) = &filter {
            candidates.retain(|(_, _, doc)| doc.as_ref().map(|d| f.matches(d)).unwrap_or(false));
        }

        match &order {
            Some(ob) => candidates.sort_by(|a, b| {
                let (da, db) = (a.2.as_ref(), b.2.as_ref());
                match (da, db) {
                    (Some(da), Some(db)) => ob.compare(da, db).then_with(|| a.0.cmp(b.0)),
                    _ => a.0.cmp(b.0),
                }
            }),
            None => candidates.sort_by_key(|(_, row, _)| row.seq),
        }

        // Load-bearing ordering: total reflects the filtered set, the
        // slice below only the requested page.
        let total = candidates.len();
        let offset = spec.offset.unwrap_or(0);
        let limit = spec.limit.unwrap_or(usize::MAX);
        let items: Vec<Arc<T>> = candidates
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, row, _)| Arc::clone(&row.item))
            .collect();

        metrics::histogram!("query_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        metrics::histogram!("query_total", total as f64);
        Ok(QueryResult { items, total })
    }

    fn publish_gauges(&self, inner: &Inner<T>) {
        metrics::gauge!("cache_records", inner.table.len() as f64);
        let entries: usize = inner.indexes.iter().map(|s| s.entries.len()).sum();
        metrics::gauge!("cache_index_entries", entries as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury_core::{Kind, LinkRole, LinkSpec, Object, ObjectMeta, Spec};

    fn link(name: &str, ns: &str, con: &str, role: LinkRole) -> Object {
        let mut metadata = ObjectMeta::named(name, ns);
        metadata.uid = name.to_string();
        Object {
            kind: Kind::Link,
            metadata,
            spec: Spec::Link(LinkSpec {
                connection: con.into(),
                address_space: "space".into(),
                address: "orders".into(),
                role,
            }),
        }
    }

    #[test]
    fn init_rejects_duplicate_index_names() {
        let err = Cache::<Object>::new(vec![
            IndexSpec::new(PRIMARY_INDEX, Box::new(UidIndexer)),
            IndexSpec::new(PRIMARY_INDEX, Box::new(UidIndexer)),
        ])
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
        assert!(err.contains("duplicate index name"), "{err}");
    }

    #[test]
    fn init_requires_primary_index() {
        let err = Cache::<Object>::new(vec![IndexSpec::new("hierarchy", Box::new(UidIndexer))]);
        assert!(err.is_err());
    }

    #[test]
    fn add_rejects_duplicates_but_commits_the_rest() {
        let cache = hierarchy::standard_object_cache().unwrap();
        let out = cache.add(vec![
            link("a", "ns", "c1", LinkRole::Sender),
            link("a", "ns", "c1", LinkRole::Sender),
            link("b", "ns", "c1", LinkRole::Receiver),
        ]);
        assert_eq!(out.accepted, 2);
        assert_eq!(out.rejected.len(), 1);
        assert!(matches!(out.rejected[0], CacheError::DuplicateKey { .. }));
        assert_eq!(cache.len(), 2);
        // The rejected item corrupted no index: both survivors are scannable.
        let res = cache
            .query(QuerySpec { index: Some(hierarchy::HIERARCHY_INDEX), prefix: Some("Connection/ns/"), ..Default::default() })
            .unwrap();
        assert_eq!(res.total, 2);
    }

    #[test]
    fn strict_add_fails_without_required_index_key() {
        // The hierarchy index has no creator for AddressSpace here and is
        // not allow-missing, so the add must be rejected whole.
        let cache: Cache<Object> = Cache::new(vec![
            IndexSpec::new(PRIMARY_INDEX, Box::new(UidIndexer)),
            IndexSpec::new("links-only", Box::new(HierarchyIndexer::new(std::iter::empty()))),
        ])
        .unwrap();
        let out = cache.add(vec![link("a", "ns", "c1", LinkRole::Sender)]);
        assert_eq!(out.accepted, 0);
        assert!(matches!(out.rejected[0], CacheError::IndexBuild { .. }));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn allow_missing_excludes_instead_of_failing() {
        let cache: Cache<Object> = Cache::new(vec![
            IndexSpec::new(PRIMARY_INDEX, Box::new(UidIndexer)),
            IndexSpec::new("links-only", Box::new(HierarchyIndexer::new(std::iter::empty()))).allow_missing(),
        ])
        .unwrap();
        assert!(cache.add(vec![link("a", "ns", "c1", LinkRole::Sender)]).ok());
        assert_eq!(cache.stats().index_entries, vec![("id".to_string(), 1), ("links-only".to_string(), 0)]);
    }

    #[test]
    fn update_moves_index_entries() {
        let cache = hierarchy::standard_object_cache().unwrap();
        cache.add(vec![link("a", "ns", "c1", LinkRole::Sender)]).into_result().unwrap();
        cache
            .update("a", |o| {
                if let Spec::Link(s) = &mut o.spec {
                    s.connection = "c2".into();
                }
            })
            .unwrap();
        let under_c1 = cache
            .query(QuerySpec { index: Some(hierarchy::HIERARCHY_INDEX), prefix: Some("Connection/ns/space/c1/"), ..Default::default() })
            .unwrap();
        assert_eq!(under_c1.total, 0);
        let under_c2 = cache
            .query(QuerySpec { index: Some(hierarchy::HIERARCHY_INDEX), prefix: Some("Connection/ns/space/c2/"), ..Default::default() })
            .unwrap();
        assert_eq!(under_c2.total, 1);
    }

    #[test]
    fn update_absent_uid_is_not_found() {
        let cache = hierarchy::standard_object_cache().unwrap();
        let err = cache.update("missing", |_| {});
        assert!(matches!(err, Err(CacheError::NotFound { .. })));
    }

    #[test]
    fn delete_absent_uid_is_a_noop() {
        let cache = hierarchy::standard_object_cache().unwrap();
        cache.add(vec![link("a", "ns", "c1", LinkRole::Sender)]).into_result().unwrap();
        assert_eq!(cache.delete(["nope"]), 0);
        assert_eq!(cache.query(QuerySpec::default()).unwrap().total, 1);
        assert_eq!(cache.delete(["a", "a"]), 1);
        assert_eq!(cache.query(QuerySpec::default()).unwrap().total, 0);
    }

    #[test]
    fn upsert_replaces_payload_and_entries() {
        let cache = hierarchy::standard_object_cache().unwrap();
        cache.add(vec![link("a", "ns", "c1", LinkRole::Sender)]).into_result().unwrap();
        cache.upsert(vec![link("a", "ns", "c3", LinkRole::Receiver)]).into_result().unwrap();
        assert_eq!(cache.len(), 1);
        let got = cache.get("a").unwrap();
        assert_eq!(got.link_spec().unwrap().connection, "c3");
        let under_c1 = cache
            .query(QuerySpec { index: Some(hierarchy::HIERARCHY_INDEX), prefix: Some("Connection/ns/space/c1/"), ..Default::default() })
            .unwrap();
        assert_eq!(under_c1.total, 0);
    }

    #[test]
    fn malformed_filter_is_reported_not_silent() {
        let cache = hierarchy::standard_object_cache().unwrap();
        let err = cache.query(QuerySpec { filter: Some("`$.ObjectMeta.Name` ~ 'x'"), ..Default::default() });
        assert!(matches!(err, Err(CacheError::Expression(_))));
        let err = cache.query(QuerySpec { order_by: Some("`$.ObjectMeta.Name` SIDEWAYS"), ..Default::default() });
        assert!(matches!(err, Err(CacheError::Expression(_))));
    }

    #[test]
    fn unknown_index_is_reported() {
        let cache = hierarchy::standard_object_cache().unwrap();
        let err = cache.query(QuerySpec { index: Some("nope"), ..Default::default() });
        assert!(matches!(err, Err(CacheError::UnknownIndex(_))));
    }
}
