//! Mercury public API facade (in-process).
//!
//! This is the surface the resolver/adapter layer programs against:
//! per-kind filtered/ordered/paginated queries, hierarchy-scoped child
//! queries, and the metric merge combining stored samples with counts
//! synthesized from current index membership.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use mercury_cache::hierarchy::{
    self, address_key, connection_key, standard_metric_cache, standard_object_cache,
    ADDRESS_LINK_INDEX, HIERARCHY_INDEX,
};
use mercury_cache::{CacheError, MetricCache, ObjectCache, QuerySpec};
use mercury_core::{Kind, LinkRole, Metric, MetricType, MetricValue, Object};
use tracing::info;

pub use mercury_cache::QueryResult;

/// API errors suitable for transport to the resolver layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

fn map_err(e: CacheError) -> ApiError {
    match e {
        CacheError::Expression(e) => ApiError::Validation(e.to_string()),
        CacheError::NotFound { key } => ApiError::NotFound(key),
        other => ApiError::Internal(other.to_string()),
    }
}

/// In-process console API over the object and metric caches.
pub struct ConsoleApi {
    objects: Arc<ObjectCache>,
    metrics: Arc<MetricCache>,
}

impl ConsoleApi {
    pub fn new(objects: Arc<ObjectCache>, metrics: Arc<MetricCache>) -> Self {
        Self { objects, metrics }
    }

    /// Facade over freshly wired standard caches; the watch layer feeds
    /// the returned handles.
    pub fn with_standard_caches() -> ApiResult<Self> {
        let objects = Arc::new(standard_object_cache().map_err(map_err)?);
        let metrics = Arc::new(standard_metric_cache().map_err(map_err)?);
        Ok(Self::new(objects, metrics))
    }

    pub fn objects(&self) -> Arc<ObjectCache> {
        Arc::clone(&self.objects)
    }

    pub fn metric_cache(&self) -> Arc<MetricCache> {
        Arc::clone(&self.metrics)
    }

    pub fn address_spaces(
        &self,
        namespace: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        self.kind_query(Kind::AddressSpace, namespace, offset, limit, filter, order_by)
    }

    pub fn addresses(
        &self,
        namespace: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        self.kind_query(Kind::Address, namespace, offset, limit, filter, order_by)
    }

    pub fn connections(
        &self,
        namespace: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        self.kind_query(Kind::Connection, namespace, offset, limit, filter, order_by)
    }

    pub fn links(
        &self,
        namespace: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        self.kind_query(Kind::Link, namespace, offset, limit, filter, order_by)
    }

    /// Links attached to one connection, then the usual
    /// filter/order/paginate pipeline.
    pub fn connection_links(
        &self,
        connection: &Object,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        let key = connection_key(connection).map_err(|e| ApiError::Validation(e.to_string()))?;
        self.children_query(HIERARCHY_INDEX, &key, offset, limit, filter, order_by)
    }

    /// Links serving one address, via the dedicated address-link index.
    pub fn address_links(
        &self,
        address: &Object,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        let key = address_key(address).map_err(|e| ApiError::Validation(e.to_string()))?;
        self.children_query(ADDRESS_LINK_INDEX, &key, offset, limit, filter, order_by)
    }

    fn kind_query(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        let t0 = Instant::now();
        let prefix = hierarchy::kind_prefix(kind, namespace);
        let res = self
            .objects
            .query_filtered(
                QuerySpec {
                    index: Some(HIERARCHY_INDEX),
                    prefix: Some(&prefix),
                    filter,
                    order_by,
                    offset,
                    limit,
                    ..Default::default()
                },
                |o: &Object| o.kind == kind,
            )
            .map_err(map_err)?;
        info!(kind = %kind, ns = %namespace.unwrap_or("(all)"), total = res.total, took_ms = %t0.elapsed().as_millis(), "api: query");
        Ok(res)
    }

    fn children_query(
        &self,
        index: &str,
        parent_key: &str,
        offset: Option<usize>,
        limit: Option<usize>,
        filter: Option<&str>,
        order_by: Option<&str>,
    ) -> ApiResult<QueryResult<Object>> {
        let t0 = Instant::now();
        let prefix = format!("{}/", parent_key);
        let res = self
            .objects
            .query_filtered(
                QuerySpec {
                    index: Some(index),
                    prefix: Some(&prefix),
                    filter,
                    order_by,
                    offset,
                    limit,
                    ..Default::default()
                },
                |o: &Object| o.kind == Kind::Link,
            )
            .map_err(map_err)?;
        info!(parent = %parent_key, total = res.total, took_ms = %t0.elapsed().as_millis(), "api: children query");
        Ok(res)
    }

    /// All metrics for one object: samples stored for its identity plus
    /// metrics synthesized from its links at query time (sender/receiver
    /// counts, and sums of counter-typed link samples). A synthesized
    /// metric supersedes a stored one of the same name.
    pub fn metrics_for(&self, obj: &Object) -> ApiResult<Vec<Metric>> {
        let address_space = address_space_of(obj).to_string();
        let prefix = Metric::key_prefix(obj.kind, &obj.metadata.namespace, &address_space, &obj.metadata.name);
        let stored = self
            .metrics
            .query(QuerySpec { prefix: Some(&prefix), ..Default::default() })
            .map_err(map_err)?;

        let mut merged: BTreeMap<String, Metric> = BTreeMap::new();
        for m in stored.items {
            merged.insert(m.value.name.clone(), (*m).clone());
        }

        let children = match obj.kind {
            Kind::Connection => Some(self.connection_links(obj, None, None, None, None)?),
            Kind::Address => Some(self.address_links(obj, None, None, None, None)?),
            _ => None,
        };
        if let Some(children) = children {
            for m in self.synthesize(obj, &address_space, &children.items)? {
                merged.insert(m.value.name.clone(), m);
            }
        }

        Ok(merged.into_values().collect())
    }

    fn synthesize(&self, obj: &Object, address_space: &str, links: &[Arc<Object>]) -> ApiResult<Vec<Metric>> {
        let now = chrono::Utc::now();
        let mut out = Vec::new();
        let count = |role: LinkRole| {
            links
                .iter()
                .filter(|l| l.link_spec().map(|s| s.role == role).unwrap_or(false))
                .count() as f64
        };
        let gauge = |name: &str, value: f64| Metric {
            kind: obj.kind,
            namespace: obj.metadata.namespace.clone(),
            address_space: address_space.to_string(),
            name: obj.metadata.name.clone(),
            value: MetricValue::gauge(name, value, "", now),
        };
        out.push(gauge("enmasse_senders", count(LinkRole::Sender)));
        out.push(gauge("enmasse_receivers", count(LinkRole::Receiver)));

        // Roll up counter-typed link samples by metric name.
        let mut sums: BTreeMap<String, (f64, String)> = BTreeMap::new();
        for link in links {
            let prefix = Metric::key_prefix(Kind::Link, &link.metadata.namespace, address_space, &link.metadata.name);
            let samples = self
                .metrics
                .query(QuerySpec { prefix: Some(&prefix), ..Default::default() })
                .map_err(map_err)?;
            for s in samples.items {
                if s.value.metric_type == MetricType::Counter {
                    let entry = sums.entry(s.value.name.clone()).or_insert((0.0, s.value.units.clone()));
                    entry.0 += s.value.value;
                }
            }
        }
        for (name, (value, units)) in sums {
            out.push(Metric {
                kind: obj.kind,
                namespace: obj.metadata.namespace.clone(),
                address_space: address_space.to_string(),
                name: obj.metadata.name.clone(),
                value: MetricValue::counter(name, value, units, now),
            });
        }
        Ok(out)
    }
}

fn address_space_of(obj: &Object) -> &str {
    match &obj.spec {
        mercury_core::Spec::Connection(s) => &s.address_space,
        mercury_core::Spec::Address(s) => &s.address_space,
        mercury_core::Spec::Link(s) => &s.address_space,
        // An address space is its own scope.
        mercury_core::Spec::AddressSpace(_) => &obj.metadata.name,
    }
}
