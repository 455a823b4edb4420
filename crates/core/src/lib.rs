//! Mercury core types: the object envelope stored by the cache, metric
//! samples, and the errors shared across the workspace.
//!
//! Serialized field names are a boundary contract: the filter/order
//! expression language references fields by serialized name, e.g.
//! `` `$.ObjectMeta.Name` `` or `` `$.Spec.Role` ``.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Uid = String;

/// Object kinds fed into the cache by the watch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    AddressSpace,
    Address,
    Connection,
    Link,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::AddressSpace => "AddressSpace",
            Kind::Address => "Address",
            Kind::Connection => "Connection",
            Kind::Link => "Link",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard object metadata. UID is the sole primary key of the object
/// table and is immutable once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "UID")]
    pub uid: Uid,
    #[serde(rename = "ResourceVersion")]
    pub resource_version: String,
    #[serde(rename = "CreationTimestamp")]
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    /// Metadata with a fresh v4 UID and the current time as creation stamp.
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            resource_version: "1".to_string(),
            creation_timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Sender,
    Receiver,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Sender => f.write_str("sender"),
            LinkRole::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AddressSpaceSpec {
    #[serde(rename = "Type")]
    pub type_: String,
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AddressSpec {
    pub address_space: String,
    pub address: String,
    #[serde(rename = "Type")]
    pub type_: String,
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ConnectionSpec {
    pub address_space: String,
    pub hostname: String,
    pub container_id: String,
    pub protocol: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LinkSpec {
    pub connection: String,
    pub address_space: String,
    pub address: String,
    pub role: LinkRole,
}

/// Kind-specific payload. Serialized untagged so spec fields sit directly
/// under `$.Spec` (e.g. `$.Spec.Role`). Variants are ordered widest-first
/// and the payloads deny unknown fields, which keeps untagged
/// deserialization unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Spec {
    Link(LinkSpec),
    Connection(ConnectionSpec),
    Address(AddressSpec),
    AddressSpace(AddressSpaceSpec),
}

/// Envelope for every stored object: kind tag, metadata, kind-specific spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    #[serde(rename = "Kind")]
    pub kind: Kind,
    #[serde(rename = "ObjectMeta")]
    pub metadata: ObjectMeta,
    #[serde(rename = "Spec")]
    pub spec: Spec,
}

impl Object {
    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Spec accessor used by index key derivation; `None` when the envelope
    /// kind and the payload variant disagree.
    pub fn link_spec(&self) -> Option<&LinkSpec> {
        match &self.spec {
            Spec::Link(s) => Some(s),
            _ => None,
        }
    }

    pub fn connection_spec(&self) -> Option<&ConnectionSpec> {
        match &self.spec {
            Spec::Connection(s) => Some(s),
            _ => None,
        }
    }

    pub fn address_spec(&self) -> Option<&AddressSpec> {
        match &self.spec {
            Spec::Address(s) => Some(s),
            _ => None,
        }
    }
}

// ---- Metrics ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Counter,
}

/// A single named, typed, timestamped sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricValue {
    pub name: String,
    #[serde(rename = "Type")]
    pub metric_type: MetricType,
    pub value: f64,
    pub units: String,
    pub timestamp: DateTime<Utc>,
}

impl MetricValue {
    pub fn gauge(name: impl Into<String>, value: f64, units: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { name: name.into(), metric_type: MetricType::Gauge, value, units: units.into(), timestamp }
    }

    pub fn counter(name: impl Into<String>, value: f64, units: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { name: name.into(), metric_type: MetricType::Counter, value, units: units.into(), timestamp }
    }
}

/// A metric sample attached to an object identity. The composite
/// (Kind, Namespace, AddressSpace, Name, MetricName) is the primary key in
/// the metric cache; repeated ingestion for the same composite supersedes
/// the previous sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metric {
    pub kind: Kind,
    pub namespace: String,
    pub address_space: String,
    pub name: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn composite_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.kind, self.namespace, self.address_space, self.name, self.value.name
        )
    }

    /// Prefix selecting every metric stored for one object identity.
    pub fn key_prefix(kind: Kind, namespace: &str, address_space: &str, name: &str) -> String {
        format!("{}/{}/{}/{}/", kind, namespace, address_space, name)
    }
}

/// Capability the generic cache needs from a stored record. The primary
/// key itself comes from the cache's `id` index, not from this trait.
pub trait Record: Serialize + Send + Sync + 'static {
    fn namespace(&self) -> Option<&str>;
}

impl Record for Object {
    fn namespace(&self) -> Option<&str> {
        Some(&self.metadata.namespace)
    }
}

impl Record for Metric {
    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }
}

pub mod prelude {
    pub use super::{
        Kind, LinkRole, Metric, MetricType, MetricValue, Object, ObjectMeta, Record, Spec, Uid,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(role: LinkRole) -> Object {
        Object {
            kind: Kind::Link,
            metadata: ObjectMeta::named("l1", "ns"),
            spec: Spec::Link(LinkSpec {
                connection: "host:1234".into(),
                address_space: "space".into(),
                address: "orders".into(),
                role,
            }),
        }
    }

    #[test]
    fn envelope_serializes_contract_paths() {
        let o = link(LinkRole::Sender);
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["Kind"], "Link");
        assert_eq!(v["ObjectMeta"]["Name"], "l1");
        assert_eq!(v["ObjectMeta"]["Namespace"], "ns");
        assert!(v["ObjectMeta"]["UID"].is_string());
        assert_eq!(v["Spec"]["Role"], "sender");
        assert_eq!(v["Spec"]["Connection"], "host:1234");
    }

    #[test]
    fn untagged_spec_round_trips_each_kind() {
        let conn = Spec::Connection(ConnectionSpec {
            address_space: "space".into(),
            hostname: "host:1234".into(),
            container_id: "c1".into(),
            protocol: "amqp".into(),
            encrypted: false,
        });
        let v = serde_json::to_value(&conn).unwrap();
        let back: Spec = serde_json::from_value(v).unwrap();
        assert_eq!(back, conn);

        let space = Spec::AddressSpace(AddressSpaceSpec { type_: "standard".into(), plan: "small".into() });
        let v = serde_json::to_value(&space).unwrap();
        let back: Spec = serde_json::from_value(v).unwrap();
        assert_eq!(back, space);
    }

    #[test]
    fn metric_composite_key_shape() {
        let m = Metric {
            kind: Kind::Connection,
            namespace: "ns".into(),
            address_space: "space".into(),
            name: "host:1234".into(),
            value: MetricValue::gauge("enmasse_messages_in", 10.0, "", Utc::now()),
        };
        assert_eq!(m.composite_key(), "Connection/ns/space/host:1234/enmasse_messages_in");
        assert!(m
            .composite_key()
            .starts_with(&Metric::key_prefix(Kind::Connection, "ns", "space", "host:1234")));
    }
}
