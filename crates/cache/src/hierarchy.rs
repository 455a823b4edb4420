//! Hierarchy key derivation for the console object kinds, and the
//! standard cache wiring used by the API facade and the watch layer.
//!
//! Key shapes:
//! - `AddressSpace/{ns}/{name}`
//! - `AddressSpace/{ns}/{space}/Address/{uid}`
//! - `Connection/{ns}/{space}/{name}`
//! - `Connection/{ns}/{space}/{connection}/Link/{uid}`
//! - `Address/{ns}/{space}/{address}/Link/{uid}` (address-link index only)
//!
//! A child's key is its parent's own key plus a `/`-separated tail ending
//! in the child's UID, so one entry both positions the child and lets a
//! parent enumerate it by prefix.

use mercury_core::{Kind, Metric, Object};
use smallvec::smallvec;

use crate::error::{CacheError, IndexError};
use crate::index::{HierarchyIndexer, HierarchyKeyFn, IndexSpec, KeySet, MetricIndexer, UidIndexer};
use crate::{Cache, PRIMARY_INDEX};

pub const HIERARCHY_INDEX: &str = "hierarchy";
pub const ADDRESS_LINK_INDEX: &str = "addressLinkHierarchy";

pub type ObjectCache = Cache<Object>;
pub type MetricCache = Cache<Metric>;

/// Parent key of a connection, used both as its hierarchy entry and as
/// the prefix scanning its links.
pub fn connection_key(o: &Object) -> Result<String, IndexError> {
    let spec = o
        .connection_spec()
        .ok_or_else(|| IndexError::Malformed(format!("{} is not a connection", o.metadata.name)))?;
    Ok(format!(
        "Connection/{}/{}/{}",
        o.metadata.namespace, spec.address_space, o.metadata.name
    ))
}

/// Parent key of an address in the address-link index.
pub fn address_key(o: &Object) -> Result<String, IndexError> {
    let spec = o
        .address_spec()
        .ok_or_else(|| IndexError::Malformed(format!("{} is not an address", o.metadata.name)))?;
    Ok(format!(
        "Address/{}/{}/{}",
        o.metadata.namespace, spec.address_space, spec.address
    ))
}

fn address_space_hierarchy(o: &Object) -> Result<KeySet, IndexError> {
    Ok(smallvec![format!("AddressSpace/{}/{}", o.metadata.namespace, o.metadata.name)])
}

fn address_hierarchy(o: &Object) -> Result<KeySet, IndexError> {
    let spec = o
        .address_spec()
        .ok_or_else(|| IndexError::Malformed(format!("{} is not an address", o.metadata.name)))?;
    Ok(smallvec![format!(
        "AddressSpace/{}/{}/Address/{}",
        o.metadata.namespace, spec.address_space, o.metadata.uid
    )])
}

fn connection_hierarchy(o: &Object) -> Result<KeySet, IndexError> {
    Ok(smallvec![connection_key(o)?])
}

fn connection_link_hierarchy(o: &Object) -> Result<KeySet, IndexError> {
    let spec = o
        .link_spec()
        .ok_or_else(|| IndexError::Malformed(format!("{} is not a link", o.metadata.name)))?;
    Ok(smallvec![format!(
        "Connection/{}/{}/{}/Link/{}",
        o.metadata.namespace, spec.address_space, spec.connection, o.metadata.uid
    )])
}

fn address_link_hierarchy(o: &Object) -> Result<KeySet, IndexError> {
    let spec = o
        .link_spec()
        .ok_or_else(|| IndexError::Malformed(format!("{} is not a link", o.metadata.name)))?;
    Ok(smallvec![format!(
        "Address/{}/{}/{}/Link/{}",
        o.metadata.namespace, spec.address_space, spec.address, o.metadata.uid
    )])
}

/// Hierarchy scan prefix for a whole kind, optionally narrowed to one
/// namespace. Kinds sharing a subtree (links under connections, addresses
/// under address spaces) need a kind restriction on top of the prefix.
pub fn kind_prefix(kind: Kind, namespace: Option<&str>) -> String {
    let base = match kind {
        Kind::AddressSpace | Kind::Address => "AddressSpace/",
        Kind::Connection | Kind::Link => "Connection/",
    };
    match namespace {
        Some(ns) => format!("{}{}/", base, ns),
        None => base.to_string(),
    }
}

/// The object cache wiring the console uses: UID primary index, one
/// hierarchy index covering every kind, and the address-link hierarchy
/// restricted to links (allow-missing, so other kinds are excluded
/// rather than rejected).
pub fn standard_object_cache() -> Result<ObjectCache, CacheError> {
    Cache::new(vec![
        IndexSpec::new(PRIMARY_INDEX, Box::new(UidIndexer)),
        IndexSpec::new(
            HIERARCHY_INDEX,
            Box::new(HierarchyIndexer::new([
                (Kind::AddressSpace, address_space_hierarchy as HierarchyKeyFn),
                (Kind::Address, address_hierarchy as HierarchyKeyFn),
                (Kind::Connection, connection_hierarchy as HierarchyKeyFn),
                (Kind::Link, connection_link_hierarchy as HierarchyKeyFn),
            ])),
        ),
        IndexSpec::new(
            ADDRESS_LINK_INDEX,
            Box::new(HierarchyIndexer::new([(Kind::Link, address_link_hierarchy as HierarchyKeyFn)])),
        )
        .allow_missing(),
    ])
}

pub fn standard_metric_cache() -> Result<MetricCache, CacheError> {
    Cache::new(vec![IndexSpec::new(PRIMARY_INDEX, Box::new(MetricIndexer))])
}
