//! Control-plane watchers: list+watch of the CR-backed kinds
//! (address spaces and addresses), translated into cache events.

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use mercury_core::{AddressSpaceSpec, AddressSpec, Kind, Object, ObjectMeta, Spec};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::CacheEvent;

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn metadata_from(raw: &serde_json::Value) -> Result<ObjectMeta> {
    let meta = raw.get("metadata").ok_or_else(|| anyhow!("object missing metadata"))?;
    let name = meta
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing metadata.name"))?
        .to_string();
    let namespace = meta
        .get("namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let uid = meta
        .get("uid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing metadata.uid"))?
        .to_string();
    let resource_version = meta
        .get("resourceVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let creation_timestamp = meta
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    Ok(ObjectMeta { name, namespace, uid, resource_version, creation_timestamp })
}

/// Shape a CR into the envelope the cache stores. Only the CR-backed
/// kinds are supported here; connections and links come from the agents.
pub fn object_from_dynamic(kind: Kind, obj: &DynamicObject) -> Result<Object> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    let metadata = metadata_from(&raw)?;
    let spec_raw = raw.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let spec = match kind {
        Kind::AddressSpace => Spec::AddressSpace(AddressSpaceSpec {
            type_: str_field(&spec_raw, "type").unwrap_or_default(),
            plan: str_field(&spec_raw, "plan").unwrap_or_default(),
        }),
        Kind::Address => {
            // Address CR names follow the `<space>.<address>` convention;
            // spec.addressSpace wins when present.
            let address_space = str_field(&spec_raw, "addressSpace")
                .or_else(|| metadata.name.split('.').next().map(|s| s.to_string()))
                .unwrap_or_default();
            Spec::Address(AddressSpec {
                address_space,
                address: str_field(&spec_raw, "address").unwrap_or_else(|| metadata.name.clone()),
                type_: str_field(&spec_raw, "type").unwrap_or_default(),
                plan: str_field(&spec_raw, "plan").unwrap_or_default(),
            })
        }
        other => return Err(anyhow!("kind {} is not CR-backed", other)),
    };
    Ok(Object { kind, metadata, spec })
}

fn str_field(v: &serde_json::Value, field: &str) -> Option<String> {
    v.get(field).and_then(|f| f.as_str()).map(|s| s.to_string())
}

fn event_from(kind: Kind, obj: &DynamicObject, deleted: bool) -> Result<CacheEvent> {
    if deleted {
        let uid = obj
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| anyhow!("object missing metadata.uid"))?;
        Ok(CacheEvent::Deleted(uid.to_string()))
    } else {
        Ok(CacheEvent::Applied(object_from_dynamic(kind, obj)?))
    }
}

/// Start list+watch for one CR-backed kind and feed cache events into the
/// apply loop's channel. Runs until the stream ends or errors.
pub async fn start_watcher(
    kind: Kind,
    gvk_key: &str,
    namespace: Option<&str>,
    tx: mpsc::Sender<CacheEvent>,
) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %kind, gvk = %gvk_key, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let ev = event_from(kind, &o, false)?;
                let _ = tx.send(ev).await;
            }
            Event::Deleted(o) => {
                let ev = event_from(kind, &o, true)?;
                let _ = tx.send(ev).await;
            }
            Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                for o in list.iter() {
                    let ev = event_from(kind, o, false)?;
                    let _ = tx.send(ev).await;
                }
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn shapes_address_space_from_cr() {
        let o = dynamic(serde_json::json!({
            "apiVersion": "enmasse.io/v1beta1",
            "kind": "AddressSpace",
            "metadata": {"name": "space", "namespace": "ns", "uid": "u1", "resourceVersion": "5",
                          "creationTimestamp": "2020-01-01T00:00:00Z"},
            "spec": {"type": "standard", "plan": "standard-small"},
        }));
        let obj = object_from_dynamic(Kind::AddressSpace, &o).unwrap();
        assert_eq!(obj.kind, Kind::AddressSpace);
        assert_eq!(obj.metadata.uid, "u1");
        match &obj.spec {
            Spec::AddressSpace(s) => {
                assert_eq!(s.type_, "standard");
                assert_eq!(s.plan, "standard-small");
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn address_space_falls_back_to_name_prefix() {
        let o = dynamic(serde_json::json!({
            "apiVersion": "enmasse.io/v1beta1",
            "kind": "Address",
            "metadata": {"name": "space.orders", "namespace": "ns", "uid": "u2"},
            "spec": {"address": "orders", "type": "queue", "plan": "standard-small-queue"},
        }));
        let obj = object_from_dynamic(Kind::Address, &o).unwrap();
        match &obj.spec {
            Spec::Address(s) => {
                assert_eq!(s.address_space, "space");
                assert_eq!(s.address, "orders");
            }
            other => panic!("unexpected spec: {:?}", other),
        }
    }

    #[test]
    fn connection_kind_is_not_cr_backed() {
        let o = dynamic(serde_json::json!({
            "metadata": {"name": "host:1234", "namespace": "ns", "uid": "u3"},
        }));
        assert!(object_from_dynamic(Kind::Connection, &o).is_err());
    }
}
