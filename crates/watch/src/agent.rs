//! Agent event ingest: connections, links and their metric samples as
//! reported by the messaging infrastructure. The agent stream is the
//! authority for these kinds; the control plane never materializes them.

use std::sync::Arc;

use anyhow::Result;
use mercury_cache::hierarchy::{connection_key, HIERARCHY_INDEX};
use mercury_cache::{MetricCache, ObjectCache, QuerySpec};
use mercury_core::{
    ConnectionSpec, Kind, LinkRole, LinkSpec, Metric, Object, ObjectMeta, Spec, Uid,
};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    ConnectionOpened {
        namespace: String,
        address_space: String,
        hostname: String,
        container_id: String,
        protocol: String,
        encrypted: bool,
    },
    ConnectionClosed {
        namespace: String,
        address_space: String,
        hostname: String,
    },
    LinkAttached {
        namespace: String,
        address_space: String,
        connection: String,
        address: String,
        role: LinkRole,
    },
    LinkDetached {
        uid: Uid,
    },
    Metrics(Vec<Metric>),
}

/// Translates agent events into cache mutations. Connections key by
/// (namespace, address space, hostname); links get minted UIDs the caller
/// can hold on to for detach.
pub struct AgentIngest {
    objects: Arc<ObjectCache>,
    metrics: Arc<MetricCache>,
    connections: FxHashMap<(String, String, String), Uid>,
}

impl AgentIngest {
    pub fn new(objects: Arc<ObjectCache>, metrics: Arc<MetricCache>) -> Self {
        Self { objects, metrics, connections: FxHashMap::default() }
    }

    /// Apply one event. Returns the UID minted for opened connections and
    /// attached links so callers can address them later.
    pub fn apply(&mut self, event: AgentEvent) -> Result<Option<Uid>> {
        match event {
            AgentEvent::ConnectionOpened {
                namespace,
                address_space,
                hostname,
                container_id,
                protocol,
                encrypted,
            } => {
                let metadata = ObjectMeta::named(hostname.clone(), namespace.clone());
                let uid = metadata.uid.clone();
                let obj = Object {
                    kind: Kind::Connection,
                    metadata,
                    spec: Spec::Connection(ConnectionSpec {
                        address_space: address_space.clone(),
                        hostname: hostname.clone(),
                        container_id,
                        protocol,
                        encrypted,
                    }),
                };
                self.objects.add(vec![obj]).into_result()?;
                self.connections.insert((namespace, address_space, hostname), uid.clone());
                Ok(Some(uid))
            }
            AgentEvent::ConnectionClosed { namespace, address_space, hostname } => {
                let Some(uid) = self.connections.remove(&(namespace.clone(), address_space.clone(), hostname.clone()))
                else {
                    debug!(ns = %namespace, hostname = %hostname, "close for unknown connection ignored");
                    return Ok(None);
                };
                // Links die with their connection.
                if let Some(conn) = self.objects.get(&uid) {
                    let prefix = format!("{}/", connection_key(&conn)?);
                    let children = self.objects.query(QuerySpec {
                        index: Some(HIERARCHY_INDEX),
                        prefix: Some(&prefix),
                        ..Default::default()
                    })?;
                    let link_uids: Vec<String> =
                        children.items.iter().map(|l| l.metadata.uid.clone()).collect();
                    self.objects.delete(link_uids);
                }
                self.objects.delete([uid.as_str()]);
                info!(ns = %namespace, hostname = %hostname, "connection closed");
                Ok(None)
            }
            AgentEvent::LinkAttached { namespace, address_space, connection, address, role } => {
                let link_id = uuid::Uuid::new_v4().to_string();
                let mut metadata = ObjectMeta::named(link_id.clone(), namespace);
                metadata.uid = link_id.clone();
                let obj = Object {
                    kind: Kind::Link,
                    metadata,
                    spec: Spec::Link(LinkSpec { connection, address_space, address, role }),
                };
                self.objects.add(vec![obj]).into_result()?;
                Ok(Some(link_id))
            }
            AgentEvent::LinkDetached { uid } => {
                self.objects.delete([uid.as_str()]);
                Ok(None)
            }
            AgentEvent::Metrics(samples) => {
                // Last write wins per composite key.
                let out = self.metrics.upsert(samples);
                for e in &out.rejected {
                    warn!(error = %e, "metric sample rejected");
                }
                Ok(None)
            }
        }
    }
}

/// Drive an ingest from a channel until the sender side closes.
pub fn spawn_agent(mut rx: mpsc::Receiver<AgentEvent>, mut ingest: AgentIngest) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            if let Err(e) = ingest.apply(ev) {
                warn!(error = %e, "agent event rejected");
            }
        }
        info!("agent ingest stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mercury_cache::hierarchy::{standard_metric_cache, standard_object_cache};
    use mercury_core::MetricValue;

    fn ingest() -> AgentIngest {
        AgentIngest::new(
            Arc::new(standard_object_cache().unwrap()),
            Arc::new(standard_metric_cache().unwrap()),
        )
    }

    fn opened(hostname: &str) -> AgentEvent {
        AgentEvent::ConnectionOpened {
            namespace: "ns".into(),
            address_space: "space".into(),
            hostname: hostname.into(),
            container_id: "c1".into(),
            protocol: "amqp".into(),
            encrypted: true,
        }
    }

    fn attached(connection: &str, role: LinkRole) -> AgentEvent {
        AgentEvent::LinkAttached {
            namespace: "ns".into(),
            address_space: "space".into(),
            connection: connection.into(),
            address: "orders".into(),
            role,
        }
    }

    #[test]
    fn connection_close_cascades_to_links() {
        let mut ing = ingest();
        ing.apply(opened("host:1234")).unwrap();
        ing.apply(attached("host:1234", LinkRole::Sender)).unwrap();
        ing.apply(attached("host:1234", LinkRole::Receiver)).unwrap();
        assert_eq!(ing.objects.len(), 3);

        ing.apply(AgentEvent::ConnectionClosed {
            namespace: "ns".into(),
            address_space: "space".into(),
            hostname: "host:1234".into(),
        })
        .unwrap();
        assert_eq!(ing.objects.len(), 0);
    }

    #[test]
    fn close_of_unknown_connection_is_a_noop() {
        let mut ing = ingest();
        ing.apply(AgentEvent::ConnectionClosed {
            namespace: "ns".into(),
            address_space: "space".into(),
            hostname: "ghost".into(),
        })
        .unwrap();
        assert_eq!(ing.objects.len(), 0);
    }

    #[test]
    fn link_detach_removes_one_link() {
        let mut ing = ingest();
        ing.apply(opened("host:1234")).unwrap();
        let uid = ing.apply(attached("host:1234", LinkRole::Sender)).unwrap().unwrap();
        ing.apply(AgentEvent::LinkDetached { uid }).unwrap();
        assert_eq!(ing.objects.len(), 1);
    }

    #[test]
    fn metric_samples_supersede_per_composite_key() {
        let mut ing = ingest();
        let sample = |v: f64| Metric {
            kind: Kind::Connection,
            namespace: "ns".into(),
            address_space: "space".into(),
            name: "host:1234".into(),
            value: MetricValue::gauge("enmasse_messages_in", v, "", Utc::now()),
        };
        ing.apply(AgentEvent::Metrics(vec![sample(10.0)])).unwrap();
        ing.apply(AgentEvent::Metrics(vec![sample(12.0)])).unwrap();
        assert_eq!(ing.metrics.len(), 1);
        let got = ing.metrics.get("Connection/ns/space/host:1234/enmasse_messages_in").unwrap();
        assert_eq!(got.value.value, 12.0);
    }
}
