use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{Outbound, ServerMessage};

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Live connection handle. Owned exclusively by the registry; created on
/// admission, heartbeat-refreshed by `touch`, destroyed on disconnect or
/// eviction.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub tenant_id: String,
    pub connector_id: Option<String>,
    pub session_id: Option<String>,
    pub tx: OutboundSender,
    pub last_heartbeat: Instant,
}

/// Outcome of a best-effort multicast: how many peers were reached, and the
/// handles evicted because their channel was dead.
#[derive(Debug)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: Vec<ConnectionHandle>,
}

/// The only shared mutable state in the coordinator: the map of live
/// connections, keyed by connection id. All operations are safe under
/// concurrent access from connection tasks and the sweeper; operations on
/// unknown ids are silent no-ops.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, handle: ConnectionHandle) {
        debug!(
            "admitted connection {} for tenant {}",
            handle.connection_id, handle.tenant_id
        );
        self.connections.insert(handle.connection_id.clone(), handle);
    }

    /// Refresh the heartbeat timestamp. Unknown id: the connection was
    /// already evicted, nothing to do.
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Remove a connection, returning its handle so the caller can finalize
    /// the attached session. Dropping the handle's sender closes the
    /// connection's writer task.
    pub fn remove(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections.remove(connection_id).map(|(_, handle)| handle)
    }

    pub fn session_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.session_id.clone())
    }

    /// Snapshot of the tenant's live connections, optionally excluding one.
    pub fn for_tenant(&self, tenant_id: &str, excluding: Option<&str>) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter(|entry| excluding != Some(entry.connection_id.as_str()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Connection ids whose heartbeat is older than the threshold.
    pub fn stale(&self, threshold: Duration) -> Vec<String> {
        self.connections
            .iter()
            .filter(|entry| entry.last_heartbeat.elapsed() > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Best-effort multicast to the tenant's live connections. A failed send
    /// means the peer's writer task is gone; that one connection is evicted
    /// and delivery to the remaining peers continues.
    pub fn broadcast(
        &self,
        tenant_id: &str,
        message: ServerMessage,
        excluding: Option<&str>,
    ) -> Delivery {
        let out = Outbound::now(message);
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for peer in self.for_tenant(tenant_id, excluding) {
            if peer.tx.send(out.clone()).is_ok() {
                delivered += 1;
            } else if let Some(handle) = self.remove(&peer.connection_id) {
                warn!(
                    "evicting connection {} (tenant {}): delivery failed",
                    handle.connection_id, handle.tenant_id
                );
                evicted.push(handle);
            }
        }
        Delivery { delivered, evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::generate_connection_id;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn handle(tenant: &str) -> (ConnectionHandle, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            connection_id: generate_connection_id(),
            tenant_id: tenant.to_string(),
            connector_id: None,
            session_id: None,
            tx,
            last_heartbeat: Instant::now(),
        };
        (handle, rx)
    }

    #[test]
    fn operations_on_unknown_ids_are_no_ops() {
        let registry = ConnectionRegistry::new();
        registry.touch("nope");
        assert!(registry.remove("nope").is_none());
        assert!(registry.session_of("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn for_tenant_filters_by_tenant_and_excludes_originator() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle("acme");
        let (b, _rx_b) = handle("acme");
        let (c, _rx_c) = handle("globex");
        let a_id = a.connection_id.clone();
        registry.admit(a);
        registry.admit(b);
        registry.admit(c);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.for_tenant("acme", None).len(), 2);
        let peers = registry.for_tenant("acme", Some(&a_id));
        assert_eq!(peers.len(), 1);
        assert_ne!(peers[0].connection_id, a_id);
        assert!(registry.for_tenant("initech", None).is_empty());
    }

    #[test]
    fn broadcast_never_crosses_tenants() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = handle("acme");
        let (c, mut rx_c) = handle("globex");
        registry.admit(a);
        registry.admit(c);

        let delivery = registry.broadcast(
            "acme",
            ServerMessage::HeartbeatAck,
            None,
        );
        assert_eq!(delivery.delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn broadcast_evicts_dead_peers_and_reaches_the_rest() {
        let registry = ConnectionRegistry::new();
        let (a, rx_a) = handle("acme");
        let (b, mut rx_b) = handle("acme");
        registry.admit(a);
        registry.admit(b);
        drop(rx_a); // a's writer task is gone

        let delivery = registry.broadcast("acme", ServerMessage::HeartbeatAck, None);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(delivery.evicted.len(), 1);
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_connections_are_reported_after_threshold() {
        let registry = ConnectionRegistry::new();
        let (mut old, _rx_old) = handle("acme");
        old.last_heartbeat = Instant::now()
            .checked_sub(Duration::from_secs(600))
            .expect("clock supports backdating");
        let old_id = old.connection_id.clone();
        let (fresh, _rx_fresh) = handle("acme");
        registry.admit(old);
        registry.admit(fresh);

        let stale = registry.stale(Duration::from_secs(300));
        assert_eq!(stale, vec![old_id.clone()]);

        registry.touch(&old_id);
        assert!(registry.stale(Duration::from_secs(300)).is_empty());
    }
}
