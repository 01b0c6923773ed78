//! Per-workspace WebSocket fan-out. Each live connection registers a bounded
//! sender; a broadcast serializes the event once and pushes the shared string
//! to every connection. A connection that cannot keep up (full queue or
//! dropped receiver) is removed rather than allowed to stall the rest.

use courier_api::RealtimeEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

const CONNECTION_QUEUE_DEPTH: usize = 64;

/// Hubs come into existence on first use and live for the process lifetime.
/// Workspace counts are small (one per tenant), so no eviction.
#[derive(Default)]
pub struct HubRegistry {
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn workspace(&self, workspace_id: &str) -> Arc<Hub> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(workspace_id) {
                return Arc::clone(hub);
            }
        }

        let mut hubs = self.hubs.write().await;
        Arc::clone(
            hubs.entry(workspace_id.to_owned())
                .or_insert_with(|| Arc::new(Hub::new())),
        )
    }

    /// Broadcast without touching workspaces that have never connected.
    pub async fn broadcast(&self, workspace_id: &str, event: &RealtimeEvent) {
        let hub = {
            let hubs = self.hubs.read().await;
            hubs.get(workspace_id).map(Arc::clone)
        };
        if let Some(hub) = hub {
            hub.broadcast(event).await;
        }
    }
}

pub struct Hub {
    connections: RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl Hub {
    fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn connect(&self) -> (u64, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        self.connections.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn disconnect(&self, id: u64) {
        self.connections.write().await.remove(&id);
    }

    pub async fn broadcast(&self, event: &RealtimeEvent) {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize realtime event");
                return;
            }
        };

        let mut stale = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, tx) in connections.iter() {
                if tx.try_send(Arc::clone(&payload)).is_err() {
                    stale.push(*id);
                }
            }
        }

        if !stale.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &stale {
                connections.remove(id);
            }
            tracing::debug!(dropped = stale.len(), "dropped stalled ws connections");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
