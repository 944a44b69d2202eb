//! Node Registry
//!
//! Owns the set of connected workers and their outbound frame channels.
//! Everything else sees nodes only through [`NodeSnapshot`] values; the
//! registry is the one authority translating a node id into a live
//! connection.
//!
//! A node id maps to at most one live connection. A re-registration under
//! the same account displaces the old connection (its channel closes and
//! `NODE_LOST` is emitted for any subtasks still assigned); under a
//! different account it is rejected as a duplicate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::AccountDirectory;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::protocol::{CoordinatorMessage, NodeCapabilities};
use crate::reputation::ReputationEngine;
use crate::store::{NodeMetadata, NodeMetadataStore};
use crate::tier::{derive_tier, NodeTier};
use crate::transport::TransportError;

/// Opaque worker identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a node left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLostReason {
    /// The connection closed.
    Disconnected,
    /// The reaper removed the node after missed heartbeats.
    HeartbeatExpired,
    /// A newer connection for the same id took over.
    Displaced,
    /// A frame could not be delivered within the send grace period.
    SendFailed,
}

impl std::fmt::Display for NodeLostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::HeartbeatExpired => "heartbeat_expired",
            Self::Displaced => "displaced",
            Self::SendFailed => "send_failed",
        };
        write!(f, "{label}")
    }
}

/// Events the registry emits to the rest of the coordinator.
#[derive(Clone, Debug)]
pub enum RegistryEvent {
    /// A node left; subtasks assigned to it must be failed over before any
    /// reassignment happens.
    NodeLost {
        /// The departed node.
        node_id: NodeId,
        /// Why it left.
        reason: NodeLostReason,
    },
}

/// Registration handshake contents.
#[derive(Clone, Debug)]
pub struct RegisterRequest {
    /// Identity the worker claims.
    pub node_id: NodeId,
    /// Account proof.
    pub account_key: String,
    /// Declared capabilities.
    pub capabilities: NodeCapabilities,
}

/// Immutable view of one node, safe to hand to selection and monitoring.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    /// Node identifier.
    pub node_id: NodeId,
    /// Derived hardware tier.
    pub tier: NodeTier,
    /// Declared capabilities.
    pub capabilities: NodeCapabilities,
    /// Current load plus the configured artificial offset.
    pub effective_load: u32,
    /// Reputation score mirrored from the score store.
    pub reputation: f64,
    /// Whether the node heartbeated recently enough to receive work.
    pub online: bool,
}

struct NodeHandle {
    tx: mpsc::Sender<CoordinatorMessage>,
    capabilities: NodeCapabilities,
    tier: NodeTier,
    account_id: String,
    current_load: u32,
    last_heartbeat: Instant,
    connected_at: Instant,
    epoch: u64,
}

/// Registry of connected workers.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, NodeHandle>>>,
    accounts: AccountDirectory,
    reputation: ReputationEngine,
    events: mpsc::Sender<RegistryEvent>,
    metadata: Option<Arc<NodeMetadataStore>>,
    heartbeat_timeout: Duration,
    send_grace: Duration,
    epochs: Arc<AtomicU64>,
}

impl NodeRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(
        config: &CoordinatorConfig,
        accounts: AccountDirectory,
        reputation: ReputationEngine,
        events: mpsc::Sender<RegistryEvent>,
        metadata: Option<Arc<NodeMetadataStore>>,
    ) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            accounts,
            reputation,
            events,
            metadata,
            heartbeat_timeout: config.heartbeat_timeout(),
            send_grace: config.send_grace,
            epochs: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Handle a registration handshake.
    ///
    /// On success the node is inserted, a `register_ack` frame is sent on
    /// its channel, and the connection epoch is returned for use with
    /// [`NodeRegistry::disconnect_epoch`].
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::Auth`] for an invalid account proof and
    /// [`CoordinatorError::DuplicateNodeId`] when a live connection under a
    /// different account already owns the id.
    pub async fn register(
        &self,
        request: RegisterRequest,
        tx: mpsc::Sender<CoordinatorMessage>,
    ) -> Result<(NodeTier, u64), CoordinatorError> {
        let account_id = self.accounts.verify(&request.account_key)?;
        let tier = derive_tier(&request.capabilities);
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst);

        let displaced = {
            let mut nodes = self.nodes.write();

            if let Some(existing) = nodes.get(&request.node_id) {
                if existing.account_id != account_id {
                    return Err(CoordinatorError::DuplicateNodeId(
                        request.node_id.as_str().to_string(),
                    ));
                }
            }

            let old = nodes.insert(
                request.node_id.clone(),
                NodeHandle {
                    tx: tx.clone(),
                    capabilities: request.capabilities.clone(),
                    tier,
                    account_id: account_id.clone(),
                    current_load: 0,
                    last_heartbeat: Instant::now(),
                    connected_at: Instant::now(),
                    epoch,
                },
            );
            old.is_some()
        };

        if displaced {
            tracing::info!(node_id = %request.node_id, "existing connection displaced by re-registration");
            self.emit_lost(request.node_id.clone(), NodeLostReason::Displaced)
                .await;
        }

        if let Some(store) = &self.metadata {
            let record = NodeMetadata {
                node_id: request.node_id.clone(),
                account_ref: account_id.clone(),
                last_seen_capabilities: request.capabilities.clone(),
                last_seen: Utc::now(),
            };
            if let Err(error) = store.upsert(record) {
                tracing::warn!(node_id = %request.node_id, error = %error, "node metadata write failed");
            }
        }

        let _ = tx
            .send(CoordinatorMessage::RegisterAck {
                node_id: request.node_id.clone(),
                tier,
            })
            .await;

        tracing::info!(
            node_id = %request.node_id,
            account = %account_id,
            model = %request.capabilities.model_name,
            tier = %tier,
            vision = request.capabilities.supports_vision,
            "node registered"
        );

        Ok((tier, epoch))
    }

    /// Handle a heartbeat: refresh liveness, load, and any fresh speed
    /// measurement, then ack so the worker can detect dead sockets.
    pub async fn heartbeat(
        &self,
        node_id: &NodeId,
        current_load: u32,
        uptime_seconds: u64,
        tokens_per_second: Option<f64>,
    ) -> bool {
        let tx = {
            let mut nodes = self.nodes.write();
            let Some(handle) = nodes.get_mut(node_id) else {
                tracing::warn!(node_id = %node_id, "heartbeat from unknown node");
                return false;
            };
            handle.last_heartbeat = Instant::now();
            handle.current_load = current_load;
            if let Some(tps) = tokens_per_second {
                if tps > 0.0 {
                    handle.capabilities.tokens_per_second = tps;
                }
            }
            handle.tx.clone()
        };

        if tx.try_send(CoordinatorMessage::HeartbeatAck).is_err() {
            tracing::debug!(node_id = %node_id, "heartbeat ack dropped, send queue full");
        }

        tracing::trace!(node_id = %node_id, load = current_load, uptime_seconds, "heartbeat");
        true
    }

    /// Remove a node. Idempotent; emits `NODE_LOST` only on actual removal.
    pub async fn disconnect(&self, node_id: &NodeId, reason: NodeLostReason) {
        let removed = self.nodes.write().remove(node_id).is_some();
        if removed {
            tracing::info!(node_id = %node_id, reason = %reason, "node removed");
            self.emit_lost(node_id.clone(), reason).await;
        }
    }

    /// Remove a node only if the given connection epoch still owns the id.
    /// Used by connection teardown so a displaced socket cannot remove its
    /// successor.
    pub async fn disconnect_epoch(&self, node_id: &NodeId, epoch: u64, reason: NodeLostReason) {
        let removed = {
            let mut nodes = self.nodes.write();
            match nodes.get(node_id) {
                Some(handle) if handle.epoch == epoch => {
                    nodes.remove(node_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(node_id = %node_id, reason = %reason, "node removed");
            self.emit_lost(node_id.clone(), reason).await;
        }
    }

    /// Remove every node whose last heartbeat is older than the timeout.
    /// Returns the reaped ids.
    pub async fn reap_stale(&self) -> Vec<NodeId> {
        let stale: Vec<NodeId> = {
            let nodes = self.nodes.read();
            nodes
                .iter()
                .filter(|(_, h)| h.last_heartbeat.elapsed() >= self.heartbeat_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for node_id in &stale {
            self.nodes.write().remove(node_id);
            tracing::warn!(node_id = %node_id, "node reaped after missed heartbeats");
            self.emit_lost(node_id.clone(), NodeLostReason::HeartbeatExpired)
                .await;
        }

        stale
    }

    /// Immutable view of every connected node.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .map(|(id, handle)| NodeSnapshot {
                node_id: id.clone(),
                tier: handle.tier,
                capabilities: handle.capabilities.clone(),
                effective_load: handle.current_load
                    + handle.capabilities.artificial_load_offset,
                reputation: self.reputation.score(id),
                online: handle.last_heartbeat.elapsed() < self.heartbeat_timeout,
            })
            .collect()
    }

    /// Whether a node is connected and heartbeating.
    #[must_use]
    pub fn is_online(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .is_some_and(|h| h.last_heartbeat.elapsed() < self.heartbeat_timeout)
    }

    /// Number of online nodes.
    #[must_use]
    pub fn online_count(&self) -> usize {
        let nodes = self.nodes.read();
        nodes
            .values()
            .filter(|h| h.last_heartbeat.elapsed() < self.heartbeat_timeout)
            .count()
    }

    /// Ids of all online nodes.
    #[must_use]
    pub fn online_ids(&self) -> Vec<NodeId> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter(|(_, h)| h.last_heartbeat.elapsed() < self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Send a frame to a node, waiting at most the configured grace period
    /// when its queue is full.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionClosed`] when the node is gone and
    /// [`TransportError::SendTimeout`] when its queue stayed full; callers
    /// treat both as `NODE_LOST`.
    pub async fn send_to(
        &self,
        node_id: &NodeId,
        message: CoordinatorMessage,
    ) -> Result<(), CoordinatorError> {
        let tx = {
            let nodes = self.nodes.read();
            nodes
                .get(node_id)
                .map(|h| h.tx.clone())
                .ok_or(CoordinatorError::Transport(TransportError::ConnectionClosed))?
        };

        tx.send_timeout(message, self.send_grace)
            .await
            .map_err(|error| match error {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    CoordinatorError::Transport(TransportError::SendTimeout)
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    CoordinatorError::Transport(TransportError::ConnectionClosed)
                }
            })
    }

    /// Bump a node's in-flight subtask count.
    pub fn increment_load(&self, node_id: &NodeId) {
        if let Some(handle) = self.nodes.write().get_mut(node_id) {
            handle.current_load += 1;
        }
    }

    /// Drop a node's in-flight subtask count, never below zero.
    pub fn decrement_load(&self, node_id: &NodeId) {
        if let Some(handle) = self.nodes.write().get_mut(node_id) {
            handle.current_load = handle.current_load.saturating_sub(1);
        }
    }

    /// Current load of a node, if connected.
    #[must_use]
    pub fn load_of(&self, node_id: &NodeId) -> Option<u32> {
        self.nodes.read().get(node_id).map(|h| h.current_load)
    }

    /// Model a node serves: the live connection's declaration, or the last
    /// registration on record for nodes that have since disconnected.
    #[must_use]
    pub fn model_name_of(&self, node_id: &NodeId) -> Option<String> {
        if let Some(handle) = self.nodes.read().get(node_id) {
            return Some(handle.capabilities.model_name.clone());
        }

        let store = self.metadata.as_ref()?;
        match store.load() {
            Ok(records) => records
                .get(node_id)
                .map(|m| m.last_seen_capabilities.model_name.clone()),
            Err(error) => {
                tracing::debug!(node_id = %node_id, error = %error, "node metadata read failed");
                None
            }
        }
    }

    /// Drop every connection. Used at shutdown; no events are emitted.
    pub fn clear(&self) {
        self.nodes.write().clear();
    }

    async fn emit_lost(&self, node_id: NodeId, reason: NodeLostReason) {
        let event = RegistryEvent::NodeLost { node_id, reason };
        if self.events.send(event).await.is_err() {
            tracing::debug!("registry event channel closed");
        }
    }

    /// Pretend the node stopped heartbeating some time ago.
    #[cfg(test)]
    pub(crate) fn backdate_heartbeat(&self, node_id: &NodeId, age: Duration) {
        if let Some(handle) = self.nodes.write().get_mut(node_id) {
            handle.last_heartbeat = Instant::now() - age;
        }
    }
}
