//! Coordinator Facade
//!
//! Owns exactly one instance of every service (accounts, reputation,
//! registry, streams, orchestrator) and wires them together: registry events
//! flow to the orchestrator and the reputation engine, and the background
//! sweepers (heartbeat reaper, weekly decay, uptime credit, stale-stream
//! cleanup) run against the same instances. Teardown closes components in
//! reverse dependency order: orchestrator, streams, registry, reputation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::AccountDirectory;
use crate::classifier::PromptClassifier;
use crate::config::CoordinatorConfig;
use crate::direct::DirectProcessor;
use crate::orchestrator::{Orchestrator, SubmitRequest, TaskCounts};
use crate::protocol::NodeMessage;
use crate::registry::{NodeId, NodeLostReason, NodeRegistry, RegistryEvent};
use crate::reputation::{LeaderboardEntry, ReputationEngine, ReputationEventKind};
use crate::store::{NodeMetadataStore, ReputationStore, TaskHistoryStore};
use crate::streaming::{StreamManager, StreamSubscription};
use crate::tasks::{TaskId, TaskView};

/// Network statistics for monitoring consumers.
#[derive(Clone, Debug, serde::Serialize)]
pub struct NetworkSnapshot {
    /// Nodes currently online.
    pub nodes_online: usize,
    /// Tasks not yet terminal.
    pub tasks_in_flight: usize,
    /// Outcome tally of retained tasks.
    pub task_counts: TaskCounts,
    /// Top nodes by reputation.
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    accounts: AccountDirectory,
    classifier: Option<Arc<dyn PromptClassifier>>,
    direct: Option<Arc<dyn DirectProcessor>>,
    state_dir: Option<PathBuf>,
}

impl CoordinatorBuilder {
    /// Supply the account directory (defaults to empty).
    #[must_use]
    pub fn accounts(mut self, accounts: AccountDirectory) -> Self {
        self.accounts = accounts;
        self
    }

    /// Attach an external difficulty classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn PromptClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Attach an external document processor for the bypass path.
    #[must_use]
    pub fn direct_processor(mut self, processor: Arc<dyn DirectProcessor>) -> Self {
        self.direct = Some(processor);
        self
    }

    /// Persist reputation, node metadata, and task history under this
    /// directory. Without it the coordinator runs fully in memory.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Assemble the coordinator and start its registry event pump.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Coordinator {
        let (reputation_store, metadata_store, history_store) = match &self.state_dir {
            Some(dir) => (
                open_or_warn(ReputationStore::open(dir), "reputation"),
                open_or_warn(NodeMetadataStore::open(dir), "node metadata").map(Arc::new),
                open_or_warn(TaskHistoryStore::open(dir), "task history").map(Arc::new),
            ),
            None => (None, None, None),
        };

        let reputation = ReputationEngine::new(
            self.config.reputation_floor,
            self.config.reputation_ceiling,
            self.config.weekly_decay_factor,
            reputation_store,
        );

        let (events_tx, events_rx) = mpsc::channel::<RegistryEvent>(64);
        let registry = NodeRegistry::new(
            &self.config,
            self.accounts.clone(),
            reputation.clone(),
            events_tx,
            metadata_store,
        );

        let streams = StreamManager::new(self.config.stream_queue_capacity);
        let orchestrator = Orchestrator::new(
            self.config.clone(),
            registry.clone(),
            self.classifier,
            self.direct,
            streams.clone(),
            reputation.clone(),
            history_store,
        );

        let events_task = tokio::spawn(pump_registry_events(
            events_rx,
            orchestrator.clone(),
            reputation.clone(),
        ));

        Coordinator {
            config: self.config,
            accounts: self.accounts,
            reputation,
            registry,
            streams,
            orchestrator,
            events_task,
        }
    }
}

fn open_or_warn<T>(result: std::io::Result<T>, what: &str) -> Option<T> {
    match result {
        Ok(store) => Some(store),
        Err(error) => {
            tracing::warn!(store = what, error = %error, "state store unavailable, running without it");
            None
        }
    }
}

/// Forward registry events: node losses reach every task driver before any
/// reassignment, and the departed node is debited according to how it left.
async fn pump_registry_events(
    mut events: mpsc::Receiver<RegistryEvent>,
    orchestrator: Orchestrator,
    reputation: ReputationEngine,
) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::NodeLost { node_id, reason } => {
                match reason {
                    NodeLostReason::HeartbeatExpired => {
                        reputation.record_broken_promise(&node_id, 1);
                    }
                    NodeLostReason::Disconnected | NodeLostReason::SendFailed => {
                        reputation.record(&node_id, ReputationEventKind::Timeout);
                    }
                    NodeLostReason::Displaced => {}
                }
                orchestrator.node_lost(&node_id).await;
            }
        }
    }
}

/// The coordinator process: one instance of each service, owned here.
pub struct Coordinator {
    config: CoordinatorConfig,
    accounts: AccountDirectory,
    reputation: ReputationEngine,
    registry: NodeRegistry,
    streams: StreamManager,
    orchestrator: Orchestrator,
    events_task: JoinHandle<()>,
}

impl Coordinator {
    /// Start building a coordinator.
    #[must_use]
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            accounts: AccountDirectory::new(),
            classifier: None,
            direct: None,
            state_dir: None,
        }
    }

    /// Submit a task. Returns its id; poll or subscribe for progress.
    pub fn submit_task(&self, request: SubmitRequest) -> TaskId {
        self.orchestrator.submit(request)
    }

    /// Latest view of a task.
    #[must_use]
    pub fn poll_task(&self, task_id: &TaskId) -> Option<TaskView> {
        self.orchestrator.poll(task_id)
    }

    /// Cancel a task. Idempotent on terminal tasks; false for unknown ids.
    pub async fn cancel_task(&self, task_id: &TaskId) -> bool {
        self.orchestrator.cancel(task_id).await
    }

    /// Attach the stream consumer for a streaming task.
    #[must_use]
    pub fn subscribe_stream(&self, task_id: &TaskId) -> Option<StreamSubscription> {
        self.streams.subscribe(task_id)
    }

    /// Deliver a decoded worker frame. Registration and heartbeats go to the
    /// registry; task frames go to the owning driver.
    pub async fn deliver(&self, node_id: &NodeId, message: NodeMessage) {
        match message {
            NodeMessage::NodeHeartbeat {
                node_id: reported,
                current_load,
                uptime_seconds,
                tokens_per_second,
            } => {
                if &reported != node_id {
                    tracing::warn!(
                        connection = %node_id,
                        reported = %reported,
                        "heartbeat node id mismatch ignored"
                    );
                    return;
                }
                self.registry
                    .heartbeat(node_id, current_load, uptime_seconds, tokens_per_second)
                    .await;
            }
            NodeMessage::NodeRegister { .. } => {
                tracing::warn!(node_id = %node_id, "re-registration frame on live connection ignored");
            }
            task_frame => self.orchestrator.deliver(node_id, task_frame).await,
        }
    }

    /// Network statistics for the monitoring egress.
    #[must_use]
    pub fn snapshot(&self) -> NetworkSnapshot {
        let mut leaderboard = self.reputation.leaderboard(20);
        for entry in &mut leaderboard {
            entry.model_name = self.registry.model_name_of(&entry.node_id);
        }

        NetworkSnapshot {
            nodes_online: self.registry.online_count(),
            tasks_in_flight: self.orchestrator.in_flight(),
            task_counts: self.orchestrator.counts(),
            leaderboard,
        }
    }

    /// The account directory (shared with the external issuance service).
    #[must_use]
    pub fn accounts(&self) -> &AccountDirectory {
        &self.accounts
    }

    /// The node registry.
    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The reputation engine.
    #[must_use]
    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    /// The configuration this coordinator runs with.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Spawn the background sweepers: heartbeat reaper, weekly reputation
    /// decay, hourly uptime credit, and stale stream and task-view cleanup.
    /// The returned handles live as long as the process; abort them to stop.
    #[must_use]
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Heartbeat reaper.
        {
            let registry = self.registry.clone();
            let interval = self.config.heartbeat_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let reaped = registry.reap_stale().await;
                    if !reaped.is_empty() {
                        tracing::info!(count = reaped.len(), "reaped silent nodes");
                    }
                }
            }));
        }

        // Weekly decay, checked hourly, and uptime credit for online nodes.
        {
            let registry = self.registry.clone();
            let reputation = self.reputation.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so freshly
                // started coordinators do not credit uptime at once.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    for node_id in registry.online_ids() {
                        reputation.record(&node_id, ReputationEventKind::UptimeHour);
                    }
                    reputation.decay(Utc::now());
                    reputation.flush();
                }
            }));
        }

        // Stale stream and terminal task-view cleanup.
        {
            let streams = self.streams.clone();
            let orchestrator = self.orchestrator.clone();
            let retention = self.config.task_retention;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let removed = streams.cleanup(retention);
                    let pruned = orchestrator.prune(retention);
                    if removed > 0 || pruned > 0 {
                        tracing::debug!(streams = removed, tasks = pruned, "stale state cleaned up");
                    }
                }
            }));
        }

        handles
    }

    /// Tear down in reverse dependency order: cancel in-flight tasks, close
    /// streams, drop worker connections, flush reputation.
    pub async fn shutdown(&self) {
        tracing::info!("coordinator shutting down");
        self.orchestrator.shutdown().await;
        self.streams.clear();
        self.registry.clear();
        self.reputation.flush();
        self.events_task.abort();
    }
}
