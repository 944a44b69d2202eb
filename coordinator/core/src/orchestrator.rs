//! Task Orchestrator
//!
//! One driver per in-flight task runs the whole lifecycle:
//! classify, divide, select and dispatch, collect, aggregate. The driver is
//! the only writer of its task's state; worker frames, node-lost events, and
//! cancellation all reach it as signals on a typed queue, and the rest of
//! the process observes progress through published [`TaskView`] snapshots.
//!
//! Failure handling is two-layered. Each dispatch attempt has its own
//! deadline driving reassignment to the next-best eligible node (workers
//! that already attempted a subtask are excluded); the task deadline, fixed
//! by classified difficulty, terminates the whole request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::aggregator::aggregate;
use crate::classifier::{classify_with_fallback, PromptClassifier};
use crate::config::CoordinatorConfig;
use crate::direct::{bypass_attachment, DirectProcessor};
use crate::divider::divide;
use crate::error::ReasonCode;
use crate::protocol::{CoordinatorMessage, FileAttachment, NodeMessage, WorkerErrorKind};
use crate::registry::{NodeId, NodeRegistry};
use crate::reputation::{ReputationEngine, ReputationEventKind};
use crate::selection::SelectionPolicy;
use crate::store::{TaskHistoryRecord, TaskHistoryStore};
use crate::streaming::{StreamFrame, StreamManager, TaskStream};
use crate::tasks::{DivisionMode, Subtask, SubtaskState, Task, TaskId, TaskStatus, TaskView};

/// A user request as handed over by the HTTP boundary.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// The prompt to run.
    pub prompt: String,
    /// Division mode.
    pub mode: DivisionMode,
    /// Whether the caller wants a live stream.
    pub streaming: bool,
    /// Attached files.
    pub files: Vec<FileAttachment>,
    /// Submitting account.
    pub account_ref: Option<String>,
}

/// Terminal-status tally for monitoring.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct TaskCounts {
    /// Tasks still in flight.
    pub active: usize,
    /// Tasks that completed fully.
    pub completed: usize,
    /// Tasks that completed partially.
    pub partial: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks that hit their deadline.
    pub timed_out: usize,
    /// Tasks cancelled by the caller.
    pub cancelled: usize,
}

/// Signals delivered to a task driver.
#[derive(Debug)]
enum DriverSignal {
    Chunk {
        node_id: NodeId,
        subtask: u32,
        seq: u64,
        text: String,
    },
    Result {
        node_id: NodeId,
        subtask: u32,
        payload: String,
        execution_time_ms: u64,
    },
    WorkerError {
        node_id: NodeId,
        subtask: u32,
        kind: WorkerErrorKind,
        detail: String,
    },
    NodeLost {
        node_id: NodeId,
    },
    Cancel,
}

struct TaskEntry {
    signals: mpsc::Sender<DriverSignal>,
    view: Arc<RwLock<TaskView>>,
}

struct OrchestratorInner {
    config: CoordinatorConfig,
    registry: NodeRegistry,
    selection: SelectionPolicy,
    classifier: Option<Arc<dyn PromptClassifier>>,
    direct: Option<Arc<dyn DirectProcessor>>,
    streams: StreamManager,
    reputation: ReputationEngine,
    history: Option<Arc<TaskHistoryStore>>,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
}

/// Owner of all in-flight tasks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Create an orchestrator wired to its collaborating services.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        registry: NodeRegistry,
        classifier: Option<Arc<dyn PromptClassifier>>,
        direct: Option<Arc<dyn DirectProcessor>>,
        streams: StreamManager,
        reputation: ReputationEngine,
        history: Option<Arc<TaskHistoryStore>>,
    ) -> Self {
        let selection = SelectionPolicy::new(config.selection_weights);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                registry,
                selection,
                classifier,
                direct,
                streams,
                reputation,
                history,
                tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Accept a request and start its driver. Returns the new task id.
    pub fn submit(&self, request: SubmitRequest) -> TaskId {
        let id = TaskId::generate();
        let task = Task::new(
            id.clone(),
            request.prompt,
            request.files,
            request.mode,
            request.streaming,
            request.account_ref,
        );

        let stream = if task.streaming {
            Some(self.inner.streams.open(&id))
        } else {
            None
        };

        let (signals_tx, signals_rx) = mpsc::channel(256);
        let view = Arc::new(RwLock::new(task.view()));

        self.inner.tasks.write().insert(
            id.clone(),
            TaskEntry {
                signals: signals_tx,
                view: view.clone(),
            },
        );

        tracing::info!(task_id = %id, mode = ?task.mode, streaming = task.streaming, "task accepted");

        let driver = Driver {
            orch: self.clone(),
            task,
            view,
            stream,
            needs_vision: false,
            attempt_timeout: Duration::from_secs(0),
            last_reason: None,
        };
        tokio::spawn(driver.run(signals_rx));

        id
    }

    /// Route a task-scoped worker frame to its driver.
    pub async fn deliver(&self, node_id: &NodeId, message: NodeMessage) {
        let signal = match message {
            NodeMessage::TaskStream {
                task_id,
                subtask_index,
                seq,
                payload,
            } => (
                task_id,
                DriverSignal::Chunk {
                    node_id: node_id.clone(),
                    subtask: subtask_index,
                    seq,
                    text: payload,
                },
            ),
            NodeMessage::TaskResult {
                task_id,
                subtask_index,
                payload,
                execution_time_ms,
            } => (
                task_id,
                DriverSignal::Result {
                    node_id: node_id.clone(),
                    subtask: subtask_index,
                    payload,
                    execution_time_ms,
                },
            ),
            NodeMessage::TaskError {
                task_id,
                subtask_index,
                kind,
                detail,
            } => (
                task_id,
                DriverSignal::WorkerError {
                    node_id: node_id.clone(),
                    subtask: subtask_index,
                    kind,
                    detail,
                },
            ),
            other => {
                tracing::warn!(node_id = %node_id, frame = ?other, "non-task frame routed to orchestrator");
                return;
            }
        };

        let (task_id, signal) = signal;
        let tx = {
            let tasks = self.inner.tasks.read();
            tasks.get(&task_id).map(|entry| entry.signals.clone())
        };

        match tx {
            Some(tx) => {
                // A closed channel means the driver already finished; late
                // frames from slow workers are expected and dropped.
                let _ = tx.send(signal).await;
            }
            None => {
                tracing::debug!(task_id = %task_id, node_id = %node_id, "frame for unknown task dropped");
            }
        }
    }

    /// Fan a node loss out to every driver, before any reassignment can
    /// happen elsewhere.
    pub async fn node_lost(&self, node_id: &NodeId) {
        let senders: Vec<mpsc::Sender<DriverSignal>> = {
            let tasks = self.inner.tasks.read();
            tasks.values().map(|e| e.signals.clone()).collect()
        };

        for tx in senders {
            let _ = tx
                .send(DriverSignal::NodeLost {
                    node_id: node_id.clone(),
                })
                .await;
        }
    }

    /// Latest view of a task.
    #[must_use]
    pub fn poll(&self, task_id: &TaskId) -> Option<TaskView> {
        self.inner
            .tasks
            .read()
            .get(task_id)
            .map(|entry| entry.view.read().clone())
    }

    /// Request cancellation. Idempotent: cancelling a terminal task is a
    /// no-op that still returns `true`; unknown tasks return `false`.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let entry = {
            let tasks = self.inner.tasks.read();
            tasks
                .get(task_id)
                .map(|e| (e.signals.clone(), e.view.read().status))
        };

        match entry {
            Some((_, status)) if status.is_terminal() => true,
            Some((tx, _)) => {
                let _ = tx.send(DriverSignal::Cancel).await;
                true
            }
            None => false,
        }
    }

    /// Number of tasks not yet terminal.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .tasks
            .read()
            .values()
            .filter(|e| !e.view.read().status.is_terminal())
            .count()
    }

    /// Tally of task outcomes currently retained.
    #[must_use]
    pub fn counts(&self) -> TaskCounts {
        let tasks = self.inner.tasks.read();
        let mut counts = TaskCounts::default();
        for entry in tasks.values() {
            match entry.view.read().status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Partial => counts.partial += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::TimedOut => counts.timed_out += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                _ => counts.active += 1,
            }
        }
        counts
    }

    /// Drop terminal task views older than the retention window. Returns how
    /// many were pruned.
    pub fn prune(&self, retention: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut tasks = self.inner.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let view = entry.view.read();
            match (view.status.is_terminal(), view.completed_at) {
                (true, Some(completed_at)) => completed_at > cutoff,
                _ => true,
            }
        });
        before - tasks.len()
    }

    /// Cancel every in-flight task. Used at shutdown.
    pub async fn shutdown(&self) {
        let senders: Vec<mpsc::Sender<DriverSignal>> = {
            let tasks = self.inner.tasks.read();
            tasks
                .values()
                .filter(|e| !e.view.read().status.is_terminal())
                .map(|e| e.signals.clone())
                .collect()
        };
        for tx in senders {
            let _ = tx.send(DriverSignal::Cancel).await;
        }
    }
}

/// Per-task driver. Exclusive owner of the task until it terminates.
struct Driver {
    orch: Orchestrator,
    task: Task,
    view: Arc<RwLock<TaskView>>,
    stream: Option<Arc<TaskStream>>,
    needs_vision: bool,
    attempt_timeout: Duration,
    last_reason: Option<ReasonCode>,
}

impl Driver {
    async fn run(mut self, mut signals: mpsc::Receiver<DriverSignal>) {
        self.needs_vision = self.task.files.iter().any(FileAttachment::is_image);
        self.execute(&mut signals).await;
        self.record_history();
    }

    async fn execute(&mut self, signals: &mut mpsc::Receiver<DriverSignal>) {
        let cfg = self.orch.inner.config.clone();

        // Document bypass: an external processor answers, no nodes involved.
        if let Some(processor) = self.orch.inner.direct.clone() {
            if bypass_attachment(&self.task.files, &cfg.direct_formats).is_some() {
                self.run_direct(processor, signals).await;
                return;
            }
        }

        // Classify within the configured budget.
        self.task.status = TaskStatus::Classifying;
        self.publish();
        let difficulty = classify_with_fallback(
            self.orch.inner.classifier.as_ref(),
            &self.task.prompt,
            &self.task.files,
            cfg.classifier_timeout,
        )
        .await;
        self.task.difficulty = Some(difficulty);
        self.attempt_timeout = cfg.attempt_timeout(difficulty);
        let task_deadline =
            self.task.created_at + cfg.difficulty_timeouts.for_difficulty(difficulty);

        tracing::info!(task_id = %self.task.id, difficulty = %difficulty, "task classified");

        // Capacity gate: with no eligible node the task fails before any
        // subtask exists.
        let snapshot = self.orch.inner.registry.snapshot();
        if self
            .orch
            .inner
            .selection
            .pick(&snapshot, difficulty, 1, &[], self.needs_vision)
            .is_empty()
        {
            tracing::warn!(task_id = %self.task.id, difficulty = %difficulty, "no eligible nodes online");
            self.task.finish(TaskStatus::Failed, Some(ReasonCode::NoNodes));
            self.close_stream_with(StreamFrame::Error {
                reason: ReasonCode::NoNodes,
            });
            self.publish();
            return;
        }

        // Divide into subtasks.
        let fragments = divide(&self.task.prompt, self.task.mode, &cfg);
        self.task.subtasks = fragments
            .into_iter()
            .enumerate()
            .map(|(i, prompt)| Subtask::new(i as u32, prompt))
            .collect();
        tracing::debug!(
            task_id = %self.task.id,
            subtasks = self.task.subtasks.len(),
            "task divided"
        );

        // Dispatch every subtask.
        for idx in 0..self.task.subtasks.len() {
            if !self.dispatch(idx).await {
                self.last_reason = Some(ReasonCode::NoNodes);
                self.task.subtasks[idx].state = SubtaskState::Failed;
                self.push_stream(StreamFrame::SubtaskDone {
                    subtask: idx as u32,
                });
            }
        }
        self.task.status = TaskStatus::Dispatched;
        self.publish();

        // Collect until every subtask is terminal or a deadline fires.
        loop {
            if self.all_terminal() {
                break;
            }
            let next_attempt_deadline = self.next_attempt_deadline();

            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(DriverSignal::Cancel) | None => {
                        self.cancel_all().await;
                        return;
                    }
                    Some(signal) => self.handle_signal(signal).await,
                },
                () = tokio::time::sleep_until(task_deadline) => {
                    self.on_task_timeout().await;
                    return;
                }
                () = sleep_until_opt(next_attempt_deadline) => {
                    self.expire_overdue_attempts().await;
                }
            }
            self.publish();
        }

        self.finalize();
        self.publish();
    }

    /// Select a node and send the assignment, walking down the candidate
    /// list when sends fail. Returns false when no eligible node accepted.
    async fn dispatch(&mut self, idx: usize) -> bool {
        let difficulty = self.task.difficulty.expect("dispatch after classification");

        loop {
            let snapshot = self.orch.inner.registry.snapshot();
            let exclude = self.task.subtasks[idx].attempted_nodes.clone();
            let picked = self.orch.inner.selection.pick(
                &snapshot,
                difficulty,
                1,
                &exclude,
                self.needs_vision,
            );
            let Some(candidate) = picked.into_iter().next() else {
                return false;
            };
            let node_id = candidate.node_id;

            let message = CoordinatorMessage::TaskAssign {
                task_id: self.task.id.clone(),
                subtask_index: idx as u32,
                prompt: self.task.subtasks[idx].prompt.clone(),
                files: self.task.files.clone(),
                streaming: self.task.streaming,
                deadline_ms: self.attempt_timeout.as_millis() as u64,
            };

            self.task.subtasks[idx]
                .attempted_nodes
                .push(node_id.clone());

            match self.orch.inner.registry.send_to(&node_id, message).await {
                Ok(()) => {
                    self.orch.inner.registry.increment_load(&node_id);
                    let subtask = &mut self.task.subtasks[idx];
                    subtask.assigned_node = Some(node_id.clone());
                    subtask.attempts += 1;
                    subtask.state = SubtaskState::Assigned;
                    subtask.attempt_started = Some(Instant::now());
                    tracing::info!(
                        task_id = %self.task.id,
                        subtask = idx,
                        node_id = %node_id,
                        attempt = subtask.attempts,
                        "subtask assigned"
                    );
                    return true;
                }
                Err(error) => {
                    tracing::warn!(
                        task_id = %self.task.id,
                        subtask = idx,
                        node_id = %node_id,
                        error = %error,
                        "assignment send failed, connection torn down"
                    );
                    self.orch
                        .inner
                        .registry
                        .disconnect(&node_id, crate::registry::NodeLostReason::SendFailed)
                        .await;
                }
            }
        }
    }

    async fn handle_signal(&mut self, signal: DriverSignal) {
        match signal {
            DriverSignal::Chunk {
                node_id,
                subtask,
                seq,
                text,
            } => {
                let Some(idx) = self.live_subtask(subtask, &node_id) else {
                    return;
                };
                {
                    let sub = &mut self.task.subtasks[idx];
                    sub.state = SubtaskState::Streaming;
                    sub.buffer.push_str(&text);
                }
                if self.task.status == TaskStatus::Dispatched {
                    self.task.status = TaskStatus::Streaming;
                }
                self.push_stream(StreamFrame::Chunk {
                    subtask,
                    seq,
                    text,
                });
            }

            DriverSignal::Result {
                node_id,
                subtask,
                payload,
                execution_time_ms,
            } => {
                let Some(idx) = self.live_subtask(subtask, &node_id) else {
                    return;
                };
                if self.valid_result(&payload) {
                    self.complete_subtask(idx, &node_id, payload, execution_time_ms);
                } else {
                    tracing::warn!(
                        task_id = %self.task.id,
                        subtask,
                        node_id = %node_id,
                        bytes = payload.len(),
                        "result failed integrity validation"
                    );
                    self.orch
                        .inner
                        .reputation
                        .record(&node_id, ReputationEventKind::InvalidResponse);
                    self.orch.inner.registry.decrement_load(&node_id);
                    self.retry_or_fail(idx, ReasonCode::InvalidResponse).await;
                }
            }

            DriverSignal::WorkerError {
                node_id,
                subtask,
                kind,
                detail,
            } => {
                let Some(idx) = self.live_subtask(subtask, &node_id) else {
                    return;
                };
                tracing::warn!(
                    task_id = %self.task.id,
                    subtask,
                    node_id = %node_id,
                    kind = %kind,
                    detail = %detail,
                    "worker reported task error"
                );
                self.orch
                    .inner
                    .reputation
                    .record(&node_id, ReputationEventKind::Timeout);
                self.orch.inner.registry.decrement_load(&node_id);
                self.retry_or_fail(idx, ReasonCode::WorkerError).await;
            }

            DriverSignal::NodeLost { node_id } => {
                let affected: Vec<usize> = self
                    .task
                    .subtasks
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| {
                        !s.state.is_terminal() && s.assigned_node.as_ref() == Some(&node_id)
                    })
                    .map(|(i, _)| i)
                    .collect();

                for idx in affected {
                    tracing::warn!(
                        task_id = %self.task.id,
                        subtask = idx,
                        node_id = %node_id,
                        "assigned node lost"
                    );
                    self.retry_or_fail(idx, ReasonCode::NodeLost).await;
                }
            }

            DriverSignal::Cancel => unreachable!("cancel handled by the collect loop"),
        }
    }

    /// Index of the subtask when it is non-terminal and still assigned to
    /// the sending node. Frames from superseded attempts land here and are
    /// dropped.
    fn live_subtask(&self, subtask: u32, node_id: &NodeId) -> Option<usize> {
        let idx = subtask as usize;
        let sub = self.task.subtasks.get(idx)?;
        if sub.state.is_terminal() || sub.assigned_node.as_ref() != Some(node_id) {
            return None;
        }
        Some(idx)
    }

    fn valid_result(&self, payload: &str) -> bool {
        !payload.trim().is_empty() && payload.len() <= self.orch.inner.config.max_result_bytes
    }

    fn complete_subtask(
        &mut self,
        idx: usize,
        node_id: &NodeId,
        payload: String,
        execution_time_ms: u64,
    ) {
        let observed = {
            let sub = &mut self.task.subtasks[idx];
            sub.state = SubtaskState::Completed;
            sub.buffer = payload;
            sub.execution_time_ms = Some(execution_time_ms);
            sub.attempt_started.map_or(Duration::ZERO, |t| t.elapsed())
        };

        self.orch.inner.registry.decrement_load(node_id);
        self.push_stream(StreamFrame::SubtaskDone {
            subtask: idx as u32,
        });

        self.orch
            .inner
            .reputation
            .record(node_id, ReputationEventKind::TaskCompleted);

        let difficulty = self.task.difficulty.expect("completed after classification");
        let task_timeout = self
            .orch
            .inner
            .config
            .difficulty_timeouts
            .for_difficulty(difficulty);
        let fast_window = task_timeout.mul_f64(self.orch.inner.config.fast_completion_ratio);
        if observed < fast_window {
            self.orch
                .inner
                .reputation
                .record(node_id, ReputationEventKind::FastCompletion);
        }

        tracing::info!(
            task_id = %self.task.id,
            subtask = idx,
            node_id = %node_id,
            observed_ms = observed.as_millis() as u64,
            "subtask completed"
        );
    }

    /// Hand a failed subtask to the next-best node, or mark it failed once
    /// the attempt budget is spent.
    async fn retry_or_fail(&mut self, idx: usize, reason: ReasonCode) {
        self.last_reason = Some(reason);

        let can_retry = {
            let sub = &mut self.task.subtasks[idx];
            sub.assigned_node = None;
            sub.attempt_started = None;
            sub.attempts < self.orch.inner.config.max_attempts_per_subtask
        };

        if can_retry {
            {
                let sub = &mut self.task.subtasks[idx];
                sub.state = SubtaskState::Reassigned;
                // Buffered chunks belong to the superseded attempt.
                sub.buffer.clear();
            }
            if self.dispatch(idx).await {
                let attempt = self.task.subtasks[idx].attempts;
                self.push_stream(StreamFrame::AttemptRestart {
                    subtask: idx as u32,
                    attempt,
                });
                return;
            }
            tracing::warn!(
                task_id = %self.task.id,
                subtask = idx,
                "no eligible node for reassignment"
            );
        }

        self.task.subtasks[idx].state = SubtaskState::Failed;
        self.push_stream(StreamFrame::SubtaskDone {
            subtask: idx as u32,
        });
        tracing::warn!(
            task_id = %self.task.id,
            subtask = idx,
            reason = %reason,
            "subtask failed"
        );
    }

    /// Expire attempts whose per-attempt deadline passed, penalising the
    /// node and reassigning or failing.
    async fn expire_overdue_attempts(&mut self) {
        let now = Instant::now();
        for idx in 0..self.task.subtasks.len() {
            let overdue_node = {
                let sub = &self.task.subtasks[idx];
                let running =
                    matches!(sub.state, SubtaskState::Assigned | SubtaskState::Streaming);
                let expired = sub
                    .attempt_started
                    .is_some_and(|t| t + self.attempt_timeout <= now);
                if running && expired {
                    sub.assigned_node.clone()
                } else {
                    None
                }
            };

            let Some(node_id) = overdue_node else { continue };

            tracing::warn!(
                task_id = %self.task.id,
                subtask = idx,
                node_id = %node_id,
                "attempt deadline expired"
            );
            let _ = self
                .orch
                .inner
                .registry
                .send_to(
                    &node_id,
                    CoordinatorMessage::TaskCancel {
                        task_id: self.task.id.clone(),
                        subtask_index: idx as u32,
                    },
                )
                .await;
            self.orch.inner.registry.decrement_load(&node_id);
            self.orch
                .inner
                .reputation
                .record(&node_id, ReputationEventKind::Timeout);
            self.retry_or_fail(idx, ReasonCode::Timeout).await;
        }
    }

    /// The task deadline fired: cancel survivors, penalise their nodes, and
    /// end in TIMED_OUT.
    async fn on_task_timeout(&mut self) {
        tracing::warn!(task_id = %self.task.id, "task deadline expired");

        for idx in 0..self.task.subtasks.len() {
            let assigned = {
                let sub = &self.task.subtasks[idx];
                if sub.state.is_terminal() {
                    continue;
                }
                sub.assigned_node.clone()
            };
            if let Some(node_id) = assigned {
                let _ = self
                    .orch
                    .inner
                    .registry
                    .send_to(
                        &node_id,
                        CoordinatorMessage::TaskCancel {
                            task_id: self.task.id.clone(),
                            subtask_index: idx as u32,
                        },
                    )
                    .await;
                self.orch.inner.registry.decrement_load(&node_id);
                self.orch
                    .inner
                    .reputation
                    .record(&node_id, ReputationEventKind::Timeout);
            }
            self.task.subtasks[idx].state = SubtaskState::Cancelled;
        }

        self.task
            .finish(TaskStatus::TimedOut, Some(ReasonCode::Timeout));
        self.close_stream_with(StreamFrame::Error {
            reason: ReasonCode::Timeout,
        });
        self.publish();
    }

    /// Caller-initiated cancellation: no reputation penalties.
    async fn cancel_all(&mut self) {
        tracing::info!(task_id = %self.task.id, "task cancelled");

        for idx in 0..self.task.subtasks.len() {
            let assigned = {
                let sub = &self.task.subtasks[idx];
                if sub.state.is_terminal() {
                    continue;
                }
                sub.assigned_node.clone()
            };
            if let Some(node_id) = assigned {
                let _ = self
                    .orch
                    .inner
                    .registry
                    .send_to(
                        &node_id,
                        CoordinatorMessage::TaskCancel {
                            task_id: self.task.id.clone(),
                            subtask_index: idx as u32,
                        },
                    )
                    .await;
                self.orch.inner.registry.decrement_load(&node_id);
            }
            self.task.subtasks[idx].state = SubtaskState::Cancelled;
        }

        self.task
            .finish(TaskStatus::Cancelled, Some(ReasonCode::Cancelled));
        self.close_stream_with(StreamFrame::Aborted);
        self.publish();
    }

    /// Every subtask is terminal: decide the outcome and aggregate.
    fn finalize(&mut self) {
        let total = self.task.subtasks.len();
        let completed = self
            .task
            .subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Completed)
            .count();

        let failed_status = if self.last_reason == Some(ReasonCode::Timeout) {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };

        let status = match self.task.mode {
            DivisionMode::Consensus => {
                let quorum = (total + 1) / 2;
                if completed >= quorum {
                    TaskStatus::Completed
                } else {
                    failed_status
                }
            }
            _ if completed == total => TaskStatus::Completed,
            DivisionMode::Subtasks | DivisionMode::Context if completed >= 1 => TaskStatus::Partial,
            _ => failed_status,
        };

        match status {
            TaskStatus::Completed | TaskStatus::Partial => {
                let outcome = aggregate(
                    self.task.mode,
                    &self.task.subtasks,
                    &self.orch.inner.config,
                    &self.orch.inner.reputation,
                );
                self.task.final_response = Some(outcome.text);

                if self.orch.inner.config.penalize_consensus_dissent {
                    for dissenter in &outcome.dissenters {
                        self.orch
                            .inner
                            .reputation
                            .record(dissenter, ReputationEventKind::InvalidResponse);
                    }
                }

                if status == TaskStatus::Completed {
                    self.task.finish(TaskStatus::Completed, None);
                    self.close_stream();
                } else {
                    let reason = self.last_reason.unwrap_or(ReasonCode::AttemptsExhausted);
                    self.task.finish(TaskStatus::Partial, Some(reason));
                    self.close_stream_with(StreamFrame::Error { reason });
                }
            }
            _ => {
                let reason = self.last_reason.unwrap_or(ReasonCode::AttemptsExhausted);
                self.task.finish(status, Some(reason));
                self.close_stream_with(StreamFrame::Error { reason });
            }
        }

        tracing::info!(
            task_id = %self.task.id,
            status = ?self.task.status,
            completed,
            total,
            "task finished"
        );
    }

    /// Document bypass: the external processor produces the answer and its
    /// chunks flow straight to the stream. Registered nodes see nothing and
    /// earn nothing.
    async fn run_direct(
        &mut self,
        processor: Arc<dyn DirectProcessor>,
        signals: &mut mpsc::Receiver<DriverSignal>,
    ) {
        tracing::info!(
            task_id = %self.task.id,
            processor = processor.name(),
            "document bypass engaged"
        );

        self.task.mode = DivisionMode::Direct;
        self.task.subtasks = vec![Subtask::new(0, self.task.prompt.clone())];
        self.task.subtasks[0].state = SubtaskState::Assigned;
        self.task.subtasks[0].attempts = 1;
        self.task.status = TaskStatus::Dispatched;
        self.publish();

        let prompt = self.task.prompt.clone();
        let files = self.task.files.clone();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(32);
        let mut job = Box::pin(processor.process(&prompt, &files, chunk_tx));

        let deadline = Instant::now() + self.orch.inner.config.direct_timeout;
        let mut seq = 0u64;
        let mut chunks_open = true;

        loop {
            tokio::select! {
                maybe = chunk_rx.recv(), if chunks_open => match maybe {
                    Some(text) => {
                        self.task.subtasks[0].state = SubtaskState::Streaming;
                        self.task.status = TaskStatus::Streaming;
                        self.task.subtasks[0].buffer.push_str(&text);
                        self.push_stream(StreamFrame::Chunk { subtask: 0, seq, text });
                        seq += 1;
                        self.publish();
                    }
                    None => chunks_open = false,
                },
                result = &mut job => {
                    // The processor may finish with chunks still buffered;
                    // flush them before the terminal frame.
                    while let Ok(text) = chunk_rx.try_recv() {
                        self.task.subtasks[0].buffer.push_str(&text);
                        self.push_stream(StreamFrame::Chunk { subtask: 0, seq, text });
                        seq += 1;
                    }
                    match result {
                        Ok(answer) => {
                            self.task.subtasks[0].state = SubtaskState::Completed;
                            self.task.subtasks[0].buffer = answer.clone();
                            self.task.final_response = Some(answer);
                            self.task.finish(TaskStatus::Completed, None);
                            self.push_stream(StreamFrame::SubtaskDone { subtask: 0 });
                            self.close_stream();
                        }
                        Err(error) => {
                            tracing::warn!(
                                task_id = %self.task.id,
                                error = %error,
                                "direct processing failed"
                            );
                            self.task.subtasks[0].state = SubtaskState::Failed;
                            self.task.finish(TaskStatus::Failed, Some(ReasonCode::WorkerError));
                            self.close_stream_with(StreamFrame::Error {
                                reason: ReasonCode::WorkerError,
                            });
                        }
                    }
                    self.publish();
                    return;
                }
                signal = signals.recv() => match signal {
                    Some(DriverSignal::Cancel) | None => {
                        self.task.subtasks[0].state = SubtaskState::Cancelled;
                        self.task.finish(TaskStatus::Cancelled, Some(ReasonCode::Cancelled));
                        self.close_stream_with(StreamFrame::Aborted);
                        self.publish();
                        return;
                    }
                    Some(_) => {
                        // No node frames can target a bypass task.
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    self.task.subtasks[0].state = SubtaskState::Cancelled;
                    self.task.finish(TaskStatus::TimedOut, Some(ReasonCode::Timeout));
                    self.close_stream_with(StreamFrame::Error { reason: ReasonCode::Timeout });
                    self.publish();
                    return;
                }
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.task.subtasks.iter().all(|s| s.state.is_terminal())
    }

    /// Earliest deadline among running attempts, if any.
    fn next_attempt_deadline(&self) -> Option<Instant> {
        self.task
            .subtasks
            .iter()
            .filter(|s| matches!(s.state, SubtaskState::Assigned | SubtaskState::Streaming))
            .filter_map(|s| s.attempt_started.map(|t| t + self.attempt_timeout))
            .min()
    }

    fn publish(&self) {
        *self.view.write() = self.task.view();
    }

    fn push_stream(&self, frame: StreamFrame) {
        if let Some(stream) = &self.stream {
            stream.push(frame);
        }
    }

    fn close_stream(&self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
    }

    fn close_stream_with(&self, frame: StreamFrame) {
        if let Some(stream) = &self.stream {
            stream.close_with(frame);
        }
    }

    fn record_history(&self) {
        if let Some(history) = &self.orch.inner.history {
            let record = TaskHistoryRecord {
                task_id: self.task.id.clone(),
                mode: self.task.mode,
                difficulty: self.task.difficulty,
                created: self.task.created_wallclock,
                terminal_status: self.task.status,
                duration_ms: self.task.created_at.elapsed().as_millis() as u64,
                participating_nodes: self
                    .task
                    .subtasks
                    .iter()
                    .flat_map(|s| s.attempted_nodes.iter().cloned())
                    .collect(),
            };
            if let Err(error) = history.append(&record) {
                tracing::warn!(task_id = %self.task.id, error = %error, "task history append failed");
            }
        }
    }
}

/// Sleep until an optional deadline; pend forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
