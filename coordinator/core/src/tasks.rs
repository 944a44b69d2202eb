//! Task and Subtask State
//!
//! Data types for one user request and the units of work it divides into.
//! The orchestrator's per-task driver is the only writer of this state; other
//! components observe it through [`TaskView`] snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ReasonCode;
use crate::protocol::FileAttachment;
use crate::registry::NodeId;

/// Opaque task identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a request is divided across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivisionMode {
    /// Split the prompt into independent fragments.
    Subtasks,
    /// Send identical copies to several workers and vote.
    Consensus,
    /// Split an oversized document into overlapping windows.
    Context,
    /// Bypass registered workers entirely; an external processor answers.
    Direct,
}

/// Coarse prompt classification driving deadlines and tier eligibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Short questions, translations, direct answers.
    Simple,
    /// Analysis, summaries, comparisons.
    Complex,
    /// Code, proofs, multi-step reasoning.
    Advanced,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Simple => "simple",
            Self::Complex => "complex",
            Self::Advanced => "advanced",
        };
        write!(f, "{label}")
    }
}

/// Lifecycle status of a task. Exactly one terminal status is assigned, once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by the driver.
    Pending,
    /// Difficulty classification in progress.
    Classifying,
    /// Subtasks assigned to workers.
    Dispatched,
    /// At least one chunk has arrived.
    Streaming,
    /// All subtasks finished successfully.
    Completed,
    /// Some subtasks finished, some did not.
    Partial,
    /// The task failed.
    Failed,
    /// The task deadline expired.
    TimedOut,
    /// The caller cancelled the task.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the task lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Lifecycle state of a single subtask attempt chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    /// Created during division, not yet assigned.
    Pending,
    /// Sent to a worker, awaiting output.
    Assigned,
    /// Chunks are arriving.
    Streaming,
    /// A valid final result arrived.
    Completed,
    /// No attempt produced a valid result.
    Failed,
    /// A failed attempt is being handed to another worker.
    Reassigned,
    /// Abandoned because the parent task ended.
    Cancelled,
}

impl SubtaskState {
    /// Whether this state ends the subtask lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One unit of work dispatched to exactly one worker at a time.
#[derive(Clone, Debug)]
pub struct Subtask {
    /// Position within the parent task. Identity is `(task_id, index)`.
    pub index: u32,
    /// Fragment prompt sent to the worker.
    pub prompt: String,
    /// Worker currently responsible, none until dispatch.
    pub assigned_node: Option<NodeId>,
    /// Number of dispatch attempts so far.
    pub attempts: u32,
    /// Current lifecycle state.
    pub state: SubtaskState,
    /// Accumulated partial output. Replaced by the final payload on success.
    pub buffer: String,
    /// Workers that have already attempted this subtask, excluded from
    /// reassignment.
    pub attempted_nodes: Vec<NodeId>,
    /// When the current attempt was dispatched.
    pub attempt_started: Option<Instant>,
    /// Coordinator-observed duration of the successful attempt.
    pub execution_time_ms: Option<u64>,
}

impl Subtask {
    /// Create a pending subtask for a prompt fragment.
    #[must_use]
    pub fn new(index: u32, prompt: String) -> Self {
        Self {
            index,
            prompt,
            assigned_node: None,
            attempts: 0,
            state: SubtaskState::Pending,
            buffer: String::new(),
            attempted_nodes: Vec::new(),
            attempt_started: None,
            execution_time_ms: None,
        }
    }
}

/// One user request, owned by its driver for its whole lifetime.
#[derive(Clone, Debug)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Original prompt.
    pub prompt: String,
    /// Attached files.
    pub files: Vec<FileAttachment>,
    /// Division mode requested by the caller (may be overridden to `Direct`
    /// when a bypass attachment is present).
    pub mode: DivisionMode,
    /// Whether the caller subscribed to a live stream.
    pub streaming: bool,
    /// Account that submitted the request.
    pub account_ref: Option<String>,
    /// Classified difficulty, none until classification finishes.
    pub difficulty: Option<Difficulty>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Monotonic creation time anchoring all deadlines.
    pub created_at: Instant,
    /// Wall-clock creation time, for reporting only.
    pub created_wallclock: DateTime<Utc>,
    /// Units of work, in division order.
    pub subtasks: Vec<Subtask>,
    /// Machine-readable reason for PARTIAL and FAILED outcomes.
    pub reason: Option<ReasonCode>,
    /// Aggregated final answer.
    pub final_response: Option<String>,
}

impl Task {
    /// Create a pending task.
    #[must_use]
    pub fn new(
        id: TaskId,
        prompt: String,
        files: Vec<FileAttachment>,
        mode: DivisionMode,
        streaming: bool,
        account_ref: Option<String>,
    ) -> Self {
        Self {
            id,
            prompt,
            files,
            mode,
            streaming,
            account_ref,
            difficulty: None,
            status: TaskStatus::Pending,
            created_at: Instant::now(),
            created_wallclock: Utc::now(),
            subtasks: Vec::new(),
            reason: None,
            final_response: None,
        }
    }

    /// Assign a terminal status. A second terminal assignment is ignored so
    /// the first outcome always wins.
    pub fn finish(&mut self, status: TaskStatus, reason: Option<ReasonCode>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.reason = reason;
    }

    /// Snapshot for pollers and monitoring.
    #[must_use]
    pub fn view(&self) -> TaskView {
        let completed = self
            .subtasks
            .iter()
            .filter(|s| s.state == SubtaskState::Completed)
            .count() as u32;

        let partial = if self.status.is_terminal() || self.subtasks.is_empty() {
            None
        } else {
            let joined: Vec<&str> = self
                .subtasks
                .iter()
                .filter(|s| !s.buffer.is_empty())
                .map(|s| s.buffer.as_str())
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        };

        TaskView {
            task_id: self.id.clone(),
            mode: self.mode,
            difficulty: self.difficulty,
            status: self.status,
            subtasks_total: self.subtasks.len() as u32,
            subtasks_completed: completed,
            partial,
            final_response: self.final_response.clone(),
            reason: self.reason,
            created_at: self.created_wallclock,
            completed_at: if self.status.is_terminal() {
                Some(Utc::now())
            } else {
                None
            },
            participating_nodes: self
                .subtasks
                .iter()
                .flat_map(|s| s.attempted_nodes.iter().cloned())
                .collect(),
        }
    }
}

/// Read-only snapshot of a task, safe to hand across component boundaries.
#[derive(Clone, Debug, Serialize)]
pub struct TaskView {
    /// Task identifier.
    pub task_id: TaskId,
    /// Division mode actually used.
    pub mode: DivisionMode,
    /// Classified difficulty, if classification has run.
    pub difficulty: Option<Difficulty>,
    /// Current status.
    pub status: TaskStatus,
    /// Number of subtasks created by division.
    pub subtasks_total: u32,
    /// Number of subtasks that completed successfully.
    pub subtasks_completed: u32,
    /// In-flight partial output, none once terminal.
    pub partial: Option<String>,
    /// Aggregated final answer, present on COMPLETED and PARTIAL.
    pub final_response: Option<String>,
    /// Machine-readable reason for degraded outcomes.
    pub reason: Option<ReasonCode>,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Wall-clock completion time, none while running.
    pub completed_at: Option<DateTime<Utc>>,
    /// Every worker that attempted any subtask.
    pub participating_nodes: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            TaskId::generate(),
            "prompt".to_string(),
            Vec::new(),
            DivisionMode::Subtasks,
            false,
            None,
        )
    }

    #[test]
    fn test_task_id_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[tokio::test]
    async fn test_terminal_assigned_once() {
        let mut t = task();
        t.finish(TaskStatus::Completed, None);
        assert_eq!(t.status, TaskStatus::Completed);

        // A later failure must not overwrite the recorded outcome.
        t.finish(TaskStatus::Failed, Some(ReasonCode::Timeout));
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.reason.is_none());
    }

    #[tokio::test]
    async fn test_view_reports_progress() {
        let mut t = task();
        t.subtasks = vec![
            Subtask::new(0, "a".to_string()),
            Subtask::new(1, "b".to_string()),
        ];
        t.subtasks[0].state = SubtaskState::Completed;
        t.subtasks[0].buffer = "first".to_string();

        let view = t.view();
        assert_eq!(view.subtasks_total, 2);
        assert_eq!(view.subtasks_completed, 1);
        assert_eq!(view.partial.as_deref(), Some("first"));
        assert!(view.completed_at.is_none());
    }

    #[test]
    fn test_subtask_state_terminality() {
        assert!(SubtaskState::Completed.is_terminal());
        assert!(SubtaskState::Cancelled.is_terminal());
        assert!(!SubtaskState::Reassigned.is_terminal());
        assert!(!SubtaskState::Streaming.is_terminal());
    }
}
