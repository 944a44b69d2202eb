//! Coordinator Core - Request Orchestration for the Iris Inference Network
//!
//! This crate is the headless heart of the Iris coordinator: given an
//! inbound inference request it classifies difficulty, selects workers from
//! a live registry, dispatches subtasks over persistent frame channels,
//! multiplexes streaming chunks back to the user, aggregates multi-worker
//! results, enforces deadlines with retry and reassignment, and keeps
//! reputation scores honest.
//!
//! # Architecture
//!
//! ```text
//!                       HTTP boundary (external)
//!            submit / poll / cancel / subscribe / snapshot
//!                              │
//! ┌────────────────────────────┼─────────────────────────────────┐
//! │                      Coordinator                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────────┐ │
//! │  │ Orchestrator│──▶│  Selection   │──▶│   NodeRegistry    │ │
//! │  │ (per-task   │   │  (scoring)   │   │ (connections,     │ │
//! │  │  drivers)   │   └──────────────┘   │  heartbeats, tier)│ │
//! │  │             │──▶ StreamManager     └─────────┬─────────┘ │
//! │  │             │──▶ ReputationEngine            │           │
//! │  └─────────────┘                                │           │
//! └───────────────────────────────────────────────── │ ──────────┘
//!                                                   │
//!                     frame channels (length-prefixed JSON + CRC32)
//!                                                   │
//!                                         volunteer worker nodes
//! ```
//!
//! # Ownership
//!
//! Each service exclusively owns its state: the registry owns node entries
//! and connection handles, the orchestrator owns tasks and subtasks, the
//! stream manager owns per-task frame queues, and the reputation engine
//! owns the score store. Everything else sees snapshots; cross-component
//! work travels over typed channels.
//!
//! # Quick Start
//!
//! ```ignore
//! use coordinator_core::{Coordinator, CoordinatorConfig, SubmitRequest, DivisionMode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Coordinator::builder(CoordinatorConfig::from_env()).build();
//!     let sweepers = coordinator.spawn_sweepers();
//!
//!     let task_id = coordinator.submit_task(SubmitRequest {
//!         prompt: "Summarise these three paragraphs...".to_string(),
//!         mode: DivisionMode::Subtasks,
//!         streaming: true,
//!         files: Vec::new(),
//!         account_ref: None,
//!     });
//!
//!     let mut stream = coordinator.subscribe_stream(&task_id).unwrap();
//!     while let Some(frame) = stream.next().await {
//!         // forward to the server-sent stream
//!     }
//!     drop(sweepers);
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`coordinator`]: the facade owning one instance of every service
//! - [`orchestrator`]: per-task state machine drivers
//! - [`registry`]: connected workers, heartbeats, tiers, the reaper
//! - [`selection`]: score-based worker selection
//! - [`classifier`]: difficulty classification with heuristic fallback
//! - [`divider`]: deterministic prompt division per mode
//! - [`aggregator`]: subtask / consensus / context result combination
//! - [`streaming`]: bounded per-task frame queues for live output
//! - [`reputation`]: event-driven scoring, decay, leaderboard
//! - [`protocol`]: worker frame vocabulary
//! - [`transport`]: frame codec and the TCP worker listener
//! - [`store`]: persisted reputation, node metadata, and task history
//! - [`auth`]: account-key validation
//! - [`direct`]: document bypass to an external processor

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod auth;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod direct;
pub mod divider;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod reputation;
pub mod selection;
pub mod store;
pub mod streaming;
pub mod tasks;
pub mod tier;
pub mod transport;

// Re-exports for convenience
pub use auth::{AccountDirectory, AccountRecord};
pub use classifier::{HeuristicClassifier, PromptClassifier};
pub use config::{CoordinatorConfig, DifficultyTimeouts};
pub use coordinator::{Coordinator, CoordinatorBuilder, NetworkSnapshot};
pub use direct::DirectProcessor;
pub use error::{CoordinatorError, ReasonCode};
pub use orchestrator::{Orchestrator, SubmitRequest, TaskCounts};
pub use protocol::{
    CoordinatorMessage, FileAttachment, NodeCapabilities, NodeMessage, Quantization,
    WorkerErrorKind,
};
pub use registry::{
    NodeId, NodeLostReason, NodeRegistry, NodeSnapshot, RegisterRequest, RegistryEvent,
};
pub use reputation::{LeaderboardEntry, ReputationEngine, ReputationEventKind};
pub use selection::{SelectionPolicy, SelectionWeights};
pub use streaming::{StreamFrame, StreamManager, StreamSubscription, TaskStream};
pub use tasks::{
    Difficulty, DivisionMode, Subtask, SubtaskState, Task, TaskId, TaskStatus, TaskView,
};
pub use tier::NodeTier;
pub use transport::WorkerListener;
