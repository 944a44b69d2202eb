//! Persisted State
//!
//! Three small on-disk stores survive coordinator restarts:
//!
//! - reputation: an append-only JSON-lines event log plus a compacted
//!   snapshot of per-node scores
//! - node metadata: last-seen capabilities per node id
//! - task history: one observability record per finished task
//!
//! All schemas are additive-only JSON; unknown fields are ignored on read so
//! newer coordinators can load older state.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::NodeCapabilities;
use crate::registry::NodeId;
use crate::reputation::ReputationRecord;
use crate::tasks::{Difficulty, DivisionMode, TaskId, TaskStatus};

/// Compacted per-node reputation state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    /// Node the score belongs to.
    pub node_id: NodeId,
    /// Current score.
    pub score: f64,
    /// Lifetime completed-task count.
    pub tasks_completed: u64,
    /// When weekly decay last ran for this node.
    pub last_decay: DateTime<Utc>,
}

/// Reputation event log with periodic compaction.
#[derive(Debug)]
pub struct ReputationStore {
    log_path: PathBuf,
    snapshot_path: PathBuf,
}

impl ReputationStore {
    /// Open (creating if needed) the store under a state directory.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from creating the directory.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            log_path: dir.join("reputation.log"),
            snapshot_path: dir.join("reputation.json"),
        })
    }

    /// Append one event to the log.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the append.
    pub fn append(&self, record: &ReputationRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let line = serde_json::to_string(record).map_err(io::Error::other)?;
        writeln!(file, "{line}")
    }

    /// Load scores: the compacted snapshot plus every event appended since.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading the files.
    pub fn load(&self) -> io::Result<HashMap<NodeId, ScoreSnapshot>> {
        let mut scores: HashMap<NodeId, ScoreSnapshot> = HashMap::new();

        if self.snapshot_path.exists() {
            let data = fs::read_to_string(&self.snapshot_path)?;
            let entries: Vec<ScoreSnapshot> =
                serde_json::from_str(&data).map_err(io::Error::other)?;
            for entry in entries {
                scores.insert(entry.node_id.clone(), entry);
            }
        }

        if self.log_path.exists() {
            let reader = BufReader::new(File::open(&self.log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                // A torn final line from a crash is skipped, not fatal.
                let Ok(record) = serde_json::from_str::<ReputationRecord>(&line) else {
                    tracing::warn!("skipping undecodable reputation log line");
                    continue;
                };
                let entry =
                    scores
                        .entry(record.node_id.clone())
                        .or_insert_with(|| ScoreSnapshot {
                            node_id: record.node_id.clone(),
                            score: crate::reputation::INITIAL_SCORE,
                            tasks_completed: 0,
                            last_decay: record.timestamp,
                        });
                entry.score += record.points;
                if record.kind == crate::reputation::ReputationEventKind::TaskCompleted {
                    entry.tasks_completed += 1;
                }
            }
        }

        Ok(scores)
    }

    /// Write the compacted snapshot and truncate the log.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the writes.
    pub fn save_snapshot(&self, scores: &[ScoreSnapshot]) -> io::Result<()> {
        let data = serde_json::to_string_pretty(scores).map_err(io::Error::other)?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.snapshot_path)?;
        // Events up to this point are folded into the snapshot.
        fs::write(&self.log_path, b"")
    }
}

/// Last-seen registration data per node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Node identifier.
    pub node_id: NodeId,
    /// Account the node registered under.
    pub account_ref: String,
    /// Capabilities declared at the most recent registration.
    pub last_seen_capabilities: NodeCapabilities,
    /// When the node last registered.
    pub last_seen: DateTime<Utc>,
}

/// Registration metadata, one JSON document keyed by node id.
#[derive(Debug)]
pub struct NodeMetadataStore {
    path: PathBuf,
}

impl NodeMetadataStore {
    /// Open (creating if needed) the store under a state directory.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from creating the directory.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("nodes.json"),
        })
    }

    /// Load all records.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the read.
    pub fn load(&self) -> io::Result<HashMap<NodeId, NodeMetadata>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read_to_string(&self.path)?;
        let entries: Vec<NodeMetadata> = serde_json::from_str(&data).map_err(io::Error::other)?;
        Ok(entries
            .into_iter()
            .map(|m| (m.node_id.clone(), m))
            .collect())
    }

    /// Insert or refresh one node's record.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the rewrite.
    pub fn upsert(&self, metadata: NodeMetadata) -> io::Result<()> {
        let mut all = self.load()?;
        all.insert(metadata.node_id.clone(), metadata);
        let entries: Vec<&NodeMetadata> = all.values().collect();
        let data = serde_json::to_string_pretty(&entries).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)
    }
}

/// Observability record for one finished task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    /// Task identifier.
    pub task_id: TaskId,
    /// Division mode used.
    pub mode: DivisionMode,
    /// Classified difficulty, absent for direct-bypass tasks.
    pub difficulty: Option<Difficulty>,
    /// Wall-clock creation time.
    pub created: DateTime<Utc>,
    /// Terminal status.
    pub terminal_status: TaskStatus,
    /// Total task duration.
    pub duration_ms: u64,
    /// Every worker that attempted a subtask.
    pub participating_nodes: Vec<NodeId>,
}

/// Append-only task history log.
#[derive(Debug)]
pub struct TaskHistoryStore {
    path: PathBuf,
}

impl TaskHistoryStore {
    /// Open (creating if needed) the store under a state directory.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from creating the directory.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("tasks.log"),
        })
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the append.
    pub fn append(&self, record: &TaskHistoryRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record).map_err(io::Error::other)?;
        writeln!(file, "{line}")
    }

    /// Read the newest `limit` records.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from the read.
    pub fn recent(&self, limit: usize) -> io::Result<Vec<TaskHistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records: Vec<TaskHistoryRecord> = reader
            .lines()
            .filter_map(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(&l).ok())
            .collect();
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Quantization;
    use crate::reputation::ReputationEventKind;

    fn record(node: &str, kind: ReputationEventKind, points: f64) -> ReputationRecord {
        ReputationRecord {
            node_id: NodeId::new(node),
            kind,
            points,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_log_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::open(dir.path()).unwrap();

        store
            .append(&record("n1", ReputationEventKind::TaskCompleted, 10.0))
            .unwrap();
        store
            .append(&record("n1", ReputationEventKind::FastCompletion, 5.0))
            .unwrap();
        store
            .append(&record("n2", ReputationEventKind::Timeout, -20.0))
            .unwrap();

        let scores = store.load().unwrap();
        let n1 = &scores[&NodeId::new("n1")];
        assert!((n1.score - 115.0).abs() < 1e-9);
        assert_eq!(n1.tasks_completed, 1);
        let n2 = &scores[&NodeId::new("n2")];
        assert!((n2.score - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_compaction_folds_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReputationStore::open(dir.path()).unwrap();

        store
            .append(&record("n1", ReputationEventKind::TaskCompleted, 10.0))
            .unwrap();
        let loaded = store.load().unwrap();
        let snapshots: Vec<ScoreSnapshot> = loaded.values().cloned().collect();
        store.save_snapshot(&snapshots).unwrap();

        // Log is empty now; the snapshot carries the state.
        let reloaded = store.load().unwrap();
        assert!((reloaded[&NodeId::new("n1")].score - 110.0).abs() < 1e-9);

        // New events land on top of the snapshot.
        store
            .append(&record("n1", ReputationEventKind::UptimeHour, 1.0))
            .unwrap();
        let again = store.load().unwrap();
        assert!((again[&NodeId::new("n1")].score - 111.0).abs() < 1e-9);
    }

    #[test]
    fn test_node_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeMetadataStore::open(dir.path()).unwrap();

        store
            .upsert(NodeMetadata {
                node_id: NodeId::new("n1"),
                account_ref: "acct-1".to_string(),
                last_seen_capabilities: NodeCapabilities {
                    model_name: "llama3-70b".to_string(),
                    model_params: 70.0,
                    quantization: Quantization::Q4,
                    vram_gb: 48.0,
                    tokens_per_second: 35.0,
                    supports_vision: false,
                    artificial_load_offset: 0,
                },
                last_seen: Utc::now(),
            })
            .unwrap();

        let all = store.load().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[&NodeId::new("n1")].last_seen_capabilities.model_name,
            "llama3-70b"
        );
    }

    #[test]
    fn test_task_history_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskHistoryStore::open(dir.path()).unwrap();

        for i in 0..5 {
            store
                .append(&TaskHistoryRecord {
                    task_id: TaskId::new(format!("t{i}")),
                    mode: DivisionMode::Subtasks,
                    difficulty: Some(Difficulty::Simple),
                    created: Utc::now(),
                    terminal_status: TaskStatus::Completed,
                    duration_ms: 100 + i,
                    participating_nodes: vec![NodeId::new("n1")],
                })
                .unwrap();
        }

        let recent = store.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].task_id, TaskId::new("t4"));
    }
}
