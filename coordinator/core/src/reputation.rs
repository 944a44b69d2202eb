//! Reputation Engine
//!
//! Event-driven scoring of worker reliability. Scores start at 100, move by
//! fixed deltas per event, decay 1% weekly, and never fall below the
//! configured floor. Events for one node are applied in the order they are
//! recorded; the engine is the sole writer of the score store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::registry::NodeId;
use crate::store::{ReputationStore, ScoreSnapshot};

/// Score assigned to a node the first time it is seen.
pub const INITIAL_SCORE: f64 = 100.0;

/// What happened to a node, with its scoring delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEventKind {
    /// A subtask completed with a valid result (+10).
    TaskCompleted,
    /// Completion landed inside the fast window (+5).
    FastCompletion,
    /// An attempt or task deadline expired on this node (-20).
    Timeout,
    /// A result failed integrity validation (-50).
    InvalidResponse,
    /// One hour online (+1).
    UptimeHour,
    /// Registered but unreachable for an hour (-5 per hour).
    BrokenPromise,
    /// Weekly multiplicative decay (recorded with the applied delta).
    WeeklyDecay,
}

impl ReputationEventKind {
    /// Fixed delta for additive events. `BrokenPromise` scales by hours and
    /// `WeeklyDecay` is multiplicative; both record their actual delta.
    #[must_use]
    pub fn points(&self) -> f64 {
        match self {
            Self::TaskCompleted => 10.0,
            Self::FastCompletion => 5.0,
            Self::Timeout => -20.0,
            Self::InvalidResponse => -50.0,
            Self::UptimeHour => 1.0,
            Self::BrokenPromise => -5.0,
            Self::WeeklyDecay => 0.0,
        }
    }
}

/// One appended reputation event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReputationRecord {
    /// Node the event concerns.
    pub node_id: NodeId,
    /// Event category.
    pub kind: ReputationEventKind,
    /// Actual score delta applied.
    pub points: f64,
    /// Wall-clock time the event was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Leaderboard row.
#[derive(Clone, Debug, Serialize)]
pub struct LeaderboardEntry {
    /// Rank, starting at 1.
    pub rank: usize,
    /// Node identifier.
    pub node_id: NodeId,
    /// Current score.
    pub score: f64,
    /// Lifetime completed-task count.
    pub tasks_completed: u64,
    /// Model the node serves. The engine scores nodes, not models, so this
    /// is filled in by whoever holds the capability records.
    pub model_name: Option<String>,
}

struct NodeScore {
    score: f64,
    tasks_completed: u64,
    last_decay: DateTime<Utc>,
}

struct EngineInner {
    scores: HashMap<NodeId, NodeScore>,
    store: Option<ReputationStore>,
    floor: f64,
    ceiling: Option<f64>,
    decay_factor: f64,
}

impl EngineInner {
    fn clamp(&self, score: f64) -> f64 {
        let mut score = score.max(self.floor);
        if let Some(ceiling) = self.ceiling {
            score = score.min(ceiling);
        }
        score
    }

    fn entry(&mut self, node_id: &NodeId) -> &mut NodeScore {
        self.scores
            .entry(node_id.clone())
            .or_insert_with(|| NodeScore {
                score: INITIAL_SCORE,
                tasks_completed: 0,
                last_decay: Utc::now(),
            })
    }

    fn log(&self, node_id: &NodeId, kind: ReputationEventKind, points: f64) {
        if let Some(store) = &self.store {
            let record = ReputationRecord {
                node_id: node_id.clone(),
                kind,
                points,
                timestamp: Utc::now(),
            };
            if let Err(error) = store.append(&record) {
                tracing::warn!(node_id = %node_id, error = %error, "reputation log append failed");
            }
        }
    }
}

/// Shared, internally synchronised reputation engine.
#[derive(Clone)]
pub struct ReputationEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl ReputationEngine {
    /// Create an engine. When a store is supplied, existing state is loaded
    /// and every event is appended to its log.
    #[must_use]
    pub fn new(
        floor: f64,
        ceiling: Option<f64>,
        decay_factor: f64,
        store: Option<ReputationStore>,
    ) -> Self {
        let mut scores = HashMap::new();
        if let Some(store) = &store {
            match store.load() {
                Ok(loaded) => {
                    for (node_id, snapshot) in loaded {
                        scores.insert(
                            node_id,
                            NodeScore {
                                score: snapshot.score.max(floor),
                                tasks_completed: snapshot.tasks_completed,
                                last_decay: snapshot.last_decay,
                            },
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "reputation store load failed, starting fresh");
                }
            }
        }

        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                scores,
                store,
                floor,
                ceiling,
                decay_factor,
            })),
        }
    }

    /// Engine with default bounds and no persistence. For tests and embedded
    /// use.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(10.0, None, 0.99, None)
    }

    /// Record an additive event. Returns the new score.
    pub fn record(&self, node_id: &NodeId, kind: ReputationEventKind) -> f64 {
        let mut inner = self.inner.lock();
        let points = kind.points();
        let raw = {
            let current = inner.entry(node_id);
            current.score + points
        };
        let clamped = inner.clamp(raw);
        let entry = inner.entry(node_id);
        entry.score = clamped;
        if kind == ReputationEventKind::TaskCompleted {
            entry.tasks_completed += 1;
        }
        let score = entry.score;
        inner.log(node_id, kind, points);
        tracing::debug!(node_id = %node_id, kind = ?kind, points, score, "reputation event");
        score
    }

    /// Record hours of broken availability promise (-5 per hour).
    pub fn record_broken_promise(&self, node_id: &NodeId, hours: u32) -> f64 {
        let mut inner = self.inner.lock();
        let points = ReputationEventKind::BrokenPromise.points() * f64::from(hours.max(1));
        let raw = inner.entry(node_id).score + points;
        let clamped = inner.clamp(raw);
        inner.entry(node_id).score = clamped;
        inner.log(node_id, ReputationEventKind::BrokenPromise, points);
        clamped
    }

    /// Current score for a node. Unseen nodes report the initial score.
    #[must_use]
    pub fn score(&self, node_id: &NodeId) -> f64 {
        self.inner
            .lock()
            .scores
            .get(node_id)
            .map_or(INITIAL_SCORE, |s| s.score)
    }

    /// Apply weekly decay to every node whose last decay is a week or more
    /// old. Returns how many nodes were decayed.
    pub fn decay(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let week = ChronoDuration::weeks(1);
        let factor = inner.decay_factor;
        let floor = inner.floor;

        let due: Vec<NodeId> = inner
            .scores
            .iter()
            .filter(|(_, s)| now - s.last_decay >= week)
            .map(|(id, _)| id.clone())
            .collect();

        for node_id in &due {
            let (delta, _new_score) = {
                let entry = inner.scores.get_mut(node_id).expect("listed above");
                let decayed = (entry.score * factor).max(floor);
                let delta = decayed - entry.score;
                entry.score = decayed;
                entry.last_decay = now;
                (delta, decayed)
            };
            inner.log(node_id, ReputationEventKind::WeeklyDecay, delta);
        }

        if !due.is_empty() {
            tracing::info!(nodes = due.len(), "weekly reputation decay applied");
        }
        due.len()
    }

    /// Top `limit` nodes by score.
    #[must_use]
    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let inner = self.inner.lock();
        let mut rows: Vec<(NodeId, f64, u64)> = inner
            .scores
            .iter()
            .map(|(id, s)| (id.clone(), s.score, s.tasks_completed))
            .collect();

        rows.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });

        rows.into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (node_id, score, tasks_completed))| LeaderboardEntry {
                rank: i + 1,
                node_id,
                score,
                tasks_completed,
                model_name: None,
            })
            .collect()
    }

    /// Write the compacted snapshot, if a store is attached.
    pub fn flush(&self) {
        let inner = self.inner.lock();
        if let Some(store) = &inner.store {
            let snapshots: Vec<ScoreSnapshot> = inner
                .scores
                .iter()
                .map(|(id, s)| ScoreSnapshot {
                    node_id: id.clone(),
                    score: s.score,
                    tasks_completed: s.tasks_completed,
                    last_decay: s.last_decay,
                })
                .collect();
            if let Err(error) = store.save_snapshot(&snapshots) {
                tracing::warn!(error = %error, "reputation snapshot write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_deltas() {
        let engine = ReputationEngine::in_memory();
        let n = node("n1");

        assert!((engine.record(&n, ReputationEventKind::TaskCompleted) - 110.0).abs() < 1e-9);
        assert!((engine.record(&n, ReputationEventKind::FastCompletion) - 115.0).abs() < 1e-9);
        assert!((engine.record(&n, ReputationEventKind::Timeout) - 95.0).abs() < 1e-9);
        assert!((engine.record(&n, ReputationEventKind::UptimeHour) - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_floor_holds() {
        let engine = ReputationEngine::in_memory();
        let n = node("n1");

        for _ in 0..10 {
            engine.record(&n, ReputationEventKind::InvalidResponse);
        }
        assert!((engine.score(&n) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ceiling_caps_growth() {
        let engine = ReputationEngine::new(10.0, Some(120.0), 0.99, None);
        let n = node("n1");

        for _ in 0..10 {
            engine.record(&n, ReputationEventKind::TaskCompleted);
        }
        assert!((engine.score(&n) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_unseen_node_has_initial_score() {
        let engine = ReputationEngine::in_memory();
        assert!((engine.score(&node("ghost")) - INITIAL_SCORE).abs() < 1e-9);
    }

    #[test]
    fn test_broken_promise_scales_by_hours() {
        let engine = ReputationEngine::in_memory();
        let n = node("n1");
        engine.record_broken_promise(&n, 3);
        assert!((engine.score(&n) - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_weekly_decay() {
        let engine = ReputationEngine::in_memory();
        let n = node("n1");
        engine.record(&n, ReputationEventKind::TaskCompleted); // 110

        // Nothing due yet.
        assert_eq!(engine.decay(Utc::now()), 0);

        let next_week = Utc::now() + ChronoDuration::weeks(1) + ChronoDuration::hours(1);
        assert_eq!(engine.decay(next_week), 1);
        assert!((engine.score(&n) - 108.9).abs() < 1e-6);

        // Decay is once per week, not once per call.
        assert_eq!(engine.decay(next_week), 0);
    }

    #[test]
    fn test_leaderboard_order() {
        let engine = ReputationEngine::in_memory();
        engine.record(&node("b"), ReputationEventKind::TaskCompleted);
        engine.record(&node("a"), ReputationEventKind::Timeout);
        engine.record(&node("c"), ReputationEventKind::FastCompletion);

        let board = engine.leaderboard(10);
        assert_eq!(board.len(), 3);
        assert_eq!(board[0].node_id, node("b"));
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[2].node_id, node("a"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = ReputationStore::open(dir.path()).unwrap();
            let engine = ReputationEngine::new(10.0, None, 0.99, Some(store));
            engine.record(&node("n1"), ReputationEventKind::TaskCompleted);
            engine.record(&node("n1"), ReputationEventKind::FastCompletion);
            engine.flush();
        }

        let store = ReputationStore::open(dir.path()).unwrap();
        let engine = ReputationEngine::new(10.0, None, 0.99, Some(store));
        assert!((engine.score(&node("n1")) - 115.0).abs() < 1e-9);
    }
}
