//! Coordinator Configuration
//!
//! Every tunable knob of the orchestration engine, with defaults that match
//! production behaviour and an environment override path (`IRIS_*` variables)
//! for the daemon.

use std::time::Duration;

use crate::selection::SelectionWeights;
use crate::tasks::Difficulty;

/// Per-difficulty task deadlines, anchored at request creation.
#[derive(Clone, Copy, Debug)]
pub struct DifficultyTimeouts {
    /// Deadline for SIMPLE tasks.
    pub simple: Duration,
    /// Deadline for COMPLEX tasks.
    pub complex: Duration,
    /// Deadline for ADVANCED tasks.
    pub advanced: Duration,
}

impl Default for DifficultyTimeouts {
    fn default() -> Self {
        Self {
            simple: Duration::from_secs(60),
            complex: Duration::from_secs(300),
            advanced: Duration::from_secs(600),
        }
    }
}

impl DifficultyTimeouts {
    /// Deadline for a given difficulty.
    #[must_use]
    pub fn for_difficulty(&self, difficulty: Difficulty) -> Duration {
        match difficulty {
            Difficulty::Simple => self.simple,
            Difficulty::Complex => self.complex,
            Difficulty::Advanced => self.advanced,
        }
    }
}

/// Coordinator configuration.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Interval workers are required to heartbeat at. The reaper removes
    /// nodes silent for three intervals.
    pub heartbeat_interval: Duration,
    /// Maximum dispatch attempts per subtask, including the first.
    pub max_attempts_per_subtask: u32,
    /// Number of identical replicas in CONSENSUS mode.
    pub consensus_replicas: usize,
    /// Window size in tokens for CONTEXT mode.
    pub context_window_tokens: usize,
    /// Overlap between consecutive CONTEXT windows, in tokens.
    pub context_overlap_tokens: usize,
    /// Budget for the external difficulty classifier before falling back to
    /// the local heuristic.
    pub classifier_timeout: Duration,
    /// Task deadlines by difficulty.
    pub difficulty_timeouts: DifficultyTimeouts,
    /// Weights for the worker selection score.
    pub selection_weights: SelectionWeights,
    /// Bound on buffered payload chunks per stream.
    pub stream_queue_capacity: usize,
    /// Lowest reputation a node can fall to.
    pub reputation_floor: f64,
    /// Optional cap on reputation growth.
    pub reputation_ceiling: Option<f64>,
    /// A completion faster than this fraction of the difficulty deadline
    /// earns the fast-completion bonus.
    pub fast_completion_ratio: f64,
    /// Multiplier applied to every score once a week.
    pub weekly_decay_factor: f64,
    /// Upper bound on subtasks created by division.
    pub max_subtasks_per_task: usize,
    /// Optional per-attempt deadline. The effective attempt budget is the
    /// smaller of this and the difficulty deadline.
    pub subtask_timeout: Option<Duration>,
    /// Similarity below this counts as disagreement in CONSENSUS voting.
    pub consensus_similarity_threshold: f64,
    /// Whether a clear consensus dissenter is debited reputation.
    pub penalize_consensus_dissent: bool,
    /// Attachment extensions handled by the external document processor
    /// instead of registered workers.
    pub direct_formats: Vec<String>,
    /// Deadline for the external document processor.
    pub direct_timeout: Duration,
    /// Final results larger than this fail integrity validation.
    pub max_result_bytes: usize,
    /// Grace period for a full worker send queue before the node is treated
    /// as lost.
    pub send_grace: Duration,
    /// How long terminal task views and closed streams are retained.
    pub task_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_attempts_per_subtask: 2,
            consensus_replicas: 3,
            context_window_tokens: 2048,
            context_overlap_tokens: 128,
            classifier_timeout: Duration::from_secs(5),
            difficulty_timeouts: DifficultyTimeouts::default(),
            selection_weights: SelectionWeights::default(),
            stream_queue_capacity: 256,
            reputation_floor: 10.0,
            reputation_ceiling: None,
            fast_completion_ratio: 0.5,
            weekly_decay_factor: 0.99,
            max_subtasks_per_task: 8,
            subtask_timeout: None,
            consensus_similarity_threshold: 0.3,
            penalize_consensus_dissent: false,
            direct_formats: vec!["pdf".to_string()],
            direct_timeout: Duration::from_secs(120),
            max_result_bytes: 1024 * 1024,
            send_grace: Duration::from_secs(2),
            task_retention: Duration::from_secs(600),
        }
    }
}

impl CoordinatorConfig {
    /// Build configuration from `IRIS_*` environment variables, keeping
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = env_u64("IRIS_HEARTBEAT_INTERVAL_S") {
            cfg.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("IRIS_MAX_ATTEMPTS_PER_SUBTASK") {
            cfg.max_attempts_per_subtask = n as u32;
        }
        if let Some(n) = env_u64("IRIS_CONSENSUS_REPLICAS") {
            cfg.consensus_replicas = n as usize;
        }
        if let Some(n) = env_u64("IRIS_CONTEXT_WINDOW_TOKENS") {
            cfg.context_window_tokens = n as usize;
        }
        if let Some(n) = env_u64("IRIS_CONTEXT_OVERLAP_TOKENS") {
            cfg.context_overlap_tokens = n as usize;
        }
        if let Some(secs) = env_u64("IRIS_CLASSIFIER_TIMEOUT_S") {
            cfg.classifier_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("IRIS_TIMEOUT_SIMPLE_S") {
            cfg.difficulty_timeouts.simple = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("IRIS_TIMEOUT_COMPLEX_S") {
            cfg.difficulty_timeouts.complex = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("IRIS_TIMEOUT_ADVANCED_S") {
            cfg.difficulty_timeouts.advanced = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("IRIS_STREAM_QUEUE_CAPACITY") {
            cfg.stream_queue_capacity = n as usize;
        }
        if let Some(v) = env_f64("IRIS_REPUTATION_FLOOR") {
            cfg.reputation_floor = v;
        }
        if let Some(v) = env_f64("IRIS_REPUTATION_CEILING") {
            cfg.reputation_ceiling = Some(v);
        }
        if let Some(v) = env_f64("IRIS_FAST_COMPLETION_RATIO") {
            cfg.fast_completion_ratio = v;
        }
        if let Some(v) = env_f64("IRIS_WEEKLY_DECAY_FACTOR") {
            cfg.weekly_decay_factor = v;
        }
        if let Some(n) = env_u64("IRIS_MAX_SUBTASKS_PER_TASK") {
            cfg.max_subtasks_per_task = n as usize;
        }
        if let Some(secs) = env_u64("IRIS_SUBTASK_TIMEOUT_S") {
            cfg.subtask_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(v) = env_f64("IRIS_SELECTION_W_REP") {
            cfg.selection_weights.reputation = v;
        }
        if let Some(v) = env_f64("IRIS_SELECTION_W_TPS") {
            cfg.selection_weights.tps = v;
        }
        if let Some(v) = env_f64("IRIS_SELECTION_W_LOAD") {
            cfg.selection_weights.load = v;
        }
        if let Some(v) = env_f64("IRIS_SELECTION_W_WAIT") {
            cfg.selection_weights.wait = v;
        }
        if let Ok(formats) = std::env::var("IRIS_DIRECT_FORMATS") {
            cfg.direct_formats = formats
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("IRIS_PENALIZE_CONSENSUS_DISSENT") {
            cfg.penalize_consensus_dissent = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }

    /// A node silent for this long is reaped and its subtasks reassigned.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }

    /// Effective per-attempt deadline for a difficulty.
    #[must_use]
    pub fn attempt_timeout(&self, difficulty: Difficulty) -> Duration {
        let task_timeout = self.difficulty_timeouts.for_difficulty(difficulty);
        match self.subtask_timeout {
            Some(limit) => limit.min(task_timeout),
            None => task_timeout,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(45));
        assert_eq!(cfg.max_attempts_per_subtask, 2);
        assert_eq!(cfg.consensus_replicas, 3);
        assert_eq!(cfg.stream_queue_capacity, 256);
        assert!((cfg.reputation_floor - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_subtasks_per_task, 8);
    }

    #[test]
    fn test_difficulty_deadlines() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(
            cfg.difficulty_timeouts.for_difficulty(Difficulty::Simple),
            Duration::from_secs(60)
        );
        assert_eq!(
            cfg.difficulty_timeouts.for_difficulty(Difficulty::Advanced),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_attempt_timeout_is_min() {
        let mut cfg = CoordinatorConfig::default();
        assert_eq!(
            cfg.attempt_timeout(Difficulty::Simple),
            Duration::from_secs(60)
        );

        cfg.subtask_timeout = Some(Duration::from_secs(30));
        assert_eq!(
            cfg.attempt_timeout(Difficulty::Simple),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.attempt_timeout(Difficulty::Advanced),
            Duration::from_secs(30)
        );

        cfg.subtask_timeout = Some(Duration::from_secs(900));
        assert_eq!(
            cfg.attempt_timeout(Difficulty::Simple),
            Duration::from_secs(60)
        );
    }
}
