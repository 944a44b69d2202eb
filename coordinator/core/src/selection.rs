//! Worker Selection Policy
//!
//! Scores eligible workers for a subtask and returns the best `k`. The score
//! rewards reputation and generation speed, penalises load and the queueing
//! delay that load implies:
//!
//! ```text
//! score = w_rep  * norm(reputation)
//!       + w_tps  * norm(tokens_per_second)
//!       - w_load * norm(effective_load)
//!       - w_wait * norm(effective_load / max(tps, eps))
//! ```
//!
//! All four terms are normalised by the eligible cohort's maximum so the
//! score is unitless. Ranking is fully deterministic: ties break by highest
//! reputation, then lowest load, then node id.

use std::collections::HashSet;

use crate::registry::{NodeId, NodeSnapshot};
use crate::tasks::Difficulty;
use crate::tier::eligible_tiers;

/// Guard against division by zero for nodes that declared no speed.
const TPS_EPSILON: f64 = 1e-3;

/// Weights for the selection score.
#[derive(Clone, Copy, Debug)]
pub struct SelectionWeights {
    /// Weight of normalised reputation.
    pub reputation: f64,
    /// Weight of normalised tokens per second.
    pub tps: f64,
    /// Weight of the effective-load penalty.
    pub load: f64,
    /// Weight of the expected-queue-delay penalty.
    pub wait: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            reputation: 0.4,
            tps: 0.3,
            load: 0.2,
            wait: 0.1,
        }
    }
}

/// Deterministic score-based worker selection.
#[derive(Clone, Debug, Default)]
pub struct SelectionPolicy {
    weights: SelectionWeights,
}

impl SelectionPolicy {
    /// Create a policy with the given weights.
    #[must_use]
    pub fn new(weights: SelectionWeights) -> Self {
        Self { weights }
    }

    /// Select up to `k` distinct workers for one subtask.
    ///
    /// Eligibility: online, tier within the difficulty's allowed set, not in
    /// `exclude`, and vision-capable when the work carries images. Returns
    /// fewer than `k` when the eligible cohort is smaller; the caller decides
    /// whether to proceed.
    #[must_use]
    pub fn pick(
        &self,
        candidates: &[NodeSnapshot],
        difficulty: Difficulty,
        k: usize,
        exclude: &[NodeId],
        needs_vision: bool,
    ) -> Vec<NodeSnapshot> {
        let required = eligible_tiers(difficulty);
        let excluded: HashSet<&NodeId> = exclude.iter().collect();

        let eligible: Vec<&NodeSnapshot> = candidates
            .iter()
            .filter(|n| n.online)
            .filter(|n| required.contains(&n.tier))
            .filter(|n| !excluded.contains(&n.node_id))
            .filter(|n| !needs_vision || n.capabilities.supports_vision)
            .collect();

        if eligible.is_empty() {
            return Vec::new();
        }

        let max_rep = cohort_max(eligible.iter().map(|n| n.reputation));
        let max_tps = cohort_max(eligible.iter().map(|n| n.capabilities.tokens_per_second));
        let max_load = cohort_max(eligible.iter().map(|n| f64::from(n.effective_load)));
        let max_delay = cohort_max(eligible.iter().map(|n| expected_delay(n)));

        let mut scored: Vec<(f64, &NodeSnapshot)> = eligible
            .into_iter()
            .map(|n| {
                let score = self.weights.reputation * ratio(n.reputation, max_rep)
                    + self.weights.tps * ratio(n.capabilities.tokens_per_second, max_tps)
                    - self.weights.load * ratio(f64::from(n.effective_load), max_load)
                    - self.weights.wait * ratio(expected_delay(n), max_delay);
                (score, n)
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.reputation
                        .partial_cmp(&a.reputation)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.effective_load.cmp(&b.effective_load))
                .then_with(|| a.node_id.as_str().cmp(b.node_id.as_str()))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

/// Seconds of queueing a new subtask would wait behind the node's load.
fn expected_delay(node: &NodeSnapshot) -> f64 {
    f64::from(node.effective_load) / node.capabilities.tokens_per_second.max(TPS_EPSILON)
}

fn cohort_max(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0_f64, f64::max)
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NodeCapabilities, Quantization};
    use crate::tier::NodeTier;

    fn snapshot(id: &str, tier: NodeTier, load: u32, rep: f64, tps: f64) -> NodeSnapshot {
        NodeSnapshot {
            node_id: NodeId::new(id),
            tier,
            capabilities: NodeCapabilities {
                model_name: format!("{id}-model"),
                model_params: 13.0,
                quantization: Quantization::Q4,
                vram_gb: 16.0,
                tokens_per_second: tps,
                supports_vision: false,
                artificial_load_offset: 0,
            },
            effective_load: load,
            reputation: rep,
            online: true,
        }
    }

    #[test]
    fn test_only_required_tiers_selected() {
        let nodes = vec![
            snapshot("basic", NodeTier::Basic, 0, 500.0, 100.0),
            snapshot("pro", NodeTier::Pro, 5, 100.0, 20.0),
        ];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Advanced, 3, &[], false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].node_id.as_str(), "pro");
    }

    #[test]
    fn test_offline_nodes_never_selected() {
        let mut offline = snapshot("off", NodeTier::Pro, 0, 900.0, 90.0);
        offline.online = false;
        let nodes = vec![offline, snapshot("on", NodeTier::Pro, 3, 100.0, 20.0)];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Simple, 2, &[], false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].node_id.as_str(), "on");
    }

    #[test]
    fn test_excluded_nodes_skipped() {
        let nodes = vec![
            snapshot("a", NodeTier::Pro, 0, 100.0, 40.0),
            snapshot("b", NodeTier::Pro, 0, 100.0, 40.0),
        ];
        let exclude = vec![NodeId::new("a")];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Simple, 2, &exclude, false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].node_id.as_str(), "b");
    }

    #[test]
    fn test_higher_reputation_wins_all_else_equal() {
        let nodes = vec![
            snapshot("low", NodeTier::Mid, 1, 50.0, 20.0),
            snapshot("high", NodeTier::Mid, 1, 200.0, 20.0),
        ];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 1, &[], false);
        assert_eq!(picked[0].node_id.as_str(), "high");
    }

    #[test]
    fn test_loaded_node_loses() {
        let nodes = vec![
            snapshot("busy", NodeTier::Mid, 8, 100.0, 20.0),
            snapshot("idle", NodeTier::Mid, 0, 100.0, 20.0),
        ];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 1, &[], false);
        assert_eq!(picked[0].node_id.as_str(), "idle");
    }

    #[test]
    fn test_artificial_offset_deprioritises_fallback_node() {
        // The fallback node's offset is already folded into effective_load.
        let nodes = vec![
            snapshot("fallback", NodeTier::Mid, 10, 100.0, 20.0),
            snapshot("real", NodeTier::Mid, 2, 100.0, 20.0),
        ];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 1, &[], false);
        assert_eq!(picked[0].node_id.as_str(), "real");
    }

    #[test]
    fn test_ties_break_by_node_id() {
        let nodes = vec![
            snapshot("zeta", NodeTier::Mid, 0, 100.0, 20.0),
            snapshot("alpha", NodeTier::Mid, 0, 100.0, 20.0),
        ];

        let policy = SelectionPolicy::default();
        for _ in 0..5 {
            let picked = policy.pick(&nodes, Difficulty::Complex, 1, &[], false);
            assert_eq!(picked[0].node_id.as_str(), "alpha");
        }
    }

    #[test]
    fn test_k_larger_than_cohort_returns_all() {
        let nodes = vec![
            snapshot("a", NodeTier::Mid, 0, 100.0, 20.0),
            snapshot("b", NodeTier::Mid, 1, 100.0, 20.0),
        ];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 10, &[], false);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_vision_requirement_filters() {
        let mut seeing = snapshot("seeing", NodeTier::Mid, 5, 50.0, 15.0);
        seeing.capabilities.supports_vision = true;
        let nodes = vec![snapshot("blind", NodeTier::Mid, 0, 500.0, 40.0), seeing];

        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 2, &[], true);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].node_id.as_str(), "seeing");
    }

    #[test]
    fn test_single_candidate_not_starved() {
        let nodes = vec![snapshot("only", NodeTier::Pro, 2, 100.0, 30.0)];
        let picked = SelectionPolicy::default().pick(&nodes, Difficulty::Complex, 1, &[], false);
        assert_eq!(picked.len(), 1);
    }
}
