//! Response Aggregation
//!
//! Combines completed subtask outputs into the final answer:
//!
//! - SUBTASKS: concatenate in subtask order, with a placeholder where a
//!   fragment failed
//! - CONSENSUS: word-set similarity vote; ties go to the reply from the
//!   highest-reputation producer
//! - CONTEXT: stitch window outputs, trimming the overlap region from every
//!   window except the first

use std::collections::HashSet;

use crate::config::CoordinatorConfig;
use crate::registry::NodeId;
use crate::reputation::ReputationEngine;
use crate::tasks::{DivisionMode, Subtask, SubtaskState};

/// Result of aggregation.
#[derive(Clone, Debug)]
pub struct AggregateOutcome {
    /// The combined answer.
    pub text: String,
    /// Consensus replies that clearly disagreed with the winning answer.
    /// Empty outside CONSENSUS mode.
    pub dissenters: Vec<NodeId>,
}

/// Combine subtask outputs according to the division mode.
#[must_use]
pub fn aggregate(
    mode: DivisionMode,
    subtasks: &[Subtask],
    cfg: &CoordinatorConfig,
    reputation: &ReputationEngine,
) -> AggregateOutcome {
    match mode {
        DivisionMode::Subtasks => AggregateOutcome {
            text: aggregate_ordered(subtasks),
            dissenters: Vec::new(),
        },
        DivisionMode::Consensus => {
            aggregate_consensus(subtasks, cfg.consensus_similarity_threshold, reputation)
        }
        DivisionMode::Context => AggregateOutcome {
            text: aggregate_context(subtasks, cfg.context_overlap_tokens),
            dissenters: Vec::new(),
        },
        DivisionMode::Direct => AggregateOutcome {
            text: subtasks
                .first()
                .map(|s| s.buffer.clone())
                .unwrap_or_default(),
            dissenters: Vec::new(),
        },
    }
}

/// Concatenate completed fragments in index order, marking gaps.
fn aggregate_ordered(subtasks: &[Subtask]) -> String {
    let completed: Vec<&Subtask> = subtasks
        .iter()
        .filter(|s| s.state == SubtaskState::Completed)
        .collect();

    if completed.len() == 1 && subtasks.len() == 1 {
        return completed[0].buffer.clone();
    }

    let mut parts = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        if subtask.state == SubtaskState::Completed {
            parts.push(subtask.buffer.trim().to_string());
        } else {
            parts.push(format!("[part {} unavailable]", subtask.index + 1));
        }
    }
    parts.join("\n\n")
}

/// Pick the modal consensus answer by average similarity to the other
/// replies.
fn aggregate_consensus(
    subtasks: &[Subtask],
    threshold: f64,
    reputation: &ReputationEngine,
) -> AggregateOutcome {
    let replies: Vec<&Subtask> = subtasks
        .iter()
        .filter(|s| s.state == SubtaskState::Completed)
        .collect();

    if replies.is_empty() {
        return AggregateOutcome {
            text: String::new(),
            dissenters: Vec::new(),
        };
    }
    if replies.len() == 1 {
        return AggregateOutcome {
            text: replies[0].buffer.clone(),
            dissenters: Vec::new(),
        };
    }

    let score_of = |reply: &Subtask| -> f64 {
        let others: Vec<&str> = replies
            .iter()
            .filter(|r| r.index != reply.index)
            .map(|r| r.buffer.as_str())
            .collect();
        let total: f64 = others
            .iter()
            .map(|other| word_set_similarity(&reply.buffer, other))
            .sum();
        total / others.len() as f64
    };

    let mut winner = replies[0];
    let mut winner_score = score_of(winner);

    for &reply in replies.iter().skip(1) {
        let score = score_of(reply);
        let better = score > winner_score + f64::EPSILON;
        let tied = (score - winner_score).abs() <= f64::EPSILON;
        let outranks = tied
            && producer_reputation(reply, reputation)
                > producer_reputation(winner, reputation);
        if better || outranks {
            winner = reply;
            winner_score = score;
        }
    }

    let dissenters: Vec<NodeId> = replies
        .iter()
        .filter(|r| r.index != winner.index)
        .filter(|r| word_set_similarity(&r.buffer, &winner.buffer) < threshold)
        .filter_map(|r| r.assigned_node.clone())
        .collect();

    let text = if winner_score < threshold && replies.len() >= 3 {
        format!("**Note: low consensus among nodes.**\n\n{}", winner.buffer)
    } else {
        winner.buffer.clone()
    };

    AggregateOutcome { text, dissenters }
}

fn producer_reputation(subtask: &Subtask, reputation: &ReputationEngine) -> f64 {
    subtask
        .assigned_node
        .as_ref()
        .map_or(0.0, |node| reputation.score(node))
}

/// Stitch overlapping window outputs into one document.
fn aggregate_context(subtasks: &[Subtask], overlap_tokens: usize) -> String {
    let mut ordered: Vec<&Subtask> = subtasks.iter().collect();
    ordered.sort_by_key(|s| s.index);

    let mut parts = Vec::with_capacity(ordered.len());
    for (position, subtask) in ordered.iter().enumerate() {
        if subtask.state != SubtaskState::Completed {
            parts.push(format!("[section {} unavailable]", subtask.index + 1));
            continue;
        }
        if position == 0 {
            parts.push(subtask.buffer.trim().to_string());
        } else {
            parts.push(trim_leading_tokens(&subtask.buffer, overlap_tokens));
        }
    }

    parts.retain(|p| !p.is_empty());
    parts.join("\n")
}

/// Drop the first `count` whitespace tokens, the region re-analysed from the
/// previous window.
fn trim_leading_tokens(text: &str, count: usize) -> String {
    text.split_whitespace()
        .skip(count)
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Jaccard similarity over lower-cased word sets.
#[must_use]
pub fn word_set_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.to_lowercase().split_whitespace().map(str::to_string).collect();
    let set_b: HashSet<String> = b.to_lowercase().split_whitespace().map(str::to_string).collect();

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(index: u32, node: &str, text: &str) -> Subtask {
        let mut s = Subtask::new(index, format!("fragment {index}"));
        s.state = SubtaskState::Completed;
        s.assigned_node = Some(NodeId::new(node));
        s.attempted_nodes = vec![NodeId::new(node)];
        s.buffer = text.to_string();
        s
    }

    fn failed(index: u32) -> Subtask {
        let mut s = Subtask::new(index, format!("fragment {index}"));
        s.state = SubtaskState::Failed;
        s
    }

    fn cfg() -> CoordinatorConfig {
        CoordinatorConfig::default()
    }

    #[test]
    fn test_ordered_concatenation() {
        let subtasks = vec![
            completed(0, "n1", "First part."),
            completed(1, "n1", "Second part."),
        ];
        let out = aggregate(
            DivisionMode::Subtasks,
            &subtasks,
            &cfg(),
            &ReputationEngine::in_memory(),
        );
        assert_eq!(out.text, "First part.\n\nSecond part.");
    }

    #[test]
    fn test_partial_gets_placeholder() {
        let subtasks = vec![completed(0, "n1", "First part."), failed(1)];
        let out = aggregate(
            DivisionMode::Subtasks,
            &subtasks,
            &cfg(),
            &ReputationEngine::in_memory(),
        );
        assert!(out.text.contains("First part."));
        assert!(out.text.contains("[part 2 unavailable]"));
    }

    #[test]
    fn test_consensus_majority_wins() {
        let subtasks = vec![
            completed(0, "n1", "Yes, one plus one equals two."),
            completed(1, "n2", "Yes, one plus one equals two."),
            completed(2, "n3", "No, it is three."),
        ];
        let out = aggregate(
            DivisionMode::Consensus,
            &subtasks,
            &cfg(),
            &ReputationEngine::in_memory(),
        );
        assert!(out.text.contains("equals two"));
        assert_eq!(out.dissenters, vec![NodeId::new("n3")]);
    }

    #[test]
    fn test_consensus_tie_breaks_on_reputation() {
        let reputation = ReputationEngine::in_memory();
        reputation.record(&NodeId::new("n2"), crate::reputation::ReputationEventKind::TaskCompleted);

        let subtasks = vec![
            completed(0, "n1", "alpha response"),
            completed(1, "n2", "omega response"),
        ];
        let out = aggregate(DivisionMode::Consensus, &subtasks, &cfg(), &reputation);
        assert_eq!(out.text, "omega response");
    }

    #[test]
    fn test_low_consensus_is_annotated() {
        let subtasks = vec![
            completed(0, "n1", "apples oranges pears"),
            completed(1, "n2", "violins cellos flutes"),
            completed(2, "n3", "granite basalt marble"),
        ];
        let out = aggregate(
            DivisionMode::Consensus,
            &subtasks,
            &cfg(),
            &ReputationEngine::in_memory(),
        );
        assert!(out.text.starts_with("**Note: low consensus"));
    }

    #[test]
    fn test_context_trims_overlap() {
        let mut config = cfg();
        config.context_overlap_tokens = 2;

        let subtasks = vec![
            completed(0, "n1", "one two three four"),
            completed(1, "n2", "three four five six"),
        ];
        let out = aggregate(
            DivisionMode::Context,
            &subtasks,
            &config,
            &ReputationEngine::in_memory(),
        );
        assert_eq!(out.text, "one two three four\nfive six");
    }

    #[test]
    fn test_context_failed_window_placeholder() {
        let subtasks = vec![completed(0, "n1", "analysis of part one"), failed(1)];
        let out = aggregate(
            DivisionMode::Context,
            &subtasks,
            &cfg(),
            &ReputationEngine::in_memory(),
        );
        assert!(out.text.contains("[section 2 unavailable]"));
    }

    #[test]
    fn test_similarity_bounds() {
        assert!((word_set_similarity("a b c", "a b c") - 1.0).abs() < 1e-9);
        assert!(word_set_similarity("a b c", "x y z").abs() < 1e-9);
        assert!(word_set_similarity("", "anything").abs() < 1e-9);
    }
}
