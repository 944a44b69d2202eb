//! Difficulty Classification
//!
//! Labels an inbound prompt SIMPLE, COMPLEX, or ADVANCED. The primary path
//! hands the prompt to an external text classifier behind the
//! [`PromptClassifier`] seam; when that call errors or overruns its budget
//! the local keyword heuristic answers instead, so classification always
//! completes within bounded latency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::FileAttachment;
use crate::tasks::Difficulty;

/// External prompt classifier.
#[async_trait]
pub trait PromptClassifier: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Classify a prompt with its attachments.
    async fn classify(
        &self,
        prompt: &str,
        attachments: &[FileAttachment],
    ) -> anyhow::Result<Difficulty>;
}

/// Keyword cues for work that needs large models: code, math, proofs.
const ADVANCED_KEYWORDS: &[&str] = &[
    "code",
    "program",
    "function",
    "algorithm",
    "implement",
    "debug",
    "refactor",
    "class",
    "api",
    "sql",
    "query",
    "script",
    "exception",
    "equation",
    "integral",
    "derivative",
    "probability",
    "statistics",
    "proof",
    "prove",
    "theorem",
    "hypothesis",
    "deduce",
    "infer",
    "architecture",
    "design pattern",
    "optimize",
    "optimise",
    "benchmark",
];

/// Keyword cues for mid-weight analytical work.
const COMPLEX_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "evaluate",
    "compare",
    "comparison",
    "contrast",
    "summarize",
    "summarise",
    "summary",
    "explain",
    "describe",
    "enumerate",
    "identify",
    "classify",
    "categorize",
    "review",
    "critique",
    "plan",
    "strategy",
];

/// Keyword cues for quick direct answers.
const SIMPLE_KEYWORDS: &[&str] = &[
    "what is",
    "define",
    "definition",
    "translate",
    "translation",
    "how much",
    "how many",
    "where",
    "when",
    "who",
    "yes or no",
    "true or false",
];

/// Local heuristic classifier. Always succeeds, never blocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    /// Difficulty score in `[0, 100]` from keywords, length, and attachments.
    #[must_use]
    pub fn score(prompt: &str, attachments: &[FileAttachment]) -> f64 {
        let lower = prompt.to_lowercase();
        let word_count = prompt.split_whitespace().count();

        let advanced_hits = count_hits(&lower, ADVANCED_KEYWORDS);
        let complex_hits = count_hits(&lower, COMPLEX_KEYWORDS);
        let simple_hits = count_hits(&lower, SIMPLE_KEYWORDS);

        let mut score = 0.0_f64;

        if advanced_hits > 0 {
            score += (advanced_hits as f64 * 15.0).min(40.0);
        } else if complex_hits > 0 {
            score += (complex_hits as f64 * 10.0).min(25.0);
        } else if simple_hits > 0 {
            score -= (simple_hits as f64 * 5.0).min(15.0);
        }

        if word_count > 500 {
            score += 30.0;
        } else if word_count > 200 {
            score += 20.0;
        } else if word_count > 100 {
            score += 10.0;
        } else if word_count < 20 {
            score -= 5.0;
        }

        if lower.contains("```") {
            score += 15.0;
        }

        if !attachments.is_empty() {
            score += 20.0;
        }

        score.clamp(0.0, 100.0)
    }

    /// Classify synchronously.
    #[must_use]
    pub fn classify_now(prompt: &str, attachments: &[FileAttachment]) -> Difficulty {
        let score = Self::score(prompt, attachments);
        if score >= 70.0 {
            Difficulty::Advanced
        } else if score >= 40.0 {
            Difficulty::Complex
        } else {
            Difficulty::Simple
        }
    }
}

#[async_trait]
impl PromptClassifier for HeuristicClassifier {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn classify(
        &self,
        prompt: &str,
        attachments: &[FileAttachment],
    ) -> anyhow::Result<Difficulty> {
        Ok(Self::classify_now(prompt, attachments))
    }
}

fn count_hits(lower: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| lower.contains(*kw)).count()
}

/// Classify through the external backend with a deadline, falling back to
/// the heuristic on error or timeout.
pub async fn classify_with_fallback(
    primary: Option<&Arc<dyn PromptClassifier>>,
    prompt: &str,
    attachments: &[FileAttachment],
    budget: Duration,
) -> Difficulty {
    if let Some(classifier) = primary {
        match tokio::time::timeout(budget, classifier.classify(prompt, attachments)).await {
            Ok(Ok(difficulty)) => {
                tracing::debug!(
                    classifier = classifier.name(),
                    difficulty = %difficulty,
                    "prompt classified"
                );
                return difficulty;
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    classifier = classifier.name(),
                    error = %error,
                    "classifier failed, using heuristic"
                );
            }
            Err(_) => {
                tracing::warn!(
                    classifier = classifier.name(),
                    budget_ms = budget.as_millis() as u64,
                    "classifier deadline expired, using heuristic"
                );
            }
        }
    }

    HeuristicClassifier::classify_now(prompt, attachments)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClassifier;

    #[async_trait]
    impl PromptClassifier for SlowClassifier {
        fn name(&self) -> &str {
            "slow"
        }

        async fn classify(
            &self,
            _prompt: &str,
            _attachments: &[FileAttachment],
        ) -> anyhow::Result<Difficulty> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Difficulty::Advanced)
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl PromptClassifier for FailingClassifier {
        fn name(&self) -> &str {
            "failing"
        }

        async fn classify(
            &self,
            _prompt: &str,
            _attachments: &[FileAttachment],
        ) -> anyhow::Result<Difficulty> {
            anyhow::bail!("backend unavailable")
        }
    }

    #[test]
    fn test_simple_prompts() {
        assert_eq!(
            HeuristicClassifier::classify_now("What is the capital of France?", &[]),
            Difficulty::Simple
        );
        assert_eq!(
            HeuristicClassifier::classify_now("Translate hello to Spanish", &[]),
            Difficulty::Simple
        );
    }

    #[test]
    fn test_complex_prompts() {
        let prompt = "Analyze the following quarterly report and compare revenue \
                      trends across regions, then summarize the main drivers of \
                      growth in a short paragraph for the board meeting. Identify \
                      which product lines deserve further review this year.";
        assert_eq!(
            HeuristicClassifier::classify_now(prompt, &[]),
            Difficulty::Complex
        );
    }

    #[test]
    fn test_advanced_prompts() {
        let prompt = "Implement a function that parses this grammar and prove \
                      the algorithm terminates. Include code with error handling \
                      and refactor the recursive descent into an iterative form \
                      so the benchmark numbers improve on deep inputs.";
        assert_eq!(
            HeuristicClassifier::classify_now(prompt, &[]),
            Difficulty::Advanced
        );
    }

    #[test]
    fn test_attachments_raise_score() {
        let attachment = FileAttachment {
            name: "doc.txt".to_string(),
            media_type: "text/plain".to_string(),
            size_bytes: 100,
            content_base64: String::new(),
        };
        let with = HeuristicClassifier::score("Review this please and explain", &[attachment]);
        let without = HeuristicClassifier::score("Review this please and explain", &[]);
        assert!(with > without);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_timeout() {
        let slow: Arc<dyn PromptClassifier> = Arc::new(SlowClassifier);
        let difficulty = classify_with_fallback(
            Some(&slow),
            "What is two plus two?",
            &[],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(difficulty, Difficulty::Simple);
    }

    #[tokio::test]
    async fn test_fallback_on_error() {
        let failing: Arc<dyn PromptClassifier> = Arc::new(FailingClassifier);
        let difficulty = classify_with_fallback(
            Some(&failing),
            "What is two plus two?",
            &[],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(difficulty, Difficulty::Simple);
    }

    #[tokio::test]
    async fn test_no_primary_uses_heuristic() {
        let difficulty =
            classify_with_fallback(None, "Define entropy", &[], Duration::from_secs(5)).await;
        assert_eq!(difficulty, Difficulty::Simple);
    }
}
