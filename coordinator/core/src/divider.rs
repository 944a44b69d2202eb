//! Prompt Division
//!
//! Splits one request into the subtask prompts its mode calls for. Division
//! is deterministic: the same prompt and configuration always produce the
//! same fragments, which keeps retries and tests reproducible.

use crate::config::CoordinatorConfig;
use crate::tasks::DivisionMode;

/// Divide a prompt according to the task's mode.
///
/// - `Subtasks`: independent fragments along paragraph, then sentence,
///   boundaries, capped at `max_subtasks_per_task`.
/// - `Consensus`: `consensus_replicas` identical copies.
/// - `Context`: overlapping windows of `context_window_tokens` tokens.
/// - `Direct`: a single synthetic fragment; the external processor answers.
#[must_use]
pub fn divide(prompt: &str, mode: DivisionMode, cfg: &CoordinatorConfig) -> Vec<String> {
    match mode {
        DivisionMode::Subtasks => split_fragments(prompt, cfg.max_subtasks_per_task),
        DivisionMode::Consensus => vec![prompt.to_string(); cfg.consensus_replicas.max(1)],
        DivisionMode::Context => context_windows(
            prompt,
            cfg.context_window_tokens,
            cfg.context_overlap_tokens,
        )
        .into_iter()
        .take(cfg.max_subtasks_per_task.max(1))
        .collect(),
        DivisionMode::Direct => vec![prompt.to_string()],
    }
}

/// Split a prompt into independent fragments.
///
/// Paragraph boundaries win when the prompt has at least two paragraphs;
/// otherwise sentence boundaries are tried. A prompt that yields fewer than
/// two fragments stays whole. Fragments beyond the cap are merged into the
/// last one so no text is dropped.
#[must_use]
pub fn split_fragments(prompt: &str, max_fragments: usize) -> Vec<String> {
    let max_fragments = max_fragments.max(1);

    let paragraphs: Vec<String> = prompt
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    let fragments = if paragraphs.len() >= 2 {
        paragraphs
    } else {
        let sentences = split_sentences(prompt);
        if sentences.len() >= 2 {
            sentences
        } else {
            return vec![prompt.trim().to_string()];
        }
    };

    cap_fragments(fragments, max_fragments)
}

/// Split text into sentences at `.`, `!`, and `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

fn cap_fragments(mut fragments: Vec<String>, max: usize) -> Vec<String> {
    if fragments.len() > max {
        let overflow: Vec<String> = fragments.split_off(max - 1);
        fragments.push(overflow.join(" "));
    }
    fragments
}

/// Split an oversized document into overlapping windows of whitespace tokens.
///
/// Each window holds `window_tokens` tokens; consecutive windows share
/// `overlap` tokens so no boundary context is lost.
#[must_use]
pub fn context_windows(prompt: &str, window_tokens: usize, overlap: usize) -> Vec<String> {
    let tokens: Vec<&str> = prompt.split_whitespace().collect();
    let window_tokens = window_tokens.max(1);

    if tokens.len() <= window_tokens {
        return vec![prompt.trim().to_string()];
    }

    let step = window_tokens.saturating_sub(overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;

    while start < tokens.len() {
        let end = (start + window_tokens).min(tokens.len());
        windows.push(tokens[start..end].join(" "));
        if end == tokens.len() {
            break;
        }
        start += step;
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CoordinatorConfig {
        CoordinatorConfig::default()
    }

    #[test]
    fn test_paragraphs_win() {
        let prompt = "First paragraph about one topic.\n\nSecond paragraph entirely.\n\nThird.";
        let fragments = split_fragments(prompt, 8);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[2], "Third.");
    }

    #[test]
    fn test_sentences_when_single_paragraph() {
        let prompt = "Summarise the intro. List the key points. Draft a conclusion.";
        let fragments = split_fragments(prompt, 8);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], "Summarise the intro.");
    }

    #[test]
    fn test_indivisible_prompt_stays_whole() {
        let fragments = split_fragments("Just one short request without a period", 8);
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn test_cap_merges_overflow() {
        let prompt = "One. Two. Three. Four. Five. Six.";
        let fragments = split_fragments(prompt, 3);
        assert_eq!(fragments.len(), 3);
        // Nothing dropped: the tail carries the remaining sentences.
        assert!(fragments[2].contains("Three."));
        assert!(fragments[2].contains("Six."));
    }

    #[test]
    fn test_division_is_deterministic() {
        let prompt = "Alpha beta. Gamma delta. Epsilon zeta.";
        let a = split_fragments(prompt, 8);
        let b = split_fragments(prompt, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_decimal_numbers_do_not_split() {
        let fragments = split_sentences("The rate is 3.5 percent today. It was lower before.");
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].contains("3.5"));
    }

    #[test]
    fn test_consensus_replicates() {
        let fragments = divide("Is 1+1 = 2?", DivisionMode::Consensus, &cfg());
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f == "Is 1+1 = 2?"));
    }

    #[test]
    fn test_context_windows_overlap() {
        let words: Vec<String> = (0..100).map(|i| format!("w{i}")).collect();
        let prompt = words.join(" ");

        let windows = context_windows(&prompt, 40, 10);
        assert!(windows.len() >= 3);

        // The second window starts 30 tokens in, repeating the last 10.
        let first: Vec<&str> = windows[0].split_whitespace().collect();
        let second: Vec<&str> = windows[1].split_whitespace().collect();
        assert_eq!(first.len(), 40);
        assert_eq!(second[0], "w30");
        assert_eq!(first[30], "w30");
    }

    #[test]
    fn test_small_document_is_one_window() {
        let windows = context_windows("tiny document here", 2048, 128);
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_direct_is_single_fragment() {
        let fragments = divide("Read the attachment", DivisionMode::Direct, &cfg());
        assert_eq!(fragments.len(), 1);
    }
}
