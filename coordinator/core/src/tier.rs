//! Hardware Tier Derivation
//!
//! Tier is a pure function of a node's declared capabilities and never changes
//! across heartbeats. The effective parameter count feeds the rule: declared
//! billions (or a figure parsed out of the model name when the declaration is
//! missing) scaled by the quantization multiplier.
//!
//! The rule, checked in order:
//!
//! - BASIC if effective params < 7 or tokens/s < 10
//! - PRO if effective params > 20 or tokens/s > 30
//! - MID otherwise

use serde::{Deserialize, Serialize};

use crate::protocol::NodeCapabilities;
use crate::tasks::Difficulty;

/// Coarse hardware classification used for task eligibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTier {
    /// Small models or slow generation.
    Basic,
    /// Mid-range capability.
    Mid,
    /// Large models or fast generation.
    Pro,
}

impl std::fmt::Display for NodeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Basic => "basic",
            Self::Mid => "mid",
            Self::Pro => "pro",
        };
        write!(f, "{label}")
    }
}

/// Effective parameter count in billions for tier purposes.
///
/// Uses the declared count when present, otherwise parses the model name.
/// Unknown counts are treated as 0 and land the node in BASIC.
#[must_use]
pub fn effective_params(caps: &NodeCapabilities) -> f64 {
    let declared = if caps.model_params > 0.0 {
        caps.model_params
    } else {
        params_from_model_name(&caps.model_name).unwrap_or(0.0)
    };
    declared * caps.quantization.multiplier()
}

/// Parse a parameter count out of a model name such as `llama3-70b` or
/// `qwen2.5-7B-instruct`. Returns the largest `<number>b` token found so
/// names like `mixtral-8x7b` resolve to the expert size.
#[must_use]
pub fn params_from_model_name(name: &str) -> Option<f64> {
    let lower = name.to_lowercase();
    let bytes = lower.as_bytes();
    let mut best: Option<f64> = None;

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'b' {
                // The 'b' must terminate the token ("7b-chat" yes, "16bit" no).
                let terminated = bytes
                    .get(i + 1)
                    .map_or(true, |c| !c.is_ascii_alphanumeric());
                if terminated {
                    if let Ok(value) = lower[start..i].parse::<f64>() {
                        best = Some(best.map_or(value, |b: f64| b.max(value)));
                    }
                }
            }
        } else {
            i += 1;
        }
    }

    best
}

/// Derive the tier for a capability snapshot.
#[must_use]
pub fn derive_tier(caps: &NodeCapabilities) -> NodeTier {
    let params = effective_params(caps);
    let tps = caps.tokens_per_second;

    if params < 7.0 || tps < 10.0 {
        NodeTier::Basic
    } else if params > 20.0 || tps > 30.0 {
        NodeTier::Pro
    } else {
        NodeTier::Mid
    }
}

/// Tiers allowed to serve a given difficulty.
#[must_use]
pub fn eligible_tiers(difficulty: Difficulty) -> &'static [NodeTier] {
    match difficulty {
        Difficulty::Simple => &[NodeTier::Basic, NodeTier::Mid, NodeTier::Pro],
        Difficulty::Complex => &[NodeTier::Mid, NodeTier::Pro],
        Difficulty::Advanced => &[NodeTier::Pro],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Quantization;

    fn caps(params: f64, tps: f64) -> NodeCapabilities {
        NodeCapabilities {
            model_name: "test-model".to_string(),
            model_params: params,
            quantization: Quantization::Q4,
            vram_gb: 16.0,
            tokens_per_second: tps,
            supports_vision: false,
            artificial_load_offset: 0,
        }
    }

    #[test]
    fn test_name_parsing() {
        assert_eq!(params_from_model_name("llama3-70b"), Some(70.0));
        assert_eq!(params_from_model_name("qwen2.5-7B-instruct"), Some(7.0));
        assert_eq!(params_from_model_name("mixtral-8x7b"), Some(7.0));
        assert_eq!(params_from_model_name("phi-2.7b"), Some(2.7));
        assert_eq!(params_from_model_name("gemma"), None);
        // "16bit" must not parse as 16 billion.
        assert_eq!(params_from_model_name("mystery-16bit"), None);
    }

    #[test]
    fn test_tier_rule_order() {
        // Small model stays BASIC no matter how fast it generates.
        assert_eq!(derive_tier(&caps(5.0, 40.0)), NodeTier::Basic);
        // Slow generation stays BASIC no matter the size.
        assert_eq!(derive_tier(&caps(34.0, 5.0)), NodeTier::Basic);
        // Large and fast enough is PRO.
        assert_eq!(derive_tier(&caps(34.0, 40.0)), NodeTier::Pro);
        // Fast generation alone promotes to PRO.
        assert_eq!(derive_tier(&caps(10.0, 35.0)), NodeTier::Pro);
        // Middle of the road.
        assert_eq!(derive_tier(&caps(10.0, 20.0)), NodeTier::Mid);
    }

    #[test]
    fn test_quantization_scales_params() {
        // 6B at F16 has 9.6B effective params: out of BASIC territory.
        let mut c = caps(6.0, 20.0);
        c.quantization = Quantization::F16;
        assert_eq!(derive_tier(&c), NodeTier::Mid);
        // Same model at Q4 stays BASIC.
        let c = caps(6.0, 20.0);
        assert_eq!(derive_tier(&c), NodeTier::Basic);
    }

    #[test]
    fn test_unknown_params_are_basic() {
        let mut c = caps(0.0, 50.0);
        c.model_name = "mystery".to_string();
        assert_eq!(derive_tier(&c), NodeTier::Basic);
    }

    #[test]
    fn test_name_fallback_feeds_tier() {
        let mut c = caps(0.0, 40.0);
        c.model_name = "llama3-70b".to_string();
        assert_eq!(derive_tier(&c), NodeTier::Pro);
    }

    #[test]
    fn test_tier_is_deterministic() {
        let c = caps(13.0, 25.0);
        let first = derive_tier(&c);
        for _ in 0..10 {
            assert_eq!(derive_tier(&c), first);
        }
    }

    #[test]
    fn test_eligibility_sets() {
        assert!(eligible_tiers(Difficulty::Simple).contains(&NodeTier::Basic));
        assert!(!eligible_tiers(Difficulty::Complex).contains(&NodeTier::Basic));
        assert_eq!(eligible_tiers(Difficulty::Advanced), &[NodeTier::Pro]);
    }
}
