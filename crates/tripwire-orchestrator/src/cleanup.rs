//! Raw output cleanup.
//!
//! Small local models emit ragged text: dangling half-sentences, repeated
//! lines, and self-directed exploratory chatter. Both variant outputs pass
//! through the same deterministic cleanup before they are compared, so that
//! downstream diffing reacts to behavioral divergence rather than decoding
//! noise.
//!
//! The pipeline, in order:
//! 1. split into lines, trim each, drop empties;
//! 2. if the text does not end in `.`, `!`, or `?`, truncate at the last such
//!    mark; with no mark at all, a multi-line text keeps only its first line;
//! 3. collapse immediately-adjacent duplicate lines (case-insensitive);
//! 4. drop lines opening with a configured interrogative/exploratory prefix;
//! 5. substitute a sentinel when nothing survives.
//!
//! The pass is applied until it reaches a fixpoint: dropping a prefixed line
//! can re-expose an unterminated tail, and a single pass over such input
//! would not be idempotent. Every pass shrinks its input (or yields the
//! sentinel, itself a fixpoint), so the iteration terminates.

use serde::{Deserialize, Serialize};

/// Terminal punctuation recognized by the truncation step.
const TERMINALS: [char; 3] = ['.', '!', '?'];

/// Configuration for the output cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
    /// Lines starting with any of these prefixes (case-insensitive) are
    /// dropped.
    #[serde(default = "default_drop_prefixes")]
    pub drop_prefixes: Vec<String>,

    /// Replacement text when cleanup leaves nothing.
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

fn default_drop_prefixes() -> Vec<String> {
    [
        "what ",
        "why ",
        "how ",
        "did you know",
        "let's explore",
        "question:",
        "q:",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sentinel() -> String {
    "no meaningful output".to_string()
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            drop_prefixes: default_drop_prefixes(),
            sentinel: default_sentinel(),
        }
    }
}

/// Cleans one raw model output. Deterministic and a pure function of its
/// input; `cleanup(cleanup(x)) == cleanup(x)` for any input.
#[must_use]
pub fn cleanup(raw: &str, config: &CleanupConfig) -> String {
    let mut current = cleanup_pass(raw, config);
    loop {
        let next = cleanup_pass(&current, config);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn cleanup_pass(raw: &str, config: &CleanupConfig) -> String {
    // 1. Trimmed, non-empty lines.
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    // 2. Terminal punctuation.
    let joined = lines.join("\n");
    let truncated = if joined.ends_with(TERMINALS) {
        joined
    } else {
        match joined.rfind(TERMINALS) {
            Some(idx) => joined[..=idx].to_string(),
            None if lines.len() > 1 => lines[0].to_string(),
            None => joined,
        }
    };

    // Truncation can cut mid-line; re-normalize before the line-wise steps.
    let mut lines: Vec<&str> = truncated
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    // 3. Collapse immediately-adjacent duplicates, keeping the first.
    lines.dedup_by(|a, b| a.to_lowercase() == b.to_lowercase());

    // 4. Drop configured interrogative/exploratory openers.
    lines.retain(|line| {
        let lower = line.to_lowercase();
        !config
            .drop_prefixes
            .iter()
            .any(|prefix| lower.starts_with(&prefix.to_lowercase()))
    });

    // 5. Sentinel.
    let result = lines.join("\n");
    if result.trim().is_empty() {
        config.sentinel.clone()
    } else {
        result
    }
}
