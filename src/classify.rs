//! Title/body classifier deciding whether a task deserves a note artifact.
//!
//! Pure keyword scoring over the task title plus a couple of shape bonuses.
//! No network, no store access; the engine calls this exactly once per task
//! lifetime and persists the verdict.

use crate::config::RulesConfig;
use tracing::debug;

// ---------------------------------------------------------------------------
// Scoring weights
// ---------------------------------------------------------------------------

const POSITIVE_KEYWORD_WEIGHT: i32 = 2;
const NEGATIVE_KEYWORD_WEIGHT: i32 = -2;
const LONG_TITLE_BONUS: i32 = 1;
const SHORT_TITLE_PENALTY: i32 = -1;
const BODY_PRESENT_BONUS: i32 = 1;

/// Keyword scorer built once from [`RulesConfig`]; all matching is
/// case-insensitive substring containment against the title.
#[derive(Debug, Clone)]
pub struct Classifier {
    positive: Vec<String>,
    negative: Vec<String>,
    force_artifact: String,
    force_skip: String,
    long_title_words: usize,
    short_title_words: usize,
    threshold: i32,
}

impl Classifier {
    pub fn new(rules: &RulesConfig) -> Self {
        let normalize = |keywords: &[String]| -> Vec<String> {
            keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        };
        Self {
            positive: normalize(&rules.positive_keywords),
            negative: normalize(&rules.negative_keywords),
            force_artifact: rules.force_artifact_prefix.trim().to_lowercase(),
            force_skip: rules.force_skip_prefix.trim().to_lowercase(),
            long_title_words: rules.long_title_words,
            short_title_words: rules.short_title_words,
            threshold: rules.score_threshold,
        }
    }

    /// Whether the task should get a note artifact. Force markers short-circuit
    /// the scoring; the artifact marker wins when both are present.
    pub fn needs_artifact(&self, title: &str, body: &str) -> bool {
        let title_lower = title.to_lowercase();

        if !self.force_artifact.is_empty() && title_lower.contains(&self.force_artifact) {
            debug!(title, "classifier: forced artifact");
            return true;
        }
        if !self.force_skip.is_empty() && title_lower.contains(&self.force_skip) {
            debug!(title, "classifier: forced skip");
            return false;
        }

        let score = self.score(title, body);
        let verdict = score >= self.threshold;
        debug!(title, score, verdict, "classifier: scored");
        verdict
    }

    /// Raw additive score, exposed so the verdict is inspectable in logs and
    /// tests.
    pub fn score(&self, title: &str, body: &str) -> i32 {
        let title_lower = title.to_lowercase();
        let mut score = 0i32;

        for keyword in &self.positive {
            if title_lower.contains(keyword.as_str()) {
                score += POSITIVE_KEYWORD_WEIGHT;
            }
        }
        for keyword in &self.negative {
            if title_lower.contains(keyword.as_str()) {
                score += NEGATIVE_KEYWORD_WEIGHT;
            }
        }

        let words = title_lower.split_whitespace().count();
        if words >= self.long_title_words {
            score += LONG_TITLE_BONUS;
        }
        if words < self.short_title_words {
            score += SHORT_TITLE_PENALTY;
        }

        if !body.trim().is_empty() {
            score += BODY_PRESENT_BONUS;
        }

        score
    }
}
