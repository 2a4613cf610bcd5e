use strsim::normalized_levenshtein;

use crate::scorer::MetricScorer;

/// Character edit similarity: `1 - distance / max_len`.
pub struct LevenshteinScorer;

impl MetricScorer for LevenshteinScorer {
    fn name(&self) -> &'static str {
        "levenshtein"
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        let c = candidate.trim();
        let r = reference.trim();
        if c.is_empty() || r.is_empty() {
            return 0.0;
        }
        normalized_levenshtein(c, r)
    }
}
