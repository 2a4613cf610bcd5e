use strsim::generic_levenshtein;

use crate::scorer::MetricScorer;
use crate::scorers::tokenize::words;

/// Translation edit rate, reported as `1 - min(TER, 1)` so that higher is better.
///
/// Edits are word insertions, deletions and substitutions; block shifts are not
/// searched for.
pub struct TerScorer;

pub fn translation_edit_rate(candidate: &str, reference: &str) -> Option<f64> {
    let cand = words(candidate);
    let refs = words(reference);
    if refs.is_empty() {
        return None;
    }
    let edits = generic_levenshtein(&cand, &refs);
    Some(edits as f64 / refs.len() as f64)
}

impl MetricScorer for TerScorer {
    fn name(&self) -> &'static str {
        "ter"
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        if words(candidate).is_empty() {
            return 0.0;
        }
        match translation_edit_rate(candidate, reference) {
            Some(ter) => 1.0 - ter.min(1.0),
            None => 0.0,
        }
    }
}
