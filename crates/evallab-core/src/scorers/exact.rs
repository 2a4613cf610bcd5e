use crate::scorer::MetricScorer;
use crate::scorers::tokenize::words;

/// 1.0 when both texts have the same words in the same order, ignoring case
/// and punctuation.
pub struct ExactMatchScorer;

impl MetricScorer for ExactMatchScorer {
	fn name(&self) -> &'static str {
		"exact_match"
	}

	fn score(&self, candidate: &str, reference: &str) -> f64 {
		let c = words(candidate);
		if c.is_empty() {
			return 0.0;
		}
		if c == words(reference) {
			1.0
		} else {
			0.0
		}
	}
}
