use crate::scorer::MetricScorer;
use crate::scorers::tokenize::{clipped_overlap, ngram_counts, words};

const MAX_ORDER: usize = 4;

/// Sentence-level BLEU against a single reference.
///
/// Uses orders up to 4 (fewer when the candidate is shorter), add-one smoothing
/// for orders above 1, and the standard brevity penalty.
pub struct BleuScorer;

impl MetricScorer for BleuScorer {
    fn name(&self) -> &'static str {
        "bleu"
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        let cand = words(candidate);
        let refs = words(reference);
        if cand.is_empty() || refs.is_empty() {
            return 0.0;
        }

        let max_order = MAX_ORDER.min(cand.len());
        let mut log_precision = 0.0f64;
        for n in 1..=max_order {
            let cand_grams = ngram_counts(&cand, n);
            let ref_grams = ngram_counts(&refs, n);
            let matches = clipped_overlap(&cand_grams, &ref_grams) as f64;
            let total = (cand.len() - n + 1) as f64;
            let precision = if n == 1 {
                matches / total
            } else {
                (matches + 1.0) / (total + 1.0)
            };
            if precision <= 0.0 {
                return 0.0;
            }
            log_precision += precision.ln();
        }

        let c = cand.len() as f64;
        let r = refs.len() as f64;
        let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };
        (brevity_penalty * (log_precision / max_order as f64).exp()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bleu_identical_is_one() {
        let s = BleuScorer.score(
            "the pacific is the largest ocean",
            "the pacific is the largest ocean",
        );
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bleu_disjoint_is_zero() {
        assert_eq!(BleuScorer.score("red green blue", "cats and dogs"), 0.0);
    }

    #[test]
    fn test_bleu_short_candidate_penalized() {
        let full = BleuScorer.score("the pacific ocean is large", "the pacific ocean is large");
        let short = BleuScorer.score("the pacific", "the pacific ocean is large");
        assert!(short < full);
        assert!(short > 0.0);
    }

    #[test]
    fn test_bleu_empty() {
        assert_eq!(BleuScorer.score("", "reference"), 0.0);
        assert_eq!(BleuScorer.score("candidate", ""), 0.0);
    }
}
