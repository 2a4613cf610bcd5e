use crate::scorer::MetricScorer;
use crate::scorers::tokenize::{clipped_overlap, f_measure, ngram_counts};

/// Character n-gram F-score (chrF), orders 1..=6, beta = 2, whitespace ignored.
pub struct ChrfScorer {
    max_order: usize,
    beta: f64,
}

impl ChrfScorer {
    pub const fn new() -> Self {
        Self {
            max_order: 6,
            beta: 2.0,
        }
    }
}

impl Default for ChrfScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricScorer for ChrfScorer {
    fn name(&self) -> &'static str {
        "chrf"
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        let cand: Vec<char> = candidate.chars().filter(|c| !c.is_whitespace()).collect();
        let refs: Vec<char> = reference.chars().filter(|c| !c.is_whitespace()).collect();
        if cand.is_empty() || refs.is_empty() {
            return 0.0;
        }

        let mut precision_sum = 0.0;
        let mut recall_sum = 0.0;
        let mut orders = 0usize;
        for n in 1..=self.max_order {
            if cand.len() < n || refs.len() < n {
                break;
            }
            let cand_grams = ngram_counts(&cand, n);
            let ref_grams = ngram_counts(&refs, n);
            let overlap = clipped_overlap(&cand_grams, &ref_grams) as f64;
            precision_sum += overlap / (cand.len() - n + 1) as f64;
            recall_sum += overlap / (refs.len() - n + 1) as f64;
            orders += 1;
        }
        if orders == 0 {
            return 0.0;
        }
        f_measure(
            precision_sum / orders as f64,
            recall_sum / orders as f64,
            self.beta,
        )
        .clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrf_identical() {
        let s = ChrfScorer::new().score("Pacific Ocean", "Pacific Ocean");
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_chrf_tolerates_inflection() {
        let scorer = ChrfScorer::new();
        let close = scorer.score("oceans", "ocean");
        let far = scorer.score("forest", "ocean");
        assert!(close > far);
        assert!(close > 0.5);
    }

    #[test]
    fn test_chrf_whitespace_only() {
        assert_eq!(ChrfScorer::new().score("   ", "ocean"), 0.0);
    }
}
