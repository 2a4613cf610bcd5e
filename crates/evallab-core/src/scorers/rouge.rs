use serde::Serialize;

use crate::scorer::MetricScorer;
use crate::scorers::tokenize::{clipped_overlap, f_measure, ngram_counts, stemmed_words};

/// Precision / recall / F1 of one ROUGE variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl RougeScore {
    const ZERO: RougeScore = RougeScore {
        precision: 0.0,
        recall: 0.0,
        f1: 0.0,
    };

    fn from_counts(overlap: usize, candidate_total: usize, reference_total: usize) -> Self {
        if overlap == 0 || candidate_total == 0 || reference_total == 0 {
            return Self::ZERO;
        }
        let precision = overlap as f64 / candidate_total as f64;
        let recall = overlap as f64 / reference_total as f64;
        RougeScore {
            precision,
            recall,
            f1: f_measure(precision, recall, 1.0),
        }
    }
}

/// N-gram overlap (ROUGE-N). Tokens are stemmed first, so "oceans" matches
/// "ocean".
pub fn rouge_n(candidate: &str, reference: &str, n: usize) -> RougeScore {
    if n == 0 {
        return RougeScore::ZERO;
    }
    let cand = stemmed_words(candidate);
    let refs = stemmed_words(reference);
    let cand_grams = ngram_counts(&cand, n);
    let ref_grams = ngram_counts(&refs, n);
    let overlap = clipped_overlap(&cand_grams, &ref_grams);
    RougeScore::from_counts(
        overlap,
        cand.len().saturating_sub(n - 1),
        refs.len().saturating_sub(n - 1),
    )
}

/// Longest-common-subsequence overlap (ROUGE-L).
pub fn rouge_l(candidate: &str, reference: &str) -> RougeScore {
    let cand = stemmed_words(candidate);
    let refs = stemmed_words(reference);
    RougeScore::from_counts(lcs_len(&cand, &refs), cand.len(), refs.len())
}

fn lcs_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

pub struct RougeNScorer {
    n: usize,
}

impl RougeNScorer {
    pub const fn unigram() -> Self {
        Self { n: 1 }
    }

    pub const fn bigram() -> Self {
        Self { n: 2 }
    }
}

impl MetricScorer for RougeNScorer {
    fn name(&self) -> &'static str {
        match self.n {
            1 => "rouge_1",
            2 => "rouge_2",
            _ => "rouge_n",
        }
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        rouge_n(candidate, reference, self.n).f1
    }
}

pub struct RougeLScorer;

impl MetricScorer for RougeLScorer {
    fn name(&self) -> &'static str {
        "rouge_l"
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        rouge_l(candidate, reference).f1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rouge1_identical() {
        let s = rouge_n("the cat sat on the mat", "the cat sat on the mat", 1);
        assert!((s.f1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge1_partial() {
        // candidate: the, cat (2 tokens) ; reference: the, cat, sat, down (4 tokens)
        let s = rouge_n("the cat", "the cat sat down", 1);
        assert!((s.precision - 1.0).abs() < 1e-9);
        assert!((s.recall - 0.5).abs() < 1e-9);
        assert!((s.f1 - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge2_needs_adjacent_pairs() {
        let s = rouge_n("cat the", "the cat", 2);
        assert_eq!(s.f1, 0.0);
    }

    #[test]
    fn test_rouge_l_subsequence() {
        // LCS of "a b c d" and "a c d" is 3.
        let s = rouge_l("a b c d", "a c d");
        assert!((s.precision - 0.75).abs() < 1e-9);
        assert!((s.recall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_inflected_forms_match() {
        assert_eq!(rouge_n("Oceans", "ocean", 1).f1, 1.0);
        assert_eq!(rouge_n("warming oceans", "warmed ocean", 2).f1, 1.0);
        assert_eq!(rouge_l("The oceans", "the ocean").f1, 1.0);
    }

    #[test]
    fn test_empty_inputs_score_zero() {
        assert_eq!(RougeLScorer.score("", ""), 0.0);
        assert_eq!(RougeNScorer::unigram().score("", "something"), 0.0);
        assert_eq!(RougeNScorer::bigram().score("one", "one"), 0.0);
    }
}
