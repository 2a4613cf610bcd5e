use std::collections::HashMap;
use std::hash::Hash;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "did", "do", "does", "for", "from",
    "has", "have", "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "s",
    "that", "the", "their", "there", "they", "this", "to", "was", "we", "were", "what", "when",
    "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Lowercased alphanumeric runs. Everything else separates tokens.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// `words` reduced by [`stem`], so inflected forms compare equal.
pub fn stemmed_words(text: &str) -> Vec<String> {
    words(text).iter().map(|w| stem(w)).collect()
}

/// Light suffix stripping: plurals, then `-ing` / `-ed` when a stem with a
/// vowel of at least three characters remains. Not a full Porter stemmer.
pub fn stem(word: &str) -> String {
    if word.chars().count() <= 3 {
        return word.to_string();
    }
    let singular = if let Some(base) = word.strip_suffix("ies") {
        format!("{base}y")
    } else if let Some(base) = word.strip_suffix("sses") {
        format!("{base}ss")
    } else if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        word.to_string()
    } else {
        word.strip_suffix('s').unwrap_or(word).to_string()
    };
    for suffix in ["ing", "ed"] {
        if let Some(base) = singular.strip_suffix(suffix) {
            if base.chars().count() >= 3 && base.chars().any(|c| "aeiouy".contains(c)) {
                return base.to_string();
            }
        }
    }
    singular
}

/// `words` minus common function words.
pub fn content_words(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Counts of every contiguous window of length `n`.
pub fn ngram_counts<T: Eq + Hash>(items: &[T], n: usize) -> HashMap<&[T], usize> {
    let mut counts = HashMap::new();
    if n == 0 || items.len() < n {
        return counts;
    }
    for window in items.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
    }
    counts
}

/// Number of n-grams shared by both sides, each clipped to its count in `reference`.
pub fn clipped_overlap<T: Eq + Hash>(
    candidate: &HashMap<&[T], usize>,
    reference: &HashMap<&[T], usize>,
) -> usize {
    candidate
        .iter()
        .map(|(gram, count)| (*count).min(reference.get(gram).copied().unwrap_or(0)))
        .sum()
}

pub fn f_measure(precision: f64, recall: f64, beta: f64) -> f64 {
    let b2 = beta * beta;
    let denom = b2 * precision + recall;
    if denom <= 0.0 {
        return 0.0;
    }
    (1.0 + b2) * precision * recall / denom
}
