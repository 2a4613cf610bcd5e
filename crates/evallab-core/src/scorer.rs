/// A deterministic text-similarity metric.
///
/// Implementations are pure: the same inputs always produce the same score in
/// `[0, 1]`, and empty inputs score `0.0` instead of failing.
pub trait MetricScorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, candidate: &str, reference: &str) -> f64;
}
