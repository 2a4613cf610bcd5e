use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scorer::MetricScorer;
use crate::scorers::{
    bleu::BleuScorer,
    chrf::ChrfScorer,
    exact::ExactMatchScorer,
    levenshtein::LevenshteinScorer,
    rouge::{RougeLScorer, RougeNScorer},
    ter::TerScorer,
};
use evallab_types::Interaction;

/// One requested check: a unique name plus what to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: CheckKind,
    /// Pass/fail cut-off on the normalized score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Weight in the record's overall score.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Deterministic {
        metric: Metric,
        #[serde(default)]
        reference: ReferenceSource,
    },
    Judge {
        /// Built-in rubric name, or a label for custom `criteria`.
        rubric: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        criteria: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requires_context: Option<bool>,
    },
    Hallucination {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_confidence: Option<f64>,
    },
}

impl CheckSpec {
    fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            threshold: None,
            weight: default_weight(),
            enabled: true,
        }
    }

    pub fn deterministic(name: impl Into<String>, metric: Metric) -> Self {
        Self::new(
            name,
            CheckKind::Deterministic {
                metric,
                reference: ReferenceSource::default(),
            },
        )
    }

    /// A judge check using rubric `rubric`; for built-in rubrics that is all
    /// that is needed.
    pub fn judge(name: impl Into<String>, rubric: impl Into<String>) -> Self {
        Self::new(
            name,
            CheckKind::Judge {
                rubric: rubric.into(),
                criteria: None,
                requires_context: None,
            },
        )
    }

    pub fn hallucination(name: impl Into<String>) -> Self {
        Self::new(
            name,
            CheckKind::Hallucination {
                min_confidence: None,
            },
        )
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_reference(mut self, source: ReferenceSource) -> Self {
        if let CheckKind::Deterministic { reference, .. } = &mut self.kind {
            *reference = source;
        }
        self
    }

    pub fn with_criteria(mut self, text: impl Into<String>) -> Self {
        if let CheckKind::Judge { criteria, .. } = &mut self.kind {
            *criteria = Some(text.into());
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Hallucination scores measure unsupported content, so smaller is better.
    pub fn lower_is_better(&self) -> bool {
        matches!(self.kind, CheckKind::Hallucination { .. })
    }
}

/// Deterministic metrics, each backed by a [`MetricScorer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "rouge_1")]
    Rouge1,
    #[serde(rename = "rouge_2")]
    Rouge2,
    #[serde(rename = "rouge_l")]
    RougeL,
    #[serde(rename = "bleu")]
    Bleu,
    #[serde(rename = "chrf")]
    Chrf,
    #[serde(rename = "ter")]
    Ter,
    #[serde(rename = "levenshtein")]
    Levenshtein,
    #[serde(rename = "exact_match")]
    ExactMatch,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::Rouge1,
        Metric::Rouge2,
        Metric::RougeL,
        Metric::Bleu,
        Metric::Chrf,
        Metric::Ter,
        Metric::Levenshtein,
        Metric::ExactMatch,
    ];

    pub fn scorer(&self) -> &'static dyn MetricScorer {
        const ROUGE_1: RougeNScorer = RougeNScorer::unigram();
        const ROUGE_2: RougeNScorer = RougeNScorer::bigram();
        const CHRF: ChrfScorer = ChrfScorer::new();
        match self {
            Metric::Rouge1 => &ROUGE_1,
            Metric::Rouge2 => &ROUGE_2,
            Metric::RougeL => &RougeLScorer,
            Metric::Bleu => &BleuScorer,
            Metric::Chrf => &CHRF,
            Metric::Ter => &TerScorer,
            Metric::Levenshtein => &LevenshteinScorer,
            Metric::ExactMatch => &ExactMatchScorer,
        }
    }
}

impl MetricScorer for Metric {
    fn name(&self) -> &'static str {
        self.scorer().name()
    }

    fn score(&self, candidate: &str, reference: &str) -> f64 {
        self.scorer().score(candidate, reference)
    }
}

/// Which interaction field a deterministic check compares the response with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    #[default]
    Context,
    Question,
    Reference,
}

impl ReferenceSource {
    pub fn text<'a>(&self, interaction: &'a Interaction) -> &'a str {
        match self {
            ReferenceSource::Context => &interaction.context,
            ReferenceSource::Question => &interaction.question,
            ReferenceSource::Reference => interaction.reference.as_deref().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ReferenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceSource::Context => "context",
            ReferenceSource::Question => "question",
            ReferenceSource::Reference => "reference",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_match_serde() {
        for metric in Metric::ALL {
            let json = serde_json::to_value(metric).unwrap();
            assert_eq!(json.as_str().unwrap(), metric.name());
        }
    }

    #[test]
    fn test_every_metric_is_deterministic() {
        let pairs = [
            ("The Pacific Ocean is the largest.", "The Pacific is the largest ocean on Earth."),
            ("Trees produce oxygen.", "The Pacific Ocean is the largest."),
            ("ocean", "ocean"),
        ];
        for metric in Metric::ALL {
            for (candidate, reference) in pairs {
                let first = metric.score(candidate, reference);
                let second = metric.score(candidate, reference);
                assert_eq!(first, second, "{} changed between calls", metric.name());
                assert!((0.0..=1.0).contains(&first), "{} out of range", metric.name());
            }
        }
    }

    #[test]
    fn test_every_metric_scores_empty_input_zero() {
        let text = "The Pacific Ocean is the largest.";
        let empty_pairs = [("", ""), (text, ""), ("", text), ("  ", text), ("?!", "...")];
        for metric in Metric::ALL {
            for (candidate, reference) in empty_pairs {
                assert_eq!(
                    metric.score(candidate, reference),
                    0.0,
                    "{} on ({candidate:?}, {reference:?})",
                    metric.name()
                );
            }
        }
    }

    #[test]
    fn test_check_spec_from_json() {
        let spec: CheckSpec = serde_json::from_value(serde_json::json!({
            "name": "overlap",
            "kind": "deterministic",
            "metric": "rouge_l",
            "reference": "reference",
            "threshold": 0.3
        }))
        .unwrap();
        assert_eq!(
            spec,
            CheckSpec::deterministic("overlap", Metric::RougeL)
                .with_reference(ReferenceSource::Reference)
                .with_threshold(0.3)
        );
    }

    #[test]
    fn test_judge_spec_defaults() {
        let spec: CheckSpec = serde_json::from_value(serde_json::json!({
            "name": "relevance",
            "kind": "judge",
            "rubric": "response_relevance"
        }))
        .unwrap();
        assert_eq!(spec.weight, 1.0);
        assert!(spec.enabled);
        assert!(!spec.lower_is_better());
        assert!(CheckSpec::hallucination("h").lower_is_better());
    }

    #[test]
    fn test_reference_source_text() {
        let i = Interaction::new("q", "c", "r");
        assert_eq!(ReferenceSource::Context.text(&i), "c");
        assert_eq!(ReferenceSource::Reference.text(&i), "");
        let i = i.with_reference("gold");
        assert_eq!(ReferenceSource::Reference.text(&i), "gold");
    }
}
