//! Offline doubles and report assertions for use in `#[tokio::test]`s.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::check::CheckSpec;
use crate::error::{JudgeError, ModelError};
use crate::hallucination::{HallucinationModel, InputLimits, SpanPrediction};
use crate::oracle::JudgeOracle;
use crate::scorers::tokenize::content_words;
use evallab_types::EvaluationReport;

/// A judge that never leaves the process: it reads the rubric prompt back and
/// scores by content-word overlap.
///
/// - `context_relevance`: share of question words found in the context
/// - `faithfulness`: share of response words found in the context
/// - anything else: share of question words found in the response
///
/// A fraction `f` becomes the 1..=5 score `1 + round(4f)`.
#[derive(Debug, Clone, Default)]
pub struct HeuristicOracle {
    latency: Option<Duration>,
}

impl HeuristicOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

struct PromptParts<'a> {
    criterion: &'a str,
    question: &'a str,
    context: &'a str,
    response: &'a str,
}

fn section<'a>(prompt: &'a str, header: &str, next: Option<&str>) -> Option<&'a str> {
    let start = prompt.find(header)? + header.len();
    let rest = &prompt[start..];
    let end = match next {
        Some(n) => rest.find(n)?,
        None => rest.find("\n\nRate the response").unwrap_or(rest.len()),
    };
    Some(rest[..end].trim())
}

fn parse_prompt(prompt: &str) -> Option<PromptParts<'_>> {
    let criterion = section(prompt, "## Criterion: ", Some("\n"))?;
    let question = section(prompt, "## Question:", Some("## Context:"))?;
    let context = section(prompt, "## Context:", Some("## Response:"))?;
    let response = section(prompt, "## Response:", None)?;
    let context = if context == "(none provided)" { "" } else { context };
    Some(PromptParts {
        criterion,
        question,
        context,
        response,
    })
}

/// Share of `needles`' distinct content words present in `haystack`.
fn coverage(needles: &str, haystack: &str) -> f64 {
    let wanted: BTreeSet<String> = content_words(needles).into_iter().collect();
    if wanted.is_empty() {
        return 0.0;
    }
    let have: HashSet<String> = content_words(haystack).into_iter().collect();
    wanted.iter().filter(|w| have.contains(*w)).count() as f64 / wanted.len() as f64
}

#[async_trait]
impl JudgeOracle for HeuristicOracle {
    fn model(&self) -> &str {
        "heuristic"
    }

    async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let parts = parse_prompt(prompt)
            .ok_or_else(|| JudgeError::OracleUnavailable("unrecognized prompt layout".into()))?;
        let (fraction, what) = match parts.criterion {
            "context_relevance" => (coverage(parts.question, parts.context), "question terms found in context"),
            "faithfulness" => (coverage(parts.response, parts.context), "response terms supported by context"),
            _ => (coverage(parts.question, parts.response), "question terms addressed by response"),
        };
        let score = 1 + (4.0 * fraction).round() as u32;
        Ok(json!({
            "score": score,
            "explanation": format!("{:.0}% of {what}", fraction * 100.0),
        })
        .to_string())
    }
}

/// Returns the same spans for every input.
#[derive(Debug, Clone, Default)]
pub struct FixedSpanModel {
    spans: Vec<SpanPrediction>,
    limits: InputLimits,
    load_error: Option<String>,
}

impl FixedSpanModel {
    pub fn new(spans: Vec<SpanPrediction>) -> Self {
        Self {
            spans,
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: InputLimits) -> Self {
        self.limits = limits;
        self
    }

    /// A model whose `load` always fails with `reason`.
    pub fn failing_load(reason: impl Into<String>) -> Self {
        Self {
            load_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl HallucinationModel for FixedSpanModel {
    fn name(&self) -> &str {
        "fixed-spans"
    }

    fn load(&self) -> Result<(), ModelError> {
        match &self.load_error {
            Some(reason) => Err(ModelError::Load(reason.clone())),
            None => Ok(()),
        }
    }

    fn input_limits(&self) -> InputLimits {
        self.limits
    }

    fn predict(&self, _: &str, _: &str, _: &str) -> Result<Vec<SpanPrediction>, ModelError> {
        Ok(self.spans.clone())
    }
}

/// Every record carries exactly the enabled checks of `checks`.
pub fn assert_all_checks_present(report: &EvaluationReport, checks: &[CheckSpec]) -> Result<()> {
    let expected: BTreeSet<&str> = checks
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.name.as_str())
        .collect();
    for (idx, record) in report.records.iter().enumerate() {
        let actual: BTreeSet<&str> = record.results.keys().map(String::as_str).collect();
        if actual != expected {
            anyhow::bail!(
                "record {idx}: checks {:?} do not match requested {:?}",
                actual,
                expected
            );
        }
    }
    Ok(())
}

/// The mean score of `check` across the report is at least `min`.
pub fn assert_mean_score(report: &EvaluationReport, check: &str, min: f64) -> Result<()> {
    let summary = report.summary();
    let mean = summary
        .checks
        .get(check)
        .and_then(|c| c.mean_score)
        .ok_or_else(|| anyhow::anyhow!("check '{check}' has no scores\n{}", report.summary_table()))?;
    if mean < min {
        anyhow::bail!(
            "Evaluation failed: mean {check} {:.3} is below threshold {:.3}\n{}",
            mean,
            min,
            report.summary_table()
        );
    }
    Ok(())
}

pub fn assert_no_errors(report: &EvaluationReport) -> Result<()> {
    let summary = report.summary();
    if summary.errors > 0 {
        anyhow::bail!(
            "Evaluation failed: {} check(s) errored\n{}",
            summary.errors,
            report.summary_table()
        );
    }
    Ok(())
}
