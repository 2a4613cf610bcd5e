use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{EvalError, ModelError};
use evallab_types::{CheckErrorKind, CheckResult, Interaction};

/// A response span the model considers unsupported by the context.
///
/// `start` and `end` are character (not byte) offsets into the response the
/// model was given, `end` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanPrediction {
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

impl SpanPrediction {
    pub fn new(start: usize, end: usize, confidence: f64) -> Self {
        Self {
            start,
            end,
            confidence,
        }
    }
}

/// Maximum input sizes, in whitespace-separated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLimits {
    pub max_context_tokens: usize,
    pub max_response_tokens: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_context_tokens: 3072,
            max_response_tokens: 1024,
        }
    }
}

/// An offline span-classification model.
///
/// `predict` is blocking and is always called from the blocking thread pool.
pub trait HallucinationModel: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn load(&self) -> Result<(), ModelError> {
        Ok(())
    }

    fn input_limits(&self) -> InputLimits {
        InputLimits::default()
    }

    fn predict(
        &self,
        context: &str,
        question: &str,
        response: &str,
    ) -> Result<Vec<SpanPrediction>, ModelError>;
}

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.8;
const MIN_SPAN_CHARS: usize = 5;

/// Keep the first `limit` whitespace tokens. Returns the text unchanged when
/// it already fits, and whether anything was cut.
pub fn truncate_tokens(text: &str, limit: usize) -> (String, bool) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= limit {
        return (text.to_string(), false);
    }
    (tokens[..limit].join(" "), true)
}

fn merge_spans(mut spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// 1..=5 band from the supported fraction of the response, 5 meaning clean.
fn severity_band(flagged: usize, accuracy: f64) -> u8 {
    if flagged == 0 {
        5
    } else if accuracy > 0.9 {
        4
    } else if accuracy > 0.7 {
        3
    } else if accuracy > 0.5 {
        2
    } else {
        1
    }
}

pub struct HallucinationDetector {
    model: Arc<dyn HallucinationModel>,
    limits: InputLimits,
    min_confidence: f64,
}

impl HallucinationDetector {
    /// Load the model once. Failure here is fatal for the whole run.
    pub fn load(model: Arc<dyn HallucinationModel>) -> Result<Self, EvalError> {
        model.load().map_err(|e| EvalError::ModelLoad {
            model: model.name().to_string(),
            reason: e.to_string(),
        })?;
        let limits = model.input_limits();
        debug!(model = model.name(), ?limits, "hallucination model loaded");
        Ok(Self {
            model,
            limits,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        })
    }

    pub fn with_limits(mut self, limits: InputLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Score = fraction of response characters inside unsupported spans.
    pub async fn detect(&self, interaction: &Interaction, min_confidence: Option<f64>) -> CheckResult {
        if !interaction.has_context() {
            return CheckResult::failed(
                CheckErrorKind::MissingInput,
                "hallucination detection requires context but the interaction has none",
            );
        }

        let (context, context_cut) =
            truncate_tokens(&interaction.context, self.limits.max_context_tokens);
        let (response, response_cut) =
            truncate_tokens(&interaction.response, self.limits.max_response_tokens);
        let partial = context_cut || response_cut;
        if partial {
            warn!(
                model = self.model.name(),
                context_cut, response_cut, "input truncated to model limits"
            );
        }

        let total_chars = response.chars().count();
        if total_chars == 0 {
            return CheckResult::scored(0.0, "empty response, nothing to verify")
                .with_partial(partial);
        }

        let model = self.model.clone();
        let question = interaction.question.clone();
        let text = response.clone();
        let predicted =
            tokio::task::spawn_blocking(move || model.predict(&context, &question, &text)).await;

        let predictions = match predicted {
            Ok(Ok(p)) => p,
            Ok(Err(ModelError::InputTooLong { tokens, limit })) => {
                return CheckResult::failed(
                    CheckErrorKind::InputTooLong,
                    format!("input of {tokens} tokens exceeds model limit of {limit}"),
                )
                .with_partial(partial);
            }
            Ok(Err(err)) => {
                return CheckResult::failed(CheckErrorKind::ModelError, err.to_string())
                    .with_partial(partial);
            }
            Err(join) => {
                return CheckResult::failed(
                    CheckErrorKind::Internal,
                    format!("hallucination model task failed: {join}"),
                );
            }
        };

        let cutoff = min_confidence.unwrap_or(self.min_confidence);
        let chars: Vec<char> = response.chars().collect();
        let kept: Vec<&SpanPrediction> = predictions
            .iter()
            .filter(|p| p.confidence >= cutoff)
            .filter(|p| p.start < p.end.min(total_chars))
            .filter(|p| {
                chars[p.start..p.end.min(total_chars)]
                    .iter()
                    .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation())
                    .count()
                    >= MIN_SPAN_CHARS
            })
            .collect();

        let merged = merge_spans(
            kept.iter()
                .map(|p| (p.start, p.end.min(total_chars)))
                .collect(),
        );
        let flagged_chars: usize = merged.iter().map(|(s, e)| e - s).sum();
        let score = flagged_chars as f64 / total_chars as f64;
        let band = severity_band(kept.len(), 1.0 - score);

        let spans: Vec<_> = kept
            .iter()
            .map(|p| {
                let end = p.end.min(total_chars);
                json!({
                    "start": p.start,
                    "end": end,
                    "confidence": p.confidence,
                    "text": chars[p.start..end].iter().collect::<String>().trim(),
                })
            })
            .collect();

        let explanation = if kept.is_empty() {
            "no unsupported spans detected".to_string()
        } else {
            format!(
                "{} unsupported span(s) covering {:.1}% of the response",
                kept.len(),
                score * 100.0
            )
        };

        CheckResult::scored(score, explanation)
            .with_partial(partial)
            .with_details(json!({
                "model": self.model.name(),
                "spans": spans,
                "band": band,
                "min_confidence": cutoff,
            }))
    }
}
