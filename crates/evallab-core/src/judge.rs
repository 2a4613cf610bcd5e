use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::JudgeError;
use crate::oracle::JudgeOracle;
use evallab_types::{CheckErrorKind, CheckResult, Interaction};

/// What the judge is asked to assess, and on which scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
	pub name: String,
	pub criteria: String,
	pub requires_context: bool,
	pub scale_min: u32,
	pub scale_max: u32,
}

const RESPONSE_RELEVANCE: &str = "Does the response address what the user asked?\n\
- 5: directly and precisely addresses the question\n\
- 4: mostly relevant with minor tangential information\n\
- 3: partially relevant, some off-topic content\n\
- 2: mostly irrelevant to the question\n\
- 1: completely irrelevant";

const RESPONSE_COMPLETENESS: &str = "Does the response fully answer the question?\n\
- 5: comprehensive answer covering all aspects\n\
- 4: good coverage with minor omissions\n\
- 3: covers the main points but misses important details\n\
- 2: incomplete, missing major aspects\n\
- 1: fails to answer the question";

const CONTEXT_RELEVANCE: &str = "Is the provided context relevant to the question, i.e. does it \
contain the information needed to answer it?\n\
- 5: the context fully covers what the question asks\n\
- 3: the context is related but only partly useful\n\
- 1: the context is unrelated to the question";

const FAITHFULNESS: &str = "Is every factual claim in the response supported by the context? \
Treat the context as the only source of truth.\n\
- 5: no unsupported claims\n\
- 4: minor inaccuracies that do not change the meaning\n\
- 3: some unverifiable claims but no clear fabrications\n\
- 2: notable fabricated or distorted claims\n\
- 1: significant fabrications";

impl Rubric {
	pub const BUILTIN: [&'static str; 4] = [
		"response_relevance",
		"response_completeness",
		"context_relevance",
		"faithfulness",
	];

	/// A custom rubric on the default 1..=5 scale.
	pub fn new(name: impl Into<String>, criteria: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			criteria: criteria.into(),
			requires_context: false,
			scale_min: 1,
			scale_max: 5,
		}
	}

	pub fn requires_context(mut self, yes: bool) -> Self {
		self.requires_context = yes;
		self
	}

	pub fn scale(mut self, min: u32, max: u32) -> Self {
		self.scale_min = min;
		self.scale_max = max;
		self
	}

	pub fn builtin(name: &str) -> Option<Self> {
		let rubric = match name {
			"response_relevance" => Self::new(name, RESPONSE_RELEVANCE),
			"response_completeness" => Self::new(name, RESPONSE_COMPLETENESS),
			"context_relevance" => Self::new(name, CONTEXT_RELEVANCE).requires_context(true),
			"faithfulness" => Self::new(name, FAITHFULNESS).requires_context(true),
			_ => return None,
		};
		Some(rubric)
	}

	/// Resolve a judge check's configuration. Explicit `criteria` define a
	/// custom rubric; otherwise `name` must be a built-in one.
	pub fn resolve(
		name: &str,
		criteria: Option<&str>,
		requires_context: Option<bool>,
	) -> Result<Self, String> {
		let mut rubric = match criteria {
			Some(text) if !text.trim().is_empty() => Self::new(name, text),
			_ => Self::builtin(name).ok_or_else(|| {
				format!(
					"unknown rubric '{}' (built-in: {}); provide `criteria` for a custom rubric",
					name,
					Self::BUILTIN.join(", ")
				)
			})?,
		};
		if let Some(flag) = requires_context {
			rubric.requires_context = flag;
		}
		Ok(rubric)
	}

	pub fn normalize(&self, raw: f64) -> f64 {
		let (min, max) = (self.scale_min as f64, self.scale_max as f64);
		if max <= min {
			return 0.0;
		}
		((raw - min) / (max - min)).clamp(0.0, 1.0)
	}

	fn in_scale(&self, raw: f64) -> bool {
		raw >= self.scale_min as f64 && raw <= self.scale_max as f64
	}
}

pub fn build_prompt(interaction: &Interaction, rubric: &Rubric) -> String {
	let context = if interaction.has_context() {
		interaction.context.trim()
	} else {
		"(none provided)"
	};
	format!(
		"You are an expert evaluator of AI assistant responses.\n\n\
		 ## Criterion: {name}\n{criteria}\n\n\
		 ## Question:\n{question}\n\n\
		 ## Context:\n{context}\n\n\
		 ## Response:\n{response}\n\n\
		 Rate the response on an integer scale from {min} (worst) to {max} (best).\n\
		 Reply ONLY with JSON of the form {{\"score\": <{min}-{max}>, \"explanation\": \"<one or two sentences>\"}}.",
		name = rubric.name,
		criteria = rubric.criteria,
		question = interaction.question.trim(),
		context = context,
		response = interaction.response.trim(),
		min = rubric.scale_min,
		max = rubric.scale_max,
	)
}

/// A score read from a judge reply, still on the rubric scale.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
	pub score: f64,
	pub explanation: String,
	/// Reply fields other than the score and explanation, e.g. `missing_aspects`.
	pub fields: Map<String, Value>,
}

fn fenced_json() -> Option<&'static Regex> {
	static RE: OnceLock<Option<Regex>> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
		.as_ref()
}

fn score_text() -> Option<&'static Regex> {
	static RE: OnceLock<Option<Regex>> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r#"(?i)\bscore\b["']?\s*[:=]?\s*(-?\d+(?:\.\d+)?)"#).ok())
		.as_ref()
}

fn number(value: &Value) -> Option<f64> {
	match value {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

fn verdict_from_object(value: &Value) -> Option<Verdict> {
	let obj = value.as_object()?;
	let (score_key, score) = match obj.get("score").and_then(number) {
		Some(score) => ("score", score),
		None => obj
			.iter()
			.filter(|(k, _)| k.ends_with("_score"))
			.find_map(|(k, v)| Some((k.as_str(), number(v)?)))?,
	};
	let explained = ["explanation", "reasoning", "reason"]
		.iter()
		.find_map(|k| Some((*k, obj.get(*k)?.as_str()?)))
		.or_else(|| {
			obj.iter()
				.filter(|(k, _)| k.ends_with("_explanation"))
				.find_map(|(k, v)| Some((k.as_str(), v.as_str()?)))
		});
	let explanation = explained.map(|(_, e)| e.to_string()).unwrap_or_default();
	let explanation_key = explained.map(|(k, _)| k);
	let fields = obj
		.iter()
		.filter(|(k, _)| k.as_str() != score_key && Some(k.as_str()) != explanation_key)
		.map(|(k, v)| (k.clone(), v.clone()))
		.collect();
	Some(Verdict {
		score,
		explanation,
		fields,
	})
}

/// Read a score and explanation out of a judge reply.
///
/// Tries the whole reply as JSON, then a fenced ```json block, then the
/// outermost `{...}`, then a plain-text `score: N`.
pub fn parse_verdict(raw: &str, rubric: &Rubric) -> Result<Verdict, JudgeError> {
	let text = raw.trim();

	let mut candidates: Vec<&str> = vec![text];
	if let Some(c) = fenced_json()
		.and_then(|re| re.captures(text))
		.and_then(|c| c.get(1))
	{
		candidates.push(c.as_str());
	}
	if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
		if start < end {
			candidates.push(&text[start..=end]);
		}
	}

	let verdict = candidates
		.into_iter()
		.filter_map(|c| serde_json::from_str::<Value>(c).ok())
		.find_map(|v| verdict_from_object(&v))
		.or_else(|| {
			let caps = score_text()?.captures(text)?;
			let score = caps.get(1)?.as_str().parse().ok()?;
			Some(Verdict {
				score,
				explanation: text.to_string(),
				fields: Map::new(),
			})
		})
		.ok_or_else(|| JudgeError::Parse("no score found in judge reply".to_string()))?;

	if !verdict.score.is_finite() || !rubric.in_scale(verdict.score) {
		return Err(JudgeError::Parse(format!(
			"score {} outside scale {}..={}",
			verdict.score, rubric.scale_min, rubric.scale_max
		)));
	}
	Ok(verdict)
}

fn preview(raw: &str) -> String {
	raw.chars().take(500).collect()
}

/// Runs rubric prompts against a shared oracle.
#[derive(Clone)]
pub struct JudgeAdapter {
	oracle: Arc<dyn JudgeOracle>,
	limiter: Arc<Semaphore>,
	retry_backoff: Duration,
}

impl JudgeAdapter {
	pub fn new(oracle: Arc<dyn JudgeOracle>) -> Self {
		Self {
			oracle,
			limiter: Arc::new(Semaphore::new(4)),
			retry_backoff: Duration::from_millis(500),
		}
	}

	/// Upper bound on oracle calls in flight across every interaction.
	pub fn max_concurrent(mut self, n: usize) -> Self {
		self.limiter = Arc::new(Semaphore::new(n.max(1)));
		self
	}

	pub fn retry_backoff(mut self, backoff: Duration) -> Self {
		self.retry_backoff = backoff;
		self
	}

	pub fn oracle(&self) -> &Arc<dyn JudgeOracle> {
		&self.oracle
	}

	async fn call(&self, prompt: &str) -> Result<String, JudgeError> {
		let _permit = self
			.limiter
			.acquire()
			.await
			.map_err(|_| JudgeError::OracleUnavailable("judge limiter closed".to_string()))?;
		self.oracle.complete(prompt).await
	}

	/// Judge one interaction. Never fails: every problem becomes an error
	/// result with a null score.
	pub async fn judge(&self, interaction: &Interaction, rubric: &Rubric) -> CheckResult {
		if rubric.requires_context && !interaction.has_context() {
			return CheckResult::failed(
				CheckErrorKind::MissingInput,
				format!("rubric '{}' requires context but the interaction has none", rubric.name),
			);
		}

		let prompt = build_prompt(interaction, rubric);
		let mut attempts = 0u32;
		let reply = loop {
			attempts += 1;
			match self.call(&prompt).await {
				Err(JudgeError::OracleUnavailable(msg)) if attempts == 1 => {
					warn!(rubric = %rubric.name, error = %msg, "judge oracle unavailable, retrying once");
					tokio::time::sleep(self.retry_backoff).await;
				}
				other => break other,
			}
		};

		let model = self.oracle.model().to_string();
		match reply {
			Ok(raw) => match parse_verdict(&raw, rubric) {
				Ok(verdict) => {
					debug!(rubric = %rubric.name, score = verdict.score, "judge verdict");
					let mut details = json!({
						"raw_score": verdict.score,
						"scale": [rubric.scale_min, rubric.scale_max],
						"attempts": attempts,
						"model": model,
					});
					if !verdict.fields.is_empty() {
						details["reply"] = Value::Object(verdict.fields);
					}
					CheckResult::scored(rubric.normalize(verdict.score), verdict.explanation)
						.with_details(details)
				}
				Err(err) => CheckResult::failed(CheckErrorKind::ParseError, err.to_string())
					.with_details(json!({
						"raw_reply": preview(&raw),
						"attempts": attempts,
						"model": model,
					})),
			},
			Err(err) => {
				let kind = match err {
					JudgeError::Parse(_) => CheckErrorKind::ParseError,
					JudgeError::OracleUnavailable(_) => CheckErrorKind::OracleUnavailable,
				};
				CheckResult::failed(kind, err.to_string())
					.with_details(json!({ "attempts": attempts, "model": model }))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::oracle::oracle_from_fn;

	fn rubric() -> Rubric {
		Rubric::builtin("response_relevance").unwrap()
	}

	#[test]
	fn test_parse_direct_json() {
		let v = parse_verdict(r#"{"score": 4, "explanation": "on topic"}"#, &rubric()).unwrap();
		assert_eq!(v.score, 4.0);
		assert_eq!(v.explanation, "on topic");
	}

	#[test]
	fn test_parse_fenced_and_embedded_json() {
		let fenced = "Here you go:\n```json\n{\"score\": \"3\", \"reasoning\": \"partly\"}\n```";
		let v = parse_verdict(fenced, &rubric()).unwrap();
		assert_eq!(v.score, 3.0);
		assert_eq!(v.explanation, "partly");

		let embedded = "Verdict {\"relevance_score\": 5, \"relevance_explanation\": \"exact\"} done";
		let v = parse_verdict(embedded, &rubric()).unwrap();
		assert_eq!(v.score, 5.0);
		assert_eq!(v.explanation, "exact");
	}

	#[test]
	fn test_parse_text_fallback() {
		let v = parse_verdict("The answer is fine. Score: 2", &rubric()).unwrap();
		assert_eq!(v.score, 2.0);
	}

	#[test]
	fn test_parse_rejects_garbage_and_out_of_scale() {
		assert!(matches!(parse_verdict("no idea", &rubric()), Err(JudgeError::Parse(_))));
		assert!(matches!(
			parse_verdict(r#"{"score": 9}"#, &rubric()),
			Err(JudgeError::Parse(_))
		));
	}

	#[test]
	fn test_normalize() {
		let r = rubric();
		assert_eq!(r.normalize(1.0), 0.0);
		assert_eq!(r.normalize(5.0), 1.0);
		assert!((r.normalize(4.0) - 0.75).abs() < 1e-9);
	}

	#[test]
	fn test_resolve_custom_and_unknown() {
		let r = Rubric::resolve("tone", Some("Is it polite?"), None).unwrap();
		assert_eq!(r.criteria, "Is it polite?");
		assert!(!r.requires_context);
		assert!(Rubric::resolve("tone", None, None).is_err());
		let r = Rubric::resolve("faithfulness", None, Some(false)).unwrap();
		assert!(!r.requires_context);
	}

	#[test]
	fn test_prompt_sections() {
		let i = Interaction::new("Where?", "", "Here.");
		let p = build_prompt(&i, &rubric());
		assert!(p.contains("## Criterion: response_relevance"));
		assert!(p.contains("## Question:\nWhere?"));
		assert!(p.contains("## Context:\n(none provided)"));
		assert!(p.contains("## Response:\nHere."));
	}

	#[tokio::test]
	async fn test_missing_context_skips_oracle() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let oracle = oracle_from_fn("count", move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			async { Ok(r#"{"score": 5}"#.to_string()) }
		});
		let adapter = JudgeAdapter::new(oracle);
		let result = adapter
			.judge(
				&Interaction::new("q", "  ", "r"),
				&Rubric::builtin("faithfulness").unwrap(),
			)
			.await;
		assert_eq!(result.error, Some(CheckErrorKind::MissingInput));
		assert_eq!(result.score, None);
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_unavailable_retried_once() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let oracle = oracle_from_fn("flaky", move |_| {
			let n = counter.fetch_add(1, Ordering::SeqCst);
			async move {
				if n == 0 {
					Err(JudgeError::OracleUnavailable("503".into()))
				} else {
					Ok(r#"{"score": 5, "explanation": "ok"}"#.to_string())
				}
			}
		});
		let adapter = JudgeAdapter::new(oracle).retry_backoff(Duration::from_millis(1));
		let result = adapter.judge(&Interaction::new("q", "c", "r"), &rubric()).await;
		assert_eq!(result.score, Some(1.0));
		assert_eq!(calls.load(Ordering::SeqCst), 2);
		assert_eq!(result.details.unwrap()["attempts"], 2);
	}

	#[test]
	fn test_parse_keeps_extra_reply_fields() {
		let v = parse_verdict(
			r#"{"completeness_score": 3, "completeness_explanation": "partial", "missing_aspects": ["price"]}"#,
			&rubric(),
		)
		.unwrap();
		assert_eq!(v.score, 3.0);
		assert_eq!(v.explanation, "partial");
		assert_eq!(v.fields.len(), 1);
		assert_eq!(v.fields["missing_aspects"], json!(["price"]));
	}

	#[tokio::test]
	async fn test_extra_reply_fields_land_in_details() {
		let oracle = oracle_from_fn("j", |_| async {
			Ok(r#"{"score": 3, "explanation": "partial", "missing_aspects": ["price"], "is_relevant": true}"#
				.to_string())
		});
		let result = JudgeAdapter::new(oracle)
			.judge(&Interaction::new("q", "c", "r"), &rubric())
			.await;
		assert_eq!(result.explanation, "partial");
		let details = result.details.unwrap();
		assert_eq!(details["raw_score"], 3.0);
		assert_eq!(details["reply"]["missing_aspects"], json!(["price"]));
		assert_eq!(details["reply"]["is_relevant"], true);
		assert!(details["reply"].get("score").is_none());
		assert!(details["reply"].get("explanation").is_none());
	}

	#[tokio::test]
	async fn test_parse_error_not_retried() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let oracle = oracle_from_fn("chatty", move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			async { Ok("I would rather not say.".to_string()) }
		});
		let adapter = JudgeAdapter::new(oracle).retry_backoff(Duration::from_millis(1));
		let result = adapter.judge(&Interaction::new("q", "c", "r"), &rubric()).await;
		assert_eq!(result.error, Some(CheckErrorKind::ParseError));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_unavailable_twice_gives_error_result() {
		let oracle = oracle_from_fn("down", |_| async {
			Err(JudgeError::OracleUnavailable("connection refused".into()))
		});
		let adapter = JudgeAdapter::new(oracle).retry_backoff(Duration::from_millis(1));
		let result = adapter.judge(&Interaction::new("q", "c", "r"), &rubric()).await;
		assert_eq!(result.error, Some(CheckErrorKind::OracleUnavailable));
		assert_eq!(result.score, None);
	}
}
