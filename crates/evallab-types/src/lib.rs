use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::Tabled;

mod flat;

pub use flat::{FlatRecord, FlatRecordError};

/// One question/context/response triple to be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(alias = "user_query")]
	pub question: String,
	#[serde(default)]
	pub context: String,
	#[serde(alias = "ai_response")]
	pub response: String,
	/// Ground-truth answer, when the dataset has one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reference: Option<String>,
}

impl Interaction {
	pub fn new(
		question: impl Into<String>,
		context: impl Into<String>,
		response: impl Into<String>,
	) -> Self {
		Self {
			id: None,
			question: question.into(),
			context: context.into(),
			response: response.into(),
			reference: None,
		}
	}

	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.id = Some(id.into());
		self
	}

	pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
		self.reference = Some(reference.into());
		self
	}

	pub fn has_context(&self) -> bool {
		!self.context.trim().is_empty()
	}
}

/// Why a check produced no usable score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckErrorKind {
	ParseError,
	OracleUnavailable,
	InputTooLong,
	Timeout,
	MissingInput,
	ModelError,
	Internal,
}

impl CheckErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			CheckErrorKind::ParseError => "parse_error",
			CheckErrorKind::OracleUnavailable => "oracle_unavailable",
			CheckErrorKind::InputTooLong => "input_too_long",
			CheckErrorKind::Timeout => "timeout",
			CheckErrorKind::MissingInput => "missing_input",
			CheckErrorKind::ModelError => "model_error",
			CheckErrorKind::Internal => "internal",
		}
	}
}

impl fmt::Display for CheckErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of one check applied to one interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
	/// Normalized to `[0, 1]`; `None` when the check could not run.
	pub score: Option<f64>,
	pub explanation: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<CheckErrorKind>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub passed: Option<bool>,
	/// Set when the inputs were truncated before scoring.
	#[serde(default, skip_serializing_if = "is_false")]
	pub partial: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub details: Option<Value>,
}

fn is_false(b: &bool) -> bool {
	!*b
}

impl CheckResult {
	pub fn scored(score: f64, explanation: impl Into<String>) -> Self {
		Self {
			score: Some(score.clamp(0.0, 1.0)),
			explanation: explanation.into(),
			error: None,
			passed: None,
			partial: false,
			details: None,
		}
	}

	pub fn failed(kind: CheckErrorKind, explanation: impl Into<String>) -> Self {
		Self {
			score: None,
			explanation: explanation.into(),
			error: Some(kind),
			passed: None,
			partial: false,
			details: None,
		}
	}

	pub fn with_details(mut self, details: Value) -> Self {
		self.details = Some(details);
		self
	}

	pub fn with_partial(mut self, partial: bool) -> Self {
		self.partial = partial;
		self
	}

	/// Records pass/fail against `threshold`. No-op for results without a score.
	pub fn with_threshold(mut self, threshold: Option<f64>, lower_is_better: bool) -> Self {
		if let (Some(score), Some(threshold)) = (self.score, threshold) {
			self.passed = Some(if lower_is_better {
				score <= threshold
			} else {
				score >= threshold
			});
		}
		self
	}

	pub fn is_error(&self) -> bool {
		self.error.is_some()
	}
}

/// An interaction together with one result per requested check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
	pub interaction: Interaction,
	pub results: BTreeMap<String, CheckResult>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub overall_score: Option<f64>,
}

impl EvaluationRecord {
	pub fn result(&self, check: &str) -> Option<&CheckResult> {
		self.results.get(check)
	}

	pub fn score(&self, check: &str) -> Option<f64> {
		self.results.get(check).and_then(|r| r.score)
	}

	pub fn error_count(&self) -> usize {
		self.results.values().filter(|r| r.is_error()).count()
	}
}

/// Records in the same order as the interactions they were built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
	pub generated_at: DateTime<Utc>,
	pub records: Vec<EvaluationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
	pub evaluated: usize,
	pub errors: usize,
	pub mean_score: Option<f64>,
	pub passed: usize,
	pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
	pub total: usize,
	pub errors: usize,
	pub avg_overall_score: Option<f64>,
	pub checks: BTreeMap<String, CheckSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct SummaryRow {
	id: String,
	overall: String,
	errors: usize,
	question: String,
	scores: String,
}

impl EvaluationReport {
	pub fn new(records: Vec<EvaluationRecord>) -> Self {
		Self {
			generated_at: Utc::now(),
			records,
		}
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn interactions(&self) -> impl Iterator<Item = &Interaction> {
		self.records.iter().map(|r| &r.interaction)
	}

	pub fn summary(&self) -> ReportSummary {
		let mut checks: BTreeMap<String, (CheckSummary, f64, usize)> = BTreeMap::new();
		let mut errors = 0usize;
		let mut overall_sum = 0.0f64;
		let mut overall_count = 0usize;

		for record in &self.records {
			if let Some(overall) = record.overall_score {
				overall_sum += overall;
				overall_count += 1;
			}
			for (name, result) in &record.results {
				let (summary, sum, scored) = checks.entry(name.clone()).or_insert_with(|| {
					(
						CheckSummary {
							evaluated: 0,
							errors: 0,
							mean_score: None,
							passed: 0,
							failed: 0,
						},
						0.0,
						0,
					)
				});
				summary.evaluated += 1;
				if result.is_error() {
					summary.errors += 1;
					errors += 1;
				}
				if let Some(score) = result.score {
					*sum += score;
					*scored += 1;
				}
				match result.passed {
					Some(true) => summary.passed += 1,
					Some(false) => summary.failed += 1,
					None => {}
				}
			}
		}

		let checks = checks
			.into_iter()
			.map(|(name, (mut summary, sum, scored))| {
				summary.mean_score = (scored > 0).then(|| sum / scored as f64);
				(name, summary)
			})
			.collect();

		ReportSummary {
			total: self.records.len(),
			errors,
			avg_overall_score: (overall_count > 0).then(|| overall_sum / overall_count as f64),
			checks,
		}
	}

	pub fn summary_table(&self) -> String {
		use tabled::Table;
		let rows: Vec<SummaryRow> = self
			.records
			.iter()
			.enumerate()
			.map(|(idx, record)| {
				let id = record
					.interaction
					.id
					.clone()
					.unwrap_or_else(|| idx.to_string());
				let scores = record
					.results
					.iter()
					.map(|(name, r)| match (r.score, r.error) {
						(Some(s), _) => format!("{name}={s:.3}"),
						(None, Some(kind)) => format!("{name}=!{kind}"),
						(None, None) => format!("{name}=-"),
					})
					.collect::<Vec<_>>()
					.join(" ");
				SummaryRow {
					id,
					overall: record
						.overall_score
						.map(|s| format!("{s:.3}"))
						.unwrap_or_else(|| "-".to_string()),
					errors: record.error_count(),
					question: truncate(record.interaction.question.clone(), 48),
					scores,
				}
			})
			.collect();

		let table = Table::new(rows);
		let summary = self.summary();
		let mut text = format!(
			"{}\n\nInteractions: {}  Check errors: {}  Avg overall: {}\n",
			table,
			summary.total,
			summary.errors,
			summary
				.avg_overall_score
				.map(|s| format!("{s:.3}"))
				.unwrap_or_else(|| "-".to_string()),
		);
		for (name, check) in &summary.checks {
			text.push_str(&format!(
				"  {}: mean {}  errors {}  passed {}/{}\n",
				name,
				check
					.mean_score
					.map(|s| format!("{s:.3}"))
					.unwrap_or_else(|| "-".to_string()),
				check.errors,
				check.passed,
				check.passed + check.failed,
			));
		}
		text
	}
}

fn truncate(s: String, max_len: usize) -> String {
	if s.chars().count() <= max_len {
		return s;
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}
