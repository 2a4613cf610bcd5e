//! Flat per-interaction documents: the original interaction fields next to
//! `score_<check>` / `explanation_<check>` columns.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{CheckErrorKind, CheckResult, EvaluationRecord, EvaluationReport, Interaction};

pub type FlatRecord = Map<String, Value>;

const SCORE: &str = "score_";
const EXPLANATION: &str = "explanation_";
const ERROR: &str = "error_";
const PASSED: &str = "passed_";
const PARTIAL: &str = "partial_";

#[derive(Debug, Error)]
pub enum FlatRecordError {
	#[error("record {index}: expected an object")]
	NotAnObject { index: usize },
	#[error("record {index}: missing or non-string field '{field}'")]
	MissingField { index: usize, field: String },
	#[error("record {index}: invalid value for '{key}'")]
	InvalidValue { index: usize, key: String },
}

impl EvaluationRecord {
	pub fn to_flat(&self) -> FlatRecord {
		let mut out = Map::new();
		let i = &self.interaction;
		if let Some(id) = &i.id {
			out.insert("id".into(), Value::String(id.clone()));
		}
		out.insert("question".into(), Value::String(i.question.clone()));
		out.insert("context".into(), Value::String(i.context.clone()));
		out.insert("response".into(), Value::String(i.response.clone()));
		if let Some(reference) = &i.reference {
			out.insert("reference".into(), Value::String(reference.clone()));
		}
		if let Some(overall) = self.overall_score {
			out.insert("overall_score".into(), number(overall));
		}

		for (name, result) in &self.results {
			out.insert(
				format!("{SCORE}{name}"),
				result.score.map(number).unwrap_or(Value::Null),
			);
			out.insert(
				format!("{EXPLANATION}{name}"),
				Value::String(result.explanation.clone()),
			);
			if let Some(kind) = result.error {
				out.insert(format!("{ERROR}{name}"), Value::String(kind.as_str().into()));
			}
			if let Some(passed) = result.passed {
				out.insert(format!("{PASSED}{name}"), Value::Bool(passed));
			}
			if result.partial {
				out.insert(format!("{PARTIAL}{name}"), Value::Bool(true));
			}
		}
		out
	}

	pub fn from_flat(index: usize, value: &Value) -> Result<Self, FlatRecordError> {
		let obj = value
			.as_object()
			.ok_or(FlatRecordError::NotAnObject { index })?;

		let text = |field: &str| -> Result<String, FlatRecordError> {
			obj.get(field)
				.and_then(Value::as_str)
				.map(str::to_string)
				.ok_or_else(|| FlatRecordError::MissingField {
					index,
					field: field.to_string(),
				})
		};
		let invalid = |key: &str| FlatRecordError::InvalidValue {
			index,
			key: key.to_string(),
		};

		let interaction = Interaction {
			id: obj.get("id").and_then(Value::as_str).map(str::to_string),
			question: text("question")?,
			context: obj
				.get("context")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string(),
			response: text("response")?,
			reference: obj.get("reference").and_then(Value::as_str).map(str::to_string),
		};

		let overall_score = match obj.get("overall_score") {
			None | Some(Value::Null) => None,
			Some(v) => Some(v.as_f64().ok_or_else(|| invalid("overall_score"))?),
		};

		let mut results: BTreeMap<String, CheckResult> = BTreeMap::new();
		for (key, value) in obj {
			if let Some(name) = key.strip_prefix(SCORE) {
				let score = match value {
					Value::Null => None,
					v => Some(v.as_f64().ok_or_else(|| invalid(key.as_str()))?),
				};
				slot(&mut results, name).score = score;
			} else if let Some(name) = key.strip_prefix(EXPLANATION) {
				let explanation = value.as_str().ok_or_else(|| invalid(key.as_str()))?;
				slot(&mut results, name).explanation = explanation.to_string();
			} else if let Some(name) = key.strip_prefix(ERROR) {
				let kind: CheckErrorKind =
					serde_json::from_value(value.clone()).map_err(|_| invalid(key.as_str()))?;
				slot(&mut results, name).error = Some(kind);
			} else if let Some(name) = key.strip_prefix(PASSED) {
				slot(&mut results, name).passed = Some(value.as_bool().ok_or_else(|| invalid(key.as_str()))?);
			} else if let Some(name) = key.strip_prefix(PARTIAL) {
				slot(&mut results, name).partial = value.as_bool().ok_or_else(|| invalid(key.as_str()))?;
			}
		}

		Ok(EvaluationRecord {
			interaction,
			results,
			overall_score,
		})
	}
}

fn slot<'a>(results: &'a mut BTreeMap<String, CheckResult>, name: &str) -> &'a mut CheckResult {
	results.entry(name.to_string()).or_insert_with(|| CheckResult {
		score: None,
		explanation: String::new(),
		error: None,
		passed: None,
		partial: false,
		details: None,
	})
}

fn number(v: f64) -> Value {
	serde_json::Number::from_f64(v)
		.map(Value::Number)
		.unwrap_or(Value::Null)
}

impl EvaluationReport {
	pub fn to_flat_records(&self) -> Vec<FlatRecord> {
		self.records.iter().map(EvaluationRecord::to_flat).collect()
	}

	/// Rebuilds a report from flat records. Check `details` are not part of the
	/// flat shape and come back as `None`.
	pub fn from_flat_records(values: &[Value]) -> Result<Self, FlatRecordError> {
		let records = values
			.iter()
			.enumerate()
			.map(|(idx, v)| EvaluationRecord::from_flat(idx, v))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(EvaluationReport::new(records))
	}
}
