use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::check::{CheckKind, CheckSpec, Metric, ReferenceSource};
use crate::datasource::DataSource;
use crate::error::EvalError;
use crate::hallucination::{HallucinationDetector, HallucinationModel, InputLimits, DEFAULT_MIN_CONFIDENCE};
use crate::judge::{JudgeAdapter, Rubric};
use crate::oracle::JudgeOracle;
use crate::scorer::MetricScorer;
use crate::sink::ResultSink;
use evallab_types::{CheckErrorKind, CheckResult, EvaluationRecord, EvaluationReport, Interaction};

pub struct EvaluatorBuilder {
	oracle: Option<Arc<dyn JudgeOracle>>,
	hallucination_model: Option<Arc<dyn HallucinationModel>>,
	concurrency: usize,
	oracle_concurrency: usize,
	retry_backoff: Duration,
	interaction_timeout: Option<Duration>,
	min_confidence: f64,
	limits: Option<InputLimits>,
}

impl EvaluatorBuilder {
	pub fn new() -> Self {
		Self {
			oracle: None,
			hallucination_model: None,
			concurrency: 8,
			oracle_concurrency: 4,
			retry_backoff: Duration::from_millis(500),
			interaction_timeout: None,
			min_confidence: DEFAULT_MIN_CONFIDENCE,
			limits: None,
		}
	}

	pub fn judge(mut self, oracle: Arc<dyn JudgeOracle>) -> Self {
		self.oracle = Some(oracle);
		self
	}

	pub fn hallucination_model(mut self, model: Arc<dyn HallucinationModel>) -> Self {
		self.hallucination_model = Some(model);
		self
	}

	/// Interactions evaluated at the same time.
	pub fn concurrency(mut self, n: usize) -> Self {
		self.concurrency = n.max(1);
		self
	}

	/// Judge calls in flight at the same time, across all interactions.
	pub fn oracle_concurrency(mut self, n: usize) -> Self {
		self.oracle_concurrency = n.max(1);
		self
	}

	pub fn retry_backoff(mut self, backoff: Duration) -> Self {
		self.retry_backoff = backoff;
		self
	}

	/// Deadline for all checks of one interaction.
	pub fn interaction_timeout(mut self, timeout: Duration) -> Self {
		self.interaction_timeout = Some(timeout);
		self
	}

	pub fn min_confidence(mut self, min_confidence: f64) -> Self {
		self.min_confidence = min_confidence;
		self
	}

	/// Override the input limits declared by the hallucination model.
	pub fn limits(mut self, limits: InputLimits) -> Self {
		self.limits = Some(limits);
		self
	}

	/// Loads the hallucination model, if any. A model that fails to load
	/// aborts here, before any interaction is touched.
	pub fn build(self) -> Result<Evaluator, EvalError> {
		if !(0.0..=1.0).contains(&self.min_confidence) {
			return Err(EvalError::Config(format!(
				"min_confidence must be within [0, 1], got {}",
				self.min_confidence
			)));
		}
		let judge = self.oracle.map(|oracle| {
			JudgeAdapter::new(oracle)
				.max_concurrent(self.oracle_concurrency)
				.retry_backoff(self.retry_backoff)
		});
		let detector = match self.hallucination_model {
			Some(model) => {
				let mut detector =
					HallucinationDetector::load(model)?.with_min_confidence(self.min_confidence);
				if let Some(limits) = self.limits {
					detector = detector.with_limits(limits);
				}
				Some(detector)
			}
			None => None,
		};
		Ok(Evaluator {
			judge,
			detector,
			concurrency: self.concurrency,
			interaction_timeout: self.interaction_timeout,
		})
	}
}

impl Default for EvaluatorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

enum Plan {
	Metric {
		metric: Metric,
		reference: ReferenceSource,
	},
	Judge(Rubric),
	Hallucination {
		min_confidence: Option<f64>,
	},
}

/// A validated check, ready to dispatch.
struct PreparedCheck {
	name: String,
	plan: Plan,
	threshold: Option<f64>,
	weight: f64,
	lower_is_better: bool,
}

pub struct Evaluator {
	judge: Option<JudgeAdapter>,
	detector: Option<HallucinationDetector>,
	concurrency: usize,
	interaction_timeout: Option<Duration>,
}

impl Evaluator {
	pub fn builder() -> EvaluatorBuilder {
		EvaluatorBuilder::new()
	}

	/// Validate a check list against this evaluator without scoring anything.
	pub fn validate(&self, checks: &[CheckSpec]) -> Result<(), EvalError> {
		self.prepare(checks).map(|_| ())
	}

	fn prepare(&self, checks: &[CheckSpec]) -> Result<Vec<PreparedCheck>, EvalError> {
		let mut seen = HashSet::new();
		for check in checks {
			if !seen.insert(check.name.as_str()) {
				return Err(EvalError::DuplicateCheck(check.name.clone()));
			}
		}

		let mut prepared = Vec::new();
		for check in checks.iter().filter(|c| c.enabled) {
			let name = check.name.as_str();
			if name.trim().is_empty() {
				return Err(EvalError::invalid_check(name, "check name must not be empty"));
			}
			if let Some(t) = check.threshold {
				if !(0.0..=1.0).contains(&t) {
					return Err(EvalError::invalid_check(
						name,
						format!("threshold must be within [0, 1], got {t}"),
					));
				}
			}
			if !check.weight.is_finite() || check.weight < 0.0 {
				return Err(EvalError::invalid_check(
					name,
					format!("weight must be a non-negative number, got {}", check.weight),
				));
			}

			let plan = match &check.kind {
				CheckKind::Deterministic { metric, reference } => Plan::Metric {
					metric: *metric,
					reference: *reference,
				},
				CheckKind::Judge {
					rubric,
					criteria,
					requires_context,
				} => {
					if self.judge.is_none() {
						return Err(EvalError::invalid_check(name, "no judge oracle configured"));
					}
					let rubric = Rubric::resolve(rubric, criteria.as_deref(), *requires_context)
						.map_err(|reason| EvalError::invalid_check(name, reason))?;
					Plan::Judge(rubric)
				}
				CheckKind::Hallucination { min_confidence } => {
					if self.detector.is_none() {
						return Err(EvalError::invalid_check(
							name,
							"no hallucination model configured",
						));
					}
					if let Some(c) = min_confidence {
						if !(0.0..=1.0).contains(c) {
							return Err(EvalError::invalid_check(
								name,
								format!("min_confidence must be within [0, 1], got {c}"),
							));
						}
					}
					Plan::Hallucination {
						min_confidence: *min_confidence,
					}
				}
			};

			prepared.push(PreparedCheck {
				name: check.name.clone(),
				plan,
				threshold: check.threshold,
				weight: check.weight,
				lower_is_better: check.lower_is_better(),
			});
		}
		Ok(prepared)
	}

	/// Score every interaction with every enabled check.
	///
	/// Only invalid check lists fail the call. Per-check problems (oracle
	/// failures, timeouts, missing inputs) are recorded on the check's result,
	/// and the report always has one record per interaction, in input order.
	pub async fn evaluate(
		&self,
		interactions: &[Interaction],
		checks: &[CheckSpec],
	) -> Result<EvaluationReport, EvalError> {
		let plan = self.prepare(checks)?;
		info!(
			interactions = interactions.len(),
			checks = plan.len(),
			concurrency = self.concurrency,
			"starting evaluation"
		);

		let mut slots: Vec<Option<EvaluationRecord>> = (0..interactions.len()).map(|_| None).collect();
		let plan = &plan;
		let mut finished = stream::iter(interactions.iter().enumerate())
			.map(|(idx, interaction)| async move { (idx, self.evaluate_one(interaction, plan).await) })
			.buffer_unordered(self.concurrency);
		while let Some((idx, record)) = finished.next().await {
			slots[idx] = Some(record);
		}

		let records = slots
			.into_iter()
			.enumerate()
			.map(|(idx, slot)| {
				slot.ok_or_else(|| EvalError::Internal(format!("no record produced for interaction {idx}")))
			})
			.collect::<Result<Vec<_>, _>>()?;
		let report = EvaluationReport::new(records);
		info!(
			records = report.len(),
			errors = report.summary().errors,
			"evaluation finished"
		);
		Ok(report)
	}

	/// Blocking form of [`evaluate`](Self::evaluate) for callers without an
	/// async runtime. Must not be called from inside one.
	pub fn evaluate_blocking(
		&self,
		interactions: &[Interaction],
		checks: &[CheckSpec],
	) -> Result<EvaluationReport, EvalError> {
		if tokio::runtime::Handle::try_current().is_ok() {
			return Err(EvalError::Internal(
				"evaluate_blocking called from inside an async runtime; await `evaluate` instead".to_string(),
			));
		}
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.build()?;
		runtime.block_on(self.evaluate(interactions, checks))
	}

	/// Load interactions from `source`, evaluate them and hand the report to
	/// every sink.
	pub async fn run(
		&self,
		source: &dyn DataSource,
		checks: &[CheckSpec],
		sinks: &[Arc<dyn ResultSink>],
	) -> anyhow::Result<EvaluationReport> {
		let interactions = source.load().await?;
		let report = self.evaluate(&interactions, checks).await?;
		for sink in sinks {
			sink.emit(&report).await?;
		}
		Ok(report)
	}

	async fn evaluate_one(&self, interaction: &Interaction, plan: &[PreparedCheck]) -> EvaluationRecord {
		let deadline = self.interaction_timeout.map(|t| Instant::now() + t);

		let pending = plan.iter().map(|check| async move {
			let run = AssertUnwindSafe(self.run_check(interaction, check)).catch_unwind();
			let outcome = match deadline {
				Some(deadline) => match timeout_at(deadline, run).await {
					Ok(outcome) => outcome,
					Err(_) => Ok(CheckResult::failed(
						CheckErrorKind::Timeout,
						"interaction deadline passed before the check finished",
					)),
				},
				None => run.await,
			};
			let result = match outcome {
				Ok(result) => result,
				Err(panic) => CheckResult::failed(
					CheckErrorKind::Internal,
					format!("check panicked: {}", panic_message(panic.as_ref())),
				),
			};
			debug!(
				check = %check.name,
				score = ?result.score,
				error = ?result.error,
				"check finished"
			);
			result.with_threshold(check.threshold, check.lower_is_better)
		});
		let finished = join_all(pending).await;

		let results: BTreeMap<String, CheckResult> = plan
			.iter()
			.map(|c| c.name.clone())
			.zip(finished)
			.collect();
		let overall_score = overall_score(plan, &results);
		EvaluationRecord {
			interaction: interaction.clone(),
			results,
			overall_score,
		}
	}

	async fn run_check(&self, interaction: &Interaction, check: &PreparedCheck) -> CheckResult {
		match &check.plan {
			Plan::Metric { metric, reference } => {
				let reference_text = reference.text(interaction);
				if reference_text.trim().is_empty() {
					return CheckResult::failed(
						CheckErrorKind::MissingInput,
						format!("{} requires a non-empty {reference}", metric.name()),
					);
				}
				let score = metric.score(&interaction.response, reference_text);
				CheckResult::scored(score, format!("{} of response against {reference}", metric.name()))
			}
			Plan::Judge(rubric) => match &self.judge {
				Some(judge) => judge.judge(interaction, rubric).await,
				None => CheckResult::failed(CheckErrorKind::Internal, "no judge oracle configured"),
			},
			Plan::Hallucination { min_confidence } => match &self.detector {
				Some(detector) => detector.detect(interaction, *min_confidence).await,
				None => CheckResult::failed(CheckErrorKind::Internal, "no hallucination model configured"),
			},
		}
	}
}

/// Weighted mean of the available scores; lower-is-better checks count as
/// `1 - score`.
fn overall_score(plan: &[PreparedCheck], results: &BTreeMap<String, CheckResult>) -> Option<f64> {
	let mut weighted = 0.0;
	let mut total_weight = 0.0;
	for check in plan {
		let Some(score) = results.get(&check.name).and_then(|r| r.score) else {
			continue;
		};
		let value = if check.lower_is_better { 1.0 - score } else { score };
		weighted += value * check.weight;
		total_weight += check.weight;
	}
	(total_weight > 0.0).then(|| weighted / total_weight)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::JudgeError;
	use crate::oracle::oracle_from_fn;

	fn ocean() -> Interaction {
		Interaction::new(
			"What is the largest ocean?",
			"The Pacific Ocean is the largest ocean on Earth.",
			"The Pacific Ocean is the largest ocean.",
		)
	}

	#[tokio::test]
	async fn test_deterministic_only() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![
			CheckSpec::deterministic("rouge_l", Metric::RougeL).with_threshold(0.5),
			CheckSpec::deterministic("bleu", Metric::Bleu),
		];
		let report = eval.evaluate(&[ocean()], &checks).await.unwrap();
		let record = &report.records[0];
		assert_eq!(record.results.len(), 2);
		assert!(record.score("rouge_l").unwrap() > 0.7);
		assert_eq!(record.result("rouge_l").unwrap().passed, Some(true));
		assert!(record.overall_score.is_some());
	}

	#[tokio::test]
	async fn test_duplicate_names_rejected() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![
			CheckSpec::deterministic("x", Metric::Bleu),
			CheckSpec::deterministic("x", Metric::Chrf),
		];
		let err = eval.evaluate(&[ocean()], &checks).await.unwrap_err();
		assert!(matches!(err, EvalError::DuplicateCheck(name) if name == "x"));
	}

	#[tokio::test]
	async fn test_judge_without_oracle_rejected() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![CheckSpec::judge("rel", "response_relevance")];
		assert!(matches!(
			eval.validate(&checks),
			Err(EvalError::InvalidCheck { .. })
		));
	}

	#[tokio::test]
	async fn test_invalid_threshold_and_weight() {
		let eval = Evaluator::builder().build().unwrap();
		let bad_threshold = vec![CheckSpec::deterministic("x", Metric::Bleu).with_threshold(1.5)];
		assert!(eval.validate(&bad_threshold).is_err());
		let bad_weight = vec![CheckSpec::deterministic("x", Metric::Bleu).with_weight(-1.0)];
		assert!(eval.validate(&bad_weight).is_err());
	}

	#[tokio::test]
	async fn test_disabled_checks_skipped() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![
			CheckSpec::deterministic("on", Metric::Bleu),
			CheckSpec::deterministic("off", Metric::Chrf).disabled(),
		];
		let report = eval.evaluate(&[ocean()], &checks).await.unwrap();
		assert!(report.records[0].result("off").is_none());
		assert!(report.records[0].result("on").is_some());
	}

	#[tokio::test]
	async fn test_empty_context_is_missing_input() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![CheckSpec::deterministic("rouge_l", Metric::RougeL)];
		let report = eval
			.evaluate(&[Interaction::new("q", "", "an answer")], &checks)
			.await
			.unwrap();
		let r = report.records[0].result("rouge_l").unwrap();
		assert_eq!(r.score, None);
		assert_eq!(r.error, Some(CheckErrorKind::MissingInput));
		assert_eq!(report.records[0].overall_score, None);
	}

	#[tokio::test]
	async fn test_panicking_oracle_is_contained() {
		let oracle = oracle_from_fn("panics", |_| async {
			if true {
				panic!("boom");
			}
			Err::<String, JudgeError>(JudgeError::Parse(String::new()))
		});
		let eval = Evaluator::builder().judge(oracle).build().unwrap();
		let checks = vec![
			CheckSpec::judge("rel", "response_relevance"),
			CheckSpec::deterministic("chrf", Metric::Chrf),
		];
		let report = eval.evaluate(&[ocean()], &checks).await.unwrap();
		let rel = report.records[0].result("rel").unwrap();
		assert_eq!(rel.error, Some(CheckErrorKind::Internal));
		assert!(rel.explanation.contains("boom"));
		assert!(report.records[0].score("chrf").is_some());
	}

	#[test]
	fn test_evaluate_blocking() {
		let eval = Evaluator::builder().build().unwrap();
		let checks = vec![CheckSpec::deterministic("exact", Metric::ExactMatch)];
		let i = Interaction::new("q", "Pacific Ocean", "pacific ocean");
		let report = eval.evaluate_blocking(&[i], &checks).unwrap();
		assert_eq!(report.records[0].score("exact"), Some(1.0));
	}

	#[tokio::test]
	async fn test_evaluate_blocking_inside_runtime_errors() {
		let eval = Evaluator::builder().build().unwrap();
		assert!(matches!(
			eval.evaluate_blocking(&[], &[]),
			Err(EvalError::Internal(_))
		));
	}

	#[test]
	fn test_overall_score_inverts_lower_is_better() {
		let plan = vec![
			PreparedCheck {
				name: "a".into(),
				plan: Plan::Metric {
					metric: Metric::Bleu,
					reference: ReferenceSource::Context,
				},
				threshold: None,
				weight: 3.0,
				lower_is_better: false,
			},
			PreparedCheck {
				name: "h".into(),
				plan: Plan::Hallucination { min_confidence: None },
				threshold: None,
				weight: 1.0,
				lower_is_better: true,
			},
		];
		let mut results = BTreeMap::new();
		results.insert("a".to_string(), CheckResult::scored(1.0, ""));
		results.insert("h".to_string(), CheckResult::scored(1.0, ""));
		// (3 * 1.0 + 1 * 0.0) / 4
		assert_eq!(overall_score(&plan, &results), Some(0.75));
	}
}
