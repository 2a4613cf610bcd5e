//! evallab-core: multi-signal evaluation of LLM responses.
//! Combine deterministic text metrics, an LLM judge and an offline
//! hallucination detector; run a batch of interactions with bounded
//! concurrency and get one structured record per interaction back.
//! See `examples/ocean.rs` for a quickstart.

pub mod check;
pub mod config;
pub mod datasource;
pub mod error;
pub mod hallucination;
pub mod judge;
pub mod logging;
pub mod oracle;
pub mod runner;
pub mod scorer;
pub mod sink;
pub mod testing;

pub mod scorers {
    pub mod bleu;
    pub mod chrf;
    pub mod exact;
    pub mod levenshtein;
    pub mod rouge;
    pub mod ter;
    pub mod tokenize;
}

pub use check::{CheckKind, CheckSpec, Metric, ReferenceSource};
pub use config::{DataConfig, EvalConfig, HallucinationConfig, JudgeConfig};
pub use datasource::{
    ConversationDataSource, DataSource, JsonDataSource, JsonlDataSource, RecordedDataSource,
    VecDataSource,
};
pub use error::{EvalError, JudgeError, ModelError};
pub use hallucination::{HallucinationDetector, HallucinationModel, InputLimits, SpanPrediction};
pub use judge::{JudgeAdapter, Rubric, Verdict};
pub use oracle::{oracle_from_fn, HttpOracle, JudgeOracle, Provider};
pub use runner::{Evaluator, EvaluatorBuilder};
pub use scorer::MetricScorer;
pub use scorers::{
    bleu::BleuScorer,
    chrf::ChrfScorer,
    exact::ExactMatchScorer,
    levenshtein::LevenshteinScorer,
    rouge::{RougeLScorer, RougeNScorer},
    ter::TerScorer,
};
#[cfg(feature = "persistence")]
pub use sink::SqliteSink;
pub use sink::{JsonFileSink, JsonlFileSink, MemorySink, ResultSink};
pub use evallab_types::{
    CheckErrorKind, CheckResult, EvaluationRecord, EvaluationReport, FlatRecord, FlatRecordError,
    Interaction, ReportSummary,
};
