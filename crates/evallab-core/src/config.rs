use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::check::CheckSpec;
use crate::datasource::{
    ConversationDataSource, DataSource, JsonDataSource, JsonlDataSource, RecordedDataSource,
};
use crate::error::EvalError;
use crate::hallucination::{HallucinationModel, InputLimits, DEFAULT_MIN_CONFIDENCE};
use crate::oracle::{HttpOracle, Provider};
use crate::runner::EvaluatorBuilder;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hallucination: Option<HallucinationConfig>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataConfig>,
}

fn default_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub provider: Provider,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_concurrent() -> usize {
    4
}

fn default_temperature() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_tokens: Option<usize>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    DEFAULT_MIN_CONFIDENCE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DataConfig {
    Json {
        path: PathBuf,
    },
    Jsonl {
        path: PathBuf,
    },
    Conversation {
        conversation: PathBuf,
        vectors: PathBuf,
        /// Evaluate only the assistant reply with this turn number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<u64>,
    },
    Recorded {
        path: PathBuf,
    },
}

impl DataConfig {
    pub fn data_source(&self) -> Arc<dyn DataSource> {
        match self {
            DataConfig::Json { path } => Arc::new(JsonDataSource::new(path)),
            DataConfig::Jsonl { path } => Arc::new(JsonlDataSource::new(path)),
            DataConfig::Conversation {
                conversation,
                vectors,
                turn,
            } => {
                let source = ConversationDataSource::new(conversation, vectors);
                Arc::new(match turn {
                    Some(turn) => source.turn(*turn),
                    None => source,
                })
            }
            DataConfig::Recorded { path } => Arc::new(RecordedDataSource::new(path)),
        }
    }
}

impl JudgeConfig {
    /// API key from `api_key`, else the variable named by `api_key_env`, else
    /// the provider's usual variable. An explicit `api_key_env` that is unset
    /// does not fall through.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        let var = self
            .api_key_env
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_key_env());
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn build_oracle(&self) -> Result<HttpOracle, EvalError> {
        let key = self.resolve_api_key();
        if key.is_none() && self.base_url.is_none() {
            let var = self
                .api_key_env
                .as_deref()
                .unwrap_or_else(|| self.provider.default_api_key_env());
            return Err(EvalError::Config(format!(
                "no API key for the judge oracle: set `api_key` or the {var} environment variable"
            )));
        }
        let mut oracle = HttpOracle::new(self.provider, self.model.clone())
            .temperature(self.temperature)
            .request_timeout(Duration::from_secs(self.request_timeout_secs));
        if let Some(key) = key {
            oracle = oracle.api_key(key);
        }
        if let Some(url) = &self.base_url {
            oracle = oracle.base_url(url.clone());
        }
        Ok(oracle)
    }
}

impl EvalConfig {
    /// Load from YAML (`.yaml`/`.yml`) or JSON, by file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: EvalConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML config {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON config {:?}", path))?,
            other => bail!("Unsupported config extension {:?} for {:?}", other, path),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.concurrency == 0 {
            return Err(EvalError::Config("concurrency must be at least 1".into()));
        }
        if self.interaction_timeout_ms == Some(0) {
            return Err(EvalError::Config(
                "interaction_timeout_ms must be positive".into(),
            ));
        }
        if let Some(judge) = &self.judge {
            if judge.model.trim().is_empty() {
                return Err(EvalError::Config("judge.model must not be empty".into()));
            }
            if judge.max_concurrent == 0 {
                return Err(EvalError::Config(
                    "judge.max_concurrent must be at least 1".into(),
                ));
            }
        }
        if let Some(h) = &self.hallucination {
            if !(0.0..=1.0).contains(&h.min_confidence) {
                return Err(EvalError::Config(format!(
                    "hallucination.min_confidence must be within [0, 1], got {}",
                    h.min_confidence
                )));
            }
            if h.max_context_tokens == Some(0) || h.max_response_tokens == Some(0) {
                return Err(EvalError::Config(
                    "hallucination token limits must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn enabled_checks(&self) -> Vec<CheckSpec> {
        self.checks.iter().filter(|c| c.enabled).cloned().collect()
    }

    pub fn data_source(&self) -> Option<Arc<dyn DataSource>> {
        self.data.as_ref().map(DataConfig::data_source)
    }

    /// A builder carrying every setting of this config. The hallucination
    /// model itself is not configurable from a file and is passed in.
    pub fn evaluator_builder(
        &self,
        hallucination_model: Option<Arc<dyn HallucinationModel>>,
    ) -> Result<EvaluatorBuilder, EvalError> {
        self.validate()?;
        let mut builder = EvaluatorBuilder::new().concurrency(self.concurrency);
        if let Some(ms) = self.interaction_timeout_ms {
            builder = builder.interaction_timeout(Duration::from_millis(ms));
        }
        if let Some(judge) = &self.judge {
            builder = builder
                .judge(Arc::new(judge.build_oracle()?))
                .oracle_concurrency(judge.max_concurrent)
                .retry_backoff(Duration::from_millis(judge.retry_backoff_ms));
        }
        if let Some(model) = hallucination_model {
            let declared = model.input_limits();
            builder = builder.hallucination_model(model);
            if let Some(h) = &self.hallucination {
                builder = builder.min_confidence(h.min_confidence);
                if h.max_context_tokens.is_some() || h.max_response_tokens.is_some() {
                    builder = builder.limits(InputLimits {
                        max_context_tokens: h
                            .max_context_tokens
                            .unwrap_or(declared.max_context_tokens),
                        max_response_tokens: h
                            .max_response_tokens
                            .unwrap_or(declared.max_response_tokens),
                    });
                }
            }
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckKind, Metric};

    const YAML: &str = r#"
concurrency: 4
interaction_timeout_ms: 30000
judge:
  provider: openai
  model: gpt-4o-mini
  api_key: sk-test
hallucination:
  max_context_tokens: 2048
checks:
  - name: rouge_l
    kind: deterministic
    metric: rouge_l
  - name: relevance
    kind: judge
    rubric: response_relevance
    threshold: 0.5
    weight: 0.3
  - name: tone
    kind: judge
    rubric: tone
    criteria: Is the response polite?
    enabled: false
data:
  type: jsonl
  path: interactions.jsonl
"#;

    #[test]
    fn test_conversation_data_config_turn() {
        let data: DataConfig = serde_yaml::from_str(
            "type: conversation\nconversation: chat.json\nvectors: vectors.json\nturn: 14\n",
        )
        .unwrap();
        assert!(matches!(data, DataConfig::Conversation { turn: Some(14), .. }));
        let data: DataConfig = serde_yaml::from_str(
            "type: conversation\nconversation: chat.json\nvectors: vectors.json\n",
        )
        .unwrap();
        assert!(matches!(data, DataConfig::Conversation { turn: None, .. }));
    }

    #[test]
    fn test_yaml_config() {
        let config: EvalConfig = serde_yaml::from_str(YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.checks.len(), 3);
        let enabled = config.enabled_checks();
        assert_eq!(enabled.len(), 2);
        assert!(matches!(
            enabled[0].kind,
            CheckKind::Deterministic {
                metric: Metric::RougeL,
                ..
            }
        ));
        assert_eq!(enabled[1].weight, 0.3);
        let judge = config.judge.as_ref().unwrap();
        assert_eq!(judge.retry_backoff_ms, 500);
        assert_eq!(judge.resolve_api_key().as_deref(), Some("sk-test"));
        assert_eq!(
            config.hallucination.as_ref().unwrap().min_confidence,
            DEFAULT_MIN_CONFIDENCE
        );
        assert!(matches!(config.data, Some(DataConfig::Jsonl { .. })));
        assert!(config.evaluator_builder(None).is_ok());
    }

    #[test]
    fn test_json_config_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval.json");
        std::fs::write(
            &path,
            r#"{"checks": [{"name": "bleu", "kind": "deterministic", "metric": "bleu", "reference": "reference"}]}"#,
        )
        .unwrap();
        let config = EvalConfig::from_path(&path).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.checks[0].name, "bleu");
        assert!(config.judge.is_none());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval.toml");
        std::fs::write(&path, "concurrency = 1").unwrap();
        assert!(EvalConfig::from_path(&path).is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config: EvalConfig = serde_yaml::from_str("concurrency: 0").unwrap();
        assert!(config.validate().is_err());
        config.concurrency = 2;
        config.hallucination = Some(HallucinationConfig {
            max_context_tokens: None,
            max_response_tokens: None,
            min_confidence: 1.5,
        });
        assert!(matches!(config.validate(), Err(EvalError::Config(_))));
    }

    #[test]
    fn test_missing_api_key() {
        let judge: JudgeConfig = serde_yaml::from_str(
            "provider: anthropic\nmodel: claude\napi_key_env: EVALLAB_TEST_KEY_THAT_IS_NEVER_SET",
        )
        .unwrap();
        assert!(judge.resolve_api_key().is_none());
        assert!(matches!(judge.build_oracle(), Err(EvalError::Config(_))));

        let local: JudgeConfig = serde_yaml::from_str(
            "provider: openai\nmodel: llama\napi_key_env: EVALLAB_TEST_KEY_THAT_IS_NEVER_SET\nbase_url: http://localhost:8080/v1",
        )
        .unwrap();
        assert!(local.build_oracle().is_ok());
    }
}
