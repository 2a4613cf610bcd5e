use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::JudgeError;

/// A judgment-capable model: prompt in, raw text out.
///
/// Implementations report transport or provider problems as
/// [`JudgeError::OracleUnavailable`]; reading a score out of the text is the
/// adapter's job.
#[async_trait]
pub trait JudgeOracle: Send + Sync {
	fn model(&self) -> &str;
	async fn complete(&self, prompt: &str) -> Result<String, JudgeError>;
}

/// Wrap an async closure as a `JudgeOracle`.
pub fn oracle_from_fn<F, Fut>(model: impl Into<String>, f: F) -> Arc<dyn JudgeOracle>
where
	F: Send + Sync + 'static + Fn(String) -> Fut,
	Fut: Future<Output = Result<String, JudgeError>> + Send + 'static,
{
	struct ClosureOracle<F> {
		model: String,
		f: F,
	}

	#[async_trait]
	impl<F, Fut> JudgeOracle for ClosureOracle<F>
	where
		F: Send + Sync + 'static + Fn(String) -> Fut,
		Fut: Future<Output = Result<String, JudgeError>> + Send + 'static,
	{
		fn model(&self) -> &str {
			&self.model
		}

		async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
			(self.f)(prompt.to_string()).await
		}
	}

	Arc::new(ClosureOracle {
		model: model.into(),
		f,
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
	#[serde(rename = "openai")]
	OpenAi,
	Anthropic,
}

impl Provider {
	pub fn default_base_url(&self) -> &'static str {
		match self {
			Provider::OpenAi => "https://api.openai.com/v1",
			Provider::Anthropic => "https://api.anthropic.com/v1",
		}
	}

	pub fn default_api_key_env(&self) -> &'static str {
		match self {
			Provider::OpenAi => "OPENAI_API_KEY",
			Provider::Anthropic => "ANTHROPIC_API_KEY",
		}
	}
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Judge oracle backed by a hosted chat API.
pub struct HttpOracle {
	client: reqwest::Client,
	provider: Provider,
	model: String,
	api_key: Option<String>,
	base_url: String,
	temperature: f64,
	max_tokens: u32,
}

impl HttpOracle {
	pub fn new(provider: Provider, model: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			provider,
			model: model.into(),
			api_key: None,
			base_url: provider.default_base_url().to_string(),
			temperature: 0.1,
			max_tokens: 1024,
		}
	}

	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.api_key = Some(key.into());
		self
	}

	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = url.into().trim_end_matches('/').to_string();
		self
	}

	pub fn temperature(mut self, temperature: f64) -> Self {
		self.temperature = temperature;
		self
	}

	/// Per-request timeout. Building the client only fails on TLS backend
	/// initialization, in which case the default client is kept.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
			self.client = client;
		}
		self
	}

	pub fn provider(&self) -> Provider {
		self.provider
	}

	fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
		match self.provider {
			Provider::OpenAi => {
				let body = json!({
					"model": self.model,
					"temperature": self.temperature,
					"response_format": { "type": "json_object" },
					"messages": [{ "role": "user", "content": prompt }],
				});
				let req = self
					.client
					.post(format!("{}/chat/completions", self.base_url))
					.json(&body);
				match &self.api_key {
					Some(key) => req.bearer_auth(key),
					None => req,
				}
			}
			Provider::Anthropic => {
				let body = json!({
					"model": self.model,
					"max_tokens": self.max_tokens,
					"temperature": self.temperature,
					"messages": [{ "role": "user", "content": prompt }],
				});
				let req = self
					.client
					.post(format!("{}/messages", self.base_url))
					.header("anthropic-version", ANTHROPIC_VERSION)
					.json(&body);
				match &self.api_key {
					Some(key) => req.header("x-api-key", key),
					None => req,
				}
			}
		}
	}

	fn extract_text(&self, body: &Value) -> Option<String> {
		let text = match self.provider {
			Provider::OpenAi => body
				.pointer("/choices/0/message/content")
				.and_then(Value::as_str),
			Provider::Anthropic => body.pointer("/content/0/text").and_then(Value::as_str),
		};
		text.map(str::to_string)
	}
}

#[async_trait]
impl JudgeOracle for HttpOracle {
	fn model(&self) -> &str {
		&self.model
	}

	async fn complete(&self, prompt: &str) -> Result<String, JudgeError> {
		let unavailable = |e: reqwest::Error| JudgeError::OracleUnavailable(e.to_string());

		let response = self.request(prompt).send().await.map_err(unavailable)?;
		let status = response.status();
		if !status.is_success() {
			let text = response.text().await.unwrap_or_default();
			return Err(JudgeError::OracleUnavailable(format!(
				"{} returned {}: {}",
				self.base_url,
				status,
				text.chars().take(200).collect::<String>()
			)));
		}
		let body: Value = response.json().await.map_err(unavailable)?;
		debug!(model = %self.model, "judge oracle replied");
		self.extract_text(&body).ok_or_else(|| {
			JudgeError::OracleUnavailable("provider reply carried no message text".to_string())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_oracle_from_fn() {
		let oracle = oracle_from_fn("echo", |prompt: String| async move { Ok(prompt.to_uppercase()) });
		assert_eq!(oracle.model(), "echo");
		assert_eq!(oracle.complete("score").await.unwrap(), "SCORE");
	}

	#[test]
	fn test_extract_text_per_provider() {
		let openai = HttpOracle::new(Provider::OpenAi, "gpt-4o-mini");
		let body = json!({ "choices": [{ "message": { "content": "{\"score\": 4}" } }] });
		assert_eq!(openai.extract_text(&body).as_deref(), Some("{\"score\": 4}"));

		let anthropic = HttpOracle::new(Provider::Anthropic, "claude");
		let body = json!({ "content": [{ "type": "text", "text": "score: 3" }] });
		assert_eq!(anthropic.extract_text(&body).as_deref(), Some("score: 3"));
		assert_eq!(anthropic.extract_text(&json!({})), None);
	}

	#[test]
	fn test_provider_serde_names() {
		let p: Provider = serde_json::from_str("\"openai\"").unwrap();
		assert_eq!(p, Provider::OpenAi);
		let p: Provider = serde_json::from_str("\"anthropic\"").unwrap();
		assert_eq!(p, Provider::Anthropic);
	}
}
