use thiserror::Error;

/// Errors that abort a whole evaluation run. Everything that can go wrong for a
/// single check is recorded on its `CheckResult` instead.
#[derive(Debug, Error)]
pub enum EvalError {
	#[error("duplicate check name '{0}'")]
	DuplicateCheck(String),

	#[error("invalid check '{name}': {reason}")]
	InvalidCheck { name: String, reason: String },

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error("failed to load hallucination model '{model}': {reason}")]
	ModelLoad { model: String, reason: String },

	#[error("failed to start evaluation runtime: {0}")]
	Runtime(#[from] std::io::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl EvalError {
	pub(crate) fn invalid_check(name: &str, reason: impl Into<String>) -> Self {
		EvalError::InvalidCheck {
			name: name.to_string(),
			reason: reason.into(),
		}
	}
}

/// Failure of one judge call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JudgeError {
	/// The oracle answered, but no score could be read from its reply.
	#[error("could not parse judge reply: {0}")]
	Parse(String),

	/// The call itself did not complete (network, timeout, provider error).
	#[error("judge oracle unavailable: {0}")]
	OracleUnavailable(String),
}

/// Failure reported by a hallucination model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
	#[error("model failed to load: {0}")]
	Load(String),

	#[error("input of {tokens} tokens exceeds model limit of {limit}")]
	InputTooLong { tokens: usize, limit: usize },

	#[error("inference failed: {0}")]
	Inference(String),
}
