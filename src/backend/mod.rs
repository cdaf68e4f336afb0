//! Generation backend interface.
//!
//! The backend is an opaque capability: given a prompt and a model
//! identifier it produces text plus token counts. The executor only cares
//! about one distinction in its failures: transient ones are retried,
//! terminal ones are not.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::CommandBackend;

/// Input/output token counts for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Result of one successful generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub token_counts: TokenCounts,
}

/// Backend failures, split along the only line the executor cares about.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Timeout, connection loss, rate limiting; safe to retry.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Bad model, rejected prompt, backend misconfiguration; retrying
    /// cannot help.
    #[error("backend failure: {0}")]
    Terminal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// An opaque generation capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Human-readable backend name, used in logs and events.
    fn name(&self) -> &str;

    /// Produce text for a prompt with the given model.
    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, BackendError>;
}
