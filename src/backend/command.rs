//! Subprocess generation backend.
//!
//! Spawns a configured command with the model identifier appended as the
//! final argument, writes the prompt to stdin, and reads the generation
//! from stdout. Backends that do not report token usage get a whitespace
//! word count as an estimate, which keeps usage tracking monotonic even
//! when exact counts are unavailable.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{BackendError, Generation, GenerationBackend, TokenCounts};

/// Default time allowed for one generation call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Generation backend that shells out to a configured command.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    call_timeout: Duration,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build from the `WEFT_BACKEND` environment variable.
    pub fn from_env() -> anyhow::Result<Self> {
        let (program, args) = crate::config::backend_command()?;
        Ok(Self::new(program, args))
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

/// Rough token estimate for backends that do not report usage.
fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl GenerationBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<Generation, BackendError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackendError::Terminal(format!(
                    "failed to spawn backend command '{}': {}",
                    self.program, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| BackendError::Transient(format!("failed to write prompt: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                BackendError::Transient(format!(
                    "backend call timed out after {:?}",
                    self.call_timeout
                ))
            })?
            .map_err(|e| BackendError::Transient(format!("failed to wait for backend: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Terminal(format!(
                "backend exited with code {} for model '{}': {}",
                output.status.code().unwrap_or(-1),
                model,
                stderr.trim()
            )));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|_| BackendError::Terminal("backend output is not valid UTF-8".to_string()))?;

        let token_counts = TokenCounts::new(estimate_tokens(prompt), estimate_tokens(&text));
        Ok(Generation { text, token_counts })
    }
}
