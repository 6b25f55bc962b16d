//! Codex CLI provider.
//!
//! Invokes `codex exec` non-interactively. Codex prints a human-readable
//! session log to stdout; the final assistant message is what the result
//! parser cares about, so the raw capture is the transcript.

use crate::agent::process::{run_cli, CliCapture};
use crate::agent::{stderr_tail, AgentOutcome, AgentRequest, AgentRunner, AvailabilityProbe};
use crate::config::ProviderConfig;
use crate::errors::{AgentError, AgentResult};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 20;

pub struct CodexRunner {
    config: ProviderConfig,
    stdout_limit: usize,
}

impl CodexRunner {
    pub fn new(config: ProviderConfig, stdout_limit: usize) -> Self {
        Self {
            config,
            stdout_limit,
        }
    }

    fn binary(&self) -> &str {
        self.config.binary.as_deref().unwrap_or("codex")
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--skip-git-repo-check".to_string(),
            "--full-auto".to_string(),
        ];

        let model = request
            .model_override
            .as_deref()
            .or(self.config.model.as_deref());
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        args.extend(self.config.extra_flags.iter().cloned());
        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn available(&self) -> AvailabilityProbe {
        let binary = self.binary();
        if which::which(binary).is_err() {
            return AvailabilityProbe {
                name: self.name().to_string(),
                enabled: self.config.enabled,
                available: false,
                version: None,
                error: Some(format!("'{}' not found in PATH", binary)),
            };
        }
        match Command::new(binary).arg("--version").output().await {
            Ok(output) => AvailabilityProbe {
                name: self.name().to_string(),
                enabled: self.config.enabled,
                available: output.status.success(),
                version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
                error: None,
            },
            Err(e) => AvailabilityProbe {
                name: self.name().to_string(),
                enabled: self.config.enabled,
                available: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<AgentOutcome> {
        let args = self.build_args(request);
        debug!(binary = self.binary(), workspace = %request.workspace_dir.display(), "Running Codex");

        let started = Instant::now();
        let capture: CliCapture = run_cli(
            self.binary(),
            &args,
            &request.workspace_dir,
            Duration::from_secs(self.config.timeout_secs),
            self.stdout_limit,
            cancel,
        )
        .await?;

        if capture.exit_code != Some(0) && capture.stdout.trim().is_empty() {
            return Err(AgentError::Crashed {
                status: capture.exit_code.unwrap_or(-1),
                stderr_tail: stderr_tail(&capture.stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(AgentOutcome {
            transcript: capture.stdout,
            stderr_tail: stderr_tail(&capture.stderr, STDERR_TAIL_LINES),
            agent_name: self.name().to_string(),
            duration: started.elapsed(),
            stdout_truncated: capture.stdout_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args_prompt_last() {
        let runner = CodexRunner::new(
            ProviderConfig {
                model: Some("o4-mini".to_string()),
                ..ProviderConfig::default()
            },
            1024,
        );
        let request = AgentRequest {
            prompt: "why did it crash".to_string(),
            workspace_dir: PathBuf::from("/tmp"),
            model_override: None,
        };
        let args = runner.build_args(&request);
        assert_eq!(args[0], "exec");
        assert_eq!(args.last().unwrap(), "why did it crash");
        let model_pos = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_pos + 1], "o4-mini");
    }

    #[test]
    fn test_default_binary_name() {
        let runner = CodexRunner::new(ProviderConfig::default(), 1024);
        assert_eq!(runner.binary(), "codex");
    }
}
