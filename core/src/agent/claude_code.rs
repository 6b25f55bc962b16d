//! Claude Code CLI provider.
//!
//! Invokes `claude` in print mode with stream-json output and assembles the
//! assistant text from the NDJSON stream into the transcript.

use crate::agent::process::{run_cli, CliCapture};
use crate::agent::{stderr_tail, AgentOutcome, AgentRequest, AgentRunner, AvailabilityProbe};
use crate::config::ProviderConfig;
use crate::errors::{AgentError, AgentResult};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stderr lines carried on crash errors.
const STDERR_TAIL_LINES: usize = 20;

pub struct ClaudeCodeRunner {
    config: ProviderConfig,
    stdout_limit: usize,
}

impl ClaudeCodeRunner {
    pub fn new(config: ProviderConfig, stdout_limit: usize) -> Self {
        Self {
            config,
            stdout_limit,
        }
    }

    fn binary(&self) -> &str {
        self.config.binary.as_deref().unwrap_or("claude")
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        let model = request
            .model_override
            .as_deref()
            .or(self.config.model.as_deref());
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        if self.config.max_turns > 0 {
            args.push("--max-turns".to_string());
            args.push(self.config.max_turns.to_string());
        }

        args.extend(self.config.extra_flags.iter().cloned());
        args
    }
}

/// Assemble the assistant-visible transcript from stream-json output.
///
/// Assistant messages carry `message.content[].text`; the final `result`
/// message repeats the complete reply. Output that is not NDJSON at all is
/// kept verbatim so a provider switched to plain text still parses.
fn transcript_from_stream(stdout: &str) -> String {
    let mut text_parts: Vec<String> = Vec::new();
    let mut final_result: Option<String> = None;
    let mut any_json = false;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        any_json = true;
        match msg.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => {
                if let Some(content) = msg
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array())
                {
                    for item in content {
                        if item.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                text_parts.push(text.to_string());
                            }
                        }
                    }
                }
            }
            Some("result") => {
                if let Some(result) = msg.get("result").and_then(|r| r.as_str()) {
                    final_result = Some(result.to_string());
                }
            }
            _ => {}
        }
    }

    if !any_json {
        return stdout.to_string();
    }
    // The result message is authoritative when present; it includes text the
    // stream may have truncated.
    final_result.unwrap_or_else(|| text_parts.join("\n"))
}

#[async_trait]
impl AgentRunner for ClaudeCodeRunner {
    fn name(&self) -> &'static str {
        "claude_code"
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
        debug!(binary = self.binary(), workspace = %request.workspace_dir.display(), "Running Claude Code");

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

        let transcript = transcript_from_stream(&capture.stdout);
        if capture.exit_code != Some(0) && transcript.trim().is_empty() {
            return Err(AgentError::Crashed {
                status: capture.exit_code.unwrap_or(-1),
                stderr_tail: stderr_tail(&capture.stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(AgentOutcome {
            transcript,
            stderr_tail: stderr_tail(&capture.stderr, STDERR_TAIL_LINES),
            agent_name: self.name().to_string(),
            duration: started.elapsed(),
            stdout_truncated: capture.stdout_truncated,
        })
    }
}
