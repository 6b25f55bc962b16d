//! Uniform contract over subprocess LLM CLIs.
//!
//! Each provider knows how to invoke its own binary; the registry picks the
//! effective provider for a task (request override, then per-rule route,
//! then global default) and falls back to the first enabled and available
//! provider in deterministic order.

pub mod claude_code;
pub mod codex;
mod process;

pub use process::{run_cli, CliCapture};

use crate::config::AgentsConfig;
use crate::errors::{AgentError, AgentResult};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Full prompt, already containing rule bodies and pre-extracted snippets.
    pub prompt: String,
    /// The agent's working directory; its tool-use is confined here.
    pub workspace_dir: PathBuf,
    /// Model requested by the caller, overriding the provider default.
    pub model_override: Option<String>,
}

/// Captured run of one agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Assistant-visible text assembled from the provider's output format.
    pub transcript: String,
    /// Trailing stderr, kept for diagnostics.
    pub stderr_tail: String,
    /// Effective provider that produced this outcome.
    pub agent_name: String,
    pub duration: Duration,
    pub stdout_truncated: bool,
}

/// Readiness probe result for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityProbe {
    pub name: String,
    pub enabled: bool,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A subprocess LLM CLI provider.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Stable provider name used in config routes and results.
    fn name(&self) -> &'static str;

    /// Probe the CLI without running an analysis.
    async fn available(&self) -> AvailabilityProbe;

    /// Run one analysis to completion, observing the cancel token.
    async fn run(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<AgentOutcome>;
}

/// Provider registry with routing and deterministic fallback.
pub struct AgentRegistry {
    /// Registration order is the fallback order.
    providers: Vec<Arc<dyn AgentRunner>>,
    config: AgentsConfig,
}

impl AgentRegistry {
    pub fn new(providers: Vec<Arc<dyn AgentRunner>>, config: AgentsConfig) -> Self {
        Self { providers, config }
    }

    /// Build the registry from configuration with the standard providers.
    pub fn from_config(config: &AgentsConfig, stdout_limit: usize) -> Self {
        let providers: Vec<Arc<dyn AgentRunner>> = vec![
            Arc::new(claude_code::ClaudeCodeRunner::new(
                config.claude_code.clone(),
                stdout_limit,
            )),
            Arc::new(codex::CodexRunner::new(config.codex.clone(), stdout_limit)),
        ];
        Self::new(providers, config.clone())
    }

    fn enabled(&self, name: &str) -> bool {
        self.config.provider(name).map(|p| p.enabled).unwrap_or(false)
    }

    fn by_name(&self, name: &str) -> Option<&Arc<dyn AgentRunner>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Preferred provider name for a task: request override, per-rule route,
    /// then the global default.
    pub fn preferred(&self, requested: Option<&str>, rule_id: &str) -> String {
        if let Some(name) = requested {
            return name.to_string();
        }
        if let Some(route) = self.config.routes.get(rule_id) {
            return route.clone();
        }
        self.config.default.clone()
    }

    /// Candidate providers in selection order: the preferred one first, then
    /// every other enabled provider in registration order.
    pub fn candidates(&self, requested: Option<&str>, rule_id: &str) -> Vec<Arc<dyn AgentRunner>> {
        let preferred = self.preferred(requested, rule_id);
        let mut out: Vec<Arc<dyn AgentRunner>> = Vec::new();
        if self.enabled(&preferred) {
            if let Some(runner) = self.by_name(&preferred) {
                out.push(runner.clone());
            } else {
                warn!(provider = %preferred, "Preferred provider is not registered");
            }
        }
        for runner in &self.providers {
            if runner.name() != preferred && self.enabled(runner.name()) {
                out.push(runner.clone());
            }
        }
        out
    }

    /// Run the request on the preferred provider, falling back to the next
    /// enabled + available one. The outcome records the effective agent.
    pub async fn run_with_fallback(
        &self,
        requested: Option<&str>,
        rule_id: &str,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> AgentResult<AgentOutcome> {
        if let Some(name) = requested {
            if self.by_name(name).is_none() {
                return Err(AgentError::UnknownProvider(name.to_string()));
            }
        }

        let candidates = self.candidates(requested, rule_id);
        for runner in &candidates {
            let probe = runner.available().await;
            if !probe.available {
                warn!(provider = runner.name(), error = ?probe.error, "Provider unavailable, trying next");
                continue;
            }
            info!(provider = runner.name(), "Agent provider selected");
            return runner.run(request, cancel).await;
        }
        Err(AgentError::NoProviderAvailable)
    }

    /// Probe every registered provider, for `/health/agents`.
    pub async fn probe_all(&self) -> Vec<AvailabilityProbe> {
        let mut out = Vec::new();
        for runner in &self.providers {
            let mut probe = runner.available().await;
            probe.enabled = self.enabled(runner.name());
            out.push(probe);
        }
        out
    }
}

/// Tail helper shared by providers: last `n` lines of captured stderr.
pub(crate) fn stderr_tail(stderr: &str, n: usize) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRunner {
        name: &'static str,
        available: bool,
        runs: AtomicUsize,
    }

    impl FakeRunner {
        fn new(name: &'static str, available: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                available,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for FakeRunner {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn available(&self) -> AvailabilityProbe {
            AvailabilityProbe {
                name: self.name.to_string(),
                enabled: true,
                available: self.available,
                version: self.available.then(|| "1.0.0".to_string()),
                error: (!self.available).then(|| "binary not found".to_string()),
            }
        }

        async fn run(
            &self,
            _request: &AgentRequest,
            _cancel: &CancellationToken,
        ) -> AgentResult<AgentOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutcome {
                transcript: format!("ran {}", self.name),
                stderr_tail: String::new(),
                agent_name: self.name.to_string(),
                duration: Duration::from_millis(1),
                stdout_truncated: false,
            })
        }
    }

    fn agents_config(default: &str, routes: &[(&str, &str)]) -> AgentsConfig {
        AgentsConfig {
            default: default.to_string(),
            routes: routes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            claude_code: ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
            codex: ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
        }
    }

    fn request() -> AgentRequest {
        AgentRequest {
            prompt: "p".to_string(),
            workspace_dir: PathBuf::from("."),
            model_override: None,
        }
    }

    #[tokio::test]
    async fn test_requested_agent_wins_over_route_and_default() {
        let registry = AgentRegistry::new(
            vec![
                FakeRunner::new("claude_code", true),
                FakeRunner::new("codex", true),
            ],
            agents_config("claude_code", &[("bt", "claude_code")]),
        );
        let outcome = registry
            .run_with_fallback(Some("codex"), "bt", &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.agent_name, "codex");
    }

    #[tokio::test]
    async fn test_rule_route_wins_over_default() {
        let registry = AgentRegistry::new(
            vec![
                FakeRunner::new("claude_code", true),
                FakeRunner::new("codex", true),
            ],
            agents_config("claude_code", &[("bt", "codex")]),
        );
        let outcome = registry
            .run_with_fallback(None, "bt", &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.agent_name, "codex");
    }

    #[tokio::test]
    async fn test_unavailable_preferred_falls_back() {
        let registry = AgentRegistry::new(
            vec![
                FakeRunner::new("claude_code", false),
                FakeRunner::new("codex", true),
            ],
            agents_config("claude_code", &[]),
        );
        let outcome = registry
            .run_with_fallback(None, "any", &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.agent_name, "codex");
    }

    #[tokio::test]
    async fn test_no_provider_available() {
        let registry = AgentRegistry::new(
            vec![
                FakeRunner::new("claude_code", false),
                FakeRunner::new("codex", false),
            ],
            agents_config("claude_code", &[]),
        );
        let err = registry
            .run_with_fallback(None, "any", &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoProviderAvailable));
    }

    #[tokio::test]
    async fn test_unknown_requested_provider_errors() {
        let registry = AgentRegistry::new(
            vec![FakeRunner::new("claude_code", true)],
            agents_config("claude_code", &[]),
        );
        let err = registry
            .run_with_fallback(Some("gemini"), "any", &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownProvider(_)));
    }

    #[test]
    fn test_stderr_tail() {
        let text = "a\nb\nc\nd";
        assert_eq!(stderr_tail(text, 2), "c\nd");
        assert_eq!(stderr_tail(text, 10), "a\nb\nc\nd");
    }
}
