/// Configuration management for the triage service.
/// Handles loading, parsing, and validation of triage.toml
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level configuration structure for the triage service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriageConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage and persistence settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rule catalog settings
    #[serde(default)]
    pub rules: RulesConfig,

    /// Workspace and artifact settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Agent provider settings
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Pipeline and scheduler settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Outbound notification settings
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Bind port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Optional static bearer token; when set, mutating endpoints require it
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Expose the Prometheus /metrics endpoint
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

fn default_http_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8700
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            http_port: default_http_port(),
            auth_token: None,
            enable_metrics: true,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory where inline log uploads are spooled before analysis
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/triage.db")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            uploads_dir: default_uploads_dir(),
        }
    }
}

/// Rule catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Directory tree holding rule files
    #[serde(default = "default_rules_dir")]
    pub dir: PathBuf,

    /// Reload the catalog automatically when rule files change on disk
    #[serde(default)]
    pub watch: bool,
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: default_rules_dir(),
            watch: false,
        }
    }
}

/// Workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root under which per-task workspace directories are created
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,

    /// Days failed-task snapshots are retained before the sweeper deletes them
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Total uncompressed bytes allowed per workspace
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    /// Largest single archive entry accepted
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,

    /// File suffix marking the proprietary encrypted container
    #[serde(default = "default_encrypted_suffix")]
    pub encrypted_suffix: String,

    /// Source tree mirrored into `code/` when a rule sets `needs_code`
    #[serde(default)]
    pub code_root: Option<PathBuf>,

    /// Base URL of the external artifact resolver for token-based artifacts
    #[serde(default)]
    pub artifact_resolver_url: Option<String>,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("data/workspaces")
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_total_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_entry_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_encrypted_suffix() -> String {
    ".enc".to_string()
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            retention_days: default_retention_days(),
            max_total_bytes: default_max_total_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
            encrypted_suffix: default_encrypted_suffix(),
            code_root: None,
            artifact_resolver_url: None,
        }
    }
}

/// Agent provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Global default provider name
    #[serde(default = "default_agent")]
    pub default: String,

    /// Per-rule provider routing: rule id -> provider name
    #[serde(default)]
    pub routes: HashMap<String, String>,

    /// Claude Code CLI provider
    #[serde(default)]
    pub claude_code: ProviderConfig,

    /// Codex CLI provider
    #[serde(default)]
    pub codex: ProviderConfig,
}

fn default_agent() -> String {
    "claude_code".to_string()
}

impl AgentsConfig {
    /// Look up a provider's configuration by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "claude_code" => Some(&self.claude_code),
            "codex" => Some(&self.codex),
            _ => None,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default: default_agent(),
            routes: HashMap::new(),
            claude_code: ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
            codex: ProviderConfig::default(),
        }
    }
}

/// One subprocess provider's settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Whether this provider may be selected
    #[serde(default)]
    pub enabled: bool,

    /// Binary name or path; defaults to the provider's conventional name
    #[serde(default)]
    pub binary: Option<String>,

    /// Model override passed to the CLI
    #[serde(default)]
    pub model: Option<String>,

    /// Wall-clock limit for one agent run
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,

    /// Maximum agent turns (0 = provider default)
    #[serde(default)]
    pub max_turns: u32,

    /// Additional CLI flags appended verbatim
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

fn default_agent_timeout() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: None,
            model: None,
            timeout_secs: default_agent_timeout(),
            max_turns: 0,
            extra_flags: vec![],
        }
    }
}

/// Pipeline and scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Matching lines kept per pre-extract pattern
    #[serde(default = "default_max_lines")]
    pub max_lines_per_pattern: usize,

    /// Soft deadline for one pre-extract pattern over the whole log tree
    #[serde(default = "default_pattern_timeout")]
    pub pattern_timeout_secs: u64,

    /// Per-artifact fetch / decrypt+extract deadline
    #[serde(default = "default_artifact_timeout")]
    pub artifact_timeout_secs: u64,

    /// Non-terminal tasks older than this are failed on startup recovery
    #[serde(default = "default_stale_secs")]
    pub stale_task_secs: u64,

    /// Agent stdout capture ceiling
    #[serde(default = "default_stdout_limit")]
    pub stdout_limit_bytes: usize,
}

fn default_workers() -> usize {
    3
}

fn default_max_lines() -> usize {
    200
}

fn default_pattern_timeout() -> u64 {
    30
}

fn default_artifact_timeout() -> u64 {
    300
}

fn default_stale_secs() -> u64 {
    600
}

fn default_stdout_limit() -> usize {
    16 * 1024 * 1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_lines_per_pattern: default_max_lines(),
            pattern_timeout_secs: default_pattern_timeout(),
            artifact_timeout_secs: default_artifact_timeout(),
            stale_task_secs: default_stale_secs(),
            stdout_limit_bytes: default_stdout_limit(),
        }
    }
}

/// Outbound notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    /// Chat webhook used by issue escalation
    #[serde(default)]
    pub chat_webhook_url: Option<String>,

    /// Project-tracker integration
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Project-tracker webhook settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackerConfig {
    /// Shared secret for webhook signature verification; unset disables it
    #[serde(default)]
    pub secret: Option<String>,

    /// Mention token that triggers analysis from a tracker event
    #[serde(default = "default_mention")]
    pub mention_token: String,

    /// Base URL for posting follow-up comments
    #[serde(default)]
    pub comment_url: Option<String>,
}

fn default_mention() -> String {
    "@triage".to_string()
}

impl TriageConfig {
    /// Load configuration from a TOML file. Missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string, warning on unknown sections.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let value: toml::Value = raw.parse()?;
        if let Some(table) = value.as_table() {
            const KNOWN: &[&str] = &[
                "server",
                "storage",
                "rules",
                "workspace",
                "agents",
                "pipeline",
                "notify",
            ];
            for key in table.keys() {
                if !KNOWN.contains(&key.as_str()) {
                    warn!("Unknown config section '{}' ignored", key);
                }
            }
        }

        let config: TriageConfig = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check values that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.workspace.max_entry_bytes > self.workspace.max_total_bytes {
            anyhow::bail!("workspace.max_entry_bytes exceeds workspace.max_total_bytes");
        }
        if self.agents.default != "claude_code" && self.agents.default != "codex" {
            anyhow::bail!("agents.default must name a known provider: {}", self.agents.default);
        }
        for (rule_id, provider) in &self.agents.routes {
            if provider != "claude_code" && provider != "codex" {
                anyhow::bail!("agents.routes.{} names unknown provider {}", rule_id, provider);
            }
        }
        Ok(())
    }

    /// Provider settings by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "claude_code" => Some(&self.agents.claude_code),
            "codex" => Some(&self.agents.codex),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TriageConfig::default();
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(config.workspace.retention_days, 7);
        assert_eq!(config.workspace.max_total_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.agents.default, "claude_code");
        assert!(config.agents.claude_code.enabled);
        assert!(!config.agents.codex.enabled);
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            [server]
            http_port = 9000

            [agents.codex]
            enabled = true
            model = "o4-mini"

            [pipeline]
            workers = 5
        "#;
        let config = TriageConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.server.http_addr, "127.0.0.1");
        assert!(config.agents.codex.enabled);
        assert_eq!(config.agents.codex.model.as_deref(), Some("o4-mini"));
        assert_eq!(config.pipeline.workers, 5);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let raw = "[pipeline]\nworkers = 0\n";
        assert!(TriageConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_route_provider() {
        let raw = "[agents.routes]\nbluetooth = \"gemini\"\n";
        assert!(TriageConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_provider_lookup() {
        let config = TriageConfig::default();
        assert!(config.provider("claude_code").is_some());
        assert!(config.provider("codex").is_some());
        assert!(config.provider("nope").is_none());
    }
}
