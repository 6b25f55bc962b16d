//! The analysis pipeline: composes materialization, rule selection,
//! pre-extraction, the agent run, and result persistence for one task,
//! emitting progress milestones along the way.
//!
//! Stage percents:
//!
//! | stage               | state                  | percent |
//! |---------------------|------------------------|---------|
//! | enqueued            | queued                 | 0       |
//! | resolving artifacts | downloading            | 5–20    |
//! | decrypt + extract   | decrypting/extracting  | 20–40   |
//! | pre-extract         | extracting             | 40–50   |
//! | agent run           | analyzing              | 50–95   |
//! | persist + notify    | analyzing              | 95–99   |
//! | finalize            | done/failed/cancelled  | 100     |

use crate::agent::{AgentRegistry, AgentRequest};
use crate::config::PipelineConfig;
use crate::errors::{FailureKind, PipelineFailure, PipelineResult};
use crate::extractor::Extractor;
use crate::materializer::{MaterializePhase, Materializer};
use crate::progress::ProgressBus;
use crate::result_parser;
use crate::rules::{select_rules, RuleCatalog, Selection};
use crate::store::SqliteStore;
use crate::types::{AnalysisResult, Issue, ProgressEvent, Task, TaskState};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Instruction appended to every prompt so the result parser has something
/// to find. The schema mirrors [`crate::result_parser::ParsedAnalysis`].
const RESULT_FORMAT_INSTRUCTION: &str = r#"
## Output format

End your reply with exactly one fenced JSON block:

```json
{
  "problem_type": "<short classification, user's language>",
  "problem_type_en": "<same in English>",
  "root_cause": "<root cause analysis, user's language>",
  "root_cause_en": "<same in English>",
  "confidence": "high | medium | low",
  "confidence_reason": "<why>",
  "key_evidence": ["<log line>", "..."],
  "user_reply": "<customer-ready reply, user's language>",
  "user_reply_en": "<same in English>",
  "needs_engineer": false,
  "requires_more_info": false,
  "next_steps": ["<step>", "..."],
  "fix_suggestion": "<optional code or config fix>"
}
```

`problem_type` and `root_cause` are mandatory. Quote key_evidence lines
verbatim from the logs.
"#;

/// Outbound notification seam; the daemon wires webhooks behind it.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn task_finished(&self, issue: &Issue, task: &Task, result: Option<&AnalysisResult>);
}

/// Default notifier for tests and webhook-less deployments.
pub struct NoopNotifier;

#[async_trait]
impl CompletionNotifier for NoopNotifier {
    async fn task_finished(&self, _issue: &Issue, _task: &Task, _result: Option<&AnalysisResult>) {}
}

pub struct Pipeline {
    store: Arc<SqliteStore>,
    catalog: Arc<RuleCatalog>,
    materializer: Arc<Materializer>,
    agents: Arc<AgentRegistry>,
    progress: Arc<ProgressBus>,
    notifier: Arc<dyn CompletionNotifier>,
    config: PipelineConfig,
    workspace_root: PathBuf,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        catalog: Arc<RuleCatalog>,
        materializer: Arc<Materializer>,
        agents: Arc<AgentRegistry>,
        progress: Arc<ProgressBus>,
        notifier: Arc<dyn CompletionNotifier>,
        config: PipelineConfig,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            store,
            catalog,
            materializer,
            agents,
            progress,
            notifier,
            config,
            workspace_root,
        }
    }

    /// Drive one task from `queued` to a terminal state. Never returns an
    /// error: failures are persisted, published, and notified here.
    pub async fn run_task(&self, task: Task, cancel: CancellationToken) {
        let task_id = task.task_id;
        info!(task_id = %task_id, issue_id = %task.issue_id, "Pipeline started");

        match self.run_stages(&task, &cancel).await {
            Ok(result) => {
                info!(task_id = %task_id, rule = %result.matched_rule_id, agent = %result.agent_name, "Analysis complete");
            }
            Err(failure) => {
                self.finish_failed(&task, failure, &cancel).await;
            }
        }
    }

    async fn run_stages(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> PipelineResult<AnalysisResult> {
        let issue = self
            .store
            .get_issue(&task.issue_id)
            .await
            .map_err(|e| PipelineFailure::new(FailureKind::BadRequest, e.to_string()))?
            .ok_or_else(|| {
                PipelineFailure::new(
                    FailureKind::BadRequest,
                    format!("issue {} not found", task.issue_id),
                )
            })?;

        // Stage: resolving artifacts + decrypt + extract (C).
        self.update(task.task_id, TaskState::Downloading, 5, "resolving artifacts")
            .await?;
        let workspace = Workspace::create(&self.workspace_root, task.task_id)
            .map_err(PipelineFailure::from)?;

        let summary = self
            .materialize_with_progress(&issue, &workspace, cancel)
            .await?;
        self.check_cancel(cancel)?;
        self.update(
            task.task_id,
            TaskState::Extracting,
            40,
            &format!(
                "materialized {} files ({} bytes)",
                summary.files_written, summary.bytes_written
            ),
        )
        .await?;

        // Stage: rule selection (B).
        let catalog = self.catalog.snapshot();
        let selection = select_rules(&catalog, &issue.description, issue.category.as_deref())
            .map_err(|e| PipelineFailure::new(FailureKind::RuleSelectFailure, e.to_string()))?;
        info!(task_id = %task.task_id, primary = %selection.primary_id, rules = selection.rules.len(), "Rules selected");

        let mut code_note = None;
        if selection.primary().needs_code {
            let unavailable = self
                .materializer
                .mirror_code_tree(&workspace)
                .map_err(PipelineFailure::from)?;
            if unavailable {
                code_note = Some("code tree unavailable; analysis proceeded without it");
            }
        }

        // Stage: pre-extraction (D).
        self.update(task.task_id, TaskState::Extracting, 42, "pre-extracting log snippets")
            .await?;
        let specs = selection.primary().pre_extract.clone();
        let logs_dir = workspace.logs_dir();
        let event_date = issue.event_date;
        let extractor = Extractor::new(
            self.config.max_lines_per_pattern,
            Duration::from_secs(self.config.pattern_timeout_secs),
        );
        let report = tokio::task::spawn_blocking(move || {
            extractor.extract(&specs, &logs_dir, event_date)
        })
        .await
        .map_err(|e| PipelineFailure::new(FailureKind::ExtractFailure, e.to_string()))?;
        self.check_cancel(cancel)?;
        self.update(
            task.task_id,
            TaskState::Extracting,
            50,
            &format!("pre-extracted {} lines", report.total_lines()),
        )
        .await?;

        // Stage: agent run (E).
        let prompt = build_prompt(&issue, &selection, &report.to_prompt_block(), code_note);
        workspace.write_prompt(&prompt).map_err(PipelineFailure::from)?;
        self.update(task.task_id, TaskState::Analyzing, 50, "running analysis agent")
            .await?;

        let request = AgentRequest {
            prompt,
            workspace_dir: workspace.root().to_path_buf(),
            model_override: None,
        };
        let outcome = self
            .agents
            .run_with_fallback(
                task.requested_agent.as_deref(),
                &selection.primary_id,
                &request,
                cancel,
            )
            .await
            .map_err(PipelineFailure::from)?;
        workspace
            .write_transcript(&outcome.transcript)
            .map_err(PipelineFailure::from)?;
        self.update(
            task.task_id,
            TaskState::Analyzing,
            95,
            &format!("agent {} finished", outcome.agent_name),
        )
        .await?;

        // Stage: result parsing + persistence (F).
        let parsed = result_parser::parse_transcript(&outcome.transcript)
            .map_err(PipelineFailure::from)?;
        let result = parsed.into_result(
            task.task_id,
            issue.record_id.clone(),
            selection.primary_id.clone(),
            outcome.agent_name.clone(),
        );
        self.store
            .save_result(&result)
            .await
            .map_err(|e| PipelineFailure::new(FailureKind::ParseFailure, e.to_string()))?;
        self.update(task.task_id, TaskState::Analyzing, 99, "result persisted")
            .await?;

        let finished = self
            .store
            .complete_task(task.task_id, "analysis complete")
            .await
            .map_err(|e| PipelineFailure::new(FailureKind::ParseFailure, e.to_string()))?;
        self.progress.publish(ProgressEvent::from_task(&finished));

        if let Err(e) = workspace.remove() {
            warn!(task_id = %task.task_id, error = %e, "Workspace cleanup failed");
        }
        self.notifier
            .task_finished(&issue, &finished, Some(&result))
            .await;
        Ok(result)
    }

    async fn materialize_with_progress(
        &self,
        issue: &Issue,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PipelineResult<crate::materializer::MaterializeSummary> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = self.store.clone();
        let progress = self.progress.clone();
        let task_id = workspace.task_id();

        // Forward coarse materializer phases into progress milestones; the
        // forwarder is the only writer while materialization runs. Later
        // artifacts report Fetching again, so the state is clamped to stay
        // non-decreasing while the message keeps the per-artifact detail.
        let forwarder = tokio::spawn(async move {
            let mut floor = TaskState::Downloading;
            while let Some(phase) = rx.recv().await {
                let (state, percent, message) = match phase {
                    MaterializePhase::Fetching { index, total } => (
                        TaskState::Downloading,
                        5 + span_percent(15, index, total),
                        format!("fetching artifact {}/{}", index + 1, total),
                    ),
                    MaterializePhase::Decrypting { index, total } => (
                        TaskState::Decrypting,
                        20 + span_percent(10, index, total),
                        format!("decrypting artifact {}/{}", index + 1, total),
                    ),
                    MaterializePhase::Extracting { index, total } => (
                        TaskState::Extracting,
                        30 + span_percent(10, index, total),
                        format!("extracting artifact {}/{}", index + 1, total),
                    ),
                };
                let state = if state.rank() < floor.rank() { floor } else { state };
                floor = state;
                match store
                    .update_task_progress(task_id, state, percent, &message)
                    .await
                {
                    Ok(task) => progress.publish(ProgressEvent::from_task(&task)),
                    Err(e) => warn!(task_id = %task_id, error = %e, "Progress update failed"),
                }
            }
        });

        let result = self
            .materializer
            .materialize(issue, workspace, Some(&tx), cancel)
            .await;
        drop(tx);
        let _ = forwarder.await;

        self.check_cancel(cancel)?;
        result.map_err(PipelineFailure::from)
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            Err(PipelineFailure::new(FailureKind::Cancelled, "task cancelled"))
        } else {
            Ok(())
        }
    }

    async fn update(
        &self,
        task_id: Uuid,
        state: TaskState,
        percent: u8,
        message: &str,
    ) -> PipelineResult<()> {
        let task = self
            .store
            .update_task_progress(task_id, state, percent, message)
            .await
            .map_err(|e| PipelineFailure::new(FailureKind::BadRequest, e.to_string()))?;
        self.progress.publish(ProgressEvent::from_task(&task));
        Ok(())
    }

    /// Failure epilogue: persist, publish the final event, keep a post-mortem
    /// snapshot (except on cancel, where the workspace just goes away), and
    /// notify any webhook.
    async fn finish_failed(&self, task: &Task, failure: PipelineFailure, _cancel: &CancellationToken) {
        error!(task_id = %task.task_id, kind = %failure.kind, message = %failure.message, "Pipeline failed");

        let finished = match self
            .store
            .fail_task(task.task_id, failure.kind, &failure.message)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Failed to persist task failure");
                return;
            }
        };
        self.progress.publish(ProgressEvent::from_task(&finished));

        if let Some(workspace) = Workspace::open(&self.workspace_root, task.task_id) {
            let cleanup = if failure.kind == FailureKind::Cancelled {
                workspace.remove()
            } else {
                workspace.snapshot_and_clean()
            };
            if let Err(e) = cleanup {
                warn!(task_id = %task.task_id, error = %e, "Workspace cleanup failed");
            }
        }

        if let Ok(Some(issue)) = self.store.get_issue(&task.issue_id).await {
            self.notifier.task_finished(&issue, &finished, None).await;
        }
    }
}

/// Linear sub-progress within a stage's percent span.
fn span_percent(span: u8, index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((span as usize * index) / total) as u8
}

/// Assemble the agent prompt: playbooks in dependency order (primary last),
/// the ticket, the pre-extracted snippets, then the output contract.
fn build_prompt(
    issue: &Issue,
    selection: &Selection,
    extract_block: &str,
    code_note: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str("# Diagnostic playbooks\n\n");
    for rule in &selection.rules {
        prompt.push_str(&format!("## {} ({})\n\n{}\n\n", rule.name, rule.id, rule.body));
    }

    prompt.push_str("# Ticket\n\n");
    prompt.push_str(&format!("Description: {}\n", issue.description));
    if let Some(serial) = &issue.device_serial {
        prompt.push_str(&format!("Device serial: {}\n", serial));
    }
    if let Some(firmware) = &issue.firmware {
        prompt.push_str(&format!("Firmware: {}\n", firmware));
    }
    if let Some(app) = &issue.app_version {
        prompt.push_str(&format!("App version: {}\n", app));
    }
    if let Some(platform) = &issue.platform {
        prompt.push_str(&format!("Platform: {}\n", platform));
    }
    if let Some(date) = &issue.event_date {
        prompt.push_str(&format!("Event date: {}\n", date));
    }
    prompt.push('\n');

    prompt.push_str(
        "The decrypted device logs are under `logs/` in your working directory; \
         read further files there as needed.\n",
    );
    if let Some(note) = code_note {
        prompt.push_str(&format!("Note: {}\n", note));
    }
    prompt.push('\n');

    if !extract_block.is_empty() {
        prompt.push_str("# Pre-extracted log snippets\n\n");
        prompt.push_str(extract_block);
        prompt.push('\n');
    }

    prompt.push_str(RESULT_FORMAT_INSTRUCTION);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutcome, AgentRunner, AvailabilityProbe};
    use crate::config::{AgentsConfig, ProviderConfig, WorkspaceConfig};
    use crate::errors::{AgentError, AgentResult};
    use crate::materializer::{HttpArtifactResolver, PassthroughCodec};
    use crate::rules::catalog::Rule;
    use crate::types::Priority;
    use parking_lot::Mutex;

    /// Agent that returns a canned transcript (or error) without a subprocess.
    struct ScriptedAgent {
        transcript: Mutex<Option<String>>,
        fail_with: Mutex<Option<AgentError>>,
    }

    impl ScriptedAgent {
        fn ok(transcript: &str) -> Arc<Self> {
            Arc::new(Self {
                transcript: Mutex::new(Some(transcript.to_string())),
                fail_with: Mutex::new(None),
            })
        }

        fn failing(error: AgentError) -> Arc<Self> {
            Arc::new(Self {
                transcript: Mutex::new(None),
                fail_with: Mutex::new(Some(error)),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        fn name(&self) -> &'static str {
            "claude_code"
        }

        async fn available(&self) -> AvailabilityProbe {
            AvailabilityProbe {
                name: "claude_code".to_string(),
                enabled: true,
                available: true,
                version: Some("test".to_string()),
                error: None,
            }
        }

        async fn run(
            &self,
            _request: &AgentRequest,
            _cancel: &CancellationToken,
        ) -> AgentResult<AgentOutcome> {
            if let Some(err) = self.fail_with.lock().take() {
                return Err(err);
            }
            Ok(AgentOutcome {
                transcript: self.transcript.lock().clone().unwrap_or_default(),
                stderr_tail: String::new(),
                agent_name: "claude_code".to_string(),
                duration: Duration::from_millis(5),
                stdout_truncated: false,
            })
        }
    }

    struct Harness {
        pipeline: Pipeline,
        store: Arc<SqliteStore>,
        _rules_dir: tempfile::TempDir,
        _workspace_dir: tempfile::TempDir,
    }

    async fn harness(agent: Arc<dyn AgentRunner>) -> Harness {
        let rules_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            rules_dir.path().join("bluetooth.md"),
            "---\nid = \"bluetooth\"\nname = \"Bluetooth\"\nkeywords = [\"bluetooth\"]\npriority = 8\n\n[[pre_extract]]\nname = \"bt-lines\"\npattern = \"bt|pairing\"\ndate_filter = false\n---\nCheck the pairing state machine.\n",
        )
        .unwrap();
        std::fs::write(
            rules_dir.path().join("general.md"),
            "---\nid = \"general\"\nname = \"General\"\npriority = 0\n---\nGeneral triage checklist.\n",
        )
        .unwrap();

        let workspace_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let catalog = Arc::new(RuleCatalog::load(rules_dir.path()).unwrap());
        let ws_config = WorkspaceConfig {
            root: workspace_dir.path().to_path_buf(),
            ..WorkspaceConfig::default()
        };
        let materializer = Arc::new(Materializer::new(
            ws_config,
            Arc::new(HttpArtifactResolver::new("http://127.0.0.1:0")),
            Arc::new(PassthroughCodec),
            Duration::from_secs(30),
        ));
        let agents_config = AgentsConfig {
            claude_code: ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
            ..AgentsConfig::default()
        };
        let agents = Arc::new(AgentRegistry::new(vec![agent], agents_config));
        let pipeline = Pipeline::new(
            store.clone(),
            catalog,
            materializer,
            agents,
            Arc::new(ProgressBus::new()),
            Arc::new(NoopNotifier),
            PipelineConfig::default(),
            workspace_dir.path().to_path_buf(),
        );
        Harness {
            pipeline,
            store,
            _rules_dir: rules_dir,
            _workspace_dir: workspace_dir,
        }
    }

    async fn submit(harness: &Harness, description: &str) -> Task {
        let mut issue = crate::store::tests_support::issue_fixture("REC-1");
        issue.description = description.to_string();
        harness.store.save_issue(&issue).await.unwrap();
        let task = Task::new(issue.record_id.clone(), Priority::Low);
        harness.store.admit_task(&task).await.unwrap();
        task
    }

    const AGENT_REPLY: &str = "Looked at logs.\n```json\n{\"problem_type\": \"bt\", \"root_cause\": \"watchdog\", \"confidence\": \"medium\"}\n```";

    #[tokio::test]
    async fn test_successful_run_persists_result_and_cleans_workspace() {
        let h = harness(ScriptedAgent::ok(AGENT_REPLY)).await;
        let task = submit(&h, "bluetooth pairing fails").await;

        h.pipeline.run_task(task.clone(), CancellationToken::new()).await;

        let finished = h.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.state, TaskState::Done);
        assert_eq!(finished.progress_percent, 100);

        let result = h.store.get_result(task.task_id).await.unwrap().unwrap();
        assert_eq!(result.problem_type, "bt");
        assert_eq!(result.matched_rule_id, "bluetooth");
        assert_eq!(result.agent_name, "claude_code");

        // Workspace is gone on success.
        assert!(Workspace::open(h._workspace_dir.path(), task.task_id).is_none());
    }

    #[tokio::test]
    async fn test_agent_timeout_fails_with_snapshot() {
        let h = harness(ScriptedAgent::failing(AgentError::Timeout(5))).await;
        let task = submit(&h, "bluetooth pairing fails").await;

        h.pipeline.run_task(task.clone(), CancellationToken::new()).await;

        let finished = h.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.state, TaskState::Failed);
        assert!(finished.error.unwrap().starts_with("AgentTimeout:"));

        // Snapshot retained for post-mortem.
        let workspace = Workspace::open(h._workspace_dir.path(), task.task_id).unwrap();
        assert!(workspace.snapshot_path().is_file());

        // No result was written.
        assert!(h.store.get_result(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unparseable_transcript_is_parse_failure() {
        let h = harness(ScriptedAgent::ok("I could not reach a conclusion.")).await;
        let task = submit(&h, "bluetooth pairing fails").await;

        h.pipeline.run_task(task.clone(), CancellationToken::new()).await;

        let finished = h.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.state, TaskState::Failed);
        assert!(finished.error.unwrap().starts_with("ParseFailure:"));
    }

    #[tokio::test]
    async fn test_pre_cancelled_task_lands_in_cancelled() {
        let h = harness(ScriptedAgent::ok(AGENT_REPLY)).await;
        let task = submit(&h, "bluetooth pairing fails").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        h.pipeline.run_task(task.clone(), cancel).await;

        let finished = h.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(finished.state, TaskState::Cancelled);
        assert!(finished.error.is_none());
        // Cancel removes the workspace outright, no snapshot.
        assert!(Workspace::open(h._workspace_dir.path(), task.task_id).is_none());
        assert!(h.store.get_result(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_rule_used_on_keyword_miss() {
        let h = harness(ScriptedAgent::ok(AGENT_REPLY)).await;
        let task = submit(&h, "random gibberish about user login").await;

        h.pipeline.run_task(task.clone(), CancellationToken::new()).await;

        let result = h.store.get_result(task.task_id).await.unwrap().unwrap();
        assert_eq!(result.matched_rule_id, "general");
    }

    #[test]
    fn test_build_prompt_order() {
        let issue = crate::store::tests_support::issue_fixture("REC-1");
        let rule = Rule {
            id: "bt".to_string(),
            name: "Bluetooth".to_string(),
            version: 1,
            enabled: true,
            keywords: vec!["bluetooth".to_string()],
            priority: 8,
            depends_on: vec![],
            needs_code: false,
            pre_extract: vec![],
            body: "Playbook body.".to_string(),
            path: PathBuf::new(),
        };
        let selection = Selection {
            rules: vec![Arc::new(rule)],
            primary_id: "bt".to_string(),
        };
        let prompt = build_prompt(&issue, &selection, "bt-lines -> [\n  x\n]\n", None);
        let playbook_pos = prompt.find("Playbook body.").unwrap();
        let ticket_pos = prompt.find("# Ticket").unwrap();
        let snippet_pos = prompt.find("# Pre-extracted").unwrap();
        let format_pos = prompt.find("## Output format").unwrap();
        assert!(playbook_pos < ticket_pos);
        assert!(ticket_pos < snippet_pos);
        assert!(snippet_pos < format_pos);
    }

    #[test]
    fn test_span_percent_bounds() {
        assert_eq!(span_percent(15, 0, 4), 0);
        assert_eq!(span_percent(15, 3, 4), 11);
        assert_eq!(span_percent(15, 0, 0), 0);
    }
}
