//! Request handlers for the HTTP surface. Routing and status mapping live
//! in `server.rs`; everything here takes parsed inputs and returns JSON
//! values or a typed error.

use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use crate::webhooks::{verify_signature, TrackerEvent};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use triage_core::agent::AgentRegistry;
use triage_core::config::TriageConfig;
use triage_core::progress::ProgressBus;
use triage_core::queue::{CreateTaskOptions, TaskQueue};
use triage_core::rules::{Rule, RuleCatalog, RulePatch};
use triage_core::store::{IssueFilter, Page, SqliteStore};
use triage_core::types::{Issue, IssueSource, LogArtifact, Priority, TaskState};
use uuid::Uuid;

/// Shared state handed to every handler.
pub struct AppState {
    pub config: TriageConfig,
    pub store: Arc<SqliteStore>,
    pub catalog: Arc<RuleCatalog>,
    pub queue: Arc<TaskQueue>,
    pub progress: Arc<ProgressBus>,
    pub agents: Arc<AgentRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub client: reqwest::Client,
}

// ----------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------

pub async fn handle_health(state: &AppState) -> Value {
    json!({
        "status": "ok",
        "version": triage_core::VERSION,
        "workers": state.queue.worker_target(),
        "running": state.queue.running_tasks(),
        "queued": state.queue.queued_tasks(),
    })
}

pub async fn handle_health_agents(state: &AppState) -> Value {
    let probes = state.agents.probe_all().await;
    json!({ "agents": probes })
}

// ----------------------------------------------------------------------
// Analyze (multipart entry point)
// ----------------------------------------------------------------------

/// Consume the multipart form: `description` (required), `device_sn`,
/// `priority`, `webhook_url`, `log_files[]`. Uploaded files are spooled
/// under the uploads directory and attached as inline artifacts.
pub async fn handle_analyze(
    state: &AppState,
    mut multipart: multer::Multipart<'static>,
) -> DaemonResult<Value> {
    let record_id = format!("API-{}", Uuid::new_v4().simple());
    let upload_dir = state.config.storage.uploads_dir.join(&record_id);

    let mut description: Option<String> = None;
    let mut device_sn: Option<String> = None;
    let mut priority = Priority::Low;
    let mut webhook_url: Option<String> = None;
    let mut artifacts: Vec<LogArtifact> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DaemonError::BadRequest(format!("multipart: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "description" => {
                description = Some(read_text_field(field).await?);
            }
            "device_sn" => {
                device_sn = Some(read_text_field(field).await?);
            }
            "priority" => {
                priority = Priority::from_str_loose(&read_text_field(field).await?);
            }
            "webhook_url" => {
                webhook_url = Some(read_text_field(field).await?);
            }
            "log_files" | "log_files[]" => {
                let file_name = field
                    .file_name()
                    .map(sanitize_upload_name)
                    .unwrap_or_else(|| format!("upload-{}.bin", artifacts.len()));
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| DaemonError::BadRequest(format!("upload read: {}", e)))?;
                std::fs::create_dir_all(&upload_dir)
                    .map_err(|e| DaemonError::ServerError(e.to_string()))?;
                let path = upload_dir.join(&file_name);
                std::fs::write(&path, &bytes)
                    .map_err(|e| DaemonError::ServerError(e.to_string()))?;
                artifacts.push(LogArtifact {
                    name: file_name,
                    token: None,
                    local_path: Some(path.display().to_string()),
                    size: bytes.len() as u64,
                });
            }
            other => {
                warn!(field = other, "Unknown multipart field ignored");
            }
        }
    }

    let description = description
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| DaemonError::BadRequest("description is required".to_string()))?;

    let issue = Issue {
        record_id: record_id.clone(),
        description,
        priority,
        device_serial: device_sn,
        firmware: None,
        app_version: None,
        platform: None,
        category: None,
        source: IssueSource::Api,
        external_links: vec![],
        created_by: None,
        created_at: Utc::now(),
        log_artifacts: artifacts,
        event_date: None,
        webhook_url,
        soft_deleted: false,
    };
    state.store.save_issue(&issue).await?;

    let admission = state
        .queue
        .create_task(&record_id, CreateTaskOptions::default())
        .await?;
    state.metrics.tasks_created.inc();
    info!(issue_id = %record_id, task_id = %admission.task().task_id, "Analyze request accepted");

    Ok(json!({
        "task_id": admission.task().task_id,
        "issue_id": record_id,
        "status": admission.task().state.as_str(),
    }))
}

async fn read_text_field(field: multer::Field<'static>) -> DaemonResult<String> {
    field
        .text()
        .await
        .map_err(|e| DaemonError::BadRequest(format!("field read: {}", e)))
}

/// Keep only the file's base name so uploads cannot steer the spool path.
fn sanitize_upload_name(name: &str) -> String {
    let base = PathBuf::from(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        "upload.bin".to_string()
    } else {
        base
    }
}

/// Combined progress/result view used by `GET /analyze/{task_id}`.
pub async fn handle_analyze_status(state: &AppState, task_id: Uuid) -> DaemonResult<Value> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("task {}", task_id)))?;

    let result = if task.state == TaskState::Done {
        state.store.get_result(task_id).await?
    } else {
        None
    };

    Ok(json!({
        "task": task,
        "result": result,
    }))
}

// ----------------------------------------------------------------------
// Tasks
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub issue_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

pub async fn handle_create_task(state: &AppState, body: CreateTaskBody) -> DaemonResult<Value> {
    let admission = state
        .queue
        .create_task(
            &body.issue_id,
            CreateTaskOptions {
                requested_agent: body.agent_type,
                requested_by: body.username,
            },
        )
        .await?;
    if admission.is_created() {
        state.metrics.tasks_created.inc();
    }
    Ok(json!({
        "task_id": admission.task().task_id,
        "status": admission.task().state.as_str(),
        "deduplicated": !admission.is_created(),
    }))
}

pub async fn handle_get_task(state: &AppState, task_id: Uuid) -> DaemonResult<Value> {
    // The bus snapshot is fresher than the store row while a worker holds
    // the task; prefer it when present.
    if let Some(event) = state.progress.latest(task_id) {
        return Ok(json!({
            "task_id": event.task_id,
            "state": event.state.as_str(),
            "progress_percent": event.progress_percent,
            "message": event.message,
            "updated_at": event.updated_at,
        }));
    }
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("task {}", task_id)))?;
    Ok(serde_json::to_value(task).map_err(|e| DaemonError::ServerError(e.to_string()))?)
}

pub async fn handle_list_tasks(state: &AppState, query: &QueryParams) -> DaemonResult<Value> {
    let state_filter = query
        .get("state")
        .and_then(|s| TaskState::from_str_loose(s));
    let tasks = state
        .store
        .list_tasks(state_filter, query.page())
        .await?;
    Ok(json!({ "tasks": tasks }))
}

pub async fn handle_task_result(state: &AppState, task_id: Uuid) -> DaemonResult<Value> {
    let result = state
        .store
        .get_result(task_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("result for task {}", task_id)))?;
    Ok(serde_json::to_value(result).map_err(|e| DaemonError::ServerError(e.to_string()))?)
}

pub async fn handle_cancel_task(state: &AppState, task_id: Uuid) -> DaemonResult<Value> {
    let task_state = state.queue.cancel(task_id).await?;
    Ok(json!({
        "task_id": task_id,
        "status": task_state.as_str(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetWorkersBody {
    pub workers: usize,
}

/// Runtime worker-pool resize; shrink takes effect as running tasks finish.
pub fn handle_set_workers(state: &AppState, body: SetWorkersBody) -> Value {
    state.queue.set_workers(body.workers);
    json!({ "workers": state.queue.worker_target() })
}

// ----------------------------------------------------------------------
// Issues
// ----------------------------------------------------------------------

pub async fn handle_list_issues(state: &AppState, query: &QueryParams) -> DaemonResult<Value> {
    let filter = IssueFilter {
        created_by: query.get("created_by").map(str::to_string),
        platform: query.get("platform").map(str::to_string),
        category: query.get("category").map(str::to_string),
        since: query.get("since").and_then(parse_datetime),
        until: query.get("until").and_then(parse_datetime),
    };
    let issues = state.store.list_issues(&filter, query.page()).await?;
    Ok(json!({ "issues": issues }))
}

pub async fn handle_get_issue(state: &AppState, record_id: &str) -> DaemonResult<Value> {
    let issue = state
        .store
        .get_issue(record_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("issue {}", record_id)))?;
    let result = state.store.latest_result_for_issue(record_id).await?;
    Ok(json!({ "issue": issue, "result": result }))
}

pub async fn handle_delete_issue(state: &AppState, record_id: &str) -> DaemonResult<Value> {
    let deleted = state.store.soft_delete_issue(record_id).await?;
    Ok(json!({ "deleted": deleted }))
}

/// Fire-and-forget escalation to the configured chat webhook.
pub async fn handle_escalate_issue(state: &AppState, record_id: &str) -> DaemonResult<Value> {
    let issue = state
        .store
        .get_issue(record_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("issue {}", record_id)))?;

    let Some(url) = &state.config.notify.chat_webhook_url else {
        return Ok(json!({ "status": "noop" }));
    };

    let result = state.store.latest_result_for_issue(record_id).await?;
    let text = match &result {
        Some(result) => format!(
            "Escalation for {}: {}\nRoot cause: {}",
            record_id, result.problem_type, result.root_cause
        ),
        None => format!("Escalation for {}: {}", record_id, issue.description),
    };
    match state.client.post(url).json(&json!({ "text": text })).send().await {
        Ok(response) if response.status().is_success() => Ok(json!({ "status": "sent" })),
        Ok(response) => {
            warn!(status = %response.status(), "Chat escalation rejected");
            Ok(json!({ "status": "noop" }))
        }
        Err(e) => {
            warn!(error = %e, "Chat escalation failed");
            Ok(json!({ "status": "noop" }))
        }
    }
}

// ----------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------

pub fn handle_list_rules(state: &AppState) -> Value {
    let rules: Vec<Value> = state
        .catalog
        .list()
        .iter()
        .map(|rule| rule_summary(rule))
        .collect();
    json!({ "rules": rules })
}

fn rule_summary(rule: &Rule) -> Value {
    json!({
        "id": rule.id,
        "name": rule.name,
        "version": rule.version,
        "enabled": rule.enabled,
        "keywords": rule.keywords,
        "priority": rule.priority,
        "depends_on": rule.depends_on,
        "needs_code": rule.needs_code,
        "pre_extract": rule.pre_extract,
    })
}

pub fn handle_get_rule(state: &AppState, id: &str) -> DaemonResult<Value> {
    let rule = state.catalog.get(id)?;
    let mut value = rule_summary(&rule);
    value["body"] = Value::String(rule.body.clone());
    Ok(value)
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleBody {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub needs_code: bool,
    #[serde(default)]
    pub pre_extract: Vec<triage_core::rules::PreExtractSpec>,
    #[serde(default)]
    pub body: String,
}

pub fn handle_create_rule(state: &AppState, body: CreateRuleBody) -> DaemonResult<Value> {
    let rule = Rule {
        id: body.id,
        name: body.name,
        version: 1,
        enabled: body.enabled.unwrap_or(true),
        keywords: body.keywords,
        priority: body.priority,
        depends_on: body.depends_on,
        needs_code: body.needs_code,
        pre_extract: body.pre_extract,
        body: body.body,
        path: PathBuf::new(),
    };
    let created = state.catalog.create(rule)?;
    Ok(rule_summary(&created))
}

pub fn handle_update_rule(state: &AppState, id: &str, patch: RulePatch) -> DaemonResult<Value> {
    let updated = state.catalog.update(id, patch)?;
    Ok(rule_summary(&updated))
}

pub fn handle_delete_rule(state: &AppState, id: &str) -> DaemonResult<Value> {
    state.catalog.delete(id)?;
    Ok(json!({ "deleted": true }))
}

pub fn handle_reload_rules(state: &AppState) -> DaemonResult<Value> {
    let count = state.catalog.reload()?;
    Ok(json!({ "rules": count }))
}

// ----------------------------------------------------------------------
// Tracker webhook
// ----------------------------------------------------------------------

pub async fn handle_tracker_webhook(
    state: &AppState,
    body: &[u8],
    signature: Option<&str>,
) -> DaemonResult<Value> {
    if !verify_signature(
        state.config.notify.tracker.secret.as_deref(),
        body,
        signature,
    ) {
        return Err(DaemonError::Unauthorized);
    }

    let event: TrackerEvent = serde_json::from_slice(body)
        .map_err(|e| DaemonError::BadRequest(format!("tracker event: {}", e)))?;

    if !event.mentions(&state.config.notify.tracker.mention_token) {
        return Ok(json!({ "status": "ignored" }));
    }

    // Create the issue only on first sight; repeat mentions reuse it.
    if state.store.get_issue(&event.issue_key).await?.is_none() {
        state.store.save_issue(&event.to_issue()).await?;
    }
    let admission = state
        .queue
        .create_task(&event.issue_key, CreateTaskOptions::default())
        .await?;
    if admission.is_created() {
        state.metrics.tasks_created.inc();
    }
    info!(issue_id = %event.issue_key, task_id = %admission.task().task_id, "Tracker event accepted");

    Ok(json!({
        "status": "accepted",
        "task_id": admission.task().task_id,
        "deduplicated": !admission.is_created(),
    }))
}

// ----------------------------------------------------------------------
// Query-string parsing
// ----------------------------------------------------------------------

/// Minimal query parser: `k=v` pairs, '+' and percent-decoding.
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let mut pairs = Vec::new();
        if let Some(query) = query {
            for part in query.split('&') {
                let mut kv = part.splitn(2, '=');
                let key = kv.next().unwrap_or("");
                let value = kv.next().unwrap_or("");
                if !key.is_empty() {
                    pairs.push((percent_decode(key), percent_decode(value)));
                }
            }
        }
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn page(&self) -> Page {
        let mut page = Page::default();
        if let Some(limit) = self.get("limit").and_then(|v| v.parse::<i64>().ok()) {
            page.limit = limit.clamp(1, 500);
        }
        if let Some(offset) = self.get("offset").and_then(|v| v.parse::<i64>().ok()) {
            page.offset = offset.max(0);
        }
        page
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Bare dates are accepted as midnight UTC.
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params() {
        let q = QueryParams::parse(Some("platform=android&limit=10&offset=20&name=a+b%21"));
        assert_eq!(q.get("platform"), Some("android"));
        assert_eq!(q.get("name"), Some("a b!"));
        assert_eq!(q.get("missing"), None);
        let page = q.page();
        assert_eq!(page.limit, 10);
        assert_eq!(page.offset, 20);
    }

    #[test]
    fn test_query_params_empty() {
        let q = QueryParams::parse(None);
        assert!(q.get("anything").is_none());
        assert_eq!(q.page().limit, Page::default().limit);
    }

    #[test]
    fn test_page_clamped() {
        let q = QueryParams::parse(Some("limit=100000&offset=-5"));
        assert_eq!(q.page().limit, 500);
        assert_eq!(q.page().offset, 0);
    }

    #[test]
    fn test_parse_datetime_variants() {
        assert!(parse_datetime("2024-03-10T00:00:00Z").is_some());
        assert!(parse_datetime("2024-03-10").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_sanitize_upload_name() {
        assert_eq!(sanitize_upload_name("device.log"), "device.log");
        assert_eq!(sanitize_upload_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_upload_name(""), "upload.bin");
        assert_eq!(sanitize_upload_name(".."), "upload.bin");
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
