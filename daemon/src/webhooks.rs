//! Webhook plumbing: project-tracker ingestion and outbound completion
//! callbacks.
//!
//! Outbound notifications are fire-and-forget: non-2xx responses are logged
//! and never retried.

use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};
use triage_core::config::TrackerConfig;
use triage_core::pipeline::CompletionNotifier;
use triage_core::types::{AnalysisResult, Issue, IssueSource, Priority, Task, TaskState};

type HmacSha256 = Hmac<Sha256>;

/// Verify an `X-Tracker-Signature` style header: hex HMAC-SHA256 of the raw
/// body under the shared secret. Absent secret disables verification.
pub fn verify_signature(secret: Option<&str>, body: &[u8], signature: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(signature) = signature else {
        return false;
    };
    let signature = signature.trim().trim_start_matches("sha256=");
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Relevant subset of a tracker event payload.
#[derive(Debug, Deserialize)]
pub struct TrackerEvent {
    /// Stable issue key in the tracker, reused as our record id.
    pub issue_key: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Comment or description body that may carry the mention token.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl TrackerEvent {
    /// Whether this event asks for an analysis.
    pub fn mentions(&self, token: &str) -> bool {
        !token.is_empty() && self.content.contains(token)
    }

    /// Build the Issue this event describes.
    pub fn to_issue(&self) -> Issue {
        let description = match (&self.summary, self.content.is_empty()) {
            (Some(summary), false) => format!("{}\n\n{}", summary, self.content),
            (Some(summary), true) => summary.clone(),
            (None, _) => self.content.clone(),
        };
        Issue {
            record_id: self.issue_key.clone(),
            description,
            priority: self
                .priority
                .as_deref()
                .map(Priority::from_str_loose)
                .unwrap_or_default(),
            device_serial: None,
            firmware: None,
            app_version: None,
            platform: None,
            category: None,
            source: IssueSource::Tracker,
            external_links: self.link.iter().cloned().collect(),
            created_by: self.author.clone(),
            created_at: Utc::now(),
            log_artifacts: vec![],
            event_date: None,
            webhook_url: None,
            soft_deleted: false,
        }
    }
}

/// Notifier that posts completion callbacks and tracker comments, and keeps
/// the terminal-state counters.
pub struct WebhookNotifier {
    client: reqwest::Client,
    tracker: TrackerConfig,
    metrics: Arc<MetricsCollector>,
}

impl WebhookNotifier {
    pub fn new(tracker: TrackerConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            client: reqwest::Client::new(),
            tracker,
            metrics,
        }
    }

    fn count_terminal(&self, task: &Task) {
        match task.state {
            TaskState::Done => self.metrics.tasks_completed.inc(),
            TaskState::Failed => self.metrics.tasks_failed.inc(),
            TaskState::Cancelled => self.metrics.tasks_cancelled.inc(),
            _ => {}
        }
    }

    async fn post_callback(&self, url: &str, task: &Task, result: Option<&AnalysisResult>) {
        let payload = json!({
            "task_id": task.task_id,
            "status": task.state.as_str(),
            "error": task.error,
            "result": result,
        });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(url, status = %response.status(), "Completion webhook rejected");
            }
            Ok(_) => info!(url, task_id = %task.task_id, "Completion webhook delivered"),
            Err(e) => warn!(url, error = %e, "Completion webhook failed"),
        }
    }

    /// Follow-up comment posted back to the tracker for tracker-born issues.
    async fn post_tracker_comment(&self, issue: &Issue, task: &Task, result: Option<&AnalysisResult>) {
        let Some(base) = &self.tracker.comment_url else {
            return;
        };
        let comment = match (task.state, result) {
            (TaskState::Done, Some(result)) => format!(
                "Analysis complete: {}\nRoot cause: {}\nConfidence: {}",
                result.problem_type,
                result.root_cause,
                result.confidence.as_str()
            ),
            (state, _) => format!(
                "Analysis finished in state `{}`{}",
                state.as_str(),
                task.error
                    .as_deref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ),
        };
        let url = format!("{}/{}/comments", base.trim_end_matches('/'), issue.record_id);
        if let Err(e) = self.client.post(&url).json(&json!({ "body": comment })).send().await {
            warn!(url, error = %e, "Tracker comment failed");
        }
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn task_finished(&self, issue: &Issue, task: &Task, result: Option<&AnalysisResult>) {
        self.count_terminal(task);

        if let Some(url) = &issue.webhook_url {
            self.post_callback(url, task, result).await;
        }
        if issue.source == IssueSource::Tracker {
            self.post_tracker_comment(issue, task, result).await;
        }
    }
}
