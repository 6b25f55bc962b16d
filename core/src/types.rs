//! Domain model shared across the triage pipeline.
//!
//! Issues come in from producers (chat, support desk, tracker, API), tasks
//! carry one analysis attempt through the pipeline, and results hold the
//! structured root-cause analysis extracted from the agent transcript.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ticket priority band. High-priority issues are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Low => "low",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "h" | "urgent" => Priority::High,
            _ => Priority::Low,
        }
    }
}

/// Where an issue entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IssueSource {
    Chat,
    SupportDesk,
    Tracker,
    #[default]
    Api,
    Local,
}

impl IssueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSource::Chat => "chat",
            IssueSource::SupportDesk => "support-desk",
            IssueSource::Tracker => "tracker",
            IssueSource::Api => "api",
            IssueSource::Local => "local",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => IssueSource::Chat,
            "support-desk" | "supportdesk" => IssueSource::SupportDesk,
            "tracker" => IssueSource::Tracker,
            "local" => IssueSource::Local,
            _ => IssueSource::Api,
        }
    }
}

/// One uploaded or referenced log bundle attached to an issue.
///
/// Producers either embed the payload (stored on disk by the daemon and
/// referenced by `local_path`) or pass an opaque token usable with the
/// configured artifact resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogArtifact {
    /// Original file name as supplied by the producer.
    pub name: String,
    /// Opaque fetch token for the external resolver, if not inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Path of an inline payload spooled to disk at ingestion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Size in bytes, when known.
    #[serde(default)]
    pub size: u64,
}

/// The normalized ticket record that is the unit of analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identity assigned at ingestion.
    pub record_id: String,
    /// Free-text problem description, any language.
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source: IssueSource,
    /// Links back to the originating ticket/thread, when any.
    #[serde(default)]
    pub external_links: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub log_artifacts: Vec<LogArtifact>,
    /// Date hint used by date-filtered pre-extraction patterns.
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    /// Callback URL notified when a task on this issue reaches a terminal state.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub soft_deleted: bool,
}

/// Pipeline position of a task. Non-terminal states are strictly ordered;
/// the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Downloading,
    Decrypting,
    Extracting,
    Analyzing,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Downloading => "downloading",
            TaskState::Decrypting => "decrypting",
            TaskState::Extracting => "extracting",
            TaskState::Analyzing => "analyzing",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskState::Queued,
            "downloading" => TaskState::Downloading,
            "decrypting" => TaskState::Decrypting,
            "extracting" => TaskState::Extracting,
            "analyzing" => TaskState::Analyzing,
            "done" => TaskState::Done,
            "failed" => TaskState::Failed,
            "cancelled" => TaskState::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }

    /// Position in the non-terminal partial order. Terminal states share the
    /// top rank so any terminal transition from a running state is legal.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Queued => 0,
            TaskState::Downloading => 1,
            TaskState::Decrypting => 2,
            TaskState::Extracting => 3,
            TaskState::Analyzing => 4,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled => 5,
        }
    }

    /// Whether a transition `self -> next` respects the state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

/// One analysis attempt for an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub issue_id: String,
    pub state: TaskState,
    /// 0..=100, non-decreasing over the task's lifetime.
    pub progress_percent: u8,
    /// Human-readable description of what the task is doing right now.
    pub message: String,
    /// Set only when `state == Failed`, formatted `<kind>: <message>`.
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provider override requested at creation, if any.
    #[serde(default)]
    pub requested_agent: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub priority: Priority,
}

impl Task {
    pub fn new(issue_id: String, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            issue_id,
            state: TaskState::Queued,
            progress_percent: 0,
            message: "queued".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
            requested_agent: None,
            requested_by: None,
            priority,
        }
    }
}

/// Analysis confidence reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

/// Structured root-cause analysis produced by a successful task.
///
/// Immutable once written; one-to-one with its `done` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub task_id: Uuid,
    pub issue_id: String,
    pub problem_type: String,
    #[serde(default)]
    pub problem_type_en: Option<String>,
    pub root_cause: String,
    #[serde(default)]
    pub root_cause_en: Option<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub confidence_reason: Option<String>,
    /// Log lines the agent cited, in citation order.
    #[serde(default)]
    pub key_evidence: Vec<String>,
    #[serde(default)]
    pub user_reply: Option<String>,
    #[serde(default)]
    pub user_reply_en: Option<String>,
    #[serde(default)]
    pub needs_engineer: bool,
    #[serde(default)]
    pub requires_more_info: bool,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
    /// Always stamped by the pipeline, never trusted from the agent.
    pub matched_rule_id: String,
    /// Effective provider that produced the transcript.
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a task's changing fields, delivered to progress subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub state: TaskState,
    pub progress_percent: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            state: task.state,
            progress_percent: task.progress_percent,
            message: task.message.clone(),
            updated_at: task.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Downloading));
        assert!(TaskState::Downloading.can_transition_to(TaskState::Analyzing));
        assert!(TaskState::Queued.can_transition_to(TaskState::Cancelled));
        assert!(TaskState::Analyzing.can_transition_to(TaskState::Done));
        assert!(!TaskState::Analyzing.can_transition_to(TaskState::Downloading));
    }

    #[test]
    fn test_terminal_states_absorbing() {
        for terminal in [TaskState::Done, TaskState::Failed, TaskState::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                TaskState::Queued,
                TaskState::Analyzing,
                TaskState::Done,
                TaskState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(Priority::from_str_loose("High"), Priority::High);
        assert_eq!(Priority::from_str_loose("H"), Priority::High);
        assert_eq!(Priority::from_str_loose(""), Priority::Low);
        assert_eq!(Priority::from_str_loose("whatever"), Priority::Low);
    }

    #[test]
    fn test_task_state_serde_names() {
        let json = serde_json::to_string(&TaskState::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
        assert_eq!(TaskState::from_str_loose("downloading"), Some(TaskState::Downloading));
    }

    #[test]
    fn test_new_task_starts_queued() {
        let task = Task::new("REC-1".to_string(), Priority::High);
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.progress_percent, 0);
        assert!(task.error.is_none());
    }
}
