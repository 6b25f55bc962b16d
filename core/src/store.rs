//! SQLite-backed persistence for issues, tasks, and analysis results.
//!
//! The store is the only component that touches the database. Task admission
//! runs inside a transaction so "at most one non-terminal task per issue"
//! has a single linearization point, and task updates re-check the state
//! machine so terminal states stay absorbing no matter who calls.

use crate::errors::{FailureKind, StoreError, StoreResult};
use crate::types::{
    AnalysisResult, Confidence, Issue, IssueSource, LogArtifact, Priority, Task, TaskState,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of task admission.
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new task row was inserted.
    Created(Task),
    /// An in-flight task already covers this issue; no row was inserted.
    Existing(Task),
}

impl Admission {
    pub fn task(&self) -> &Task {
        match self {
            Admission::Created(t) | Admission::Existing(t) => t,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// Filters for issue listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub created_by: Option<String>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Pagination window, `created_at` descending.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
    _db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `db_path` and run migrations.
    pub async fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to parse database path: {}", e))
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to create database pool: {}", e))
            })?;

        let store = SqliteStore {
            pool,
            _db_path: db_path,
        };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(":memory:")
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        let store = SqliteStore {
            pool,
            _db_path: PathBuf::from(":memory:"),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                record_id TEXT PRIMARY KEY NOT NULL,
                description TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'low',
                device_serial TEXT,
                firmware TEXT,
                app_version TEXT,
                platform TEXT,
                category TEXT,
                source TEXT NOT NULL DEFAULT 'api',
                external_links TEXT NOT NULL DEFAULT '[]',
                created_by TEXT,
                created_at INTEGER NOT NULL,
                log_artifacts TEXT NOT NULL DEFAULT '[]',
                event_date TEXT,
                webhook_url TEXT,
                soft_deleted INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create issues table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY NOT NULL,
                issue_id TEXT NOT NULL,
                state TEXT NOT NULL,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL DEFAULT '',
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                requested_agent TEXT,
                requested_by TEXT,
                priority TEXT NOT NULL DEFAULT 'low'
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create tasks table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                task_id TEXT PRIMARY KEY NOT NULL,
                issue_id TEXT NOT NULL,
                problem_type TEXT NOT NULL,
                problem_type_en TEXT,
                root_cause TEXT NOT NULL,
                root_cause_en TEXT,
                confidence TEXT NOT NULL DEFAULT 'low',
                confidence_reason TEXT,
                key_evidence TEXT NOT NULL DEFAULT '[]',
                user_reply TEXT,
                user_reply_en TEXT,
                needs_engineer INTEGER NOT NULL DEFAULT 0,
                requires_more_info INTEGER NOT NULL DEFAULT 0,
                next_steps TEXT NOT NULL DEFAULT '[]',
                fix_suggestion TEXT,
                matched_rule_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create results table: {}", e)))?;

        self.apply_migrations().await
    }

    async fn apply_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::MigrationError(format!("Failed to create migrations table: {}", e))
        })?;

        let max_version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::MigrationError(format!("Failed to query migration version: {}", e))
                })?;

        let migrations: Vec<(i32, &str, Vec<&str>)> = vec![
            (
                1,
                "task_and_issue_indexes",
                vec![
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_issue_state ON tasks(issue_id, state)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_state_updated ON tasks(state, updated_at DESC)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at DESC)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_results_issue_id ON results(issue_id)"#,
                ],
            ),
            (
                2,
                "admission_uniqueness",
                // Partial unique index backing the at-most-one invariant; the
                // admission transaction is the primary guard, this is the
                // belt for writers that bypass it.
                vec![
                    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_inflight
                       ON tasks(issue_id)
                       WHERE state NOT IN ('done', 'failed', 'cancelled')"#,
                ],
            ),
        ];

        for (version, name, statements) in migrations {
            if version > max_version {
                for statement in statements {
                    sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                        StoreError::MigrationError(format!(
                            "Failed to apply migration {}: {}",
                            name, e
                        ))
                    })?;
                }
                sqlx::query("INSERT INTO migrations (version, name, applied_at) VALUES (?, ?, ?)")
                    .bind(version)
                    .bind(name)
                    .bind(Utc::now().timestamp())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        StoreError::MigrationError(format!(
                            "Failed to record migration {}: {}",
                            name, e
                        ))
                    })?;
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------

    pub async fn save_issue(&self, issue: &Issue) -> StoreResult<()> {
        let links = serde_json::to_string(&issue.external_links)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let artifacts = serde_json::to_string(&issue.log_artifacts)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO issues
            (record_id, description, priority, device_serial, firmware, app_version,
             platform, category, source, external_links, created_by, created_at,
             log_artifacts, event_date, webhook_url, soft_deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&issue.record_id)
        .bind(&issue.description)
        .bind(issue.priority.as_str())
        .bind(&issue.device_serial)
        .bind(&issue.firmware)
        .bind(&issue.app_version)
        .bind(&issue.platform)
        .bind(&issue.category)
        .bind(issue.source.as_str())
        .bind(&links)
        .bind(&issue.created_by)
        .bind(issue.created_at.timestamp())
        .bind(&artifacts)
        .bind(issue.event_date.map(|d| d.to_string()))
        .bind(&issue.webhook_url)
        .bind(issue.soft_deleted as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save issue: {}", e)))?;

        Ok(())
    }

    /// Fetch by id; soft-deleted issues remain reachable here.
    pub async fn get_issue(&self, record_id: &str) -> StoreResult<Option<Issue>> {
        let row = sqlx::query("SELECT * FROM issues WHERE record_id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch issue: {}", e)))?;

        Ok(row.map(|r| row_to_issue(&r)))
    }

    /// Paginated listing, newest first, soft-deleted hidden.
    pub async fn list_issues(&self, filter: &IssueFilter, page: Page) -> StoreResult<Vec<Issue>> {
        let mut sql = String::from("SELECT * FROM issues WHERE soft_deleted = 0");
        if filter.created_by.is_some() {
            sql.push_str(" AND created_by = ?");
        }
        if filter.platform.is_some() {
            sql.push_str(" AND platform = ?");
        }
        if filter.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.created_by {
            query = query.bind(v);
        }
        if let Some(v) = &filter.platform {
            query = query.bind(v);
        }
        if let Some(v) = &filter.category {
            query = query.bind(v);
        }
        if let Some(v) = &filter.since {
            query = query.bind(v.timestamp());
        }
        if let Some(v) = &filter.until {
            query = query.bind(v.timestamp());
        }
        query = query.bind(page.limit).bind(page.offset);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to list issues: {}", e)))?;

        Ok(rows.iter().map(row_to_issue).collect())
    }

    /// Hide an issue from listings. Returns false when already hidden/absent.
    pub async fn soft_delete_issue(&self, record_id: &str) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE issues SET soft_deleted = 1 WHERE record_id = ? AND soft_deleted = 0")
                .bind(record_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::DatabaseError(format!("Failed to soft-delete issue: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Admission: return the issue's in-flight task if one exists, otherwise
    /// insert `task` as `queued`. This transaction is the linearization
    /// point for the at-most-one invariant.
    pub async fn admit_task(&self, task: &Task) -> StoreResult<Admission> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to begin admission: {}", e)))?;

        let existing = sqlx::query(
            "SELECT * FROM tasks WHERE issue_id = ? AND state NOT IN ('done', 'failed', 'cancelled') LIMIT 1",
        )
        .bind(&task.issue_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed admission check: {}", e)))?;

        if let Some(row) = existing {
            tx.rollback()
                .await
                .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            return Ok(Admission::Existing(row_to_task(&row)));
        }

        sqlx::query(
            r#"
            INSERT INTO tasks
            (task_id, issue_id, state, progress_percent, message, error,
             created_at, updated_at, requested_agent, requested_by, priority)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id.to_string())
        .bind(&task.issue_id)
        .bind(task.state.as_str())
        .bind(task.progress_percent as i32)
        .bind(&task.message)
        .bind(&task.error)
        .bind(task.created_at.timestamp())
        .bind(task.updated_at.timestamp())
        .bind(&task.requested_agent)
        .bind(&task.requested_by)
        .bind(task.priority.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to insert task: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to commit admission: {}", e)))?;

        Ok(Admission::Created(task.clone()))
    }

    pub async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch task: {}", e)))?;
        Ok(row.map(|r| row_to_task(&r)))
    }

    pub async fn tasks_for_issue(&self, issue_id: &str) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE issue_id = ? ORDER BY created_at DESC")
            .bind(issue_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch tasks: {}", e)))?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    pub async fn list_tasks(&self, state: Option<TaskState>, page: Page) -> StoreResult<Vec<Task>> {
        let rows = if let Some(state) = state {
            sqlx::query(
                "SELECT * FROM tasks WHERE state = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
            )
            .bind(state.as_str())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?")
                .bind(page.limit)
                .bind(page.offset)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| StoreError::DatabaseError(format!("Failed to list tasks: {}", e)))?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    /// Advance a task through the state machine. Illegal transitions (going
    /// backwards, or out of a terminal state) are rejected so terminal
    /// states stay absorbing. Progress is clamped non-decreasing.
    pub async fn update_task_progress(
        &self,
        task_id: Uuid,
        state: TaskState,
        progress_percent: u8,
        message: &str,
    ) -> StoreResult<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch task: {}", e)))?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let current = row_to_task(&row);

        if current.state.is_terminal()
            || (current.state != state && !current.state.can_transition_to(state))
        {
            return Err(StoreError::DatabaseError(format!(
                "Illegal transition {} -> {} for task {}",
                current.state.as_str(),
                state.as_str(),
                task_id
            )));
        }

        let progress = progress_percent.min(100).max(current.progress_percent);
        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET state = ?, progress_percent = ?, message = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(state.as_str())
        .bind(progress as i32)
        .bind(message)
        .bind(now.timestamp())
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to update task: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let mut updated = current;
        updated.state = state;
        updated.progress_percent = progress;
        updated.message = message.to_string();
        updated.updated_at = now;
        Ok(updated)
    }

    /// Terminal failure write: `state=failed`, `error=<kind>: <message>`.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        kind: FailureKind,
        message: &str,
    ) -> StoreResult<Task> {
        let error = format!("{}: {}", kind.label(), message);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let current = row_to_task(&row);
        if current.state.is_terminal() {
            return Ok(current);
        }

        let target = if kind == FailureKind::Cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Failed
        };
        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET state = ?, progress_percent = 100, message = ?, error = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(target.as_str())
        .bind(message)
        .bind((target == TaskState::Failed).then(|| error.clone()))
        .bind(now.timestamp())
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fail task: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let mut updated = current;
        updated.state = target;
        updated.progress_percent = 100;
        updated.message = message.to_string();
        updated.error = (target == TaskState::Failed).then_some(error);
        updated.updated_at = now;
        Ok(updated)
    }

    /// Terminal success write.
    pub async fn complete_task(&self, task_id: Uuid, message: &str) -> StoreResult<Task> {
        self.update_task_progress(task_id, TaskState::Done, 100, message)
            .await
    }

    /// Reset a non-terminal task to `queued` for a fresh pipeline run. Only
    /// the recovery path uses this; it deliberately steps outside the
    /// monotonic state order because the original run is gone.
    pub async fn requeue_task(&self, task_id: Uuid) -> StoreResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let current = row_to_task(&row);
        if current.state.is_terminal() {
            return Err(StoreError::DatabaseError(format!(
                "cannot requeue terminal task {}",
                task_id
            )));
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET state = 'queued', progress_percent = 0, message = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind("requeued after restart")
        .bind(now.timestamp())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to requeue task: {}", e)))?;

        let mut updated = current;
        updated.state = TaskState::Queued;
        updated.progress_percent = 0;
        updated.message = "requeued after restart".to_string();
        updated.updated_at = now;
        Ok(updated)
    }

    /// Startup recovery: fail non-terminal tasks whose `updated_at` is older
    /// than `stale_after`, and return the still-fresh ones for re-enqueue.
    pub async fn recover_tasks(
        &self,
        stale_after: chrono::Duration,
    ) -> StoreResult<(Vec<Task>, Vec<Task>)> {
        let cutoff = (Utc::now() - stale_after).timestamp();

        let stale_rows = sqlx::query(
            "SELECT * FROM tasks WHERE state NOT IN ('done', 'failed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed stale query: {}", e)))?;

        let mut failed = Vec::new();
        for row in &stale_rows {
            let task = row_to_task(row);
            let swept = self
                .fail_task(
                    task.task_id,
                    FailureKind::ServerRestart,
                    "task abandoned by a server restart",
                )
                .await?;
            warn!(task_id = %task.task_id, "Stale task failed during recovery");
            failed.push(swept);
        }

        let fresh_rows = sqlx::query(
            "SELECT * FROM tasks WHERE state NOT IN ('done', 'failed', 'cancelled') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed fresh query: {}", e)))?;

        let requeue: Vec<Task> = fresh_rows.iter().map(row_to_task).collect();
        if !failed.is_empty() || !requeue.is_empty() {
            info!(
                swept = failed.len(),
                requeued = requeue.len(),
                "Task recovery complete"
            );
        }
        Ok((failed, requeue))
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub async fn save_result(&self, result: &AnalysisResult) -> StoreResult<()> {
        let evidence = serde_json::to_string(&result.key_evidence)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let steps = serde_json::to_string(&result.next_steps)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO results
            (task_id, issue_id, problem_type, problem_type_en, root_cause, root_cause_en,
             confidence, confidence_reason, key_evidence, user_reply, user_reply_en,
             needs_engineer, requires_more_info, next_steps, fix_suggestion,
             matched_rule_id, agent_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.task_id.to_string())
        .bind(&result.issue_id)
        .bind(&result.problem_type)
        .bind(&result.problem_type_en)
        .bind(&result.root_cause)
        .bind(&result.root_cause_en)
        .bind(result.confidence.as_str())
        .bind(&result.confidence_reason)
        .bind(&evidence)
        .bind(&result.user_reply)
        .bind(&result.user_reply_en)
        .bind(result.needs_engineer as i32)
        .bind(result.requires_more_info as i32)
        .bind(&steps)
        .bind(&result.fix_suggestion)
        .bind(&result.matched_rule_id)
        .bind(&result.agent_name)
        .bind(result.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save result: {}", e)))?;

        Ok(())
    }

    pub async fn get_result(&self, task_id: Uuid) -> StoreResult<Option<AnalysisResult>> {
        let row = sqlx::query("SELECT * FROM results WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch result: {}", e)))?;
        Ok(row.map(|r| row_to_result(&r)))
    }

    /// The issue's current result: the one from its most recent `done` task.
    pub async fn latest_result_for_issue(
        &self,
        issue_id: &str,
    ) -> StoreResult<Option<AnalysisResult>> {
        let row = sqlx::query(
            r#"
            SELECT results.* FROM results
            JOIN tasks ON tasks.task_id = results.task_id
            WHERE results.issue_id = ? AND tasks.state = 'done'
            ORDER BY tasks.updated_at DESC, results.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch latest result: {}", e)))?;
        Ok(row.map(|r| row_to_result(&r)))
    }
}

fn epoch_to_datetime(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_issue(row: &sqlx::sqlite::SqliteRow) -> Issue {
    let links: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("external_links")).unwrap_or_default();
    let artifacts: Vec<LogArtifact> =
        serde_json::from_str(&row.get::<String, _>("log_artifacts")).unwrap_or_default();
    let event_date = row
        .get::<Option<String>, _>("event_date")
        .and_then(|s| NaiveDate::from_str(&s).ok());

    Issue {
        record_id: row.get("record_id"),
        description: row.get("description"),
        priority: Priority::from_str_loose(&row.get::<String, _>("priority")),
        device_serial: row.get("device_serial"),
        firmware: row.get("firmware"),
        app_version: row.get("app_version"),
        platform: row.get("platform"),
        category: row.get("category"),
        source: IssueSource::from_str_loose(&row.get::<String, _>("source")),
        external_links: links,
        created_by: row.get("created_by"),
        created_at: epoch_to_datetime(row.get("created_at")),
        log_artifacts: artifacts,
        event_date,
        webhook_url: row.get("webhook_url"),
        soft_deleted: row.get::<i32, _>("soft_deleted") != 0,
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Task {
    Task {
        task_id: Uuid::parse_str(&row.get::<String, _>("task_id")).unwrap_or_else(|_| Uuid::nil()),
        issue_id: row.get("issue_id"),
        state: TaskState::from_str_loose(&row.get::<String, _>("state"))
            .unwrap_or(TaskState::Failed),
        progress_percent: row.get::<i32, _>("progress_percent").clamp(0, 100) as u8,
        message: row.get("message"),
        error: row.get("error"),
        created_at: epoch_to_datetime(row.get("created_at")),
        updated_at: epoch_to_datetime(row.get("updated_at")),
        requested_agent: row.get("requested_agent"),
        requested_by: row.get("requested_by"),
        priority: Priority::from_str_loose(&row.get::<String, _>("priority")),
    }
}

fn row_to_result(row: &sqlx::sqlite::SqliteRow) -> AnalysisResult {
    let evidence: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("key_evidence")).unwrap_or_default();
    let steps: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("next_steps")).unwrap_or_default();
    let confidence = match row.get::<String, _>("confidence").as_str() {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    };

    AnalysisResult {
        task_id: Uuid::parse_str(&row.get::<String, _>("task_id")).unwrap_or_else(|_| Uuid::nil()),
        issue_id: row.get("issue_id"),
        problem_type: row.get("problem_type"),
        problem_type_en: row.get("problem_type_en"),
        root_cause: row.get("root_cause"),
        root_cause_en: row.get("root_cause_en"),
        confidence,
        confidence_reason: row.get("confidence_reason"),
        key_evidence: evidence,
        user_reply: row.get("user_reply"),
        user_reply_en: row.get("user_reply_en"),
        needs_engineer: row.get::<i32, _>("needs_engineer") != 0,
        requires_more_info: row.get::<i32, _>("requires_more_info") != 0,
        next_steps: steps,
        fix_suggestion: row.get("fix_suggestion"),
        matched_rule_id: row.get("matched_rule_id"),
        agent_name: row.get("agent_name"),
        created_at: epoch_to_datetime(row.get("created_at")),
    }
}
