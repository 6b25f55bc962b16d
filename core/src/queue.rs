//! Task queue and scheduler: admission, a two-band priority queue, and a
//! worker pool whose size is tunable at runtime.
//!
//! Admission goes through the store transaction (the at-most-one
//! linearization point); the in-memory queue only orders work. Cancellation
//! is cooperative: every enqueued task owns a token that the pipeline checks
//! at stage boundaries and the agent runner watches while the subprocess is
//! alive.

use crate::errors::{StoreError, StoreResult};
use crate::pipeline::Pipeline;
use crate::progress::ProgressBus;
use crate::store::{Admission, SqliteStore};
use crate::types::{Priority, ProgressEvent, Task, TaskState};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options accepted at task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    pub requested_agent: Option<String>,
    pub requested_by: Option<String>,
}

pub struct TaskQueue {
    store: Arc<SqliteStore>,
    pipeline: Arc<Pipeline>,
    progress: Arc<ProgressBus>,
    high: Mutex<VecDeque<Task>>,
    low: Mutex<VecDeque<Task>>,
    queued: Notify,
    cancels: DashMap<Uuid, CancellationToken>,
    workers: Arc<Semaphore>,
    target_workers: AtomicUsize,
    running: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TaskQueue {
    pub fn new(
        store: Arc<SqliteStore>,
        pipeline: Arc<Pipeline>,
        progress: Arc<ProgressBus>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            pipeline,
            progress,
            high: Mutex::new(VecDeque::new()),
            low: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            cancels: DashMap::new(),
            workers: Arc::new(Semaphore::new(workers)),
            target_workers: AtomicUsize::new(workers),
            running: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run startup recovery, then start the dispatcher. Stale tasks are
    /// failed before the pool accepts any work; fresh ones restart from
    /// `queued` with a clean workspace.
    pub async fn start(self: &Arc<Self>, stale_after: chrono::Duration) -> StoreResult<()> {
        let (swept, fresh) = self.store.recover_tasks(stale_after).await?;
        for task in &swept {
            self.progress.publish(ProgressEvent::from_task(task));
        }
        for task in fresh {
            // Tasks admitted through this queue instance are already tracked
            // and enqueued; recovery only picks up rows from a previous run.
            if self.cancels.contains_key(&task.task_id) {
                continue;
            }
            let requeued = self.store.requeue_task(task.task_id).await?;
            self.enqueue(requeued);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            queue.dispatch_loop().await;
        });
        info!(workers = self.target_workers.load(Ordering::SeqCst), "Task queue started");
        Ok(())
    }

    /// Admission: returns the existing in-flight task for the issue when one
    /// exists, otherwise inserts and enqueues a fresh task.
    pub async fn create_task(
        &self,
        issue_id: &str,
        opts: CreateTaskOptions,
    ) -> StoreResult<Admission> {
        let issue = self
            .store
            .get_issue(issue_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("issue {}", issue_id)))?;

        let mut task = Task::new(issue.record_id.clone(), issue.priority);
        task.requested_agent = opts.requested_agent;
        task.requested_by = opts.requested_by;

        let admission = self.store.admit_task(&task).await?;
        match &admission {
            Admission::Created(task) => {
                debug!(task_id = %task.task_id, issue_id, "Task admitted");
                self.enqueue(task.clone());
            }
            Admission::Existing(task) => {
                debug!(task_id = %task.task_id, issue_id, "Admission deduplicated to in-flight task");
            }
        }
        Ok(admission)
    }

    fn enqueue(&self, task: Task) {
        self.cancels
            .entry(task.task_id)
            .or_insert_with(CancellationToken::new);
        self.progress.publish(ProgressEvent::from_task(&task));
        match task.priority {
            Priority::High => self.high.lock().push_back(task),
            Priority::Low => self.low.lock().push_back(task),
        }
        self.queued.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        if let Some(task) = self.high.lock().pop_front() {
            return Some(task);
        }
        self.low.lock().pop_front()
    }

    /// Idempotent cancel. Queued tasks transition straight to `cancelled`;
    /// running tasks get their token signalled and the worker finishes the
    /// transition after tearing down the agent and workspace.
    pub async fn cancel(&self, task_id: Uuid) -> StoreResult<TaskState> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;

        if task.state.is_terminal() {
            return Ok(task.state);
        }

        if let Some(token) = self.cancels.get(&task_id) {
            token.cancel();
        }

        if task.state == TaskState::Queued {
            // Straight transition; the dispatcher skips terminal tasks when
            // it eventually pops this entry.
            let cancelled = self
                .store
                .fail_task(task_id, crate::errors::FailureKind::Cancelled, "cancelled while queued")
                .await?;
            self.progress.publish(ProgressEvent::from_task(&cancelled));
            return Ok(cancelled.state);
        }

        info!(task_id = %task_id, "Cancel signalled to running worker");
        Ok(task.state)
    }

    /// Resize the worker pool. Growth takes effect immediately; shrink takes
    /// effect as running tasks finish.
    pub fn set_workers(&self, target: usize) {
        let target = target.max(1);
        let current = self.target_workers.swap(target, Ordering::SeqCst);
        if target > current {
            self.workers.add_permits(target - current);
        } else if current > target {
            let forgotten = self.workers.forget_permits(current - target);
            if forgotten < current - target {
                // The rest are held by running workers; their permits are
                // dropped on completion and not re-added past the target.
                debug!(outstanding = current - target - forgotten, "Worker shrink pending");
            }
        }
        info!(workers = target, "Worker pool resized");
    }

    pub fn worker_target(&self) -> usize {
        self.target_workers.load(Ordering::SeqCst)
    }

    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> usize {
        self.high.lock().len() + self.low.lock().len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = loop {
                if let Some(task) = self.pop() {
                    break Some(task);
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break None,
                    _ = self.queued.notified() => {}
                }
            };
            let Some(task) = task else { break };

            // The task may have been cancelled while queued.
            let current = match self.store.get_task(task.task_id).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    warn!(task_id = %task.task_id, "Queued task vanished from store");
                    continue;
                }
                Err(e) => {
                    error!(task_id = %task.task_id, error = %e, "Failed to re-check task before dispatch");
                    continue;
                }
            };
            if current.state.is_terminal() {
                self.cancels.remove(&task.task_id);
                continue;
            }

            let cancel = self
                .cancels
                .get(&task.task_id)
                .map(|t| t.value().clone())
                .unwrap_or_default();
            let queue = self.clone();
            self.running.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                queue.pipeline.run_task(current, cancel).await;
                queue.cancels.remove(&task.task_id);
                queue.running.fetch_sub(1, Ordering::SeqCst);
                // Respect a shrink that happened while this worker ran: the
                // pool's permit total (idle + held) must not exceed the
                // target, so an excess permit is forgotten instead of
                // returned.
                let outstanding = queue.workers.available_permits() + queue.running_tasks();
                if outstanding >= queue.worker_target() {
                    permit.forget();
                } else {
                    drop(permit);
                }
            });
        }
        info!("Task queue dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        AgentOutcome, AgentRegistry, AgentRequest, AgentRunner, AvailabilityProbe,
    };
    use crate::config::{AgentsConfig, PipelineConfig, ProviderConfig, WorkspaceConfig};
    use crate::errors::AgentResult;
    use crate::materializer::{HttpArtifactResolver, Materializer, PassthroughCodec};
    use crate::pipeline::NoopNotifier;
    use crate::rules::RuleCatalog;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Agent that blocks until cancelled or released, to hold a worker busy.
    struct SlowAgent {
        release: Notify,
    }

    #[async_trait]
    impl AgentRunner for SlowAgent {
        fn name(&self) -> &'static str {
            "claude_code"
        }

        async fn available(&self) -> AvailabilityProbe {
            AvailabilityProbe {
                name: "claude_code".to_string(),
                enabled: true,
                available: true,
                version: None,
                error: None,
            }
        }

        async fn run(
            &self,
            _request: &AgentRequest,
            cancel: &CancellationToken,
        ) -> AgentResult<AgentOutcome> {
            tokio::select! {
                _ = cancel.cancelled() => Err(crate::errors::AgentError::Cancelled),
                _ = self.release.notified() => Ok(AgentOutcome {
                    transcript: "```json\n{\"problem_type\": \"x\", \"root_cause\": \"y\"}\n```".to_string(),
                    stderr_tail: String::new(),
                    agent_name: "claude_code".to_string(),
                    duration: Duration::from_millis(1),
                    stdout_truncated: false,
                }),
            }
        }
    }

    struct QueueHarness {
        queue: Arc<TaskQueue>,
        store: Arc<SqliteStore>,
        agent: Arc<SlowAgent>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn queue_harness(workers: usize) -> QueueHarness {
        let rules_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            rules_dir.path().join("general.md"),
            "---\nid = \"general\"\nname = \"General\"\npriority = 0\n---\nChecklist.\n",
        )
        .unwrap();
        let workspace_dir = tempfile::tempdir().unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let progress = Arc::new(ProgressBus::new());
        let agent = Arc::new(SlowAgent {
            release: Notify::new(),
        });
        let agents_config = AgentsConfig {
            claude_code: ProviderConfig {
                enabled: true,
                ..ProviderConfig::default()
            },
            ..AgentsConfig::default()
        };
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            Arc::new(RuleCatalog::load(rules_dir.path()).unwrap()),
            Arc::new(Materializer::new(
                WorkspaceConfig {
                    root: workspace_dir.path().to_path_buf(),
                    ..WorkspaceConfig::default()
                },
                Arc::new(HttpArtifactResolver::new("http://127.0.0.1:0")),
                Arc::new(PassthroughCodec),
                Duration::from_secs(30),
            )),
            Arc::new(AgentRegistry::new(vec![agent.clone()], agents_config)),
            progress.clone(),
            Arc::new(NoopNotifier),
            PipelineConfig::default(),
            workspace_dir.path().to_path_buf(),
        ));
        let queue = TaskQueue::new(store.clone(), pipeline, progress, workers);
        QueueHarness {
            queue,
            store,
            agent,
            _dirs: (rules_dir, workspace_dir),
        }
    }

    async fn add_issue(store: &SqliteStore, id: &str, priority: Priority) {
        let mut issue = crate::store::tests_support::issue_fixture(id);
        issue.priority = priority;
        store.save_issue(&issue).await.unwrap();
    }

    async fn wait_for_state(
        store: &SqliteStore,
        task_id: Uuid,
        state: TaskState,
        timeout: Duration,
    ) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = store.get_task(task_id).await.unwrap().unwrap();
            if task.state == state {
                return task;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "task {} never reached {:?}, stuck at {:?}",
                    task_id, state, task.state
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_create_task_requires_issue() {
        let h = queue_harness(1).await;
        let err = h
            .queue
            .create_task("missing", CreateTaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_create_returns_same_task() {
        let h = queue_harness(1).await;
        add_issue(&h.store, "REC-1", Priority::Low).await;

        let first = h
            .queue
            .create_task("REC-1", CreateTaskOptions::default())
            .await
            .unwrap();
        let second = h
            .queue
            .create_task("REC-1", CreateTaskOptions::default())
            .await
            .unwrap();
        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.task().task_id, second.task().task_id);
    }

    #[tokio::test]
    async fn test_end_to_end_run_through_queue() {
        let h = queue_harness(1).await;
        h.queue.start(chrono::Duration::minutes(10)).await.unwrap();
        add_issue(&h.store, "REC-1", Priority::Low).await;

        let admission = h
            .queue
            .create_task("REC-1", CreateTaskOptions::default())
            .await
            .unwrap();
        let task_id = admission.task().task_id;

        wait_for_state(&h.store, task_id, TaskState::Analyzing, Duration::from_secs(5)).await;
        h.agent.release.notify_one();
        let done = wait_for_state(&h.store, task_id, TaskState::Done, Duration::from_secs(5)).await;
        assert_eq!(done.progress_percent, 100);
        assert!(h.store.get_result(task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_task_is_immediate() {
        let h = queue_harness(1).await;
        // Queue not started; the task stays queued.
        add_issue(&h.store, "REC-1", Priority::Low).await;
        let admission = h
            .queue
            .create_task("REC-1", CreateTaskOptions::default())
            .await
            .unwrap();
        let task_id = admission.task().task_id;

        let state = h.queue.cancel(task_id).await.unwrap();
        assert_eq!(state, TaskState::Cancelled);
        // Idempotent.
        assert_eq!(h.queue.cancel(task_id).await.unwrap(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_task_reaches_cancelled() {
        let h = queue_harness(1).await;
        h.queue.start(chrono::Duration::minutes(10)).await.unwrap();
        add_issue(&h.store, "REC-1", Priority::Low).await;
        let admission = h
            .queue
            .create_task("REC-1", CreateTaskOptions::default())
            .await
            .unwrap();
        let task_id = admission.task().task_id;

        wait_for_state(&h.store, task_id, TaskState::Analyzing, Duration::from_secs(5)).await;
        h.queue.cancel(task_id).await.unwrap();
        let cancelled =
            wait_for_state(&h.store, task_id, TaskState::Cancelled, Duration::from_secs(5)).await;
        assert!(cancelled.error.is_none());
        assert!(h.store.get_result(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_high_priority_dequeued_first() {
        let h = queue_harness(1).await;
        add_issue(&h.store, "REC-LOW", Priority::Low).await;
        add_issue(&h.store, "REC-HIGH", Priority::High).await;

        let low = h
            .queue
            .create_task("REC-LOW", CreateTaskOptions::default())
            .await
            .unwrap();
        let high = h
            .queue
            .create_task("REC-HIGH", CreateTaskOptions::default())
            .await
            .unwrap();

        // Start after both are queued so ordering is observable.
        h.queue.start(chrono::Duration::minutes(10)).await.unwrap();

        wait_for_state(
            &h.store,
            high.task().task_id,
            TaskState::Analyzing,
            Duration::from_secs(5),
        )
        .await;
        // The single worker is busy with the high-priority task; the low one
        // is still queued.
        let low_task = h.store.get_task(low.task().task_id).await.unwrap().unwrap();
        assert_eq!(low_task.state, TaskState::Queued);

        h.agent.release.notify_one();
        wait_for_state(
            &h.store,
            high.task().task_id,
            TaskState::Done,
            Duration::from_secs(5),
        )
        .await;
        wait_for_state(
            &h.store,
            low.task().task_id,
            TaskState::Analyzing,
            Duration::from_secs(5),
        )
        .await;
        h.agent.release.notify_one();
    }

    #[tokio::test]
    async fn test_recovery_fails_stale_before_accepting_work() {
        let h = queue_harness(1).await;
        add_issue(&h.store, "REC-OLD", Priority::Low).await;
        let stale = Task::new("REC-OLD".to_string(), Priority::Low);
        h.store.admit_task(&stale).await.unwrap();
        h.store
            .update_task_progress(stale.task_id, TaskState::Analyzing, 60, "was running")
            .await
            .unwrap();
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE task_id = ?")
            .bind((chrono::Utc::now() - chrono::Duration::hours(1)).timestamp())
            .bind(stale.task_id.to_string())
            .execute(h.store.pool())
            .await
            .unwrap();

        h.queue.start(chrono::Duration::minutes(10)).await.unwrap();

        let swept = h.store.get_task(stale.task_id).await.unwrap().unwrap();
        assert_eq!(swept.state, TaskState::Failed);
        assert!(swept.error.unwrap().starts_with("ServerRestart:"));
    }

    #[tokio::test]
    async fn test_worker_resize() {
        let h = queue_harness(2).await;
        assert_eq!(h.queue.worker_target(), 2);
        h.queue.set_workers(4);
        assert_eq!(h.queue.worker_target(), 4);
        h.queue.set_workers(1);
        assert_eq!(h.queue.worker_target(), 1);
        // Floor at one worker.
        h.queue.set_workers(0);
        assert_eq!(h.queue.worker_target(), 1);
    }
}
