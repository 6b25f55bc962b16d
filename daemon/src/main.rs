//! `triaged` — the triage daemon binary.
//!
//! Composition root: loads configuration, builds every component, runs task
//! recovery, and serves the HTTP API.

mod errors;
mod event_stream;
mod handlers;
mod metrics;
mod server;
mod webhooks;

use clap::Parser;
use handlers::AppState;
use metrics::MetricsCollector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use triage_core::agent::AgentRegistry;
use triage_core::config::TriageConfig;
use triage_core::materializer::{
    ArtifactResolver, HttpArtifactResolver, LogCodec, Materializer, PassthroughCodec,
    UnconfiguredResolver,
};
use triage_core::pipeline::Pipeline;
use triage_core::progress::ProgressBus;
use triage_core::queue::TaskQueue;
use triage_core::rules::RuleCatalog;
use triage_core::store::SqliteStore;
use triage_core::workspace::sweep_expired;
use webhooks::WebhookNotifier;

#[derive(Parser)]
#[command(name = "triaged")]
#[command(about = "AI-assisted ticket triage daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "triage.toml")]
    config: PathBuf,

    /// Override the HTTP port
    #[arg(long)]
    port: Option<u16>,

    /// Override the worker pool size
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = TriageConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.http_port = port;
    }
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers.max(1);
    }

    let store = Arc::new(SqliteStore::open(&config.storage.db_path).await?);
    let catalog = Arc::new(RuleCatalog::load(&config.rules.dir)?);
    for (rule, dep) in catalog.dangling_dependencies() {
        warn!(rule, dependency = dep, "Rule references unknown dependency");
    }

    let progress = Arc::new(ProgressBus::new());
    let metrics = Arc::new(MetricsCollector::new()?);

    let resolver: Arc<dyn ArtifactResolver> = match &config.workspace.artifact_resolver_url {
        Some(url) => Arc::new(HttpArtifactResolver::new(url.clone())),
        None => Arc::new(UnconfiguredResolver),
    };
    // Deployments with the proprietary log container swap the codec here.
    let codec: Arc<dyn LogCodec> = Arc::new(PassthroughCodec);
    let materializer = Arc::new(Materializer::new(
        config.workspace.clone(),
        resolver,
        codec,
        Duration::from_secs(config.pipeline.artifact_timeout_secs),
    ));

    let agents = Arc::new(AgentRegistry::from_config(
        &config.agents,
        config.pipeline.stdout_limit_bytes,
    ));
    let notifier = Arc::new(WebhookNotifier::new(
        config.notify.tracker.clone(),
        metrics.clone(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        catalog.clone(),
        materializer,
        agents.clone(),
        progress.clone(),
        notifier,
        config.pipeline.clone(),
        config.workspace.root.clone(),
    ));

    let queue = TaskQueue::new(
        store.clone(),
        pipeline,
        progress.clone(),
        config.pipeline.workers,
    );
    // Recovery runs before any new work is accepted.
    queue
        .start(chrono::Duration::seconds(config.pipeline.stale_task_secs as i64))
        .await?;

    spawn_retention_sweeper(&config);
    spawn_worker_gauge(queue.clone(), metrics.clone());
    if config.rules.watch {
        spawn_rules_watcher(config.rules.dir.clone(), catalog.clone());
    }

    info!(version = triage_core::VERSION, "Triage daemon starting");
    let state = Arc::new(AppState {
        config,
        store,
        catalog,
        queue,
        progress,
        agents,
        metrics,
        client: reqwest::Client::new(),
    });
    server::HttpServer::new(state).run().await?;
    Ok(())
}

/// Hourly sweep of expired workspace directories.
fn spawn_retention_sweeper(config: &TriageConfig) {
    let root = config.workspace.root.clone();
    let retention_days = config.workspace.retention_days;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let root = root.clone();
            let removed = tokio::task::spawn_blocking(move || {
                sweep_expired(&root, retention_days, chrono::Utc::now())
            })
            .await
            .unwrap_or(0);
            if removed > 0 {
                info!(removed, "Retention sweep removed expired workspaces");
            }
        }
    });
}

fn spawn_worker_gauge(queue: Arc<TaskQueue>, metrics: Arc<MetricsCollector>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            metrics.workers_running.set(queue.running_tasks() as i64);
        }
    });
}

/// Reload the rule catalog when files under the rules directory change.
fn spawn_rules_watcher(dir: PathBuf, catalog: Arc<RuleCatalog>) {
    use notify::{RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "Rules watcher unavailable");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, RecursiveMode::Recursive) {
        warn!(error = %e, dir = %dir.display(), "Failed to watch rules directory");
        return;
    }

    tokio::spawn(async move {
        // Keep the watcher alive for the task's lifetime.
        let _watcher = watcher;
        while let Some(event) = rx.recv().await {
            match event {
                Ok(_) => {
                    // Debounce bursts from editors writing multiple files.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    while rx.try_recv().is_ok() {}
                    match catalog.reload() {
                        Ok(count) => info!(rules = count, "Rule catalog hot-reloaded"),
                        Err(e) => warn!(error = %e, "Rule hot-reload failed; keeping previous catalog"),
                    }
                }
                Err(e) => warn!(error = %e, "Rules watcher error"),
            }
        }
    });
}
