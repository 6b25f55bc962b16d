/// Triage CLI - operator interface to the triage daemon
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

mod client;
use client::ApiClient;

#[derive(Parser)]
#[command(name = "triage")]
#[command(about = "AI-assisted ticket triage", long_about = None)]
#[command(version)]
struct Args {
    /// Daemon base URL
    #[arg(long, default_value = "http://127.0.0.1:8700", env = "TRIAGE_URL")]
    url: String,

    /// Bearer token, when the daemon requires one
    #[arg(long, env = "TRIAGE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a problem description plus log bundles for analysis
    Submit {
        /// Problem description
        description: String,

        /// Log files to attach
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// Device serial number
        #[arg(long)]
        device_sn: Option<String>,

        /// Priority (high or low)
        #[arg(short, long)]
        priority: Option<String>,

        /// Completion webhook URL
        #[arg(long)]
        webhook: Option<String>,

        /// Follow progress until the task finishes
        #[arg(short = 'w', long)]
        watch: bool,
    },

    /// Create a task for an already-registered issue
    Task {
        /// Issue record id
        issue_id: String,

        /// Provider override (claude_code, codex)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show a task's current snapshot
    Status {
        /// Task id
        task_id: String,
    },

    /// Stream a task's progress until it finishes
    Watch {
        /// Task id
        task_id: String,
    },

    /// Fetch a finished task's analysis result
    Result {
        /// Task id
        task_id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task id
        task_id: String,
    },

    /// List issues
    Issues {
        /// Filter by platform
        #[arg(long)]
        platform: Option<String>,

        /// Page size
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Rule catalog operations
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Daemon and agent health
    Health,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules
    List,
    /// Show one rule including its body
    Show { id: String },
    /// Reload the catalog from disk
    Reload,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let client = ApiClient::new(args.url, args.token);

    match args.command {
        Commands::Submit {
            description,
            file,
            device_sn,
            priority,
            webhook,
            watch,
        } => {
            let response = client
                .submit(
                    &description,
                    device_sn.as_deref(),
                    priority.as_deref(),
                    webhook.as_deref(),
                    &file,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);

            if watch {
                if let Some(task_id) = response.get("task_id").and_then(|v| v.as_str()) {
                    watch_task(&client, task_id).await?;
                }
            }
        }

        Commands::Task { issue_id, agent } => {
            let response = client
                .post(
                    "/tasks",
                    json!({ "issue_id": issue_id, "agent_type": agent }),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Status { task_id } => {
            let response = client.get(&format!("/tasks/{}", task_id)).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Watch { task_id } => {
            watch_task(&client, &task_id).await?;
        }

        Commands::Result { task_id } => {
            let response = client.get(&format!("/tasks/{}/result", task_id)).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Cancel { task_id } => {
            let response = client
                .post(&format!("/tasks/{}/cancel", task_id), json!({}))
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Issues { platform, limit } => {
            let mut path = format!("/issues?limit={}", limit);
            if let Some(platform) = platform {
                path.push_str(&format!("&platform={}", platform));
            }
            let response = client.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Rules { command } => match command {
            RuleCommands::List => {
                let response = client.get("/rules").await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            RuleCommands::Show { id } => {
                let response = client.get(&format!("/rules/{}", id)).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            RuleCommands::Reload => {
                let response = client.post("/rules/reload", json!({})).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
        },

        Commands::Health => {
            let health = client.get("/health").await?;
            let agents = client.get("/health/agents").await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            println!("{}", serde_json::to_string_pretty(&agents)?);
        }
    }

    Ok(())
}

async fn watch_task(client: &ApiClient, task_id: &str) -> anyhow::Result<()> {
    client
        .watch(task_id, |event| {
            let state = event.get("state").and_then(|v| v.as_str()).unwrap_or("?");
            let percent = event
                .get("progress_percent")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let message = event.get("message").and_then(|v| v.as_str()).unwrap_or("");
            println!("[{:>3}%] {:<12} {}", percent, state, message);
        })
        .await
}
