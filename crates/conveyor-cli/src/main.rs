use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Task automation platform CLI")]
struct Cli {
    /// Base URL of the Conveyor API
    #[arg(long, env = "CONVEYOR_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// API key (reads from CONVEYOR_API_KEY env var if not provided)
    #[arg(long, env = "CONVEYOR_API_KEY")]
    api_key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage jobs
    Jobs {
        #[command(subcommand)]
        action: JobCommands,
    },

    /// Inspect execution attempts
    Executions {
        #[command(subcommand)]
        action: ExecutionCommands,
    },

    /// Inspect and download artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactCommands,
    },

    /// Operator actions
    Admin {
        #[command(subcommand)]
        action: AdminCommands,
    },

    /// Show queue depths and uptime
    Status,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Job kind: "scrape" or "ocr"
        #[arg(short, long)]
        kind: String,

        /// Kind-specific parameters as inline JSON
        #[arg(short, long)]
        parameters: String,

        /// Cron expression for a recurring job
        #[arg(long)]
        cron: Option<String>,

        /// Earliest execution time (RFC 3339) for a delayed job
        #[arg(long)]
        not_before: Option<String>,

        /// Priority: low, normal, or high
        #[arg(long)]
        priority: Option<String>,

        /// Serialize executions sharing this key
        #[arg(long)]
        ordering_key: Option<String>,

        /// Maximum delivery attempts before dead-lettering
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Disable idempotent submission
        #[arg(long, default_value_t = false)]
        no_dedupe: bool,
    },

    /// Show a job
    Get {
        #[arg(value_name = "JOB_ID")]
        id: Uuid,
    },

    /// Cancel a job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: Uuid,
    },

    /// List jobs
    List {
        /// Filter by state (e.g. active, succeeded, dead_lettered)
        #[arg(short, long)]
        state: Option<String>,

        /// Filter by kind
        #[arg(short, long)]
        kind: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ExecutionCommands {
    /// Show one execution
    Get {
        #[arg(value_name = "EXECUTION_ID")]
        id: Uuid,
    },

    /// List executions of a job
    List {
        #[arg(value_name = "JOB_ID")]
        job_id: Uuid,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Show artifact metadata
    Get {
        #[arg(value_name = "ARTIFACT_ID")]
        id: Uuid,
    },

    /// Download artifact bytes
    Fetch {
        #[arg(value_name = "ARTIFACT_ID")]
        id: Uuid,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered messages
    List {
        /// Queue kind: "scrape" or "ocr"
        #[arg(short, long)]
        kind: String,
    },

    /// Move jobs' dead-lettered messages back onto the main queue
    Redrive {
        #[arg(short, long)]
        kind: String,

        #[arg(value_name = "JOB_ID", required = true)]
        ids: Vec<Uuid>,
    },
}

struct Api {
    client: Client,
    base: String,
    key: String,
}

impl Api {
    fn new(base: String, key: String) -> Result<Self> {
        Ok(Self {
            client: Client::builder()
                .user_agent(concat!("conveyor-cli/", env!("CARGO_PKG_VERSION")))
                .build()
                .context("building HTTP client")?,
            base: base.trim_end_matches('/').to_string(),
            key,
        })
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.key)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        check(response).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<Response> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        check(response).await
    }

    async fn delete(&self, path: &str) -> Result<Response> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base))
            .bearer_auth(&self.key)
            .send()
            .await
            .with_context(|| format!("DELETE {path}"))?;
        check(response).await
    }
}

/// Surface the server's error envelope on non-success responses.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body["message"].as_str().unwrap_or("request failed");
    let trace_id = body["trace_id"].as_str().unwrap_or("-");
    bail!("{status}: {message} (trace {trace_id})");
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = Api::new(cli.api_url, cli.api_key)?;

    match cli.command {
        Commands::Jobs { action } => jobs(&api, action).await,
        Commands::Executions { action } => executions(&api, action).await,
        Commands::Artifacts { action } => artifacts(&api, action).await,
        Commands::Admin { action } => admin(&api, action).await,
        Commands::Status => {
            let body: serde_json::Value = api.get("/v1/status").await?.json().await?;
            print_json(&body)
        }
    }
}

async fn jobs(api: &Api, action: JobCommands) -> Result<()> {
    match action {
        JobCommands::Submit {
            kind,
            parameters,
            cron,
            not_before,
            priority,
            ordering_key,
            max_attempts,
            no_dedupe,
        } => {
            let parameters: serde_json::Value =
                serde_json::from_str(&parameters).context("parsing --parameters as JSON")?;

            let mut body = serde_json::json!({ "kind": kind, "parameters": parameters });
            if let Some(expr) = cron {
                body["schedule"] = serde_json::json!({ "type": "cron", "expr": expr });
            } else if let Some(not_before) = not_before {
                body["schedule"] =
                    serde_json::json!({ "type": "delayed", "not_before": not_before });
            }
            if let Some(priority) = priority {
                body["priority"] = serde_json::json!(priority);
            }
            if let Some(key) = ordering_key {
                body["ordering_key"] = serde_json::json!(key);
            }
            if let Some(max_attempts) = max_attempts {
                body["retry_policy"] = serde_json::json!({
                    "max_attempts": max_attempts,
                    "initial_backoff_ms": 1000,
                    "multiplier": 2.0,
                    "max_backoff_ms": 60000,
                });
            }
            if no_dedupe {
                body["dedupe"] = serde_json::json!(false);
            }

            let job: serde_json::Value = api.post("/v1/jobs", &body).await?.json().await?;
            print_json(&job)
        }
        JobCommands::Get { id } => {
            let job: serde_json::Value = api.get(&format!("/v1/jobs/{id}")).await?.json().await?;
            print_json(&job)
        }
        JobCommands::Cancel { id } => {
            api.delete(&format!("/v1/jobs/{id}")).await?;
            println!("cancelled {id}");
            Ok(())
        }
        JobCommands::List { state, kind, limit } => {
            let mut path = format!("/v1/jobs?limit={limit}");
            if let Some(state) = state {
                path.push_str(&format!("&state={state}"));
            }
            if let Some(kind) = kind {
                path.push_str(&format!("&kind={kind}"));
            }
            let body: serde_json::Value = api.get(&path).await?.json().await?;
            print_json(&body)
        }
    }
}

async fn executions(api: &Api, action: ExecutionCommands) -> Result<()> {
    match action {
        ExecutionCommands::Get { id } => {
            let body: serde_json::Value =
                api.get(&format!("/v1/executions/{id}")).await?.json().await?;
            print_json(&body)
        }
        ExecutionCommands::List { job_id, limit } => {
            let body: serde_json::Value = api
                .get(&format!("/v1/jobs/{job_id}/executions?limit={limit}"))
                .await?
                .json()
                .await?;
            print_json(&body)
        }
    }
}

async fn artifacts(api: &Api, action: ArtifactCommands) -> Result<()> {
    match action {
        ArtifactCommands::Get { id } => {
            let body: serde_json::Value =
                api.get(&format!("/v1/artifacts/{id}")).await?.json().await?;
            print_json(&body)
        }
        ArtifactCommands::Fetch { id, output } => {
            let bytes = api
                .get(&format!("/v1/artifacts/{id}/body"))
                .await?
                .bytes()
                .await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("wrote {} bytes to {}", bytes.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
            Ok(())
        }
    }
}

async fn admin(api: &Api, action: AdminCommands) -> Result<()> {
    match action {
        AdminCommands::Dlq { action } => match action {
            DlqCommands::List { kind } => {
                let body: serde_json::Value =
                    api.get(&format!("/v1/admin/dlq?kind={kind}")).await?.json().await?;
                print_json(&body)
            }
            DlqCommands::Redrive { kind, ids } => {
                let body = serde_json::json!({ "kind": kind, "ids": ids });
                let result: serde_json::Value =
                    api.post("/v1/admin/dlq/redrive", &body).await?.json().await?;
                print_json(&result)
            }
        },
    }
}
