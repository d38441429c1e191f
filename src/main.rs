use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use trainyard::api::{self, ApiState};
use trainyard::config::{PoolConfig, RetryConfig, ServiceConfig};
use trainyard::dispatcher::Dispatcher;
use trainyard::pool::{LocalTrainer, WorkerPool};
use trainyard::registry::JobRegistry;
use trainyard::shutdown::install_shutdown_handler;
use trainyard::store::ArtifactStore;

#[derive(Parser, Debug)]
#[command(name = "trainyard")]
#[command(version)]
#[command(about = "Training job dispatch and model artifact registry")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the trainyard server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Model artifact commands
    Model {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ModelCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the HTTP API listens on
    #[arg(long, env = "TRAINYARD_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Number of workers in the pool
    #[arg(long, env = "TRAINYARD_WORKERS", default_value = "4")]
    workers: usize,

    /// Pending-queue depth; submissions beyond it are rejected with 429
    #[arg(long, env = "TRAINYARD_QUEUE_DEPTH", default_value = "16")]
    queue_depth: usize,

    /// Per-attempt execution timeout in seconds
    #[arg(long, default_value = "300")]
    job_timeout_secs: u64,

    /// Total dispatch attempts per job (original + retries)
    #[arg(long, default_value = "2")]
    max_retries: u32,

    /// Base retry backoff in milliseconds
    #[arg(long, default_value = "1000")]
    backoff_base_ms: u64,

    /// Multiplier applied to the backoff per attempt
    #[arg(long, default_value = "2")]
    backoff_factor: u32,

    /// Backoff ceiling in milliseconds
    #[arg(long, default_value = "30000")]
    backoff_cap_ms: u64,

    /// Directory artifacts are persisted under
    #[arg(long, env = "TRAINYARD_ARTIFACT_DIR", default_value = "artifacts")]
    artifact_dir: PathBuf,

    /// Bound on synchronous (?sync=true) submissions, in seconds
    #[arg(long, default_value = "60")]
    sync_wait_secs: u64,

    /// Simulated per-epoch work in the built-in trainer, in milliseconds
    #[arg(long, default_value = "10")]
    epoch_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job and model commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a training job
    Submit {
        /// Hyperparameter as KEY=VALUE (repeatable), e.g. -H lr=0.01 -H epochs=10
        #[arg(short = 'H', long = "hyperparameter", value_name = "KEY=VALUE")]
        hyperparameters: Vec<String>,

        /// Wait for the job to finish and print the model ID
        #[arg(long)]
        wait: bool,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a pending or running job
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs
    List {
        /// Filter by state (pending|running|succeeded|failed|cancelled)
        #[arg(long)]
        state: Option<String>,
    },
}

// =============================================================================
// Model Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ModelCommands {
    /// Show the latest artifact
    Latest,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Server(server) => run_server(server).await,
        Commands::Job { client, command } => run_job_command(client, command).await,
        Commands::Model { client, command } => run_model_command(client, command).await,
    }
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn Error>> {
    let config = ServiceConfig {
        listen_addr: args.listen,
        artifact_dir: args.artifact_dir,
        sync_wait: Duration::from_secs(args.sync_wait_secs),
        pool: PoolConfig {
            workers: args.workers,
            queue_depth: args.queue_depth,
            job_timeout: Duration::from_secs(args.job_timeout_secs),
        },
        retry: RetryConfig {
            max_retries: args.max_retries,
            backoff_base_ms: args.backoff_base_ms,
            backoff_factor: args.backoff_factor,
            backoff_cap_ms: args.backoff_cap_ms,
        },
    };

    let registry = Arc::new(RwLock::new(JobRegistry::new()));
    let store = Arc::new(RwLock::new(ArtifactStore::open(&config.artifact_dir)?));
    let trainer = Arc::new(LocalTrainer::new(Duration::from_millis(args.epoch_ms)));
    let pool = WorkerPool::new(&config.pool, trainer);
    let dispatcher = Dispatcher::new(
        registry.clone(),
        store.clone(),
        pool.clone(),
        config.retry.clone(),
    );

    let state = ApiState {
        dispatcher,
        registry,
        store,
        pool,
        sync_wait: config.sync_wait,
    };

    let shutdown = install_shutdown_handler();
    api::serve(config.listen_addr, state, shutdown).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Client Commands
// =============================================================================

fn parse_hyperparameters(raw: &[String]) -> Result<HashMap<String, f64>, Box<dyn Error>> {
    let mut map = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected KEY=VALUE, got \"{entry}\""))?;
        let parsed: f64 = value
            .parse()
            .map_err(|_| format!("value for \"{key}\" is not a number: \"{value}\""))?;
        map.insert(key.to_string(), parsed);
    }
    Ok(map)
}

async fn run_job_command(client: ClientArgs, command: JobCommands) -> Result<(), Box<dyn Error>> {
    let http = reqwest::Client::new();
    let response = match command {
        JobCommands::Submit {
            hyperparameters,
            wait,
        } => {
            let hyperparameters = parse_hyperparameters(&hyperparameters)?;
            let url = if wait {
                format!("{}/train?sync=true", client.addr)
            } else {
                format!("{}/train", client.addr)
            };
            http.post(&url)
                .json(&serde_json::json!({ "hyperparameters": hyperparameters }))
                .send()
                .await?
        }
        JobCommands::Status { job_id } => {
            http.get(format!("{}/jobs/{}", client.addr, job_id))
                .send()
                .await?
        }
        JobCommands::Cancel { job_id } => {
            http.post(format!("{}/jobs/{}/cancel", client.addr, job_id))
                .send()
                .await?
        }
        JobCommands::List { state } => {
            let url = match state {
                Some(state) => format!("{}/jobs?state={}", client.addr, state),
                None => format!("{}/jobs", client.addr),
            };
            http.get(url).send().await?
        }
    };
    print_response(&client.output, response).await
}

async fn run_model_command(
    client: ClientArgs,
    command: ModelCommands,
) -> Result<(), Box<dyn Error>> {
    let http = reqwest::Client::new();
    let response = match command {
        ModelCommands::Latest => {
            http.get(format!("{}/model/latest", client.addr))
                .send()
                .await?
        }
    };
    print_response(&client.output, response).await
}

async fn print_response(
    output: &OutputFormat,
    response: reqwest::Response,
) -> Result<(), Box<dyn Error>> {
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        return Err(format!("{status}: {message}").into());
    }

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Table => print_table(&body),
    }
    Ok(())
}

fn print_table(value: &serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => {
            println!(
                "{:<38} {:<10} {:>8} {:>10}",
                "JOB ID", "STATE", "ATTEMPTS", "ARTIFACT"
            );
            for item in items {
                let artifact = item
                    .get("artifact_id")
                    .and_then(|v| v.as_u64())
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<10} {:>8} {:>10}",
                    item.get("job_id").and_then(|v| v.as_str()).unwrap_or("-"),
                    item.get("state").and_then(|v| v.as_str()).unwrap_or("-"),
                    item.get("attempt_count").and_then(|v| v.as_u64()).unwrap_or(0),
                    artifact,
                );
            }
        }
        serde_json::Value::Object(fields) => {
            for (key, val) in fields {
                println!("{key:<16} {val}");
            }
        }
        other => println!("{other}"),
    }
}
