//! `taskmesh`: run a master, run a worker agent, or poke a running master.

mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::TaskmeshConfig;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use taskmesh_bus::MessageBus;
use taskmesh_core::{Task, TaskPriority};
use taskmesh_gateway::{AuthConfig, BusBridge, ControlPlane, GatewayServer};
use taskmesh_orchestrator::MasterAgent;
use taskmesh_registry::WorkerRegistry;
use taskmesh_worker::{connect_client, create_default_worker, HttpMasterClient, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmesh", version, about = "Taskmesh distributed task orchestrator")]
struct Cli {
    /// Path to config file (defaults to ./taskmesh.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: control surface, registry health loop and dispatcher
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Also start the message bus coordinator
        #[arg(long)]
        bus: bool,
    },
    /// Run a worker agent against a master
    Worker {
        /// Worker id (overrides config)
        #[arg(long)]
        worker_id: Option<String>,
        /// Comma-separated capability tags (overrides config)
        #[arg(long, value_delimiter = ',')]
        capabilities: Option<Vec<String>>,
        /// Master root URL (overrides config)
        #[arg(long)]
        master_url: Option<String>,
        /// Transport to the master: http or bus (overrides config)
        #[arg(long)]
        transport: Option<Transport>,
        /// Tasks run at the same time (overrides config)
        #[arg(long)]
        max_concurrent_tasks: Option<usize>,
    },
    /// Submit one task to a running master
    Submit {
        /// Task type
        #[arg(long = "type")]
        task_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Priority: low, normal, high or critical
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Explicit task id
        #[arg(long)]
        id: Option<String>,
        /// Master root URL (overrides config)
        #[arg(long)]
        master_url: Option<String>,
    },
    /// Print the status report of a running master
    Status {
        /// Master root URL (overrides config)
        #[arg(long)]
        master_url: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TaskmeshConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Serve { host, port, bus } => serve(config, host, port, bus).await,
        Commands::Worker {
            worker_id,
            capabilities,
            master_url,
            transport,
            max_concurrent_tasks,
        } => {
            let mut section = config.worker;
            if let Some(id) = worker_id {
                section.worker_id = id;
            }
            if let Some(caps) = capabilities {
                section.capabilities = caps;
            }
            if let Some(url) = master_url {
                section.master_url = url;
            }
            if let Some(transport) = transport {
                section.transport = transport;
            }
            if let Some(max) = max_concurrent_tasks {
                section.max_concurrent_tasks = max;
            }
            run_worker(section.to_agent_config(&config.bus)).await
        }
        Commands::Submit {
            task_type,
            payload,
            priority,
            id,
            master_url,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {e}"))?;
            let mut task = Task::new(task_type, payload).with_priority(parse_priority(&priority)?);
            if let Some(id) = id {
                task = task.with_id(id);
            }
            let client = operator_client(&config, master_url);
            let resp = client.submit_task(&task).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(())
        }
        Commands::Status { master_url } => {
            let client = operator_client(&config, master_url);
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

async fn serve(
    config: TaskmeshConfig,
    host: Option<String>,
    port: Option<u16>,
    bus_flag: bool,
) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    let master = Arc::new(MasterAgent::new(config.master.to_master_config())?);
    let registry = Arc::new(WorkerRegistry::new(config.registry.to_registry_config()));
    registry.start();
    let plane = Arc::new(ControlPlane::new(master.clone(), registry.clone())?);

    let shutdown = CancellationToken::new();
    let dispatcher = {
        let master = master.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { master.serve(token).await })
    };

    let bus = if bus_flag || config.bus.enabled {
        let bus = Arc::new(MessageBus::coordinator(config.bus.to_bus_config()).await?);
        let bridge = BusBridge::attach(bus.clone(), plane.clone())?;
        info!(
            pub_addr = ?bus.pub_addr(),
            rep_addr = ?bus.rep_addr(),
            "Message bus coordinator started"
        );
        Some((bus, bridge))
    } else {
        None
    };

    let auth = AuthConfig::new(config.server.api_keys.clone());
    if auth.is_enabled() {
        info!(keys = config.server.api_keys.len(), "API key auth enabled");
    }
    let app = GatewayServer::build_with_auth(plane, auth);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Taskmesh master listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Dispatcher task ended abnormally");
    }
    if let Some((bus, bridge)) = bus {
        drop(bridge);
        bus.shutdown().await;
    }
    registry.stop().await;
    Ok(())
}

async fn run_worker(agent_config: taskmesh_worker::WorkerAgentConfig) -> anyhow::Result<()> {
    let client = connect_client(&agent_config).await?;
    let agent = Arc::new(create_default_worker(agent_config, client)?);

    let mut runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start().await })
    };

    tokio::select! {
        outcome = &mut runner => {
            outcome??;
        }
        _ = shutdown_signal() => {
            agent.stop().await;
            runner.await??;
        }
    }

    let status = agent.status();
    info!(
        worker_id = %status.worker_id,
        executed = status.tasks_executed,
        failed = status.tasks_failed,
        "Worker finished"
    );
    Ok(())
}

fn operator_client(config: &TaskmeshConfig, master_url: Option<String>) -> HttpMasterClient {
    let url = master_url.unwrap_or_else(|| config.worker.master_url.clone());
    let api_key = config
        .worker
        .api_key
        .clone()
        .or_else(|| config.server.api_keys.first().cloned());
    HttpMasterClient::new(&url, api_key)
}

fn parse_priority(name: &str) -> anyhow::Result<TaskPriority> {
    match name.to_ascii_lowercase().as_str() {
        "low" => Ok(TaskPriority::Low),
        "normal" => Ok(TaskPriority::Normal),
        "high" => Ok(TaskPriority::High),
        "critical" => Ok(TaskPriority::Critical),
        other => anyhow::bail!("unknown priority: {other}"),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received"),
        Err(e) => {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
