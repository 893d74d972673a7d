//! Runstage - sequencing-run staging pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runstage_common::logging::{init_logging, LogConfig, LogLevel};
use runstage_worker::api::{HttpPipelineApi, PipelineApi};
use runstage_worker::config::Config;
use runstage_worker::progress::LogProgress;
use runstage_worker::register::Registration;
use runstage_worker::steps::{StepContext, StepDeps, StepKind, StepRegistry};
use runstage_worker::storage::{s3::S3RemoteStorage, RemoteStorage};
use runstage_worker::workflow::{
    router, LocalQueue, MemoryWorkflowStore, PgWorkflowStore, RetryPolicy, Sequencer, WorkerPool,
    WorkflowStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "runstage")]
#[command(author, version, about = "Sequencing-run staging pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool, the workflow API and the registration scanner
    Run,

    /// Run one step once for a batch, outside any workflow
    Step {
        /// Step kind (inspect, archive, stage, validate, report)
        kind: String,

        /// Batch / dataset id
        id: String,
    },

    /// Print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Step { kind, id } => run_step(config, &kind, &id).await,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        },
    }
}

fn step_deps(config: Arc<Config>) -> Result<StepDeps> {
    let api: Arc<dyn PipelineApi> =
        Arc::new(HttpPipelineApi::new(&config.api).context("Failed to build API client")?);
    let storage: Arc<dyn RemoteStorage> = Arc::new(S3RemoteStorage::new(&config.storage));
    info!(api = %config.api.url, bucket = %config.storage.bucket, "Collaborators initialized");

    Ok(StepDeps {
        api,
        storage,
        config,
    })
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let deps = step_deps(config.clone())?;
    let api = deps.api.clone();
    let registry = Arc::new(StepRegistry::standard(deps));

    let store: Arc<dyn WorkflowStore> = match &config.database_url {
        Some(url) => {
            let store = PgWorkflowStore::connect(url).await?;
            info!("Using PostgreSQL workflow store");
            Arc::new(store)
        },
        None => {
            warn!("DATABASE_URL not set, workflows are kept in memory only");
            Arc::new(MemoryWorkflowStore::new())
        },
    };

    let (queue, receiver) = LocalQueue::new();
    let sequencer = Arc::new(Sequencer::new(store, Arc::new(queue), registry.clone()));
    let shutdown = CancellationToken::new();

    let pool = Arc::new(WorkerPool::new(
        sequencer.clone(),
        registry,
        RetryPolicy::from(&config.queue),
        config.queue.workers,
    ));
    let workers = pool.spawn(receiver, shutdown.clone());
    info!(workers = config.queue.workers, "Worker pool started");

    let recovered = sequencer.recover().await?;
    if recovered > 0 {
        info!(recovered, "Re-dispatched running workflows");
    }

    let scanner = if config.registration.enabled {
        let registration = Registration::new(api, sequencer.clone(), config.registration.clone());
        let token = shutdown.clone();
        Some(tokio::spawn(async move { registration.run(token).await }))
    } else {
        info!("Registration is disabled");
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Workflow API listening on {}", addr);

    axum::serve(listener, router(sequencer))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(scanner) = scanner {
        match scanner.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => error!(error = %e, "Registration scanner failed"),
            Err(e) => error!(error = %e, "Registration scanner task panicked"),
        }
    }
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("Shut down gracefully");
    Ok(())
}

async fn run_step(config: Config, kind: &str, id: &str) -> Result<()> {
    let kind: StepKind = kind.parse()?;
    let registry = StepRegistry::standard(step_deps(Arc::new(config))?);
    let handler = registry
        .get(kind)
        .with_context(|| format!("No handler registered for {kind}"))?;

    info!(%kind, id, "Running step");
    let output = handler
        .run(StepContext::standalone(id, Arc::new(LogProgress)))
        .await
        .map_err(|e| anyhow::Error::new(e.into_inner()))?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, or once `shutdown` is cancelled
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
        _ = shutdown.cancelled() => {},
    }

    shutdown.cancel();
}
