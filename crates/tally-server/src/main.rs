mod config;
mod health;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tally_identity::{ApplicationRegistrar, IdentityResolver};
use tally_pipeline::{Ingestor, TimeSeriesWriter, WorkerPool};
use tally_store::PostgresStore;
use tally_stream::{FileDeadLetterSink, FileLog, StreamLog, partition_for};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::oneshot,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Cli, Command, LogFormat, PublishArgs, RunArgs, StoreArgs, StoreKind},
    health::{HealthState, health_router},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match cli.command {
        None => run(cli.run).await,
        Some(Command::Run(args)) => run(args).await,
        Some(Command::Publish(args)) => publish(args).await,
        Some(Command::Migrate(args)) => migrate(args).await,
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(cli.filter_directive())?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    args.validate()?;
    let mut file_log = FileLog::open(&args.stream.log_dir, args.stream.partitions)
        .await
        .with_context(|| format!("failed to open stream at {}", args.stream.log_dir.display()))?;
    if args.ephemeral {
        file_log = file_log.with_volatile_commits();
    }
    let log: Arc<dyn StreamLog> = Arc::new(file_log);
    let dead_letters = Arc::new(FileDeadLetterSink::open(args.dead_letter_path()).await?);
    let store = args.store.open().await?;

    let registrar = Arc::new(ApplicationRegistrar::new(store.clone(), args.cache_capacity));
    let resolver = Arc::new(IdentityResolver::new(
        store.clone(),
        registrar,
        args.cache_capacity,
    ));
    let ingestor = Arc::new(Ingestor::new(resolver, TimeSeriesWriter::new(store.clone())));

    let pool = WorkerPool::start(
        log,
        dead_letters,
        ingestor,
        args.consumer_config(),
        args.worker_config(),
    )
    .await?;

    let health_state = Arc::new(HealthState {
        store,
        stats: pool.stats(),
    });
    let addr = args.health_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind health server on {addr}"))?;
    info!("tally health server listening on {addr}");

    let (stop_health, health_stopped) = oneshot::channel::<()>();
    let health = tokio::spawn(async move {
        axum::serve(listener, health_router(health_state))
            .with_graceful_shutdown(async {
                let _ = health_stopped.await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown requested");
    pool.shutdown(args.shutdown_timeout()).await;

    let _ = stop_health.send(());
    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "health server failed"),
        Err(err) => warn!(error = %err, "health server task failed"),
    }
    info!("tally stopped");
    Ok(())
}

async fn publish(args: PublishArgs) -> anyhow::Result<()> {
    let partitions = args.stream.partitions;
    if let Some(partition) = args.partition {
        anyhow::ensure!(
            partition < partitions,
            "partition {partition} is out of range (stream has {partitions})"
        );
    }
    let log = FileLog::open(&args.stream.log_dir, partitions).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let partition = match args.partition {
            Some(partition) => partition,
            None => partition_for(&envelope_name(line), partitions),
        };
        let id = log.append(partition, line).await?;
        debug!(entry = %id, "published envelope");
        published += 1;
    }
    info!(published, "published envelopes");
    Ok(())
}

/// Name used for partition routing; unparseable lines still get published.
fn envelope_name(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("name")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

async fn migrate(args: StoreArgs) -> anyhow::Result<()> {
    if args.store == StoreKind::Memory {
        info!("memory store has no schema to migrate");
        return Ok(());
    }
    let store = PostgresStore::connect(args.postgres_config()?)
        .await
        .context("failed to connect to postgres")?;
    store.migrate().await?;
    store.close().await;
    info!("schema is up to date");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
