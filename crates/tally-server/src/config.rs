use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tally_identity::DEFAULT_CACHE_CAPACITY;
use tally_pipeline::{BackoffConfig, WorkerConfig};
use tally_store::{MemoryStore, MetricStore, PostgresConfig, PostgresStore};
use tally_stream::{ConsumerConfig, DEFAULT_POLL_INTERVAL, FileDeadLetterSink};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    about = "Metrics aggregation pipeline",
    version,
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,

    /// Default level when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume the stream and store samples (the default).
    Run(RunArgs),
    /// Append newline-delimited JSON envelopes from stdin to the stream.
    Publish(PublishArgs),
    /// Create or update the database schema.
    Migrate(StoreArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[arg(long, env = "TALLY_LOG_DIR", default_value = "./data/stream")]
    pub log_dir: PathBuf,

    #[arg(long, env = "TALLY_PARTITIONS", default_value_t = 4)]
    pub partitions: u32,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, env = "TALLY_STORE", value_enum, default_value_t = StoreKind::Postgres)]
    pub store: StoreKind,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "TALLY_DB_MIN_POOL", default_value_t = 1)]
    pub db_min_pool: u32,

    #[arg(long, env = "TALLY_DB_MAX_POOL", default_value_t = 10)]
    pub db_max_pool: u32,

    /// Statement timeout in seconds.
    #[arg(long, env = "TALLY_DB_COMMAND_TIMEOUT", default_value_t = 60)]
    pub db_command_timeout: u64,

    /// Turn the sample tables into TimescaleDB hypertables on migrate.
    #[arg(long, default_value_t = false)]
    pub timescale: bool,

    /// Drop repeated samples with the same metric and timestamp.
    #[arg(long, default_value_t = false)]
    pub dedup_samples: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "TALLY_CONSUMER_GROUP", default_value = "aggregator")]
    pub group: String,

    /// Defaults to `agg-` followed by 8 random hex digits.
    #[arg(long, env = "TALLY_CONSUMER_NAME")]
    pub consumer: Option<String>,

    /// Seconds a partition stays owned by this instance without renewal.
    #[arg(long, env = "TALLY_LEASE_TTL", default_value_t = 30)]
    pub lease_ttl: u64,

    /// Keep committed offsets in memory so every start replays the stream.
    /// Required with the memory store.
    #[arg(long, default_value_t = false)]
    pub ephemeral: bool,

    #[arg(long, env = "TALLY_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// How long one poll waits for new entries, in milliseconds.
    #[arg(long, env = "TALLY_BLOCK_MS", default_value_t = 1_000)]
    pub block_ms: u64,

    /// Defaults to `<log-dir>/dead-letter.log`.
    #[arg(long, env = "TALLY_DEAD_LETTER")]
    pub dead_letter: Option<PathBuf>,

    #[arg(long, env = "TALLY_CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_capacity: usize,

    #[arg(long, default_value = "0.0.0.0")]
    pub health_host: String,

    #[arg(long, default_value_t = 8080)]
    pub health_port: u16,

    /// Seconds workers get to finish after a stop signal.
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    #[command(flatten)]
    pub stream: StreamArgs,

    /// Target partition; by default each envelope goes to the partition of its name.
    #[arg(long)]
    pub partition: Option<u32>,
}

impl Cli {
    pub fn filter_directive(&self) -> String {
        match &self.log_level {
            Some(level) => format!("tally={level}"),
            None => "tally=info".to_string(),
        }
    }
}

impl StoreArgs {
    pub fn postgres_config(&self) -> anyhow::Result<PostgresConfig> {
        let url = self
            .database_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .context("--database-url (or DATABASE_URL) is required for the postgres store")?;
        Ok(PostgresConfig {
            min_connections: self.db_min_pool,
            max_connections: self.db_max_pool.max(self.db_min_pool),
            command_timeout: Duration::from_secs(self.db_command_timeout),
            timescale: self.timescale,
            dedup_samples: self.dedup_samples,
            ..PostgresConfig::new(url)
        })
    }

    pub async fn open(&self) -> anyhow::Result<Arc<dyn MetricStore>> {
        Ok(match self.store {
            StoreKind::Memory => {
                Arc::new(MemoryStore::new().with_sample_dedup(self.dedup_samples))
            }
            StoreKind::Postgres => Arc::new(
                PostgresStore::connect(self.postgres_config()?)
                    .await
                    .context("failed to connect to postgres")?,
            ),
        })
    }
}

impl RunArgs {
    pub fn consumer_name(&self) -> String {
        self.consumer.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("agg-{}", &id[..8])
        })
    }

    /// Rejects a non-durable store paired with durable offsets: samples
    /// acknowledged before a restart would be gone and never redelivered.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.store.store != StoreKind::Memory || self.ephemeral,
            "the memory store does not survive a restart; use --store postgres, \
             or pass --ephemeral to replay the stream on every start"
        );
        anyhow::ensure!(self.lease_ttl > 0, "--lease-ttl must be at least one second");
        Ok(())
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group: self.group.clone(),
            consumer: self.consumer_name(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ttl: Duration::from_secs(self.lease_ttl),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size.max(1),
            poll_timeout: Duration::from_millis(self.block_ms),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        self.dead_letter
            .clone()
            .unwrap_or_else(|| self.stream.log_dir.join(FileDeadLetterSink::FILE_NAME))
    }

    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.health_host, self.health_port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, Command, LogFormat, StoreKind};

    #[test]
    fn no_subcommand_runs_with_defaults() {
        let cli = Cli::try_parse_from(["tally"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(cli.filter_directive(), "tally=info");

        let run = cli.run;
        assert_eq!(run.stream.partitions, 4);
        assert_eq!(run.group, "aggregator");
        assert_eq!(run.batch_size, 100);
        assert_eq!(run.store.store, StoreKind::Postgres);
        assert!(!run.ephemeral);
        assert!(run.validate().is_ok());
        assert_eq!(run.consumer_config().lease_ttl.as_secs(), 30);
        assert_eq!(
            run.dead_letter_path(),
            PathBuf::from("./data/stream/dead-letter.log")
        );

        let consumer = run.consumer_name();
        assert!(consumer.starts_with("agg-"));
        assert_eq!(consumer.len(), 12);
    }

    #[test]
    fn run_options_are_parsed() {
        let cli = Cli::try_parse_from([
            "tally",
            "--partitions",
            "8",
            "--consumer",
            "agg-fixed",
            "--block-ms",
            "250",
            "--store",
            "postgres",
            "--database-url",
            "postgres://localhost/metrics",
            "--db-max-pool",
            "20",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.filter_directive(), "tally=debug");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.run.stream.partitions, 8);
        assert_eq!(cli.run.consumer_name(), "agg-fixed");
        assert_eq!(cli.run.worker_config().poll_timeout.as_millis(), 250);

        let postgres = cli.run.store.postgres_config().unwrap();
        assert_eq!(postgres.url, "postgres://localhost/metrics");
        assert_eq!(postgres.max_connections, 20);
        assert_eq!(postgres.command_timeout.as_secs(), 60);
    }

    #[test]
    fn postgres_needs_a_database_url() {
        let cli = Cli::try_parse_from(["tally", "migrate", "--store", "postgres"]).unwrap();
        let Some(Command::Migrate(store)) = cli.command else {
            panic!("expected migrate");
        };
        if store.database_url.is_none() {
            assert!(store.postgres_config().is_err());
        }
    }

    #[test]
    fn publish_takes_an_optional_partition() {
        let cli =
            Cli::try_parse_from(["tally", "publish", "--partition", "2", "--log-dir", "/tmp/s"])
                .unwrap();
        let Some(Command::Publish(publish)) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(publish.partition, Some(2));
        assert_eq!(publish.stream.log_dir, PathBuf::from("/tmp/s"));
    }

    #[test]
    fn memory_store_requires_ephemeral_offsets() {
        let cli = Cli::try_parse_from(["tally", "run", "--store", "memory"]).unwrap();
        let Some(Command::Run(run)) = cli.command else {
            panic!("expected run");
        };
        assert!(run.validate().is_err());

        let cli =
            Cli::try_parse_from(["tally", "run", "--store", "memory", "--ephemeral"]).unwrap();
        let Some(Command::Run(run)) = cli.command else {
            panic!("expected run");
        };
        assert!(run.validate().is_ok());

        let cli = Cli::try_parse_from(["tally", "--lease-ttl", "0"]).unwrap();
        assert!(cli.run.validate().is_err());
    }
}
