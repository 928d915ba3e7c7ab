pub mod backoff;
pub mod ingest;
pub mod pool;
pub mod stats;
pub mod worker;
pub mod writer;

pub use backoff::{Backoff, BackoffConfig};
pub use ingest::{Ingestor, Outcome};
pub use pool::{DEFAULT_SHUTDOWN_TIMEOUT, WorkerPool};
pub use stats::{PartitionSnapshot, PartitionStats, PipelineStats, StatsSnapshot};
pub use worker::{PartitionWorker, WorkerConfig};
pub use writer::TimeSeriesWriter;
