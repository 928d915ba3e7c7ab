use std::{sync::Arc, time::Duration};

use tally_common::error::{Result, TallyError};
use tally_stream::{ConsumerConfig, DeadLetterSink, StreamConsumer, StreamLog};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{error, info, warn};

use crate::{
    backoff::Backoff,
    ingest::Ingestor,
    stats::{PartitionStats, PipelineStats, StatsSnapshot},
    worker::{PartitionWorker, WorkerConfig},
};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct WorkerHandle {
    partition: u32,
    handle: JoinHandle<Result<()>>,
}

/// One task per log partition, each running a [`PartitionWorker`] while
/// this instance holds the partition's lease.
///
/// Partitions leased by another consumer of the group are left alone and
/// claimed again periodically, so a partition moves to a surviving
/// instance once its owner stops or its lease expires.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    shutdown: watch::Sender<bool>,
    stats: Arc<PipelineStats>,
}

impl WorkerPool {
    pub async fn start(
        log: Arc<dyn StreamLog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ingestor: Arc<Ingestor>,
        consumer_config: ConsumerConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self> {
        let partitions = log.partition_count();
        // Surfaces a bad group name or unreadable offsets before any task starts.
        for partition in 0..partitions {
            log.committed(&consumer_config.group, partition).await?;
        }

        let stats = Arc::new(PipelineStats::new(partitions));
        let (shutdown, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let task = PartitionTask {
                partition,
                log: log.clone(),
                dead_letters: dead_letters.clone(),
                ingestor: ingestor.clone(),
                stats: stats.partition(partition).unwrap_or_default(),
                consumer_config: consumer_config.clone(),
                worker_config: worker_config.clone(),
                shutdown: shutdown.subscribe(),
            };
            workers.push(WorkerHandle {
                partition,
                handle: tokio::spawn(task.run()),
            });
        }
        info!(
            partitions,
            group = %consumer_config.group,
            consumer = %consumer_config.consumer,
            "worker pool started"
        );

        Ok(Self {
            workers,
            shutdown,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// True once every worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|worker| worker.handle.is_finished())
    }

    /// Signal every worker to stop and wait up to `timeout` for them;
    /// workers still running after that are aborted.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + DEFAULT_SHUTDOWN_TIMEOUT);

        for WorkerHandle { partition, mut handle } in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => error!(partition, error = %err, "partition worker failed"),
                Ok(Err(err)) => error!(partition, error = %err, "partition worker panicked"),
                Err(_) => {
                    warn!(partition, "partition worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("worker pool stopped");
    }
}

/// Claims one partition and processes it until shutdown.
struct PartitionTask {
    partition: u32,
    log: Arc<dyn StreamLog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ingestor: Arc<Ingestor>,
    stats: Arc<PartitionStats>,
    consumer_config: ConsumerConfig,
    worker_config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl PartitionTask {
    async fn run(mut self) -> Result<()> {
        let partition = self.partition;
        let mut backoff = Backoff::new(self.worker_config.backoff.clone());
        let mut standing_by = false;

        while !*self.shutdown.borrow() {
            let opened = StreamConsumer::open(
                self.log.clone(),
                self.dead_letters.clone(),
                partition,
                self.consumer_config.clone(),
            )
            .await;

            let delay = match opened {
                Ok(consumer) => {
                    standing_by = false;
                    backoff.reset();
                    PartitionWorker::new(
                        consumer,
                        self.ingestor.clone(),
                        self.stats.clone(),
                        self.worker_config.clone(),
                        self.shutdown.clone(),
                    )
                    .run()
                    .await?;
                    continue;
                }
                Err(TallyError::PartitionClaimed(_)) => {
                    if !standing_by {
                        info!(partition, "partition leased by another consumer, standing by");
                        standing_by = true;
                    }
                    self.consumer_config.lease_renewal()
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        partition,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to open partition, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
