use std::{sync::Arc, time::Duration};

use tally_common::error::{Result, TallyError};
use tally_stream::{Delivery, StreamConsumer};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    backoff::{Backoff, BackoffConfig},
    ingest::{Ingestor, Outcome},
    stats::PartitionStats,
};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Processes one partition in order: resolve, write, then acknowledge.
///
/// Stops between batches or while waiting out a retry once `shutdown`
/// flips to `true`, or as soon as the consumer loses its partition lease;
/// an entry is never acknowledged before it is stored or dead-lettered.
pub struct PartitionWorker {
    consumer: StreamConsumer,
    ingestor: Arc<Ingestor>,
    stats: Arc<PartitionStats>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl PartitionWorker {
    pub fn new(
        consumer: StreamConsumer,
        ingestor: Arc<Ingestor>,
        stats: Arc<PartitionStats>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            ingestor,
            stats,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let partition = self.consumer.partition();
        info!(partition, "partition worker started");

        let mut poll_backoff = Backoff::new(self.config.backoff.clone());
        'batches: while !self.stopping() {
            let polled = tokio::select! {
                _ = self.shutdown.changed() => break,
                polled = self.consumer.poll(self.config.batch_size, self.config.poll_timeout) => polled,
            };

            let batch = match polled {
                Ok(batch) => {
                    poll_backoff.reset();
                    batch
                }
                Err(TallyError::PartitionClaimed(_)) => break,
                Err(err) => {
                    let delay = poll_backoff.next_delay();
                    warn!(
                        partition,
                        attempt = poll_backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "failed to poll stream, backing off"
                    );
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            for delivery in batch {
                if !self.process(delivery).await {
                    break 'batches;
                }
            }
        }

        if let Err(err) = self.consumer.release().await {
            warn!(partition, error = %err, "failed to release partition lease");
        }
        info!(
            partition,
            pending = self.consumer.pending(),
            committed = ?self.consumer.committed(),
            "partition worker stopped"
        );
        Ok(())
    }

    /// Returns `false` when the worker must stop: shutdown interrupted a
    /// retry or the partition lease was lost.
    async fn process(&mut self, delivery: Delivery) -> bool {
        let partition = self.consumer.partition();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            let result = match self.ingestor.ingest(&delivery.point).await {
                Ok(Outcome::Stored { .. }) => {
                    let acked = self.consumer.ack(delivery.id).await;
                    self.stats.record_processed();
                    return match acked {
                        Ok(()) => true,
                        Err(TallyError::PartitionClaimed(_)) => false,
                        Err(err) => {
                            warn!(partition, entry = %delivery.id, error = %err, "failed to commit offset");
                            true
                        }
                    };
                }
                Ok(Outcome::Rejected(reason)) => {
                    self.consumer
                        .dead_letter(delivery.id, &delivery.payload, &reason)
                        .await
                        .map(|()| self.stats.record_dead_lettered())
                }
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(()) => return true,
                Err(err) => err,
            };
            self.stats.record_retry();
            let delay = backoff.next_delay();
            warn!(
                partition,
                entry = %delivery.id,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "entry not stored, retrying"
            );
            if !self.pause(delay).await {
                return false;
            }
            if let Err(TallyError::PartitionClaimed(_)) = self.consumer.keep_lease().await {
                return false;
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps for `delay` unless shutdown is requested first.
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.stopping() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}
