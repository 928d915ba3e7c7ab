use std::{sync::Arc, time::Duration};

use tally_common::{
    error::{Result, TallyError},
    time::now,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    ack::AckWindow,
    dead_letter::{DeadLetter, DeadLetterSink},
    envelope::{MetricPoint, parse_envelope},
    log::{EntryId, LogCursor, LogRecord, StreamLog},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Stand-in deadline for waits too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    /// Lease holder name; must be unique among live consumers of the group.
    pub consumer: String,
    pub poll_interval: Duration,
    /// How long a partition stays owned without renewal. Renewed every third of it.
    pub lease_ttl: Duration,
}

impl ConsumerConfig {
    pub fn lease_renewal(&self) -> Duration {
        self.lease_ttl / 3
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "aggregator".to_string(),
            consumer: "local".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// A structurally valid entry awaiting processing and acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: EntryId,
    pub payload: String,
    pub point: MetricPoint,
}

/// Reads one partition of a [`StreamLog`] on behalf of a consumer group.
///
/// Reading resumes right after the group's committed offset, so anything
/// delivered but not acknowledged before a restart is delivered again.
/// The consumer holds the partition's lease for as long as it is open;
/// once the lease is lost, `poll` and `ack` fail with
/// [`TallyError::PartitionClaimed`] and nothing more is committed.
pub struct StreamConsumer {
    log: Arc<dyn StreamLog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    partition: u32,
    cursor: LogCursor,
    window: AckWindow,
    lease_renewed: Instant,
}

impl StreamConsumer {
    pub async fn open(
        log: Arc<dyn StreamLog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        partition: u32,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let claimed_at = Instant::now();
        if !log
            .claim(&config.group, partition, &config.consumer, config.lease_ttl)
            .await?
        {
            return Err(TallyError::PartitionClaimed(format!(
                "partition {partition} of group {}",
                config.group
            )));
        }

        let committed = log.committed(&config.group, partition).await?;
        let start = committed.map_or(0, |offset| offset + 1);
        let cursor = log.cursor_at(partition, start).await?;
        info!(
            partition,
            group = %config.group,
            consumer = %config.consumer,
            committed = ?committed,
            "stream consumer opened"
        );

        Ok(Self {
            log,
            dead_letters,
            config,
            partition,
            cursor,
            window: AckWindow::new(committed),
            lease_renewed: claimed_at,
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Number of delivered entries not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.window.pending()
    }

    pub fn committed(&self) -> Option<u64> {
        self.window.committed()
    }

    /// Wait up to `timeout` for entries and return at most `batch_size` valid ones.
    ///
    /// Malformed entries are dead-lettered and acknowledged here and never
    /// returned. An empty result means the timeout expired.
    pub async fn poll(&mut self, batch_size: usize, timeout: Duration) -> Result<Vec<Delivery>> {
        let batch_size = batch_size.max(1);
        let deadline = deadline_after(timeout);
        loop {
            self.keep_lease().await?;
            let records = self.log.read(&mut self.cursor, batch_size).await?;
            if !records.is_empty() {
                let deliveries = self.accept(records).await?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn accept(&mut self, records: Vec<LogRecord>) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            self.window.deliver(record.id.offset);
            let err = match parse_envelope(&record.payload) {
                Ok(point) => {
                    deliveries.push(Delivery {
                        id: record.id,
                        payload: record.payload,
                        point,
                    });
                    continue;
                }
                Err(err) => err,
            };

            let reason = TallyError::from(err).to_string();
            if let Err(send_err) = self.send_dead_letter(record.id, &record.payload, &reason).await
            {
                self.cursor = record.start;
                self.window.forget_from(record.id.offset);
                if deliveries.is_empty() {
                    return Err(send_err);
                }
                warn!(
                    partition = self.partition,
                    entry = %record.id,
                    error = %send_err,
                    "dead-letter sink failed, entry will be read again"
                );
                return Ok(deliveries);
            }
            if let Err(ack_err) = self.ack(record.id).await {
                warn!(entry = %record.id, error = %ack_err, "failed to commit dead-lettered entry");
            }
        }
        Ok(deliveries)
    }

    /// Acknowledge a delivered entry, committing the read position once
    /// every earlier delivery is acknowledged too.
    pub async fn ack(&mut self, id: EntryId) -> Result<()> {
        if id.partition != self.partition {
            return Err(TallyError::Validation(format!(
                "entry {id} does not belong to partition {}",
                self.partition
            )));
        }
        self.keep_lease().await?;
        if let Some(offset) = self.window.ack(id.offset) {
            self.log
                .commit(&self.config.group, self.partition, offset)
                .await?;
            debug!(partition = self.partition, offset, "committed offset");
        }
        Ok(())
    }

    /// Divert a delivered entry to the dead-letter sink, then acknowledge it.
    ///
    /// Fails only when the sink does; the entry then stays unacknowledged.
    pub async fn dead_letter(&mut self, id: EntryId, payload: &str, reason: &str) -> Result<()> {
        self.send_dead_letter(id, payload, reason).await?;
        if let Err(err) = self.ack(id).await {
            warn!(entry = %id, error = %err, "failed to commit dead-lettered entry");
        }
        Ok(())
    }

    /// Give the partition back to the group.
    pub async fn release(&self) -> Result<()> {
        self.log
            .release(&self.config.group, self.partition, &self.config.consumer)
            .await?;
        debug!(partition = self.partition, consumer = %self.config.consumer, "released partition");
        Ok(())
    }

    /// Renews the lease once a third of its ttl has passed.
    ///
    /// A renewal that errors is tolerated until the lease would have run
    /// out; after that the partition is treated as lost.
    pub async fn keep_lease(&mut self) -> Result<()> {
        let held_for = self.lease_renewed.elapsed();
        if held_for < self.config.lease_renewal() {
            return Ok(());
        }

        let attempted_at = Instant::now();
        let renewed = self
            .log
            .claim(
                &self.config.group,
                self.partition,
                &self.config.consumer,
                self.config.lease_ttl,
            )
            .await;
        match renewed {
            Ok(true) => {
                self.lease_renewed = attempted_at;
                Ok(())
            }
            Ok(false) => Err(self.lease_lost()),
            Err(err) if held_for < self.config.lease_ttl => Err(err),
            Err(err) => {
                warn!(partition = self.partition, error = %err, "lease renewal kept failing");
                Err(self.lease_lost())
            }
        }
    }

    fn lease_lost(&self) -> TallyError {
        warn!(
            partition = self.partition,
            consumer = %self.config.consumer,
            "partition lease taken over by another consumer"
        );
        TallyError::PartitionClaimed(format!(
            "partition {} of group {}",
            self.partition, self.config.group
        ))
    }

    async fn send_dead_letter(&self, id: EntryId, payload: &str, reason: &str) -> Result<()> {
        warn!(partition = self.partition, entry = %id, reason, "dead-lettering entry");
        self.dead_letters
            .send(&DeadLetter {
                entry: id,
                payload: payload.to_string(),
                reason: reason.to_string(),
                failed_at: now(),
            })
            .await
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
