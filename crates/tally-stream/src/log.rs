use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tally_common::error::{Result, TallyError};

/// Position of one entry: the partition it lives in and its offset there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    pub partition: u32,
    pub offset: u64,
}

impl EntryId {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// Read position within a partition.
///
/// `position` is backend specific (a byte offset for file logs, the entry
/// index for in-memory logs); callers only carry it between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub partition: u32,
    pub next_offset: u64,
    pub position: u64,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: EntryId,
    pub payload: String,
    /// Cursor positioned at this record, used to rewind.
    pub start: LogCursor,
}

/// Exclusive right of one consumer in a group to read a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLease {
    pub consumer: String,
    pub expires_at: DateTime<Utc>,
}

impl PartitionLease {
    pub fn new(consumer: &str, now: DateTime<Utc>, ttl: Duration) -> Result<Self> {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| TallyError::Validation(format!("lease ttl {ttl:?} is out of range")))?;
        Ok(Self {
            consumer: consumer.to_string(),
            expires_at,
        })
    }

    /// Whether `consumer` may take or renew this lease at `now`.
    pub fn grants(&self, consumer: &str, now: DateTime<Utc>) -> bool {
        self.consumer == consumer || self.expires_at <= now
    }
}

/// Durable, partitioned, append-only log with per-group committed offsets.
///
/// Within a group each partition is read by at most one consumer at a time;
/// ownership is a lease taken with [`StreamLog::claim`] and kept alive by
/// claiming again before it expires.
#[async_trait]
pub trait StreamLog: Send + Sync {
    fn partition_count(&self) -> u32;

    async fn append(&self, partition: u32, payload: &str) -> Result<EntryId>;

    /// Cursor whose next read returns the entry at `offset`.
    async fn cursor_at(&self, partition: u32, offset: u64) -> Result<LogCursor>;

    /// Up to `max` complete entries after the cursor; advances the cursor.
    async fn read(&self, cursor: &mut LogCursor, max: usize) -> Result<Vec<LogRecord>>;

    /// Highest offset committed by `group` on the partition.
    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>>;

    /// Commit `offset` and everything before it.
    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()>;

    /// Take or renew `consumer`'s lease on the partition for `ttl`.
    ///
    /// Returns `false` while another consumer of the group holds an
    /// unexpired lease.
    async fn claim(
        &self,
        group: &str,
        partition: u32,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Give up `consumer`'s lease; a lease held by anyone else is left alone.
    async fn release(&self, group: &str, partition: u32, consumer: &str) -> Result<()>;
}

/// Stable partition for a metric name, so one series stays on one partition.
pub fn partition_for(name: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions)) as u32
}

pub(crate) fn check_partition(partition: u32, partitions: u32) -> Result<()> {
    if partition >= partitions {
        return Err(TallyError::NotFound(format!(
            "partition {partition} (log has {partitions})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeDelta, TimeZone, Utc};

    use super::{EntryId, PartitionLease, partition_for};

    #[test]
    fn lease_grants_holder_or_anyone_after_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let lease = PartitionLease::new("agg-a", now, Duration::from_secs(30)).unwrap();
        assert_eq!(lease.expires_at, now + TimeDelta::seconds(30));

        assert!(lease.grants("agg-a", now));
        assert!(!lease.grants("agg-b", now + TimeDelta::seconds(29)));
        assert!(lease.grants("agg-b", now + TimeDelta::seconds(30)));
        assert!(PartitionLease::new("agg-a", now, Duration::MAX).is_err());
    }

    #[test]
    fn entry_id_display() {
        assert_eq!(EntryId::new(2, 17).to_string(), "2-17");
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for name in ["http.requests", "latency", "queue.depth", ""] {
            let partition = partition_for(name, 4);
            assert!(partition < 4);
            assert_eq!(partition, partition_for(name, 4));
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }
}
