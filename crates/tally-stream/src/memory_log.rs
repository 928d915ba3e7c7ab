use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use tally_common::{
    error::{Result, TallyError},
    time::now,
};

use crate::log::{EntryId, LogCursor, LogRecord, PartitionLease, StreamLog, check_partition};

type GroupPartition = (String, u32);

/// Non-durable log for tests and single-process runs.
#[derive(Debug)]
pub struct MemoryLog {
    partitions: Vec<Mutex<Vec<String>>>,
    committed: Mutex<HashMap<GroupPartition, u64>>,
    leases: Mutex<HashMap<GroupPartition, PartitionLease>>,
}

impl MemoryLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            committed: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self, partition: u32) -> Result<usize> {
        check_partition(partition, self.partition_count())?;
        Ok(self.entries(partition)?.len())
    }

    pub fn is_empty(&self) -> bool {
        self.partitions
            .iter()
            .all(|entries| entries.lock().map(|e| e.is_empty()).unwrap_or(true))
    }

    fn entries(&self, partition: u32) -> Result<MutexGuard<'_, Vec<String>>> {
        self.partitions[partition as usize]
            .lock()
            .map_err(|_| TallyError::InternalError("memory log lock poisoned".to_string()))
    }

    fn offsets(&self) -> Result<MutexGuard<'_, HashMap<GroupPartition, u64>>> {
        self.committed
            .lock()
            .map_err(|_| TallyError::InternalError("memory log lock poisoned".to_string()))
    }

    fn lease_table(&self) -> Result<MutexGuard<'_, HashMap<GroupPartition, PartitionLease>>> {
        self.leases
            .lock()
            .map_err(|_| TallyError::InternalError("memory log lock poisoned".to_string()))
    }

    /// Current lease on a partition, expired or not.
    pub fn lease(&self, group: &str, partition: u32) -> Result<Option<PartitionLease>> {
        Ok(self
            .lease_table()?
            .get(&(group.to_string(), partition))
            .cloned())
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, partition: u32, payload: &str) -> Result<EntryId> {
        check_partition(partition, self.partition_count())?;
        let mut entries = self.entries(partition)?;
        entries.push(payload.to_string());
        Ok(EntryId::new(partition, entries.len() as u64 - 1))
    }

    async fn cursor_at(&self, partition: u32, offset: u64) -> Result<LogCursor> {
        check_partition(partition, self.partition_count())?;
        let available = self.entries(partition)?.len() as u64;
        let offset = offset.min(available);
        Ok(LogCursor {
            partition,
            next_offset: offset,
            position: offset,
        })
    }

    async fn read(&self, cursor: &mut LogCursor, max: usize) -> Result<Vec<LogRecord>> {
        check_partition(cursor.partition, self.partition_count())?;
        let entries = self.entries(cursor.partition)?;
        let start = cursor.position as usize;
        let mut records = Vec::new();
        for payload in entries.iter().skip(start).take(max) {
            records.push(LogRecord {
                id: EntryId::new(cursor.partition, cursor.next_offset),
                payload: payload.clone(),
                start: *cursor,
            });
            cursor.next_offset += 1;
            cursor.position += 1;
        }
        Ok(records)
    }

    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>> {
        check_partition(partition, self.partition_count())?;
        Ok(self.offsets()?.get(&(group.to_string(), partition)).copied())
    }

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()> {
        check_partition(partition, self.partition_count())?;
        self.offsets()?.insert((group.to_string(), partition), offset);
        Ok(())
    }

    async fn claim(
        &self,
        group: &str,
        partition: u32,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool> {
        check_partition(partition, self.partition_count())?;
        let now = now();
        let mut leases = self.lease_table()?;
        let key = (group.to_string(), partition);
        if let Some(lease) = leases.get(&key)
            && !lease.grants(consumer, now)
        {
            return Ok(false);
        }
        leases.insert(key, PartitionLease::new(consumer, now, ttl)?);
        Ok(true)
    }

    async fn release(&self, group: &str, partition: u32, consumer: &str) -> Result<()> {
        check_partition(partition, self.partition_count())?;
        let mut leases = self.lease_table()?;
        let key = (group.to_string(), partition);
        if leases.get(&key).is_some_and(|lease| lease.consumer == consumer) {
            leases.remove(&key);
        }
        Ok(())
    }
}
