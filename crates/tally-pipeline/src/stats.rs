use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PartitionStats {
    processed: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
}

impl PartitionStats {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, partition: u32) -> PartitionSnapshot {
        PartitionSnapshot {
            partition,
            processed: self.processed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSnapshot {
    pub partition: u32,
    pub processed: u64,
    pub dead_lettered: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug)]
pub struct PipelineStats {
    partitions: Vec<Arc<PartitionStats>>,
}

impl PipelineStats {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions)
                .map(|_| Arc::new(PartitionStats::default()))
                .collect(),
        }
    }

    pub fn partition(&self, partition: u32) -> Option<Arc<PartitionStats>> {
        self.partitions.get(partition as usize).cloned()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let partitions: Vec<_> = self
            .partitions
            .iter()
            .enumerate()
            .map(|(index, stats)| stats.snapshot(index as u32))
            .collect();
        StatsSnapshot {
            processed: partitions.iter().map(|p| p.processed).sum(),
            dead_lettered: partitions.iter().map(|p| p.dead_lettered).sum(),
            retries: partitions.iter().map(|p| p.retries).sum(),
            partitions,
        }
    }
}
