use std::collections::BTreeSet;

/// Tracks delivered-but-unacknowledged offsets of one partition.
///
/// The commit point only moves past an offset once it and every earlier
/// delivered offset are acknowledged, so out-of-order acks never commit
/// an entry that is still in flight.
#[derive(Debug, Default)]
pub struct AckWindow {
    outstanding: BTreeSet<u64>,
    highest_acked: Option<u64>,
    committed: Option<u64>,
}

impl AckWindow {
    pub fn new(committed: Option<u64>) -> Self {
        Self {
            outstanding: BTreeSet::new(),
            highest_acked: committed,
            committed,
        }
    }

    pub fn deliver(&mut self, offset: u64) {
        self.outstanding.insert(offset);
    }

    /// Returns the new commit point when the ack advances it.
    pub fn ack(&mut self, offset: u64) -> Option<u64> {
        if !self.outstanding.remove(&offset) {
            return None;
        }
        self.highest_acked = Some(self.highest_acked.map_or(offset, |high| high.max(offset)));

        let candidate = match self.outstanding.first() {
            Some(&0) => return None,
            Some(&lowest) => self.highest_acked?.min(lowest - 1),
            None => self.highest_acked?,
        };
        if self.committed.is_some_and(|committed| committed >= candidate) {
            return None;
        }
        self.committed = Some(candidate);
        Some(candidate)
    }

    /// Forget deliveries at or after `offset`; they will be read again.
    pub fn forget_from(&mut self, offset: u64) {
        self.outstanding.split_off(&offset);
    }

    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_pending(&self, offset: u64) -> bool {
        self.outstanding.contains(&offset)
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }
}
