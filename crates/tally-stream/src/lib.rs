pub mod ack;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod file_log;
pub mod log;
pub mod memory_log;

pub use ack::AckWindow;
pub use consumer::{
    ConsumerConfig, DEFAULT_LEASE_TTL, DEFAULT_POLL_INTERVAL, Delivery, StreamConsumer,
};
pub use dead_letter::{DeadLetter, DeadLetterSink, FileDeadLetterSink, MemoryDeadLetterSink};
pub use envelope::{EnvelopeError, MetricPoint, parse_envelope};
pub use file_log::FileLog;
pub use log::{EntryId, LogCursor, LogRecord, PartitionLease, StreamLog, partition_for};
pub use memory_log::MemoryLog;
