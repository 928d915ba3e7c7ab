pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
pub use postgres::{PostgresConfig, PostgresStore};
pub use traits::{MetricStore, NewMetric};
