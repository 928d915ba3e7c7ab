pub mod audit;
pub mod error;
pub mod key;
pub mod time;
pub mod types;

pub use audit::{AuditAction, AuditEvent};
pub use error::{Result, TallyError};
pub use key::CanonicalKey;
pub use types::{
    ApplicationIdentity, AttributeValue, Attributes, HistogramData, HistogramSample,
    MetricIdentity, MetricKind, MetricSample, SamplePayload,
};
