use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TallyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = TallyError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            other => Err(TallyError::InvalidEnvelope(format!(
                "unknown metric type: {other}"
            ))),
        }
    }
}

/// Scalar attribute value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttributeValue {
    /// Integral floats collapse to integers so `1` and `1.0` name the same series.
    pub fn normalized(self) -> Result<Self> {
        match self {
            Self::Float(value) if !value.is_finite() => Err(TallyError::InvalidEnvelope(
                format!("non-finite attribute value: {value}"),
            )),
            Self::Float(value)
                if value.fract() == 0.0
                    && value >= i64::MIN as f64
                    && value < i64::MAX as f64 =>
            {
                Ok(Self::Int(value as i64))
            }
            other => Ok(other),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationIdentity {
    pub id: i64,
    pub name: String,
    pub owner_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricIdentity {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub kind: MetricKind,
    pub attributes: Attributes,
    pub bounds: Vec<f64>,
    pub application_id: i64,
    pub created_at: DateTime<Utc>,
}

impl MetricIdentity {
    pub fn bucket_count(&self) -> usize {
        self.bounds.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramData {
    pub sum: f64,
    pub count: u64,
    pub bucket_counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplePayload {
    Value(f64),
    Histogram(HistogramData),
}

impl SamplePayload {
    pub fn matches_kind(&self, kind: MetricKind) -> bool {
        matches!(
            (self, kind),
            (Self::Value(_), MetricKind::Counter | MetricKind::Gauge)
                | (Self::Histogram(_), MetricKind::Histogram)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub time: DateTime<Utc>,
    pub metric_id: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    pub time: DateTime<Utc>,
    pub metric_id: i64,
    pub sum: f64,
    pub count: u64,
    pub bucket_counts: Vec<u64>,
}
