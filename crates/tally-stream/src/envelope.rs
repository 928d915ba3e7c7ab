use chrono::{DateTime, Utc};
use serde::Deserialize;
use tally_common::{
    Attributes, CanonicalKey, HistogramData, MetricKind, SamplePayload, TallyError,
    time::from_unix_nanos,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown metric type: {0}")]
    UnknownType(String),
    #[error("{0} must be a finite number")]
    NonFinite(&'static str),
    #[error("{kind} metrics must not carry histogram bounds")]
    UnexpectedBounds { kind: MetricKind },
    #[error("{kind} metrics expect a {expected} value")]
    PayloadMismatch {
        kind: MetricKind,
        expected: &'static str,
    },
    #[error("histogram has {bounds} bound(s) but {buckets} bucket count(s); expected {}", bounds + 1)]
    HistogramShape { bounds: usize, buckets: usize },
    #[error("invalid metric key: {0}")]
    Key(String),
}

impl From<EnvelopeError> for TallyError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::HistogramShape { .. } => TallyError::Validation(err.to_string()),
            other => TallyError::InvalidEnvelope(other.to_string()),
        }
    }
}

/// A structurally valid telemetry point.
#[derive(Debug, Clone)]
pub struct MetricPoint {
    pub key: CanonicalKey,
    pub kind: MetricKind,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub time: DateTime<Utc>,
    pub payload: SamplePayload,
}

impl MetricPoint {
    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn attributes(&self) -> &Attributes {
        self.key.attributes()
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    description: Option<String>,
    unit: Option<String>,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default, alias = "explicit_bounds")]
    bounds: Option<Vec<f64>>,
    time: Option<DateTime<Utc>>,
    timestamp_nano: Option<i64>,
    value: Option<RawValue>,
    sum: Option<f64>,
    count: Option<u64>,
    bucket_counts: Option<Vec<u64>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(f64),
    Histogram {
        sum: f64,
        count: u64,
        bucket_counts: Vec<u64>,
    },
}

pub fn parse_envelope(payload: &str) -> Result<MetricPoint, EnvelopeError> {
    let raw: RawEnvelope = serde_json::from_str(payload).map_err(EnvelopeError::Json)?;
    raw.validate()
}

impl RawEnvelope {
    fn validate(self) -> Result<MetricPoint, EnvelopeError> {
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or(EnvelopeError::MissingField("name"))?;
        let kind = self.kind.ok_or(EnvelopeError::MissingField("type"))?;
        let kind = kind
            .parse::<MetricKind>()
            .map_err(|_| EnvelopeError::UnknownType(kind))?;

        let time = match (self.time, self.timestamp_nano) {
            (Some(time), _) => time,
            (None, Some(nanos)) => from_unix_nanos(nanos),
            (None, None) => return Err(EnvelopeError::MissingField("time")),
        };

        let bounds = self.bounds.unwrap_or_default();
        let payload = match kind {
            MetricKind::Counter | MetricKind::Gauge => {
                if !bounds.is_empty() {
                    return Err(EnvelopeError::UnexpectedBounds { kind });
                }
                match self.value {
                    Some(RawValue::Number(value)) if value.is_finite() => {
                        SamplePayload::Value(value)
                    }
                    Some(RawValue::Number(_)) => return Err(EnvelopeError::NonFinite("value")),
                    Some(RawValue::Histogram { .. }) => {
                        return Err(EnvelopeError::PayloadMismatch {
                            kind,
                            expected: "numeric",
                        });
                    }
                    None => return Err(EnvelopeError::MissingField("value")),
                }
            }
            MetricKind::Histogram => {
                let data = match self.value {
                    Some(RawValue::Histogram {
                        sum,
                        count,
                        bucket_counts,
                    }) => HistogramData {
                        sum,
                        count,
                        bucket_counts,
                    },
                    Some(RawValue::Number(_)) => {
                        return Err(EnvelopeError::PayloadMismatch {
                            kind,
                            expected: "{sum, count, bucket_counts}",
                        });
                    }
                    None => HistogramData {
                        sum: self.sum.ok_or(EnvelopeError::MissingField("sum"))?,
                        count: self.count.ok_or(EnvelopeError::MissingField("count"))?,
                        bucket_counts: self
                            .bucket_counts
                            .ok_or(EnvelopeError::MissingField("bucket_counts"))?,
                    },
                };
                if !data.sum.is_finite() {
                    return Err(EnvelopeError::NonFinite("sum"));
                }
                if data.bucket_counts.len() != bounds.len() + 1 {
                    return Err(EnvelopeError::HistogramShape {
                        bounds: bounds.len(),
                        buckets: data.bucket_counts.len(),
                    });
                }
                SamplePayload::Histogram(data)
            }
        };

        let key = CanonicalKey::new(&name, &self.attributes, Some(bounds.as_slice()))
            .map_err(|err| EnvelopeError::Key(err.to_string()))?;

        Ok(MetricPoint {
            key,
            kind,
            description: self.description.filter(|text| !text.is_empty()),
            unit: self.unit.filter(|text| !text.is_empty()),
            time,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use tally_common::{AttributeValue, MetricKind, SamplePayload, TallyError};

    use super::{EnvelopeError, parse_envelope};

    #[test]
    fn counter_envelope_with_rfc3339_time() {
        let point = parse_envelope(
            r#"{"name":"http.requests","type":"counter","unit":"1",
                "attributes":{"service.name":"api","code":200},
                "time":"2024-05-01T12:00:00Z","value":5}"#,
        )
        .unwrap();

        assert_eq!(point.name(), "http.requests");
        assert_eq!(point.kind, MetricKind::Counter);
        assert_eq!(point.payload, SamplePayload::Value(5.0));
        assert_eq!(point.unit.as_deref(), Some("1"));
        assert_eq!(point.attributes()["code"], AttributeValue::Int(200));
    }

    #[test]
    fn collector_shape_with_flat_histogram_fields() {
        let point = parse_envelope(
            r#"{"name":"latency","description":"","unit":"ms","type":"histogram",
                "timestamp_nano":1700000000000000000,"attributes":{},
                "sum":12.5,"count":3,"bucket_counts":[1,1,1],
                "explicit_bounds":[5.0,10.0],"trace_id":"abc"}"#,
        )
        .unwrap();

        assert_eq!(point.key.bounds(), &[5.0, 10.0]);
        assert_eq!(point.description, None);
        match point.payload {
            SamplePayload::Histogram(data) => assert_eq!(data.bucket_counts, vec![1, 1, 1]),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn histogram_with_n_bounds_needs_n_plus_one_buckets() {
        let envelope = |buckets: &str| {
            format!(
                r#"{{"name":"latency","type":"histogram","time":"2024-05-01T12:00:00Z",
                    "bounds":[1.0,2.0,3.0],
                    "value":{{"sum":1.0,"count":1,"bucket_counts":{buckets}}}}}"#
            )
        };

        assert!(parse_envelope(&envelope("[0,1,0,0]")).is_ok());
        for buckets in ["[0,1,0]", "[0,1,0,0,0]", "[]"] {
            let err = parse_envelope(&envelope(buckets)).unwrap_err();
            assert!(matches!(err, EnvelopeError::HistogramShape { bounds: 3, .. }));
            assert!(matches!(TallyError::from(err), TallyError::Validation(_)));
        }
    }

    #[test]
    fn histogram_without_bounds_has_a_single_bucket() {
        let point = parse_envelope(
            r#"{"name":"sizes","type":"histogram","time":"2024-05-01T12:00:00Z",
                "value":{"sum":4.0,"count":2,"bucket_counts":[2]}}"#,
        );
        assert!(point.is_ok());
    }

    #[test]
    fn structural_failures_are_reported() {
        let cases = [
            ("not json", "json"),
            (r#"{"type":"counter","time":"2024-05-01T12:00:00Z","value":1}"#, "name"),
            (r#"{"name":"a","time":"2024-05-01T12:00:00Z","value":1}"#, "type"),
            (r#"{"name":"a","type":"summary","time":"2024-05-01T12:00:00Z","value":1}"#, "type"),
            (r#"{"name":"a","type":"gauge","value":1}"#, "time"),
            (r#"{"name":"a","type":"gauge","time":"2024-05-01T12:00:00Z"}"#, "value"),
            (
                r#"{"name":"a","type":"gauge","time":"2024-05-01T12:00:00Z","value":"high"}"#,
                "json",
            ),
            (
                r#"{"name":"a","type":"gauge","time":"2024-05-01T12:00:00Z","value":1,
                    "attributes":{"nested":{"x":1}}}"#,
                "json",
            ),
            (
                r#"{"name":"a","type":"gauge","time":"2024-05-01T12:00:00Z","value":1,
                    "bounds":[1.0]}"#,
                "bounds",
            ),
            (
                r#"{"name":"a","type":"histogram","time":"2024-05-01T12:00:00Z",
                    "bounds":[2.0,1.0],"value":{"sum":1,"count":1,"bucket_counts":[0,1,0]}}"#,
                "key",
            ),
        ];

        for (payload, expected) in cases {
            let err = parse_envelope(payload).unwrap_err();
            let matched = match expected {
                "json" => matches!(err, EnvelopeError::Json(_)),
                "name" => matches!(err, EnvelopeError::MissingField("name")),
                "type" => matches!(
                    err,
                    EnvelopeError::MissingField("type") | EnvelopeError::UnknownType(_)
                ),
                "time" => matches!(err, EnvelopeError::MissingField("time")),
                "value" => matches!(err, EnvelopeError::MissingField("value")),
                "bounds" => matches!(err, EnvelopeError::UnexpectedBounds { .. }),
                "key" => matches!(err, EnvelopeError::Key(_)),
                _ => false,
            };
            assert!(matched, "{payload}: unexpected error {err}");
            assert!(!TallyError::from(err).is_retryable());
        }
    }
}
