use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}

pub fn format_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::{format_rfc3339, from_unix_nanos};

    #[test]
    fn unix_nanos_keep_sub_second_precision() {
        let dt = from_unix_nanos(1_700_000_000_123_456_789);
        assert_eq!(format_rfc3339(&dt), "2023-11-14T22:13:20.123456789Z");
    }
}
