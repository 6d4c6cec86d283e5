// src/utils/timestamp.rs
use chrono::{DateTime, SecondsFormat, Utc};

/// Event time used for joining: the client time when configured and present,
/// otherwise the time the service enqueued the event.
pub fn get_enqueued_time(
    event_id: &str,
    enqueued: DateTime<Utc>,
    client_time: Option<DateTime<Utc>>,
    use_client_time: bool,
) -> DateTime<Utc> {
    if !use_client_time {
        return enqueued;
    }
    match client_time {
        Some(ts) => ts,
        None => {
            tracing::warn!(
                event_id,
                "use_client_time is set but the event carries no client time, using enqueued time"
            );
            enqueued
        }
    }
}

/// `2024-01-02T03:04:05.678Z`
pub fn to_iso_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
