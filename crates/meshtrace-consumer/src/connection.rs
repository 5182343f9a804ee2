use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

const BASE_INTERVAL: Duration = Duration::from_secs(5);
const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Connection state of the consumer's event-bus link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Snapshot of the connection state machine.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl ConnectionInfo {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_error: None,
            last_error_time: None,
        }
    }

    pub(crate) fn record_failure(&mut self, error: impl ToString) {
        self.state = ConnectionState::Failed;
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.last_error_time = Some(Utc::now());
    }

    pub(crate) fn record_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.retry_count = 0;
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff: `min(60s, 5s * 2^min(retry - 1, 5))`.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(5);
    let delay = BASE_INTERVAL * 2u32.pow(exponent);
    delay.min(MAX_INTERVAL)
}

/// Read errors whose message marks a dropped link bounce the state machine;
/// anything else is retried in place.
pub(crate) fn is_connection_error(error: &redis::RedisError) -> bool {
    if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
        return true;
    }
    let message = error.to_string().to_lowercase();
    ["connection", "eof", "closed"]
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(5), Duration::from_secs(60));
        assert_eq!(backoff_delay(50), Duration::from_secs(60));
    }

    #[test]
    fn zero_retries_uses_base_interval() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn failure_accumulates_and_success_resets() {
        let mut info = ConnectionInfo::new();
        info.record_failure("dial tcp: refused");
        info.record_failure("dial tcp: refused");
        assert_eq!(info.state, ConnectionState::Failed);
        assert_eq!(info.retry_count, 2);
        assert!(info.last_error_time.is_some());

        info.record_connected();
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.retry_count, 0);
    }

    #[test]
    fn connection_class_errors_are_detected_by_message() {
        let dropped = redis::RedisError::from((redis::ErrorKind::IoError, "broken pipe"));
        assert!(is_connection_error(&dropped));

        let eof = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "unexpected EOF while reading",
        ));
        assert!(is_connection_error(&eof));

        let benign = redis::RedisError::from((redis::ErrorKind::TypeError, "bad bulk length"));
        assert!(!is_connection_error(&benign));
    }
}
