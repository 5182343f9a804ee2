use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Runtime tag stamped onto events produced by this implementation.
pub const RUNTIME_TAG: &str = "rust";

/// Runtime tag assumed for events that arrive without one.
pub const DEFAULT_RUNTIME: &str = "unknown";

/// Kind of trace event carried on the stream.
///
/// The empty wire string combined with a non-empty `operation` denotes a
/// single self-contained execution-trace event carrying both start time and
/// duration; it is modeled as [`EventType::Execution`]. Wire values outside
/// the known set decode to [`EventType::Unknown`] and are ignored by
/// processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventType {
    SpanStart,
    SpanEnd,
    Error,
    #[default]
    Execution,
    Unknown,
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventType::from_wire(&raw))
    }
}

impl EventType {
    /// Wire representation used in stream field maps.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventType::SpanStart => "span_start",
            EventType::SpanEnd => "span_end",
            EventType::Error => "error",
            EventType::Execution | EventType::Unknown => "",
        }
    }

    /// Parse the wire representation; unrecognized values map to `Unknown`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "span_start" => EventType::SpanStart,
            "span_end" => EventType::SpanEnd,
            "error" => EventType::Error,
            "" => EventType::Execution,
            _ => EventType::Unknown,
        }
    }
}

/// Error raised when a stream entry cannot be parsed into a [`TraceEvent`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Canonical trace-event record emitted by polyglot agents.
///
/// Events travel on the bus as flat string field maps; [`TraceEvent::encode_field_map`]
/// and [`TraceEvent::decode_field_map`] are bit-compatible with the other
/// runtime SDKs, including their alias field names and string-typed numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<String>,
    pub agent_name: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub operation: String,
    pub event_type: EventType,
    /// Seconds since epoch, UTC, nanosecond precision.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    pub runtime: String,
}

/// Current time as float seconds since epoch.
pub fn now_epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl TraceEvent {
    /// Start-of-span event stamped with this runtime and the current time.
    pub fn span_start(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span: Option<String>,
        agent_name: impl Into<String>,
        agent_id: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span: normalize_parent(parent_span),
            agent_name: agent_name.into(),
            agent_id: agent_id.into(),
            ip_address: None,
            operation: operation.into(),
            event_type: EventType::SpanStart,
            timestamp: now_epoch_secs(),
            duration_ms: None,
            success: None,
            error_message: None,
            capability: None,
            target_agent: None,
            runtime: RUNTIME_TAG.to_string(),
        }
    }

    /// End-of-span event stamped with this runtime and the current time.
    pub fn span_end(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_id: impl Into<String>,
        operation: impl Into<String>,
        duration_ms: i64,
        success: bool,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span: None,
            agent_name: agent_name.into(),
            agent_id: agent_id.into(),
            ip_address: None,
            operation: operation.into(),
            event_type: EventType::SpanEnd,
            timestamp: now_epoch_secs(),
            duration_ms: Some(duration_ms),
            success: Some(success),
            error_message: None,
            capability: None,
            target_agent: None,
            runtime: RUNTIME_TAG.to_string(),
        }
    }

    /// Error event stamped with this runtime and the current time.
    pub fn error(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_id: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span: None,
            agent_name: agent_name.into(),
            agent_id: agent_id.into(),
            ip_address: None,
            operation: operation.into(),
            event_type: EventType::Error,
            timestamp: now_epoch_secs(),
            duration_ms: None,
            success: Some(false),
            error_message: Some(message.into()),
            capability: None,
            target_agent: None,
            runtime: RUNTIME_TAG.to_string(),
        }
    }

    /// True for a self-contained execution-trace event (empty event type,
    /// non-empty operation).
    pub fn is_execution_trace(&self) -> bool {
        self.event_type == EventType::Execution && !self.operation.is_empty()
    }

    /// Encode to the stream's flat field map.
    ///
    /// Required fields are written unconditionally; optional fields are
    /// omitted when absent. Booleans and numbers become strings on the wire.
    pub fn encode_field_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("trace_id".to_string(), self.trace_id.clone());
        map.insert("span_id".to_string(), self.span_id.clone());
        map.insert("agent_name".to_string(), self.agent_name.clone());
        map.insert("agent_id".to_string(), self.agent_id.clone());
        map.insert("operation".to_string(), self.operation.clone());
        map.insert("event_type".to_string(), self.event_type.as_wire().to_string());
        map.insert("timestamp".to_string(), format!("{}", self.timestamp));
        map.insert("runtime".to_string(), self.runtime.clone());

        if let Some(parent) = &self.parent_span {
            if !parent.is_empty() {
                map.insert("parent_span".to_string(), parent.clone());
            }
        }
        if let Some(ip) = &self.ip_address {
            if !ip.is_empty() {
                map.insert("ip_address".to_string(), ip.clone());
            }
        }
        if let Some(duration) = self.duration_ms {
            map.insert("duration_ms".to_string(), duration.to_string());
        }
        if let Some(success) = self.success {
            map.insert("success".to_string(), if success { "true" } else { "false" }.to_string());
        }
        if let Some(message) = &self.error_message {
            map.insert("error_message".to_string(), message.clone());
        }
        if let Some(capability) = &self.capability {
            map.insert("capability".to_string(), capability.clone());
        }
        if let Some(target) = &self.target_agent {
            map.insert("target_agent".to_string(), target.clone());
        }
        map
    }

    /// Decode a stream field map, accepting the alias field names used by
    /// other runtime SDKs. Malformed numeric fields are dropped rather than
    /// failing the event; only missing identity fields are an error.
    pub fn decode_field_map(map: &HashMap<String, String>) -> Result<Self, EventDecodeError> {
        let trace_id = required(map, "trace_id")?;
        let span_id = required(map, "span_id")?;
        let agent_name = required(map, "agent_name")?;
        let agent_id = required(map, "agent_id")?;
        let operation = aliased(map, "operation", "function_name")
            .ok_or(EventDecodeError::MissingField("operation"))?;

        let ip_address = aliased(map, "ip_address", "agent_ip");
        let event_type = EventType::from_wire(map.get("event_type").map(String::as_str).unwrap_or(""));

        let timestamp = aliased(map, "timestamp", "start_time")
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);

        let duration_ms = map.get("duration_ms").and_then(|raw| parse_duration_ms(raw));
        let success = map.get("success").and_then(|raw| parse_success(raw));

        let runtime = map
            .get("runtime")
            .filter(|r| !r.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());

        Ok(Self {
            trace_id,
            span_id,
            parent_span: normalize_parent(map.get("parent_span").cloned()),
            agent_name,
            agent_id,
            ip_address,
            operation,
            event_type,
            timestamp,
            duration_ms,
            success,
            error_message: optional(map, "error_message"),
            capability: optional(map, "capability"),
            target_agent: optional(map, "target_agent"),
            runtime,
        })
    }
}

fn required(map: &HashMap<String, String>, key: &'static str) -> Result<String, EventDecodeError> {
    match map.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(EventDecodeError::MissingField(key)),
    }
}

fn optional(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).cloned()
}

fn aliased(map: &HashMap<String, String>, principal: &str, alias: &str) -> Option<String> {
    optional(map, principal).or_else(|| optional(map, alias))
}

/// Empty, `null`, and the literal string `"null"` all denote a root span.
fn normalize_parent(parent: Option<String>) -> Option<String> {
    parent.filter(|p| !p.is_empty() && p != "null")
}

/// Durations arrive either as integer strings or float-serialized strings;
/// both are coerced to integer milliseconds (floor). Anything else drops.
fn parse_duration_ms(raw: &str) -> Option<i64> {
    if let Ok(int) = raw.parse::<i64>() {
        return Some(int);
    }
    raw.parse::<f64>().ok().map(|f| f.floor() as i64)
}

/// Both capitalizations are recognized; any other value is "unknown".
fn parse_success(raw: &str) -> Option<bool> {
    match raw {
        "true" | "True" => Some(true),
        "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("trace_id".to_string(), "1322f09dbaee4241a45da4ee78dc199f".to_string());
        map.insert("span_id".to_string(), "aaaaaaaaaaaaaaaa".to_string());
        map.insert("agent_name".to_string(), "weather-agent".to_string());
        map.insert("agent_id".to_string(), "weather-agent-abc123".to_string());
        map.insert("operation".to_string(), "get_forecast".to_string());
        map.insert("event_type".to_string(), "span_start".to_string());
        map.insert("timestamp".to_string(), "1000.000123".to_string());
        map.insert("runtime".to_string(), "python".to_string());
        map
    }

    #[test]
    fn decode_required_fields() {
        let event = TraceEvent::decode_field_map(&sample_map()).unwrap();
        assert_eq!(event.trace_id, "1322f09dbaee4241a45da4ee78dc199f");
        assert_eq!(event.span_id, "aaaaaaaaaaaaaaaa");
        assert_eq!(event.event_type, EventType::SpanStart);
        assert_eq!(event.timestamp, 1000.000123);
        assert_eq!(event.runtime, "python");
        assert_eq!(event.parent_span, None);
    }

    #[test]
    fn decode_missing_identity_field_fails() {
        let mut map = sample_map();
        map.remove("span_id");
        assert_eq!(
            TraceEvent::decode_field_map(&map),
            Err(EventDecodeError::MissingField("span_id"))
        );
    }

    #[test]
    fn decode_accepts_alias_fields() {
        let mut map = sample_map();
        map.remove("timestamp");
        map.insert("start_time".to_string(), "1234.5".to_string());
        map.insert("agent_ip".to_string(), "10.0.0.7".to_string());
        map.remove("operation");
        map.insert("function_name".to_string(), "aliased_op".to_string());

        let event = TraceEvent::decode_field_map(&map).unwrap();
        assert_eq!(event.timestamp, 1234.5);
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(event.operation, "aliased_op");
    }

    #[test]
    fn decode_duration_integer_and_float_strings() {
        let mut map = sample_map();
        map.insert("duration_ms".to_string(), "250".to_string());
        assert_eq!(TraceEvent::decode_field_map(&map).unwrap().duration_ms, Some(250));

        map.insert("duration_ms".to_string(), "250.75".to_string());
        assert_eq!(TraceEvent::decode_field_map(&map).unwrap().duration_ms, Some(250));

        map.insert("duration_ms".to_string(), "not-a-number".to_string());
        assert_eq!(TraceEvent::decode_field_map(&map).unwrap().duration_ms, None);
    }

    #[test]
    fn decode_success_capitalizations() {
        let mut map = sample_map();
        for (raw, expected) in [
            ("true", Some(true)),
            ("True", Some(true)),
            ("false", Some(false)),
            ("False", Some(false)),
            ("yes", None),
        ] {
            map.insert("success".to_string(), raw.to_string());
            assert_eq!(TraceEvent::decode_field_map(&map).unwrap().success, expected, "raw={raw}");
        }
    }

    #[test]
    fn decode_parent_null_literals_mean_root() {
        let mut map = sample_map();
        for raw in ["", "null"] {
            map.insert("parent_span".to_string(), raw.to_string());
            assert_eq!(TraceEvent::decode_field_map(&map).unwrap().parent_span, None);
        }
        map.insert("parent_span".to_string(), "bbbbbbbbbbbbbbbb".to_string());
        assert_eq!(
            TraceEvent::decode_field_map(&map).unwrap().parent_span.as_deref(),
            Some("bbbbbbbbbbbbbbbb")
        );
    }

    #[test]
    fn decode_malformed_timestamp_drops_field() {
        let mut map = sample_map();
        map.insert("timestamp".to_string(), "garbage".to_string());
        assert_eq!(TraceEvent::decode_field_map(&map).unwrap().timestamp, 0.0);
    }

    #[test]
    fn decode_missing_runtime_defaults() {
        let mut map = sample_map();
        map.remove("runtime");
        assert_eq!(TraceEvent::decode_field_map(&map).unwrap().runtime, DEFAULT_RUNTIME);
    }

    #[test]
    fn encode_round_trips_canonical_fields() {
        let mut event = TraceEvent::span_start(
            "1322f09dbaee4241a45da4ee78dc199f",
            "aaaaaaaaaaaaaaaa",
            Some("cccccccccccccccc".to_string()),
            "weather-agent",
            "weather-agent-abc123",
            "get_forecast",
        );
        event.timestamp = 1000.25;
        event.duration_ms = Some(250);
        event.success = Some(true);
        event.capability = Some("forecast".to_string());

        let encoded = event.encode_field_map();
        assert_eq!(encoded.get("success").map(String::as_str), Some("true"));
        assert_eq!(encoded.get("timestamp").map(String::as_str), Some("1000.25"));
        assert_eq!(encoded.get("event_type").map(String::as_str), Some("span_start"));
        assert!(!encoded.contains_key("error_message"));
        assert!(!encoded.contains_key("target_agent"));

        let decoded = TraceEvent::decode_field_map(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn encode_omits_empty_optionals() {
        let event = TraceEvent::span_end(
            "t".repeat(32),
            "s".repeat(16),
            "agent",
            "agent-1",
            "op",
            10,
            false,
        );
        let encoded = event.encode_field_map();
        assert!(!encoded.contains_key("parent_span"));
        assert!(!encoded.contains_key("ip_address"));
        assert_eq!(encoded.get("success").map(String::as_str), Some("false"));
        assert_eq!(encoded.get("duration_ms").map(String::as_str), Some("10"));
    }

    #[test]
    fn execution_trace_detection() {
        let mut map = sample_map();
        map.insert("event_type".to_string(), "".to_string());
        let event = TraceEvent::decode_field_map(&map).unwrap();
        assert_eq!(event.event_type, EventType::Execution);
        assert!(event.is_execution_trace());
    }

    #[test]
    fn unknown_event_type_is_ignored_kind() {
        let mut map = sample_map();
        map.insert("event_type".to_string(), "heartbeat".to_string());
        let event = TraceEvent::decode_field_map(&map).unwrap();
        assert_eq!(event.event_type, EventType::Unknown);
        assert!(!event.is_execution_trace());
    }

    #[test]
    fn factories_stamp_runtime_and_now() {
        let event = TraceEvent::error("t".repeat(32), "s".repeat(16), "a", "a-1", "op", "boom");
        assert_eq!(event.runtime, RUNTIME_TAG);
        assert_eq!(event.success, Some(false));
        assert_eq!(event.error_message.as_deref(), Some("boom"));
        assert!(event.timestamp > 1_600_000_000.0);
    }
}
