//! Serde model for the backend's protobuf-as-JSON trace response, plus the
//! reverse mapping onto the domain `CompletedTrace`.
//!
//! The shape tolerates the variations seen across backend versions: both
//! `scopeSpans` and the older `instrumentationLibrarySpans` key, string or
//! numeric unix-nano timestamps, enum-name or numeric status codes, and ids
//! carried as hex or proto3-JSON base64.

use base64::Engine as _;
use meshtrace_types::{CompletedTrace, TraceSpan, DEFAULT_RUNTIME};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct TraceDocument {
    #[serde(default)]
    pub batches: Vec<Batch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    #[serde(default)]
    pub resource: Option<ResourceBlock>,
    #[serde(default, alias = "instrumentationLibrarySpans")]
    pub scope_spans: Vec<ScopeSpansBlock>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourceBlock {
    #[serde(default)]
    pub attributes: Vec<KeyValuePair>,
}

#[derive(Debug, Deserialize)]
pub struct ScopeSpansBlock {
    #[serde(default)]
    pub spans: Vec<BackendSpan>,
}

#[derive(Debug, Deserialize)]
pub struct KeyValuePair {
    pub key: String,
    #[serde(default)]
    pub value: Option<AttributeValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeValue {
    #[serde(default)]
    pub string_value: Option<String>,
    #[serde(default)]
    pub int_value: Option<serde_json::Value>,
    #[serde(default)]
    pub bool_value: Option<bool>,
    #[serde(default)]
    pub double_value: Option<f64>,
}

impl AttributeValue {
    fn as_string(&self) -> Option<String> {
        if let Some(s) = &self.string_value {
            return Some(s.clone());
        }
        if let Some(i) = &self.int_value {
            return match i {
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
        }
        if let Some(b) = self.bool_value {
            return Some(b.to_string());
        }
        self.double_value.map(|d| d.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpan {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_time_unix_nano: Option<serde_json::Value>,
    #[serde(default)]
    pub end_time_unix_nano: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: Vec<KeyValuePair>,
    #[serde(default)]
    pub status: Option<SpanStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpanStatus {
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl SpanStatus {
    /// `STATUS_CODE_ERROR` (or numeric 2) means failure; everything else is
    /// success.
    pub fn is_error(&self) -> bool {
        match &self.code {
            Some(serde_json::Value::String(s)) => s == "STATUS_CODE_ERROR",
            Some(serde_json::Value::Number(n)) => n.as_i64() == Some(2),
            _ => false,
        }
    }
}

/// Unix-nano timestamps arrive as strings or numbers; either way they come
/// back as float epoch seconds.
pub fn parse_unix_nano(value: &Option<serde_json::Value>) -> f64 {
    let nanos = match value {
        Some(serde_json::Value::String(s)) => s.parse::<u64>().unwrap_or(0),
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    };
    nanos as f64 / 1_000_000_000.0
}

/// Ids come back hex (as this pipeline emits them) or base64 (proto3-JSON);
/// either is normalized to lowercase hex.
pub fn decode_id(raw: &str) -> Option<String> {
    if !raw.is_empty() && raw.len() % 2 == 0 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(raw.to_lowercase());
    }
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .filter(|bytes| !bytes.is_empty())
        .map(hex::encode)
}

fn attribute_map(attributes: &[KeyValuePair]) -> HashMap<&str, String> {
    attributes
        .iter()
        .filter_map(|kv| kv.value.as_ref().and_then(|v| v.as_string()).map(|v| (kv.key.as_str(), v)))
        .collect()
}

/// Extract `service.name` from the batch resource, defaulting to "unknown".
pub fn service_name(batch: &Batch) -> String {
    batch
        .resource
        .as_ref()
        .and_then(|r| {
            r.attributes
                .iter()
                .find(|kv| kv.key == "service.name")
                .and_then(|kv| kv.value.as_ref())
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Convert one backend span into a domain span, with the `mcp.*` attributes
/// taking precedence over the raw proto fields for identity.
pub fn convert_span(span: &BackendSpan, agent_name: &str, trace_id: &str) -> TraceSpan {
    let attributes = attribute_map(&span.attributes);

    let span_trace_id = attributes
        .get("mcp.trace.id")
        .cloned()
        .or_else(|| span.trace_id.as_deref().and_then(decode_id))
        .unwrap_or_else(|| trace_id.to_string());
    let span_id = attributes
        .get("mcp.span.id")
        .cloned()
        .or_else(|| span.span_id.as_deref().and_then(decode_id))
        .unwrap_or_default();
    let parent_span = attributes
        .get("mcp.parent.span")
        .cloned()
        .or_else(|| span.parent_span_id.as_deref().and_then(decode_id))
        .filter(|p| !p.is_empty());

    let start_time = parse_unix_nano(&span.start_time_unix_nano);
    let end_time = parse_unix_nano(&span.end_time_unix_nano);
    let success = !span.status.as_ref().map(SpanStatus::is_error).unwrap_or(false);

    let duration_ms = attributes
        .get("mcp.duration.ms")
        .and_then(|raw| raw.parse::<i64>().ok())
        .or_else(|| {
            (end_time > start_time).then(|| ((end_time - start_time) * 1000.0).round() as i64)
        });

    TraceSpan {
        trace_id: span_trace_id,
        span_id,
        parent_span,
        agent_name: agent_name.to_string(),
        agent_id: attributes.get("mcp.agent.id").cloned().unwrap_or_default(),
        ip_address: attributes.get("mcp.ip.address").cloned(),
        operation: attributes
            .get("mcp.operation")
            .cloned()
            .unwrap_or_else(|| span.name.clone()),
        runtime: attributes
            .get("mcp.runtime")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
        capability: attributes.get("mcp.capability").cloned(),
        target_agent: attributes.get("mcp.target.agent").cloned(),
        start_time,
        end_time: Some(end_time.max(start_time)),
        duration_ms,
        success: Some(success),
        error_message: None,
    }
}

/// Convert the whole response document into a `CompletedTrace`, recomputing
/// the aggregates from the converted spans.
pub fn convert_document(trace_id: &str, document: &TraceDocument) -> Option<CompletedTrace> {
    let mut spans = Vec::new();
    for batch in &document.batches {
        let agent = service_name(batch);
        for scope in &batch.scope_spans {
            for span in &scope.spans {
                spans.push(convert_span(span, &agent, trace_id));
            }
        }
    }
    CompletedTrace::from_spans(trace_id, spans)
}
