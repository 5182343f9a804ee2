use meshtrace_types::{TraceEvent, TraceSpan};

/// Span attribute value; the mcp.* set is strings plus one integer.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
}

/// Transport-independent description of one OTLP span carrying exact
/// upstream id bytes. Both the direct protobuf path and the SDK path render
/// from this.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub agent_name: String,
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    pub operation: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Vec<(&'static str, AttrValue)>,
    pub success: bool,
    /// Populated only when `success` is false.
    pub status_message: Option<String>,
}

impl SpanRecord {
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

pub fn to_unix_nano(epoch_secs: f64) -> u64 {
    if epoch_secs <= 0.0 {
        0
    } else {
        (epoch_secs * 1_000_000_000.0).round() as u64
    }
}

/// `error_message` when present, the canonical fallback otherwise.
pub fn status_message(success: bool, error_message: Option<&str>) -> Option<String> {
    if success {
        None
    } else {
        Some(error_message.unwrap_or("Operation failed").to_string())
    }
}

/// The mcp.* attribute set for a stream-through event. `service.name` is a
/// resource attribute and never duplicated at span level.
pub fn event_attributes(event: &TraceEvent) -> Vec<(&'static str, AttrValue)> {
    let mut attributes = vec![
        ("mcp.agent.id", AttrValue::Str(event.agent_id.clone())),
        ("mcp.operation", AttrValue::Str(event.operation.clone())),
        ("mcp.runtime", AttrValue::Str(event.runtime.clone())),
        ("mcp.trace.id", AttrValue::Str(event.trace_id.clone())),
        ("mcp.span.id", AttrValue::Str(event.span_id.clone())),
        (
            "mcp.event.type",
            AttrValue::Str(event.event_type.as_wire().to_string()),
        ),
    ];
    if let Some(ip) = event.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        attributes.push(("mcp.ip.address", AttrValue::Str(ip.to_string())));
    }
    if let Some(capability) = &event.capability {
        attributes.push(("mcp.capability", AttrValue::Str(capability.clone())));
    }
    if let Some(target) = &event.target_agent {
        attributes.push(("mcp.target.agent", AttrValue::Str(target.clone())));
    }
    if let Some(parent) = &event.parent_span {
        attributes.push(("mcp.parent.span", AttrValue::Str(parent.clone())));
    }
    if let Some(duration) = event.duration_ms {
        attributes.push(("mcp.duration.ms", AttrValue::Int(duration)));
    }
    attributes
}

/// The mcp.* attribute set for a correlated span.
pub fn span_attributes(span: &TraceSpan) -> Vec<(&'static str, AttrValue)> {
    let mut attributes = vec![
        ("mcp.agent.id", AttrValue::Str(span.agent_id.clone())),
        ("mcp.operation", AttrValue::Str(span.operation.clone())),
        ("mcp.runtime", AttrValue::Str(span.runtime.clone())),
        ("mcp.trace.id", AttrValue::Str(span.trace_id.clone())),
        ("mcp.span.id", AttrValue::Str(span.span_id.clone())),
    ];
    if let Some(ip) = span.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        attributes.push(("mcp.ip.address", AttrValue::Str(ip.to_string())));
    }
    if let Some(capability) = &span.capability {
        attributes.push(("mcp.capability", AttrValue::Str(capability.clone())));
    }
    if let Some(target) = &span.target_agent {
        attributes.push(("mcp.target.agent", AttrValue::Str(target.clone())));
    }
    if let Some(parent) = &span.parent_span {
        attributes.push(("mcp.parent.span", AttrValue::Str(parent.clone())));
    }
    if let Some(duration) = span.duration_ms {
        attributes.push(("mcp.duration.ms", AttrValue::Int(duration)));
    }
    attributes
}
