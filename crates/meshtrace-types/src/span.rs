use crate::event::TraceEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A correlator-reconstructed span. Complete once `end_time` is stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<String>,
    pub agent_name: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub operation: String,
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TraceSpan {
    /// Seed a span from its start-side event.
    pub fn from_start_event(event: &TraceEvent) -> Self {
        Self {
            trace_id: event.trace_id.clone(),
            span_id: event.span_id.clone(),
            parent_span: event.parent_span.clone(),
            agent_name: event.agent_name.clone(),
            agent_id: event.agent_id.clone(),
            ip_address: event.ip_address.clone(),
            operation: event.operation.clone(),
            runtime: event.runtime.clone(),
            capability: event.capability.clone(),
            target_agent: event.target_agent.clone(),
            start_time: event.timestamp,
            end_time: None,
            duration_ms: None,
            success: None,
            error_message: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    /// End time when known, otherwise the start time.
    pub fn effective_end(&self) -> f64 {
        self.end_time.unwrap_or(self.start_time)
    }

    /// Span duration in milliseconds, preferring the reported value over the
    /// timestamp difference.
    pub fn effective_duration_ms(&self) -> i64 {
        match self.duration_ms {
            Some(d) => d,
            None => ((self.effective_end() - self.start_time) * 1000.0).round() as i64,
        }
    }
}

/// A closed trace: ordered spans plus aggregates derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTrace {
    pub trace_id: String,
    pub spans: Vec<TraceSpan>,
    pub start_time: f64,
    pub end_time: f64,
    /// `end_time - start_time`, float seconds.
    pub duration: f64,
    pub success: bool,
    pub span_count: usize,
    pub agents: Vec<String>,
    pub agent_count: usize,
}

impl CompletedTrace {
    /// Derive a completed trace from its spans. A trace with zero spans never
    /// produces one.
    pub fn from_spans(trace_id: impl Into<String>, mut spans: Vec<TraceSpan>) -> Option<Self> {
        if spans.is_empty() {
            return None;
        }
        spans.sort_by(|a, b| {
            a.start_time
                .partial_cmp(&b.start_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let start_time = spans
            .iter()
            .map(|s| s.start_time)
            .fold(f64::INFINITY, f64::min);
        let end_time = spans
            .iter()
            .map(|s| s.effective_end())
            .fold(f64::NEG_INFINITY, f64::max);
        let success = spans.iter().all(|s| s.success.unwrap_or(true));
        let agents: Vec<String> = spans
            .iter()
            .map(|s| s.agent_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Some(Self {
            trace_id: trace_id.into(),
            start_time,
            end_time,
            duration: end_time - start_time,
            success,
            span_count: spans.len(),
            agent_count: agents.len(),
            agents,
            spans,
        })
    }

    pub fn duration_ms(&self) -> i64 {
        (self.duration * 1000.0).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, agent: &str, start: f64, end: Option<f64>, success: Option<bool>) -> TraceSpan {
        TraceSpan {
            trace_id: "1322f09dbaee4241a45da4ee78dc199f".to_string(),
            span_id: id.to_string(),
            parent_span: None,
            agent_name: agent.to_string(),
            agent_id: format!("{agent}-1"),
            ip_address: None,
            operation: "op".to_string(),
            runtime: "python".to_string(),
            capability: None,
            target_agent: None,
            start_time: start,
            end_time: end,
            duration_ms: None,
            success,
            error_message: None,
        }
    }

    #[test]
    fn empty_span_list_produces_nothing() {
        assert!(CompletedTrace::from_spans("t", vec![]).is_none());
    }

    #[test]
    fn aggregates_are_derived_from_spans() {
        let trace = CompletedTrace::from_spans(
            "t",
            vec![
                span("b", "beta", 2.0, Some(5.0), Some(true)),
                span("a", "alpha", 1.0, Some(3.0), None),
                span("c", "alpha", 4.0, None, Some(true)),
            ],
        )
        .unwrap();

        assert_eq!(trace.start_time, 1.0);
        assert_eq!(trace.end_time, 5.0);
        assert_eq!(trace.duration, 4.0);
        assert!(trace.success);
        assert_eq!(trace.span_count, 3);
        assert_eq!(trace.agents, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(trace.agent_count, 2);
        // Spans come back ordered by start time.
        let ids: Vec<&str> = trace.spans.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn any_failed_span_fails_the_trace() {
        let trace = CompletedTrace::from_spans(
            "t",
            vec![
                span("a", "alpha", 1.0, Some(2.0), Some(true)),
                span("b", "alpha", 1.5, Some(2.5), Some(false)),
            ],
        )
        .unwrap();
        assert!(!trace.success);
    }

    #[test]
    fn span_bounds_sit_inside_trace_bounds() {
        let trace = CompletedTrace::from_spans(
            "t",
            vec![
                span("a", "alpha", 10.0, Some(12.0), None),
                span("b", "beta", 11.0, None, None),
            ],
        )
        .unwrap();
        for s in &trace.spans {
            assert!(trace.start_time <= s.start_time);
            assert!(s.start_time <= s.effective_end());
            assert!(s.effective_end() <= trace.end_time);
        }
        assert_eq!(trace.duration, trace.end_time - trace.start_time);
    }

    #[test]
    fn effective_duration_prefers_reported_value() {
        let mut s = span("a", "alpha", 1.0, Some(2.0), None);
        assert_eq!(s.effective_duration_ms(), 1000);
        s.duration_ms = Some(250);
        assert_eq!(s.effective_duration_ms(), 250);
    }
}
