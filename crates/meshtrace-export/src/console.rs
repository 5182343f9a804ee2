use anyhow::Result;
use async_trait::async_trait;
use meshtrace_types::{CompletedTrace, TraceExporter, TraceSpan};
use std::fmt::Write as _;

/// Prints completed traces to stdout, either as human-readable lines grouped
/// by agent or as one JSON blob per trace.
pub struct ConsoleExporter {
    pretty: bool,
}

impl ConsoleExporter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    /// Human-readable rendering: header line, then spans grouped by agent.
    pub fn format_pretty(trace: &CompletedTrace) -> String {
        let mut out = String::new();
        let short_id: String = trace.trace_id.chars().take(8).collect();
        let verdict = if trace.success { "OK" } else { "FAIL" };
        let _ = writeln!(
            out,
            "trace {} | {} spans | {} agents | {}ms | {}",
            short_id,
            trace.span_count,
            trace.agent_count,
            trace.duration_ms(),
            verdict
        );
        for agent in &trace.agents {
            let _ = writeln!(out, "  {agent}:");
            for span in trace.spans.iter().filter(|s| &s.agent_name == agent) {
                let _ = writeln!(out, "    {}", Self::format_span(span));
            }
        }
        out
    }

    fn format_span(span: &TraceSpan) -> String {
        let verdict = if span.success.unwrap_or(true) { "OK" } else { "FAIL" };
        let mut line = format!(
            "[{verdict}] {} ({}ms)",
            span.operation,
            span.effective_duration_ms()
        );
        if let Some(capability) = &span.capability {
            let _ = write!(line, " capability={capability}");
        }
        if let Some(error) = &span.error_message {
            let _ = write!(line, " error={error}");
        }
        line
    }
}

#[async_trait]
impl TraceExporter for ConsoleExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
        if self.pretty {
            print!("{}", Self::format_pretty(trace));
        } else {
            println!("{}", serde_json::to_string(trace)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> CompletedTrace {
        let ok = TraceSpan {
            trace_id: "1322f09dbaee4241a45da4ee78dc199f".to_string(),
            span_id: "aaaaaaaaaaaaaaaa".to_string(),
            parent_span: None,
            agent_name: "alpha".to_string(),
            agent_id: "alpha-1".to_string(),
            ip_address: None,
            operation: "get_forecast".to_string(),
            runtime: "python".to_string(),
            capability: Some("forecast".to_string()),
            target_agent: None,
            start_time: 1000.0,
            end_time: Some(1000.25),
            duration_ms: Some(250),
            success: Some(true),
            error_message: None,
        };
        let failed = TraceSpan {
            span_id: "bbbbbbbbbbbbbbbb".to_string(),
            agent_name: "beta".to_string(),
            agent_id: "beta-1".to_string(),
            operation: "fetch_upstream".to_string(),
            capability: None,
            start_time: 1000.05,
            end_time: Some(1000.15),
            duration_ms: Some(100),
            success: Some(false),
            error_message: Some("connection refused".to_string()),
            ..ok.clone()
        };
        CompletedTrace::from_spans("1322f09dbaee4241a45da4ee78dc199f", vec![ok, failed]).unwrap()
    }

    #[test]
    fn pretty_output_groups_by_agent() {
        let rendered = ConsoleExporter::format_pretty(&sample_trace());
        assert!(rendered.starts_with("trace 1322f09d | 2 spans | 2 agents | 250ms | FAIL"));
        let alpha_at = rendered.find("alpha:").unwrap();
        let beta_at = rendered.find("beta:").unwrap();
        assert!(alpha_at < beta_at);
        assert!(rendered.contains("[OK] get_forecast (250ms) capability=forecast"));
        assert!(rendered.contains("[FAIL] fetch_upstream (100ms) error=connection refused"));
    }

    #[tokio::test]
    async fn json_mode_emits_serializable_blob() {
        let trace = sample_trace();
        let blob = serde_json::to_string(&trace).unwrap();
        let parsed: CompletedTrace = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed, trace);

        let exporter = ConsoleExporter::new(false);
        exporter.export_trace(&trace).await.unwrap();
    }
}
