use anyhow::{Context, Result};
use async_trait::async_trait;
use meshtrace_types::{CompletedTrace, TraceExporter};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes one JSON file per completed trace under `output_dir`, creating the
/// directory on demand.
pub struct FileExporter {
    output_dir: PathBuf,
}

impl FileExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// `trace_{first-8-hex-of-id}_{unix-start-seconds}.json`
    pub fn file_name(trace: &CompletedTrace) -> String {
        let id: String = trace
            .trace_id
            .chars()
            .filter(|c| *c != '-')
            .take(8)
            .collect();
        format!("trace_{}_{}.json", id, trace.start_time as i64)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl TraceExporter for FileExporter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;

        let path = self.output_dir.join(Self::file_name(trace));
        let body = serde_json::to_vec_pretty(trace).context("failed to serialize trace")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        debug!(path = %path.display(), trace_id = %trace.trace_id, "trace written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtrace_types::TraceSpan;

    fn sample_trace(trace_id: &str, start: f64) -> CompletedTrace {
        let span = TraceSpan {
            trace_id: trace_id.to_string(),
            span_id: "aaaaaaaaaaaaaaaa".to_string(),
            parent_span: None,
            agent_name: "alpha".to_string(),
            agent_id: "alpha-1".to_string(),
            ip_address: None,
            operation: "op".to_string(),
            runtime: "python".to_string(),
            capability: None,
            target_agent: None,
            start_time: start,
            end_time: Some(start + 0.25),
            duration_ms: Some(250),
            success: Some(true),
            error_message: None,
        };
        CompletedTrace::from_spans(trace_id, vec![span]).unwrap()
    }

    #[test]
    fn file_name_uses_short_id_and_start_seconds() {
        let trace = sample_trace("1322f09d-baee-4241-a45d-a4ee78dc199f", 1700000123.75);
        assert_eq!(FileExporter::file_name(&trace), "trace_1322f09d_1700000123.json");
    }

    #[tokio::test]
    async fn export_creates_directory_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("traces/out");
        let exporter = FileExporter::new(nested.clone());
        let trace = sample_trace("1322f09dbaee4241a45da4ee78dc199f", 1000.0);

        exporter.export_trace(&trace).await.unwrap();

        let path = nested.join("trace_1322f09d_1000.json");
        let body = std::fs::read(path).unwrap();
        let parsed: CompletedTrace = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, trace);
    }
}
