use anyhow::{anyhow, Result};
use async_trait::async_trait;
use meshtrace_types::{CompletedTrace, TraceExporter};
use std::sync::Arc;
use tracing::error;

/// Fans a completed trace out to several exporters. Every exporter is given
/// the trace even when earlier ones fail; failures are joined into a single
/// error afterwards.
pub struct MultiExporter {
    exporters: Vec<Arc<dyn TraceExporter>>,
}

impl MultiExporter {
    pub fn new(exporters: Vec<Arc<dyn TraceExporter>>) -> Self {
        Self { exporters }
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

#[async_trait]
impl TraceExporter for MultiExporter {
    fn name(&self) -> &'static str {
        "multi"
    }

    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
        let mut failures = Vec::new();
        for exporter in &self.exporters {
            if let Err(err) = exporter.export_trace(trace).await {
                error!(
                    exporter = exporter.name(),
                    trace_id = %trace.trace_id,
                    error = %err,
                    "exporter failed"
                );
                failures.push(format!("{}: {err}", exporter.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} exporter(s) failed: {}", failures.len(), failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtrace_types::TraceSpan;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TraceExporter for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn export_trace(&self, _trace: &CompletedTrace) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("sink down")
            }
            Ok(())
        }
    }

    fn sample() -> CompletedTrace {
        let span = TraceSpan {
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            parent_span: None,
            agent_name: "alpha".to_string(),
            agent_id: "alpha-1".to_string(),
            ip_address: None,
            operation: "op".to_string(),
            runtime: "python".to_string(),
            capability: None,
            target_agent: None,
            start_time: 0.0,
            end_time: Some(1.0),
            duration_ms: None,
            success: Some(true),
            error_message: None,
        };
        CompletedTrace::from_spans("t", vec![span]).unwrap()
    }

    #[tokio::test]
    async fn all_exporters_run_even_when_one_fails() {
        let first = Arc::new(Counting { calls: AtomicUsize::new(0), fail: true });
        let second = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let multi = MultiExporter::new(vec![first.clone(), second.clone()]);

        let result = multi.export_trace(&sample()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("1 exporter(s) failed"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_healthy_exporters_yield_ok() {
        let first = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let second = Arc::new(Counting { calls: AtomicUsize::new(0), fail: false });
        let multi = MultiExporter::new(vec![first, second]);
        assert!(multi.export_trace(&sample()).await.is_ok());
    }
}
