use anyhow::Result;
use async_trait::async_trait;
use meshtrace_types::{EventProcessor, EventType, SpanExporter, TraceEvent};
use std::sync::Arc;
use tracing::debug;

/// Dispatches each incoming event straight to a span exporter, without
/// building an in-memory trace aggregate.
pub struct StreamThroughProcessor {
    exporter: Arc<dyn SpanExporter>,
}

impl StreamThroughProcessor {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }
}

#[async_trait]
impl EventProcessor for StreamThroughProcessor {
    async fn process(&self, event: TraceEvent) -> Result<()> {
        match event.event_type {
            EventType::SpanStart => self.exporter.establish_span_context(&event).await,
            EventType::SpanEnd => self.exporter.export_span(&event).await,
            EventType::Execution if event.is_execution_trace() => {
                self.exporter.export_complete_span(&event).await
            }
            _ => {
                debug!(
                    trace_id = %event.trace_id,
                    event_type = ?event.event_type,
                    "ignoring event without a stream-through mapping"
                );
                Ok(())
            }
        }
    }
}
