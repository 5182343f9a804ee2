//! OTLP emission with exact upstream-id preservation.
//!
//! Two transports: gRPC (default) constructs OTLP protobuf payloads directly
//! so trace/span identifiers reach the backend byte-for-byte; HTTP goes
//! through the SDK batcher with span-builder id overrides. Stream-through
//! mode tracks open span contexts so children arriving later attach to the
//! correct parent; correlation mode renders a whole `CompletedTrace` in
//! start-time order.

mod buffer;
mod direct;
mod ids;
mod record;
mod sdk;

pub use ids::{normalize_span_id, normalize_trace_id};
pub use record::{AttrValue, SpanRecord};

use crate::error::ExportError;
use anyhow::Result;
use async_trait::async_trait;
use buffer::SpanBuffer;
use direct::DirectGrpcEmitter;
use meshtrace_types::{CompletedTrace, SpanExporter, TraceEvent, TraceExporter, TraceSpan};
use record::{event_attributes, span_attributes, status_message, to_unix_nano};
use sdk::SdkEmitter;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// OTLP transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl FromStr for OtlpProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "grpc" => Ok(Self::Grpc),
            "http" | "http/protobuf" => Ok(Self::Http),
            other => Err(format!("unsupported telemetry protocol: {other}")),
        }
    }
}

/// Configuration for the OTLP emitter.
#[derive(Debug, Clone)]
pub struct OtlpConfig {
    pub endpoint: String,
    pub protocol: OtlpProtocol,
    pub service_version: String,
    pub environment: String,
    /// Enable the per-trace reorder buffer.
    pub buffered: bool,
    /// Spans per trace that trigger an early flush.
    pub buffer_max_spans: usize,
    /// Age at which a buffered trace is flushed regardless of size.
    pub buffer_max_age: Duration,
    /// Ticker cadence of the flush loop.
    pub buffer_flush_interval: Duration,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            protocol: OtlpProtocol::Grpc,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("DEPLOYMENT_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            buffered: false,
            buffer_max_spans: 3,
            buffer_max_age: Duration::from_secs(1),
            buffer_flush_interval: Duration::from_millis(500),
        }
    }
}

/// Open span context retained between a span's start and end events.
#[derive(Debug, Clone)]
struct ActiveSpan {
    trace_id: [u8; 16],
    span_id: [u8; 8],
    parent_span_id: Option<[u8; 8]>,
    start_time: f64,
}

/// Emits spans to an OTLP backend, preserving upstream ids end-to-end.
pub struct OtlpExporter {
    config: OtlpConfig,
    active: parking_lot::Mutex<HashMap<String, ActiveSpan>>,
    direct: Option<DirectGrpcEmitter>,
    sdk: Option<SdkEmitter>,
    buffer: Option<SpanBuffer>,
    flush_handle: AsyncMutex<Option<JoinHandle<()>>>,
    flush_shutdown: AsyncMutex<Option<mpsc::Sender<()>>>,
}

impl OtlpExporter {
    pub fn new(config: OtlpConfig) -> Self {
        let (direct, sdk) = match config.protocol {
            OtlpProtocol::Grpc => (
                Some(DirectGrpcEmitter::new(
                    config.endpoint.clone(),
                    config.service_version.clone(),
                    config.environment.clone(),
                )),
                None,
            ),
            OtlpProtocol::Http => (
                None,
                Some(SdkEmitter::new(
                    config.endpoint.clone(),
                    config.protocol,
                    config.service_version.clone(),
                    config.environment.clone(),
                )),
            ),
        };
        let buffer = config
            .buffered
            .then(|| SpanBuffer::new(config.buffer_max_spans, config.buffer_max_age));
        Self {
            config,
            active: parking_lot::Mutex::new(HashMap::new()),
            direct,
            sdk,
            buffer,
            flush_handle: AsyncMutex::new(None),
            flush_shutdown: AsyncMutex::new(None),
        }
    }

    /// Spawn the buffer flush ticker. A no-op unless buffering is enabled.
    pub async fn start(self: &Arc<Self>) {
        if self.buffer.is_none() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.flush_shutdown.lock().await = Some(shutdown_tx);

        let exporter = Arc::clone(self);
        let interval = self.config.buffer_flush_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
                let batches = match &exporter.buffer {
                    Some(buffer) => buffer.drain_expired(),
                    None => break,
                };
                for batch in batches {
                    if let Err(err) = exporter.export_batch(batch).await {
                        error!(error = %err, "buffered span flush failed");
                    }
                }
            }
            debug!("buffer flush loop stopped");
        });
        *self.flush_handle.lock().await = Some(handle);
    }

    /// Drain buffers and every provider under a bounded deadline.
    pub async fn close(&self) {
        if let Some(shutdown_tx) = self.flush_shutdown.lock().await.take() {
            let _ = shutdown_tx.try_send(());
        }
        if let Some(handle) = self.flush_handle.lock().await.take() {
            let _ = handle.await;
        }

        if let Some(buffer) = &self.buffer {
            for batch in buffer.drain_all() {
                if let Err(err) = self.export_batch(batch).await {
                    error!(error = %err, "final buffer flush failed");
                }
            }
        }

        if let Some(sdk) = &self.sdk {
            // Provider drains are bounded by the per-exporter send timeout.
            sdk.shutdown();
        }
        info!("otlp exporter closed");
    }

    pub fn active_span_count(&self) -> usize {
        self.active.lock().len()
    }

    async fn submit(&self, record: SpanRecord) -> Result<(), ExportError> {
        if let Some(buffer) = &self.buffer {
            if let Some(batch) = buffer.push(record) {
                self.export_batch(batch).await?;
            }
            return Ok(());
        }
        self.export_batch(vec![record]).await
    }

    async fn export_batch(&self, batch: Vec<SpanRecord>) -> Result<(), ExportError> {
        if let Some(direct) = &self.direct {
            return direct.export(&batch).await;
        }
        if let Some(sdk) = &self.sdk {
            for record in &batch {
                sdk.emit(record)?;
            }
        }
        Ok(())
    }

    /// Assemble the record for a span-end event, consulting the open context
    /// established at span start. A missing context means a late or lost
    /// start: the span becomes a root of the preserved trace.
    fn end_event_record(&self, event: &TraceEvent) -> Result<SpanRecord, ExportError> {
        let open = self.active.lock().remove(&event.span_id);
        let duration_secs = event.duration_ms.map(|d| d as f64 / 1000.0);

        let (trace_id, span_id, parent_span_id, start_time) = match open {
            Some(open) => (open.trace_id, open.span_id, open.parent_span_id, open.start_time),
            None => (
                normalize_trace_id(&event.trace_id)?,
                normalize_span_id(&event.span_id)?,
                event
                    .parent_span
                    .as_deref()
                    .map(normalize_span_id)
                    .transpose()?,
                event.timestamp - duration_secs.unwrap_or(0.0),
            ),
        };

        let end_time = match duration_secs {
            Some(d) => start_time + d,
            None => event.timestamp,
        };
        let success = event.success.unwrap_or(true);

        Ok(SpanRecord {
            agent_name: event.agent_name.clone(),
            trace_id,
            span_id,
            parent_span_id,
            operation: event.operation.clone(),
            start_time_unix_nano: to_unix_nano(start_time),
            end_time_unix_nano: to_unix_nano(end_time),
            attributes: event_attributes(event),
            success,
            status_message: status_message(success, event.error_message.as_deref()),
        })
    }

    /// Assemble the record for a self-contained execution-trace event.
    fn execution_record(&self, event: &TraceEvent) -> Result<SpanRecord, ExportError> {
        let duration_secs = event.duration_ms.unwrap_or(0) as f64 / 1000.0;
        let success = event.success.unwrap_or(true);
        Ok(SpanRecord {
            agent_name: event.agent_name.clone(),
            trace_id: normalize_trace_id(&event.trace_id)?,
            span_id: normalize_span_id(&event.span_id)?,
            parent_span_id: event
                .parent_span
                .as_deref()
                .map(normalize_span_id)
                .transpose()?,
            operation: event.operation.clone(),
            start_time_unix_nano: to_unix_nano(event.timestamp),
            end_time_unix_nano: to_unix_nano(event.timestamp + duration_secs),
            attributes: event_attributes(event),
            success,
            status_message: status_message(success, event.error_message.as_deref()),
        })
    }

    fn span_record(&self, span: &TraceSpan) -> Result<SpanRecord, ExportError> {
        let success = span.success.unwrap_or(true);
        Ok(SpanRecord {
            agent_name: span.agent_name.clone(),
            trace_id: normalize_trace_id(&span.trace_id)?,
            span_id: normalize_span_id(&span.span_id)?,
            parent_span_id: span
                .parent_span
                .as_deref()
                .map(normalize_span_id)
                .transpose()?,
            operation: span.operation.clone(),
            start_time_unix_nano: to_unix_nano(span.start_time),
            end_time_unix_nano: to_unix_nano(span.effective_end()),
            attributes: span_attributes(span),
            success,
            status_message: status_message(success, span.error_message.as_deref()),
        })
    }
}

#[async_trait]
impl SpanExporter for OtlpExporter {
    async fn establish_span_context(&self, event: &TraceEvent) -> Result<()> {
        let open = ActiveSpan {
            trace_id: normalize_trace_id(&event.trace_id)?,
            span_id: normalize_span_id(&event.span_id)?,
            parent_span_id: event
                .parent_span
                .as_deref()
                .map(normalize_span_id)
                .transpose()?,
            start_time: event.timestamp,
        };
        self.active.lock().insert(event.span_id.clone(), open);
        debug!(trace_id = %event.trace_id, span_id = %event.span_id, "span context established");
        Ok(())
    }

    async fn export_span(&self, event: &TraceEvent) -> Result<()> {
        let record = self.end_event_record(event)?;
        self.submit(record).await?;
        Ok(())
    }

    async fn export_complete_span(&self, event: &TraceEvent) -> Result<()> {
        let record = self.execution_record(event)?;
        self.submit(record).await?;
        Ok(())
    }
}

#[async_trait]
impl TraceExporter for OtlpExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    /// Correlation mode: spans go out in start-time order (the completed
    /// trace is already sorted), parent links re-created from span fields.
    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
        let mut records = Vec::with_capacity(trace.spans.len());
        for span in &trace.spans {
            records.push(self.span_record(span)?);
        }
        self.export_batch(records).await?;
        Ok(())
    }
}
