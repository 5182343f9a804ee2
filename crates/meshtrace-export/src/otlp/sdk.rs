//! SDK-managed OTLP emission with one tracer provider per agent.
//!
//! Each distinct `agent_name` gets its own provider so every agent appears
//! as its own service downstream; all providers share the configured
//! transport. Upstream identifiers survive the SDK through span-builder id
//! overrides plus a remote parent span context.

use crate::error::ExportError;
use crate::otlp::record::{AttrValue, SpanRecord};
use crate::otlp::OtlpProtocol;
use opentelemetry::trace::{
    Span as _, SpanBuilder, SpanContext, SpanId, SpanKind, Status, TraceContextExt as _,
    TraceFlags, TraceId, TraceState, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SdkEmitter {
    endpoint: String,
    protocol: OtlpProtocol,
    service_version: String,
    environment: String,
    providers: Mutex<HashMap<String, sdktrace::TracerProvider>>,
}

impl SdkEmitter {
    pub fn new(
        endpoint: String,
        protocol: OtlpProtocol,
        service_version: String,
        environment: String,
    ) -> Self {
        Self {
            endpoint,
            protocol,
            service_version,
            environment,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily build the per-agent provider; all providers share the
    /// configured transport.
    fn provider_for(&self, agent: &str) -> Result<sdktrace::TracerProvider, ExportError> {
        if let Some(provider) = self.providers.lock().get(agent) {
            return Ok(provider.clone());
        }

        let resource = Resource::new(vec![
            KeyValue::new(SERVICE_NAME, agent.to_string()),
            KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
            KeyValue::new("deployment.environment", self.environment.clone()),
            KeyValue::new("telemetry.sdk.language", "rust"),
            KeyValue::new("telemetry.sdk.name", "mcp-mesh"),
        ]);
        let trace_config = sdktrace::Config::default().with_resource(resource);

        let provider = match self.protocol {
            OtlpProtocol::Grpc => opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(self.endpoint.clone())
                        .with_timeout(EXPORT_TIMEOUT),
                )
                .with_trace_config(trace_config)
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|err| ExportError::Transport(err.to_string()))?,
            OtlpProtocol::Http => opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .http()
                        .with_endpoint(self.endpoint.clone())
                        .with_timeout(EXPORT_TIMEOUT),
                )
                .with_trace_config(trace_config)
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|err| ExportError::Transport(err.to_string()))?,
        };

        info!(agent, "created tracer provider");
        let mut providers = self.providers.lock();
        Ok(providers
            .entry(agent.to_string())
            .or_insert(provider)
            .clone())
    }

    /// Emit one span with exact upstream ids and flush its provider.
    pub fn emit(&self, record: &SpanRecord) -> Result<(), ExportError> {
        let provider = self.provider_for(&record.agent_name)?;
        let tracer = provider.tracer(format!("mcp-mesh/{}", record.agent_name));

        let trace_id = TraceId::from_bytes(record.trace_id);
        let parent_span_id = record
            .parent_span_id
            .map(SpanId::from_bytes)
            .unwrap_or(SpanId::INVALID);
        // An invalid parent span id leaves the context parentless; the
        // builder's trace id override then pins the preserved trace id.
        let parent_cx = Context::new().with_remote_span_context(SpanContext::new(
            trace_id,
            parent_span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ));

        let status = if record.success {
            Status::Ok
        } else {
            Status::error(
                record
                    .status_message
                    .clone()
                    .unwrap_or_else(|| "Operation failed".to_string()),
            )
        };

        let kind = if record.is_root() {
            SpanKind::Server
        } else {
            SpanKind::Internal
        };

        let builder = SpanBuilder::from_name(record.operation.clone())
            .with_kind(kind)
            .with_trace_id(trace_id)
            .with_span_id(SpanId::from_bytes(record.span_id))
            .with_start_time(to_system_time(record.start_time_unix_nano))
            .with_attributes(record.attributes.iter().map(|(key, value)| match value {
                AttrValue::Str(s) => KeyValue::new(*key, s.clone()),
                AttrValue::Int(i) => KeyValue::new(*key, *i),
            }))
            .with_status(status);

        let mut span = tracer.build_with_context(builder, &parent_cx);
        span.end_with_timestamp(to_system_time(record.end_time_unix_nano));

        for result in provider.force_flush() {
            if let Err(err) = result {
                return Err(ExportError::Transport(err.to_string()));
            }
        }
        Ok(())
    }

    /// Drain every provider. Called under the exporter's close deadline.
    pub fn shutdown(&self) {
        let providers: Vec<(String, sdktrace::TracerProvider)> =
            self.providers.lock().drain().collect();
        for (agent, provider) in providers {
            for result in provider.force_flush() {
                if let Err(err) = result {
                    warn!(agent = %agent, error = %err, "flush failed during shutdown");
                }
            }
            if let Err(err) = provider.shutdown() {
                warn!(agent = %agent, error = %err, "provider shutdown failed");
            }
        }
    }
}

fn to_system_time(unix_nano: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(unix_nano)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_conversion_round_trips() {
        let t = to_system_time(1_000_250_000_000);
        assert_eq!(
            t.duration_since(UNIX_EPOCH).unwrap(),
            Duration::new(1000, 250_000_000)
        );
    }
}
