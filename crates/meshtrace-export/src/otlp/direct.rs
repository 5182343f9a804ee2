//! Direct OTLP protobuf emission over gRPC.
//!
//! The SDK regenerates span identifiers, so exact-ID preservation bypasses
//! it: payloads are built by hand from [`SpanRecord`]s and sent through a
//! tonic `TraceServiceClient`, one request per event (or per buffer flush).

use crate::error::ExportError;
use crate::otlp::record::{AttrValue, SpanRecord};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, status, ResourceSpans, ScopeSpans, Span, Status};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::debug;

const SCOPE_VERSION: &str = "1.0.0";

pub struct DirectGrpcEmitter {
    endpoint: String,
    service_version: String,
    environment: String,
    client: Mutex<Option<TraceServiceClient<Channel>>>,
}

impl DirectGrpcEmitter {
    pub fn new(endpoint: String, service_version: String, environment: String) -> Self {
        Self {
            endpoint,
            service_version,
            environment,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<TraceServiceClient<Channel>, ExportError> {
        if let Some(client) = self.client.lock().await.clone() {
            return Ok(client);
        }
        let client = TraceServiceClient::connect(self.endpoint.clone())
            .await
            .map_err(|err| ExportError::Transport(err.to_string()))?;
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(client.clone());
        }
        Ok(guard.as_ref().cloned().unwrap_or(client))
    }

    /// Send one `ExportTraceServiceRequest` carrying the given spans, grouped
    /// into one `ResourceSpans` per agent so each agent keeps its own
    /// `service.name` downstream.
    pub async fn export(&self, records: &[SpanRecord]) -> Result<(), ExportError> {
        if records.is_empty() {
            return Ok(());
        }
        let request = ExportTraceServiceRequest {
            resource_spans: group_by_agent(records, &self.service_version, &self.environment),
        };
        let mut client = self.client().await?;
        match client.export(request).await {
            Ok(_) => {
                debug!(spans = records.len(), "exported spans over gRPC");
                Ok(())
            }
            Err(status) => {
                // Drop the channel so the next export reconnects.
                *self.client.lock().await = None;
                Err(ExportError::Transport(status.to_string()))
            }
        }
    }
}

/// Group spans per agent while preserving emission order within each agent.
pub(crate) fn group_by_agent(
    records: &[SpanRecord],
    service_version: &str,
    environment: &str,
) -> Vec<ResourceSpans> {
    let mut groups: Vec<(String, Vec<Span>)> = Vec::new();
    for record in records {
        let span = to_proto_span(record);
        match groups.iter_mut().find(|(agent, _)| agent == &record.agent_name) {
            Some((_, spans)) => spans.push(span),
            None => groups.push((record.agent_name.clone(), vec![span])),
        }
    }

    groups
        .into_iter()
        .map(|(agent, spans)| ResourceSpans {
            resource: Some(Resource {
                attributes: vec![
                    kv_str("service.name", &agent),
                    kv_str("service.version", service_version),
                    kv_str("deployment.environment", environment),
                    kv_str("telemetry.sdk.language", "rust"),
                    kv_str("telemetry.sdk.name", "mcp-mesh"),
                ],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: format!("mcp-mesh/{agent}"),
                    version: SCOPE_VERSION.to_string(),
                    ..Default::default()
                }),
                spans,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        })
        .collect()
}

pub(crate) fn to_proto_span(record: &SpanRecord) -> Span {
    let kind = if record.is_root() {
        span::SpanKind::Server
    } else {
        span::SpanKind::Internal
    };
    let code = if record.success {
        status::StatusCode::Ok
    } else {
        status::StatusCode::Error
    };
    Span {
        trace_id: record.trace_id.to_vec(),
        span_id: record.span_id.to_vec(),
        parent_span_id: record
            .parent_span_id
            .map(|p| p.to_vec())
            .unwrap_or_default(),
        name: record.operation.clone(),
        kind: kind as i32,
        start_time_unix_nano: record.start_time_unix_nano,
        end_time_unix_nano: record.end_time_unix_nano,
        attributes: record
            .attributes
            .iter()
            .map(|(key, value)| match value {
                AttrValue::Str(s) => kv_str(key, s),
                AttrValue::Int(i) => kv_int(key, *i),
            })
            .collect(),
        status: Some(Status {
            code: code as i32,
            message: record.status_message.clone().unwrap_or_default(),
        }),
        ..Default::default()
    }
}

fn kv_str(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn kv_int(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}
