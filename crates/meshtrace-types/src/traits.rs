//! Capability traits wiring the pipeline together.
//!
//! These are capability sets, not an inheritance tree: exporters implement
//! only the surfaces they support, and the multi-exporter composes them
//! without knowing their concrete type.

use crate::event::TraceEvent;
use crate::span::CompletedTrace;
use anyhow::Result;
use async_trait::async_trait;

/// Single-event handoff from the stream consumer.
///
/// Implementations decide redelivery semantics through their return value:
/// the consumer acknowledges the message whether or not `process` succeeds,
/// so implementations that buffer state must treat an accepted event as
/// consumed.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: TraceEvent) -> Result<()>;
}

/// Sink for completed traces produced by the correlator.
#[async_trait]
pub trait TraceExporter: Send + Sync {
    /// Short identifier used in logs and joined error messages.
    fn name(&self) -> &'static str;

    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()>;
}

/// Sink for individual span events in stream-through mode.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Register an open span context so later children can attach to it.
    async fn establish_span_context(&self, event: &TraceEvent) -> Result<()>;

    /// Close the open context for this span and emit it downstream.
    async fn export_span(&self, event: &TraceEvent) -> Result<()>;

    /// Emit a self-contained execution-trace event as a fully closed span.
    async fn export_complete_span(&self, event: &TraceEvent) -> Result<()>;
}
