use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshtrace_types::{CompletedTrace, TraceExporter};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

/// Traces between periodic summary lines.
const SUMMARY_EVERY: u64 = 10;

#[derive(Debug, Default)]
struct StatsInner {
    total_traces: u64,
    success_traces: u64,
    failed_traces: u64,
    total_spans: u64,
    total_duration_ms: i64,
    agents: BTreeSet<String>,
    first_trace_time: Option<DateTime<Utc>>,
    last_trace_time: Option<DateTime<Utc>>,
}

/// Point-in-time view of accumulated statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_traces: u64,
    pub success_traces: u64,
    pub failed_traces: u64,
    pub total_spans: u64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub agents: Vec<String>,
    pub first_trace_time: Option<DateTime<Utc>>,
    pub last_trace_time: Option<DateTime<Utc>>,
}

/// Passive exporter accumulating pipeline counters; nothing loops back into
/// the manager at runtime.
#[derive(Default)]
pub struct StatsExporter {
    inner: RwLock<StatsInner>,
}

impl StatsExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        let avg_duration_ms = if inner.total_traces > 0 {
            inner.total_duration_ms as f64 / inner.total_traces as f64
        } else {
            0.0
        };
        StatsSnapshot {
            total_traces: inner.total_traces,
            success_traces: inner.success_traces,
            failed_traces: inner.failed_traces,
            total_spans: inner.total_spans,
            total_duration_ms: inner.total_duration_ms,
            avg_duration_ms,
            agents: inner.agents.iter().cloned().collect(),
            first_trace_time: inner.first_trace_time,
            last_trace_time: inner.last_trace_time,
        }
    }
}

#[async_trait]
impl TraceExporter for StatsExporter {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
        let summary = {
            let mut inner = self.inner.write();
            inner.total_traces += 1;
            if trace.success {
                inner.success_traces += 1;
            } else {
                inner.failed_traces += 1;
            }
            inner.total_spans += trace.span_count as u64;
            inner.total_duration_ms += trace.duration_ms();

            let now = Utc::now();
            inner.first_trace_time.get_or_insert(now);
            inner.last_trace_time = Some(now);
            for agent in &trace.agents {
                inner.agents.insert(agent.clone());
            }

            if inner.total_traces % SUMMARY_EVERY == 0 {
                Some((
                    inner.total_traces,
                    inner.failed_traces,
                    inner.total_spans,
                    inner.total_duration_ms as f64 / inner.total_traces as f64,
                    inner.agents.len(),
                ))
            } else {
                None
            }
        };

        if let Some((traces, failed, spans, avg_ms, agents)) = summary {
            info!(
                traces,
                failed,
                spans,
                avg_duration_ms = format!("{avg_ms:.1}"),
                agents,
                "trace statistics"
            );
        }
        Ok(())
    }
}
