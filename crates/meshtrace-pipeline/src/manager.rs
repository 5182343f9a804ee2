use crate::config::{ConfigError, ExporterKind, PipelineConfig};
use anyhow::{Context as _, Result};
use meshtrace_consumer::{ConsumerInfo, StreamConsumer};
use meshtrace_correlate::{CorrelatorConfig, CorrelatorStats, SearchCriteria, TraceCorrelator};
use meshtrace_export::{
    ConsoleExporter, FileExporter, MultiExporter, OtlpConfig, OtlpExporter, StatsExporter,
    StatsSnapshot, StreamThroughProcessor,
};
use meshtrace_readback::ReadbackClient;
use meshtrace_types::{CompletedTrace, TraceExporter};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Snapshot for `/healthz`-style introspection.
#[derive(Debug, Serialize)]
pub struct ManagerInfo {
    pub enabled: bool,
    pub running: bool,
    pub exporter_type: ExporterKind,
    pub stream_through: bool,
    pub consumer: Option<ConsumerInfo>,
    pub correlator: Option<CorrelatorStats>,
    pub stats: Option<StatsSnapshot>,
}

/// Owns the pipeline: picks exporters, chooses the processor, runs the
/// consumer, and proxies the read-back surface.
pub struct TraceManager {
    config: PipelineConfig,
    consumer: Option<StreamConsumer>,
    correlator: Option<Arc<TraceCorrelator>>,
    otlp: Option<Arc<OtlpExporter>>,
    stats: Option<Arc<StatsExporter>>,
    readback: Option<ReadbackClient>,
    running: bool,
}

impl TraceManager {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            consumer: None,
            correlator: None,
            otlp: None,
            stats: None,
            readback: None,
            running: false,
        }
    }

    pub fn from_env() -> Self {
        Self::new(PipelineConfig::from_env())
    }

    /// Assemble and start the pipeline. A disabled pipeline starts nothing
    /// and succeeds; a missing telemetry endpoint for an OTLP exporter is
    /// fatal.
    pub async fn start(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("trace pipeline disabled");
            return Ok(());
        }
        if self.running {
            anyhow::bail!("trace manager is already running");
        }

        info!(
            exporter = %self.config.exporter_type,
            stream_through = self.config.exporter_type.is_stream_through(),
            "starting trace pipeline"
        );

        let processor: Arc<dyn meshtrace_types::EventProcessor> =
            if self.config.exporter_type.is_stream_through() {
                let endpoint = self
                    .config
                    .telemetry_endpoint
                    .clone()
                    .ok_or(ConfigError::MissingEndpoint(self.config.exporter_type))?;
                let otlp = Arc::new(OtlpExporter::new(OtlpConfig {
                    endpoint,
                    protocol: self.config.telemetry_protocol,
                    ..OtlpConfig::default()
                }));
                otlp.start().await;
                self.readback = self.config.resolve_backend_read_url().map(ReadbackClient::new);
                self.otlp = Some(Arc::clone(&otlp));
                Arc::new(StreamThroughProcessor::new(otlp))
            } else {
                let exporter = self.build_correlation_exporter()?;
                let correlator = Arc::new(TraceCorrelator::new(
                    CorrelatorConfig {
                        grace_window: self.config.grace_window,
                        trace_timeout: self.config.trace_timeout,
                        max_stored_traces: self.config.max_stored_traces,
                        ..CorrelatorConfig::default()
                    },
                    exporter,
                ));
                correlator.start().await;
                self.correlator = Some(Arc::clone(&correlator));
                correlator
            };

        let mut consumer = StreamConsumer::new(self.config.consumer.clone(), processor);
        consumer.start().await.context("failed to start consumer")?;
        self.consumer = Some(consumer);
        self.running = true;
        Ok(())
    }

    /// Pick the correlation-mode sink stack for the configured exporter
    /// type; stats ride along when enabled.
    fn build_correlation_exporter(&mut self) -> Result<Arc<dyn TraceExporter>> {
        let mut exporters: Vec<Arc<dyn TraceExporter>> = Vec::new();
        match self.config.exporter_type {
            ExporterKind::Console => {
                exporters.push(Arc::new(ConsoleExporter::new(self.config.pretty_console_output)));
            }
            ExporterKind::Json => {
                exporters.push(Arc::new(FileExporter::new(
                    self.config.json_output_directory.clone(),
                )));
            }
            ExporterKind::Multi => {
                exporters.push(Arc::new(ConsoleExporter::new(self.config.pretty_console_output)));
                exporters.push(Arc::new(FileExporter::new(
                    self.config.json_output_directory.clone(),
                )));
                if let Some(endpoint) = self.config.telemetry_endpoint.clone() {
                    let otlp = Arc::new(OtlpExporter::new(OtlpConfig {
                        endpoint,
                        protocol: self.config.telemetry_protocol,
                        ..OtlpConfig::default()
                    }));
                    self.otlp = Some(Arc::clone(&otlp));
                    exporters.push(otlp);
                }
            }
            ExporterKind::Otlp | ExporterKind::Telemetry => {
                unreachable!("stream-through kinds never build a correlation stack")
            }
        }

        if self.config.enable_stats {
            let stats = Arc::new(StatsExporter::new());
            self.stats = Some(Arc::clone(&stats));
            exporters.push(stats);
        }

        Ok(if exporters.len() == 1 {
            exporters.remove(0)
        } else {
            Arc::new(MultiExporter::new(exporters))
        })
    }

    /// Idempotent: stops the consumer first so no new events arrive while
    /// the correlator drains and the OTLP providers flush.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping trace pipeline");
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.stop().await;
        }
        if let Some(correlator) = &self.correlator {
            correlator.stop().await;
        }
        if let Some(otlp) = &self.otlp {
            otlp.close().await;
        }
        self.running = false;
        info!("trace pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub async fn info(&self) -> ManagerInfo {
        let consumer = match &self.consumer {
            Some(consumer) => Some(consumer.info().await),
            None => None,
        };
        let correlator = match &self.correlator {
            Some(correlator) => Some(correlator.stats().await),
            None => None,
        };
        ManagerInfo {
            enabled: self.config.enabled,
            running: self.running,
            exporter_type: self.config.exporter_type,
            stream_through: self.config.exporter_type.is_stream_through(),
            consumer,
            correlator,
            stats: self.stats.as_ref().map(|s| s.snapshot()),
        }
    }

    /// Read-back: the correlator cache in correlation mode, the backend
    /// query API in stream-through mode.
    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<CompletedTrace>> {
        if let Some(correlator) = &self.correlator {
            return Ok(correlator.get_trace(trace_id).await);
        }
        match &self.readback {
            Some(client) => client
                .get_trace(trace_id)
                .await
                .context("backend read-back failed"),
            None => Ok(None),
        }
    }

    /// Recent completed traces, correlation mode only.
    pub async fn list_traces(&self, limit: usize, offset: usize) -> Vec<CompletedTrace> {
        match &self.correlator {
            Some(correlator) => correlator.list_traces(limit, offset).await,
            None => Vec::new(),
        }
    }

    /// Search the completed-trace cache, correlation mode only.
    pub async fn search_traces(&self, criteria: &SearchCriteria) -> Vec<CompletedTrace> {
        match &self.correlator {
            Some(correlator) => correlator.search_traces(criteria).await,
            None => Vec::new(),
        }
    }
}
