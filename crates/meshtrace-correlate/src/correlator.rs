use crate::builder::TraceBuilder;
use crate::store::{SearchCriteria, TraceStore};
use anyhow::Result;
use async_trait::async_trait;
use meshtrace_types::{CompletedTrace, EventProcessor, TraceEvent, TraceExporter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Tuning for trace correlation.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Quiet period before an all-ended trace is considered complete; a
    /// coarse heuristic, so it stays configurable.
    pub grace_window: Duration,
    /// Idle period after which a trace is abandoned and force-finalized.
    pub trace_timeout: Duration,
    /// Cadence of the completion sweep.
    pub sweep_interval: Duration,
    /// Cadence of the abandon-timeout scan.
    pub cleanup_interval: Duration,
    /// Completed-trace cache capacity.
    pub max_stored_traces: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(5),
            trace_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            max_stored_traces: 1000,
        }
    }
}

/// Correlator stats for the manager's info snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelatorStats {
    pub active_traces: usize,
    pub oldest_active_age_secs: Option<u64>,
    pub completed_stored: usize,
    pub exported_total: u64,
}

/// Buffers events per trace and emits completed traces to an exporter.
///
/// Processing never returns an error to the consumer: once an event enters a
/// builder it counts as consumed, and failures downstream are logged here.
pub struct TraceCorrelator {
    config: CorrelatorConfig,
    exporter: Arc<dyn TraceExporter>,
    active: RwLock<HashMap<String, Arc<Mutex<TraceBuilder>>>>,
    store: Arc<TraceStore>,
    exported_total: AtomicU64,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TraceCorrelator {
    pub fn new(config: CorrelatorConfig, exporter: Arc<dyn TraceExporter>) -> Self {
        let store = Arc::new(TraceStore::new(config.max_stored_traces));
        Self {
            config,
            exporter,
            active: RwLock::new(HashMap::new()),
            store,
            exported_total: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Spawn the background completion/cleanup sweep.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            grace_secs = self.config.grace_window.as_secs(),
            timeout_secs = self.config.trace_timeout.as_secs(),
            "starting trace correlator"
        );
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let correlator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut since_cleanup = Duration::ZERO;
            while correlator.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = sleep(correlator.config.sweep_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
                correlator.sweep_completed().await;

                since_cleanup += correlator.config.sweep_interval;
                if since_cleanup >= correlator.config.cleanup_interval {
                    since_cleanup = Duration::ZERO;
                    correlator.sweep_expired().await;
                }
            }
            debug!("correlator sweep loop stopped");
        });
        *self.sweep_handle.lock().await = Some(handle);
    }

    /// Stop the sweep and force-finalize every remaining builder.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping trace correlator");
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.try_send(());
        }
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = handle.await;
        }

        let remaining: Vec<String> = self.active.read().await.keys().cloned().collect();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "force-finalizing remaining traces");
        }
        for trace_id in remaining {
            self.finalize_trace(&trace_id).await;
        }
    }

    /// Completion sweep: finalize traces that went quiet with all spans ended.
    pub async fn sweep_completed(&self) {
        let candidates = self.collect_candidates(|b| b.is_complete(self.config.grace_window)).await;
        for trace_id in candidates {
            self.finalize_trace(&trace_id).await;
        }
    }

    /// Abandon sweep: force-finalize traces idle past the trace timeout, even
    /// with unfinished spans.
    pub async fn sweep_expired(&self) {
        let timeout = self.config.trace_timeout;
        let candidates = self.collect_candidates(|b| b.idle_for() >= timeout).await;
        for trace_id in candidates {
            warn!(trace_id = %trace_id, "trace abandoned, finalizing incomplete");
            self.finalize_trace(&trace_id).await;
        }
    }

    async fn collect_candidates<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&TraceBuilder) -> bool,
    {
        let mut candidates = Vec::new();
        let active = self.active.read().await;
        for (trace_id, builder) in active.iter() {
            let builder = builder.lock().await;
            if predicate(&builder) {
                candidates.push(trace_id.clone());
            }
        }
        candidates
    }

    async fn finalize_trace(&self, trace_id: &str) {
        let Some(builder) = self.active.write().await.remove(trace_id) else {
            return;
        };
        let builder = match Arc::try_unwrap(builder) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => {
                // An ingest still holds the builder; rebuild from a snapshot
                // is not possible, so put it back and let the next sweep win.
                self.active
                    .write()
                    .await
                    .insert(trace_id.to_string(), shared);
                return;
            }
        };

        let Some(trace) = builder.finalize() else {
            return;
        };
        info!(
            trace_id = %trace.trace_id,
            spans = trace.span_count,
            agents = trace.agent_count,
            duration_ms = trace.duration_ms(),
            success = trace.success,
            "trace completed"
        );
        self.store.insert(trace.clone()).await;
        self.exported_total.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.exporter.export_trace(&trace).await {
            error!(trace_id = %trace.trace_id, error = %err, "trace export failed");
        }
    }

    pub fn store(&self) -> Arc<TraceStore> {
        Arc::clone(&self.store)
    }

    pub async fn get_trace(&self, trace_id: &str) -> Option<CompletedTrace> {
        self.store.get(trace_id).await
    }

    pub async fn list_traces(&self, limit: usize, offset: usize) -> Vec<CompletedTrace> {
        self.store.list(limit, offset).await
    }

    pub async fn search_traces(&self, criteria: &SearchCriteria) -> Vec<CompletedTrace> {
        self.store.search(criteria).await
    }

    pub async fn stats(&self) -> CorrelatorStats {
        let active = self.active.read().await;
        let mut oldest: Option<Duration> = None;
        for builder in active.values() {
            let age = builder.lock().await.created_at.elapsed();
            oldest = Some(oldest.map_or(age, |o| o.max(age)));
        }
        CorrelatorStats {
            active_traces: active.len(),
            oldest_active_age_secs: oldest.map(|d| d.as_secs()),
            completed_stored: self.store.len().await,
            exported_total: self.exported_total.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventProcessor for TraceCorrelator {
    async fn process(&self, event: TraceEvent) -> Result<()> {
        // Events for a trace still sitting in the completed cache are late
        // stragglers; dropping them avoids a duplicate one-span emission.
        if !self.active.read().await.contains_key(&event.trace_id)
            && self.store.contains(&event.trace_id).await
        {
            debug!(trace_id = %event.trace_id, "event for already-completed trace dropped");
            return Ok(());
        }

        let builder = {
            let mut active = self.active.write().await;
            Arc::clone(
                active
                    .entry(event.trace_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(TraceBuilder::new(&event.trace_id)))),
            )
        };

        let complete_now = {
            let mut builder = builder.lock().await;
            builder.record(&event);
            builder.is_complete(self.config.grace_window)
        };
        drop(builder);

        // A freshly-touched builder only satisfies the grace window when it
        // is zero; the periodic sweep handles the normal case.
        if complete_now {
            self.finalize_trace(&event.trace_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingExporter {
        traces: StdMutex<Vec<CompletedTrace>>,
    }

    #[async_trait]
    impl TraceExporter for RecordingExporter {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn export_trace(&self, trace: &CompletedTrace) -> Result<()> {
            self.traces.lock().unwrap().push(trace.clone());
            Ok(())
        }
    }

    const TRACE: &str = "1322f09dbaee4241a45da4ee78dc199f";

    fn immediate_config() -> CorrelatorConfig {
        CorrelatorConfig {
            grace_window: Duration::ZERO,
            ..CorrelatorConfig::default()
        }
    }

    fn correlator_with(
        config: CorrelatorConfig,
    ) -> (Arc<TraceCorrelator>, Arc<RecordingExporter>) {
        let exporter = Arc::new(RecordingExporter::default());
        let correlator = Arc::new(TraceCorrelator::new(config, exporter.clone()));
        (correlator, exporter)
    }

    fn start_event(span: &str, ts: f64) -> TraceEvent {
        let mut e = TraceEvent::span_start(TRACE, span, None, "alpha", "alpha-1", "op");
        e.timestamp = ts;
        e
    }

    fn end_event(span: &str, ts: f64, success: bool) -> TraceEvent {
        let mut e = TraceEvent::span_end(TRACE, span, "alpha", "alpha-1", "op", 250, success);
        e.timestamp = ts;
        e
    }

    #[tokio::test]
    async fn complete_trace_is_exported_and_cached() {
        let (correlator, exporter) = correlator_with(immediate_config());
        correlator.process(start_event("a", 1000.0)).await.unwrap();
        correlator.process(end_event("a", 1000.25, true)).await.unwrap();

        let exported = exporter.traces.lock().unwrap().clone();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].span_count, 1);
        assert!(exported[0].success);

        let cached = correlator.get_trace(TRACE).await.unwrap();
        assert_eq!(cached.trace_id, TRACE);
        assert!(correlator.active.read().await.is_empty());
    }

    #[tokio::test]
    async fn late_event_after_completion_does_not_reemit() {
        let (correlator, exporter) = correlator_with(immediate_config());
        correlator.process(start_event("a", 1000.0)).await.unwrap();
        correlator.process(end_event("a", 1000.25, true)).await.unwrap();
        assert_eq!(exporter.traces.lock().unwrap().len(), 1);

        // Redelivered end for the same span: the completed cache swallows it.
        correlator.process(end_event("a", 1000.25, true)).await.unwrap();
        assert_eq!(exporter.traces.lock().unwrap().len(), 1);
        assert!(correlator.active.read().await.is_empty());
    }

    #[tokio::test]
    async fn incomplete_trace_waits_for_sweep() {
        let (correlator, exporter) = correlator_with(immediate_config());
        correlator.process(start_event("a", 1000.0)).await.unwrap();
        assert!(exporter.traces.lock().unwrap().is_empty());
        assert_eq!(correlator.stats().await.active_traces, 1);
    }

    #[tokio::test]
    async fn expired_trace_is_force_finalized_with_inferred_end() {
        let config = CorrelatorConfig {
            grace_window: Duration::from_secs(3600),
            trace_timeout: Duration::ZERO,
            ..CorrelatorConfig::default()
        };
        let (correlator, exporter) = correlator_with(config);
        correlator.process(start_event("a", 1000.0)).await.unwrap();

        correlator.sweep_expired().await;
        let exported = exporter.traces.lock().unwrap().clone();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].spans[0].end_time, Some(1000.0));
        assert!(exported[0].success);
    }

    #[tokio::test]
    async fn stop_force_finalizes_remaining_builders() {
        let config = CorrelatorConfig {
            grace_window: Duration::from_secs(3600),
            ..CorrelatorConfig::default()
        };
        let (correlator, exporter) = correlator_with(config);
        correlator.start().await;
        correlator.process(start_event("a", 1000.0)).await.unwrap();
        correlator.stop().await;

        assert_eq!(exporter.traces.lock().unwrap().len(), 1);
        assert_eq!(correlator.stats().await.active_traces, 0);

        // Second stop is a no-op.
        correlator.stop().await;
        assert_eq!(exporter.traces.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn grace_window_defers_completion() {
        let config = CorrelatorConfig {
            grace_window: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            ..CorrelatorConfig::default()
        };
        let (correlator, exporter) = correlator_with(config);
        correlator.start().await;
        correlator.process(start_event("a", 1000.0)).await.unwrap();
        correlator.process(end_event("a", 1000.25, true)).await.unwrap();

        // All spans ended but the trace has not gone quiet long enough.
        assert!(exporter.traces.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exporter.traces.lock().unwrap().len(), 1);
        correlator.stop().await;
    }

    #[tokio::test]
    async fn export_failure_is_swallowed() {
        struct FailingExporter;

        #[async_trait]
        impl TraceExporter for FailingExporter {
            fn name(&self) -> &'static str {
                "failing"
            }
            async fn export_trace(&self, _trace: &CompletedTrace) -> Result<()> {
                anyhow::bail!("sink unavailable")
            }
        }

        let correlator =
            Arc::new(TraceCorrelator::new(immediate_config(), Arc::new(FailingExporter)));
        correlator.process(start_event("a", 1.0)).await.unwrap();
        // Processing must succeed even though the export sink fails.
        correlator.process(end_event("a", 2.0, true)).await.unwrap();
        // The trace still lands in the cache.
        assert!(correlator.get_trace(TRACE).await.is_some());
    }
}
