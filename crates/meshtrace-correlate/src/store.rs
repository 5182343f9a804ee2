use meshtrace_types::CompletedTrace;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Minimum number of traces removed by an eviction pass.
const MIN_EVICTION: usize = 10;

/// Filter for the read-back search surface. All fields optional; an empty
/// criteria matches everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub parent_span_id: Option<String>,
    pub agent_name: Option<String>,
    pub operation_contains: Option<String>,
    pub success: Option<bool>,
    pub started_after: Option<f64>,
    pub started_before: Option<f64>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub limit: Option<usize>,
}

impl SearchCriteria {
    fn matches(&self, trace: &CompletedTrace) -> bool {
        if let Some(parent) = &self.parent_span_id {
            if !trace
                .spans
                .iter()
                .any(|s| s.parent_span.as_deref() == Some(parent.as_str()))
            {
                return false;
            }
        }
        if let Some(agent) = &self.agent_name {
            if !trace.agents.iter().any(|a| a == agent) {
                return false;
            }
        }
        if let Some(fragment) = &self.operation_contains {
            if !trace.spans.iter().any(|s| s.operation.contains(fragment.as_str())) {
                return false;
            }
        }
        if let Some(success) = self.success {
            if trace.success != success {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if trace.start_time < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if trace.start_time > before {
                return false;
            }
        }
        if let Some(min) = self.min_duration_ms {
            if trace.duration_ms() < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration_ms {
            if trace.duration_ms() > max {
                return false;
            }
        }
        true
    }
}

/// Bounded in-memory cache of recently completed traces, keyed by trace id.
///
/// When capacity is exceeded the oldest 20% by end time are dropped, never
/// fewer than ten, so eviction passes stay infrequent under steady load.
pub struct TraceStore {
    capacity: usize,
    traces: RwLock<HashMap<String, CompletedTrace>>,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            traces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, trace: CompletedTrace) {
        let mut traces = self.traces.write().await;
        traces.insert(trace.trace_id.clone(), trace);

        if traces.len() > self.capacity {
            let evict_count = (self.capacity / 5).max(MIN_EVICTION).min(traces.len());
            let mut by_age: Vec<(String, f64)> = traces
                .iter()
                .map(|(id, t)| (id.clone(), t.end_time))
                .collect();
            by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            for (id, _) in by_age.into_iter().take(evict_count) {
                traces.remove(&id);
            }
            debug!(evicted = evict_count, remaining = traces.len(), "evicted oldest completed traces");
        }
    }

    pub async fn contains(&self, trace_id: &str) -> bool {
        self.traces.read().await.contains_key(trace_id)
    }

    pub async fn get(&self, trace_id: &str) -> Option<CompletedTrace> {
        self.traces.read().await.get(trace_id).cloned()
    }

    /// Completed traces ordered by end time, newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Vec<CompletedTrace> {
        let traces = self.traces.read().await;
        let mut all: Vec<CompletedTrace> = traces.values().cloned().collect();
        all.sort_by(|a, b| {
            b.end_time
                .partial_cmp(&a.end_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.into_iter().skip(offset).take(limit).collect()
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Vec<CompletedTrace> {
        let traces = self.traces.read().await;
        let mut matched: Vec<CompletedTrace> = traces
            .values()
            .filter(|t| criteria.matches(t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.end_time
                .partial_cmp(&a.end_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = criteria.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub async fn len(&self) -> usize {
        self.traces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.traces.read().await.is_empty()
    }
}
