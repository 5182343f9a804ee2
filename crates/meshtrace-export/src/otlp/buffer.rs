//! Optional per-trace reorder buffer.
//!
//! A purely local heuristic: spans are held briefly and flushed parent-first
//! so the backend's first render of a trace comes out as a clean waterfall.
//! Trace and span ids are never altered.

use crate::otlp::record::SpanRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct PendingTrace {
    spans: Vec<SpanRecord>,
    first_seen: Instant,
}

pub struct SpanBuffer {
    max_spans: usize,
    max_age: Duration,
    pending: Mutex<HashMap<String, PendingTrace>>,
}

impl SpanBuffer {
    pub fn new(max_spans: usize, max_age: Duration) -> Self {
        Self {
            max_spans: max_spans.max(1),
            max_age,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one span. Returns a flush-ready, parent-first batch once the
    /// trace has accumulated enough spans.
    pub fn push(&self, record: SpanRecord) -> Option<Vec<SpanRecord>> {
        let key = hex::encode(record.trace_id);
        let mut pending = self.pending.lock();
        let entry = pending.entry(key.clone()).or_insert_with(|| PendingTrace {
            spans: Vec::new(),
            first_seen: Instant::now(),
        });
        entry.spans.push(record);
        if entry.spans.len() >= self.max_spans {
            let mut batch = pending.remove(&key).expect("entry just inserted").spans;
            sort_parent_first(&mut batch);
            Some(batch)
        } else {
            None
        }
    }

    /// Remove and return every trace older than the buffer timeout.
    pub fn drain_expired(&self) -> Vec<Vec<SpanRecord>> {
        let mut pending = self.pending.lock();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, t)| t.first_seen.elapsed() >= self.max_age)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| pending.remove(&key))
            .map(|t| {
                let mut spans = t.spans;
                sort_parent_first(&mut spans);
                spans
            })
            .collect()
    }

    /// Remove and return everything, regardless of age.
    pub fn drain_all(&self) -> Vec<Vec<SpanRecord>> {
        let mut pending = self.pending.lock();
        pending
            .drain()
            .map(|(_, t)| {
                let mut spans = t.spans;
                sort_parent_first(&mut spans);
                spans
            })
            .collect()
    }

    pub fn pending_traces(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Order spans so parents precede their children, ties broken by start time.
/// Depth is computed against parents present in the same batch; spans whose
/// parent is elsewhere count as roots.
pub(crate) fn sort_parent_first(spans: &mut [SpanRecord]) {
    let index: HashMap<[u8; 8], usize> = spans
        .iter()
        .enumerate()
        .map(|(i, s)| (s.span_id, i))
        .collect();

    let depths: Vec<usize> = spans
        .iter()
        .map(|span| {
            let mut depth = 0;
            let mut current = span.parent_span_id;
            while let Some(parent) = current {
                match index.get(&parent) {
                    Some(&i) if depth < spans.len() => {
                        depth += 1;
                        current = spans[i].parent_span_id;
                    }
                    _ => break,
                }
            }
            depth
        })
        .collect();

    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by(|&a, &b| {
        depths[a].cmp(&depths[b]).then(
            spans[a]
                .start_time_unix_nano
                .cmp(&spans[b].start_time_unix_nano),
        )
    });

    let reordered: Vec<SpanRecord> = order.into_iter().map(|i| spans[i].clone()).collect();
    spans.clone_from_slice(&reordered);
}
