use meshtrace_types::{CompletedTrace, EventType, TraceEvent, TraceSpan};
use std::time::{Duration, Instant};

/// Per-trace accumulator: an unordered list of spans plus activity stamps.
#[derive(Debug)]
pub struct TraceBuilder {
    pub trace_id: String,
    spans: Vec<TraceSpan>,
    pub created_at: Instant,
    pub last_seen: Instant,
}

impl TraceBuilder {
    pub fn new(trace_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            trace_id: trace_id.into(),
            spans: Vec::new(),
            created_at: now,
            last_seen: now,
        }
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Fold one event into the builder. Out-of-order arrival is tolerated: a
    /// late start never undoes an end already stamped on the same span.
    pub fn record(&mut self, event: &TraceEvent) {
        self.last_seen = Instant::now();
        match event.event_type {
            EventType::SpanStart => self.record_start(event),
            EventType::SpanEnd => self.record_end(event),
            EventType::Error => self.record_error(event),
            EventType::Execution => {
                if event.is_execution_trace() {
                    self.record_execution(event);
                }
            }
            EventType::Unknown => {}
        }
    }

    fn record_start(&mut self, event: &TraceEvent) {
        if let Some(span) = self.find_span_mut(&event.span_id) {
            span.start_time = span.start_time.min(event.timestamp);
            if span.parent_span.is_none() {
                span.parent_span = event.parent_span.clone();
            }
        } else {
            self.spans.push(TraceSpan::from_start_event(event));
        }
    }

    fn record_end(&mut self, event: &TraceEvent) {
        if let Some(span) = self.find_span_mut(&event.span_id) {
            span.end_time = Some(event.timestamp);
            if event.duration_ms.is_some() {
                span.duration_ms = event.duration_ms;
            }
            if event.success.is_some() {
                span.success = event.success;
            }
            if event.error_message.is_some() {
                span.error_message = event.error_message.clone();
            }
        } else {
            // Late or lost start: keep the end as an orphan span anchored at
            // the end timestamp.
            let mut span = TraceSpan::from_start_event(event);
            span.end_time = Some(event.timestamp);
            span.duration_ms = event.duration_ms;
            span.success = event.success;
            span.error_message = event.error_message.clone();
            self.spans.push(span);
        }
    }

    fn record_error(&mut self, event: &TraceEvent) {
        if let Some(span) = self.find_span_mut(&event.span_id) {
            span.success = Some(false);
            if event.error_message.is_some() {
                span.error_message = event.error_message.clone();
            }
        } else {
            let mut span = TraceSpan::from_start_event(event);
            span.end_time = Some(event.timestamp);
            span.success = Some(false);
            span.error_message = event.error_message.clone();
            self.spans.push(span);
        }
    }

    fn record_execution(&mut self, event: &TraceEvent) {
        let mut span = TraceSpan::from_start_event(event);
        let duration_secs = event.duration_ms.unwrap_or(0) as f64 / 1000.0;
        span.end_time = Some(event.timestamp + duration_secs);
        span.duration_ms = event.duration_ms;
        span.success = event.success;
        span.error_message = event.error_message.clone();
        self.spans.push(span);
    }

    fn find_span_mut(&mut self, span_id: &str) -> Option<&mut TraceSpan> {
        self.spans.iter_mut().find(|s| s.span_id == span_id)
    }

    /// Complete when the trace has gone quiet past the grace window with at
    /// least one span and every span closed.
    pub fn is_complete(&self, grace_window: Duration) -> bool {
        !self.spans.is_empty()
            && self.idle_for() >= grace_window
            && self.spans.iter().all(TraceSpan::is_complete)
    }

    /// Close out the builder, inferring end times for unfinished spans (max
    /// of known end times, or the span's own start when none exist).
    pub fn finalize(mut self) -> Option<CompletedTrace> {
        let inferred_end = self
            .spans
            .iter()
            .filter_map(|s| s.end_time)
            .fold(f64::NEG_INFINITY, f64::max);
        for span in &mut self.spans {
            if span.end_time.is_none() {
                span.end_time = Some(if inferred_end.is_finite() {
                    inferred_end.max(span.start_time)
                } else {
                    span.start_time
                });
            }
        }
        CompletedTrace::from_spans(self.trace_id, self.spans)
    }
}
