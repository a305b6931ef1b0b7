//! Lineage and analytics events.
//!
//! Every actual (non-replay) remote invocation reports exactly one
//! [`InvocationEvent`] to the configured sink, regardless of how many
//! readers later observe the cached result. Cache replays report a
//! separate event flagged `cache_read`, so analytics can distinguish
//! real calls from replays.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A lineage record for one invocation or cache replay.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationEvent {
    /// The qualified operation name.
    pub operation: String,
    /// The query on whose behalf the event occurred.
    pub query_id: Uuid,
    /// When the invocation (or replay) started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Number of bound parameters.
    pub parameter_count: usize,
    /// Number of items emitted.
    pub item_count: usize,
    /// True when the items were served from the result cache rather
    /// than an actual remote call.
    pub cache_read: bool,
}

/// Sink for lineage events. Reports are fire-and-forget.
pub trait LineageSink: Send + Sync {
    /// Accepts one event. Must not block the invocation path.
    fn report(&self, event: InvocationEvent);
}

/// A sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLineageSink;

impl LineageSink for NoopLineageSink {
    fn report(&self, _event: InvocationEvent) {}
}

/// A sink that records events in memory. Intended for tests and
/// diagnostics.
#[derive(Debug, Default)]
pub struct RecordingLineageSink {
    events: Mutex<Vec<InvocationEvent>>,
}

impl RecordingLineageSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<InvocationEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of actual (non-replay) invocation events recorded.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.events().iter().filter(|e| !e.cache_read).count()
    }

    /// Number of cache-read events recorded.
    #[must_use]
    pub fn cache_read_count(&self) -> usize {
        self.events().iter().filter(|e| e.cache_read).count()
    }
}

impl LineageSink for RecordingLineageSink {
    fn report(&self, event: InvocationEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(cache_read: bool) -> InvocationEvent {
        InvocationEvent {
            operation: "svc/op".to_string(),
            query_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 12,
            parameter_count: 1,
            item_count: 3,
            cache_read,
        }
    }

    #[test]
    fn recording_sink_counts_by_kind() {
        let sink = RecordingLineageSink::new();
        sink.report(event(false));
        sink.report(event(true));
        sink.report(event(true));

        assert_eq!(sink.invocation_count(), 1);
        assert_eq!(sink.cache_read_count(), 2);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn noop_sink_accepts_events() {
        NoopLineageSink.report(event(false));
    }
}
