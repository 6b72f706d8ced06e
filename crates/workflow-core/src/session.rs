//! Per-instance session counters and debug trace ring (§4.8), exposed
//! through `workflow.status`. Mirrors the shape of the teacher's
//! `RunHealthMetrics`/`RunEvent` pair, scoped to an in-memory run instead of
//! a persisted artifact directory.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

const MAX_TRACE_ENTRIES: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    pub step_counts: HashMap<String, u32>,
    pub retry_count: u32,
    pub error_count: u32,
    pub peak_state_bytes: u64,
    pub recompute_counts: HashMap<String, u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
    pub step_type: String,
    pub duration_ms: u64,
    pub input_snapshot: Json,
    pub output_snapshot: Json,
}

impl SessionRecord {
    pub fn record_step(&mut self, step_type: &str) {
        *self.step_counts.entry(step_type.to_string()).or_insert(0) += 1;
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn record_recompute(&mut self, field: &str) {
        *self.recompute_counts.entry(field.to_string()).or_insert(0) += 1;
    }

    pub fn observe_state_bytes(&mut self, bytes: u64) {
        self.peak_state_bytes = self.peak_state_bytes.max(bytes);
    }

    /// Append a debug trace entry (only called when `EngineConfig.debug` is
    /// set); bounded so long-running debug sessions don't grow unbounded.
    pub fn push_trace(
        &mut self,
        step_id: &str,
        step_type: &str,
        duration: Duration,
        input_snapshot: Json,
        output_snapshot: Json,
    ) {
        if self.trace.len() >= MAX_TRACE_ENTRIES {
            self.trace.remove(0);
        }
        self.trace.push(TraceEntry {
            timestamp: Utc::now(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
            duration_ms: duration.as_millis() as u64,
            input_snapshot,
            output_snapshot,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut session = SessionRecord::default();
        session.record_step("state_update");
        session.record_step("state_update");
        session.record_retry();
        session.record_error();
        assert_eq!(session.step_counts["state_update"], 2);
        assert_eq!(session.retry_count, 1);
        assert_eq!(session.error_count, 1);
    }

    #[test]
    fn peak_state_bytes_tracks_maximum() {
        let mut session = SessionRecord::default();
        session.observe_state_bytes(100);
        session.observe_state_bytes(50);
        session.observe_state_bytes(200);
        assert_eq!(session.peak_state_bytes, 200);
    }

    #[test]
    fn trace_ring_is_bounded() {
        let mut session = SessionRecord::default();
        for i in 0..(MAX_TRACE_ENTRIES + 10) {
            session.push_trace(&format!("s{i}"), "wait_step", Duration::from_millis(1), Json::Null, Json::Null);
        }
        assert_eq!(session.trace.len(), MAX_TRACE_ENTRIES);
        assert_eq!(session.trace.last().unwrap().step_id, format!("s{}", MAX_TRACE_ENTRIES + 9));
    }
}
