//! Typed events the subsystem emits to the host bus.
//!
//! The payloads are a closed sum; serialization to the wire envelope happens
//! once, at the sink boundary.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::hardening::PurgeResult;

pub const EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MemoryEventKind {
    MemoryRedaction { count: usize, context: String },
    VectorSearchFailed { message: String },
    VectorSearchFailedFallback,
    MemoryStalenessReconciled { marked_stale: usize, cleared_stale: usize },
    MemoryPurgeCompleted { purge_result: PurgeResult },
}

impl MemoryEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryEventKind::MemoryRedaction { .. } => "MemoryRedaction",
            MemoryEventKind::VectorSearchFailed { .. } => "VectorSearchFailed",
            MemoryEventKind::VectorSearchFailedFallback => "VectorSearchFailedFallback",
            MemoryEventKind::MemoryStalenessReconciled { .. } => "MemoryStalenessReconciled",
            MemoryEventKind::MemoryPurgeCompleted { .. } => "MemoryPurgeCompleted",
        }
    }
}

/// Wire envelope: `{schemaVersion, type, payload, timestamp, runId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEvent {
    pub schema_version: u32,
    #[serde(flatten)]
    pub kind: MemoryEventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<String>,
}

impl MemoryEvent {
    pub fn now(kind: MemoryEventKind, run_id: Option<String>) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            kind,
            timestamp: Utc::now(),
            run_id,
        }
    }
}

/// Delivery seam to the host bus. Emission is fire-and-forget; a slow or
/// closed sink must never stall memory operations.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MemoryEvent);
}

impl std::fmt::Debug for dyn EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn EventSink")
    }
}

/// Swallows everything. The default for hosts that don't wire a bus.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: MemoryEvent) {}
}

/// Forwards events onto an unbounded channel owned by the host.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MemoryEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<MemoryEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: MemoryEvent) {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Buffers events in memory. Used by tests and by hosts that poll.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MemoryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<MemoryEvent> {
        self.events
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default()
    }

    /// Event kind names in emission order, without draining.
    pub fn kind_names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .map(|guard| guard.iter().map(|event| event.kind.name()).collect())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: MemoryEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_and_payload() {
        let event = MemoryEvent::now(
            MemoryEventKind::MemoryRedaction { count: 2, context: "procedural-command".into() },
            Some("run-7".into()),
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["type"], "MemoryRedaction");
        assert_eq!(value["payload"]["count"], 2);
        assert_eq!(value["payload"]["context"], "procedural-command");
        assert_eq!(value["runId"], "run-7");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn unit_variants_serialize_without_payload_fields() {
        let event = MemoryEvent::now(MemoryEventKind::VectorSearchFailedFallback, None);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "VectorSearchFailedFallback");
    }

    #[test]
    fn envelope_round_trips() {
        let event = MemoryEvent::now(
            MemoryEventKind::MemoryStalenessReconciled { marked_stale: 3, cleared_stale: 1 },
            None,
        );
        let raw = serde_json::to_string(&event).expect("serialize");
        let parsed: MemoryEvent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed.kind, event.kind);
        assert_eq!(parsed.schema_version, EVENT_SCHEMA_VERSION);
    }

    #[test]
    fn recording_sink_collects_in_order() {
        let sink = RecordingSink::new();
        sink.emit(MemoryEvent::now(MemoryEventKind::VectorSearchFailedFallback, None));
        sink.emit(MemoryEvent::now(
            MemoryEventKind::MemoryRedaction { count: 1, context: "c".into() },
            None,
        ));
        assert_eq!(sink.kind_names(), vec!["VectorSearchFailedFallback", "MemoryRedaction"]);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn channel_sink_survives_a_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        sink.emit(MemoryEvent::now(MemoryEventKind::VectorSearchFailedFallback, None));
    }
}
