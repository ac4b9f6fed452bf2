//! Discrete field events and the sinks that receive them.
//!
//! Controllers and the bus never log events through process-wide state; each
//! one holds an [`EventHandle`] supplied by whoever builds it. The default
//! handle forwards to `tracing`, tests usually hand in an [`EventLog`] and
//! inspect what was recorded.

use chrono::{DateTime, Utc};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::actuators::fertilization::Product;
use crate::bus::vocabulary::{ActuatorKind, CommandCode};

pub const MAX_EVENT_HISTORY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SystemStarted {
        mode: String,
    },
    SystemStopped,
    IrrigationPerformed {
        /// `None` when every zone was opened at once.
        zone: Option<u8>,
        duration_minutes: f64,
        volume_liters: f64,
    },
    FertilizationPerformed {
        product: Product,
        amount_kg: f64,
        area_ha: f64,
    },
    CommandSent {
        actuator: ActuatorKind,
        command: CommandCode,
        value: u16,
    },
    AlertRaised {
        level: AlertLevel,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEvent {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub kind: EventKind,
}

impl FieldEvent {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }
}

pub trait EventSink: Send + Sync + core::fmt::Debug {
    fn record(&self, event: FieldEvent);
}

pub type EventHandle = Arc<dyn EventSink>;

/// Renders each event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: FieldEvent) {
        match &event.kind {
            EventKind::AlertRaised { level, message } if *level >= AlertLevel::Warning => {
                warn!(source = %event.source, level = ?level, "ALERT: {}", message);
            }
            kind => {
                let detail = serde_json::to_string(kind).unwrap_or_default();
                info!(source = %event.source, event = %detail, "field event");
            }
        }
    }
}

pub fn tracing_handle() -> EventHandle {
    Arc::new(TracingEventSink)
}

/// Forwards every event to each inner sink in order.
#[derive(Debug, Default)]
pub struct FanoutSink {
    sinks: alloc::vec::Vec<EventHandle>,
}

impl FanoutSink {
    pub fn new(sinks: alloc::vec::Vec<EventHandle>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: FieldEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Bounded in-memory event history; the oldest record is evicted when full.
#[derive(Debug, Default)]
pub struct EventLog {
    history: Mutex<Vec<FieldEvent, MAX_EVENT_HISTORY>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn events(&self) -> alloc::vec::Vec<FieldEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count_matching(&self, predicate: impl Fn(&EventKind) -> bool) -> usize {
        self.lock().iter().filter(|event| predicate(&event.kind)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FieldEvent, MAX_EVENT_HISTORY>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for EventLog {
    fn record(&self, event: FieldEvent) {
        let mut history = self.lock();
        if history.is_full() {
            history.remove(0);
        }
        let _ = history.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(message: &str) -> FieldEvent {
        FieldEvent::new(
            "TEST",
            EventKind::AlertRaised {
                level: AlertLevel::Warning,
                message: message.to_string(),
            },
        )
    }

    #[test]
    fn test_event_log_records_in_order() {
        let log = EventLog::new();
        log.record(alert("first"));
        log.record(FieldEvent::new("TEST", EventKind::SystemStopped));

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, EventKind::AlertRaised { .. }));
        assert_eq!(events[1].kind, EventKind::SystemStopped);
    }

    #[test]
    fn test_event_log_evicts_oldest() {
        let log = EventLog::new();
        for i in 0..MAX_EVENT_HISTORY + 3 {
            log.record(alert(&format!("alert {}", i)));
        }

        let events = log.events();
        assert_eq!(events.len(), MAX_EVENT_HISTORY);
        assert_eq!(
            events[0].kind,
            EventKind::AlertRaised {
                level: AlertLevel::Warning,
                message: "alert 3".to_string(),
            }
        );
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = EventLog::shared();
        let second = EventLog::shared();
        let fanout = FanoutSink::new(vec![first.clone() as EventHandle, second.clone() as EventHandle]);

        fanout.record(alert("both"));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = FieldEvent::new("IRR_001", EventKind::SystemStopped);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"system_stopped\""));
        assert!(json.contains("\"source\":\"IRR_001\""));
    }
}
