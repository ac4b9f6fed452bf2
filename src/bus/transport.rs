use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::frame::{AddressingMode, Frame};
use super::vocabulary::{encode_command_payload, encode_sensor_payload, ActuatorKind, CommandCode, SensorKind};
use crate::error::BusError;
use crate::events::{tracing_handle, EventHandle, EventKind, FieldEvent};

/// Header, payload, CRC and stuffing bits of one full frame, approximated.
pub const BITS_PER_FRAME: u32 = 130;
/// Receive filter table size; snapshots list every entry.
pub const MAX_ACCEPT_FILTERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BaudRate {
    Rate125K,
    #[default]
    Rate250K,
    Rate500K,
    Rate1M,
}

impl BaudRate {
    pub const fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::Rate125K => 125_000,
            BaudRate::Rate250K => 250_000,
            BaudRate::Rate500K => 500_000,
            BaudRate::Rate1M => 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatus {
    pub bus_id: String,
    pub active: bool,
    pub baud_rate: u32,
    pub node_address: u8,
    pub utilization_percent: f64,
    pub sent_count: u64,
    pub received_count: u64,
    pub error_count: u64,
    pub transmit_queue_len: usize,
    pub receive_queue_len: usize,
    pub accept_filter: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatistics {
    pub total_messages: u64,
    pub sent_count: u64,
    pub received_count: u64,
    pub error_count: u64,
    pub error_rate_percent: f64,
    pub utilization_percent: f64,
}

/// One logical bus segment as seen from this node.
#[derive(Debug)]
pub struct BusTransport {
    bus_id: String,
    baud_rate: BaudRate,
    node_address: u8,
    active: bool,

    transmit_queue: VecDeque<Frame>,
    receive_queue: VecDeque<Frame>,
    accept_filter: BTreeSet<u32>,

    utilization_percent: f64,
    sent_count: u64,
    received_count: u64,
    error_count: u64,
    error_log: Vec<BusErrorRecord>,

    events: EventHandle,
}

impl BusTransport {
    pub fn new(bus_id: impl Into<String>, baud_rate: BaudRate, node_address: u8) -> Self {
        let bus = Self {
            bus_id: bus_id.into(),
            baud_rate,
            node_address,
            active: false,
            transmit_queue: VecDeque::new(),
            receive_queue: VecDeque::new(),
            accept_filter: BTreeSet::new(),
            utilization_percent: 0.0,
            sent_count: 0,
            received_count: 0,
            error_count: 0,
            error_log: Vec::new(),
            events: tracing_handle(),
        };
        info!(
            bus = %bus.bus_id,
            baud = baud_rate.bits_per_second(),
            node = %format!("0x{:02X}", node_address),
            "bus initialized"
        );
        bus
    }

    pub fn with_events(mut self, events: EventHandle) -> Self {
        self.events = events;
        self
    }

    pub fn activate(&mut self) {
        self.active = true;
        info!(bus = %self.bus_id, "bus active");
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        info!(bus = %self.bus_id, "bus inactive");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Queue an already-validated frame for transmission.
    pub fn transmit(&mut self, frame: Frame) -> Result<(), BusError> {
        if !self.active {
            warn!(bus = %self.bus_id, "transmit while bus inactive: {}", frame);
            return Err(BusError::BusInactive);
        }

        debug!(bus = %self.bus_id, "tx {}", frame);
        self.transmit_queue.push_back(frame);
        self.sent_count += 1;
        self.update_utilization();
        Ok(())
    }

    /// Build a frame and transmit it. Construction failures are kept in the
    /// error log as well as returned.
    pub fn send(&mut self, identifier: u32, mode: AddressingMode, payload: &[u8]) -> Result<(), BusError> {
        if !self.active {
            warn!(bus = %self.bus_id, identifier = %format!("0x{:X}", identifier), "send while bus inactive");
            return Err(BusError::BusInactive);
        }

        match Frame::new(identifier, mode, payload) {
            Ok(frame) => self.transmit(frame),
            Err(e) => {
                warn!(bus = %self.bus_id, "send failed: {}", e);
                self.error_count += 1;
                self.error_log.push(BusErrorRecord {
                    timestamp: Utc::now(),
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Pop the oldest received frame. `None` when inactive or empty.
    pub fn receive(&mut self) -> Option<Frame> {
        if !self.active {
            return None;
        }

        let frame = self.receive_queue.pop_front()?;
        self.received_count += 1;
        self.update_utilization();
        debug!(bus = %self.bus_id, "rx {}", frame);
        Some(frame)
    }

    /// Simulated line input. Returns whether the frame was accepted; rejected
    /// frames leave no trace.
    pub fn inject(&mut self, frame: Frame) -> bool {
        if !self.active || !self.accepts(frame.identifier()) {
            return false;
        }

        self.receive_queue.push_back(frame);
        self.update_utilization();
        true
    }

    pub fn inject_raw(&mut self, identifier: u32, mode: AddressingMode, payload: &[u8]) -> Result<bool, BusError> {
        let frame = Frame::new(identifier, mode, payload)?;
        Ok(self.inject(frame))
    }

    /// Move up to `max` frames off the transmit queue onto the wire.
    pub fn take_transmitted(&mut self, max: usize) -> Vec<Frame> {
        let count = max.min(self.transmit_queue.len());
        let frames: Vec<Frame> = self.transmit_queue.drain(..count).collect();
        if !frames.is_empty() {
            self.update_utilization();
        }
        frames
    }

    /// Accept `identifier` at receive time. Re-adding an entry is a no-op,
    /// a new entry beyond `MAX_ACCEPT_FILTERS` is refused.
    pub fn add_filter(&mut self, identifier: u32) -> Result<(), BusError> {
        if self.accept_filter.contains(&identifier) {
            return Ok(());
        }
        if self.accept_filter.len() >= MAX_ACCEPT_FILTERS {
            warn!(bus = %self.bus_id, "filter table full, 0x{:X} refused", identifier);
            return Err(BusError::FilterTableFull { max: MAX_ACCEPT_FILTERS });
        }

        self.accept_filter.insert(identifier);
        debug!(bus = %self.bus_id, "filter added: 0x{:X}", identifier);
        Ok(())
    }

    pub fn clear_filters(&mut self) {
        self.accept_filter.clear();
        debug!(bus = %self.bus_id, "filters cleared, accepting all frames");
    }

    fn accepts(&self, identifier: u32) -> bool {
        self.accept_filter.is_empty() || self.accept_filter.contains(&identifier)
    }

    pub fn publish_sensor_reading(&mut self, kind: SensorKind, value: f64) -> Result<(), BusError> {
        self.send(kind.identifier(), AddressingMode::Standard, &encode_sensor_payload(value))
    }

    pub fn publish_actuator_command(
        &mut self,
        kind: ActuatorKind,
        command: CommandCode,
        value: u16,
    ) -> Result<(), BusError> {
        self.send(kind.identifier(), AddressingMode::Standard, &encode_command_payload(command, value))?;
        self.events.record(FieldEvent::new(
            self.bus_id.clone(),
            EventKind::CommandSent {
                actuator: kind,
                command,
                value,
            },
        ));
        Ok(())
    }

    fn update_utilization(&mut self) {
        let queued = (self.transmit_queue.len() + self.receive_queue.len()) as f64;
        let bits = queued * f64::from(BITS_PER_FRAME);
        let load = bits / f64::from(self.baud_rate.bits_per_second()) * 100.0;
        self.utilization_percent = load.min(100.0);

        debug_assert!(
            (0.0..=100.0).contains(&self.utilization_percent),
            "Utilization {} outside 0..=100",
            self.utilization_percent
        );
    }

    pub fn utilization_percent(&self) -> f64 {
        self.utilization_percent
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn baud_rate(&self) -> BaudRate {
        self.baud_rate
    }

    pub fn node_address(&self) -> u8 {
        self.node_address
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn error_log(&self) -> &[BusErrorRecord] {
        &self.error_log
    }

    pub fn transmit_queue(&self) -> impl Iterator<Item = &Frame> {
        self.transmit_queue.iter()
    }

    pub fn receive_queue_len(&self) -> usize {
        self.receive_queue.len()
    }

    pub fn transmit_queue_len(&self) -> usize {
        self.transmit_queue.len()
    }

    pub fn status(&self) -> BusStatus {
        BusStatus {
            bus_id: self.bus_id.clone(),
            active: self.active,
            baud_rate: self.baud_rate.bits_per_second(),
            node_address: self.node_address,
            utilization_percent: self.utilization_percent,
            sent_count: self.sent_count,
            received_count: self.received_count,
            error_count: self.error_count,
            transmit_queue_len: self.transmit_queue.len(),
            receive_queue_len: self.receive_queue.len(),
            accept_filter: self.accept_filter.iter().copied().collect(),
        }
    }

    pub fn statistics(&self) -> BusStatistics {
        let total_messages = self.sent_count + self.received_count;
        let error_rate_percent = self.error_count as f64 / total_messages.max(1) as f64 * 100.0;

        BusStatistics {
            total_messages,
            sent_count: self.sent_count,
            received_count: self.received_count,
            error_count: self.error_count,
            error_rate_percent,
            utilization_percent: self.utilization_percent,
        }
    }
}

/// Shared handle to one bus segment. Every call takes the lock for its whole
/// duration, so concurrent callers see each operation atomically and frames
/// keep FIFO order.
#[derive(Debug, Clone)]
pub struct BusHandle {
    inner: Arc<Mutex<BusTransport>>,
}

impl BusHandle {
    pub fn new(bus: BusTransport) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, BusTransport> {
        // A panic while holding the lock cannot leave the queues half-written,
        // so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BusTransport) -> R) -> R {
        f(&mut self.lock())
    }
}
