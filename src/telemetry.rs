use chrono::{DateTime, Utc};
use heapless::{HistoryBuffer, Vec};
use serde::{Deserialize, Serialize};

use crate::actuators::fertilization::{FertilizationStatistics, FertilizationStatus};
use crate::actuators::irrigation::{IrrigationStatistics, IrrigationStatus};
use crate::bus::{BusStatistics, BusStatus, Frame};

const SNAPSHOT_HISTORY_SIZE: usize = 32;
/// Most recent wire frames carried in each snapshot.
pub const MAX_SNAPSHOT_FRAMES: usize = 16;

/// A frame as it went out on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub identifier: u32,
    pub extended: bool,
    #[serde(with = "serde_bytes")]
    pub data: std::vec::Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            identifier: frame.identifier(),
            extended: frame.is_extended(),
            data: frame.payload().to_vec(),
            created_at: frame.created_at(),
        }
    }
}

/// Everything the reporting layer shows about a node at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub bus: BusStatus,
    pub bus_statistics: BusStatistics,
    pub irrigation: IrrigationStatus,
    pub irrigation_statistics: IrrigationStatistics,
    pub fertilization: FertilizationStatus,
    pub fertilization_statistics: FertilizationStatistics,
    pub recent_frames: std::vec::Vec<WireFrame>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub snapshots_collected: u32,
    pub frames_observed: u64,
    pub buffer_utilization: u8,
}

/// Keeps the recent wire traffic and a short snapshot history.
#[derive(Debug)]
pub struct TelemetryCollector {
    sequence: u32,
    frames_observed: u64,
    recent_frames: HistoryBuffer<WireFrame, MAX_SNAPSHOT_FRAMES>,
    snapshots: Vec<FieldSnapshot, SNAPSHOT_HISTORY_SIZE>,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            frames_observed: 0,
            recent_frames: HistoryBuffer::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn observe_frames<'a>(&mut self, frames: impl IntoIterator<Item = &'a Frame>) {
        for frame in frames {
            self.recent_frames.write(WireFrame::from(frame));
            self.frames_observed += 1;
        }
    }

    pub fn collect(
        &mut self,
        bus: (BusStatus, BusStatistics),
        irrigation: (IrrigationStatus, IrrigationStatistics),
        fertilization: (FertilizationStatus, FertilizationStatistics),
    ) -> FieldSnapshot {
        self.sequence = self.sequence.wrapping_add(1);

        let snapshot = FieldSnapshot {
            sequence: self.sequence,
            timestamp: Utc::now(),
            bus: bus.0,
            bus_statistics: bus.1,
            irrigation: irrigation.0,
            irrigation_statistics: irrigation.1,
            fertilization: fertilization.0,
            fertilization_statistics: fertilization.1,
            recent_frames: self.recent_frames.oldest_ordered().cloned().collect(),
        };

        if self.snapshots.is_full() {
            self.snapshots.remove(0);
        }
        let _ = self.snapshots.push(snapshot.clone());

        snapshot
    }

    pub fn latest(&self) -> Option<&FieldSnapshot> {
        self.snapshots.last()
    }

    pub fn history(&self) -> &[FieldSnapshot] {
        &self.snapshots
    }

    pub fn metrics(&self) -> TelemetryMetrics {
        TelemetryMetrics {
            snapshots_collected: self.sequence,
            frames_observed: self.frames_observed,
            buffer_utilization: ((self.snapshots.len() * 100) / SNAPSHOT_HISTORY_SIZE) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_keeps_payload_bytes() {
        let frame = Frame::standard(0x202, &[0x01, 0x00, 0x03]).unwrap();
        let wire = WireFrame::from(&frame);
        assert_eq!(wire.identifier, 0x202);
        assert!(!wire.extended);
        assert_eq!(wire.data, vec![0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_recent_frames_bounded() {
        let mut collector = TelemetryCollector::new();
        let frames: std::vec::Vec<Frame> = (0..MAX_SNAPSHOT_FRAMES as u32 + 4)
            .map(|i| Frame::standard(i, &[]).unwrap())
            .collect();
        collector.observe_frames(&frames);

        let kept: std::vec::Vec<u32> = collector.recent_frames.oldest_ordered().map(|f| f.identifier).collect();
        assert_eq!(kept.len(), MAX_SNAPSHOT_FRAMES);
        assert_eq!(kept[0], 4);
        assert_eq!(collector.metrics().frames_observed, MAX_SNAPSHOT_FRAMES as u64 + 4);
    }
}
