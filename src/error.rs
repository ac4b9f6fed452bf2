use thiserror::Error;

use crate::bus::frame::{AddressingMode, MAX_PAYLOAD_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    InvalidPayloadLength { len: usize },
    #[error("identifier 0x{identifier:X} out of range for {mode} addressing")]
    IdentifierOutOfRange { identifier: u32, mode: AddressingMode },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus is not active")]
    BusInactive,
    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("filter table full ({max} identifiers)")]
    FilterTableFull { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum IrrigationError {
    #[error("irrigation system is not active")]
    NotActive,
    #[error("zone {zone} does not exist (zones 1..={zone_count})")]
    UnknownZone { zone: u8, zone_count: u8 },
    #[error("{value} outside allowed range 0..={max}")]
    OutOfRange { value: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum FertilizationError {
    #[error("fertilization system is not active")]
    NotActive,
    #[error("cannot load the tank while the system is active")]
    SystemActive,
    #[error("{amount_kg} kg exceeds tank capacity of {capacity_kg} kg")]
    CapacityExceeded { amount_kg: f64, capacity_kg: f64 },
    #[error("no product loaded")]
    NoProductLoaded,
    #[error("{value} outside allowed range 0..={max}")]
    OutOfRange { value: f64, max: f64 },
    #[error("application rate is zero")]
    ZeroRate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTime(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Irrigation(#[from] IrrigationError),
    #[error(transparent)]
    Fertilization(#[from] FertilizationError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
