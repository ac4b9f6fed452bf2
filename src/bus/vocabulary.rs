//! Reserved identifiers and payload layouts shared by every node on the
//! segment. Peers decode these frames, so the numbers here must not move.

use core::fmt;
use serde::{Deserialize, Serialize};

use super::frame::{Frame, MAX_PAYLOAD_LEN};

/// Sensor readings are sent as `value * 100`.
pub const SENSOR_SCALE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    SoilMoisture,
    Npk,
}

impl SensorKind {
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Pressure,
        SensorKind::SoilMoisture,
        SensorKind::Npk,
    ];

    pub const fn identifier(self) -> u32 {
        match self {
            SensorKind::Temperature => 0x100,
            SensorKind::Humidity => 0x101,
            SensorKind::Pressure => 0x102,
            SensorKind::SoilMoisture => 0x103,
            SensorKind::Npk => 0x104,
        }
    }

    pub fn from_identifier(identifier: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.identifier() == identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    Irrigation,
    Fertilizer,
    Valve,
}

impl ActuatorKind {
    pub const ALL: [ActuatorKind; 3] = [ActuatorKind::Irrigation, ActuatorKind::Fertilizer, ActuatorKind::Valve];

    pub const fn identifier(self) -> u32 {
        match self {
            ActuatorKind::Irrigation => 0x200,
            ActuatorKind::Fertilizer => 0x201,
            ActuatorKind::Valve => 0x202,
        }
    }

    pub fn from_identifier(identifier: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.identifier() == identifier)
    }
}

impl fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorKind::Irrigation => write!(f, "irrigation"),
            ActuatorKind::Fertilizer => write!(f, "fertilizer"),
            ActuatorKind::Valve => write!(f, "valve"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCode {
    Start,
    Stop,
    SetRate,
    Status,
}

impl CommandCode {
    pub const fn byte(self) -> u8 {
        match self {
            CommandCode::Start => 0x01,
            CommandCode::Stop => 0x02,
            CommandCode::SetRate => 0x03,
            CommandCode::Status => 0x04,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandCode::Start),
            0x02 => Some(CommandCode::Stop),
            0x03 => Some(CommandCode::SetRate),
            0x04 => Some(CommandCode::Status),
            _ => None,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCode::Start => write!(f, "start"),
            CommandCode::Stop => write!(f, "stop"),
            CommandCode::SetRate => write!(f, "set_rate"),
            CommandCode::Status => write!(f, "status"),
        }
    }
}

/// `[value*100 as i32 LE, 0, 0, 0, 0]`
pub fn encode_sensor_payload(value: f64) -> [u8; MAX_PAYLOAD_LEN] {
    // `as` saturates on overflow and maps NaN to zero.
    let scaled = (value * SENSOR_SCALE) as i32;
    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    payload[..4].copy_from_slice(&scaled.to_le_bytes());
    payload
}

/// `[CMD, VALUE_H, VALUE_L, 0, 0, 0, 0, 0]`
pub fn encode_command_payload(command: CommandCode, value: u16) -> [u8; MAX_PAYLOAD_LEN] {
    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    payload[0] = command.byte();
    payload[1..3].copy_from_slice(&value.to_be_bytes());
    payload
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub value: f64,
}

impl SensorReading {
    pub fn decode(frame: &Frame) -> Option<Self> {
        let kind = SensorKind::from_identifier(frame.identifier())?;
        let bytes: [u8; 4] = frame.payload().get(..4)?.try_into().ok()?;
        Some(Self {
            kind,
            value: f64::from(i32::from_le_bytes(bytes)) / SENSOR_SCALE,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub kind: ActuatorKind,
    pub command: CommandCode,
    pub value: u16,
}

impl ActuatorCommand {
    pub fn decode(frame: &Frame) -> Option<Self> {
        let kind = ActuatorKind::from_identifier(frame.identifier())?;
        let payload = frame.payload();
        let command = CommandCode::from_byte(*payload.first()?)?;
        let bytes: [u8; 2] = payload.get(1..3)?.try_into().ok()?;
        Some(Self {
            kind,
            command,
            value: u16::from_be_bytes(bytes),
        })
    }
}
