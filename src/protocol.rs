//! Newline-delimited JSON command protocol spoken by the simulator's TCP
//! server and the `agribus` client.

use arrayvec::ArrayString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actuators::fertilization::{FertilizationMode, Npk, Product, ZoneSample};
use crate::actuators::irrigation::IrrigationMode;
use crate::bus::SensorKind;
use crate::error::ProtocolError;
use crate::scheduler::{parse_time_of_day, MAX_SCHEDULE_TIMES};
use crate::telemetry::FieldSnapshot;

pub const MAX_COMMAND_SIZE: usize = 1024;
/// Large enough for a `SystemStatus` response wrapping a full snapshot.
pub const MAX_RESPONSE_SIZE: usize = 12288;
pub const MAX_SNAPSHOT_SIZE: usize = 8192;
/// Variable-rate passes larger than this are rejected before execution.
pub const MAX_VARIABLE_RATE_ZONES: usize = 32;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;
pub type SnapshotBuffer = ArrayString<MAX_SNAPSHOT_SIZE>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    SystemStatus,
    RecentEvents { limit: usize },

    BusStatus,
    BusActivate,
    BusDeactivate,
    AddFilter { identifier: u32 },
    ClearFilters,
    PublishSensor { sensor: SensorKind, value: f64 },

    StartIrrigation { mode: IrrigationMode },
    StopIrrigation,
    OpenZone { zone: u8 },
    CloseZone { zone: u8 },
    SetFlowRate { flow_rate: f64 },
    IrrigateZone { zone: u8, duration_minutes: f64 },
    SetTargetMoisture { percent: f64 },
    SetSchedule { times: Vec<String> },

    StartFertilization { mode: FertilizationMode },
    StopFertilization,
    LoadProduct { product: Product, amount_kg: f64 },
    SetApplicationRate { rate_kg_ha: f64 },
    Apply { area_ha: f64 },
    Recommend { npk: Npk },
    SetTargetNpk { npk: Npk },
    VariableRateApply { zones: Vec<ZoneSample> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    pub message: Option<String>,
    /// Command-specific result, e.g. an application record or a status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// The command was well formed but the controller refused it.
    Error,
    InvalidCommand,
}

/// Line framing between the socket and the agent. Buffers are preallocated
/// so an oversized message is rejected before it is parsed or sent.
#[derive(Debug)]
pub struct ProtocolHandler {
    command_counter: u32,
    command_buffer: CommandBuffer,
    response_buffer: ResponseBuffer,
    snapshot_buffer: SnapshotBuffer,
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            command_counter: 0,
            command_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            snapshot_buffer: ArrayString::new(),
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        self.command_buffer.clear();
        self.command_buffer
            .try_push_str(json_str)
            .map_err(|_| ProtocolError::MessageTooLarge {
                len: json_str.len(),
                max: MAX_COMMAND_SIZE,
            })?;

        serde_json::from_str::<Command>(&self.command_buffer).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn serialize_command(&mut self, command: &Command) -> Result<&str, ProtocolError> {
        let json = serde_json::to_string(command).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        fill(&mut self.command_buffer, &json)
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, ProtocolError> {
        let json = serde_json::to_string(response).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        fill(&mut self.response_buffer, &json)
    }

    pub fn serialize_snapshot(&mut self, snapshot: &FieldSnapshot) -> Result<&str, ProtocolError> {
        let json = serde_json::to_string(snapshot).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        fill(&mut self.snapshot_buffer, &json)
    }

    pub fn create_response(&self, command_id: u32, status: ResponseStatus, message: Option<&str>) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp: Utc::now(),
            status,
            message: message.map(str::to_string),
            data: None,
        }
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        if self.command_counter == 0 {
            self.command_counter = 1;
        }
        self.command_counter
    }

    /// Shape checks only; range checks belong to the controllers.
    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand("command id must be non-zero".into()));
        }

        match &command.command_type {
            CommandType::SetSchedule { times } => {
                if times.len() > MAX_SCHEDULE_TIMES {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "{} schedule times exceeds the limit of {}",
                        times.len(),
                        MAX_SCHEDULE_TIMES
                    )));
                }
                for time in times {
                    parse_time_of_day(time).map_err(|e| ProtocolError::InvalidParameter(e.to_string()))?;
                }
            }
            CommandType::VariableRateApply { zones } => {
                if zones.len() > MAX_VARIABLE_RATE_ZONES {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "{} zones exceeds the limit of {}",
                        zones.len(),
                        MAX_VARIABLE_RATE_ZONES
                    )));
                }
            }
            CommandType::SetTargetNpk { npk } if ![npk.n, npk.p, npk.k].iter().all(|v| v.is_finite() && *v >= 0.0) => {
                return Err(ProtocolError::InvalidParameter("target levels must be finite and non-negative".into()));
            }
            CommandType::PublishSensor { value, .. } if !value.is_finite() => {
                return Err(ProtocolError::InvalidParameter("sensor value must be finite".into()));
            }
            _ => {}
        }

        Ok(())
    }
}

fn fill<'a, const N: usize>(buffer: &'a mut ArrayString<N>, json: &str) -> Result<&'a str, ProtocolError> {
    buffer.clear();
    buffer.try_push_str(json).map_err(|_| ProtocolError::MessageTooLarge {
        len: json.len(),
        max: N,
    })?;
    Ok(buffer.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_command() {
        let mut handler = ProtocolHandler::new();
        let command = handler.parse_command(r#"{"id": 7, "command_type": "Ping"}"#).unwrap();
        assert_eq!(command.id, 7);
        assert_eq!(command.command_type, CommandType::Ping);
    }

    #[test]
    fn test_parse_struct_command() {
        let mut handler = ProtocolHandler::new();
        let command = handler
            .parse_command(r#"{"id": 3, "command_type": {"LoadProduct": {"product": "urea", "amount_kg": 120.0}}}"#)
            .unwrap();
        assert_eq!(
            command.command_type,
            CommandType::LoadProduct {
                product: Product::Urea,
                amount_kg: 120.0
            }
        );
    }

    #[test]
    fn test_oversized_command_rejected() {
        let mut handler = ProtocolHandler::new();
        let huge = " ".repeat(MAX_COMMAND_SIZE + 1);
        assert!(matches!(
            handler.parse_command(&huge),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let mut handler = ProtocolHandler::new();
        assert!(matches!(
            handler.parse_command("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_id_and_bad_times() {
        let handler = ProtocolHandler::new();
        let zero = Command {
            id: 0,
            command_type: CommandType::Ping,
        };
        assert!(matches!(
            handler.validate_command(&zero),
            Err(ProtocolError::InvalidCommand(_))
        ));

        let schedule = Command {
            id: 1,
            command_type: CommandType::SetSchedule {
                times: vec!["06:00".into(), "7pm".into()],
            },
        };
        assert!(matches!(
            handler.validate_command(&schedule),
            Err(ProtocolError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_validate_caps_schedule_length() {
        let handler = ProtocolHandler::new();
        let command = Command {
            id: 1,
            command_type: CommandType::SetSchedule {
                times: vec!["06:00".into(); MAX_SCHEDULE_TIMES + 1],
            },
        };
        assert!(matches!(
            handler.validate_command(&command),
            Err(ProtocolError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_serialize_command_matches_parse() {
        let mut handler = ProtocolHandler::new();
        let command = Command {
            id: handler.next_command_id(),
            command_type: CommandType::SetTargetNpk {
                npk: Npk::new(30.0, 15.0, 40.0),
            },
        };
        let json = handler.serialize_command(&command).unwrap().to_string();
        assert_eq!(handler.parse_command(&json).unwrap(), command);
    }

    #[test]
    fn test_next_command_id_skips_zero() {
        let mut handler = ProtocolHandler::new();
        handler.command_counter = u32::MAX;
        assert_eq!(handler.next_command_id(), 1);
    }

    #[test]
    fn test_response_omits_empty_data() {
        let mut handler = ProtocolHandler::new();
        let response = handler.create_response(9, ResponseStatus::Success, Some("pong"));
        let json = handler.serialize_response(&response).unwrap();
        assert!(json.contains("\"status\":\"Success\""));
        assert!(!json.contains("\"data\""));
    }
}
