//! Field node configuration, loaded from a JSON file. Every field has a
//! default so a partial file (or none at all) yields a working node.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::actuators::fertilization::Npk;
use crate::bus::{BaudRate, MAX_ACCEPT_FILTERS};
use crate::error::ConfigError;
use crate::scheduler::{parse_time_of_day, MAX_SCHEDULE_TIMES};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub bus: BusConfig,
    pub irrigation: IrrigationConfig,
    pub fertilization: FertilizationConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub bus_id: String,
    pub baud_rate: BaudRate,
    pub node_address: u8,
    /// Identifiers accepted at receive time; empty accepts everything.
    pub accept_filter: Vec<u32>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: "CAN0".to_string(),
            baud_rate: BaudRate::Rate250K,
            node_address: 0x01,
            accept_filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrrigationConfig {
    pub system_id: String,
    pub zone_count: u8,
    /// L/min
    pub max_flow_rate: f64,
    pub target_moisture_percent: f64,
    /// bar
    pub base_pressure: f64,
    pub pressure_jitter: f64,
    pub scheduled_run_minutes: f64,
    /// "HH:MM" triggers for scheduled mode.
    pub schedule: Vec<String>,
    pub jitter_seed: u64,
}

impl Default for IrrigationConfig {
    fn default() -> Self {
        Self {
            system_id: "IRR_001".to_string(),
            zone_count: 4,
            max_flow_rate: 100.0,
            target_moisture_percent: 50.0,
            base_pressure: 2.5,
            pressure_jitter: 0.2,
            scheduled_run_minutes: 15.0,
            schedule: Vec::new(),
            jitter_seed: 0x1234_5678_9ABC_DEF0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FertilizationConfig {
    pub system_id: String,
    pub tank_capacity_kg: f64,
    /// kg/ha
    pub max_rate: f64,
    /// mg/kg
    pub target_npk: Npk,
    pub low_tank_alert_percent: f64,
}

impl Default for FertilizationConfig {
    fn default() -> Self {
        Self {
            system_id: "FERT_001".to_string(),
            tank_capacity_kg: 500.0,
            max_rate: 200.0,
            target_npk: Npk {
                n: 30.0,
                p: 15.0,
                k: 40.0,
            },
            low_tank_alert_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub tick_ms: u64,
    pub port: u16,
    /// Frames moved from the transmit queue onto the wire per tick.
    pub frames_per_tick: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            port: 8080,
            frames_per_tick: 32,
        }
    }
}

impl FieldConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.accept_filter.len() > MAX_ACCEPT_FILTERS {
            return Err(ConfigError::Invalid(format!(
                "bus.accept_filter holds at most {} identifiers",
                MAX_ACCEPT_FILTERS
            )));
        }

        let irrigation = &self.irrigation;
        if irrigation.zone_count == 0 {
            return Err(ConfigError::Invalid("irrigation.zone_count must be at least 1".into()));
        }
        if !is_positive(irrigation.max_flow_rate) {
            return Err(ConfigError::Invalid("irrigation.max_flow_rate must be positive".into()));
        }
        if !(0.0..=100.0).contains(&irrigation.target_moisture_percent) {
            return Err(ConfigError::Invalid(
                "irrigation.target_moisture_percent must be within 0..=100".into(),
            ));
        }
        if irrigation.pressure_jitter < 0.0 || irrigation.pressure_jitter > irrigation.base_pressure {
            return Err(ConfigError::Invalid(
                "irrigation.pressure_jitter must be within 0..=base_pressure".into(),
            ));
        }
        if irrigation.scheduled_run_minutes < 0.0 {
            return Err(ConfigError::Invalid("irrigation.scheduled_run_minutes must not be negative".into()));
        }
        if irrigation.schedule.len() > MAX_SCHEDULE_TIMES {
            return Err(ConfigError::Invalid(format!(
                "irrigation.schedule holds at most {} times",
                MAX_SCHEDULE_TIMES
            )));
        }
        for time in &irrigation.schedule {
            parse_time_of_day(time)?;
        }

        let fertilization = &self.fertilization;
        if !is_positive(fertilization.tank_capacity_kg) {
            return Err(ConfigError::Invalid("fertilization.tank_capacity_kg must be positive".into()));
        }
        if !is_positive(fertilization.max_rate) {
            return Err(ConfigError::Invalid("fertilization.max_rate must be positive".into()));
        }

        if self.simulator.tick_ms == 0 {
            return Err(ConfigError::Invalid("simulator.tick_ms must be positive".into()));
        }
        if self.simulator.frames_per_tick == 0 {
            return Err(ConfigError::Invalid("simulator.frames_per_tick must be positive".into()));
        }

        Ok(())
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
