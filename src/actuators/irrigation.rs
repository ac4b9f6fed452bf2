use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{publish_command, scaled_value, Actuator};
use crate::bus::{ActuatorKind, BusHandle, CommandCode};
use crate::config::IrrigationConfig;
use crate::error::{ConfigError, IrrigationError};
use crate::events::{tracing_handle, EventHandle, EventKind, FieldEvent};
use crate::scheduler::{parse_times, IrrigationSchedule, ScheduleStats};

const DEFAULT_TARGET_MOISTURE: f64 = 50.0;
const DEFAULT_BASE_PRESSURE_BAR: f64 = 2.5;
const DEFAULT_PRESSURE_JITTER_BAR: f64 = 0.2;
const DEFAULT_SCHEDULED_RUN_MINUTES: f64 = 15.0;
const DEFAULT_JITTER_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Automatic runs never last longer than this.
const MAX_AUTO_DURATION_MINUTES: f64 = 30.0;
/// Minutes of watering per percentage point of moisture deficit.
const AUTO_MINUTES_PER_DEFICIT_POINT: f64 = 2.0;
/// Flow commands carry tenths of L/min.
const FLOW_COMMAND_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IrrigationMode {
    Manual,
    Automatic,
    Scheduled,
    #[default]
    Off,
}

impl fmt::Display for IrrigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrrigationMode::Manual => write!(f, "manual"),
            IrrigationMode::Automatic => write!(f, "automatic"),
            IrrigationMode::Scheduled => write!(f, "scheduled"),
            IrrigationMode::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrrigationRun {
    pub zone: u8,
    pub duration_minutes: f64,
    pub volume_liters: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoIrrigation {
    NotTriggered,
    Triggered {
        moisture_deficit: f64,
        duration_minutes: f64,
        volume_liters: f64,
    },
}

impl AutoIrrigation {
    pub fn triggered(&self) -> bool {
        matches!(self, AutoIrrigation::Triggered { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub trigger: NaiveDateTime,
    pub duration_minutes: f64,
    pub volume_liters: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrrigationStatus {
    pub system_id: String,
    pub active: bool,
    pub mode: IrrigationMode,
    pub flow_rate: f64,
    pub pressure: f64,
    pub max_flow_rate: f64,
    pub zone_count: u8,
    pub active_zones: Vec<u8>,
    pub total_volume_liters: f64,
    pub total_operating_minutes: f64,
    pub target_moisture_percent: f64,
    pub last_irrigation: Option<DateTime<Utc>>,
    pub schedule: Vec<NaiveTime>,
    pub next_scheduled_run: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrrigationStatistics {
    pub total_volume_liters: f64,
    pub operating_hours: f64,
    pub average_flow_rate: f64,
    pub completed_runs: u32,
    pub last_irrigation: Option<DateTime<Utc>>,
    pub schedule: ScheduleStats,
}

/// Deterministic pressure noise, so repeated runs of a scenario match.
#[derive(Debug, Clone)]
struct PressureJitter {
    state: u64,
}

impl PressureJitter {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Uniform sample in [-1.0, 1.0).
    fn sample(&mut self) -> f64 {
        // Numerical Recipes LCG
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let unit = (self.state >> 11) as f64 / (1u64 << 53) as f64;
        unit * 2.0 - 1.0
    }
}

#[derive(Debug)]
pub struct IrrigationController {
    system_id: String,
    zone_count: u8,
    max_flow_rate: f64,
    base_pressure: f64,
    pressure_jitter: f64,
    scheduled_run_minutes: f64,

    active: bool,
    mode: IrrigationMode,
    /// Index 0 is zone 1.
    zones: Vec<bool>,
    flow_rate: f64,
    pressure: f64,
    target_moisture_percent: f64,

    total_volume_liters: f64,
    total_operating_minutes: f64,
    completed_runs: u32,
    last_irrigation: Option<DateTime<Utc>>,

    schedule: IrrigationSchedule,
    jitter: PressureJitter,

    bus: Option<BusHandle>,
    events: EventHandle,
}

impl IrrigationController {
    /// A controller with `zone_count` valves (at least one) sharing
    /// `max_flow_rate` L/min.
    pub fn new(system_id: impl Into<String>, zone_count: u8, max_flow_rate: f64) -> Self {
        let zone_count = zone_count.max(1);
        let controller = Self {
            system_id: system_id.into(),
            zone_count,
            max_flow_rate,
            base_pressure: DEFAULT_BASE_PRESSURE_BAR,
            pressure_jitter: DEFAULT_PRESSURE_JITTER_BAR,
            scheduled_run_minutes: DEFAULT_SCHEDULED_RUN_MINUTES,
            active: false,
            mode: IrrigationMode::Off,
            zones: vec![false; usize::from(zone_count)],
            flow_rate: 0.0,
            pressure: 0.0,
            target_moisture_percent: DEFAULT_TARGET_MOISTURE,
            total_volume_liters: 0.0,
            total_operating_minutes: 0.0,
            completed_runs: 0,
            last_irrigation: None,
            schedule: IrrigationSchedule::new(),
            jitter: PressureJitter::new(DEFAULT_JITTER_SEED),
            bus: None,
            events: tracing_handle(),
        };
        info!(
            system = %controller.system_id,
            zones = zone_count,
            max_flow_rate,
            "irrigation system initialized"
        );
        controller
    }

    pub fn from_config(config: &IrrigationConfig) -> Result<Self, ConfigError> {
        let mut controller = Self::new(config.system_id.clone(), config.zone_count, config.max_flow_rate);
        controller.base_pressure = config.base_pressure;
        controller.pressure_jitter = config.pressure_jitter;
        controller.scheduled_run_minutes = config.scheduled_run_minutes;
        controller.jitter = PressureJitter::new(config.jitter_seed);
        controller.target_moisture_percent = config.target_moisture_percent;
        if !config.schedule.is_empty() {
            controller.schedule.set_times_now(parse_times(&config.schedule)?);
        }
        Ok(controller)
    }

    pub fn with_bus(mut self, bus: BusHandle) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_events(mut self, events: EventHandle) -> Self {
        self.events = events;
        self
    }

    fn zone_index(&self, zone: u8) -> Result<usize, IrrigationError> {
        if zone == 0 || zone > self.zone_count {
            return Err(IrrigationError::UnknownZone {
                zone,
                zone_count: self.zone_count,
            });
        }
        Ok(usize::from(zone - 1))
    }

    fn require_active(&self) -> Result<(), IrrigationError> {
        if self.active {
            Ok(())
        } else {
            Err(IrrigationError::NotActive)
        }
    }

    pub fn open_zone(&mut self, zone: u8) -> Result<(), IrrigationError> {
        self.require_active()?;
        let index = self.zone_index(zone)?;

        self.zones[index] = true;
        self.update_flow_and_pressure();
        debug!(system = %self.system_id, zone, flow_rate = self.flow_rate, "zone opened");
        publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Valve, CommandCode::Start, u16::from(zone));
        Ok(())
    }

    pub fn close_zone(&mut self, zone: u8) -> Result<(), IrrigationError> {
        self.require_active()?;
        let index = self.zone_index(zone)?;

        self.zones[index] = false;
        self.update_flow_and_pressure();
        debug!(system = %self.system_id, zone, flow_rate = self.flow_rate, "zone closed");
        publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Valve, CommandCode::Stop, u16::from(zone));
        Ok(())
    }

    /// Override the derived flow until the zone layout changes again.
    pub fn set_flow_rate(&mut self, flow_rate: f64) -> Result<(), IrrigationError> {
        self.require_active()?;
        if !(0.0..=self.max_flow_rate).contains(&flow_rate) {
            return Err(IrrigationError::OutOfRange {
                value: flow_rate,
                max: self.max_flow_rate,
            });
        }

        self.flow_rate = flow_rate;
        info!(system = %self.system_id, flow_rate, "flow rate set");
        publish_command(
            self.bus.as_ref(),
            &self.system_id,
            ActuatorKind::Irrigation,
            CommandCode::SetRate,
            scaled_value(flow_rate, FLOW_COMMAND_SCALE),
        );
        Ok(())
    }

    pub fn set_target_moisture(&mut self, percent: f64) -> Result<(), IrrigationError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(IrrigationError::OutOfRange {
                value: percent,
                max: 100.0,
            });
        }
        self.target_moisture_percent = percent;
        Ok(())
    }

    /// Open `zone`, water it for `duration_minutes` at the resulting flow,
    /// then close it again.
    pub fn irrigate_zone(&mut self, zone: u8, duration_minutes: f64) -> Result<IrrigationRun, IrrigationError> {
        self.require_active()?;
        self.zone_index(zone)?;
        if !(duration_minutes >= 0.0) {
            return Err(IrrigationError::OutOfRange {
                value: duration_minutes,
                max: f64::INFINITY,
            });
        }

        self.open_zone(zone)?;
        let volume_liters = self.accumulate(duration_minutes);
        self.close_zone(zone)?;
        self.last_irrigation = Some(Utc::now());
        self.completed_runs += 1;

        info!(system = %self.system_id, zone, duration_minutes, volume_liters, "zone irrigated");
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::IrrigationPerformed {
                zone: Some(zone),
                duration_minutes,
                volume_liters,
            },
        ));

        Ok(IrrigationRun {
            zone,
            duration_minutes,
            volume_liters,
        })
    }

    /// Moisture-driven check for automatic mode. A deficit opens every zone;
    /// they stay open until the next manual close or `stop`.
    pub fn auto_irrigate(&mut self, current_moisture_percent: f64) -> AutoIrrigation {
        if !self.active || self.mode != IrrigationMode::Automatic {
            return AutoIrrigation::NotTriggered;
        }
        if !(current_moisture_percent < self.target_moisture_percent) {
            return AutoIrrigation::NotTriggered;
        }

        let moisture_deficit = self.target_moisture_percent - current_moisture_percent;
        let duration_minutes = (moisture_deficit * AUTO_MINUTES_PER_DEFICIT_POINT).min(MAX_AUTO_DURATION_MINUTES);

        self.open_all_zones();
        let volume_liters = self.accumulate(duration_minutes);
        self.last_irrigation = Some(Utc::now());
        self.completed_runs += 1;

        info!(
            system = %self.system_id,
            current = current_moisture_percent,
            target = self.target_moisture_percent,
            duration_minutes,
            "automatic irrigation triggered"
        );
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::IrrigationPerformed {
                zone: None,
                duration_minutes,
                volume_liters,
            },
        ));

        AutoIrrigation::Triggered {
            moisture_deficit,
            duration_minutes,
            volume_liters,
        }
    }

    pub fn schedule(&mut self, times: Vec<NaiveTime>) {
        self.schedule_at(times, Local::now().naive_local());
    }

    pub fn schedule_at(&mut self, times: Vec<NaiveTime>, now: NaiveDateTime) {
        self.schedule.set_times(times, now);
        info!(
            system = %self.system_id,
            triggers = self.schedule.times().len(),
            next = ?self.schedule.next_run(),
            "irrigation schedule updated"
        );
    }

    pub fn run_scheduled(&mut self) -> Option<ScheduledRun> {
        self.run_scheduled_at(Local::now().naive_local())
    }

    /// Scheduled-mode check: when a trigger is due, water every zone for the
    /// configured run length and close them again.
    pub fn run_scheduled_at(&mut self, now: NaiveDateTime) -> Option<ScheduledRun> {
        if !self.active || self.mode != IrrigationMode::Scheduled {
            return None;
        }
        let trigger = self.schedule.take_due(now)?;

        let duration_minutes = self.scheduled_run_minutes;
        self.open_all_zones();
        let volume_liters = self.accumulate(duration_minutes);
        self.close_all_zones();
        self.last_irrigation = Some(Utc::now());
        self.completed_runs += 1;

        info!(system = %self.system_id, %trigger, duration_minutes, volume_liters, "scheduled irrigation");
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::IrrigationPerformed {
                zone: None,
                duration_minutes,
                volume_liters,
            },
        ));

        Some(ScheduledRun {
            trigger,
            duration_minutes,
            volume_liters,
        })
    }

    fn open_all_zones(&mut self) {
        for zone in 1..=self.zone_count {
            if let Err(e) = self.open_zone(zone) {
                warn!(system = %self.system_id, zone, "failed to open zone: {}", e);
            }
        }
    }

    fn close_all_zones(&mut self) {
        for zone in 1..=self.zone_count {
            if let Err(e) = self.close_zone(zone) {
                warn!(system = %self.system_id, zone, "failed to close zone: {}", e);
            }
        }
    }

    fn accumulate(&mut self, duration_minutes: f64) -> f64 {
        let volume = self.flow_rate * duration_minutes;
        self.total_operating_minutes += duration_minutes;
        self.total_volume_liters += volume;
        volume
    }

    fn update_flow_and_pressure(&mut self) {
        let open = self.open_zone_count();
        if open == 0 {
            self.flow_rate = 0.0;
            self.pressure = 0.0;
            return;
        }

        let per_zone = self.max_flow_rate / f64::from(self.zone_count);
        self.flow_rate = (f64::from(open) * per_zone).min(self.max_flow_rate);
        self.pressure = self.base_pressure + self.jitter.sample() * self.pressure_jitter;

        debug_assert!(
            self.flow_rate <= self.max_flow_rate,
            "Flow rate {} exceeds maximum {}",
            self.flow_rate,
            self.max_flow_rate
        );
    }

    fn open_zone_count(&self) -> u8 {
        self.zones.iter().filter(|&&open| open).count() as u8
    }

    pub fn active_zones(&self) -> Vec<u8> {
        (1..=self.zone_count).filter(|&zone| self.zones[usize::from(zone - 1)]).collect()
    }

    pub fn is_zone_open(&self, zone: u8) -> bool {
        self.zone_index(zone).map(|index| self.zones[index]).unwrap_or(false)
    }

    pub fn flow_rate(&self) -> f64 {
        self.flow_rate
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn zone_count(&self) -> u8 {
        self.zone_count
    }

    pub fn max_flow_rate(&self) -> f64 {
        self.max_flow_rate
    }

    pub fn target_moisture_percent(&self) -> f64 {
        self.target_moisture_percent
    }

    pub fn total_volume_liters(&self) -> f64 {
        self.total_volume_liters
    }

    pub fn total_operating_minutes(&self) -> f64 {
        self.total_operating_minutes
    }

    pub fn last_irrigation(&self) -> Option<DateTime<Utc>> {
        self.last_irrigation
    }

    pub fn next_scheduled_run(&self) -> Option<NaiveDateTime> {
        self.schedule.next_run()
    }
}

impl Actuator for IrrigationController {
    type Mode = IrrigationMode;
    type Status = IrrigationStatus;
    type Statistics = IrrigationStatistics;

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn mode(&self) -> IrrigationMode {
        self.mode
    }

    /// Starting with `IrrigationMode::Off` is the same as `stop`.
    fn start(&mut self, mode: IrrigationMode) {
        if mode == IrrigationMode::Off {
            self.stop();
            return;
        }

        self.active = true;
        self.mode = mode;
        info!(system = %self.system_id, %mode, "irrigation system active");
        publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Irrigation, CommandCode::Start, 0);
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::SystemStarted { mode: mode.to_string() },
        ));
    }

    fn stop(&mut self) {
        let was_active = self.active;

        self.active = false;
        self.mode = IrrigationMode::Off;
        self.zones.iter_mut().for_each(|open| *open = false);
        self.flow_rate = 0.0;
        self.pressure = 0.0;

        if was_active {
            info!(system = %self.system_id, "irrigation system stopped");
            publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Irrigation, CommandCode::Stop, 0);
            self.events.record(FieldEvent::new(self.system_id.clone(), EventKind::SystemStopped));
        }
    }

    fn status(&self) -> IrrigationStatus {
        IrrigationStatus {
            system_id: self.system_id.clone(),
            active: self.active,
            mode: self.mode,
            flow_rate: self.flow_rate,
            pressure: self.pressure,
            max_flow_rate: self.max_flow_rate,
            zone_count: self.zone_count,
            active_zones: self.active_zones(),
            total_volume_liters: self.total_volume_liters,
            total_operating_minutes: self.total_operating_minutes,
            target_moisture_percent: self.target_moisture_percent,
            last_irrigation: self.last_irrigation,
            schedule: self.schedule.times().to_vec(),
            next_scheduled_run: self.schedule.next_run(),
        }
    }

    fn statistics(&self) -> IrrigationStatistics {
        IrrigationStatistics {
            total_volume_liters: self.total_volume_liters,
            operating_hours: self.total_operating_minutes / 60.0,
            average_flow_rate: self.total_volume_liters / self.total_operating_minutes.max(1.0),
            completed_runs: self.completed_runs,
            last_irrigation: self.last_irrigation,
            schedule: self.schedule.stats().clone(),
        }
    }
}
