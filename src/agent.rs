use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actuators::fertilization::{FertilizationController, FertilizationMode, Npk, Recommendation};
use crate::actuators::irrigation::{AutoIrrigation, IrrigationController, ScheduledRun};
use crate::actuators::Actuator;
use crate::bus::{BusHandle, BusTransport, SensorKind, SensorReading};
use crate::config::FieldConfig;
use crate::error::{AgentError, ProtocolError};
use crate::events::{tracing_handle, EventHandle, EventLog, FanoutSink};
use crate::protocol::{Command, CommandResponse, CommandType, ProtocolHandler, ResponseStatus};
use crate::scheduler::parse_times;
use crate::telemetry::{FieldSnapshot, TelemetryCollector};

/// Field measurements handed to the agent on each tick. A missing soil
/// moisture value falls back to the latest reading received on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorFeed {
    pub soil_moisture_percent: Option<f64>,
    pub npk: Option<Npk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    /// Moisture value the irrigation check ran against, if any was known.
    pub soil_moisture_percent: Option<f64>,
    pub moisture_published: bool,
    pub readings_received: Vec<SensorReading>,
    pub auto_irrigation: AutoIrrigation,
    pub scheduled_run: Option<ScheduledRun>,
    /// Product advice for the latest soil nutrient levels, produced while
    /// fertilization runs in automatic mode.
    pub recommendation: Option<Recommendation>,
    pub frames_on_wire: usize,
}

/// Owns one node's bus segment and both controllers, and wires them
/// together with a shared event sink.
#[derive(Debug)]
pub struct FieldAgent {
    bus: BusHandle,
    irrigation: IrrigationController,
    fertilization: FertilizationController,
    event_log: Arc<EventLog>,
    protocol: ProtocolHandler,
    telemetry: TelemetryCollector,
    frames_per_tick: usize,
    tick_count: u64,
    command_count: u32,
    last_moisture: Option<f64>,
    last_npk: Option<Npk>,
}

impl FieldAgent {
    pub fn new() -> Result<Self, AgentError> {
        Self::from_config(&FieldConfig::default())
    }

    pub fn from_config(config: &FieldConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let event_log = EventLog::shared();
        let events: EventHandle = Arc::new(FanoutSink::new(vec![tracing_handle(), event_log.clone() as EventHandle]));

        let mut transport = BusTransport::new(
            config.bus.bus_id.clone(),
            config.bus.baud_rate,
            config.bus.node_address,
        )
        .with_events(events.clone());
        for &identifier in &config.bus.accept_filter {
            transport.add_filter(identifier)?;
        }
        let bus = BusHandle::new(transport);

        let irrigation = IrrigationController::from_config(&config.irrigation)?
            .with_bus(bus.clone())
            .with_events(events.clone());
        let fertilization = FertilizationController::from_config(&config.fertilization)
            .with_bus(bus.clone())
            .with_events(events);

        Ok(Self {
            bus,
            irrigation,
            fertilization,
            event_log,
            protocol: ProtocolHandler::new(),
            telemetry: TelemetryCollector::new(),
            frames_per_tick: config.simulator.frames_per_tick,
            tick_count: 0,
            command_count: 0,
            last_moisture: None,
            last_npk: None,
        })
    }

    /// Bring the bus up. Controllers stay off until commanded.
    pub fn start(&mut self) {
        self.bus.with(|bus| bus.activate());
        info!(bus = %self.bus.lock().bus_id(), "field agent started");
    }

    pub fn shutdown(&mut self) {
        self.irrigation.stop();
        self.fertilization.stop();
        let drained = self.drain_wire();
        self.bus.with(|bus| bus.deactivate());
        info!(frames = drained, "field agent stopped");
    }

    /// One cooperative step: read what arrived on the bus, publish the
    /// moisture reading, run automatic and scheduled irrigation, then move
    /// queued frames onto the wire.
    pub fn tick(&mut self, feed: SensorFeed) -> TickReport {
        self.tick_count += 1;

        let readings_received = self.drain_received();

        if let Some(npk) = feed.npk {
            self.last_npk = Some(npk);
        }
        if let Some(moisture) = feed.soil_moisture_percent {
            self.last_moisture = Some(moisture);
        }

        let mut moisture_published = false;
        if let Some(moisture) = feed.soil_moisture_percent {
            match self
                .bus
                .with(|bus| bus.publish_sensor_reading(SensorKind::SoilMoisture, moisture))
            {
                Ok(()) => moisture_published = true,
                Err(e) => debug!(moisture, "soil moisture not published: {}", e),
            }
        }

        let auto_irrigation = match self.last_moisture {
            Some(moisture) => self.irrigation.auto_irrigate(moisture),
            None => AutoIrrigation::NotTriggered,
        };
        let scheduled_run = self.irrigation.run_scheduled();
        let recommendation = self.advise_fertilization();

        let frames_on_wire = self.drain_wire();

        TickReport {
            tick: self.tick_count,
            soil_moisture_percent: self.last_moisture,
            moisture_published,
            readings_received,
            auto_irrigation,
            scheduled_run,
            recommendation,
            frames_on_wire,
        }
    }

    fn advise_fertilization(&self) -> Option<Recommendation> {
        if !self.fertilization.is_active() || self.fertilization.mode() != FertilizationMode::Automatic {
            return None;
        }
        let recommendation = self.fertilization.recommend(self.last_npk?);
        if let Some(product) = recommendation.product {
            info!(
                %product,
                rate_kg_ha = recommendation.rate_kg_ha,
                reason = %recommendation.reason,
                "fertilization recommended"
            );
        }
        Some(recommendation)
    }

    fn drain_received(&mut self) -> Vec<SensorReading> {
        let mut readings = Vec::new();
        let mut bus = self.bus.lock();
        while let Some(frame) = bus.receive() {
            match SensorReading::decode(&frame) {
                Some(reading) => readings.push(reading),
                None => debug!(%frame, "ignoring non-sensor frame"),
            }
        }
        drop(bus);

        for reading in &readings {
            if reading.kind == SensorKind::SoilMoisture {
                self.last_moisture = Some(reading.value);
            }
        }
        readings
    }

    fn drain_wire(&mut self) -> usize {
        let frames = self.bus.with(|bus| bus.take_transmitted(self.frames_per_tick));
        for frame in &frames {
            debug!(%frame, "frame on wire");
        }
        self.telemetry.observe_frames(&frames);
        frames.len()
    }

    /// Run one protocol command. Controller refusals come back as an
    /// `Error` response, never as a failure of the agent itself.
    pub fn execute(&mut self, command: Command) -> CommandResponse {
        self.command_count = self.command_count.wrapping_add(1);

        if let Err(e) = self.protocol.validate_command(&command) {
            warn!(id = command.id, "command rejected: {}", e);
            return self
                .protocol
                .create_response(command.id, ResponseStatus::InvalidCommand, Some(&e.to_string()));
        }

        let id = command.id;
        match self.dispatch(command.command_type) {
            Ok((message, data)) => {
                let mut response = self.protocol.create_response(id, ResponseStatus::Success, Some(&message));
                response.data = data;
                response
            }
            Err(e) => {
                warn!(id, "command failed: {}", e);
                self.protocol
                    .create_response(id, ResponseStatus::Error, Some(&e.to_string()))
            }
        }
    }

    /// Parse a JSON line and execute it. Malformed input yields an
    /// `InvalidCommand` response with id 0.
    pub fn execute_json(&mut self, line: &str) -> CommandResponse {
        match self.protocol.parse_command(line) {
            Ok(command) => self.execute(command),
            Err(e) => self
                .protocol
                .create_response(0, ResponseStatus::InvalidCommand, Some(&e.to_string())),
        }
    }

    /// `execute_json` rendered through the response buffer, ready to be
    /// written as one line. A response whose data does not fit is replaced
    /// by an `Error` response carrying the size failure.
    pub fn respond_json(&mut self, line: &str) -> Result<String, AgentError> {
        let response = self.execute_json(line);
        match self.protocol.serialize_response(&response).map(str::to_string) {
            Ok(json) => Ok(json),
            Err(ProtocolError::MessageTooLarge { len, max }) => {
                warn!(id = response.id, len, max, "response too large, data dropped");
                let message = ProtocolError::MessageTooLarge { len, max }.to_string();
                let fallback = self
                    .protocol
                    .create_response(response.id, ResponseStatus::Error, Some(&message));
                Ok(self.protocol.serialize_response(&fallback)?.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&mut self, command: CommandType) -> Result<(String, Option<Value>), AgentError> {
        let outcome = match command {
            CommandType::Ping => ("pong".to_string(), None),
            CommandType::SystemStatus => ("system status".to_string(), Some(to_value(&self.snapshot())?)),
            CommandType::RecentEvents { limit } => {
                let events = self.event_log.events();
                let skip = events.len().saturating_sub(limit);
                let recent = &events[skip..];
                (format!("{} events", recent.len()), Some(to_value(&recent)?))
            }

            CommandType::BusStatus => {
                let status = self.bus.lock().status();
                ("bus status".to_string(), Some(to_value(&status)?))
            }
            CommandType::BusActivate => {
                self.bus.with(|bus| bus.activate());
                ("bus active".to_string(), None)
            }
            CommandType::BusDeactivate => {
                self.bus.with(|bus| bus.deactivate());
                ("bus inactive".to_string(), None)
            }
            CommandType::AddFilter { identifier } => {
                self.bus.with(|bus| bus.add_filter(identifier))?;
                (format!("accepting 0x{:X}", identifier), None)
            }
            CommandType::ClearFilters => {
                self.bus.with(|bus| bus.clear_filters());
                ("filters cleared".to_string(), None)
            }
            CommandType::PublishSensor { sensor, value } => {
                self.bus.with(|bus| bus.publish_sensor_reading(sensor, value))?;
                (format!("{:?} = {}", sensor, value), None)
            }

            CommandType::StartIrrigation { mode } => {
                self.irrigation.start(mode);
                (format!("irrigation {}", mode), None)
            }
            CommandType::StopIrrigation => {
                self.irrigation.stop();
                ("irrigation stopped".to_string(), None)
            }
            CommandType::OpenZone { zone } => {
                self.irrigation.open_zone(zone)?;
                (format!("zone {} open", zone), None)
            }
            CommandType::CloseZone { zone } => {
                self.irrigation.close_zone(zone)?;
                (format!("zone {} closed", zone), None)
            }
            CommandType::SetFlowRate { flow_rate } => {
                self.irrigation.set_flow_rate(flow_rate)?;
                (format!("flow rate {} L/min", flow_rate), None)
            }
            CommandType::IrrigateZone { zone, duration_minutes } => {
                let run = self.irrigation.irrigate_zone(zone, duration_minutes)?;
                (
                    format!("zone {} irrigated, {:.1} L", zone, run.volume_liters),
                    Some(to_value(&run)?),
                )
            }
            CommandType::SetTargetMoisture { percent } => {
                self.irrigation.set_target_moisture(percent)?;
                (format!("target moisture {}%", percent), None)
            }
            CommandType::SetSchedule { times } => {
                let times = parse_times(&times)?;
                let count = times.len();
                self.irrigation.schedule(times);
                (
                    format!("{} scheduled triggers", count),
                    Some(to_value(&self.irrigation.next_scheduled_run())?),
                )
            }

            CommandType::StartFertilization { mode } => {
                self.fertilization.start(mode);
                (format!("fertilization {}", mode), None)
            }
            CommandType::StopFertilization => {
                self.fertilization.stop();
                ("fertilization stopped".to_string(), None)
            }
            CommandType::LoadProduct { product, amount_kg } => {
                self.fertilization.load_product(product, amount_kg)?;
                (format!("{} kg of {} loaded", amount_kg, product), None)
            }
            CommandType::SetApplicationRate { rate_kg_ha } => {
                self.fertilization.set_rate(rate_kg_ha)?;
                (format!("rate {} kg/ha", rate_kg_ha), None)
            }
            CommandType::Apply { area_ha } => {
                let application = self.fertilization.apply(area_ha)?;
                (
                    format!("{:.2} kg over {:.2} ha", application.amount_kg, application.area_ha),
                    Some(to_value(&application)?),
                )
            }
            CommandType::Recommend { npk } => {
                let recommendation = self.fertilization.recommend(npk);
                (recommendation.reason.to_string(), Some(to_value(&recommendation)?))
            }
            CommandType::SetTargetNpk { npk } => {
                self.fertilization.set_target_npk(npk);
                (
                    format!("target N {} P {} K {} mg/kg", npk.n, npk.p, npk.k),
                    None,
                )
            }
            CommandType::VariableRateApply { zones } => {
                let results = self.fertilization.variable_rate_apply(&zones)?;
                (format!("{} zones treated", results.len()), Some(to_value(&results)?))
            }
        };
        Ok(outcome)
    }

    pub fn snapshot(&mut self) -> FieldSnapshot {
        let bus = {
            let bus = self.bus.lock();
            (bus.status(), bus.statistics())
        };
        self.telemetry.collect(
            bus,
            (self.irrigation.status(), self.irrigation.statistics()),
            (self.fertilization.status(), self.fertilization.statistics()),
        )
    }

    /// Snapshot rendered as one JSON line for broadcast.
    pub fn snapshot_json(&mut self) -> Result<String, AgentError> {
        let snapshot = self.snapshot();
        Ok(self.protocol.serialize_snapshot(&snapshot)?.to_string())
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn irrigation(&self) -> &IrrigationController {
        &self.irrigation
    }

    pub fn irrigation_mut(&mut self) -> &mut IrrigationController {
        &mut self.irrigation
    }

    pub fn fertilization(&self) -> &FertilizationController {
        &self.fertilization
    }

    pub fn fertilization_mut(&mut self) -> &mut FertilizationController {
        &mut self.fertilization
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn command_count(&self) -> u32 {
        self.command_count
    }

    pub fn last_npk(&self) -> Option<Npk> {
        self.last_npk
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, AgentError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()).into())
}
