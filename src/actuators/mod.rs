pub mod fertilization;
pub mod irrigation;

pub use fertilization::{FertilizationController, FertilizationMode, Npk, Product};
pub use irrigation::{IrrigationController, IrrigationMode};

use serde::Serialize;
use tracing::warn;

use crate::bus::{ActuatorKind, BusHandle, CommandCode};

/// Common surface of the field controllers, read by the agent and the
/// reporting layer.
pub trait Actuator {
    type Mode: Copy;
    type Status: Clone + Serialize;
    type Statistics: Clone + Serialize;

    fn system_id(&self) -> &str;
    fn is_active(&self) -> bool;
    fn mode(&self) -> Self::Mode;
    fn start(&mut self, mode: Self::Mode);
    fn stop(&mut self);
    fn status(&self) -> Self::Status;
    fn statistics(&self) -> Self::Statistics;
}

/// Controllers never fail an operation because the bus refused a frame.
pub(crate) fn publish_command(bus: Option<&BusHandle>, source: &str, kind: ActuatorKind, command: CommandCode, value: u16) {
    let Some(bus) = bus else {
        return;
    };

    if let Err(e) = bus.with(|bus| bus.publish_actuator_command(kind, command, value)) {
        warn!(source = %source, actuator = %kind, command = %command, "command not published: {}", e);
    }
}

/// Scale a physical quantity into the 16-bit command value field.
pub(crate) fn scaled_value(value: f64, scale: f64) -> u16 {
    (value * scale).round() as u16
}
