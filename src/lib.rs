//! # AgriBus Field Node
//!
//! Simulation of a precision-agriculture field node: a CAN-style bus segment
//! shared by sensors and actuators, plus irrigation and fertilization
//! controllers that command their hardware over it.
//!
//! ## Features
//!
//! - **Frames and transport**: validated 11/29-bit frames, FIFO queues,
//!   receive filtering and bandwidth estimation
//! - **Irrigation**: zone valves, derived flow and pressure, moisture-driven
//!   automatic runs and daily schedules
//! - **Fertilization**: tank inventory, rate-limited dosing with partial
//!   coverage, nutrient recommendations and variable-rate passes
//! - **Events**: injectable sinks, with `tracing` and in-memory history provided
//! - **Protocol**: newline-delimited JSON commands for the simulator's TCP server
//!
//! ## Quick Start
//!
//! ```rust
//! use agribus::{FieldAgent, SensorFeed};
//! use agribus::actuators::{Actuator, IrrigationMode};
//!
//! let mut agent = FieldAgent::new().unwrap();
//! agent.start();
//! agent.irrigation_mut().start(IrrigationMode::Automatic);
//!
//! let report = agent.tick(SensorFeed {
//!     soil_moisture_percent: Some(42.0),
//!     npk: None,
//! });
//! assert!(report.auto_irrigation.triggered());
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - frames, payload vocabulary and the shared transport
//! - [`actuators`] - irrigation and fertilization controllers
//! - [`agent`] - per-node orchestrator driven by ticks and commands
//! - [`protocol`] - JSON command/response framing
//! - [`telemetry`] - snapshots for the reporting layer
//! - [`events`] - event records and sinks
//! - [`scheduler`] - daily irrigation triggers
//! - [`config`] - JSON node configuration

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod actuators;
pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod scheduler;
pub mod telemetry;

pub use agent::{FieldAgent, SensorFeed, TickReport};
pub use bus::{AddressingMode, BusHandle, BusTransport, Frame};
pub use config::FieldConfig;
pub use events::{EventHandle, EventLog, EventSink, FieldEvent};
pub use protocol::{Command, CommandResponse, CommandType};
pub use telemetry::FieldSnapshot;
