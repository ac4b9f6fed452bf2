pub mod frame;
pub mod transport;
pub mod vocabulary;

pub use frame::{AddressingMode, Frame, MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, MAX_STANDARD_ID};
pub use transport::{BaudRate, BusHandle, BusStatistics, BusStatus, BusTransport, BITS_PER_FRAME, MAX_ACCEPT_FILTERS};
pub use vocabulary::{ActuatorCommand, ActuatorKind, CommandCode, SensorKind, SensorReading};
