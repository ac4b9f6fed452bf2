use chrono::{DateTime, Utc};
use core::fmt;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::error::FrameError;

pub const MAX_PAYLOAD_LEN: usize = 8;
pub const MAX_STANDARD_ID: u32 = 0x7FF;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

const_assert!(MAX_STANDARD_ID < MAX_EXTENDED_ID);
const_assert!(MAX_PAYLOAD_LEN <= u8::MAX as usize);

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// 11-bit or 29-bit identifier space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AddressingMode {
    #[default]
    Standard,
    Extended,
}

impl AddressingMode {
    pub const fn max_identifier(self) -> u32 {
        match self {
            AddressingMode::Standard => MAX_STANDARD_ID,
            AddressingMode::Extended => MAX_EXTENDED_ID,
        }
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingMode::Standard => write!(f, "Standard"),
            AddressingMode::Extended => write!(f, "Extended"),
        }
    }
}

/// One message on the field bus. Fields are private so a `Frame` can only
/// exist in a validated state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    identifier: u32,
    addressing_mode: AddressingMode,
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(identifier: u32, addressing_mode: AddressingMode, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::InvalidPayloadLength { len: payload.len() });
        }

        if identifier > addressing_mode.max_identifier() {
            return Err(FrameError::IdentifierOutOfRange {
                identifier,
                mode: addressing_mode,
            });
        }

        let payload = Payload::from_slice(payload)
            .map_err(|()| FrameError::InvalidPayloadLength { len: payload.len() })?;

        Ok(Self {
            identifier,
            addressing_mode,
            payload,
            created_at: Utc::now(),
        })
    }

    pub fn standard(identifier: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::new(identifier, AddressingMode::Standard, payload)
    }

    pub fn extended(identifier: u32, payload: &[u8]) -> Result<Self, FrameError> {
        Self::new(identifier, AddressingMode::Extended, payload)
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing_mode
    }

    pub fn is_extended(&self) -> bool {
        self.addressing_mode == AddressingMode::Extended
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Data-length code, always equal to the payload length.
    pub fn dlc(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CAN({} ID=0x{:X}, DLC={}, Data=[",
            self.addressing_mode,
            self.identifier,
            self.dlc()
        )?;
        for (i, byte) in self.payload.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, "])")
    }
}
