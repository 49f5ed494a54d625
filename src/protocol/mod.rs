pub mod frame;
pub mod metrics;
pub mod telemetry;
pub mod telesignalization;

use derive_more::{Display, Error};
use strum::{Display as StrumDisplay, EnumIter};

pub use frame::{Frame, FrameError};
pub use telemetry::TelemetryRecord;
pub use telesignalization::TelesignalizationRecord;

/// INFO byte sent with every read request.
pub const REQUEST_INFO: u8 = 0x01;

/// Number of cells in a Seplos pack. Every record carries exactly this many slots.
pub const CELL_COUNT: usize = 16;

/// Number of per-cell temperature sensors.
pub const CELL_TEMPERATURE_COUNT: usize = 4;

/// Read commands understood by the pack. Control commands are never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Telemetry,
    Telesignalization,
}

impl Command {
    /// CID2 code carried in the request header.
    pub fn code(self) -> u8 {
        match self {
            Command::Telemetry => 0x42,
            Command::Telesignalization => 0x44,
        }
    }

    /// Binary payload length of a well-formed response.
    pub fn response_len(self) -> usize {
        match self {
            Command::Telemetry => telemetry::PAYLOAD_LEN,
            Command::Telesignalization => telesignalization::PAYLOAD_LEN,
        }
    }

    /// Encoded request frame for `address`.
    pub fn request(self, address: u8) -> Result<Vec<u8>, FrameError> {
        frame::encode(address, self.code(), &[REQUEST_INFO])
    }
}

/// A validated frame whose payload does not have the layout of its record.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum DecodeError {
    #[display("{command} payload has {actual} bytes, expected {expected}")]
    PayloadLength {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[display("{command} payload reports {actual} cells, expected {expected}")]
    CellCount {
        command: Command,
        expected: usize,
        actual: usize,
    },
}

fn check_payload_len(command: Command, payload: &[u8]) -> Result<(), DecodeError> {
    let expected = command.response_len();
    if payload.len() != expected {
        return Err(DecodeError::PayloadLength {
            command,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn check_cell_count(command: Command, reported: u8) -> Result<(), DecodeError> {
    if reported as usize != CELL_COUNT {
        return Err(DecodeError::CellCount {
            command,
            expected: CELL_COUNT,
            actual: reported as usize,
        });
    }
    Ok(())
}
