//! Error types for protocol parsing

use thiserror::Error;

/// Errors that can occur when decoding or encoding mower packets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Buffer is too short to contain the required data
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Text could not be read as a hex byte string
    #[error("Invalid hex at position {position}: {message}")]
    InvalidHex { position: usize, message: String },

    /// Command name is not part of the known vocabulary
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}
