use thiserror::Error;

use mowerlink_core::ParseError;

/// Errors surfaced by the BLE link, sequencer and configuration.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Bluetooth is not available on this system")]
    CapabilityUnavailable,
    #[error("No matching mower found")]
    DeviceNotFound,
    #[error("Device selection was cancelled")]
    UserCancelled,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Already connected or connecting")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("No acknowledgement after {attempts} attempt(s)")]
    AckTimeout { attempts: u32 },
    #[error("No such sequence '{0}'")]
    SequenceNotFound(String),
    #[error("Sequence '{sequence}' failed at step {step} ({command}): {reason}")]
    SequenceStepFailed {
        sequence: String,
        step: usize,
        command: String,
        reason: String,
    },
    #[error("Cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Cannot parse input: {0}")]
    Parse(#[from] ParseError),
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether this error ended a connection attempt (as opposed to a
    /// failure on an established link).
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LinkError::CapabilityUnavailable
                | LinkError::DeviceNotFound
                | LinkError::UserCancelled
                | LinkError::ConnectionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = LinkError::SequenceStepFailed {
            sequence: "emergency-stop".to_string(),
            step: 1,
            command: "blade_off".to_string(),
            reason: "Not connected".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Sequence 'emergency-stop' failed at step 1 (blade_off): Not connected"
        );
        assert!(LinkError::DeviceNotFound.is_connection_error());
        assert!(!LinkError::NotConnected.is_connection_error());
    }
}
