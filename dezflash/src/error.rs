//! Error types for dezflash.

use {
    crate::{protocol::command::Opcode, session::SessionState},
    std::{io, time::Duration},
    thiserror::Error,
};

/// Result type for dezflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dezflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial port does not exist or could not be opened.
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// The serial port is already claimed by another process or session.
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// No data arrived before the read deadline.
    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The port reported end-of-stream.
    #[error("Serial stream closed")]
    StreamClosed,

    /// I/O error on the serial port (broken pipe, device unplugged).
    #[error("Transport I/O error: {0}")]
    TransportIo(#[from] io::Error),

    /// Serial port driver error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The bootloader never answered the sync sequence.
    #[error(
        "No response from bootloader after {attempts} sync attempts; hold BOOT, tap RESET and retry"
    )]
    HandshakeTimeout {
        /// Number of sync attempts made.
        attempts: usize,
    },

    /// Malformed frame, invalid escape or mismatched opcode echo.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The bootloader answered a command with a failure status.
    #[error("{command} failed with status 0x{code:02x}: {reason}")]
    CommandFailed {
        /// Command that was rejected.
        command: Opcode,
        /// ROM error code.
        code: u8,
        /// Human-readable reason for the error code.
        reason: &'static str,
    },

    /// A flash block was rejected or never acknowledged.
    #[error("Flash write failed for request {request} at block {block}/{blocks}: {reason}")]
    FlashWrite {
        /// Index of the request within the job.
        request: usize,
        /// 1-based ordinal of the failing block.
        block: usize,
        /// Number of blocks in the request.
        blocks: usize,
        /// Failure reason.
        reason: String,
    },

    /// The caller-supplied job failed validation.
    #[error("Invalid job layout: {0}")]
    InvalidJobLayout(String),

    /// A flash write is already running on this session.
    #[error("Session busy: a flash write is already in progress")]
    SessionBusy,

    /// The session is not in a state that accepts the requested operation.
    #[error("Session not ready (state: {0})")]
    NotReady(SessionState),

    /// Aggregated failure of a flash job.
    #[error("Flash job failed at request {index}: {source}")]
    FlashJobFailed {
        /// Index of the request that failed.
        index: usize,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// No serial device matched the discovery criteria.
    #[error("No serial device found")]
    DeviceNotFound,

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable name of the error kind, suitable for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PortUnavailable(_) => "PortUnavailable",
            Self::PortBusy(_) => "PortBusy",
            Self::ReadTimeout(_) => "ReadTimeout",
            Self::StreamClosed => "StreamClosed",
            Self::TransportIo(_) => "TransportIOError",
            #[cfg(feature = "native")]
            Self::Serial(_) => "TransportIOError",
            Self::HandshakeTimeout { .. } => "HandshakeTimeout",
            Self::Protocol(_) => "ProtocolError",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::FlashWrite { .. } => "FlashWriteError",
            Self::InvalidJobLayout(_) => "InvalidJobLayout",
            Self::SessionBusy => "SessionBusy",
            Self::NotReady(_) => "NotReady",
            Self::FlashJobFailed { .. } => "FlashJobFailed",
            Self::Cancelled => "Cancelled",
            Self::DeviceNotFound => "DeviceNotFound",
            Self::Unsupported(_) => "Unsupported",
            Self::Config(_) => "ConfigError",
        }
    }

    /// Whether the error indicates a problem acquiring or talking to the
    /// physical device rather than a caller mistake.
    pub fn is_device_error(&self) -> bool {
        match self {
            Self::PortUnavailable(_)
            | Self::PortBusy(_)
            | Self::DeviceNotFound
            | Self::HandshakeTimeout { .. }
            | Self::StreamClosed => true,
            Self::FlashJobFailed { source, .. } => source.is_device_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::ReadTimeout(Duration::from_secs(3)).kind(), "ReadTimeout");
        assert_eq!(
            Error::TransportIo(io::Error::from(io::ErrorKind::BrokenPipe)).kind(),
            "TransportIOError"
        );
        assert_eq!(Error::SessionBusy.kind(), "SessionBusy");
        assert_eq!(Error::InvalidJobLayout(String::new()).kind(), "InvalidJobLayout");
    }

    #[test]
    fn test_flash_write_message_names_block() {
        let err = Error::FlashWrite {
            request: 0,
            block: 3,
            blocks: 10,
            reason: "invalid CRC".into(),
        };
        let message = err.to_string();
        assert!(message.contains("block 3/10"));
        assert_eq!(err.kind(), "FlashWriteError");
    }

    #[test]
    fn test_job_failed_wraps_source() {
        let err = Error::FlashJobFailed {
            index: 1,
            source: Box::new(Error::StreamClosed),
        };
        assert!(err.to_string().contains("request 1"));
        assert!(err.is_device_error());
        assert!(std::error::Error::source(&err).is_some());
    }
}
