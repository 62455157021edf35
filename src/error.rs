//! Session error types

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hidpp::{ErrorCode, FrameError};

/// Error report sent back by a device in place of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError {
    /// Device index the error frame was addressed from
    pub device_index: u8,
    /// Sub-id of the request the device rejected
    pub sub_id: u8,
    /// Device error code
    pub code: ErrorCode,
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "device 0x{:02X} rejected sub-id 0x{:02X}: {}",
            self.device_index, self.sub_id, self.code
        )
    }
}

/// Errors that can occur during session operations
#[derive(Error, Debug)]
pub enum HidrawError {
    // Transport errors
    #[error("Cannot open {}: {source}", path.display())]
    TransportUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Device disconnected")]
    Disconnected,

    // Descriptor errors
    #[error("Report descriptor error: {0}")]
    DeviceDescriptor(String),

    // Device-side rejection
    #[error("Protocol error: {0}")]
    Protocol(DeviceError),

    // Lifecycle errors
    #[error("Event loop already started")]
    AlreadyStarted,

    #[error("Session is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    // Dispatch
    #[error("No report handler bound")]
    NoHandlerBound,

    // Argument errors
    #[error("Invalid buffer length {len} (expected 1..={max})")]
    InvalidLength { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),
}

impl HidrawError {
    /// Connectivity fault (as opposed to a device-side rejection or a
    /// programming error). Callers may choose to retry these.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. }
                | Self::Io(_)
                | Self::ShortTransfer { .. }
                | Self::Disconnected
                | Self::Closed
        )
    }

    /// The device answered with an error frame.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HidrawError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENODEV) | Some(libc::ESHUTDOWN) | Some(libc::EPIPE) => {
                HidrawError::Disconnected
            }
            _ => HidrawError::Io(e),
        }
    }
}

impl From<nix::errno::Errno> for HidrawError {
    fn from(e: nix::errno::Errno) -> Self {
        io::Error::from(e).into()
    }
}

impl From<DeviceError> for HidrawError {
    fn from(e: DeviceError) -> Self {
        HidrawError::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, HidrawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enodev_maps_to_disconnect() {
        let err: HidrawError = io::Error::from_raw_os_error(libc::ENODEV).into();
        assert!(matches!(err, HidrawError::Disconnected));
        assert!(err.is_transport());
    }

    #[test]
    fn test_protocol_error_is_not_transport() {
        let err = HidrawError::Protocol(DeviceError {
            device_index: 0xFF,
            sub_id: 0x81,
            code: ErrorCode::Busy,
        });
        assert!(!err.is_transport());
        assert_eq!(err.device_error().map(|e| e.code), Some(ErrorCode::Busy));
        assert_eq!(
            err.to_string(),
            "Protocol error: device 0xFF rejected sub-id 0x81: ERR_BUSY"
        );
    }
}
