//! HID++ link-layer envelope
//!
//! Only the generic envelope lives here: report ids, frame lengths,
//! device-index sentinels, register access opcodes and the error report.
//! Feature-specific payloads are the business of the driver above.
//!
//! ```text
//! short: [0x10][index][sub-id][address][p0 p1 p2]            7 bytes
//! long:  [0x11][index][sub-id][address][p0 .. p15]           20 bytes
//! error: [0x10][index][0x8F][failed sub-id][code][0x00 0x00] 7 bytes
//! ```

use std::fmt;

use thiserror::Error;

use crate::error::DeviceError;

/// HID++ report ids
pub mod report_id {
    /// Short message (7 bytes)
    pub const SHORT: u8 = 0x10;
    /// Long message (20 bytes)
    pub const LONG: u8 = 0x11;
}

/// Device index sentinels
pub mod device_index {
    /// The wireless receiver itself
    pub const RECEIVER: u8 = 0xFF;
    /// A device connected by cable
    pub const WIRED: u8 = 0x00;
}

/// Register access sub-ids. Responses carry the same value as the request.
pub mod register {
    pub const SET_SHORT: u8 = 0x80;
    pub const GET_SHORT: u8 = 0x81;
    pub const SET_LONG: u8 = 0x82;
    pub const GET_LONG: u8 = 0x83;
}

/// Sub-id reserved for error reports
pub const ERROR_MSG: u8 = 0x8F;

pub const SHORT_MESSAGE_LENGTH: usize = 7;
pub const LONG_MESSAGE_LENGTH: usize = 20;

const SHORT_PARAMS: usize = SHORT_MESSAGE_LENGTH - 4;
const LONG_PARAMS: usize = LONG_MESSAGE_LENGTH - 4;

/// Minimum significant length of an error report
const ERROR_MESSAGE_MIN: usize = 5;

/// Device error codes carried by an error report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    InvalidSubId,
    InvalidAddress,
    InvalidValue,
    ConnectFail,
    TooManyDevices,
    AlreadyExists,
    Busy,
    UnknownDevice,
    ResourceError,
    RequestUnavailable,
    InvalidParameterValue,
    WrongPinCode,
    /// Code outside the documented range
    Unknown(u8),
}

impl ErrorCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::InvalidSubId,
            0x02 => Self::InvalidAddress,
            0x03 => Self::InvalidValue,
            0x04 => Self::ConnectFail,
            0x05 => Self::TooManyDevices,
            0x06 => Self::AlreadyExists,
            0x07 => Self::Busy,
            0x08 => Self::UnknownDevice,
            0x09 => Self::ResourceError,
            0x0A => Self::RequestUnavailable,
            0x0B => Self::InvalidParameterValue,
            0x0C => Self::WrongPinCode,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::InvalidSubId => 0x01,
            Self::InvalidAddress => 0x02,
            Self::InvalidValue => 0x03,
            Self::ConnectFail => 0x04,
            Self::TooManyDevices => 0x05,
            Self::AlreadyExists => 0x06,
            Self::Busy => 0x07,
            Self::UnknownDevice => 0x08,
            Self::ResourceError => 0x09,
            Self::RequestUnavailable => 0x0A,
            Self::InvalidParameterValue => 0x0B,
            Self::WrongPinCode => 0x0C,
            Self::Unknown(code) => code,
        }
    }

    /// Canonical name, e.g. `ERR_BUSY`
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "ERR_SUCCESS",
            Self::InvalidSubId => "ERR_INVALID_SUBID",
            Self::InvalidAddress => "ERR_INVALID_ADDRESS",
            Self::InvalidValue => "ERR_INVALID_VALUE",
            Self::ConnectFail => "ERR_CONNECT_FAIL",
            Self::TooManyDevices => "ERR_TOO_MANY_DEVICES",
            Self::AlreadyExists => "ERR_ALREADY_EXISTS",
            Self::Busy => "ERR_BUSY",
            Self::UnknownDevice => "ERR_UNKNOWN_DEVICE",
            Self::ResourceError => "ERR_RESOURCE_ERROR",
            Self::RequestUnavailable => "ERR_REQUEST_UNAVAILABLE",
            Self::InvalidParameterValue => "ERR_INVALID_PARAM_VALUE",
            Self::WrongPinCode => "ERR_WRONG_PIN_CODE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UNKNOWN (0x{code:02X})"),
            other => f.write_str(other.name()),
        }
    }
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        Self::from_u8(code)
    }
}

/// Frame decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty report")]
    Empty,

    #[error("report id 0x{0:02X} is not a HID++ report")]
    UnknownReportId(u8),

    #[error("report 0x{report_id:02X} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        report_id: u8,
        expected: usize,
        actual: usize,
    },
}

/// A decoded HID++ message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Short {
        device_index: u8,
        sub_id: u8,
        address: u8,
        params: [u8; SHORT_PARAMS],
    },
    Long {
        device_index: u8,
        sub_id: u8,
        address: u8,
        params: [u8; LONG_PARAMS],
    },
    /// Error report: `sub_id` is the sub-id of the rejected request
    Error {
        device_index: u8,
        sub_id: u8,
        code: ErrorCode,
    },
}

impl Frame {
    pub fn short(device_index: u8, sub_id: u8, address: u8, params: [u8; SHORT_PARAMS]) -> Self {
        Self::Short {
            device_index,
            sub_id,
            address,
            params,
        }
    }

    pub fn long(device_index: u8, sub_id: u8, address: u8, params: [u8; LONG_PARAMS]) -> Self {
        Self::Long {
            device_index,
            sub_id,
            address,
            params,
        }
    }

    /// Read a short register
    pub fn get_register(device_index: u8, address: u8, params: [u8; SHORT_PARAMS]) -> Self {
        Self::short(device_index, register::GET_SHORT, address, params)
    }

    /// Write a short register
    pub fn set_register(device_index: u8, address: u8, params: [u8; SHORT_PARAMS]) -> Self {
        Self::short(device_index, register::SET_SHORT, address, params)
    }

    /// Read a long register (the request itself is a short message)
    pub fn get_long_register(device_index: u8, address: u8, params: [u8; SHORT_PARAMS]) -> Self {
        Self::short(device_index, register::GET_LONG, address, params)
    }

    /// Write a long register
    pub fn set_long_register(device_index: u8, address: u8, params: [u8; LONG_PARAMS]) -> Self {
        Self::long(device_index, register::SET_LONG, address, params)
    }

    /// Decode a raw report. Trailing bytes past the frame length are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let id = *data.first().ok_or(FrameError::Empty)?;
        match id {
            report_id::SHORT => {
                if data.len() >= ERROR_MESSAGE_MIN && data[2] == ERROR_MSG {
                    return Ok(Self::Error {
                        device_index: data[1],
                        sub_id: data[3],
                        code: ErrorCode::from_u8(data[4]),
                    });
                }
                check_len(id, data, SHORT_MESSAGE_LENGTH)?;
                let mut params = [0u8; SHORT_PARAMS];
                params.copy_from_slice(&data[4..SHORT_MESSAGE_LENGTH]);
                Ok(Self::short(data[1], data[2], data[3], params))
            }
            report_id::LONG => {
                check_len(id, data, LONG_MESSAGE_LENGTH)?;
                let mut params = [0u8; LONG_PARAMS];
                params.copy_from_slice(&data[4..LONG_MESSAGE_LENGTH]);
                Ok(Self::long(data[1], data[2], data[3], params))
            }
            other => Err(FrameError::UnknownReportId(other)),
        }
    }

    pub fn report_id(&self) -> u8 {
        match self {
            Self::Long { .. } => report_id::LONG,
            Self::Short { .. } | Self::Error { .. } => report_id::SHORT,
        }
    }

    pub fn device_index(&self) -> u8 {
        match *self {
            Self::Short { device_index, .. }
            | Self::Long { device_index, .. }
            | Self::Error { device_index, .. } => device_index,
        }
    }

    /// Sub-id of the message. For error reports this is the rejected sub-id.
    pub fn sub_id(&self) -> u8 {
        match *self {
            Self::Short { sub_id, .. } | Self::Long { sub_id, .. } | Self::Error { sub_id, .. } => {
                sub_id
            }
        }
    }

    pub fn address(&self) -> Option<u8> {
        match *self {
            Self::Short { address, .. } | Self::Long { address, .. } => Some(address),
            Self::Error { .. } => None,
        }
    }

    pub fn params(&self) -> &[u8] {
        match self {
            Self::Short { params, .. } => params,
            Self::Long { params, .. } => params,
            Self::Error { .. } => &[],
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Wire length of this frame
    pub fn len(&self) -> usize {
        match self {
            Self::Long { .. } => LONG_MESSAGE_LENGTH,
            Self::Short { .. } | Self::Error { .. } => SHORT_MESSAGE_LENGTH,
        }
    }

    /// Always false: every frame has at least a short message's bytes
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        buf[0] = self.report_id();
        buf[1] = self.device_index();
        match *self {
            Self::Short {
                sub_id,
                address,
                ref params,
                ..
            } => {
                buf[2] = sub_id;
                buf[3] = address;
                buf[4..].copy_from_slice(params);
            }
            Self::Long {
                sub_id,
                address,
                ref params,
                ..
            } => {
                buf[2] = sub_id;
                buf[3] = address;
                buf[4..].copy_from_slice(params);
            }
            Self::Error { sub_id, code, .. } => {
                buf[2] = ERROR_MSG;
                buf[3] = sub_id;
                buf[4] = code.as_u8();
            }
        }
        buf
    }

    /// Whether `self`, read from the device, answers `request`.
    ///
    /// A response echoes device index, sub-id and address; an error report
    /// echoes device index and the rejected sub-id.
    pub fn answers(&self, request: &Frame) -> bool {
        if self.device_index() != request.device_index() {
            return false;
        }
        match self {
            Self::Error { sub_id, .. } => *sub_id == request.sub_id(),
            _ => self.sub_id() == request.sub_id() && self.address() == request.address(),
        }
    }

    /// Turn an error report into a [`DeviceError`]
    pub fn into_result(self) -> Result<Frame, DeviceError> {
        match self {
            Self::Error {
                device_index,
                sub_id,
                code,
            } => Err(DeviceError {
                device_index,
                sub_id,
                code,
            }),
            frame => Ok(frame),
        }
    }
}

fn check_len(report_id: u8, data: &[u8], expected: usize) -> Result<(), FrameError> {
    if data.len() < expected {
        return Err(FrameError::Truncated {
            report_id,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode an error report from raw bytes, if that is what they are.
pub fn parse_error_report(data: &[u8]) -> Option<DeviceError> {
    match Frame::parse(data) {
        Ok(frame) => frame.into_result().err(),
        Err(_) => None,
    }
}
