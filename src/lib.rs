//! hidraw transport for HID++ peripherals
//!
//! This crate coordinates every access to one `/dev/hidrawN` node:
//!
//! - GET_REPORT / SET_REPORT requests, with HID++ error reports decoded
//! - Output report writes and blocking input report reads
//! - A background event reader that forwards unsolicited reports to a
//!   handler and to broadcast subscribers
//! - Request/response exchanges that keep working while the reader runs
//!
//! Synchronous calls pause the event reader for their duration, so a
//! response is never consumed by the reader and no report is dispatched
//! while a caller owns the device.

pub mod descriptor;
pub mod device;
pub mod error;
pub mod hidpp;
pub mod types;

mod event_loop;
mod session;

pub use descriptor::ReportRegistry;
pub use device::{Hidraw, RawDevice, HID_MAX_BUFFER_SIZE};
pub use error::{DeviceError, HidrawError, Result};
pub use hidpp::{parse_error_report, ErrorCode, Frame, FrameError};
pub use session::{EventLock, ReportHandler, Session};
pub use types::{
    DeviceDescriptor, DeviceInfo, Direction, EventLoopState, ReportKind, SessionConfig,
    TimestampedReport,
};
