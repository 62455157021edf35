//! Common types for the session layer

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HidrawError, Result};

/// HID report class (kernel `HID_*_REPORT`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Input,
    Output,
    Feature,
}

impl ReportKind {
    /// Kernel numbering for the report type
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Feature => 2,
        }
    }
}

/// Request direction (kernel `HID_REQ_GET_REPORT` / `HID_REQ_SET_REPORT`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Get,
    Set,
}

/// Event loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLoopState {
    #[default]
    NotStarted,
    Running,
    StopRequested,
    Stopped,
}

/// Names the hidraw node a session binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device node, e.g. `/dev/hidraw3`
    pub devnode: PathBuf,
}

impl DeviceDescriptor {
    pub fn new(devnode: impl Into<PathBuf>) -> Self {
        Self {
            devnode: devnode.into(),
        }
    }

    /// Resolve the hidraw node of a HID device from its sysfs directory
    /// (e.g. `/sys/bus/hid/devices/0003:046D:C52B.0004`).
    pub fn from_hid_sysfs(hid_path: &Path) -> Result<Self> {
        let hidraw_dir = hid_path.join("hidraw");
        let entries = fs::read_dir(&hidraw_dir).map_err(|source| {
            HidrawError::TransportUnavailable {
                path: hidraw_dir.clone(),
                source,
            }
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str.starts_with("hidraw") {
                return Ok(Self::new(Path::new("/dev").join(name_str.as_ref())));
            }
        }

        Err(HidrawError::TransportUnavailable {
            path: hidraw_dir,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no hidraw node"),
        })
    }
}

/// Identity reported by the hidraw node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Bus type (`BUS_USB` = 0x03, `BUS_BLUETOOTH` = 0x05)
    pub bus_type: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device node, if the session was opened from one
    pub devnode: Option<PathBuf>,
}

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the event reader thread
    pub thread_name: String,
    /// Capacity of the report broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thread_name: "hidraw-events".into(),
            event_capacity: 256,
        }
    }
}

/// Input report as seen by broadcast subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedReport {
    /// Seconds since the session was opened
    pub timestamp: f64,
    /// Raw report bytes, report id first
    pub data: Vec<u8>,
}
