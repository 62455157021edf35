//! Raw device access
//!
//! `RawDevice` is the seam between the session and the OS: one blocking
//! read of an input report, one write of an output report, and the get/set
//! report requests. `Hidraw` implements it over `/dev/hidrawN`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::descriptor::ReportRegistry;
use crate::error::{HidrawError, Result};
use crate::types::{DeviceInfo, ReportKind};

/// Largest report buffer the HID core accepts
pub const HID_MAX_BUFFER_SIZE: usize = 4096;

/// Largest report descriptor the kernel hands out
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

/// A device-bound report channel.
///
/// The file descriptor returned by `as_fd` must become readable when an
/// input report is pending; the session polls it alongside its wakeup
/// channel before calling `read`.
pub trait RawDevice: AsFd + Send + Sync {
    /// Read one input report. Returns the report length.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one output report (`buf[0]` is the report id).
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// GET_REPORT: `buf[0]` holds the report id on entry and the report on
    /// return. Returns the number of bytes transferred.
    fn get_report(&self, kind: ReportKind, buf: &mut [u8]) -> io::Result<usize>;

    /// SET_REPORT: `buf[0]` is the report id.
    fn set_report(&self, kind: ReportKind, buf: &[u8]) -> io::Result<usize>;
}

/// hidraw ioctls, from linux/hidraw.h
mod ioctl {
    use super::HID_MAX_DESCRIPTOR_SIZE;

    #[repr(C)]
    #[derive(Default)]
    pub struct HidrawDevinfo {
        pub bustype: u32,
        pub vendor: i16,
        pub product: i16,
    }

    #[repr(C)]
    pub struct HidrawReportDescriptor {
        pub size: u32,
        pub value: [u8; HID_MAX_DESCRIPTOR_SIZE],
    }

    pub const HIDRAW_MAGIC: u8 = b'H';

    nix::ioctl_read!(hidiocgrdescsize, HIDRAW_MAGIC, 0x01, libc::c_int);
    nix::ioctl_read!(hidiocgrdesc, HIDRAW_MAGIC, 0x02, HidrawReportDescriptor);
    nix::ioctl_read!(hidiocgrawinfo, HIDRAW_MAGIC, 0x03, HidrawDevinfo);
    nix::ioctl_readwrite_buf!(hidiocsfeature, HIDRAW_MAGIC, 0x06, u8);
    nix::ioctl_readwrite_buf!(hidiocgfeature, HIDRAW_MAGIC, 0x07, u8);
    nix::ioctl_readwrite_buf!(hidiocsinput, HIDRAW_MAGIC, 0x09, u8);
    nix::ioctl_readwrite_buf!(hidiocginput, HIDRAW_MAGIC, 0x0A, u8);
    nix::ioctl_readwrite_buf!(hidiocsoutput, HIDRAW_MAGIC, 0x0B, u8);
    nix::ioctl_readwrite_buf!(hidiocgoutput, HIDRAW_MAGIC, 0x0C, u8);
}

use ioctl::{HidrawDevinfo, HidrawReportDescriptor};

/// An open `/dev/hidrawN` node
pub struct Hidraw {
    file: File,
    path: PathBuf,
}

impl Hidraw {
    /// Open a hidraw node read/write and check that it answers hidraw ioctls.
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable = |source: io::Error| HidrawError::TransportUnavailable {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(unavailable)?;

        let device = Self {
            file,
            path: path.to_path_buf(),
        };
        device.raw_info().map_err(unavailable)?;
        debug!("Opened {}", path.display());
        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw_info(&self) -> io::Result<HidrawDevinfo> {
        let mut info = HidrawDevinfo::default();
        // SAFETY: `info` is a properly sized, writable HidrawDevinfo.
        unsafe { ioctl::hidiocgrawinfo(self.file.as_raw_fd(), &mut info) }?;
        Ok(info)
    }

    /// Bus, vendor and product of the node
    pub fn info(&self) -> Result<DeviceInfo> {
        let info = self.raw_info()?;
        Ok(DeviceInfo {
            bus_type: info.bustype,
            vendor_id: info.vendor as u16,
            product_id: info.product as u16,
            devnode: Some(self.path.clone()),
        })
    }

    /// Raw report descriptor bytes
    pub fn report_descriptor(&self) -> Result<Vec<u8>> {
        let fd = self.file.as_raw_fd();
        let mut size: libc::c_int = 0;
        // SAFETY: `size` is a writable c_int.
        unsafe { ioctl::hidiocgrdescsize(fd, &mut size) }
            .map_err(|e| HidrawError::DeviceDescriptor(format!("HIDIOCGRDESCSIZE: {e}")))?;

        let size = usize::try_from(size).unwrap_or(0);
        if size > HID_MAX_DESCRIPTOR_SIZE {
            return Err(HidrawError::DeviceDescriptor(format!(
                "descriptor size {size} exceeds {HID_MAX_DESCRIPTOR_SIZE}"
            )));
        }

        let mut desc = Box::new(HidrawReportDescriptor {
            size: size as u32,
            value: [0u8; HID_MAX_DESCRIPTOR_SIZE],
        });
        // SAFETY: `desc` is a writable HidrawReportDescriptor with `size` set.
        unsafe { ioctl::hidiocgrdesc(fd, &mut *desc) }
            .map_err(|e| HidrawError::DeviceDescriptor(format!("HIDIOCGRDESC: {e}")))?;

        Ok(desc.value[..size].to_vec())
    }

    /// Report ids declared by the device
    pub fn report_registry(&self) -> Result<ReportRegistry> {
        ReportRegistry::from_descriptor(&self.report_descriptor()?)
    }
}

impl AsFd for Hidraw {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl RawDevice for Hidraw {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn get_report(&self, kind: ReportKind, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.file.as_raw_fd();
        // SAFETY: the ioctl size is taken from the slice length.
        let rc = unsafe {
            match kind {
                ReportKind::Feature => ioctl::hidiocgfeature(fd, buf),
                ReportKind::Input => ioctl::hidiocginput(fd, buf),
                ReportKind::Output => ioctl::hidiocgoutput(fd, buf),
            }
        }?;
        Ok(rc as usize)
    }

    fn set_report(&self, kind: ReportKind, buf: &[u8]) -> io::Result<usize> {
        let fd = self.file.as_raw_fd();
        // The kernel takes these as read/write ioctls
        let mut data = buf.to_vec();
        // SAFETY: the ioctl size is taken from the slice length.
        let rc = unsafe {
            match kind {
                ReportKind::Feature => ioctl::hidiocsfeature(fd, &mut data),
                ReportKind::Input => ioctl::hidiocsinput(fd, &mut data),
                ReportKind::Output => ioctl::hidiocsoutput(fd, &mut data),
            }
        }?;
        Ok(rc as usize)
    }
}
