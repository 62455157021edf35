//! Socketpair-backed stand-in for a hidraw node.
//!
//! The session side reads input reports from one end of a datagram pair
//! and writes output reports to it; the test drives the other end through
//! [`Peer`]. GET/SET_REPORT requests are answered from a script.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hidpp_hidraw::{DeviceInfo, RawDevice, ReportKind, Session, SessionConfig};
use parking_lot::Mutex;

/// HID++ receiver: vendor collections for short (0x10) and long (0x11)
/// reports
pub const DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xFF, // Usage Page (Vendor 0xFF00)
    0x09, 0x01, // Usage (1)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x10, //   Report ID (0x10)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x06, //   Report Count (6)
    0x15, 0x00, //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x09, 0x01, //   Usage (1)
    0x81, 0x00, //   Input
    0x09, 0x01, //   Usage (1)
    0x91, 0x00, //   Output
    0xC0, // End Collection
    0x06, 0x00, 0xFF, // Usage Page (Vendor 0xFF00)
    0x09, 0x02, // Usage (2)
    0xA1, 0x01, // Collection (Application)
    0x85, 0x11, //   Report ID (0x11)
    0x75, 0x08, //   Report Size (8)
    0x95, 0x13, //   Report Count (19)
    0x09, 0x02, //   Usage (2)
    0x81, 0x00, //   Input
    0x09, 0x02, //   Usage (2)
    0x91, 0x00, //   Output
    0xC0, // End Collection
];

pub struct MockDevice {
    sock: UnixDatagram,
    replies: Mutex<VecDeque<Vec<u8>>>,
    /// Buffers handed to GET_REPORT, as the device saw them
    pub get_calls: Mutex<Vec<(ReportKind, Vec<u8>)>>,
    /// Buffers handed to SET_REPORT
    pub set_calls: Mutex<Vec<(ReportKind, Vec<u8>)>>,
    disconnected: AtomicBool,
}

impl MockDevice {
    /// Queue the bytes the next GET_REPORT returns.
    pub fn script_reply(&self, reply: &[u8]) {
        self.replies.lock().push_back(reply.to_vec());
    }

    /// Make every further operation fail like an unplugged device.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn check_connected(&self) -> io::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(())
    }
}

impl AsFd for MockDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl RawDevice for MockDevice {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_connected()?;
        self.sock.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_connected()?;
        self.sock.send(buf)
    }

    fn get_report(&self, kind: ReportKind, buf: &mut [u8]) -> io::Result<usize> {
        self.check_connected()?;
        self.get_calls.lock().push((kind, buf.to_vec()));
        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }

    fn set_report(&self, kind: ReportKind, buf: &[u8]) -> io::Result<usize> {
        self.check_connected()?;
        self.set_calls.lock().push((kind, buf.to_vec()));
        Ok(buf.len())
    }
}

/// The device side of the pair
#[derive(Clone)]
pub struct Peer {
    sock: Arc<UnixDatagram>,
}

impl Peer {
    /// Deliver an input report to the session.
    pub fn inject(&self, report: &[u8]) {
        self.sock.send(report).expect("inject report");
    }

    /// Next report the session wrote.
    pub fn recv_written(&self) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let len = self.sock.recv(&mut buf).expect("receive written report");
        buf[..len].to_vec()
    }

    pub fn recv_written_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.sock.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0u8; 4096];
        let result = self.sock.recv(&mut buf).ok().map(|len| buf[..len].to_vec());
        self.sock.set_read_timeout(None).ok()?;
        result
    }
}

pub fn mock_pair() -> (Arc<MockDevice>, Peer) {
    let (ours, theirs) = UnixDatagram::pair().expect("socketpair");
    let device = Arc::new(MockDevice {
        sock: ours,
        replies: Mutex::new(VecDeque::new()),
        get_calls: Mutex::new(Vec::new()),
        set_calls: Mutex::new(Vec::new()),
        disconnected: AtomicBool::new(false),
    });
    let peer = Peer {
        sock: Arc::new(theirs),
    };
    (device, peer)
}

pub fn receiver_info() -> DeviceInfo {
    DeviceInfo {
        bus_type: 0x03,
        vendor_id: 0x046D,
        product_id: 0xC52B,
        devnode: None,
    }
}

pub fn open_mock_with_config(config: SessionConfig) -> (Session, Arc<MockDevice>, Peer) {
    let (device, peer) = mock_pair();
    let session = Session::with_device(device.clone(), DESCRIPTOR, receiver_info(), config)
        .expect("session over mock device");
    (session, device, peer)
}

pub fn open_mock() -> (Session, Arc<MockDevice>, Peer) {
    open_mock_with_config(SessionConfig::default())
}

/// Handler that records every report it sees
pub fn recorder() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl Fn(&[u8]) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |report: &[u8]| sink.lock().push(report.to_vec()))
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Short HID++ notification (sub-id 0x41, device connection)
pub fn notification(seq: u8) -> [u8; 7] {
    [0x10, 0x01, 0x41, 0x04, seq, 0x00, 0x00]
}
