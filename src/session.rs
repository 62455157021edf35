//! HID++ hidraw session
//!
//! A [`Session`] owns one hidraw node and coordinates everything that
//! touches it: synchronous report requests, direct input reads, output
//! writes, and the optional background event loop that forwards
//! unsolicited reports to a handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::descriptor::ReportRegistry;
use crate::device::{Hidraw, RawDevice, HID_MAX_BUFFER_SIZE};
use crate::error::{HidrawError, Result};
use crate::event_loop::{
    self, reply_slot, wait_readable, Coordinator, Exchange, Lifecycle, Readiness,
};
use crate::hidpp::{parse_error_report, Frame};
use crate::types::{
    DeviceDescriptor, DeviceInfo, Direction, EventLoopState, ReportKind, SessionConfig,
    TimestampedReport,
};

/// Receives input reports delivered by the event loop or propagated
/// explicitly.
///
/// Handlers run on the event thread. They may call back into the session
/// (`request`, `transact`, `stop_events`); those calls do not deadlock.
pub trait ReportHandler: Send + Sync {
    fn on_report(&self, report: &[u8]);
}

impl<F> ReportHandler for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_report(&self, report: &[u8]) {
        self(report)
    }
}

/// State shared between the session handle and its event thread
pub(crate) struct Shared {
    device: RwLock<Option<Arc<dyn RawDevice>>>,
    registry: ReportRegistry,
    info: DeviceInfo,
    pub(crate) config: SessionConfig,
    handler: RwLock<Option<Arc<dyn ReportHandler>>>,
    events_tx: broadcast::Sender<TimestampedReport>,
    pub(crate) coordinator: Coordinator,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    /// Serializes start, stop and close
    pub(crate) control: Mutex<()>,
    closed: AtomicBool,
    opened_at: Instant,
}

impl Shared {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HidrawError::Closed);
        }
        Ok(())
    }

    pub(crate) fn device(&self) -> Result<Arc<dyn RawDevice>> {
        self.device.read().clone().ok_or(HidrawError::Closed)
    }

    /// Deliver a report to broadcast subscribers and the bound handler.
    pub(crate) fn dispatch(&self, data: &[u8]) -> Result<()> {
        if self.events_tx.receiver_count() > 0 {
            let _ = self.events_tx.send(TimestampedReport {
                timestamp: self.opened_at.elapsed().as_secs_f64(),
                data: data.to_vec(),
            });
        }

        // Clone out so a handler may rebind itself
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler.on_report(data);
                Ok(())
            }
            None => Err(HidrawError::NoHandlerBound),
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 || len > HID_MAX_BUFFER_SIZE {
        return Err(HidrawError::InvalidLength {
            len,
            max: HID_MAX_BUFFER_SIZE,
        });
    }
    Ok(())
}

/// An open hidraw session.
///
/// All methods take `&self`; a session can be shared across threads
/// behind an `Arc`. Dropping the session closes it.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Open the hidraw node named by `descriptor` with default settings.
    pub fn open(descriptor: &DeviceDescriptor) -> Result<Self> {
        Self::open_with_config(descriptor, SessionConfig::default())
    }

    pub fn open_with_config(descriptor: &DeviceDescriptor, config: SessionConfig) -> Result<Self> {
        let device = Hidraw::open(&descriptor.devnode)?;
        let info = device.info()?;
        let registry = device.report_registry()?;
        debug!(
            "Session on {} ({:04X}:{:04X}, bus 0x{:02X})",
            descriptor.devnode.display(),
            info.vendor_id,
            info.product_id,
            info.bus_type
        );
        Self::from_parts(Arc::new(device), registry, info, config)
    }

    /// Build a session over an already open device channel.
    ///
    /// `report_descriptor` is parsed exactly as a hidraw node's would be.
    pub fn with_device(
        device: Arc<dyn RawDevice>,
        report_descriptor: &[u8],
        info: DeviceInfo,
        config: SessionConfig,
    ) -> Result<Self> {
        let registry = ReportRegistry::from_descriptor(report_descriptor)?;
        Self::from_parts(device, registry, info, config)
    }

    fn from_parts(
        device: Arc<dyn RawDevice>,
        registry: ReportRegistry,
        info: DeviceInfo,
        config: SessionConfig,
    ) -> Result<Self> {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Shared {
            device: RwLock::new(Some(device)),
            registry,
            info,
            config,
            handler: RwLock::new(None),
            events_tx,
            coordinator: Coordinator::new()?,
            lifecycle: Mutex::new(Lifecycle::default()),
            control: Mutex::new(()),
            closed: AtomicBool::new(false),
            opened_at: Instant::now(),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Stop the event loop and release the device.
    ///
    /// Idempotent. Blocked direct reads return `Cancelled`; later calls
    /// return `Closed`.
    ///
    /// Called from a report handler or while this thread holds an
    /// [`EventLock`], the event thread cannot be joined here: it exits once
    /// the lock is released, and until then `event_loop_state` reports
    /// `StopRequested`.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        event_loop::stop(shared)?;

        // Wait out any synchronous caller still on the device
        shared.coordinator.cancel_reads();
        let read = shared.coordinator.pause();
        let device = shared.device.write().take();
        *shared.handler.write() = None;
        drop(read);
        shared.coordinator.resume();

        drop(device);
        debug!("Session closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// Whether the device declares `report_id`. Always false once closed.
    pub fn has_report(&self, report_id: u8) -> bool {
        self.is_open() && self.shared.registry.contains(report_id)
    }

    /// Declared report ids in descriptor order. Empty once closed.
    pub fn report_ids(&self) -> &[u8] {
        if self.is_open() {
            self.shared.registry.ids()
        } else {
            &[]
        }
    }

    /// GET_REPORT / SET_REPORT on `report_id`.
    ///
    /// On Get the buffer is zeroed, `buf[0]` set to `report_id`, and the
    /// device response copied back. A HID++ error report in the response
    /// is returned as `Protocol`. Pauses the event loop for its duration.
    pub fn request(
        &self,
        report_id: u8,
        buf: &mut [u8],
        kind: ReportKind,
        direction: Direction,
    ) -> Result<usize> {
        self.lock_events()?.request(report_id, buf, kind, direction)
    }

    /// Write an output report. Does not pause the event loop.
    pub fn write_output_report(&self, buf: &[u8]) -> Result<usize> {
        check_len(buf.len())?;
        let device = self.shared.device()?;
        trace!("Output report {:02X?}", buf);
        let written = device.write(buf)?;
        if written != buf.len() {
            return Err(HidrawError::ShortTransfer {
                expected: buf.len(),
                actual: written,
            });
        }
        Ok(written)
    }

    /// Block until one input report arrives and copy it into `buf`.
    ///
    /// Returns the full report length, which may exceed `buf.len()` (the
    /// copy is truncated). With `propagate`, the report is also delivered
    /// to the handler. Returns `Cancelled` if `stop_events` or `close`
    /// interrupts the wait.
    pub fn read_input_report(&self, buf: &mut [u8], propagate: bool) -> Result<usize> {
        let epoch = self.shared.coordinator.epoch();
        self.lock_events()?
            .read_input_report_since(buf, propagate, epoch)
    }

    /// Start the background event loop.
    pub fn start_events(&self) -> Result<()> {
        event_loop::start(&self.shared)
    }

    /// Stop the event loop and wait for its thread to exit.
    ///
    /// Also interrupts any blocked direct read, whether or not the loop is
    /// running. A no-op otherwise.
    pub fn stop_events(&self) -> Result<()> {
        event_loop::stop(&self.shared)
    }

    pub fn event_loop_state(&self) -> EventLoopState {
        self.shared.lifecycle.lock().state
    }

    /// Pause event dispatch and take exclusive read access to the device.
    ///
    /// Dispatch resumes when the returned guard is dropped. Session calls
    /// made from the holding thread run under the same lock.
    pub fn lock_events(&self) -> Result<EventLock<'_>> {
        self.shared.ensure_open()?;
        let read = self.shared.coordinator.pause();
        Ok(EventLock {
            shared: &self.shared,
            read: Some(read),
        })
    }

    /// Send a HID++ request and wait for the matching response.
    ///
    /// Non-matching reports received meanwhile are dispatched as usual.
    /// With the event loop running the exchange is handed to the event
    /// thread; otherwise the caller reads the response directly.
    pub fn transact(&self, request: &Frame) -> Result<Frame> {
        self.shared.ensure_open()?;

        let queued = {
            let mut lifecycle = self.shared.lifecycle.lock();
            // A caller already holding the read lock (a handler, or an
            // EventLock owner) would wait on a paused event thread
            let queue = lifecycle.state == EventLoopState::Running
                && !self.shared.coordinator.held_by_current_thread();
            if queue {
                let (reply, slot) = reply_slot();
                lifecycle.queue.push(Exchange {
                    request: *request,
                    reply,
                });
                Some(slot)
            } else {
                None
            }
        };

        match queued {
            Some(slot) => {
                self.shared.coordinator.wakeup.signal();
                slot.wait()
            }
            None => self.lock_events()?.transact(request),
        }
    }

    /// Deliver `report` to the bound handler (and subscribers) as if it had
    /// been read from the device.
    pub fn propagate(&self, report: &[u8]) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.dispatch(report)
    }

    pub fn set_handler<H: ReportHandler + 'static>(&self, handler: H) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *self.shared.handler.write() = None;
    }

    /// Subscribe to every dispatched report.
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedReport> {
        self.shared.events_tx.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Exclusive read access to the device, with event dispatch paused.
pub struct EventLock<'a> {
    shared: &'a Shared,
    read: Option<ReentrantMutexGuard<'a, ()>>,
}

impl EventLock<'_> {
    /// Release the lock and resume event dispatch.
    pub fn unlock(self) {}

    /// Same as [`Session::request`], under this lock.
    pub fn request(
        &self,
        report_id: u8,
        buf: &mut [u8],
        kind: ReportKind,
        direction: Direction,
    ) -> Result<usize> {
        check_len(buf.len())?;
        let device = self.shared.device()?;

        match direction {
            Direction::Get => {
                buf.fill(0);
                buf[0] = report_id;
                let len = device.get_report(kind, buf)?.min(buf.len());
                trace!("GET_REPORT 0x{:02X} -> {:02X?}", report_id, &buf[..len]);
                if let Some(err) = parse_error_report(&buf[..len]) {
                    debug!("Device error: {}", err);
                    return Err(err.into());
                }
                Ok(len)
            }
            Direction::Set => {
                buf[0] = report_id;
                trace!("SET_REPORT {:02X?}", buf);
                Ok(device.set_report(kind, buf)?)
            }
        }
    }

    /// Same as [`Session::read_input_report`], under this lock.
    pub fn read_input_report(&self, buf: &mut [u8], propagate: bool) -> Result<usize> {
        let epoch = self.shared.coordinator.epoch();
        self.read_input_report_since(buf, propagate, epoch)
    }

    fn read_input_report_since(&self, buf: &mut [u8], propagate: bool, epoch: u64) -> Result<usize> {
        check_len(buf.len())?;
        let device = self.shared.device()?;

        let mut report = vec![0u8; HID_MAX_BUFFER_SIZE];
        let len = self.read_report(device.as_ref(), &mut report, epoch)?;
        let report = &report[..len];

        if propagate {
            let _ = self.shared.dispatch(report);
        }

        let copied = len.min(buf.len());
        buf[..copied].copy_from_slice(&report[..copied]);
        Ok(len)
    }

    /// Send `request` and read until the matching response, dispatching
    /// everything else.
    pub fn transact(&self, request: &Frame) -> Result<Frame> {
        let device = self.shared.device()?;
        let epoch = self.shared.coordinator.epoch();

        let bytes = request.to_bytes();
        trace!("Exchange request {:02X?}", bytes);
        let written = device.write(&bytes)?;
        if written != bytes.len() {
            return Err(HidrawError::ShortTransfer {
                expected: bytes.len(),
                actual: written,
            });
        }

        let mut buf = vec![0u8; HID_MAX_BUFFER_SIZE];
        loop {
            let len = self.read_report(device.as_ref(), &mut buf, epoch)?;
            let data = &buf[..len];
            if let Ok(frame) = Frame::parse(data) {
                if frame.answers(request) {
                    trace!("Exchange response {:02X?}", data);
                    return frame.into_result().map_err(HidrawError::from);
                }
            }
            let _ = self.shared.dispatch(data);
        }
    }

    /// One blocking read, interruptible through the wakeup channel.
    fn read_report(&self, device: &dyn RawDevice, buf: &mut [u8], epoch: u64) -> Result<usize> {
        let coord = &self.shared.coordinator;
        loop {
            // A stop may have landed while this caller queued for the lock,
            // its wakeup drained by the previous holder
            if coord.epoch() != epoch {
                return Err(HidrawError::Cancelled);
            }
            match wait_readable(device, &coord.wakeup)? {
                Readiness::Data => {
                    let len = device.read(buf)?;
                    if len == 0 {
                        return Err(HidrawError::Disconnected);
                    }
                    return Ok(len);
                }
                Readiness::Wakeup => {
                    coord.wakeup.drain()?;
                    if coord.epoch() != epoch {
                        return Err(HidrawError::Cancelled);
                    }
                }
                Readiness::Hangup => return Err(HidrawError::Disconnected),
            }
        }
    }
}

impl Drop for EventLock<'_> {
    fn drop(&mut self) {
        self.read.take();
        self.shared.coordinator.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_length_bounds() {
        assert!(check_len(1).is_ok());
        assert!(check_len(HID_MAX_BUFFER_SIZE).is_ok());
        assert!(matches!(
            check_len(0),
            Err(HidrawError::InvalidLength { len: 0, .. })
        ));
        assert!(matches!(
            check_len(HID_MAX_BUFFER_SIZE + 1),
            Err(HidrawError::InvalidLength { max: HID_MAX_BUFFER_SIZE, .. })
        ));
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |report: &[u8]| sink.lock().push(report.to_vec());
        handler.on_report(&[0x10, 0xFF]);
        assert_eq!(*seen.lock(), vec![vec![0x10, 0xFF]]);
    }
}
