//! Background event reader and read arbitration
//!
//! Exactly one party reads the device at a time: either the event thread
//! or a synchronous caller holding an [`EventLock`](crate::EventLock).
//!
//! ```text
//!   caller                         event thread
//!   ------                         ------------
//!   gate.paused += 1               wait on gate until paused == 0
//!   wakeup.signal() ────────────▶  lock read_lock
//!   lock read_lock  (blocks)       poll(device, wakeup) ── woken ──┐
//!        ...                       drain wakeup, unlock            │
//!   <exclusive reads>  ◀───────────────────────────────────────────┘
//!   unlock, gate.paused -= 1 ───▶  resumes
//! ```
//!
//! Stopping uses the same wakeup eventfd, so a thread blocked in `poll`
//! with no incoming data still exits promptly.

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::device::{RawDevice, HID_MAX_BUFFER_SIZE};
use crate::error::{HidrawError, Result};
use crate::hidpp::Frame;
use crate::session::Shared;
use crate::types::EventLoopState;

// ============================================================================
// Wakeup channel
// ============================================================================

/// eventfd used to interrupt a blocked `poll`
pub(crate) struct Wakeup(EventFd);

impl Wakeup {
    fn new() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self(fd))
    }

    pub(crate) fn signal(&self) {
        if let Err(e) = self.0.arm() {
            warn!("Failed to signal wakeup eventfd: {}", e);
        }
    }

    /// Reset the counter. Only the holder of the read lock drains.
    pub(crate) fn drain(&self) -> Result<()> {
        match self.0.read() {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for Wakeup {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

pub(crate) enum Readiness {
    /// An input report is pending
    Data,
    /// The wakeup channel fired
    Wakeup,
    /// The device went away
    Hangup,
}

/// Block until the device is readable or the wakeup channel fires.
///
/// The wakeup channel takes priority so that stop requests are never
/// starved by a chatty device.
pub(crate) fn wait_readable(device: &dyn RawDevice, wakeup: &Wakeup) -> Result<Readiness> {
    loop {
        let mut fds = [
            PollFd::new(device.as_fd(), PollFlags::POLLIN),
            PollFd::new(wakeup.as_fd(), PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let woken = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        if woken {
            return Ok(Readiness::Wakeup);
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            return Ok(Readiness::Data);
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Ok(Readiness::Hangup);
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct Gate {
    /// Synchronous callers waiting for or holding the read lock
    paused: usize,
    /// The event thread must exit
    stopping: bool,
}

/// Read arbitration between the event thread and synchronous callers
pub(crate) struct Coordinator {
    read_lock: ReentrantMutex<()>,
    gate: Mutex<Gate>,
    resume: Condvar,
    pub(crate) wakeup: Wakeup,
    /// Bumped by stop/close; a direct read started under an older epoch
    /// is cancelled at its next wakeup
    cancel_epoch: AtomicU64,
}

impl Coordinator {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            read_lock: ReentrantMutex::new(()),
            gate: Mutex::new(Gate {
                paused: 0,
                stopping: false,
            }),
            resume: Condvar::new(),
            wakeup: Wakeup::new()?,
            cancel_epoch: AtomicU64::new(0),
        })
    }

    /// Take the read side away from the event thread.
    ///
    /// Must be balanced by `resume` after the guard is dropped.
    pub(crate) fn pause(&self) -> ReentrantMutexGuard<'_, ()> {
        self.gate.lock().paused += 1;
        self.wakeup.signal();
        self.read_lock.lock()
    }

    pub(crate) fn resume(&self) {
        let mut gate = self.gate.lock();
        gate.paused -= 1;
        if gate.paused == 0 {
            self.resume.notify_all();
        }
    }

    pub(crate) fn held_by_current_thread(&self) -> bool {
        self.read_lock.is_owned_by_current_thread()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::SeqCst)
    }

    /// Interrupt blocked direct reads
    pub(crate) fn cancel_reads(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.wakeup.signal();
    }

    fn request_stop(&self) {
        self.gate.lock().stopping = true;
        self.resume.notify_all();
        self.wakeup.signal();
    }

    fn reset_stop(&self) {
        self.gate.lock().stopping = false;
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// A queued HID++ request waiting for its response
pub(crate) struct Exchange {
    pub(crate) request: Frame,
    pub(crate) reply: Reply,
}

/// Slot a caller blocks on until the event thread answers its exchange
pub(crate) struct ReplySlot {
    value: Mutex<Option<Result<Frame>>>,
    ready: Condvar,
}

impl ReplySlot {
    pub(crate) fn wait(&self) -> Result<Frame> {
        let mut value = self.value.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            self.ready.wait(&mut value);
        }
    }

    fn fill(&self, result: Result<Frame>) {
        *self.value.lock() = Some(result);
        self.ready.notify_one();
    }
}

/// Event thread side of a [`ReplySlot`]. Answers `Cancelled` if dropped
/// unanswered.
pub(crate) struct Reply(Option<Arc<ReplySlot>>);

impl Reply {
    pub(crate) fn send(mut self, result: Result<Frame>) {
        if let Some(slot) = self.0.take() {
            slot.fill(result);
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(slot) = self.0.take() {
            slot.fill(Err(HidrawError::Cancelled));
        }
    }
}

pub(crate) fn reply_slot() -> (Reply, Arc<ReplySlot>) {
    let slot = Arc::new(ReplySlot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (Reply(Some(Arc::clone(&slot))), slot)
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    pub(crate) state: EventLoopState,
    handle: Option<JoinHandle<()>>,
    worker: Option<ThreadId>,
    /// Exchanges handed to the event thread, not yet written
    pub(crate) queue: Vec<Exchange>,
}

impl Lifecycle {
    /// Whether the calling thread is the event thread
    pub(crate) fn on_worker(&self) -> bool {
        self.worker == Some(thread::current().id())
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("Event thread panicked");
    }
}

pub(crate) fn start(shared: &Arc<Shared>) -> Result<()> {
    // The event thread itself only exists while running
    if shared.lifecycle.lock().on_worker() {
        return Err(HidrawError::AlreadyStarted);
    }

    let _control = shared.control.lock();
    shared.ensure_open()?;
    let device = shared.device()?;

    // Reap a thread that exited on its own (device gone)
    let finished = {
        let mut lifecycle = shared.lifecycle.lock();
        if matches!(
            lifecycle.state,
            EventLoopState::Running | EventLoopState::StopRequested
        ) {
            return Err(HidrawError::AlreadyStarted);
        }
        lifecycle.handle.take()
    };
    if let Some(handle) = finished {
        join_worker(handle);
    }

    shared.coordinator.reset_stop();

    // Hold the lifecycle lock across spawn so the thread cannot record its
    // exit before we record its start
    let mut lifecycle = shared.lifecycle.lock();
    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(shared.config.thread_name.clone())
        .spawn(move || run(worker_shared, device))
        .map_err(HidrawError::Io)?;

    lifecycle.worker = Some(handle.thread().id());
    lifecycle.handle = Some(handle);
    lifecycle.state = EventLoopState::Running;
    debug!("Event loop started");
    Ok(())
}

pub(crate) fn stop(shared: &Shared) -> Result<()> {
    shared.coordinator.cancel_reads();

    {
        // From a report handler or under an EventLock the thread cannot be
        // joined here. It exits once the read lock is released and is
        // reaped by the next start/stop.
        let mut lifecycle = shared.lifecycle.lock();
        if lifecycle.on_worker() || shared.coordinator.held_by_current_thread() {
            if lifecycle.state == EventLoopState::Running {
                lifecycle.state = EventLoopState::StopRequested;
            }
            drop(lifecycle);
            shared.coordinator.request_stop();
            debug!("Stop requested without join");
            return Ok(());
        }
    }

    let _control = shared.control.lock();
    let handle = {
        let mut lifecycle = shared.lifecycle.lock();
        match lifecycle.state {
            EventLoopState::Running | EventLoopState::StopRequested => {
                lifecycle.state = EventLoopState::StopRequested;
                lifecycle.handle.take()
            }
            EventLoopState::NotStarted | EventLoopState::Stopped => {
                let finished = lifecycle.handle.take();
                drop(lifecycle);
                if let Some(handle) = finished {
                    join_worker(handle);
                }
                return Ok(());
            }
        }
    };

    shared.coordinator.request_stop();
    if let Some(handle) = handle {
        join_worker(handle);
    }
    shared.lifecycle.lock().state = EventLoopState::Stopped;
    debug!("Event loop stopped");
    Ok(())
}

// ============================================================================
// Event thread
// ============================================================================

enum Exit {
    Stopped,
    Disconnected,
    Failed(HidrawError),
}

fn run(shared: Arc<Shared>, device: Arc<dyn RawDevice>) {
    debug!("Event thread started");
    let coord = &shared.coordinator;
    let mut pending: Vec<Exchange> = Vec::new();
    let mut buf = vec![0u8; HID_MAX_BUFFER_SIZE];

    let exit = loop {
        {
            let mut gate = coord.gate.lock();
            while gate.paused > 0 && !gate.stopping {
                coord.resume.wait(&mut gate);
            }
            if gate.stopping {
                break Exit::Stopped;
            }
        }

        let _read = coord.read_lock.lock();
        {
            let gate = coord.gate.lock();
            if gate.stopping {
                break Exit::Stopped;
            }
            if gate.paused > 0 {
                continue;
            }
        }

        submit_exchanges(&shared, device.as_ref(), &mut pending);

        match wait_readable(device.as_ref(), &coord.wakeup) {
            Ok(Readiness::Data) => {}
            Ok(Readiness::Wakeup) => {
                if let Err(e) = coord.wakeup.drain() {
                    break Exit::Failed(e);
                }
                continue;
            }
            Ok(Readiness::Hangup) => break Exit::Disconnected,
            Err(e) => break Exit::Failed(e),
        }

        let len = match device.read(&mut buf) {
            Ok(0) => break Exit::Disconnected,
            Ok(n) => n,
            Err(e) => match HidrawError::from(e) {
                HidrawError::Disconnected => break Exit::Disconnected,
                other => break Exit::Failed(other),
            },
        };

        // Dispatch under the read lock: no synchronous transaction runs
        // while a handler sees a report. Handlers calling back into the
        // session re-enter the lock on this thread.
        route(&shared, &mut pending, &buf[..len]);
    };

    finish(&shared, pending, exit);
}

/// Write the requests of newly queued exchanges
fn submit_exchanges(shared: &Shared, device: &dyn RawDevice, pending: &mut Vec<Exchange>) {
    let queued = std::mem::take(&mut shared.lifecycle.lock().queue);
    for exchange in queued {
        let bytes = exchange.request.to_bytes();
        trace!("Exchange request {:02X?}", bytes);
        match device.write(&bytes) {
            Ok(n) if n == bytes.len() => pending.push(exchange),
            Ok(n) => {
                exchange.reply.send(Err(HidrawError::ShortTransfer {
                    expected: bytes.len(),
                    actual: n,
                }));
            }
            Err(e) => {
                exchange.reply.send(Err(e.into()));
            }
        }
    }
}

/// Hand a report to the exchange waiting for it, or to the handler
fn route(shared: &Shared, pending: &mut Vec<Exchange>, data: &[u8]) {
    if !pending.is_empty() {
        if let Ok(frame) = Frame::parse(data) {
            if let Some(pos) = pending.iter().position(|x| frame.answers(&x.request)) {
                let exchange = pending.remove(pos);
                trace!("Exchange response {:02X?}", data);
                exchange.reply.send(frame.into_result().map_err(HidrawError::from));
                return;
            }
        }
    }

    if let Err(HidrawError::NoHandlerBound) = shared.dispatch(data) {
        trace!("No handler for report {:02X?}", data);
    }
}

fn finish(shared: &Shared, pending: Vec<Exchange>, exit: Exit) {
    match &exit {
        Exit::Stopped => debug!("Event thread stopping"),
        Exit::Disconnected => warn!("Device disconnected, event thread exiting"),
        Exit::Failed(e) => warn!("Event thread failed: {}", e),
    }

    let queued = {
        let mut lifecycle = shared.lifecycle.lock();
        lifecycle.state = EventLoopState::Stopped;
        lifecycle.worker = None;
        std::mem::take(&mut lifecycle.queue)
    };

    for exchange in pending.into_iter().chain(queued) {
        let err = match exit {
            Exit::Stopped => HidrawError::Cancelled,
            Exit::Disconnected | Exit::Failed(_) => HidrawError::Disconnected,
        };
        exchange.reply.send(Err(err));
    }
}
