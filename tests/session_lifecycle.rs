//! Session open/close and event loop lifecycle, against a mock device.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{notification, open_mock, open_mock_with_config, recorder, wait_for};
use hidpp_hidraw::{
    DeviceDescriptor, Direction, EventLoopState, Frame, HidrawError, ReportKind, Session,
    SessionConfig,
};
use parking_lot::Mutex;

// ── open / close ──

#[test]
fn open_nonexistent_node_is_transport_unavailable() {
    let descriptor = DeviceDescriptor::new("/nonexistent/hidraw42");
    match Session::open(&descriptor) {
        Err(HidrawError::TransportUnavailable { path, .. }) => {
            assert_eq!(path, Path::new("/nonexistent/hidraw42"));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("opened a nonexistent node"),
    }
}

#[test]
fn malformed_descriptor_is_rejected() {
    let (device, _peer) = common::mock_pair();
    // Report ID item missing its payload
    let result = Session::with_device(
        device,
        &[0x06, 0x00, 0xFF, 0x85],
        common::receiver_info(),
        SessionConfig::default(),
    );
    assert!(matches!(result, Err(HidrawError::DeviceDescriptor(_))));
}

#[test]
fn open_then_close_leaves_loop_not_running() {
    let (session, _device, _peer) = open_mock();
    assert!(session.is_open());
    assert_eq!(session.event_loop_state(), EventLoopState::NotStarted);
    session.close().unwrap();
    assert!(!session.is_open());
    assert_eq!(session.event_loop_state(), EventLoopState::NotStarted);

    let (session, _device, _peer) = open_mock();
    session.start_events().unwrap();
    session.close().unwrap();
    assert_eq!(session.event_loop_state(), EventLoopState::Stopped);
}

#[test]
fn close_is_idempotent() {
    let (session, _device, _peer) = open_mock();
    session.start_events().unwrap();
    session.close().unwrap();
    session.close().unwrap();
    session.close().unwrap();
}

#[test]
fn operations_after_close_fail_with_closed() {
    let (session, _device, _peer) = open_mock();
    session.close().unwrap();

    let mut buf = [0u8; 7];
    assert!(matches!(
        session.request(0x10, &mut buf, ReportKind::Feature, Direction::Get),
        Err(HidrawError::Closed)
    ));
    assert!(matches!(
        session.write_output_report(&notification(0)),
        Err(HidrawError::Closed)
    ));
    assert!(matches!(
        session.read_input_report(&mut buf, false),
        Err(HidrawError::Closed)
    ));
    assert!(matches!(session.start_events(), Err(HidrawError::Closed)));
    assert!(matches!(
        session.propagate(&notification(0)),
        Err(HidrawError::Closed)
    ));
    assert!(matches!(
        session.transact(&Frame::get_register(0xFF, 0x02, [0; 3])),
        Err(HidrawError::Closed)
    ));
    assert!(matches!(session.lock_events(), Err(HidrawError::Closed)));
    // Stopping a closed session stays harmless
    session.stop_events().unwrap();
}

#[test]
fn device_info_is_kept() {
    let (session, _device, _peer) = open_mock();
    let info = session.device_info();
    assert_eq!(info.vendor_id, 0x046D);
    assert_eq!(info.product_id, 0xC52B);
    assert_eq!(info.bus_type, 0x03);
}

// ── registry ──

#[test]
fn registry_reflects_descriptor() {
    let (session, _device, _peer) = open_mock();
    assert_eq!(session.report_ids(), &[0x10, 0x11]);
    for _ in 0..3 {
        assert!(session.has_report(0x10));
        assert!(session.has_report(0x11));
        assert!(!session.has_report(0x20));
        assert!(!session.has_report(0x00));
    }
}

#[test]
fn registry_released_on_close() {
    let (session, _device, _peer) = open_mock();
    session.close().unwrap();
    assert!(!session.has_report(0x10));
    assert!(session.report_ids().is_empty());
}

// ── start / stop ──

#[test]
fn start_while_running_is_already_started() {
    let (session, _device, _peer) = open_mock();
    session.start_events().unwrap();
    assert_eq!(session.event_loop_state(), EventLoopState::Running);
    assert!(matches!(
        session.start_events(),
        Err(HidrawError::AlreadyStarted)
    ));
    session.stop_events().unwrap();
}

#[test]
fn stop_is_idempotent_and_safe_when_not_started() {
    let (session, _device, _peer) = open_mock();
    session.stop_events().unwrap();
    assert_eq!(session.event_loop_state(), EventLoopState::NotStarted);

    session.start_events().unwrap();
    session.stop_events().unwrap();
    session.stop_events().unwrap();
    assert_eq!(session.event_loop_state(), EventLoopState::Stopped);
}

#[test]
fn loop_can_restart_after_stop() {
    let (session, _device, peer) = open_mock();
    let (seen, handler) = recorder();
    session.set_handler(handler);

    session.start_events().unwrap();
    peer.inject(&notification(1));
    assert!(wait_for(Duration::from_secs(2), || seen.lock().len() == 1));
    session.stop_events().unwrap();

    session.start_events().unwrap();
    peer.inject(&notification(2));
    assert!(wait_for(Duration::from_secs(2), || seen.lock().len() == 2));
    session.stop_events().unwrap();

    assert_eq!(seen.lock()[1], notification(2));
}

#[test]
fn worker_uses_configured_thread_name() {
    let config = SessionConfig {
        thread_name: "hidpp-receiver".into(),
        ..SessionConfig::default()
    };
    let (session, _device, peer) = open_mock_with_config(config);

    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    session.set_handler(move |_: &[u8]| {
        sink.lock().push(thread::current().name().map(str::to_owned));
    });

    session.start_events().unwrap();
    peer.inject(&notification(0));
    assert!(wait_for(Duration::from_secs(2), || !names.lock().is_empty()));
    session.stop_events().unwrap();

    assert_eq!(names.lock()[0].as_deref(), Some("hidpp-receiver"));
}

// ── disconnect ──

#[test]
fn loop_exits_when_device_disappears() {
    let (session, device, peer) = open_mock();
    session.start_events().unwrap();

    device.disconnect();
    peer.inject(&notification(0));

    assert!(wait_for(Duration::from_secs(2), || {
        session.event_loop_state() == EventLoopState::Stopped
    }));
    // Joins the exited thread without complaint
    session.stop_events().unwrap();
    session.close().unwrap();
}

#[test]
fn no_dispatch_after_close() {
    let (session, _device, peer) = open_mock();
    let (seen, handler) = recorder();
    session.set_handler(handler);
    session.start_events().unwrap();

    peer.inject(&notification(1));
    assert!(wait_for(Duration::from_secs(2), || seen.lock().len() == 1));

    session.close().unwrap();
    peer.inject(&notification(2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn dropping_session_stops_worker() {
    let (session, _device, peer) = open_mock();
    let (seen, handler) = recorder();
    session.set_handler(handler);
    session.start_events().unwrap();
    drop(session);

    // The handler was released along with the session
    assert!(wait_for(Duration::from_secs(2), || Arc::strong_count(&seen) == 1));
    drop(peer);
}

#[test]
fn close_from_handler_finishes_once_handler_returns() {
    let (session, _device, peer) = open_mock();
    let session = Arc::new(session);

    let weak = Arc::downgrade(&session);
    session.set_handler(move |_: &[u8]| {
        if let Some(session) = weak.upgrade() {
            session.close().unwrap();
        }
    });
    session.start_events().unwrap();
    peer.inject(&notification(0));

    assert!(wait_for(Duration::from_secs(2), || !session.is_open()));
    assert!(wait_for(Duration::from_secs(2), || {
        session.event_loop_state() == EventLoopState::Stopped
    }));
}
