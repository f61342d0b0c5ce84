use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use super::*;
use crate::damage::Rect;
use crate::hotplug::ChannelHotplug;

/// What the scripted backend saw and what it will report next
#[derive(Default)]
struct MockState {
    pending: VecDeque<SeatNotification>,
    dispatch_errno: Option<i32>,
    disable_errno: Option<i32>,
    open_errno: Option<i32>,
    open: Vec<i32>,
    closed: Vec<i32>,
    /// Enable/Disable acknowledgements in the order the session sent them
    acks: Vec<SeatNotification>,
    switches: Vec<u16>,
    seat_closed: bool,
}

struct MockBackend {
    state: Rc<RefCell<MockState>>,
    seat: String,
    next_id: i32,
    channel: (UnixStream, UnixStream),
}

impl MockBackend {
    fn new(seat: &str) -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        let backend = Self {
            state: state.clone(),
            seat: seat.to_string(),
            next_id: 100,
            channel: UnixStream::pair().unwrap(),
        };
        (backend, state)
    }
}

impl SeatBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Seatd
    }

    fn seat_name(&self) -> &str {
        &self.seat
    }

    fn vt(&self) -> Option<u16> {
        (self.seat == "seat0").then_some(1)
    }

    fn supports_vt(&self) -> bool {
        self.seat == "seat0"
    }

    fn open_device(&mut self, _path: &Path) -> Result<BackendDevice, SessionError> {
        if let Some(code) = self.state.borrow().open_errno {
            return Err(SessionError::backend(
                "open_device",
                std::io::Error::from_raw_os_error(code),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.state.borrow_mut().open.push(id);
        Ok(BackendDevice {
            id,
            fd: 1000 + id,
            dev: 0,
        })
    }

    fn close_device(&mut self, id: i32) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        assert!(!state.closed.contains(&id), "backend id {} closed twice", id);
        state.open.retain(|&open| open != id);
        state.closed.push(id);
        Ok(())
    }

    fn switch_session(&mut self, vt: u16) -> Result<(), SessionError> {
        self.state.borrow_mut().switches.push(vt);
        Ok(())
    }

    fn get_fd(&mut self) -> Result<RawFd, SessionError> {
        Ok(self.channel.0.as_raw_fd())
    }

    fn dispatch(&mut self, out: &mut Vec<SeatNotification>) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        out.extend(state.pending.drain(..));
        match state.dispatch_errno {
            Some(code) => Err(SessionError::backend(
                "dispatch",
                std::io::Error::from_raw_os_error(code),
            )),
            None => Ok(()),
        }
    }

    fn enable_seat(&mut self) -> Result<(), SessionError> {
        self.state.borrow_mut().acks.push(SeatNotification::Enable);
        Ok(())
    }

    fn disable_seat(&mut self) -> Result<(), SessionError> {
        let mut state = self.state.borrow_mut();
        state.acks.push(SeatNotification::Disable);
        match state.disable_errno {
            Some(code) => Err(SessionError::backend(
                "disable_seat",
                std::io::Error::from_raw_os_error(code),
            )),
            None => Ok(()),
        }
    }

    fn close_seat(self: Box<Self>) {
        self.state.borrow_mut().seat_closed = true;
    }
}

const NOW: Option<Duration> = Some(Duration::ZERO);

fn mock_session(seat: &str) -> (Session, Rc<RefCell<MockState>>) {
    let (backend, state) = MockBackend::new(seat);
    (Session::with_backend(Box::new(backend), None), state)
}

fn active_mock_session() -> (Session, Rc<RefCell<MockState>>) {
    let (mut session, state) = mock_session("seat0");
    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();
    assert!(session.is_active());
    (session, state)
}

fn drain(sub: &Subscription) -> Vec<SessionEvent> {
    sub.events.try_iter().collect()
}

#[test]
fn test_daemon_backend_starts_inactive() {
    let (mut session, state) = mock_session("seat0");
    assert_eq!(session.state(), SessionState::Inactive);

    match session.open_device("/dev/dri/card0") {
        Err(SessionError::NotActive) => {}
        other => panic!("expected NotActive, got {:?}", other),
    }
    assert!(state.borrow().open.is_empty());
    assert_eq!(session.device_count(), 0);

    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    assert_eq!(session.dispatch(NOW).unwrap(), 1);
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn test_failed_open_leaves_no_registration() {
    let (mut session, state) = active_mock_session();

    state.borrow_mut().open_errno = Some(libc::ENODEV);
    match session.open_device("/dev/dri/card0") {
        Err(SessionError::Backend { code, .. }) => assert_eq!(code, Some(libc::ENODEV)),
        other => panic!("expected Backend error, got {:?}", other),
    }
    assert_eq!(session.device_count(), 0);

    match session.open_device("/dev/mem") {
        Err(SessionError::PermissionDenied { .. }) => {}
        other => panic!("expected PermissionDenied, got {:?}", other),
    }
    assert_eq!(session.device_count(), 0);
}

#[test]
fn test_device_ids_are_never_reused() {
    let (mut session, _state) = active_mock_session();

    let first = session.open_device("/dev/input/event0").unwrap();
    session.close_device(&first).unwrap();
    let second = session.open_device("/dev/input/event0").unwrap();

    assert_ne!(first.id(), second.id());
    assert!(session.find_device(first.id()).is_none());
    assert_eq!(session.find_device(second.id()), Some(&second));
}

#[test]
fn test_close_is_idempotent() {
    let (mut session, state) = active_mock_session();

    let device = session.open_device("/dev/input/event2").unwrap();
    assert_eq!(session.close_device(&device).unwrap(), CloseOutcome::Closed);
    assert_eq!(
        session.close_device(&device).unwrap(),
        CloseOutcome::AlreadyClosed
    );
    assert_eq!(state.borrow().closed.len(), 1);
    assert_eq!(session.device_count(), 0);
}

#[test]
fn test_disable_revokes_gpu_only() {
    let (mut session, state) = active_mock_session();
    let sub = session.subscribe();

    let gpu = session.open_device("/dev/dri/card0").unwrap();
    let input = session.open_device("/dev/input/event0").unwrap();

    state.borrow_mut().pending.push_back(SeatNotification::Disable);
    session.dispatch(NOW).unwrap();

    assert_eq!(session.state(), SessionState::Inactive);
    assert_eq!(
        state.borrow().acks,
        vec![SeatNotification::Enable, SeatNotification::Disable]
    );
    assert!(session.is_revoked(&gpu));
    assert!(!session.is_revoked(&input));
    assert_eq!(drain(&sub), vec![SessionEvent::Deactivated]);

    // Metadata lookups keep working, hardware access does not
    assert_eq!(session.find_device(input.id()), Some(&input));
    assert!(matches!(
        session.open_device("/dev/dri/card1"),
        Err(SessionError::NotActive)
    ));

    // Closing while inactive is still allowed
    assert_eq!(session.close_device(&input).unwrap(), CloseOutcome::Closed);

    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();
    assert!(!session.is_revoked(&gpu));
    assert_eq!(drain(&sub), vec![SessionEvent::Activated]);
}

#[test]
fn test_notifications_published_in_order() {
    let (mut session, state) = mock_session("seat0");
    let sub = session.subscribe();

    state.borrow_mut().pending.extend([
        SeatNotification::Enable,
        SeatNotification::Disable,
        SeatNotification::Enable,
    ]);
    assert_eq!(session.dispatch(NOW).unwrap(), 3);
    assert_eq!(
        drain(&sub),
        vec![
            SessionEvent::Activated,
            SessionEvent::Deactivated,
            SessionEvent::Activated
        ]
    );
    assert!(session.is_active());
}

#[test]
fn test_transient_dispatch_errors_are_swallowed() {
    let (mut session, state) = mock_session("seat0");

    state.borrow_mut().dispatch_errno = Some(libc::EINTR);
    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    assert_eq!(session.dispatch(NOW).unwrap(), 1);
    assert!(session.is_active());

    state.borrow_mut().dispatch_errno = Some(libc::EAGAIN);
    assert_eq!(session.dispatch(NOW).unwrap(), 0);
}

#[test]
fn test_failed_disable_ack_is_fatal_after_publishing_batch() {
    let (mut session, state) = active_mock_session();
    let sub = session.subscribe();

    state.borrow_mut().disable_errno = Some(libc::EIO);
    state.borrow_mut().pending.extend([
        SeatNotification::Disable,
        SeatNotification::Enable,
    ]);

    match session.dispatch(NOW) {
        Err(SessionError::SeatLost { code, .. }) => assert_eq!(code, Some(libc::EIO)),
        other => panic!("expected SeatLost, got {:?}", other),
    }
    // Nothing received in the failing batch is lost
    assert_eq!(
        drain(&sub),
        vec![SessionEvent::Deactivated, SessionEvent::Activated]
    );
    assert!(session.notifications.is_empty());
}

#[test]
fn test_acks_follow_notification_order() {
    let (mut session, state) = active_mock_session();
    state.borrow_mut().acks.clear();

    // Switch away and straight back within one dispatch
    state.borrow_mut().pending.extend([
        SeatNotification::Disable,
        SeatNotification::Enable,
    ]);
    session.dispatch(NOW).unwrap();

    assert_eq!(
        state.borrow().acks,
        vec![SeatNotification::Disable, SeatNotification::Enable]
    );
    assert!(session.is_active());
}

#[test]
fn test_fatal_dispatch_error_surfaces() {
    let (mut session, state) = mock_session("seat0");

    state.borrow_mut().dispatch_errno = Some(libc::ECONNRESET);
    match session.dispatch(NOW) {
        Err(SessionError::SeatLost { code, .. }) => assert_eq!(code, Some(libc::ECONNRESET)),
        other => panic!("expected SeatLost, got {:?}", other),
    }
}

#[test]
fn test_change_vt() {
    let (mut session, state) = mock_session("seat0");
    assert_eq!(session.change_vt(3).unwrap(), true);
    assert_eq!(state.borrow().switches, vec![3]);
    // The switch itself arrives later through dispatch
    assert_eq!(session.state(), SessionState::Inactive);

    let (mut other_seat, other_state) = mock_session("seat1");
    assert_eq!(other_seat.change_vt(3).unwrap(), false);
    assert!(other_state.borrow().switches.is_empty());
}

#[test]
fn test_hotplug_removal_invalidates_device() {
    let (backend, state) = MockBackend::new("seat0");
    let (source, sender) = ChannelHotplug::new().unwrap();
    let mut session = Session::with_backend(Box::new(backend), Some(Box::new(source)));
    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();
    let sub = session.subscribe();

    let pad = session.open_device("/dev/input/event7").unwrap();
    let keyboard = session.open_device("/dev/input/event1").unwrap();

    sender.send(HotplugEvent::removed("/dev/input/event7"));
    sender.send(HotplugEvent::added("/dev/input/event9"));
    assert_eq!(session.dispatch(NOW).unwrap(), 2);

    assert_eq!(
        drain(&sub),
        vec![
            SessionEvent::DeviceRemoved {
                path: PathBuf::from("/dev/input/event7"),
                device: Some(pad.id()),
            },
            SessionEvent::DeviceAdded {
                path: PathBuf::from("/dev/input/event9"),
            },
        ]
    );
    // Removed but not closed behind the compositor's back
    assert_eq!(session.device_count(), 2);
    assert!(session.is_revoked(&pad));
    assert!(!session.is_revoked(&keyboard));
    assert!(state.borrow().closed.is_empty());

    // A second removal of the same node is not reported again
    sender.send(HotplugEvent::removed("/dev/input/event7"));
    session.dispatch(NOW).unwrap();
    assert_eq!(
        drain(&sub),
        vec![SessionEvent::DeviceRemoved {
            path: PathBuf::from("/dev/input/event7"),
            device: None,
        }]
    );

    // The compositor's close releases the descriptor and succeeds
    assert_eq!(session.close_device(&pad).unwrap(), CloseOutcome::Closed);
    assert_eq!(state.borrow().closed, vec![100]);
    assert_eq!(
        session.close_device(&pad).unwrap(),
        CloseOutcome::AlreadyClosed
    );
    assert_eq!(session.device_count(), 1);
}

#[test]
fn test_removed_device_stays_revoked_across_enable() {
    let (backend, state) = MockBackend::new("seat0");
    let (source, sender) = ChannelHotplug::new().unwrap();
    let mut session = Session::with_backend(Box::new(backend), Some(Box::new(source)));
    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();

    let pad = session.open_device("/dev/input/event7").unwrap();
    sender.send(HotplugEvent::removed("/dev/input/event7"));
    state.borrow_mut().pending.extend([
        SeatNotification::Disable,
        SeatNotification::Enable,
    ]);
    session.dispatch(NOW).unwrap();

    assert!(session.is_active());
    assert!(session.is_revoked(&pad));
}

#[test]
fn test_removal_of_unopened_device_is_forwarded() {
    let (backend, _state) = MockBackend::new("seat0");
    let (source, sender) = ChannelHotplug::new().unwrap();
    let mut session = Session::with_backend(Box::new(backend), Some(Box::new(source)));
    let sub = session.subscribe();

    sender.send(HotplugEvent::removed("/dev/dri/card1"));
    session.dispatch(NOW).unwrap();
    assert_eq!(
        drain(&sub),
        vec![SessionEvent::DeviceRemoved {
            path: PathBuf::from("/dev/dri/card1"),
            device: None,
        }]
    );
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let (mut session, state) = mock_session("seat0");
    let first = session.subscribe();
    let second = session.subscribe();
    assert!(session.unsubscribe(first.id));
    assert!(!session.unsubscribe(first.id));

    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();

    assert!(drain(&first).is_empty());
    assert_eq!(drain(&second), vec![SessionEvent::Activated]);
}

#[test]
fn test_dropped_subscriber_is_pruned() {
    let (mut session, state) = mock_session("seat0");
    let sub = session.subscribe();
    drop(sub);

    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();
    assert!(session.subscribers.is_empty());
}

#[test]
fn test_destroy_force_closes_in_order() {
    let (mut session, state) = active_mock_session();
    let a = session.open_device("/dev/dri/card0").unwrap();
    let _b = session.open_device("/dev/input/event0").unwrap();
    let _c = session.open_device("/dev/input/event1").unwrap();
    session.close_device(&a).unwrap();

    session.destroy();
    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(session.device_count(), 0);
    {
        let state = state.borrow();
        assert!(state.open.is_empty());
        assert_eq!(state.closed, vec![100, 101, 102]);
        assert!(state.seat_closed);
    }

    assert!(matches!(
        session.open_device("/dev/input/event0"),
        Err(SessionError::Destroyed)
    ));
    assert!(matches!(session.dispatch(NOW), Err(SessionError::Destroyed)));
    assert_eq!(session.close_device(&a).unwrap(), CloseOutcome::AlreadyClosed);

    // Second destroy is a no-op
    session.destroy();
}

#[test]
fn test_drop_closes_devices() {
    let (mut session, state) = active_mock_session();
    session.open_device("/dev/input/event0").unwrap();
    drop(session);
    assert!(state.borrow().open.is_empty());
    assert!(state.borrow().seat_closed);
}

#[test]
fn test_render_gated_on_activity() {
    let (mut session, state) = mock_session("seat0");
    let mut tracker = DamageTracker::new(100, 100);
    tracker.add_region(Rect::new(0, 0, 10, 10));

    let frame = session.attach_for_render(&tracker, 1);
    assert!(!frame.needs_frame);
    assert!(frame.buffer_damage.is_empty());

    state.borrow_mut().pending.push_back(SeatNotification::Enable);
    session.dispatch(NOW).unwrap();
    let frame = session.attach_for_render(&tracker, 1);
    assert!(frame.needs_frame);
    assert!(frame.buffer_damage.contains_rect(&Rect::new(0, 0, 10, 10)));
}
