//! End-to-end slot manager behavior against a mock bus and a manual clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use loconet_core::protocol::{PacketFault, encode_send_packet};
use loconet_core::{
    CodecError, CommandError, DecoderStatus, LnMessage, ManagerConfig, ManagerEvent,
    ManagerObserver, ManualClock, MockTransport, ProgListener, ProgOp, ProgState,
    ProgrammerError, ProgrammingError, ProgrammingMode, ProgrammingResult, Slot, SlotListener,
    SlotListeners, SlotManager, SlotStatus,
};

type Manager = SlotManager<MockTransport, ManualClock>;

fn setup_with(config: ManagerConfig) -> (Manager, MockTransport, ManualClock) {
    let transport = MockTransport::new();
    let clock = ManualClock::new();
    let manager = SlotManager::new(transport.clone(), clock.clone(), config);
    (manager, transport, clock)
}

fn setup() -> (Manager, MockTransport, ManualClock) {
    setup_with(ManagerConfig::default())
}

fn frame(elements: &[u8]) -> Vec<u8> {
    LnMessage::from_elements(elements).into_bytes()
}

fn slot_read(slot: u8, stat1: u8, address: u16) -> Vec<u8> {
    frame(&[
        0xE7,
        0x0E,
        slot,
        stat1,
        (address & 0x7F) as u8,
        0,
        0,
        0x07,
        0,
        (address >> 7) as u8,
        0,
        0,
        0,
    ])
}

fn prog_reply(pstat: u8, cv: u16, value: u8) -> Vec<u8> {
    let addr = cv - 1;
    let cvh = ((addr & 0x300) >> 4) as u8 | ((addr & 0x80) >> 7) as u8 | ((value & 0x80) >> 6);
    frame(&[
        0xE7,
        0x0E,
        0x7C,
        0x00,
        pstat,
        0,
        0,
        0x07,
        cvh,
        (addr & 0x7F) as u8,
        value & 0x7F,
        0,
        0,
    ])
}

fn lack(status: u8) -> Vec<u8> {
    frame(&[0xB4, 0x6F, status])
}

#[derive(Default)]
struct Results(Mutex<Vec<ProgrammingResult>>);

impl ProgListener for Results {
    fn programming_op_reply(&self, result: &ProgrammingResult) {
        self.0.lock().unwrap().push(result.clone());
    }
}

impl Results {
    fn take(&self) -> Vec<ProgrammingResult> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<ManagerEvent>>);

impl ManagerObserver for Events {
    fn on_event(&self, event: &ManagerEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
struct Seen(Mutex<Vec<u8>>);

impl SlotListener for Seen {
    fn notify_changed_slot(&self, slot: &Slot) {
        self.0.lock().unwrap().push(slot.index());
    }
}

impl Seen {
    fn slots(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

// ============================================================================
// Programming
// ============================================================================

#[test]
fn test_short_timeout_returns_to_idle() {
    let (mut m, _bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.read_cv(1, results.clone()).unwrap();
    assert_eq!(m.prog_state(), ProgState::CommandPending);

    clock.advance(1_999);
    m.poll();
    assert_eq!(m.prog_state(), ProgState::CommandPending);

    clock.advance(1);
    m.poll();
    assert_eq!(m.prog_state(), ProgState::Idle);
    assert!(!m.programming_active());
    // Delivery waits for the service reply delay.
    assert!(results.take().is_empty());

    clock.advance(20);
    m.poll();
    let delivered = results.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].outcome, Err(ProgrammingError::Timeout));
    assert_eq!(delivered[0].value, None);
}

#[test]
fn test_service_read_round_trip() {
    let (mut m, bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.read_cv(8, results.clone()).unwrap();
    let sent = bus.writes_with_opcode(0xEF);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        &sent[0][..13],
        &[0xEF, 0x0E, 0x7C, 0x23, 0x00, 0x00, 0x00, 0x00, 0x02, 0x07, 0x7F, 0x7F, 0x7F]
    );

    m.on_frame(&lack(0x01));
    assert_eq!(m.prog_state(), ProgState::CommandExecuting);

    // A service-mode read waits on the long timeout.
    clock.advance(10_000);
    m.poll();
    assert_eq!(m.prog_state(), ProgState::CommandExecuting);

    m.on_frame(&prog_reply(0, 8, 145));
    assert_eq!(m.prog_state(), ProgState::Idle);

    clock.advance(20);
    m.poll();
    let delivered = results.take();
    assert_eq!(
        delivered,
        vec![ProgrammingResult {
            op: ProgOp::Read,
            cv: 8,
            value: Some(145),
            outcome: Ok(()),
        }]
    );
}

#[test]
fn test_second_request_rejected_without_touching_session() {
    let (mut m, bus, clock) = setup();
    let first = Arc::new(Results::default());
    let second = Arc::new(Results::default());

    m.read_cv(1, first.clone()).unwrap();
    let err = m.write_cv(2, 5, second.clone()).unwrap_err();
    assert!(matches!(err, ProgrammerError::Busy));
    assert_eq!(bus.writes_with_opcode(0xEF).len(), 1);
    assert_eq!(m.prog_state(), ProgState::CommandPending);

    // The same requester is refused too.
    assert!(matches!(
        m.read_cv(1, first.clone()),
        Err(ProgrammerError::Busy)
    ));

    m.on_frame(&lack(0x01));
    m.on_frame(&prog_reply(0, 1, 3));
    clock.advance(20);
    m.poll();

    let delivered = first.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].op, ProgOp::Read);
    assert_eq!(delivered[0].cv, 1);
    assert_eq!(delivered[0].value, Some(3));
    assert!(second.take().is_empty());
}

#[test]
fn test_busy_and_unknown_lacks_abort() {
    let (mut m, _bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.write_cv(3, 10, results.clone()).unwrap();
    m.on_frame(&lack(0x00));
    assert_eq!(m.prog_state(), ProgState::Idle);

    m.write_cv(3, 10, results.clone()).unwrap();
    m.on_frame(&lack(0x22));
    assert_eq!(m.prog_state(), ProgState::Idle);

    clock.advance(20);
    m.poll();
    let outcomes: Vec<_> = results.take().into_iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Err(ProgrammingError::ProgrammerBusy),
            Err(ProgrammingError::UnknownProtocol { status: 0x22 }),
        ]
    );
}

#[test]
fn test_not_implemented_lack_treated_as_accepted() {
    let (mut m, _bus, _clock) = setup();
    m.write_cv(3, 10, Arc::new(Results::default())).unwrap();
    m.on_frame(&lack(0x7F));
    assert_eq!(m.prog_state(), ProgState::CommandExecuting);
}

#[test]
fn test_blind_accept_completes_empty() {
    let (mut m, _bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.write_cv(17, 192, results.clone()).unwrap();
    m.on_frame(&lack(0x40));
    assert_eq!(m.prog_state(), ProgState::Idle);
    assert!(m.programming_active());
    assert!(matches!(
        m.read_cv(1, results.clone()),
        Err(ProgrammerError::Busy)
    ));

    clock.advance(99);
    m.poll();
    assert!(results.take().is_empty());

    clock.advance(1);
    m.poll();
    let delivered = results.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].outcome, Ok(()));
    assert_eq!(delivered[0].value, None);
    assert!(!m.programming_active());
}

#[test]
fn test_decoder_status_bits_reported() {
    let (mut m, _bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.read_cv(1, results.clone()).unwrap();
    m.on_frame(&lack(0x01));
    m.on_frame(&prog_reply(0x01 | 0x08, 1, 0));
    clock.advance(20);
    m.poll();

    let delivered = results.take();
    assert_eq!(
        delivered[0].outcome,
        Err(ProgrammingError::Decoder(
            DecoderStatus::NO_DECODER | DecoderStatus::USER_ABORTED
        ))
    );
}

#[test]
fn test_confirm_compares_value() {
    let (mut m, _bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.confirm_cv(29, 6, results.clone()).unwrap();
    m.on_frame(&lack(0x01));
    m.on_frame(&prog_reply(0, 29, 6));
    clock.advance(20);
    m.poll();

    m.confirm_cv(29, 6, results.clone()).unwrap();
    m.on_frame(&lack(0x01));
    m.on_frame(&prog_reply(0, 29, 38));
    clock.advance(20);
    m.poll();

    let delivered = results.take();
    assert_eq!(delivered[0].outcome, Ok(()));
    assert_eq!(
        delivered[1].outcome,
        Err(ProgrammingError::Decoder(DecoderStatus::CONFIRM_FAILED))
    );
    assert_eq!(delivered[1].value, Some(38));
}

#[test]
fn test_ops_mode_no_acknowledgment() {
    let (mut m, bus, clock) = setup();
    let results = Arc::new(Results::default());

    m.write_cv_ops_mode(3, 10, 1234, true, results.clone())
        .unwrap();
    let sent = bus.writes_with_opcode(0xEF);
    assert_eq!(&sent[0][3..7], &[0x67, 0x00, 0x09, 0x52]);

    m.on_frame(&lack(0x01));
    assert_eq!(m.prog_state(), ProgState::CommandExecuting);

    clock.advance(2_000);
    m.poll();
    assert_eq!(m.prog_state(), ProgState::Idle);

    // Ops results wait the longer reply delay.
    clock.advance(20);
    m.poll();
    assert!(results.take().is_empty());
    clock.advance(80);
    m.poll();
    assert_eq!(
        results.take()[0].outcome,
        Err(ProgrammingError::NoAcknowledgment)
    );
}

#[test]
fn test_ops_mode_short_address_bounds() {
    let (mut m, bus, _clock) = setup();
    let err = m
        .read_cv_ops_mode(1, 300, false, Arc::new(Results::default()))
        .unwrap_err();
    assert!(matches!(
        err,
        ProgrammerError::Codec(CodecError::AddressOutOfRange(300))
    ));
    assert!(bus.get_writes().is_empty());
    assert!(!m.programming_active());
}

#[test]
fn test_invalid_cv_rejected_before_send() {
    let (mut m, bus, _clock) = setup();
    let err = m.read_cv(0, Arc::new(Results::default())).unwrap_err();
    assert!(matches!(
        err,
        ProgrammerError::Codec(CodecError::CvOutOfRange(0))
    ));
    assert!(bus.get_writes().is_empty());
    assert_eq!(m.prog_state(), ProgState::Idle);
}

#[test]
fn test_send_failure_releases_programmer() {
    let (mut m, bus, _clock) = setup();
    bus.disconnect();
    let err = m.read_cv(1, Arc::new(Results::default())).unwrap_err();
    assert!(matches!(err, ProgrammerError::Transport(_)));
    assert!(!m.programming_active());

    bus.reconnect();
    assert!(m.read_cv(1, Arc::new(Results::default())).is_ok());
}

#[test]
fn test_mode_selection() {
    let (m, _bus, _clock) = setup();
    let events = Arc::new(Events::default());
    let mut m = m.with_observer(events.clone());

    assert_eq!(m.mode(), ProgrammingMode::Paged);
    m.set_mode(ProgrammingMode::DirectBit);
    assert_eq!(m.mode(), ProgrammingMode::DirectByte);
    assert!(events.0.lock().unwrap().contains(&ManagerEvent::ModeChanged {
        from: ProgrammingMode::Paged,
        to: ProgrammingMode::DirectByte,
    }));
    assert!(m.has_mode(ProgrammingMode::Register));
    assert!(!m.has_mode(ProgrammingMode::OpsByte));

    m.set_mode(ProgrammingMode::OpsByte);
    assert!(matches!(
        m.read_cv(1, Arc::new(Results::default())),
        Err(ProgrammerError::ModeNotSupported(ProgrammingMode::OpsByte))
    ));
}

#[test]
fn test_direct_byte_command_bits() {
    let (mut m, bus, _clock) = setup();
    m.set_mode(ProgrammingMode::DirectByte);
    m.write_cv(1, 3, Arc::new(Results::default())).unwrap();
    assert_eq!(bus.writes_with_opcode(0xEF)[0][3], 0x43 | 0x28);
}

// ============================================================================
// Power restore
// ============================================================================

fn finish_service_write(m: &mut Manager, results: Arc<Results>) {
    m.write_cv(1, 3, results).unwrap();
    m.on_frame(&lack(0x01));
    m.on_frame(&prog_reply(0, 1, 3));
}

#[test]
fn test_power_restored_after_service_programming() {
    let config = ManagerConfig {
        prog_powers_off: true,
        ..Default::default()
    };
    let (mut m, bus, clock) = setup_with(config);
    finish_service_write(&mut m, Arc::new(Results::default()));

    clock.advance(1_999);
    m.poll();
    assert!(bus.writes_with_opcode(0x83).is_empty());

    clock.advance(1);
    m.poll();
    assert_eq!(bus.writes_with_opcode(0x83), vec![vec![0x83, 0x7C]]);
}

#[test]
fn test_power_restore_superseded_by_new_task() {
    let config = ManagerConfig {
        prog_powers_off: true,
        ..Default::default()
    };
    let (mut m, bus, clock) = setup_with(config);
    finish_service_write(&mut m, Arc::new(Results::default()));

    clock.advance(1_000);
    m.poll();
    m.read_cv(1, Arc::new(Results::default())).unwrap();

    clock.advance(1_500);
    m.poll();
    assert!(bus.writes_with_opcode(0x83).is_empty());
}

#[test]
fn test_no_power_restore_without_capability() {
    let (mut m, bus, clock) = setup();
    finish_service_write(&mut m, Arc::new(Results::default()));
    clock.advance(5_000);
    m.poll();
    assert!(bus.writes_with_opcode(0x83).is_empty());
}

// ============================================================================
// Slot table
// ============================================================================

#[test]
fn test_stale_slot_reread_once() {
    let (mut m, bus, clock) = setup();
    m.on_frame(&slot_read(5, 0x30, 3));
    clock.set(50_000);
    m.on_frame(&slot_read(6, 0x30, 4));

    for t in (60_000..=90_000).step_by(10_000) {
        clock.set(t);
        m.poll();
    }
    bus.clear_writes();

    clock.set(100_000);
    m.poll();
    assert_eq!(bus.get_writes(), vec![vec![0xBB, 0x05, 0x00, 0x41]]);
}

#[test]
fn test_fresh_slots_not_swept() {
    let (mut m, bus, clock) = setup();
    m.on_frame(&slot_read(5, 0x30, 3));
    for t in (30_000..=80_000).step_by(10_000) {
        clock.set(t);
        m.poll();
    }
    assert!(bus.writes_with_opcode(0xBB).is_empty());
}

#[test]
fn test_slot_updates_notify_and_count() {
    let (mut m, _bus, _clock) = setup();
    let seen = Arc::new(Seen::default());
    assert!(m.add_slot_listener(seen.clone()));

    m.on_frame(&slot_read(1, 0x30, 3));
    m.on_frame(&slot_read(2, 0x20, 4));
    m.on_frame(&slot_read(121, 0x30, 5));
    m.on_frame(&frame(&[0xA0, 0x01, 0x40]));

    assert_eq!(seen.slots(), vec![1, 2, 121, 1]);
    assert_eq!(m.in_use_slot_count(), 1);
    assert_eq!(m.slot(1).unwrap().speed(), 0x40);
    assert_eq!(m.slot(2).unwrap().status(), SlotStatus::Idle);
    assert!(m.slot(128).is_err());
}

#[test]
fn test_listener_unregistering_itself() {
    struct Leaver {
        me: Weak<Leaver>,
        listeners: SlotListeners,
        calls: AtomicUsize,
    }

    impl SlotListener for Leaver {
        fn notify_changed_slot(&self, _slot: &Slot) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.upgrade() {
                let me: Arc<dyn SlotListener> = me;
                self.listeners.remove(&me);
            }
        }
    }

    let (mut m, _bus, _clock) = setup();
    let leaver = Arc::new_cyclic(|me| Leaver {
        me: me.clone(),
        listeners: m.slot_listeners(),
        calls: AtomicUsize::new(0),
    });
    let stayer = Arc::new(Seen::default());
    m.add_slot_listener(leaver.clone());
    m.add_slot_listener(stayer.clone());

    m.on_frame(&slot_read(1, 0x30, 3));
    m.on_frame(&slot_read(2, 0x30, 4));

    assert_eq!(leaver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stayer.slots(), vec![1, 2]);
    assert_eq!(m.slot_listeners().len(), 1);
}

#[test]
fn test_full_refresh_reads_every_slot() {
    let (mut m, bus, clock) = setup();
    m.request_full_slot_table_refresh().unwrap();
    assert!(m.refresh_in_progress());

    for _ in 0..130 {
        clock.advance(500);
        m.poll();
    }
    let reads: Vec<u8> = bus
        .writes_with_opcode(0xBB)
        .iter()
        .map(|w| w[1])
        .collect();
    assert_eq!(reads, (0..=126).collect::<Vec<u8>>());
    assert!(!m.refresh_in_progress());
}

#[test]
fn test_malformed_frames_dropped() {
    let (m, _bus, _clock) = setup();
    let events = Arc::new(Events::default());
    let mut m = m.with_observer(events.clone());

    m.on_frame(&[0xB4, 0x6F]);
    m.on_frame(&[0x12, 0x34]);
    let dropped = events
        .0
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ManagerEvent::FrameDropped { .. }))
        .count();
    assert_eq!(dropped, 2);

    m.on_frame(&slot_read(1, 0x30, 3));
    assert_eq!(m.in_use_slot_count(), 1);
}

// ============================================================================
// Lookups and extended functions
// ============================================================================

fn f13_packet(address_hi: u8, address_lo: u8) -> Vec<u8> {
    let body = [address_hi, address_lo, 0xDE, 0x55];
    let check = body.iter().fold(0, |acc, b| acc ^ b);
    let packet = [body[0], body[1], body[2], body[3], check];
    encode_send_packet(&packet, 2).unwrap().into_bytes()
}

#[test]
fn test_function_packet_for_unknown_address_requests_slot() {
    let (mut m, bus, _clock) = setup();
    let seen = Arc::new(Seen::default());
    m.add_slot_listener(seen.clone());

    // Long address 1234 = 0xC4 0xD2
    m.on_frame(&f13_packet(0xC4, 0xD2));

    assert_eq!(bus.get_writes(), vec![frame(&[0xBF, 0x09, 0x52])]);
    assert!(seen.slots().is_empty());
    assert!((0..128).all(|i| m.extended_functions(i).unwrap().bits() == 0));
}

#[test]
fn test_function_packet_routed_to_matching_slot() {
    let (mut m, bus, _clock) = setup();
    m.on_frame(&slot_read(3, 0x30, 1234));
    let seen = Arc::new(Seen::default());
    m.add_slot_listener(seen.clone());

    m.on_frame(&f13_packet(0xC4, 0xD2));

    assert!(bus.get_writes().is_empty());
    assert_eq!(seen.slots(), vec![3]);
    let ext = m.extended_functions(3).unwrap();
    assert!(ext.get(13));
    assert!(!ext.get(14));
    assert!(ext.get(15));
}

#[test]
fn test_lookup_resolved_by_read_after_request() {
    let (mut m, bus, _clock) = setup();
    let found = Arc::new(Seen::default());

    m.lookup_slot_by_address(1234, found.clone()).unwrap();
    assert_eq!(bus.writes_with_opcode(0xBF).len(), 1);
    assert_eq!(m.pending_lookups(), 1);

    // Unsolicited read: not the answer.
    m.on_frame(&slot_read(7, 0x30, 1234));
    assert!(found.slots().is_empty());

    // Request echo, interleaved power-busy, then the answer.
    m.on_frame(&frame(&[0xBF, 0x09, 0x52]));
    m.on_frame(&frame(&[0x81]));
    m.on_frame(&slot_read(7, 0x30, 1234));
    assert_eq!(found.slots(), vec![7]);
    assert_eq!(m.pending_lookups(), 0);
}

#[test]
fn test_cancelled_lookup_not_resolved() {
    let (mut m, _bus, _clock) = setup();
    let found = Arc::new(Seen::default());
    m.lookup_slot_by_address(42, found.clone()).unwrap();
    assert!(m.cancel_slot_lookup(42));

    m.on_frame(&frame(&[0xBF, 0x00, 0x2A]));
    m.on_frame(&slot_read(9, 0x30, 42));
    assert!(found.slots().is_empty());
}

#[test]
fn test_send_packet_validates() {
    let (m, bus, _clock) = setup();
    let err = m.send_packet(&[0x03, 0x60, 0x63], 8).unwrap_err();
    assert!(matches!(
        err,
        CommandError::Codec(CodecError::InvalidPacket(PacketFault::TooManyRepeats(8)))
    ));
    assert!(bus.get_writes().is_empty());

    m.send_packet(&[0x03, 0x60, 0x63], 3).unwrap();
    assert_eq!(bus.writes_with_opcode(0xED).len(), 1);
}

#[test]
fn test_capabilities() {
    let (mut m, _bus, _clock) = setup();
    assert!(!m.prog_powers_off());
    assert!(m.can_read());
    assert_eq!(m.command_station_type(), "<unknown>");

    m.set_prog_powers_off(true);
    m.set_can_read(false);
    m.set_command_station_type("DB150");
    assert!(m.prog_powers_off());
    assert!(!m.can_read());
    assert_eq!(m.command_station_type(), "DB150");
}
