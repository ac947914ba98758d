//! Slot manager: the protocol engine between the bus and its users.
//!
//! The manager owns the slot table, the programmer and every timer. It is
//! synchronous and single-owner: inbound frames go through
//! [`SlotManager::on_frame`], timers advance through [`SlotManager::poll`],
//! and both run on whatever context owns the manager (see
//! [`ManagerService`](crate::driver::ManagerService) for a threaded one).
//! Nothing here blocks waiting for the bus.

mod correlation;
mod programming;

pub use correlation::{LookupCorrelator, OrderingCorrelator};
pub use programming::ProgrammingTarget;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::clock::Clock;
use crate::config::ManagerConfig;
use crate::events::{
    ManagerEvent, ManagerObserver, ProgListener, SlotListener, SlotListeners, TracingObserver,
};
use crate::programmer::{ProgState, ProgrammingMode, ProgrammingResult, ProgrammingSession};
use crate::protocol::{
    CodecError, DirectPacket, InboundMessage, LnMessage, decode, encode_loco_address_request,
    encode_power_on, encode_request_slot_data, encode_send_packet,
};
use crate::protocol::constants::*;
use crate::slot::{ExtendedFunctions, Slot, SlotError, SlotStatus, SlotStore, SlotUpdate};
use crate::timer::{Expired, Timers};
use crate::transport::{LocoNetTransport, TransportError};

/// Why an outbound request (slot read, lookup, packet) was not sent.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A programming result waiting for its delivery time.
pub(crate) struct Delivery {
    owner: Arc<dyn ProgListener>,
    result: ProgrammingResult,
}

/// Last slot read by a full table refresh.
const REFRESH_LAST_SLOT: u8 = 126;

/// LocoNet slot manager and decoder programmer.
pub struct SlotManager<T: LocoNetTransport, C: Clock> {
    config: ManagerConfig,
    transport: T,
    clock: C,
    slots: SlotStore,
    extended: [ExtendedFunctions; SLOT_COUNT],
    listeners: SlotListeners,
    correlator: Box<dyn LookupCorrelator>,
    observer: Arc<dyn ManagerObserver>,
    prog_state: ProgState,
    session: Option<ProgrammingSession>,
    mode: ProgrammingMode,
    prog_powers_off: bool,
    can_read: bool,
    command_station_type: String,
    timers: Timers<Delivery>,
    refresh_next: Option<u8>,
}

impl<T: LocoNetTransport, C: Clock> SlotManager<T, C> {
    /// Create a manager and start the stale-slot sweep.
    ///
    /// An invalid `config` is logged and repaired with
    /// [`ManagerConfig::normalized`].
    pub fn new(transport: T, clock: C, config: ManagerConfig) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "Invalid manager configuration, adjusting");
                config.normalized()
            }
        };
        let now = clock.now_ms();
        let mut timers = Timers::new();
        timers.start_stale_sweep(
            now + config.stale_check_initial_delay_ms,
            config.stale_check_interval_ms,
        );
        info!(
            command_station = %config.command_station_type,
            prog_powers_off = config.prog_powers_off,
            "Slot manager started"
        );

        Self {
            prog_powers_off: config.prog_powers_off,
            can_read: config.can_read,
            command_station_type: config.command_station_type.clone(),
            config,
            transport,
            clock,
            slots: SlotStore::new(),
            extended: [ExtendedFunctions::default(); SLOT_COUNT],
            listeners: SlotListeners::new(),
            correlator: Box::new(OrderingCorrelator::new()),
            observer: Arc::new(TracingObserver),
            prog_state: ProgState::Idle,
            session: None,
            mode: ProgrammingMode::default(),
            timers,
            refresh_next: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ManagerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the lookup correlation strategy.
    pub fn with_correlator(mut self, correlator: Box<dyn LookupCorrelator>) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn emit(&self, event: ManagerEvent) {
        self.observer.on_event(&event);
    }

    fn send(&self, msg: &LnMessage) -> Result<(), TransportError> {
        trace!(frame = %msg, "Sending");
        self.transport.send_frame(msg.as_bytes())
    }

    fn drop_frame(&self, reason: String) {
        warn!(reason = %reason, "Frame dropped");
        self.emit(ManagerEvent::FrameDropped { reason });
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle one raw inbound frame.
    ///
    /// Malformed frames are logged and dropped.
    pub fn on_frame(&mut self, bytes: &[u8]) {
        match LnMessage::from_bytes(bytes) {
            Ok(msg) => self.message(&msg),
            Err(e) => self.drop_frame(format!("{e} ({})", hex::encode_upper(bytes))),
        }
    }

    /// Handle one inbound message.
    pub fn message(&mut self, msg: &LnMessage) {
        let now = self.clock.now_ms();
        let decoded = match decode(msg) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.drop_frame(format!("{e} ({msg})"));
                return;
            }
        };

        trace!(
            opcode = %format!("{:02X}", msg.opcode()),
            slot = ?decoded.slot(),
            "Frame received"
        );

        match &decoded {
            InboundMessage::LongAck(lack) if lack.is_programming() => {
                self.on_programming_ack(lack.prog_status());
            }
            InboundMessage::ImmediatePacket { packet: Some(packet) } => {
                self.on_direct_packet(packet);
            }
            InboundMessage::PowerOn | InboundMessage::PowerOff => {
                debug!(opcode = %format!("{:02X}", msg.opcode()), "Track power");
            }
            _ => {}
        }

        if let Some((index, update)) = SlotUpdate::from_message(&decoded) {
            let is_read = matches!(decoded, InboundMessage::SlotData { write: false, .. });
            self.on_slot_update(index, &update, is_read, now);
        }

        self.correlator.observe(msg.opcode());
    }

    fn on_slot_update(&mut self, index: u8, update: &SlotUpdate, is_read: bool, now: u64) {
        let slot = match self.slots.apply_incoming(index as usize, update, now) {
            Ok(slot) => slot.clone(),
            Err(e) => {
                self.drop_frame(e.to_string());
                return;
            }
        };
        trace!(slot = index, status = %slot.status(), "Slot updated");

        if is_read && let Some(waiter) = self.correlator.resolve(&slot) {
            self.emit(ManagerEvent::LookupResolved {
                address: slot.loco_address(),
                slot: index,
            });
            waiter.notify_changed_slot(&slot);
        }

        self.listeners.notify(&slot);

        if is_read
            && slot.is_programming_slot()
            && let Some(data) = slot.programming().copied()
        {
            self.on_programming_reply(data);
        }
    }

    /// Route F9-F28 to the slot(s) holding the packet's address.
    fn on_direct_packet(&mut self, packet: &DirectPacket) {
        let Some(group) = packet.function_group() else {
            return;
        };
        let matching: Vec<u8> = self
            .slots
            .iter()
            .take(MAX_LOCO_SLOT as usize + 1)
            .filter(|s| s.status() != SlotStatus::Free && s.loco_address() == packet.address)
            .map(Slot::index)
            .collect();

        if matching.is_empty() {
            debug!(
                address = packet.address,
                "No slot for function packet, requesting slot"
            );
            if let Err(e) = self.send_loco_address_request(packet.address) {
                warn!(address = packet.address, error = %e, "Slot request failed");
            }
            return;
        }

        for index in matching {
            self.extended[index as usize].apply(group);
            trace!(slot = index, ?group, "Extended functions updated");
            if let Ok(slot) = self.slots.get(index as usize) {
                self.listeners.notify(slot);
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Fire every timer that is due.
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();
        for expired in self.timers.expired(now) {
            match expired {
                Expired::Deliver(delivery) => {
                    debug!(
                        op = %delivery.result.op,
                        cv = delivery.result.cv,
                        ok = delivery.result.is_ok(),
                        "Delivering programming result"
                    );
                    delivery.owner.programming_op_reply(&delivery.result);
                }
                Expired::Programming(kind) => self.on_programming_timeout(kind),
                Expired::BlindCompletion => self.on_blind_completion(),
                Expired::PowerRestore => self.on_power_restore(),
                Expired::StaleSweep => self.sweep_stale(now),
                Expired::RefreshNext => self.refresh_step(now),
            }
        }
    }

    /// Earliest armed deadline, for drivers that sleep between polls.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    fn sweep_stale(&mut self, now: u64) {
        let stale: Vec<u8> = self
            .slots
            .scan_stale(now, self.config.stale_threshold_ms, 1..=MAX_LOCO_SLOT)
            .collect();
        for index in stale {
            self.emit(ManagerEvent::StaleSlotRefresh { slot: index });
            if let Err(e) = self.send(&encode_request_slot_data(index)) {
                warn!(slot = index, error = %e, "Stale slot re-read failed");
            }
        }
    }

    fn on_power_restore(&mut self) {
        if self.prog_state != ProgState::Idle || self.session.is_some() {
            debug!("Programmer busy, not restoring power");
            return;
        }
        match self.send(&encode_power_on()) {
            Ok(()) => self.emit(ManagerEvent::PowerRestored),
            Err(e) => warn!(error = %e, "Power restore failed"),
        }
    }

    fn refresh_step(&mut self, now: u64) {
        let Some(index) = self.refresh_next else {
            return;
        };
        if let Err(e) = self.send(&encode_request_slot_data(index)) {
            warn!(slot = index, error = %e, "Refresh read failed");
        }
        if index < REFRESH_LAST_SLOT {
            self.refresh_next = Some(index + 1);
            self.timers.arm_refresh(now + self.config.refresh_interval_ms);
        } else {
            self.refresh_next = None;
            debug!("Slot table refresh complete");
        }
    }

    // ========================================================================
    // Slot requests
    // ========================================================================

    /// Ask the command station which slot holds `address`; `listener` is
    /// told once when the answer arrives.
    #[instrument(skip(self, listener))]
    pub fn lookup_slot_by_address(
        &mut self,
        address: u16,
        listener: Arc<dyn SlotListener>,
    ) -> Result<(), CommandError> {
        let msg = encode_loco_address_request(address)?;
        self.correlator.register(address, listener);
        if let Err(e) = self.send(&msg) {
            self.correlator.cancel(address);
            return Err(e.into());
        }
        Ok(())
    }

    /// Forget a pending lookup. Returns false if none was pending.
    pub fn cancel_slot_lookup(&mut self, address: u16) -> bool {
        self.correlator.cancel(address)
    }

    pub fn pending_lookups(&self) -> usize {
        self.correlator.pending()
    }

    fn send_loco_address_request(&self, address: u16) -> Result<(), CommandError> {
        let msg = encode_loco_address_request(address)?;
        self.send(&msg)?;
        Ok(())
    }

    /// Request one slot's contents.
    pub fn send_read_slot(&self, slot: u8) -> Result<(), CommandError> {
        if slot as usize >= SLOT_COUNT {
            return Err(CodecError::SlotOutOfRange(slot).into());
        }
        self.send(&encode_request_slot_data(slot))?;
        Ok(())
    }

    /// Read every slot from 0 to 126, one every `refresh_interval_ms`.
    ///
    /// Calling again restarts from slot 0.
    pub fn request_full_slot_table_refresh(&mut self) -> Result<(), CommandError> {
        info!("Refreshing full slot table");
        self.send_read_slot(0)?;
        self.refresh_next = Some(1);
        self.timers
            .arm_refresh(self.clock.now_ms() + self.config.refresh_interval_ms);
        Ok(())
    }

    pub fn refresh_in_progress(&self) -> bool {
        self.refresh_next.is_some()
    }

    /// Send a DCC packet (check byte included) through the command station.
    pub fn send_packet(&self, packet: &[u8], repeats: u8) -> Result<(), CommandError> {
        let msg = encode_send_packet(packet, repeats)?;
        self.send(&msg)?;
        Ok(())
    }

    // ========================================================================
    // Slot table
    // ========================================================================

    pub fn slot(&self, index: usize) -> Result<&Slot, SlotError> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    /// F9-F28 overlay for a slot.
    pub fn extended_functions(&self, index: usize) -> Result<ExtendedFunctions, SlotError> {
        self.extended
            .get(index)
            .copied()
            .ok_or(SlotError::IndexOutOfRange(index))
    }

    pub fn in_use_slot_count(&self) -> usize {
        self.slots.in_use_count()
    }

    /// Register a listener for every slot change.
    pub fn add_slot_listener(&self, listener: Arc<dyn SlotListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_slot_listener(&self, listener: &Arc<dyn SlotListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Shared handle to the listener set, usable from inside a callback.
    pub fn slot_listeners(&self) -> SlotListeners {
        self.listeners.clone()
    }

    // ========================================================================
    // Command station capabilities
    // ========================================================================

    pub fn prog_powers_off(&self) -> bool {
        self.prog_powers_off
    }

    pub fn set_prog_powers_off(&mut self, value: bool) {
        self.prog_powers_off = value;
    }

    pub fn can_read(&self) -> bool {
        self.can_read
    }

    pub fn set_can_read(&mut self, value: bool) {
        self.can_read = value;
    }

    pub fn command_station_type(&self) -> &str {
        &self.command_station_type
    }

    pub fn set_command_station_type(&mut self, name: impl Into<String>) {
        self.command_station_type = name.into();
        debug!(command_station = %self.command_station_type, "Command station type set");
    }
}
