//! Programmer side of the slot manager.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Delivery, SlotManager};
use crate::clock::Clock;
use crate::events::{ManagerEvent, ProgListener};
use crate::programmer::{
    self, DecoderStatus, ProgEvent, ProgOp, ProgState, ProgrammerError, ProgrammingError,
    ProgrammingMode, ProgrammingResult, ProgrammingSession, Transition,
};
use crate::protocol::constants::*;
use crate::protocol::{
    CodecError, ProgAck, ProgrammingSlotData, ProgrammingTask, encode_programming_task,
};
use crate::timer::TimeoutKind;
use crate::transport::LocoNetTransport;

/// Where a programming task is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammingTarget {
    /// Programming track, in the manager's current mode.
    Service,
    /// A locomotive on the main track.
    Ops { address: u16, long_address: bool },
}

impl ProgrammingTarget {
    fn is_service(&self) -> bool {
        matches!(self, ProgrammingTarget::Service)
    }
}

impl<T: LocoNetTransport, C: Clock> SlotManager<T, C> {
    pub fn read_cv(
        &mut self,
        cv: u16,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        self.start_programming(ProgOp::Read, cv, None, ProgrammingTarget::Service, listener)
    }

    pub fn write_cv(
        &mut self,
        cv: u16,
        value: u8,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        self.start_programming(
            ProgOp::Write,
            cv,
            Some(value),
            ProgrammingTarget::Service,
            listener,
        )
    }

    /// Read `cv` and check it holds `value`.
    pub fn confirm_cv(
        &mut self,
        cv: u16,
        value: u8,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        self.start_programming(
            ProgOp::Confirm,
            cv,
            Some(value),
            ProgrammingTarget::Service,
            listener,
        )
    }

    pub fn read_cv_ops_mode(
        &mut self,
        cv: u16,
        address: u16,
        long_address: bool,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        let target = ProgrammingTarget::Ops {
            address,
            long_address,
        };
        self.start_programming(ProgOp::Read, cv, None, target, listener)
    }

    pub fn write_cv_ops_mode(
        &mut self,
        cv: u16,
        value: u8,
        address: u16,
        long_address: bool,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        let target = ProgrammingTarget::Ops {
            address,
            long_address,
        };
        self.start_programming(ProgOp::Write, cv, Some(value), target, listener)
    }

    pub fn confirm_cv_ops_mode(
        &mut self,
        cv: u16,
        value: u8,
        address: u16,
        long_address: bool,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        let target = ProgrammingTarget::Ops {
            address,
            long_address,
        };
        self.start_programming(ProgOp::Confirm, cv, Some(value), target, listener)
    }

    pub fn mode(&self) -> ProgrammingMode {
        self.mode
    }

    /// Select the service-mode programming mode. Direct-bit becomes direct-byte.
    pub fn set_mode(&mut self, mode: ProgrammingMode) {
        let mode = mode.normalized();
        if mode != self.mode {
            let from = self.mode;
            self.mode = mode;
            self.emit(ManagerEvent::ModeChanged { from, to: mode });
        }
    }

    /// True if service-mode tasks can be issued in `mode`.
    pub fn has_mode(&self, mode: ProgrammingMode) -> bool {
        mode.normalized().is_supported()
    }

    pub fn prog_state(&self) -> ProgState {
        self.prog_state
    }

    /// True while a session is held, including a pending blind completion.
    pub fn programming_active(&self) -> bool {
        self.session.is_some()
    }

    fn set_prog_state(&mut self, to: ProgState) {
        let from = self.prog_state;
        if from != to {
            self.prog_state = to;
            self.emit(ManagerEvent::ProgStateChanged { from, to });
        }
    }

    fn step(&self, event: ProgEvent) -> Transition {
        let (op, service_mode) = self
            .session
            .as_ref()
            .map_or((ProgOp::Read, true), |s| (s.op, s.service_mode));
        programmer::next(
            self.prog_state,
            event,
            op,
            service_mode,
            self.session.is_some(),
        )
    }

    fn programming_command(
        &self,
        op: ProgOp,
        target: ProgrammingTarget,
    ) -> Result<u8, ProgrammerError> {
        match target {
            ProgrammingTarget::Service => {
                let bits = self
                    .mode
                    .service_bits()
                    .ok_or(ProgrammerError::ModeNotSupported(self.mode))?;
                Ok(match op {
                    ProgOp::Write => PCMD_SERVICE_WRITE | bits,
                    ProgOp::Read | ProgOp::Confirm => PCMD_SERVICE_READ | bits,
                })
            }
            ProgrammingTarget::Ops { .. } => Ok(match op {
                ProgOp::Write => PCMD_OPS_WRITE,
                ProgOp::Read | ProgOp::Confirm => PCMD_OPS_READ,
            }),
        }
    }

    fn start_programming(
        &mut self,
        op: ProgOp,
        cv: u16,
        value: Option<u8>,
        target: ProgrammingTarget,
        listener: Arc<dyn ProgListener>,
    ) -> Result<(), ProgrammerError> {
        let timeout = match self.step(ProgEvent::Request) {
            Transition::Start { timeout } => timeout,
            _ => {
                warn!(%op, cv = cv, state = %self.prog_state, "Programmer busy, request rejected");
                return Err(ProgrammerError::Busy);
            }
        };

        let pcmd = self.programming_command(op, target)?;
        let task = match target {
            ProgrammingTarget::Service => ProgrammingTask::service(pcmd, value, cv),
            ProgrammingTarget::Ops {
                address,
                long_address,
            } => {
                if address > MAX_LOCO_ADDRESS || (!long_address && address > 127) {
                    return Err(CodecError::AddressOutOfRange(address).into());
                }
                ProgrammingTask::ops(pcmd, value, cv, address)
            }
        };
        let msg = encode_programming_task(&task)?;

        // A new task supersedes a pending power restore.
        self.timers.cancel_power_restore();
        self.session = Some(ProgrammingSession {
            owner: listener,
            op,
            cv,
            value,
            service_mode: target.is_service(),
        });
        self.set_prog_state(ProgState::CommandPending);
        let now = self.clock.now_ms();
        self.timers.arm_programming(timeout, now + self.timeout_ms(timeout));

        if let Err(e) = self.send(&msg) {
            self.timers.cancel_programming();
            self.session = None;
            self.set_prog_state(ProgState::Idle);
            return Err(e.into());
        }
        info!(%op, cv = cv, pcmd = %format!("{pcmd:02X}"), ?target, "Programming task sent");
        Ok(())
    }

    fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Short => self.config.short_timeout_ms,
            TimeoutKind::Long => self.config.long_timeout_ms,
        }
    }

    pub(super) fn on_programming_ack(&mut self, ack: ProgAck) {
        match self.step(ProgEvent::Ack(ack)) {
            Transition::Execute { timeout } => {
                debug!(%ack, %timeout, "Programming task accepted");
                self.set_prog_state(ProgState::CommandExecuting);
                let now = self.clock.now_ms();
                self.timers.arm_programming(timeout, now + self.timeout_ms(timeout));
            }
            Transition::Blind => {
                debug!("Programming task accepted blind");
                self.timers.cancel_programming();
                self.set_prog_state(ProgState::Idle);
                let now = self.clock.now_ms();
                self.timers
                    .arm_blind_completion(now + self.config.blind_completion_delay_ms);
            }
            Transition::Fail(error) => {
                if let ProgrammingError::UnknownProtocol { status } = error {
                    warn!(status = %format!("{status:02X}"), "Unknown programming LACK status");
                } else {
                    warn!(%ack, "Programming task refused");
                }
                self.end_session(None, Err(error), true);
            }
            _ => debug!(%ack, state = %self.prog_state, "Programming LACK ignored"),
        }
    }

    pub(super) fn on_programming_reply(&mut self, data: ProgrammingSlotData) {
        if self.step(ProgEvent::SlotRead) != Transition::Finish {
            debug!(state = %self.prog_state, "Programming slot read ignored");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let mut status = DecoderStatus::from_pstat(data.pstat);
        let value = if session.op.awaits_decoder() {
            Some(data.cv_value())
        } else {
            session.value
        };
        if session.op == ProgOp::Confirm && status.is_empty() && value != session.value {
            status |= DecoderStatus::CONFIRM_FAILED;
        }
        if !status.is_empty() {
            info!(cv = session.cv, %status, "Decoder reported failure");
        }
        let outcome = if status.is_empty() {
            Ok(())
        } else {
            Err(ProgrammingError::Decoder(status))
        };
        self.end_session(value, outcome, true);
    }

    pub(super) fn on_programming_timeout(&mut self, kind: TimeoutKind) {
        if let Transition::Fail(error) = self.step(ProgEvent::Timeout) {
            warn!(%kind, state = %self.prog_state, %error, "Programming timed out");
            self.end_session(None, Err(error), true);
        }
    }

    pub(super) fn on_blind_completion(&mut self) {
        self.end_session(None, Ok(()), false);
    }

    /// Release the session and hand its result to the owner, after the
    /// reply delay when `deferred`.
    fn end_session(
        &mut self,
        value: Option<u8>,
        outcome: Result<(), ProgrammingError>,
        deferred: bool,
    ) {
        self.timers.cancel_programming();
        self.set_prog_state(ProgState::Idle);
        let Some(session) = self.session.take() else {
            return;
        };

        let now = self.clock.now_ms();
        if session.service_mode && self.prog_powers_off {
            self.timers
                .arm_power_restore(now + self.config.power_restore_delay_ms);
        }

        let delivery = Delivery {
            owner: session.owner,
            result: ProgrammingResult {
                op: session.op,
                cv: session.cv,
                value,
                outcome,
            },
        };
        if deferred {
            let delay = if session.service_mode {
                self.config.service_reply_delay_ms
            } else {
                self.config.ops_reply_delay_ms
            };
            self.timers.defer(now + delay, delivery);
        } else {
            delivery.owner.programming_op_reply(&delivery.result);
        }
    }
}
