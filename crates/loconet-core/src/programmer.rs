//! Decoder programming session types and state transitions.
//!
//! The programmer is single-user: one session at a time, held from the
//! accepted request until its result is handed over for delivery. The
//! command-station conversation for a session is
//!
//! ```text
//! IDLE --request--> COMMAND_PENDING --LACK accepted--> COMMAND_EXECUTING --slot read--> IDLE
//! ```
//!
//! with aborts back to IDLE on a busy, blind or unknown LACK and on timeout.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::events::ProgListener;
use crate::protocol::constants::*;
use crate::protocol::{CodecError, ProgAck};
use crate::timer::TimeoutKind;
use crate::transport::TransportError;

/// Programmer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProgState {
    #[default]
    Idle,
    CommandPending,
    CommandExecuting,
}

impl fmt::Display for ProgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgState::Idle => write!(f, "IDLE"),
            ProgState::CommandPending => write!(f, "COMMAND_PENDING"),
            ProgState::CommandExecuting => write!(f, "COMMAND_EXECUTING"),
        }
    }
}

/// Service-track programming modes, plus the ops-mode ones a caller may ask for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProgrammingMode {
    #[default]
    Paged,
    DirectBit,
    DirectByte,
    Register,
    Address,
    OpsByte,
    OpsBit,
}

impl ProgrammingMode {
    /// Direct-bit requests are carried out as direct-byte.
    pub fn normalized(self) -> Self {
        match self {
            ProgrammingMode::DirectBit => ProgrammingMode::DirectByte,
            other => other,
        }
    }

    /// PCMD mode bits for service-track operations.
    pub fn service_bits(self) -> Option<u8> {
        match self {
            ProgrammingMode::Paged => Some(PCMD_MODE_PAGED),
            ProgrammingMode::DirectByte => Some(PCMD_MODE_DIRECT_BYTE),
            ProgrammingMode::Register | ProgrammingMode::Address => Some(PCMD_MODE_REGISTER),
            _ => None,
        }
    }

    pub fn is_supported(self) -> bool {
        self.service_bits().is_some()
    }
}

impl fmt::Display for ProgrammingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgrammingMode::Paged => "paged",
            ProgrammingMode::DirectBit => "direct bit",
            ProgrammingMode::DirectByte => "direct byte",
            ProgrammingMode::Register => "register",
            ProgrammingMode::Address => "address",
            ProgrammingMode::OpsByte => "ops byte",
            ProgrammingMode::OpsBit => "ops bit",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgOp {
    Read,
    Write,
    Confirm,
}

impl ProgOp {
    /// Read and confirm wait for the decoder to answer, which is slow on
    /// the service track.
    pub fn awaits_decoder(self) -> bool {
        matches!(self, ProgOp::Read | ProgOp::Confirm)
    }
}

impl fmt::Display for ProgOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgOp::Read => write!(f, "read"),
            ProgOp::Write => write!(f, "write"),
            ProgOp::Confirm => write!(f, "confirm"),
        }
    }
}

bitflags! {
    /// Failure bits reported by the command station in PSTAT, plus the
    /// confirm mismatch detected locally. Bits combine.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DecoderStatus: u8 {
        const NO_DECODER = PSTAT_NO_DECODER;
        const WRITE_FAILED = PSTAT_WRITE_FAIL;
        const READ_FAILED = PSTAT_READ_FAIL;
        const USER_ABORTED = PSTAT_USER_ABORTED;
        const CONFIRM_FAILED = 0x10;
    }
}

impl DecoderStatus {
    pub fn from_pstat(pstat: u8) -> Self {
        Self::from_bits_truncate(pstat & 0x0F)
    }
}

impl fmt::Display for DecoderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join(" | "))
    }
}

/// Why a programming session failed; delivered to the session owner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProgrammingError {
    #[error("programmer busy")]
    ProgrammerBusy,

    #[error("command accepted but decoder never answered")]
    NoAcknowledgment,

    #[error("timed out waiting for the command station")]
    Timeout,

    #[error("unknown acknowledgment status 0x{status:02X}")]
    UnknownProtocol { status: u8 },

    #[error("decoder reported {0}")]
    Decoder(DecoderStatus),
}

/// Why a programming request was refused before anything was sent.
#[derive(Error, Debug)]
pub enum ProgrammerError {
    #[error("programmer in use")]
    Busy,

    #[error("programming mode {0} not supported")]
    ModeNotSupported(ProgrammingMode),

    #[error("invalid programming request: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to send programming request: {0}")]
    Transport(#[from] TransportError),
}

/// Outcome handed to the session owner, exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammingResult {
    pub op: ProgOp,
    pub cv: u16,
    /// Value read back (read, confirm) or written (write). `None` when the
    /// session ended without a decoder reply.
    pub value: Option<u8>,
    pub outcome: Result<(), ProgrammingError>,
}

impl ProgrammingResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// The one live programming session.
pub struct ProgrammingSession {
    pub owner: Arc<dyn ProgListener>,
    pub op: ProgOp,
    pub cv: u16,
    /// Value written, or the value a confirm expects.
    pub value: Option<u8>,
    pub service_mode: bool,
}

impl fmt::Debug for ProgrammingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgrammingSession")
            .field("op", &self.op)
            .field("cv", &self.cv)
            .field("value", &self.value)
            .field("service_mode", &self.service_mode)
            .finish_non_exhaustive()
    }
}

/// Inputs to the programmer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgEvent {
    /// A caller asked for a read/write/confirm.
    Request,
    /// LACK for a programming task.
    Ack(ProgAck),
    /// Slot read of the programming slot.
    SlotRead,
    /// The armed timeout expired.
    Timeout,
}

/// What the manager must do in response to a [`ProgEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do; the event is not meaningful in this state.
    Ignore,
    /// Refuse a request; a session is already live.
    Reject,
    /// Send the task and wait for the LACK.
    Start { timeout: TimeoutKind },
    /// Command station accepted; wait for the slot read.
    Execute { timeout: TimeoutKind },
    /// Slot read arrived; decode it and finish.
    Finish,
    /// Accepted with no reply to come; finish empty after a short delay.
    Blind,
    /// End the session with an error.
    Fail(ProgrammingError),
}

/// Transition table keyed by (state, event).
///
/// `session_busy` is true while a session is held, which can outlast the
/// command-station conversation (blind completion).
pub fn next(
    state: ProgState,
    event: ProgEvent,
    op: ProgOp,
    service_mode: bool,
    session_busy: bool,
) -> Transition {
    use ProgState::*;

    match (state, event) {
        (Idle, ProgEvent::Request) if !session_busy => Transition::Start {
            timeout: TimeoutKind::Short,
        },
        (_, ProgEvent::Request) => Transition::Reject,

        (CommandPending, ProgEvent::Ack(ack)) => match ack {
            ProgAck::Accepted | ProgAck::NotImplemented => Transition::Execute {
                timeout: if op.awaits_decoder() && service_mode {
                    TimeoutKind::Long
                } else {
                    TimeoutKind::Short
                },
            },
            ProgAck::Busy => Transition::Fail(ProgrammingError::ProgrammerBusy),
            ProgAck::AcceptedBlind => Transition::Blind,
            ProgAck::Unknown(status) => {
                Transition::Fail(ProgrammingError::UnknownProtocol { status })
            }
        },

        (CommandExecuting, ProgEvent::SlotRead) => Transition::Finish,

        // Ops mode: the command station took the task, the decoder stayed silent.
        (CommandExecuting, ProgEvent::Timeout) if !service_mode => {
            Transition::Fail(ProgrammingError::NoAcknowledgment)
        }
        (CommandPending | CommandExecuting, ProgEvent::Timeout) => {
            Transition::Fail(ProgrammingError::Timeout)
        }

        _ => Transition::Ignore,
    }
}
