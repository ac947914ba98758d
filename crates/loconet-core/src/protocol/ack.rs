//! Long-acknowledge parsing.
//!
//! The command station answers a programming task with OPC_LONG_ACK. The
//! LACK carries the acknowledged opcode but no slot number, so a LACK is
//! only attributed to the programmer while a command is pending.

use std::fmt;

use super::constants::*;

/// Status of a programming-task acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgAck {
    /// Task accepted, a slot read will follow.
    Accepted,
    /// "Not implemented"; some devices still reply, so treated as accepted.
    NotImplemented,
    /// Command station busy, task aborted.
    Busy,
    /// Task accepted, no reply will follow.
    AcceptedBlind,
    /// Unrecognized status byte.
    Unknown(u8),
}

impl ProgAck {
    pub fn from_status(status: u8) -> Self {
        match status {
            LACK_ACCEPTED => ProgAck::Accepted,
            LACK_NOT_IMPLEMENTED => ProgAck::NotImplemented,
            LACK_BUSY => ProgAck::Busy,
            LACK_ACCEPTED_BLIND => ProgAck::AcceptedBlind,
            other => ProgAck::Unknown(other),
        }
    }
}

impl fmt::Display for ProgAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgAck::Accepted => write!(f, "accepted"),
            ProgAck::NotImplemented => write!(f, "not implemented"),
            ProgAck::Busy => write!(f, "busy"),
            ProgAck::AcceptedBlind => write!(f, "accepted blind"),
            ProgAck::Unknown(code) => write!(f, "unknown 0x{code:02X}"),
        }
    }
}

/// Decoded OPC_LONG_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongAck {
    /// Low 7 bits of the acknowledged opcode.
    pub responding_to: u8,
    /// Raw ACK1 status byte.
    pub status: u8,
}

impl LongAck {
    /// True if this LACK answers a slot write, i.e. a programming task.
    pub fn is_programming(&self) -> bool {
        (self.responding_to & LACK_PROG_MASK) == LACK_PROG_OPCODE
    }

    pub fn prog_status(&self) -> ProgAck {
        ProgAck::from_status(self.status)
    }
}
