//! Bus transport abstraction.
//!
//! Defines the `LocoNetTransport` trait the slot manager writes frames
//! through, allowing different implementations (serial adapters, network
//! bridges, mock, etc.).

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bad checksum on {opcode:02X} frame: expected {expected:02X}, got {actual:02X}")]
    Checksum { opcode: u8, expected: u8, actual: u8 },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Transport disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a LocoNet connection.
///
/// Inbound frames are pushed to the slot manager by whoever owns the read
/// side, with framing and checksum already resolved.
pub trait LocoNetTransport: Send {
    /// Send one complete frame, checksum included.
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Check if the bus connection is still up.
    fn is_connected(&self) -> bool {
        true
    }
}

impl<T: LocoNetTransport + Sync> LocoNetTransport for Arc<T> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.as_ref().send_frame(frame)
    }

    fn is_connected(&self) -> bool {
        self.as_ref().is_connected()
    }
}
