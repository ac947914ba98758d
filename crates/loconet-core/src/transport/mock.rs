//! Mock transport for testing.

use std::sync::{Arc, Mutex, PoisonError};

use super::traits::{LocoNetTransport, TransportError};

/// Mock transport for unit testing the slot manager.
///
/// Clones share the same write log, so a test can keep one handle while
/// the manager owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether the bus is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured writes starting with `opcode`.
    pub fn writes_with_opcode(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.first() == Some(&opcode))
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Simulate bus disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Simulate bus reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocoNetTransport for MockTransport {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.to_vec());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
