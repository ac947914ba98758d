//! Matching slot reads to address lookups.
//!
//! LocoNet has no transaction ids. A lookup sends OPC_LOCO_ADR and the
//! command station answers with OPC_SL_RD_DATA for the slot that holds (or
//! now holds) the address. The only way to tie the two together is that the
//! read directly follows the request on the bus. Two lookups in flight at
//! once can therefore be answered out of order; [`OrderingCorrelator`] does
//! not guard against that.

use std::collections::HashMap;
use std::sync::Arc;

use crate::events::SlotListener;
use crate::protocol::constants::*;
use crate::slot::Slot;

/// Pairs address lookups with the slot reads that answer them.
pub trait LookupCorrelator: Send {
    /// Remember `listener` as waiting for the slot of `address`, replacing
    /// any earlier waiter for the same address.
    fn register(&mut self, address: u16, listener: Arc<dyn SlotListener>);

    /// Forget the waiter for `address`. Returns false if there was none.
    fn cancel(&mut self, address: u16) -> bool;

    /// Called for a slot read before `observe` records it. Returns the
    /// waiter this read answers, removing it.
    fn resolve(&mut self, slot: &Slot) -> Option<Arc<dyn SlotListener>>;

    /// Called once per inbound frame, after it has been handled.
    fn observe(&mut self, opcode: u8);

    fn pending(&self) -> usize;
}

/// Correlation by message order: a slot read answers a lookup only when
/// the previous frame was an address request.
#[derive(Default)]
pub struct OrderingCorrelator {
    last_opcode: Option<u8>,
    waiting: HashMap<u16, Arc<dyn SlotListener>>,
}

impl OrderingCorrelator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LookupCorrelator for OrderingCorrelator {
    fn register(&mut self, address: u16, listener: Arc<dyn SlotListener>) {
        if self.waiting.insert(address, listener).is_some() {
            tracing::debug!(address = address, "Replacing pending slot lookup");
        }
    }

    fn cancel(&mut self, address: u16) -> bool {
        self.waiting.remove(&address).is_some()
    }

    fn resolve(&mut self, slot: &Slot) -> Option<Arc<dyn SlotListener>> {
        if self.last_opcode != Some(OPC_LOCO_ADR) {
            return None;
        }
        self.waiting.remove(&slot.loco_address())
    }

    fn observe(&mut self, opcode: u8) {
        // Power-busy frames can be interleaved anywhere; they say nothing
        // about what the next slot read answers.
        if opcode != OPC_GPBUSY {
            self.last_opcode = Some(opcode);
        }
    }

    fn pending(&self) -> usize {
        self.waiting.len()
    }
}
