//! LocoNet-Core: command-station slot manager and decoder programmer.
//!
//! This crate mirrors the 128-slot table of a LocoNet command station,
//! keeps it fresh, resolves locomotive addresses to slots, and runs
//! single-user CV programming (read, write, confirm) in service and ops
//! mode on top of the same bus.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Opcodes, frame checksum/length, typed decode, encoders
//! - **Transport**: Frame output abstraction (byte stream, mock) and input framing
//! - **Slot**: The slot table and the F9-F28 overlay
//! - **Programmer**: Programming session types and the transition table
//! - **Timer**: Deadline bookkeeping, polled by the manager
//! - **Events**: Slot/programming listeners and manager events
//! - **Manager**: The protocol engine tying it all together
//! - **Driver**: Runs a manager on its own thread
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use loconet_core::{ManagerConfig, MockTransport, ProgrammingResult, SlotManager, SystemClock};
//!
//! let mut manager = SlotManager::new(
//!     MockTransport::new(),
//!     SystemClock::new(),
//!     ManagerConfig::default(),
//! );
//! manager
//!     .read_cv(29, Arc::new(|r: &ProgrammingResult| println!("{r:?}")))
//!     .expect("programmer busy");
//! manager.poll();
//! ```

pub mod clock;
pub mod config;
pub mod driver;
pub mod events;
pub mod manager;
pub mod programmer;
pub mod protocol;
pub mod slot;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ManagerConfig};
pub use driver::{ManagerHandle, ManagerService, ServiceError};
pub use events::{
    ManagerEvent, ManagerObserver, NullObserver, ProgListener, SlotListener, SlotListeners,
    TracingObserver, TracingSlotListener,
};
pub use manager::{
    CommandError, LookupCorrelator, OrderingCorrelator, ProgrammingTarget, SlotManager,
};
pub use programmer::{
    DecoderStatus, ProgOp, ProgState, ProgrammerError, ProgrammingError, ProgrammingMode,
    ProgrammingResult,
};
pub use protocol::{CodecError, InboundMessage, LnMessage};
pub use slot::{Direction, ExtendedFunctions, Slot, SlotError, SlotStatus, SlotStore};
pub use transport::{
    FrameReader, LocoNetTransport, MockTransport, StreamTransport, TransportError,
};
