//! Transport layer module.

pub mod mock;
pub mod stream;
pub mod traits;

pub use mock::MockTransport;
pub use stream::{FrameAssembler, FrameReader, StreamTransport};
pub use traits::{LocoNetTransport, TransportError};
