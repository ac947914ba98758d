//! Protocol module - LocoNet wire definitions.

pub mod ack;
pub mod codec;
pub mod constants;
pub mod message;

pub use ack::{LongAck, ProgAck};
pub use codec::{
    CodecError, DirectPacket, FunctionGroup, InboundMessage, PacketFault, ProgrammingSlotData,
    ProgrammingTask, SlotData, decode, decode_direct_packet, encode_loco_address_request,
    encode_power_on, encode_programming_task, encode_request_slot_data, encode_send_packet,
};
pub use constants::*;
pub use message::{LnMessage, checksum, frame_length};
