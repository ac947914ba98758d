//! LocoNet protocol constants.
//!
//! Opcode values, slot numbering and status bit layouts as documented for
//! Digitrax-compatible command stations.

// ============================================================================
// Slot Numbering
// ============================================================================

/// Number of slots held by the command station.
pub const SLOT_COUNT: usize = 128;

/// Reserved slot used for decoder programming tasks.
pub const PRG_SLOT: u8 = 0x7C; // 124

/// Highest slot number that can hold a locomotive.
pub const MAX_LOCO_SLOT: u8 = 120;

/// Highest legal locomotive address (14-bit DCC long address space used by LocoNet).
pub const MAX_LOCO_ADDRESS: u16 = 10239;

// ============================================================================
// Opcodes - Power and Bus Control (2 bytes)
// ============================================================================

/// Global power busy, used as a bus keepalive.
pub const OPC_GPBUSY: u8 = 0x81;
/// Global power off.
pub const OPC_GPOFF: u8 = 0x82;
/// Global power on.
pub const OPC_GPON: u8 = 0x83;

// ============================================================================
// Opcodes - Slot Updates (4 bytes)
// ============================================================================

/// Set slot speed.
pub const OPC_LOCO_SPD: u8 = 0xA0;
/// Set slot direction and F0-F4.
pub const OPC_LOCO_DIRF: u8 = 0xA1;
/// Set slot F5-F8.
pub const OPC_LOCO_SND: u8 = 0xA2;
/// Long acknowledge.
pub const OPC_LONG_ACK: u8 = 0xB4;
/// Write slot STAT1 byte.
pub const OPC_SLOT_STAT1: u8 = 0xB5;
/// Move slot contents (also used for NULL move / dispatch).
pub const OPC_MOVE_SLOTS: u8 = 0xBA;
/// Request slot data.
pub const OPC_RQ_SL_DATA: u8 = 0xBB;
/// Request slot for a locomotive address.
pub const OPC_LOCO_ADR: u8 = 0xBF;

// ============================================================================
// Opcodes - Variable Length
// ============================================================================

/// Slot data read (command station -> bus).
pub const OPC_SL_RD_DATA: u8 = 0xE7;
/// Immediate DCC packet.
pub const OPC_IMM_PACKET: u8 = 0xED;
/// Slot data write (throttle -> command station).
pub const OPC_WR_SL_DATA: u8 = 0xEF;

// ============================================================================
// Slot STAT1 Layout
// ============================================================================

/// Mask selecting the slot-use bits in STAT1.
pub const STAT1_USE_MASK: u8 = 0x30;
pub const LOCO_IN_USE: u8 = 0x30;
pub const LOCO_IDLE: u8 = 0x20;
pub const LOCO_COMMON: u8 = 0x10;
pub const LOCO_FREE: u8 = 0x00;

// ============================================================================
// DIRF / SND Layout
// ============================================================================

/// Direction bit; set means reverse.
pub const DIRF_DIR: u8 = 0x20;
pub const DIRF_F0: u8 = 0x10;
/// F1-F4 occupy the low nibble of DIRF.
pub const DIRF_F1_F4_MASK: u8 = 0x0F;
/// F5-F8 occupy the low nibble of SND.
pub const SND_F5_F8_MASK: u8 = 0x0F;

// ============================================================================
// Programming Slot
// ============================================================================

/// Programming status: no decoder detected.
pub const PSTAT_NO_DECODER: u8 = 0x01;
/// Programming status: write acknowledge failed.
pub const PSTAT_WRITE_FAIL: u8 = 0x02;
/// Programming status: read failed, no acknowledge.
pub const PSTAT_READ_FAIL: u8 = 0x04;
/// Programming status: aborted by user.
pub const PSTAT_USER_ABORTED: u8 = 0x08;

/// Service mode write base command (0x40 in docs, 0x43 observed).
pub const PCMD_SERVICE_WRITE: u8 = 0x43;
/// Service mode read/verify base command (0x00 in docs, 0x03 observed).
pub const PCMD_SERVICE_READ: u8 = 0x03;
pub const PCMD_MODE_PAGED: u8 = 0x20;
pub const PCMD_MODE_DIRECT_BYTE: u8 = 0x28;
pub const PCMD_MODE_REGISTER: u8 = 0x10;
/// Ops mode byte write with feedback.
pub const PCMD_OPS_WRITE: u8 = 0x67;
/// Ops mode read (0x2C in docs, 0x2F observed).
pub const PCMD_OPS_READ: u8 = 0x2F;

// ============================================================================
// Long Acknowledge Codes
// ============================================================================

/// `(ack1 & LACK_PROG_MASK) == LACK_PROG_OPCODE` marks a programming LACK.
pub const LACK_PROG_MASK: u8 = 0xEF;
pub const LACK_PROG_OPCODE: u8 = 0x6F;

pub const LACK_BUSY: u8 = 0x00;
pub const LACK_ACCEPTED: u8 = 0x01;
pub const LACK_ACCEPTED_BLIND: u8 = 0x40;
/// "Not implemented"; ops-mode capable devices may still answer later.
pub const LACK_NOT_IMPLEMENTED: u8 = 0x7F;

// ============================================================================
// Immediate Packet Layout
// ============================================================================

/// Total length of an OPC_IMM_PACKET frame.
pub const IMM_PACKET_LEN: usize = 11;
/// Byte 2 value marking a "send packet" immediate request.
pub const IMM_PACKET_SEND: u8 = 0x7F;
/// Maximum repeat count the command station accepts.
pub const IMM_MAX_REPEATS: u8 = 7;
/// DCC packet bounds, including the trailing check byte.
pub const DCC_PACKET_MIN_LEN: usize = 2;
pub const DCC_PACKET_MAX_LEN: usize = 6;

/// Throttle ID written into programming tasks.
pub const THROTTLE_ID_NONE: u8 = 0x7F;

/// Slot data frame length (opcode through checksum).
pub const SLOT_DATA_LEN: usize = 14;
