//! Frame encoding and decoding.
//!
//! Outbound requests are built here, and inbound frames are decoded into an
//! [`InboundMessage`] so the slot manager can dispatch on a typed event
//! instead of raw opcode bytes.
//!
//! # Immediate packet layout
//!
//! ```text
//! ED 0B 7F <reps> <dhi> <im1> <im2> <im3> <im4> <im5> <chk>
//! ```
//!
//! - `reps`: bits 0-2 repeat count, bits 4-6 packet length (check byte excluded)
//! - `dhi`: bit n holds bit 7 of `im(n+1)`, since data bytes are 7-bit on the wire

use thiserror::Error;

use super::ack::LongAck;
use super::constants::*;
use super::message::LnMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid DCC packet: {0}")]
    InvalidPacket(PacketFault),

    #[error("frame too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("not an opcode byte: 0x{0:02X}")]
    InvalidOpcode(u8),

    #[error("slot index {0} out of range")]
    SlotOutOfRange(u8),

    #[error("CV {0} outside 1..=1024")]
    CvOutOfRange(u16),

    #[error("locomotive address {0} outside 0..=10239")]
    AddressOutOfRange(u16),
}

/// Why a DCC packet was refused before transmission.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    #[error("repeat count {0} exceeds 7")]
    TooManyRepeats(u8),
    #[error("length {0} outside 2..=6 bytes")]
    BadLength(usize),
}

// ============================================================================
// Decoded Messages
// ============================================================================

/// The ten data bytes of a slot read/write, between slot number and checksum.
///
/// For the programming slot the same positions carry PCMD, PSTAT, HOPSA,
/// LOPSA, TRK, CVH, CVL and DATA7; see [`ProgrammingSlotData`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotData {
    pub stat1: u8,
    pub adr: u8,
    pub spd: u8,
    pub dirf: u8,
    pub trk: u8,
    pub ss2: u8,
    pub adr2: u8,
    pub snd: u8,
    pub id1: u8,
    pub id2: u8,
}

impl SlotData {
    fn from_frame(m: &LnMessage) -> Self {
        Self {
            stat1: m.element(3),
            adr: m.element(4),
            spd: m.element(5),
            dirf: m.element(6),
            trk: m.element(7),
            ss2: m.element(8),
            adr2: m.element(9),
            snd: m.element(10),
            id1: m.element(11),
            id2: m.element(12),
        }
    }

    pub fn loco_address(&self) -> u16 {
        (self.adr2 as u16) * 128 + self.adr as u16
    }
}

/// Programming-slot view of [`SlotData`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgrammingSlotData {
    pub pcmd: u8,
    pub pstat: u8,
    pub hopsa: u8,
    pub lopsa: u8,
    pub trk: u8,
    pub cvh: u8,
    pub cvl: u8,
    pub data7: u8,
}

impl From<&SlotData> for ProgrammingSlotData {
    fn from(d: &SlotData) -> Self {
        Self {
            pcmd: d.stat1,
            pstat: d.adr,
            hopsa: d.spd,
            lopsa: d.dirf,
            trk: d.trk,
            cvh: d.ss2,
            cvl: d.adr2,
            data7: d.snd,
        }
    }
}

impl ProgrammingSlotData {
    /// CV value, with bit 7 recovered from CVH bit 1.
    pub fn cv_value(&self) -> u8 {
        (self.data7 & 0x7F) | ((self.cvh & 0x02) << 6)
    }

    /// Human-readable (1-based) CV number.
    pub fn cv_number(&self) -> u16 {
        let addr = (self.cvl as u16 & 0x7F)
            | ((self.cvh as u16 & 0x01) << 7)
            | ((self.cvh as u16 & 0x30) << 4);
        addr + 1
    }

    /// Ops-mode locomotive address carried in HOPSA/LOPSA.
    pub fn ops_address(&self) -> u16 {
        (self.hopsa as u16 & 0x7F) * 128 + (self.lopsa as u16 & 0x7F)
    }
}

/// A DCC packet carried inside OPC_IMM_PACKET, split into address and
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectPacket {
    pub address: u16,
    pub long_address: bool,
    /// Instruction bytes following the address, packed big-endian.
    pub instruction: u32,
}

/// Function group addressed by a DCC function instruction beyond F8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionGroup {
    /// `1010dddd`: F9 (bit 0) to F12 (bit 3).
    F9To12(u8),
    /// `11011110 dddddddd`: F13 (bit 0) to F20 (bit 7).
    F13To20(u8),
    /// `11011111 dddddddd`: F21 (bit 0) to F28 (bit 7).
    F21To28(u8),
}

impl DirectPacket {
    /// Extended function group if this packet sets F9-F28.
    pub fn function_group(&self) -> Option<FunctionGroup> {
        let pkt = self.instruction;
        if (pkt & 0x0FFF_FFF0) == 0xA0 {
            return Some(FunctionGroup::F9To12((pkt & 0x0F) as u8));
        }
        if (pkt & 0xFFFF_FE00) == 0xDE00 {
            let bits = (pkt & 0xFF) as u8;
            return Some(if pkt & 0x100 == 0 {
                FunctionGroup::F13To20(bits)
            } else {
                FunctionGroup::F21To28(bits)
            });
        }
        None
    }
}

/// Typed view of an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// OPC_SL_RD_DATA (`write == false`) or OPC_WR_SL_DATA.
    SlotData {
        slot: u8,
        data: SlotData,
        write: bool,
    },
    Speed { slot: u8, speed: u8 },
    DirF { slot: u8, dirf: u8 },
    Sound { slot: u8, snd: u8 },
    Stat1 { slot: u8, stat1: u8 },
    MoveSlots { src: u8, dst: u8 },
    RequestSlotData { slot: u8 },
    LocoAddressRequest { address: u16 },
    LongAck(LongAck),
    /// OPC_IMM_PACKET; `packet` is `None` unless it is a decodable send request.
    ImmediatePacket { packet: Option<DirectPacket> },
    PowerBusy,
    PowerOn,
    PowerOff,
    Other { opcode: u8 },
}

impl InboundMessage {
    /// Slot number referenced by a slot-specific message.
    pub fn slot(&self) -> Option<u8> {
        match self {
            InboundMessage::SlotData { slot, .. }
            | InboundMessage::Speed { slot, .. }
            | InboundMessage::DirF { slot, .. }
            | InboundMessage::Sound { slot, .. }
            | InboundMessage::Stat1 { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

fn require(m: &LnMessage, len: usize) -> Result<(), CodecError> {
    if m.len() < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual: m.len(),
        });
    }
    Ok(())
}

fn slot_index(raw: u8) -> Result<u8, CodecError> {
    if raw as usize >= SLOT_COUNT {
        return Err(CodecError::SlotOutOfRange(raw));
    }
    Ok(raw)
}

/// Decode an inbound frame into its typed form.
pub fn decode(m: &LnMessage) -> Result<InboundMessage, CodecError> {
    let msg = match m.opcode() {
        OPC_SL_RD_DATA | OPC_WR_SL_DATA => {
            require(m, SLOT_DATA_LEN)?;
            InboundMessage::SlotData {
                slot: slot_index(m.element(2))?,
                data: SlotData::from_frame(m),
                write: m.opcode() == OPC_WR_SL_DATA,
            }
        }
        OPC_LOCO_SPD | OPC_LOCO_DIRF | OPC_LOCO_SND | OPC_SLOT_STAT1 => {
            require(m, 4)?;
            let slot = slot_index(m.element(1))?;
            let value = m.element(2);
            match m.opcode() {
                OPC_LOCO_SPD => InboundMessage::Speed { slot, speed: value },
                OPC_LOCO_DIRF => InboundMessage::DirF { slot, dirf: value },
                OPC_LOCO_SND => InboundMessage::Sound { slot, snd: value },
                _ => InboundMessage::Stat1 { slot, stat1: value },
            }
        }
        OPC_MOVE_SLOTS => {
            require(m, 4)?;
            InboundMessage::MoveSlots {
                src: m.element(1),
                dst: m.element(2),
            }
        }
        OPC_RQ_SL_DATA => {
            require(m, 4)?;
            InboundMessage::RequestSlotData {
                slot: m.element(1),
            }
        }
        OPC_LOCO_ADR => {
            require(m, 4)?;
            InboundMessage::LocoAddressRequest {
                address: (m.element(1) as u16 & 0x7F) * 128 + (m.element(2) as u16 & 0x7F),
            }
        }
        OPC_LONG_ACK => {
            require(m, 4)?;
            InboundMessage::LongAck(LongAck {
                responding_to: m.element(1),
                status: m.element(2),
            })
        }
        OPC_IMM_PACKET => InboundMessage::ImmediatePacket {
            packet: decode_direct_packet(m),
        },
        OPC_GPBUSY => InboundMessage::PowerBusy,
        OPC_GPON => InboundMessage::PowerOn,
        OPC_GPOFF => InboundMessage::PowerOff,
        opcode => InboundMessage::Other { opcode },
    };
    Ok(msg)
}

/// Unpack the DCC packet of an OPC_IMM_PACKET send request.
///
/// Returns `None` for anything that is not a send request carrying at least
/// an address byte and one instruction byte.
pub fn decode_direct_packet(m: &LnMessage) -> Option<DirectPacket> {
    if m.len() < IMM_PACKET_LEN - 1
        || m.element(0) != OPC_IMM_PACKET
        || m.element(1) != IMM_PACKET_LEN as u8
        || m.element(2) != IMM_PACKET_SEND
    {
        return None;
    }
    let reps = m.element(3);
    if (reps & 0x70) < 0x20 {
        return None;
    }
    let dhi = m.element(4);
    let first = m.element(5);

    // Long addresses start 11xxxxxx; bit 7 travels in DHI bit 0.
    let long_address = (first & 0x40) != 0 && (dhi & 0x01) != 0;
    let address = if long_address {
        let mut a = (first as u16 & 0x3F) * 256 + m.element(6) as u16;
        if dhi & 0x02 != 0 {
            a += 128;
        }
        a
    } else {
        let mut a = first as u16;
        if dhi & 0x01 != 0 {
            a += 128;
        }
        a
    };

    let mut n = ((reps & 0x70) >> 4) as usize;
    let (start, mut high) = if long_address {
        n -= 2;
        (7, dhi >> 2)
    } else {
        n -= 1;
        (6, dhi >> 1)
    };
    let mut instruction: u32 = 0;
    for i in 0..n {
        instruction = (instruction << 8) + (m.element(start + i) & 0x7F) as u32;
        if high & 0x01 != 0 {
            instruction += 128;
        }
        high >>= 1;
    }

    Some(DirectPacket {
        address,
        long_address,
        instruction,
    })
}

// ============================================================================
// Encoders
// ============================================================================

/// Wrap a DCC packet (check byte included) into an OPC_IMM_PACKET frame.
pub fn encode_send_packet(packet: &[u8], repeats: u8) -> Result<LnMessage, CodecError> {
    if repeats > IMM_MAX_REPEATS {
        return Err(CodecError::InvalidPacket(PacketFault::TooManyRepeats(
            repeats,
        )));
    }
    if !(DCC_PACKET_MIN_LEN..=DCC_PACKET_MAX_LEN).contains(&packet.len()) {
        return Err(CodecError::InvalidPacket(PacketFault::BadLength(
            packet.len(),
        )));
    }
    // The check byte is regenerated by the command station.
    let payload = &packet[..packet.len() - 1];
    let length = payload.len() as u8;

    let mut elements = [0u8; IMM_PACKET_LEN - 1];
    elements[0] = OPC_IMM_PACKET;
    elements[1] = IMM_PACKET_LEN as u8;
    elements[2] = IMM_PACKET_SEND;
    elements[3] = (repeats & 0x07) + 16 * (length & 0x07);
    let mut dhi = 0u8;
    for (i, &b) in payload.iter().enumerate() {
        if b & 0x80 != 0 {
            dhi |= 1 << i;
        }
        elements[5 + i] = b & 0x7F;
    }
    elements[4] = dhi;
    Ok(LnMessage::from_elements(&elements))
}

/// Parameters of a programming-slot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammingTask {
    pub pcmd: u8,
    /// Value to write; `None` for reads, which send the all-ones pattern.
    pub value: Option<u8>,
    /// Human-readable CV number, 1..=1024.
    pub cv: u16,
    pub hopsa: u8,
    pub lopsa: u8,
}

impl ProgrammingTask {
    /// Task for service mode, with no ops address.
    pub fn service(pcmd: u8, value: Option<u8>, cv: u16) -> Self {
        Self {
            pcmd,
            value,
            cv,
            hopsa: 0,
            lopsa: 0,
        }
    }

    /// Task addressed to a locomotive on the main track.
    pub fn ops(pcmd: u8, value: Option<u8>, cv: u16, address: u16) -> Self {
        Self {
            pcmd,
            value,
            cv,
            hopsa: ((address / 128) & 0x7F) as u8,
            lopsa: (address & 0x7F) as u8,
        }
    }
}

/// Build the OPC_WR_SL_DATA frame that starts a programming task.
///
/// CVH layout: bit 0 = CV address bit 7, bit 1 = value bit 7,
/// bits 4-5 = CV address bits 8-9.
pub fn encode_programming_task(task: &ProgrammingTask) -> Result<LnMessage, CodecError> {
    if !(1..=1024).contains(&task.cv) {
        return Err(CodecError::CvOutOfRange(task.cv));
    }
    let addr = task.cv - 1;
    let val = task.value.unwrap_or(0xFF);
    let cvh = ((addr & 0x300) / 16) as u8 + ((addr & 0x80) / 128) as u8 + (val & 0x80) / 128 * 2;

    Ok(LnMessage::from_elements(&[
        OPC_WR_SL_DATA,
        SLOT_DATA_LEN as u8,
        PRG_SLOT,
        task.pcmd,
        0,
        task.hopsa,
        task.lopsa,
        0, // TRK
        cvh,
        (addr & 0x7F) as u8,
        val & 0x7F,
        THROTTLE_ID_NONE,
        THROTTLE_ID_NONE,
    ]))
}

/// OPC_RQ_SL_DATA for one slot.
pub fn encode_request_slot_data(slot: u8) -> LnMessage {
    LnMessage::from_elements(&[OPC_RQ_SL_DATA, slot & 0x7F, 0])
}

/// OPC_LOCO_ADR asking the command station for the slot of `address`.
pub fn encode_loco_address_request(address: u16) -> Result<LnMessage, CodecError> {
    if address > MAX_LOCO_ADDRESS {
        return Err(CodecError::AddressOutOfRange(address));
    }
    Ok(LnMessage::from_elements(&[
        OPC_LOCO_ADR,
        ((address / 128) & 0x7F) as u8,
        (address & 0x7F) as u8,
    ]))
}

/// OPC_GPON.
pub fn encode_power_on() -> LnMessage {
    LnMessage::from_elements(&[OPC_GPON])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dcc_packet(bytes: &[u8]) -> Vec<u8> {
        let mut p = bytes.to_vec();
        p.push(bytes.iter().fold(0, |acc, b| acc ^ b));
        p
    }

    #[test]
    fn test_send_packet_long_address_f13() {
        // Long address 1234, F13-F20 = 0x55
        let packet = dcc_packet(&[0xC4, 0xD2, 0xDE, 0x55]);
        let m = encode_send_packet(&packet, 2).unwrap();
        assert_eq!(m.len(), IMM_PACKET_LEN);
        assert_eq!(
            &m.as_bytes()[..10],
            &[0xED, 0x0B, 0x7F, 0x42, 0x07, 0x44, 0x52, 0x5E, 0x55, 0x00]
        );
        assert!(m.checksum_ok());

        let direct = decode_direct_packet(&m).unwrap();
        assert_eq!(direct.address, 1234);
        assert!(direct.long_address);
        assert_eq!(direct.instruction, 0xDE55);
        assert_eq!(direct.function_group(), Some(FunctionGroup::F13To20(0x55)));
    }

    #[test]
    fn test_send_packet_short_address_f9() {
        let packet = dcc_packet(&[0x03, 0xA5]);
        let m = encode_send_packet(&packet, 0).unwrap();
        let direct = decode_direct_packet(&m).unwrap();
        assert_eq!(direct.address, 3);
        assert!(!direct.long_address);
        assert_eq!(direct.instruction, 0xA5);
        assert_eq!(direct.function_group(), Some(FunctionGroup::F9To12(0x05)));
    }

    #[test]
    fn test_short_address_with_bit6_is_not_long() {
        // Address 100 = 0x64 has bit 6 set but is a short address.
        let packet = dcc_packet(&[0x64, 0xDF, 0x81]);
        let m = encode_send_packet(&packet, 0).unwrap();
        let direct = decode_direct_packet(&m).unwrap();
        assert_eq!(direct.address, 100);
        assert!(!direct.long_address);
        assert_eq!(direct.function_group(), Some(FunctionGroup::F21To28(0x81)));
    }

    #[test]
    fn test_speed_packet_is_not_extended_function() {
        let packet = dcc_packet(&[0x03, 0x3F, 0x90]);
        let m = encode_send_packet(&packet, 0).unwrap();
        assert_eq!(decode_direct_packet(&m).unwrap().function_group(), None);
    }

    #[test]
    fn test_send_packet_rejects_bad_input() {
        assert_eq!(
            encode_send_packet(&[0x03, 0xA5, 0xA6], 8),
            Err(CodecError::InvalidPacket(PacketFault::TooManyRepeats(8)))
        );
        assert_eq!(
            encode_send_packet(&[0x03], 1),
            Err(CodecError::InvalidPacket(PacketFault::BadLength(1)))
        );
        assert_eq!(
            encode_send_packet(&[0; 7], 1),
            Err(CodecError::InvalidPacket(PacketFault::BadLength(7)))
        );
    }

    #[test]
    fn test_programming_task_cvh_layout() {
        // CV 897 -> wire address 896 = 0x380: bits 8-9 -> CVH bits 4-5, bit 7 -> CVH bit 0
        let task = ProgrammingTask::service(0x6B, Some(0xAA), 897);
        let m = encode_programming_task(&task).unwrap();
        assert_eq!(
            &m.as_bytes()[..13],
            &[
                0xEF, 0x0E, 0x7C, 0x6B, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00, 0x2A, 0x7F, 0x7F
            ]
        );
    }

    #[test]
    fn test_programming_task_read_sends_all_ones() {
        let task = ProgrammingTask::service(0x2B, None, 1);
        let m = encode_programming_task(&task).unwrap();
        assert_eq!(m.element(8), 0x02);
        assert_eq!(m.element(9), 0x00);
        assert_eq!(m.element(10), 0x7F);
    }

    #[test]
    fn test_programming_task_ops_address() {
        let task = ProgrammingTask::ops(PCMD_OPS_WRITE, Some(3), 29, 1234);
        let m = encode_programming_task(&task).unwrap();
        assert_eq!(m.element(5), 9);
        assert_eq!(m.element(6), 82);
    }

    #[test]
    fn test_programming_task_cv_bounds() {
        let task = ProgrammingTask::service(0x2B, None, 0);
        assert_eq!(
            encode_programming_task(&task),
            Err(CodecError::CvOutOfRange(0))
        );
        let task = ProgrammingTask::service(0x2B, None, 1025);
        assert!(encode_programming_task(&task).is_err());
    }

    #[test]
    fn test_decode_slot_read() {
        let m = LnMessage::from_elements(&[
            0xE7, 0x0E, 0x05, 0x33, 0x52, 0x10, 0x31, 0x07, 0x00, 0x09, 0x02, 0x00, 0x00,
        ]);
        let InboundMessage::SlotData { slot, data, write } = decode(&m).unwrap() else {
            panic!("expected slot data");
        };
        assert_eq!(slot, 5);
        assert!(!write);
        assert_eq!(data.loco_address(), 1234);
        assert_eq!(data.spd, 0x10);
        assert_eq!(data.snd, 0x02);
    }

    #[test]
    fn test_decode_rejects_out_of_range_slot() {
        let m = LnMessage::from_bytes(&[0xA0, 0x85, 0x10, 0x00]).unwrap();
        assert_eq!(decode(&m), Err(CodecError::SlotOutOfRange(0x85)));
    }

    #[test]
    fn test_decode_long_ack_and_loco_adr() {
        let m = LnMessage::from_elements(&[0xB4, 0x6F, 0x01]);
        assert!(matches!(
            decode(&m).unwrap(),
            InboundMessage::LongAck(lack) if lack.is_programming() && lack.status == 1
        ));
        let m = encode_loco_address_request(1234).unwrap();
        assert_eq!(
            decode(&m).unwrap(),
            InboundMessage::LocoAddressRequest { address: 1234 }
        );
    }

    #[test]
    fn test_programming_slot_view() {
        let data = SlotData {
            stat1: 0x2B,
            adr: PSTAT_NO_DECODER,
            ss2: 0x03,
            adr2: 0x10,
            snd: 0x15,
            ..Default::default()
        };
        let prog = ProgrammingSlotData::from(&data);
        assert_eq!(prog.pcmd, 0x2B);
        assert_eq!(prog.pstat, PSTAT_NO_DECODER);
        assert_eq!(prog.cv_value(), 0x95);
        assert_eq!(prog.cv_number(), 0x90 + 1);
    }

    proptest! {
        #[test]
        fn programming_task_decodes_to_inputs(
            cv in 1u16..=1024,
            value in any::<u8>(),
            pcmd in 0u8..0x80,
        ) {
            let m = encode_programming_task(&ProgrammingTask::service(pcmd, Some(value), cv)).unwrap();
            let InboundMessage::SlotData { slot, data, write } = decode(&m).unwrap() else {
                panic!("expected slot data");
            };
            prop_assert_eq!(slot, PRG_SLOT);
            prop_assert!(write);
            let prog = ProgrammingSlotData::from(&data);
            prop_assert_eq!(prog.cv_number(), cv);
            prop_assert_eq!(prog.cv_value(), value);
            prop_assert_eq!(prog.pcmd, pcmd);
        }
    }
}
