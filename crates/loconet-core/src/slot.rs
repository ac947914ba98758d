//! Slot table.
//!
//! The command station keeps a fixed table of 128 slots. We mirror it here:
//! every slot is allocated once and afterwards only overwritten by bus data.

use std::fmt;
use std::ops::RangeInclusive;

use thiserror::Error;

use crate::protocol::constants::*;
use crate::protocol::{FunctionGroup, InboundMessage, ProgrammingSlotData, SlotData};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot index {0} outside 0..=127")]
    IndexOutOfRange(usize),
}

/// Slot use as encoded in STAT1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    #[default]
    Free,
    Common,
    Idle,
    InUse,
}

impl SlotStatus {
    pub fn from_stat1(stat1: u8) -> Self {
        match stat1 & STAT1_USE_MASK {
            LOCO_IN_USE => SlotStatus::InUse,
            LOCO_IDLE => SlotStatus::Idle,
            LOCO_COMMON => SlotStatus::Common,
            _ => SlotStatus::Free,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Free => write!(f, "FREE"),
            SlotStatus::Common => write!(f, "COMMON"),
            SlotStatus::Idle => write!(f, "IDLE"),
            SlotStatus::InUse => write!(f, "IN_USE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

/// Field change carried by one slot-specific message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Full slot contents (slot read or slot write).
    Data(SlotData),
    Speed(u8),
    DirF(u8),
    Sound(u8),
    Stat1(u8),
}

impl SlotUpdate {
    /// Slot number and update for messages that touch a slot.
    pub fn from_message(msg: &InboundMessage) -> Option<(u8, SlotUpdate)> {
        let update = match *msg {
            InboundMessage::SlotData { slot, data, .. } => (slot, SlotUpdate::Data(data)),
            InboundMessage::Speed { slot, speed } => (slot, SlotUpdate::Speed(speed)),
            InboundMessage::DirF { slot, dirf } => (slot, SlotUpdate::DirF(dirf)),
            InboundMessage::Sound { slot, snd } => (slot, SlotUpdate::Sound(snd)),
            InboundMessage::Stat1 { slot, stat1 } => (slot, SlotUpdate::Stat1(stat1)),
            _ => return None,
        };
        Some(update)
    }
}

/// Local image of one command-station slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    index: u8,
    stat1: u8,
    loco_address: u16,
    speed: u8,
    dirf: u8,
    snd: u8,
    trk: u8,
    ss2: u8,
    throttle_id: u16,
    programming: Option<ProgrammingSlotData>,
    last_update_ms: u64,
}

impl Slot {
    fn new(index: u8) -> Self {
        Self {
            index,
            stat1: LOCO_FREE,
            loco_address: 0,
            speed: 0,
            dirf: 0,
            snd: 0,
            trk: 0,
            ss2: 0,
            throttle_id: 0,
            programming: None,
            last_update_ms: 0,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn is_programming_slot(&self) -> bool {
        self.index == PRG_SLOT
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_stat1(self.stat1)
    }

    pub fn stat1(&self) -> u8 {
        self.stat1
    }

    pub fn loco_address(&self) -> u16 {
        self.loco_address
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn direction(&self) -> Direction {
        if self.dirf & DIRF_DIR != 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    /// State of F0-F8; anything higher lives in the extended overlay.
    pub fn function(&self, n: u8) -> bool {
        match n {
            0 => self.dirf & DIRF_F0 != 0,
            1..=4 => self.dirf & (1 << (n - 1)) & DIRF_F1_F4_MASK != 0,
            5..=8 => self.snd & (1 << (n - 5)) & SND_F5_F8_MASK != 0,
            _ => false,
        }
    }

    pub fn track_status(&self) -> u8 {
        self.trk
    }

    pub fn ss2(&self) -> u8 {
        self.ss2
    }

    pub fn throttle_id(&self) -> u16 {
        self.throttle_id
    }

    /// Programming fields, only ever set on the programming slot.
    pub fn programming(&self) -> Option<&ProgrammingSlotData> {
        self.programming.as_ref()
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms
    }

    fn apply(&mut self, update: &SlotUpdate) {
        match *update {
            SlotUpdate::Data(data) if self.is_programming_slot() => {
                self.programming = Some(ProgrammingSlotData::from(&data));
                self.trk = data.trk;
            }
            SlotUpdate::Data(data) => {
                self.stat1 = data.stat1;
                self.loco_address = data.loco_address();
                self.speed = data.spd;
                self.dirf = data.dirf;
                self.trk = data.trk;
                self.ss2 = data.ss2;
                self.snd = data.snd;
                self.throttle_id = (data.id2 as u16 & 0x7F) * 128 + (data.id1 as u16 & 0x7F);
            }
            SlotUpdate::Speed(speed) => self.speed = speed,
            SlotUpdate::DirF(dirf) => self.dirf = dirf,
            SlotUpdate::Sound(snd) => self.snd = snd,
            SlotUpdate::Stat1(stat1) => self.stat1 = stat1,
        }
    }
}

/// F9-F28 state for one slot.
///
/// Hardware slots do not carry these, so they are tracked beside the table
/// from the DCC function packets seen on the bus. Bit 0 is F9.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedFunctions(u32);

impl ExtendedFunctions {
    pub fn apply(&mut self, group: FunctionGroup) {
        let (shift, width, bits) = match group {
            FunctionGroup::F9To12(bits) => (0, 4, bits as u32),
            FunctionGroup::F13To20(bits) => (4, 8, bits as u32),
            FunctionGroup::F21To28(bits) => (12, 8, bits as u32),
        };
        let mask = ((1u32 << width) - 1) << shift;
        self.0 = (self.0 & !mask) | ((bits << shift) & mask);
    }

    /// State of `n` for 9..=28.
    pub fn get(&self, n: u8) -> bool {
        (9..=28).contains(&n) && self.0 & (1 << (n - 9)) != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// The 128-entry slot table.
#[derive(Debug, Clone)]
pub struct SlotStore {
    slots: Vec<Slot>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT as u8).map(Slot::new).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Result<&Slot, SlotError> {
        self.slots.get(index).ok_or(SlotError::IndexOutOfRange(index))
    }

    /// Overwrite the fields `update` declares and stamp the slot with `now_ms`.
    pub fn apply_incoming(
        &mut self,
        index: usize,
        update: &SlotUpdate,
        now_ms: u64,
    ) -> Result<&Slot, SlotError> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::IndexOutOfRange(index))?;
        slot.apply(update);
        slot.last_update_ms = slot.last_update_ms.max(now_ms);
        Ok(slot)
    }

    /// In-use slots within `range` not updated for `max_age_ms` at `now_ms`.
    ///
    /// Lazy and borrow-only; every sweep starts a fresh scan.
    pub fn scan_stale(
        &self,
        now_ms: u64,
        max_age_ms: u64,
        range: RangeInclusive<u8>,
    ) -> impl Iterator<Item = u8> + '_ {
        let cutoff = now_ms.checked_sub(max_age_ms);
        range.filter_map(move |i| {
            let cutoff = cutoff?;
            let slot = self.slots.get(i as usize)?;
            (slot.status() == SlotStatus::InUse && slot.last_update_ms <= cutoff).then_some(i)
        })
    }

    /// Number of in-use locomotive slots (0..=120).
    pub fn in_use_count(&self) -> usize {
        self.slots[..=MAX_LOCO_SLOT as usize]
            .iter()
            .filter(|s| s.status() == SlotStatus::InUse)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}
