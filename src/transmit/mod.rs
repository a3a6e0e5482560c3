// src/transmit/mod.rs
//
// Transmit table: user-authored frame definitions with a delivery mode.
//
// Slots are addressed by a stable `SlotId` handle, never by position, so the
// scheduler's timers stay attached to the right slot when rows are inserted
// or deleted. Slot 0 is a scratch slot that always exists.

pub mod list;
pub mod scheduler;

pub use scheduler::{ScheduleError, Scheduler};

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::io::{Frame, FrameError, EXTENDED_ID_MAX, MAX_DLC};

// ============================================================================
// Errors
// ============================================================================

/// A transmit definition was rejected before entering the table.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid ID '{0}': expected 1-8 hex digits")]
    InvalidId(String),
    #[error("invalid DLC '{0}': expected 0-8")]
    InvalidDlc(String),
    #[error("invalid data '{0}': expected hex bytes")]
    InvalidData(String),
    #[error("invalid period '{0}'")]
    InvalidPeriod(String),
    #[error("invalid trigger ID '{0}'")]
    InvalidTriggerId(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("slot 0 cannot be deleted")]
    ScratchSlot,
    #[error("no slot {0}")]
    UnknownSlot(SlotId),
    #[error("no scenario named '{0}'")]
    UnknownScenario(String),
}

// ============================================================================
// Types
// ============================================================================

/// Stable handle to a slot, valid until the slot is removed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a slot is delivered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxMode {
    /// Sent only by explicit request or as a scenario impulse
    #[default]
    Off,
    /// Sent every `period_ms` once armed; a zero period never fires
    Periodic { period_ms: u32 },
    /// Sent as a data frame when a remote request for the same id arrives
    Rtr,
    /// Sent as authored whenever a frame with `trigger_id` arrives
    Trigger { trigger_id: u32 },
}

impl TxMode {
    /// Period of an armable periodic slot
    pub fn active_period(&self) -> Option<u32> {
        match *self {
            TxMode::Periodic { period_ms } if period_ms > 0 => Some(period_ms),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            TxMode::Off => "off".to_string(),
            TxMode::Periodic { period_ms } => period_ms.to_string(),
            TxMode::Rtr => "RTR".to_string(),
            TxMode::Trigger { .. } => "Trigger".to_string(),
        }
    }
}

/// One row of the transmit table. Contents are validated at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransmitSlot {
    frame: Frame,
    mode: TxMode,
    comment: String,
    sent_count: u32,
}

impl TransmitSlot {
    /// Build a slot. The payload must hold exactly `dlc` bytes unless the
    /// slot is a remote frame, in which case it is ignored.
    pub fn new(
        id: u32,
        extended: bool,
        remote: bool,
        dlc: u8,
        payload: &[u8],
        mode: TxMode,
        comment: &str,
    ) -> Result<Self, ValidationError> {
        let frame = Frame::new(id, extended, remote, dlc, payload, 0.0)?;
        if let TxMode::Trigger { trigger_id } = mode {
            if trigger_id > EXTENDED_ID_MAX {
                return Err(ValidationError::InvalidTriggerId(format!("{:X}", trigger_id)));
            }
        }
        Ok(Self {
            frame,
            mode,
            comment: comment.to_string(),
            sent_count: 0,
        })
    }

    /// Build a slot from the text fields of an edit form or list row.
    ///
    /// `data` holds hex bytes separated by spaces or commas; for remote frames
    /// it is ignored.
    pub fn parse(
        id: &str,
        dlc: &str,
        data: &str,
        remote: bool,
        mode: TxMode,
        comment: &str,
    ) -> Result<Self, ValidationError> {
        let (id, extended) = parse_id(id)?;
        let dlc = parse_dlc(dlc)?;
        let payload = if remote { Vec::new() } else { parse_data(data)? };
        Self::new(id, extended, remote, dlc, &payload, mode, comment)
    }

    /// Default contents of the scratch slot: id 000, 8 zero bytes, Off
    pub fn scratch() -> Self {
        Self {
            frame: Frame::zeroed(),
            mode: TxMode::Off,
            comment: String::new(),
            sent_count: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.frame.id()
    }

    pub fn is_extended(&self) -> bool {
        self.frame.is_extended()
    }

    pub fn is_remote(&self) -> bool {
        self.frame.is_remote()
    }

    pub fn dlc(&self) -> u8 {
        self.frame.dlc()
    }

    pub fn payload(&self) -> &[u8] {
        self.frame.payload()
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    /// The frame as authored
    pub fn frame(&self) -> Frame {
        self.frame.clone()
    }

    /// Data frame answering a remote request: never remote, payload padded
    /// with zeros up to the DLC.
    pub fn response_frame(&self) -> Frame {
        self.frame.to_data_response()
    }

    fn belongs_to(&self, scenario: &str) -> bool {
        let trimmed = self.comment.trim();
        !trimmed.is_empty() && trimmed == scenario.trim()
    }
}

// ============================================================================
// Text Field Parsing
// ============================================================================

/// Parse a hex id. More than three digits means a 29-bit id.
pub fn parse_id(text: &str) -> Result<(u32, bool), ValidationError> {
    let digits = text.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() || digits.len() > 8 {
        return Err(ValidationError::InvalidId(text.to_string()));
    }
    let id = u32::from_str_radix(digits, 16)
        .map_err(|_| ValidationError::InvalidId(text.to_string()))?;
    Ok((id, digits.len() > 3))
}

/// Parse a DLC in 0..=8 (decimal and hex agree on this range)
pub fn parse_dlc(text: &str) -> Result<u8, ValidationError> {
    let dlc: u8 = text
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidDlc(text.to_string()))?;
    if dlc > MAX_DLC {
        return Err(ValidationError::InvalidDlc(text.to_string()));
    }
    Ok(dlc)
}

/// Parse hex bytes separated by spaces or commas, e.g. `"01 02 FF"`
pub fn parse_data(text: &str) -> Result<Vec<u8>, ValidationError> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.len() > 2 {
                return Err(ValidationError::InvalidData(text.to_string()));
            }
            u8::from_str_radix(s, 16).map_err(|_| ValidationError::InvalidData(text.to_string()))
        })
        .collect()
}

// ============================================================================
// Table
// ============================================================================

/// Ordered slots. The first slot is the protected scratch slot.
#[derive(Debug)]
pub struct TransmitTable {
    slots: Vec<(SlotId, TransmitSlot)>,
    next_id: u64,
}

impl Default for TransmitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitTable {
    pub fn new() -> Self {
        Self {
            slots: vec![(SlotId(0), TransmitSlot::scratch())],
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> SlotId {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn scratch_id(&self) -> SlotId {
        self.slots[0].0
    }

    pub fn append(&mut self, slot: TransmitSlot) -> SlotId {
        let id = self.allocate();
        self.slots.push((id, slot));
        id
    }

    /// Replace a slot's contents, keeping its sent count.
    pub fn update(&mut self, id: SlotId, mut slot: TransmitSlot) -> Result<(), ValidationError> {
        let entry = self.get_mut(id).ok_or(ValidationError::UnknownSlot(id))?;
        slot.sent_count = entry.sent_count;
        *entry = slot;
        Ok(())
    }

    /// Remove a slot. Callers with armed timers go through
    /// `Scheduler::delete_slot` so the timer is cancelled first.
    pub(crate) fn remove(&mut self, id: SlotId) -> Result<TransmitSlot, ValidationError> {
        if id == self.scratch_id() {
            return Err(ValidationError::ScratchSlot);
        }
        let index = self
            .position(id)
            .ok_or(ValidationError::UnknownSlot(id))?;
        Ok(self.slots.remove(index).1)
    }

    /// Drop every slot but the scratch slot and reset it to defaults
    pub(crate) fn clear(&mut self) {
        self.slots.truncate(1);
        self.slots[0].1 = TransmitSlot::scratch();
    }

    /// Replace the whole table. The first slot becomes the scratch slot.
    pub(crate) fn replace_all(&mut self, slots: Vec<TransmitSlot>) {
        self.clear();
        let mut slots = slots.into_iter();
        if let Some(first) = slots.next() {
            self.slots[0].1 = first;
        }
        for slot in slots {
            self.append(slot);
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&TransmitSlot> {
        self.slots.iter().find(|(sid, _)| *sid == id).map(|(_, s)| s)
    }

    fn get_mut(&mut self, id: SlotId) -> Option<&mut TransmitSlot> {
        self.slots
            .iter_mut()
            .find(|(sid, _)| *sid == id)
            .map(|(_, s)| s)
    }

    pub fn position(&self, id: SlotId) -> Option<usize> {
        self.slots.iter().position(|(sid, _)| *sid == id)
    }

    /// Slots in table order
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &TransmitSlot)> {
        self.slots.iter().map(|(id, slot)| (*id, slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn increment_sent(&mut self, id: SlotId) {
        if let Some(slot) = self.get_mut(id) {
            slot.sent_count = slot.sent_count.saturating_add(1);
        }
    }

    pub fn reset_counts(&mut self) {
        for (_, slot) in &mut self.slots {
            slot.sent_count = 0;
        }
    }

    /// Distinct non-empty trimmed comments, sorted
    pub fn scenario_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|(_, slot)| slot.comment.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Slots whose comment names `scenario`, in table order. The first one is
    /// the impulse.
    pub fn scenario(&self, scenario: &str) -> Vec<SlotId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.belongs_to(scenario))
            .map(|(id, _)| *id)
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
