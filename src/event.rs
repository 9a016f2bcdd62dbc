use crate::{DaqError, DaqResult};
use serde::{Deserialize, Serialize};

/// Bit position of the 3-bit word type tag.
pub const TAG_SHIFT: u32 = 24;
pub const TAG_MASK: u32 = 0x7;
/// Set on a data id whose channel records use the one-word short form.
pub const SHORT_FORM_BIT: u32 = 0x8000_0000;

pub fn shift_and_extract(value: u32, shift: u32, mask: u32) -> u32 {
    (value >> shift) & mask
}

/// Type tag carried in bits 24..26 of every FIFO word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordTag {
    Data = 0,
    Header = 2,
    EndOfBlock = 4,
    NotValid = 6,
}

impl WordTag {
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Raw tag bits of `word`.
    pub fn of(word: u32) -> u32 {
        shift_and_extract(word, TAG_SHIFT, TAG_MASK)
    }

    pub fn matches(self, word: u32) -> bool {
        Self::of(word) == self.bits()
    }

    /// Tag `payload` with this type; payload bits above 23 are dropped.
    pub fn tag(self, payload: u32) -> u32 {
        (self.bits() << TAG_SHIFT) | (payload & 0x00ff_ffff)
    }
}

/// Crate and slot packed into the bits every record carries.
pub fn location_mask(crate_num: u32, slot: u32) -> u32 {
    ((crate_num & 0x0f) << 21) | ((slot & 0x1f) << 16)
}

pub fn channel_payload(location: u32, channel: u32, value: u32) -> u32 {
    location | ((channel & 0x0f) << 12) | (value & 0x0fff)
}

/// Encoding used for per-channel records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFormat {
    /// One word: `dataId | SHORT_FORM_BIT | location | channel | value`.
    Short,
    /// Two words: `[dataId | 2]`, `[location | channel | value]`.
    #[default]
    Long,
}

impl RecordFormat {
    pub fn words_per_record(self) -> usize {
        match self {
            RecordFormat::Short => 1,
            RecordFormat::Long => 2,
        }
    }
}

/// Output words of one readout call.
///
/// `append` only succeeds inside the window opened by the most recent
/// `ensure_capacity`, so the write cursor never runs past what was reserved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventBuffer {
    words: Vec<u32>,
    limit: usize,
}

impl EventBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reserve room for `n` more words past the current cursor.
    pub fn ensure_capacity(&mut self, n: usize) {
        self.words.reserve(n);
        self.limit = self.words.len() + n;
    }

    pub fn append(&mut self, word: u32) -> DaqResult<usize> {
        if self.words.len() >= self.limit {
            return Err(DaqError::BufferOverrun {
                reserved: self.limit,
            });
        }
        self.words.push(word);
        Ok(self.words.len() - 1)
    }

    /// Drop every word at or after `index`.
    pub fn truncate_to(&mut self, index: usize) {
        self.words.truncate(index);
    }

    /// Append one channel record, returning the index of its first word.
    pub fn append_channel_record(
        &mut self,
        format: RecordFormat,
        data_id: u32,
        location: u32,
        channel: u32,
        value: u32,
    ) -> DaqResult<usize> {
        match format {
            RecordFormat::Short => {
                self.append(data_id | SHORT_FORM_BIT | channel_payload(location, channel, value))
            }
            RecordFormat::Long => {
                let first = self.append(data_id | 2)?;
                self.append(channel_payload(location, channel, value))?;
                Ok(first)
            }
        }
    }

    pub fn data_index(&self) -> usize {
        self.words.len()
    }

    /// Absolute index the cursor may reach under the current reservation.
    pub fn reserved(&self) -> usize {
        self.limit
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}
