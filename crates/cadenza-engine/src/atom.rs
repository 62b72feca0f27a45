//! Event-sequence atoms.
//!
//! An event-sequence buffer holds a fixed-size header followed by
//! timestamped events, each padded to 8 bytes so headers stay aligned:
//!
//! ```text
//! header:  type_urid: u32 | body_size: u32
//! event:   frames: i64 | type_urid: u32 | size: u32 | payload (8-padded)
//! ```
//!
//! Sequences are always sorted by frame index; the writer only appends.

use cadenza_core::{EngineError, KnownUrids, Result, Urid};

/// Sequence header bytes.
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Per-event header bytes (before payload).
pub const EVENT_HEADER_SIZE: usize = 16;

fn padded(len: usize) -> usize {
    len.div_ceil(8) * 8
}

/// Write an empty sequence header.
pub fn clear_sequence(buf: &mut [u8], urids: &KnownUrids) {
    debug_assert!(buf.len() >= SEQUENCE_HEADER_SIZE);
    buf[0..4].copy_from_slice(&urids.atom_sequence.to_ne_bytes());
    buf[4..8].copy_from_slice(&0u32.to_ne_bytes());
}

/// One decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqEvent<'a> {
    pub frames: i64,
    pub type_urid: Urid,
    pub payload: &'a [u8],
}

/// Iterator over the events of a sequence buffer.
pub struct SequenceIter<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = SeqEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.at + EVENT_HEADER_SIZE > self.body.len() {
            return None;
        }
        let frames = i64::from_ne_bytes(self.body[self.at..self.at + 8].try_into().unwrap());
        let type_urid =
            u32::from_ne_bytes(self.body[self.at + 8..self.at + 12].try_into().unwrap());
        let size =
            u32::from_ne_bytes(self.body[self.at + 12..self.at + 16].try_into().unwrap()) as usize;

        let payload_start = self.at + EVENT_HEADER_SIZE;
        if payload_start + size > self.body.len() {
            return None;
        }
        self.at = payload_start + padded(size);

        Some(SeqEvent {
            frames,
            type_urid,
            payload: &self.body[payload_start..payload_start + size],
        })
    }
}

/// Validate the header and iterate a sequence buffer.
pub fn read_sequence<'a>(buf: &'a [u8], urids: &KnownUrids) -> Result<SequenceIter<'a>> {
    if buf.len() < SEQUENCE_HEADER_SIZE {
        return Err(EngineError::Error("sequence buffer too small".into()));
    }
    let type_urid = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    if type_urid != urids.atom_sequence {
        return Err(EngineError::Error(format!(
            "expected sequence ({}), got {type_urid}",
            urids.atom_sequence
        )));
    }
    let body_size = u32::from_ne_bytes(buf[4..8].try_into().unwrap()) as usize;
    let available = buf.len() - SEQUENCE_HEADER_SIZE;
    Ok(SequenceIter {
        body: &buf[SEQUENCE_HEADER_SIZE..SEQUENCE_HEADER_SIZE + body_size.min(available)],
        at: 0,
    })
}

/// Appends events to a sequence buffer.
pub struct SequenceWriter<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> SequenceWriter<'a> {
    /// Start a fresh sequence in `buf`.
    pub fn new(buf: &'a mut [u8], urids: &KnownUrids) -> Self {
        clear_sequence(buf, urids);
        Self { buf, used: 0 }
    }

    /// Append one event. Events must be appended in frame order; a full
    /// buffer is an error.
    pub fn append(&mut self, frames: i64, type_urid: Urid, payload: &[u8]) -> Result<()> {
        let needed = EVENT_HEADER_SIZE + padded(payload.len());
        let start = SEQUENCE_HEADER_SIZE + self.used;
        if start + needed > self.buf.len() {
            return Err(EngineError::Error("sequence buffer full".into()));
        }

        self.buf[start..start + 8].copy_from_slice(&frames.to_ne_bytes());
        self.buf[start + 8..start + 12].copy_from_slice(&type_urid.to_ne_bytes());
        self.buf[start + 12..start + 16].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
        let payload_start = start + EVENT_HEADER_SIZE;
        self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
        // Zero the padding
        for b in &mut self.buf[payload_start + payload.len()..start + needed] {
            *b = 0;
        }

        self.used += needed;
        self.buf[4..8].copy_from_slice(&(self.used as u32).to_ne_bytes());
        Ok(())
    }
}
