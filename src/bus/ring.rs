//! Fixed-slot message ring.

use super::message::{HEADER_LEN, Header, MsgFlags, Payload};
use crate::error::{Error, Result};
use crate::memory::{MemBuf, Region};

/// One direction's message ring.
///
/// Three free-running counters drive it: `written` (posted), `read`
/// (copied out by the receiver) and `acked` (finished by the receiver).
/// A slot is reusable only once acknowledged, so at most `slot_count`
/// messages are outstanding and a further post fails with
/// [`Error::RetryLater`].
pub(crate) struct MessageRing {
    region: Region,
    payload_size: usize,
    written: u64,
    read: u64,
    acked: u64,
    next_sequence: u16,
}

impl MessageRing {
    /// Reserve `slot_count` slots with room for `payload_size` inline bytes.
    pub(crate) fn new(payload_size: usize, slot_count: usize) -> Result<Self> {
        Ok(Self {
            region: Region::new(HEADER_LEN + payload_size, slot_count)?,
            payload_size,
            written: 0,
            read: 0,
            acked: 0,
            next_sequence: 0,
        })
    }

    pub(crate) fn mem_buf(&self) -> MemBuf {
        self.region.mem_buf()
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.region.slot_count()
    }

    /// Posted but not yet acknowledged.
    pub(crate) fn outstanding(&self) -> usize {
        (self.written - self.acked) as usize
    }

    /// Posted but not yet read.
    pub(crate) fn unread(&self) -> usize {
        (self.written - self.read) as usize
    }

    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.written, self.acked)
    }

    fn slot_index(&self, counter: u64) -> usize {
        (counter % self.slot_count() as u64) as usize
    }

    /// Copy a message into the next slot and return its sequence number.
    pub(crate) fn push(&mut self, flags: MsgFlags, wait_slot: u16, payload: &Payload<'_>) -> Result<u16> {
        if payload.encoded_len() > self.payload_size {
            return Err(Error::InvalidArgument(format!(
                "{} byte payload exceeds slot size {}",
                payload.encoded_len(),
                self.payload_size
            )));
        }
        if self.outstanding() >= self.slot_count() {
            return Err(Error::RetryLater);
        }
        let sequence = self.next_sequence;
        let idx = self.slot_index(self.written);
        let slot = self.region.slot_mut(idx);
        let len = payload.encode(&mut slot[HEADER_LEN..])?;
        let header = Header {
            flags: flags | payload.flags(),
            sequence,
            length: len as u16,
            wait_slot,
            result: 0,
        };
        header.encode(&mut slot[..HEADER_LEN]);

        self.written += 1;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(sequence)
    }

    /// Copy the next unread entry into `out` and advance the read cursor.
    ///
    /// `out` must hold `HEADER_LEN + payload_size` bytes. Returns `None`
    /// when nothing is unread.
    pub(crate) fn read_next(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.read == self.written {
            return None;
        }
        let idx = self.slot_index(self.read);
        let slot = self.region.slot(idx);
        let n = slot.len().min(out.len());
        out[..n].copy_from_slice(&slot[..n]);
        self.read += 1;
        Some(n)
    }

    /// Release the oldest read slot for reuse.
    pub(crate) fn ack(&mut self) -> bool {
        if self.acked == self.read {
            return false;
        }
        self.acked += 1;
        true
    }
}

impl std::fmt::Debug for MessageRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRing")
            .field("slots", &self.slot_count())
            .field("payload_size", &self.payload_size)
            .field("written", &self.written)
            .field("acked", &self.acked)
            .finish()
    }
}
