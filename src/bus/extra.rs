//! Extra-buffer pool for payloads larger than a ring slot.

use super::message::ExtraRef;
use crate::error::{Error, Result};
use super::channel::lock;
use crate::memory::{MemBuf, Region, SlotBitmap};
use std::sync::{Arc, Mutex, Weak};

/// A claimed extra-buffer slot.
///
/// Move-only: a slot is either owned by the caller, in flight on the bus,
/// or free. Hand it to [`Endpoint::post_long`](super::Endpoint::post_long)
/// or back to [`Endpoint::free_extra`](super::Endpoint::free_extra).
/// Dropping it unposted returns the slot to its pool.
#[derive(Debug)]
pub struct ExtraBuf {
    slot: u16,
    len: u32,
    mem: MemBuf,
    owner: Weak<Mutex<ExtraPool>>,
}

impl PartialEq for ExtraBuf {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.len == other.len && self.mem == other.mem
    }
}

impl Eq for ExtraBuf {}

impl Drop for ExtraBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.owner.upgrade() {
            let _ = lock(&pool).free(self.slot);
        }
    }
}

impl ExtraBuf {
    /// Bind the slot to the pool it is returned to on drop.
    pub(crate) fn attach(mut self, pool: &Arc<Mutex<ExtraPool>>) -> Self {
        self.owner = Arc::downgrade(pool);
        self
    }

    /// Hand the slot over to an explicit free or to the bus.
    pub(crate) fn disarm(&mut self) -> u16 {
        self.owner = Weak::new();
        self.slot
    }

    /// Pool slot index.
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Bytes of payload written so far.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.mem.size as usize
    }

    /// Memory of the slot.
    pub fn mem(&self) -> MemBuf {
        self.mem
    }

    pub(crate) fn to_ref(&self) -> ExtraRef {
        ExtraRef {
            slot: self.slot,
            len: self.len,
            mem: self.mem,
        }
    }
}

/// Fixed-size slots addressed by a bitmap.
///
/// Allocation scans the bitmap linearly; pools are capped at
/// [`MAX_EXTRA_SLOTS`](crate::config::defaults::MAX_EXTRA_SLOTS).
pub(crate) struct ExtraPool {
    region: Region,
    bitmap: SlotBitmap,
}

impl ExtraPool {
    pub(crate) fn new(slot_size: usize, slot_count: usize) -> Result<Self> {
        Ok(Self {
            region: Region::new(slot_size, slot_count)?,
            bitmap: SlotBitmap::new(slot_count),
        })
    }

    pub(crate) fn mem_buf(&self) -> MemBuf {
        self.region.mem_buf()
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.region.slot_size()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.bitmap.count_free()
    }

    /// Claim a slot able to hold `size` bytes.
    pub(crate) fn alloc(&mut self, size: usize) -> Result<ExtraBuf> {
        if size > self.slot_size() {
            return Err(Error::NoExtraSpace);
        }
        let slot = self.bitmap.acquire_slot().ok_or(Error::NoExtraSpace)?;
        Ok(ExtraBuf {
            slot: slot as u16,
            len: 0,
            mem: self.region.slot_mem_buf(slot),
            owner: Weak::new(),
        })
    }

    /// Copy `data` into the slot, replacing previous content.
    pub(crate) fn write(&mut self, buf: &mut ExtraBuf, data: &[u8]) -> Result<()> {
        let slot = buf.slot as usize;
        if !self.bitmap.is_allocated(slot) {
            return Err(Error::InvalidArgument(format!("extra slot {slot} is not allocated")));
        }
        let dst = self.region.slot_mut(slot);
        if data.len() > dst.len() {
            return Err(Error::InvalidArgument(format!(
                "{} bytes exceed extra slot size {}",
                data.len(),
                dst.len()
            )));
        }
        dst[..data.len()].copy_from_slice(data);
        buf.len = data.len() as u32;
        Ok(())
    }

    /// Payload referenced by a received message.
    pub(crate) fn read(&self, extra: &ExtraRef) -> Result<&[u8]> {
        let slot = extra.slot as usize;
        if !self.bitmap.is_allocated(slot) || extra.len as usize > self.slot_size() {
            return Err(Error::Malformed(format!(
                "bad extra reference slot {slot} len {}",
                extra.len
            )));
        }
        Ok(&self.region.slot(slot)[..extra.len as usize])
    }

    /// Return a slot to the pool.
    pub(crate) fn free(&mut self, slot: u16) -> Result<()> {
        if !self.bitmap.release_slot(slot as usize) {
            return Err(Error::InvalidArgument(format!(
                "extra slot {slot} freed twice"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExtraPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtraPool")
            .field("slot_size", &self.slot_size())
            .field("free", &self.free_count())
            .finish()
    }
}
