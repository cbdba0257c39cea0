//! Pre-reserved memory regions and the cross-boundary buffer handle.

use crate::error::{Error, Result};

/// Physical (or opaque) memory region, the only cross-boundary
/// representation of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemBuf {
    /// Start address.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

impl MemBuf {
    /// Wire size of an encoded handle.
    pub const ENCODED_LEN: usize = 16;

    /// Create a handle.
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// Whether this handle describes no memory.
    pub fn is_null(&self) -> bool {
        self.address == 0 && self.size == 0
    }

    /// Encode as two little-endian `u64`s.
    pub fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.address.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Decode from two little-endian `u64`s.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(Error::Malformed(format!(
                "mem-buf needs {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let address = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            address,
            size: u64::from_le_bytes(word),
        })
    }
}

/// A zeroed memory block reserved once and carved into fixed-size slots.
///
/// Backs bus rings and extra-buffer pools. The block never moves or grows,
/// so the [`MemBuf`] reported at creation stays valid for its lifetime.
pub struct Region {
    data: Box<[u8]>,
    slot_size: usize,
}

impl Region {
    /// Reserve `slot_count` slots of `slot_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if either dimension is zero or the
    /// total size overflows.
    pub fn new(slot_size: usize, slot_count: usize) -> Result<Self> {
        if slot_size == 0 || slot_count == 0 {
            return Err(Error::AllocationFailed(
                "region needs non-zero slot size and count".into(),
            ));
        }
        let len = slot_size
            .checked_mul(slot_count)
            .ok_or_else(|| Error::AllocationFailed("region size overflows".into()))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        data.resize(len, 0);

        Ok(Self {
            data: data.into_boxed_slice(),
            slot_size,
        })
    }

    /// Handle describing the whole region.
    pub fn mem_buf(&self) -> MemBuf {
        MemBuf::new(self.data.as_ptr() as usize as u64, self.data.len() as u64)
    }

    /// Bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.data.len() / self.slot_size
    }

    /// Total size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; regions are never empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read access to one slot.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn slot(&self, idx: usize) -> &[u8] {
        let start = idx * self.slot_size;
        &self.data[start..start + self.slot_size]
    }

    /// Write access to one slot.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn slot_mut(&mut self, idx: usize) -> &mut [u8] {
        let start = idx * self.slot_size;
        &mut self.data[start..start + self.slot_size]
    }

    /// Handle describing one slot.
    pub fn slot_mem_buf(&self, idx: usize) -> MemBuf {
        let base = self.mem_buf();
        MemBuf::new(
            base.address + (idx * self.slot_size) as u64,
            self.slot_size as u64,
        )
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count())
            .finish()
    }
}
