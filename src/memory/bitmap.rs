//! Bitmap slot allocator.

/// Tracks which slots of a fixed-size pool are in use.
///
/// Each bit is one slot: 0 = free, 1 = allocated. The bitmap is not
/// internally synchronized; owners keep it behind their own lock.
///
/// # Performance
///
/// - `acquire_slot`: O(n/64) scan, where n is the number of slots
/// - `release_slot`: O(1)
///
/// Pools using this are small (at most 64 slots for bus extra buffers), so a
/// linear scan is cheaper than maintaining a separate free list.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    words: Box<[u64]>,
    num_slots: usize,
}

impl SlotBitmap {
    /// Create a bitmap with `num_slots` free slots.
    pub fn new(num_slots: usize) -> Self {
        Self {
            words: vec![0u64; num_slots.div_ceil(64)].into_boxed_slice(),
            num_slots,
        }
    }

    /// Claim the lowest free slot.
    ///
    /// Returns `None` if every slot is allocated.
    pub fn acquire_slot(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit_idx = (!*word).trailing_zeros() as usize;
            let slot_idx = word_idx * 64 + bit_idx;
            if slot_idx >= self.num_slots {
                return None;
            }
            *word |= 1u64 << bit_idx;
            return Some(slot_idx);
        }
        None
    }

    /// Return a slot to the pool.
    ///
    /// Returns `false` if the slot was out of range or already free, leaving
    /// the bitmap untouched.
    pub fn release_slot(&mut self, slot_idx: usize) -> bool {
        if !self.is_allocated(slot_idx) {
            return false;
        }
        self.words[slot_idx / 64] &= !(1u64 << (slot_idx % 64));
        true
    }

    /// Check if a slot is currently allocated.
    pub fn is_allocated(&self, slot_idx: usize) -> bool {
        slot_idx < self.num_slots && self.words[slot_idx / 64] & (1u64 << (slot_idx % 64)) != 0
    }

    /// Number of free slots.
    pub fn count_free(&self) -> usize {
        let allocated: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        self.num_slots - allocated
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.num_slots
    }

    /// Mark every slot free.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}
