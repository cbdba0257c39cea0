//! Frame buffer handles.
//!
//! A [`Buffer`] is the opaque handle the frame layer moves between owners:
//! free pools, upstream queues, frame contexts and the hardware. It is not
//! `Clone`, so a handle can only sit in one place at a time.

use crate::memory::MemBuf;
use std::fmt;

/// Stable identity of a buffer, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// How a loaned buffer is handed back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Hardware wrote a valid frame into it.
    Produced,
    /// The frame is defective; the owner must not consume its content.
    Dropped,
    /// Hardware finished reading it.
    Consumed,
}

/// Move-only handle to one frame buffer.
///
/// # Example
///
/// ```rust
/// use campipe::buffer::{Buffer, BufferId};
/// use campipe::memory::MemBuf;
///
/// let mut buf = Buffer::new(BufferId(1), MemBuf::new(0x8000_0000, 4096));
/// buf.set_sequence(7);
/// assert_eq!(buf.address(), 0x8000_0000);
/// assert!(!buf.is_defective());
/// ```
pub struct Buffer {
    id: BufferId,
    mem: MemBuf,
    sequence: u64,
    defective: bool,
}

impl Buffer {
    /// Wrap a memory region.
    pub fn new(id: BufferId, mem: MemBuf) -> Self {
        Self {
            id,
            mem,
            sequence: 0,
            defective: false,
        }
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The memory region.
    pub fn mem(&self) -> MemBuf {
        self.mem
    }

    /// Physical address accessor.
    pub fn address(&self) -> u64 {
        self.mem.address
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.mem.size
    }

    /// Frame sequence number of the last content written.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Set the frame sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Whether the content was marked defective.
    pub fn is_defective(&self) -> bool {
        self.defective
    }

    /// Mark or clear the defective flag.
    pub fn set_defective(&mut self, defective: bool) {
        self.defective = defective;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("address", &format_args!("{:#x}", self.mem.address))
            .field("size", &self.mem.size)
            .field("sequence", &self.sequence)
            .field("defective", &self.defective)
            .finish()
    }
}
