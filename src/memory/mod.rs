//! Memory primitives shared by the bus and the frame layer.
//!
//! - [`Region`]: a block reserved once and carved into fixed-size slots; it
//!   backs bus rings and extra-buffer pools
//! - [`SlotBitmap`]: bitmap allocator used by the extra-buffer pool
//! - [`MemBuf`]: `{ address, size }`, the only cross-boundary buffer handle

mod bitmap;
mod region;

pub use bitmap::SlotBitmap;
pub use region::{MemBuf, Region};
