//! Frame contexts and the buffer ports they draw from.

mod context;
mod ports;

pub use context::{Acquire, FrameBuffers, FrameContext, FrameState, ReleaseReport, Released};
pub use ports::{FramePool, FrameQueue, PoolStats, ReadyHook, SinkPort, SourcePort};
