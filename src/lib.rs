//! # campipe
//!
//! Control plane of a camera image-processing pipeline.
//!
//! A pipeline is a chain of hardware stages (capture, image signal
//! processor, scaler, warp engine). Every stage shares two mechanisms:
//!
//! - **Component bus** ([`bus`]): bound, bidirectional channels between a
//!   stage driver and exactly one peer, with fire-and-forget and synchronous
//!   posts, back-pressure on full rings and an extra-buffer pool for large
//!   payloads.
//! - **Frame scheduling**: a fixed-capacity [`JobQueue`](queue::JobQueue)
//!   between the interrupt path and frame advance, a per-instance
//!   [`FrameContext`](frame::FrameContext) that loans buffers out of its
//!   ports, and an [`AdmissionScheduler`](sched::AdmissionScheduler) that
//!   serializes logical streams on a shared hardware unit.
//!
//! Stage drivers ([`stage`]) combine the two. Hardware access itself goes
//! through the [`Hardware`](stage::Hardware) trait.
//!
//! ## Execution contexts
//!
//! Operations are split between an interrupt tier that never blocks and a
//! worker tier that may (see [`irq`]). Slow-path calls made inside an
//! interrupt guard fail with [`Error::InInterrupt`].
//!
//! ## Quick Start
//!
//! ```rust
//! use campipe::prelude::*;
//! use std::sync::Arc;
//!
//! let capture = Capture::new(
//!     "csi0",
//!     StageKind::Capture.default_config(),
//!     |_: &Pass, _: &FrameBuffers| -> campipe::Result<()> { Ok(()) },
//! )
//! .unwrap();
//! let output = Arc::new(FramePool::with_buffers("csi0-out", 0, 0x8000_0000, 4096, 4));
//! capture.attach_output(0, output.clone()).unwrap();
//!
//! capture.driver().start(0).unwrap();
//! capture.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
//! assert_eq!(output.produced_count(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod bus;
pub mod config;
pub mod error;
pub mod frame;
pub mod irq;
pub mod memory;
pub mod observability;
pub mod queue;
pub mod sched;
pub mod stage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferId, Completion};
    pub use crate::bus::{BusRegistry, Command, Direction, Endpoint, Message, ReplyWriter};
    pub use crate::config::{BindRecord, BusConfig, StageConfig};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::frame::{FrameBuffers, FramePool, FrameQueue, FrameState, SinkPort, SourcePort};
    pub use crate::memory::MemBuf;
    pub use crate::queue::JobQueue;
    pub use crate::sched::{AdmissionScheduler, Pass, SharedUnit};
    pub use crate::stage::{
        Capability, Capture, Hardware, IrqStatus, Isp, Scaler, Stage, StageDriver, StageEvent,
        StageKind, Warp,
    };
}

pub use error::{Error, ErrorKind, Result};
