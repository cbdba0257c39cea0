//! Stage event stream.

use crate::frame::FrameState;

/// Notifications broadcast by a [`StageDriver`](super::StageDriver).
///
/// Delivered through a `tokio::sync::broadcast` channel; slow subscribers
/// lag rather than stall the interrupt path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// A frame was handed back to its owners.
    FrameDone {
        /// Logical instance.
        instance: u32,
        /// Frame sequence number.
        sequence: u64,
        /// Whether the output was dropped instead of produced.
        dropped: bool,
    },
    /// An acquisition found a port without buffers.
    Starved {
        /// Logical instance.
        instance: u32,
    },
    /// A starved instance acquired a frame again.
    Resumed {
        /// Logical instance.
        instance: u32,
    },
    /// An instance changed lifecycle state.
    StateChanged {
        /// Logical instance.
        instance: u32,
        /// New state.
        state: FrameState,
    },
}

impl StageEvent {
    /// The instance the event concerns.
    pub fn instance(&self) -> u32 {
        match *self {
            StageEvent::FrameDone { instance, .. }
            | StageEvent::Starved { instance }
            | StageEvent::Resumed { instance }
            | StageEvent::StateChanged { instance, .. } => instance,
        }
    }
}
