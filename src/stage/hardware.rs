//! The register-programming seam.
//!
//! Stage drivers never touch registers themselves. They hand each pass and
//! its buffer addresses to a [`Hardware`] implementation and learn about
//! completion through [`IrqStatus`] values passed to
//! [`StageDriver::on_interrupt`](super::StageDriver::on_interrupt).

use crate::error::Result;
use crate::frame::FrameBuffers;
use crate::sched::Pass;

/// Programs one hardware unit.
///
/// Called from the frame-advance path, which may run in interrupt context:
/// implementations must not block or allocate.
pub trait Hardware: Send + Sync {
    /// Start `pass` over `frame`. A tiled frame is programmed once per tile
    /// with the same buffers.
    fn program(&self, pass: &Pass, frame: &FrameBuffers) -> Result<()>;

    /// Abort whatever is running and return the unit to idle.
    fn reset(&self) {}
}

impl<F> Hardware for F
where
    F: Fn(&Pass, &FrameBuffers) -> Result<()> + Send + Sync,
{
    fn program(&self, pass: &Pass, frame: &FrameBuffers) -> Result<()> {
        self(pass, frame)
    }
}

/// Decoded interrupt status of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqStatus {
    /// Instance whose pass raised the interrupt.
    pub instance: u32,
    /// The running pass finished.
    pub frame_end: bool,
    /// The pass aborted or wrote corrupt output.
    pub error: bool,
}

impl IrqStatus {
    /// A clean end of pass.
    pub fn frame_end(instance: u32) -> Self {
        Self {
            instance,
            frame_end: true,
            error: false,
        }
    }

    /// A failed pass.
    pub fn error(instance: u32) -> Self {
        Self {
            instance,
            frame_end: true,
            error: true,
        }
    }

    /// Whether the running pass is over, cleanly or not.
    pub fn ends_pass(&self) -> bool {
        self.frame_end || self.error
    }
}
