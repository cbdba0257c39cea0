//! Occupancy tracking for a time-multiplexed hardware unit.

use super::admission::{AdmissionQueue, Pass};
use crate::error::{Error, Result};
use crate::irq::{FastPath, IrqLock};
use crate::observability::AdmissionMetrics;

/// Result of [`SharedUnit::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The unit was idle: program this pass now.
    Run(Pass),
    /// The unit is busy: the request waits its turn.
    Queued,
}

struct UnitState {
    queue: AdmissionQueue,
    running: Option<Pass>,
}

/// A physical hardware unit shared by several logical streams.
///
/// Wraps an [`AdmissionQueue`] with the pass currently executing so that
/// at most one pass occupies the hardware. Submission order is preserved
/// across streams; a tiled frame keeps the unit for all of its passes.
pub struct SharedUnit {
    name: String,
    state: IrqLock<UnitState>,
    metrics: AdmissionMetrics,
}

impl SharedUnit {
    /// Create an idle unit with `node_count` schedule nodes.
    pub fn new(name: impl Into<String>, max_instances: u32, node_count: usize) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            metrics: AdmissionMetrics::new(&name),
            name,
            state: IrqLock::new(UnitState {
                queue: AdmissionQueue::new(max_instances, node_count)?,
                running: None,
            }),
        })
    }

    /// Unit name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request `tiles` passes for `instance`.
    ///
    /// Returns [`Admission::Run`] with the first pass if the unit was idle.
    pub fn submit(&self, instance: u32, tiles: u8) -> Result<Admission> {
        let (admission, depth) = self.state.with(|s| {
            s.queue.enqueue_tiled(instance, tiles)?;
            let admission = if s.running.is_none() {
                s.running = s.queue.dequeue();
                s.running.map_or(Admission::Queued, Admission::Run)
            } else {
                Admission::Queued
            };
            Ok::<_, Error>((admission, s.queue.len()))
        })?;
        self.metrics.set_depth(depth);
        Ok(admission)
    }

    /// The running pass finished. Returns the next pass to program, if any.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if nothing was running.
    pub fn complete(&self) -> Result<Option<Pass>> {
        let (next, depth) = self.state.with(|s| {
            if s.running.is_none() {
                return Err(Error::InvalidState {
                    from: "idle",
                    to: "complete",
                });
            }
            s.running = s.queue.dequeue();
            Ok((s.running, s.queue.len()))
        })?;
        self.metrics.set_depth(depth);
        Ok(next)
    }

    /// Forget the running pass and flush every waiting node.
    ///
    /// Used on stop and hardware error recovery. Returns how many nodes were
    /// flushed.
    pub fn reset(&self) -> usize {
        let flushed = self.state.with(|s| {
            s.running = None;
            s.queue.reset()
        });
        self.metrics.set_depth(0);
        flushed
    }

    /// The pass occupying the hardware.
    pub fn running(&self) -> Option<Pass> {
        self.state.with(|s| s.running)
    }

    /// Whether a pass occupies the hardware.
    pub fn is_busy(&self) -> bool {
        self.running().is_some()
    }

    /// Number of nodes waiting (excluding the running pass once its node
    /// has retired).
    pub fn queued(&self) -> usize {
        self.state.with(|s| s.queue.len())
    }

    /// Whether `instance` still has passes to hand out.
    pub fn is_pending(&self, instance: u32) -> bool {
        self.state.with(|s| s.queue.contains(instance))
    }
}

impl FastPath for SharedUnit {}

impl std::fmt::Debug for SharedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedUnit")
            .field("name", &self.name)
            .field("running", &self.running())
            .field("queued", &self.queued())
            .finish()
    }
}
