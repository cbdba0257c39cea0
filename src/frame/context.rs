//! Per-instance frame bookkeeping.
//!
//! A [`FrameContext`] owns the buffers loaned to hardware for one frame of
//! one logical instance. Acquisition is all-or-nothing: either the sink and
//! every source hand over a buffer, or everything taken in the attempt is
//! returned and the context reports [`Acquire::NoBuffer`].
//!
//! Handing buffers back can wake other stages through their port hooks, so
//! the `take_*` methods only detach buffers into a [`Released`]. The caller
//! completes it once the context's lock is dropped. The `release_*` and
//! `finish_stop` forms do both steps for contexts used without a lock.

use crate::buffer::{Buffer, Completion};
use crate::config::defaults::SCALER_FAN_IN;
use crate::error::{Error, Result};
use crate::frame::ports::{SinkPort, SourcePort};
use crate::irq::FastPath;
use crate::memory::MemBuf;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a frame context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No buffers held, no frames attempted.
    Stopped,
    /// Started, waiting for the first frame to be programmed.
    Starting,
    /// At least one frame programmed.
    Running,
    /// Stop requested; the in-flight frame (if any) is still loaned.
    Stopping,
}

impl FrameState {
    /// Short lowercase name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            FrameState::Stopped => "stopped",
            FrameState::Starting => "starting",
            FrameState::Running => "running",
            FrameState::Stopping => "stopping",
        }
    }

    /// Whether frames may be acquired in this state.
    pub fn accepts_frames(self) -> bool {
        matches!(self, FrameState::Starting | FrameState::Running)
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffer addresses of one acquired frame, ready to program into hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffers {
    /// Owning instance.
    pub instance: u32,
    /// Frame sequence number, starting at 1 after each start.
    pub sequence: u64,
    /// Output buffer, if the stage has a sink.
    pub sink: Option<MemBuf>,
    /// Input buffers in source-port order.
    pub sources: SmallVec<[MemBuf; SCALER_FAN_IN]>,
}

/// Outcome of [`FrameContext::acquire_next_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// Every port supplied a buffer.
    Ready(FrameBuffers),
    /// Some port was empty; nothing is held.
    NoBuffer,
}

impl Acquire {
    /// `true` for [`Acquire::Ready`].
    pub fn is_ready(&self) -> bool {
        matches!(self, Acquire::Ready(_))
    }
}

/// What [`FrameContext::release_frame`] handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Sequence number of the released frame, `0` if nothing was loaned.
    pub sequence: u64,
    /// Sink buffer completed as produced.
    pub produced: bool,
    /// Sink buffer completed as dropped.
    pub dropped: bool,
    /// Source buffers completed as consumed.
    pub consumed: usize,
    /// Source buffers kept back by a hold.
    pub held: usize,
    /// Source buffers returned unread (stop path).
    pub requeued: usize,
}

impl ReleaseReport {
    /// Whether any buffer changed hands.
    pub fn is_empty(&self) -> bool {
        !self.produced && !self.dropped && self.consumed == 0 && self.held == 0 && self.requeued == 0
    }
}

/// Buffers detached from a [`FrameContext`], not yet handed to their ports.
#[must_use = "buffers go back to their ports only on `complete`"]
pub struct Released {
    report: ReleaseReport,
    sinks: SmallVec<[(Arc<dyn SinkPort>, Buffer, Completion); 2]>,
    // A retiring stop can hand back one consumed and one held buffer per port.
    sources: SmallVec<[(Arc<dyn SourcePort>, Buffer); 2 * SCALER_FAN_IN]>,
}

impl Released {
    fn new(sequence: u64) -> Self {
        Self {
            report: ReleaseReport {
                sequence,
                ..ReleaseReport::default()
            },
            sinks: SmallVec::new(),
            sources: SmallVec::new(),
        }
    }

    /// What [`complete`](Self::complete) will hand back.
    pub fn report(&self) -> ReleaseReport {
        self.report
    }

    /// Fold `other` into this hand-back. The sequence of `self` wins unless
    /// it is zero.
    pub fn merge(&mut self, other: Released) {
        if self.report.sequence == 0 {
            self.report.sequence = other.report.sequence;
        }
        self.report.produced |= other.report.produced;
        self.report.dropped |= other.report.dropped;
        self.report.consumed += other.report.consumed;
        self.report.held += other.report.held;
        self.report.requeued += other.report.requeued;
        self.sinks.extend(other.sinks);
        self.sources.extend(other.sources);
    }

    /// Hand every detached buffer to its port. Fires port hooks.
    pub fn complete(self) -> ReleaseReport {
        for (sink, buf, completion) in self.sinks {
            sink.complete(buf, completion);
        }
        for (port, buf) in self.sources {
            port.complete(buf);
        }
        self.report
    }
}

impl fmt::Debug for Released {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Released")
            .field("report", &self.report)
            .field("buffers", &(self.sinks.len() + self.sources.len()))
            .finish()
    }
}

struct SourceSlot {
    port: Arc<dyn SourcePort>,
    loaned: Option<Buffer>,
    hold: bool,
    held: Option<Buffer>,
}

/// Frame state of one logical instance on one stage.
pub struct FrameContext {
    instance: u32,
    state: FrameState,
    sink: Option<Arc<dyn SinkPort>>,
    loaned_sink: Option<Buffer>,
    sources: SmallVec<[SourceSlot; SCALER_FAN_IN]>,
    defective: bool,
    sequence: u64,
}

impl FrameContext {
    /// Create a stopped context with no ports.
    pub fn new(instance: u32) -> Self {
        Self {
            instance,
            state: FrameState::Stopped,
            sink: None,
            loaned_sink: None,
            sources: SmallVec::new(),
            defective: false,
            sequence: 0,
        }
    }

    /// Instance identifier.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Sequence number of the most recently acquired frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of attached source ports.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Whether a sink port is attached.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Whether a frame is currently loaned to hardware.
    pub fn has_frame(&self) -> bool {
        self.loaned_sink.is_some() || self.sources.iter().any(|s| s.loaned.is_some())
    }

    /// Whether the current frame is marked defective.
    pub fn is_defective(&self) -> bool {
        self.defective
    }

    fn require_stopped(&self, op: &'static str) -> Result<()> {
        if self.state != FrameState::Stopped {
            return Err(Error::InvalidState {
                from: self.state.name(),
                to: op,
            });
        }
        Ok(())
    }

    /// Attach the output port. Only while stopped.
    pub fn set_sink(&mut self, sink: Arc<dyn SinkPort>) -> Result<()> {
        self.require_stopped("set_sink")?;
        self.sink = Some(sink);
        Ok(())
    }

    /// Attach an input port and return its index. Only while stopped.
    pub fn add_source(&mut self, port: Arc<dyn SourcePort>) -> Result<usize> {
        self.require_stopped("add_source")?;
        if self.sources.len() == SCALER_FAN_IN {
            return Err(Error::InvalidArgument(format!(
                "at most {SCALER_FAN_IN} source ports per instance"
            )));
        }
        self.sources.push(SourceSlot {
            port,
            loaned: None,
            hold: false,
            held: None,
        });
        Ok(self.sources.len() - 1)
    }

    /// Swap the input port at `idx`.
    ///
    /// Allowed in any state as long as that port has nothing loaned or held.
    pub fn replace_source(&mut self, idx: usize, port: Arc<dyn SourcePort>) -> Result<()> {
        let slot = self.slot_mut(idx)?;
        if slot.loaned.is_some() || slot.held.is_some() {
            return Err(Error::InvalidState {
                from: "loaned",
                to: "replace_source",
            });
        }
        slot.port = port;
        Ok(())
    }

    fn slot_mut(&mut self, idx: usize) -> Result<&mut SourceSlot> {
        let count = self.sources.len();
        self.sources
            .get_mut(idx)
            .ok_or_else(|| Error::InvalidArgument(format!("source port {idx} of {count}")))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// `Stopped -> Starting`. Resets the sequence counter.
    pub fn start(&mut self) -> Result<()> {
        self.require_stopped("starting")?;
        if self.sink.is_none() && self.sources.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "instance {} has no ports attached",
                self.instance
            )));
        }
        self.state = FrameState::Starting;
        self.sequence = 0;
        self.defective = false;
        Ok(())
    }

    /// `Starting -> Running` once the first frame is programmed.
    pub fn mark_running(&mut self) -> Result<()> {
        match self.state {
            FrameState::Starting => {
                self.state = FrameState::Running;
                Ok(())
            }
            FrameState::Running => Ok(()),
            other => Err(Error::InvalidState {
                from: other.name(),
                to: "running",
            }),
        }
    }

    /// `Starting | Running -> Stopping`. No-op when already stopping or
    /// stopped.
    pub fn stop(&mut self) {
        if self.state.accepts_frames() {
            self.state = FrameState::Stopping;
        }
    }

    /// `Stopping -> Stopped`, completing everything detached.
    ///
    /// See [`take_stop`](Self::take_stop).
    pub fn finish_stop(&mut self) -> Result<ReleaseReport> {
        self.take_stop().map(Released::complete)
    }

    /// `Stopping -> Stopped`.
    ///
    /// A frame still loaned is abandoned: its sink buffer is detached as
    /// dropped and its source buffers go back unread to the front of their
    /// ports. Held sources are detached as consumed. After this the context
    /// holds no buffers.
    pub fn take_stop(&mut self) -> Result<Released> {
        if self.state != FrameState::Stopping {
            return Err(Error::InvalidState {
                from: self.state.name(),
                to: "stopped",
            });
        }
        let mut released = Released::new(if self.has_frame() { self.sequence } else { 0 });
        if let (Some(sink), Some(mut buf)) = (&self.sink, self.loaned_sink.take()) {
            buf.set_defective(true);
            released.sinks.push((Arc::clone(sink), buf, Completion::Dropped));
            released.report.dropped = true;
        }
        for slot in &mut self.sources {
            slot.hold = false;
            if let Some(buf) = slot.loaned.take() {
                slot.port.requeue(buf);
                released.report.requeued += 1;
            }
            if let Some(buf) = slot.held.take() {
                released.sources.push((Arc::clone(&slot.port), buf));
                released.report.consumed += 1;
            }
        }
        self.defective = false;
        self.state = FrameState::Stopped;
        Ok(released)
    }

    // ========================================================================
    // Frame cycle
    // ========================================================================

    /// Take one buffer from the sink and from every source, atomically.
    ///
    /// Held buffers stay out of the rotation: every source supplies a fresh
    /// buffer. If any port is empty, everything taken in this attempt is
    /// given back in reverse order and [`Acquire::NoBuffer`] is returned.
    pub fn acquire_next_frame(&mut self) -> Result<Acquire> {
        if !self.state.accepts_frames() {
            return Err(Error::InvalidState {
                from: self.state.name(),
                to: "acquire",
            });
        }
        if self.has_frame() {
            return Err(Error::InvalidState {
                from: "loaned",
                to: "acquire",
            });
        }

        let sink_buf = match &self.sink {
            Some(sink) => match sink.try_acquire() {
                Some(buf) => Some(buf),
                None => return Ok(Acquire::NoBuffer),
            },
            None => None,
        };

        let mut taken: SmallVec<[Buffer; SCALER_FAN_IN]> = SmallVec::new();
        for slot in &self.sources {
            match slot.port.try_dequeue() {
                Some(buf) => taken.push(buf),
                None => break,
            }
        }

        if taken.len() < self.sources.len() {
            while let Some(buf) = taken.pop() {
                self.sources[taken.len()].port.requeue(buf);
            }
            if let (Some(sink), Some(buf)) = (&self.sink, sink_buf) {
                sink.cancel(buf);
            }
            return Ok(Acquire::NoBuffer);
        }

        self.sequence += 1;
        self.defective = false;
        let mut frame = FrameBuffers {
            instance: self.instance,
            sequence: self.sequence,
            sink: None,
            sources: SmallVec::new(),
        };
        if let Some(mut buf) = sink_buf {
            buf.set_sequence(self.sequence);
            frame.sink = Some(buf.mem());
            self.loaned_sink = Some(buf);
        }
        for (slot, buf) in self.sources.iter_mut().zip(taken) {
            frame.sources.push(buf.mem());
            slot.loaned = Some(buf);
        }
        Ok(Acquire::Ready(frame))
    }

    /// Addresses of the frame currently loaned, if any.
    pub fn frame_buffers(&self) -> Option<FrameBuffers> {
        if !self.has_frame() {
            return None;
        }
        Some(FrameBuffers {
            instance: self.instance,
            sequence: self.sequence,
            sink: self.loaned_sink.as_ref().map(Buffer::mem),
            sources: self
                .sources
                .iter()
                .filter_map(|s| s.loaned.as_ref().map(Buffer::mem))
                .collect(),
        })
    }

    /// Flag the loaned frame so its sink buffer completes as dropped.
    pub fn mark_defective(&mut self) {
        if self.has_frame() {
            self.defective = true;
        }
    }

    /// Keep the loaned buffer of source `idx` past the next release.
    ///
    /// The buffer leaves the rotation until [`release_held`](Self::release_held)
    /// hands it back; later frames read fresh buffers from the port. One
    /// buffer per source can be held at a time.
    pub fn hold_source(&mut self, idx: usize) -> Result<()> {
        let slot = self.slot_mut(idx)?;
        if slot.loaned.is_none() {
            return Err(Error::InvalidState {
                from: "idle",
                to: "hold",
            });
        }
        if slot.held.is_some() {
            return Err(Error::InvalidState {
                from: "held",
                to: "hold",
            });
        }
        slot.hold = true;
        Ok(())
    }

    /// Complete a held buffer of source `idx` as consumed.
    ///
    /// Returns `false` if nothing was held.
    pub fn release_held(&mut self, idx: usize) -> Result<bool> {
        Ok(self.take_held(idx)?.map(Released::complete).is_some())
    }

    /// Detach the held buffer of source `idx`, if any, as consumed.
    pub fn take_held(&mut self, idx: usize) -> Result<Option<Released>> {
        let slot = self.slot_mut(idx)?;
        let Some(buf) = slot.held.take() else {
            return Ok(None);
        };
        let mut released = Released::new(0);
        released.sources.push((Arc::clone(&slot.port), buf));
        released.report.consumed = 1;
        Ok(Some(released))
    }

    /// Whether source `idx` has a buffer held back.
    pub fn is_held(&self, idx: usize) -> bool {
        self.sources.get(idx).is_some_and(|s| s.held.is_some())
    }

    /// Hand the loaned frame back and complete it.
    ///
    /// See [`take_frame`](Self::take_frame). Releasing with nothing loaned
    /// is a no-op.
    pub fn release_frame(&mut self) -> ReleaseReport {
        self.take_frame().complete()
    }

    /// Detach the loaned frame.
    ///
    /// The sink buffer is detached as produced, or dropped if the frame was
    /// marked defective. Source buffers are detached as consumed unless held;
    /// held ones stay in the context.
    pub fn take_frame(&mut self) -> Released {
        if !self.has_frame() {
            return Released::new(0);
        }
        let mut released = Released::new(self.sequence);
        if let (Some(sink), Some(mut buf)) = (&self.sink, self.loaned_sink.take()) {
            buf.set_defective(self.defective);
            let completion = if self.defective {
                released.report.dropped = true;
                Completion::Dropped
            } else {
                released.report.produced = true;
                Completion::Produced
            };
            released.sinks.push((Arc::clone(sink), buf, completion));
        }
        for slot in &mut self.sources {
            let Some(buf) = slot.loaned.take() else {
                continue;
            };
            if std::mem::take(&mut slot.hold) {
                slot.held = Some(buf);
                released.report.held += 1;
            } else {
                released.sources.push((Arc::clone(&slot.port), buf));
                released.report.consumed += 1;
            }
        }
        self.defective = false;
        released
    }
}

impl FastPath for FrameContext {}

impl fmt::Debug for FrameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameContext")
            .field("instance", &self.instance)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("loaned", &self.has_frame())
            .field("sources", &self.sources.len())
            .finish()
    }
}
