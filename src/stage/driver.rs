//! The frame-advance core shared by every stage.

use super::StageKind;
use super::events::StageEvent;
use super::hardware::{Hardware, IrqStatus};
use crate::bus::{BindInfo, BusRegistry, Command, Endpoint, Message, ReplyWriter, StageState};
use crate::config::defaults::EVENT_CAPACITY;
use crate::config::{BindRecord, StageConfig};
use crate::error::{Error, Result};
use crate::frame::{
    Acquire, FrameBuffers, FrameContext, FrameState, ReadyHook, ReleaseReport, Released,
    SinkPort, SourcePort,
};
use crate::irq::{self, IrqLock, ensure_worker};
use crate::observability::{StageMetrics, trace_frame_done, trace_state_change};
use crate::queue::JobQueue;
use crate::sched::{Admission, Pass, SharedUnit};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::Span;

static NEXT_DEVICE: AtomicU32 = AtomicU32::new(0);

/// Deferred work handed from interrupts and triggers to [`StageDriver::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    /// A port may have buffers now.
    Kick(u32),
    /// The running pass of `instance` ended.
    PassDone {
        instance: u32,
        error: bool,
        restart: bool,
    },
    /// Stop `instance` once its frame is out of the hardware.
    Stop(u32),
    /// Abort everything and restart from a clean unit.
    Reset,
}

/// Format recorded for one pad by a `SetFormatCap` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadFormat {
    /// Pad index.
    pub pad: u32,
    /// Opaque format code.
    pub format: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

struct Instance {
    context: IrqLock<FrameContext>,
    /// Sticky: set when acquisition finds no buffer, cleared on success.
    starved: AtomicBool,
    /// A kick that could not be queued.
    retry: AtomicBool,
    /// A pass is programmed on a dedicated unit.
    in_flight: AtomicBool,
    /// Programming failed; port hooks no longer restart the instance until
    /// an explicit trigger, start or reset.
    faulted: AtomicBool,
}

/// Drives one hardware stage over one or more logical instances.
///
/// Interrupts and port hooks only push jobs; [`advance`](Self::advance)
/// drains them. At most one context drains at a time, others return at once
/// and leave their jobs to the running drain. Starved instances are
/// re-checked at the end of every drain, so a buffer shortage clears itself
/// on the next interrupt or trigger.
///
/// # Example
///
/// ```rust
/// use campipe::buffer::{Buffer, BufferId};
/// use campipe::config::StageConfig;
/// use campipe::frame::{FrameBuffers, FramePool, SinkPort};
/// use campipe::memory::MemBuf;
/// use campipe::sched::Pass;
/// use campipe::stage::{IrqStatus, StageDriver, StageKind};
/// use std::sync::Arc;
///
/// let hw = |_: &Pass, _: &FrameBuffers| -> campipe::Result<()> { Ok(()) };
/// let driver = StageDriver::new(
///     "csi0",
///     StageKind::Capture,
///     StageKind::Capture.default_config(),
///     hw,
/// )
/// .unwrap();
///
/// let pool = Arc::new(FramePool::with_buffers("csi0-out", 0, 0x8000_0000, 4096, 2));
/// driver.attach_sink(0, pool.clone()).unwrap();
/// driver.start(0).unwrap();
///
/// driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
/// assert_eq!(pool.produced_count(), 1);
/// ```
pub struct StageDriver {
    name: String,
    kind: StageKind,
    device: u32,
    config: StageConfig,
    instances: Box<[Instance]>,
    jobs: JobQueue<Job>,
    advancing: AtomicBool,
    unit: Option<SharedUnit>,
    hardware: Box<dyn Hardware>,
    endpoint: OnceLock<Endpoint>,
    events: broadcast::Sender<StageEvent>,
    input: AtomicU32,
    formats: Mutex<Vec<PadFormat>>,
    metrics: StageMetrics,
    span: Span,
    this: Weak<StageDriver>,
}

impl StageDriver {
    /// Create a driver with every instance stopped.
    ///
    /// Shared stage kinds get a [`SharedUnit`] with
    /// `instances * pipeline_depth` schedule nodes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `config` is malformed or does not fit
    /// `kind`; [`Error::AllocationFailed`] if queues cannot be reserved.
    pub fn new(
        name: impl Into<String>,
        kind: StageKind,
        config: StageConfig,
        hardware: impl Hardware + 'static,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        kind.check(&config)?;
        let name = name.into();

        let unit = if kind.is_shared() {
            Some(SharedUnit::new(
                name.clone(),
                config.instances,
                config.schedule_nodes(),
            )?)
        } else {
            None
        };
        let jobs = JobQueue::new(config.job_capacity)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let instances = (0..config.instances)
            .map(|i| Instance {
                context: IrqLock::new(FrameContext::new(i)),
                starved: AtomicBool::new(false),
                retry: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
            })
            .collect();
        let span = config.tracing.stage_span(&name, kind.as_str());
        tracing::debug!(
            parent: &span,
            instances = config.instances,
            shared = unit.is_some(),
            tiles = config.tiles,
            "stage driver created"
        );

        Ok(Arc::new_cyclic(|this| Self {
            metrics: StageMetrics::new(&name),
            name,
            kind,
            device: NEXT_DEVICE.fetch_add(1, Ordering::Relaxed),
            config,
            instances,
            jobs,
            advancing: AtomicBool::new(false),
            unit,
            hardware: Box::new(hardware),
            endpoint: OnceLock::new(),
            events,
            input: AtomicU32::new(0),
            formats: Mutex::new(Vec::new()),
            span,
            this: this.clone(),
        }))
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage kind.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Device number this driver's interrupts are serviced under.
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Configuration the driver was created with.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Number of logical instances.
    pub fn instances(&self) -> u32 {
        self.instances.len() as u32
    }

    /// The shared hardware unit, for shared stage kinds.
    pub fn unit(&self) -> Option<&SharedUnit> {
        self.unit.as_ref()
    }

    /// Subscribe to frame and lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    /// Jobs waiting to be drained.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    fn slot(&self, instance: u32) -> Result<&Instance> {
        self.instances
            .get(instance as usize)
            .ok_or(Error::InvalidInstance {
                id: instance,
                max: self.instances.len() as u32,
            })
    }

    /// Lifecycle state of `instance`.
    pub fn state(&self, instance: u32) -> Result<FrameState> {
        Ok(self.slot(instance)?.context.with(|c| c.state()))
    }

    /// Sequence number of the last frame acquired by `instance`.
    pub fn sequence(&self, instance: u32) -> Result<u64> {
        Ok(self.slot(instance)?.context.with(|c| c.sequence()))
    }

    /// Whether `instance` is waiting for buffers.
    pub fn is_starved(&self, instance: u32) -> Result<bool> {
        Ok(self.slot(instance)?.starved.load(Ordering::Acquire))
    }

    /// Whether `instance` stopped restarting after a programming failure.
    pub fn is_faulted(&self, instance: u32) -> Result<bool> {
        Ok(self.slot(instance)?.faulted.load(Ordering::Acquire))
    }

    /// Buffers of the frame `instance` currently has loaned.
    pub fn frame_buffers(&self, instance: u32) -> Result<Option<FrameBuffers>> {
        Ok(self.slot(instance)?.context.with(|c| c.frame_buffers()))
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Attach the output pool of `instance`. Only while stopped.
    pub fn attach_sink(&self, instance: u32, sink: Arc<dyn SinkPort>) -> Result<()> {
        let slot = self.slot(instance)?;
        if !self.config.has_sink {
            return Err(Error::InvalidArgument(format!(
                "{} has no output port",
                self.name
            )));
        }
        slot.context.with(|c| c.set_sink(Arc::clone(&sink)))?;
        sink.watch(self.ready_hook(instance));
        Ok(())
    }

    /// Attach the next input port of `instance`. Only while stopped.
    ///
    /// Returns the port index.
    pub fn attach_source(&self, instance: u32, source: Arc<dyn SourcePort>) -> Result<usize> {
        let slot = self.slot(instance)?;
        let limit = self.config.sources;
        let idx = slot.context.with(|c| {
            if c.source_count() >= limit {
                return Err(Error::InvalidArgument(format!(
                    "{} takes {limit} input ports",
                    self.name
                )));
            }
            c.add_source(Arc::clone(&source))
        })?;
        source.watch(self.ready_hook(instance));
        Ok(idx)
    }

    /// Swap input port `idx` of `instance`, e.g. after an input change.
    pub fn replace_source(
        &self,
        instance: u32,
        idx: usize,
        source: Arc<dyn SourcePort>,
    ) -> Result<()> {
        let slot = self.slot(instance)?;
        slot.context
            .with(|c| c.replace_source(idx, Arc::clone(&source)))?;
        source.watch(self.ready_hook(instance));
        self.kick(instance);
        Ok(())
    }

    /// Keep the loaned buffer of input `idx` out of the rotation until
    /// [`release_held`](Self::release_held).
    pub fn hold_source(&self, instance: u32, idx: usize) -> Result<()> {
        self.slot(instance)?.context.with(|c| c.hold_source(idx))
    }

    /// Complete a held input buffer as consumed.
    pub fn release_held(&self, instance: u32, idx: usize) -> Result<bool> {
        let released = self.slot(instance)?.context.with(|c| c.take_held(idx))?;
        Ok(released.map(Released::complete).is_some())
    }

    fn ready_hook(&self, instance: u32) -> ReadyHook {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(driver) = this.upgrade() {
                driver.kick(instance);
            }
        })
    }

    // ========================================================================
    // Lifecycle (worker context)
    // ========================================================================

    /// Start `instance` and try to program its first frame.
    pub fn start(&self, instance: u32) -> Result<()> {
        ensure_worker("start")?;
        let slot = self.slot(instance)?;
        slot.context.with(|c| c.start())?;
        slot.faulted.store(false, Ordering::Release);
        self.state_changed(instance, FrameState::Stopped, FrameState::Starting);
        self.kick(instance);
        Ok(())
    }

    /// Stop `instance`.
    ///
    /// An instance with a pass in the hardware stays `Stopping` until that
    /// pass ends; otherwise it is `Stopped` when this returns.
    pub fn stop(&self, instance: u32) -> Result<()> {
        ensure_worker("stop")?;
        self.slot(instance)?;
        self.enqueue(Job::Stop(instance))?;
        self.advance();
        Ok(())
    }

    /// Drop every loaned frame, reset the hardware and restart running
    /// instances. Used for `ResetControl` and error recovery.
    pub fn reset(&self) -> Result<()> {
        self.enqueue(Job::Reset)?;
        self.advance();
        Ok(())
    }

    fn start_all(&self) -> Result<()> {
        for (i, slot) in self.instances.iter().enumerate() {
            let ready = slot.context.with(|c| {
                c.state() == FrameState::Stopped && (c.has_sink() || c.source_count() > 0)
            });
            if ready {
                self.start(i as u32)?;
            }
        }
        Ok(())
    }

    fn stop_all(&self) -> Result<()> {
        for i in 0..self.instances() {
            self.stop(i)?;
        }
        Ok(())
    }

    // ========================================================================
    // Fast path
    // ========================================================================

    /// Feed a decoded interrupt status.
    ///
    /// Runs in interrupt context for [`device`](Self::device): slow-path
    /// calls made from the hardware or port hooks meanwhile are refused.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if the completion could not be queued; the
    /// caller should report the same status again.
    pub fn on_interrupt(&self, status: IrqStatus) -> Result<()> {
        let _irq = irq::enter(self.device);
        self.slot(status.instance)?;
        let queued = if status.ends_pass() {
            self.enqueue(Job::PassDone {
                instance: status.instance,
                error: status.error,
                restart: true,
            })
        } else {
            Ok(())
        };
        self.advance();
        queued
    }

    /// Ask `instance` to try acquiring a frame, e.g. after buffers were
    /// queued on one of its ports. Also clears a programming fault.
    pub fn trigger(&self, instance: u32) -> Result<()> {
        self.slot(instance)?.faulted.store(false, Ordering::Release);
        self.kick(instance);
        Ok(())
    }

    fn kick(&self, instance: u32) {
        if self.enqueue(Job::Kick(instance)).is_err() {
            if let Some(slot) = self.instances.get(instance as usize) {
                slot.retry.store(true, Ordering::Release);
            }
        }
        self.advance();
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        self.jobs.push(job).inspect_err(|_| {
            self.metrics.record_job_rejected();
            tracing::debug!(parent: &self.span, ?job, "job queue full");
        })
    }

    /// Drain queued jobs, then re-check starved instances.
    ///
    /// Returns immediately if another context is already draining.
    pub fn advance(&self) {
        loop {
            if self.advancing.swap(true, Ordering::Acquire) {
                return;
            }
            {
                let _entered = self.span.enter();
                while let Ok(job) = self.jobs.pop() {
                    self.run(job);
                }
                for (i, slot) in self.instances.iter().enumerate() {
                    let retry = slot.retry.swap(false, Ordering::AcqRel);
                    if retry || slot.starved.load(Ordering::Acquire) {
                        self.try_start_frame(i as u32);
                    }
                }
            }
            self.advancing.store(false, Ordering::Release);
            if self.jobs.is_empty() {
                return;
            }
        }
    }

    fn run(&self, job: Job) {
        tracing::trace!(?job, "running job");
        match job {
            Job::Kick(instance) => self.try_start_frame(instance),
            Job::PassDone {
                instance,
                error,
                restart,
            } => self.finish_pass(instance, error, restart),
            Job::Stop(instance) => self.stop_instance(instance),
            Job::Reset => self.reset_unit(),
        }
    }

    fn try_start_frame(&self, instance: u32) {
        let Some(slot) = self.instances.get(instance as usize) else {
            return;
        };
        if slot.faulted.load(Ordering::Acquire) {
            return;
        }
        let acquired = slot.context.with(|c| {
            if !c.state().accepts_frames() || c.has_frame() {
                return None;
            }
            Some(c.acquire_next_frame())
        });
        match acquired {
            None => {}
            Some(Ok(Acquire::Ready(_))) => {
                if slot.starved.swap(false, Ordering::AcqRel) {
                    tracing::debug!(instance, "buffers available again");
                    self.emit(StageEvent::Resumed { instance });
                }
                self.admit(instance, slot);
            }
            Some(Ok(Acquire::NoBuffer)) => {
                self.metrics.record_starved();
                if !slot.starved.swap(true, Ordering::AcqRel) {
                    tracing::trace!(instance, "no buffer, waiting");
                    self.emit(StageEvent::Starved { instance });
                }
            }
            Some(Err(e)) => tracing::debug!(instance, error = %e, "acquire refused"),
        }
    }

    fn admit(&self, instance: u32, slot: &Instance) {
        let Some(unit) = &self.unit else {
            self.program(Pass::single(instance));
            return;
        };
        match unit.submit(instance, self.config.tiles) {
            Ok(Admission::Run(pass)) => self.program(pass),
            Ok(Admission::Queued) => tracing::trace!(instance, "waiting for shared unit"),
            Err(e) => {
                tracing::warn!(instance, error = %e, "admission refused, dropping frame");
                let released = slot.context.with(|c| {
                    c.mark_defective();
                    c.take_frame()
                });
                self.publish(instance, &released.complete());
            }
        }
    }

    fn program(&self, pass: Pass) {
        let instance = pass.instance;
        let Some(slot) = self.instances.get(instance as usize) else {
            return;
        };
        if self.unit.is_none() {
            slot.in_flight.store(true, Ordering::Release);
        }
        let prepared = slot.context.with(|c| {
            if !c.state().accepts_frames() {
                return None;
            }
            let frame = c.frame_buffers()?;
            let first = c.state() == FrameState::Starting && c.mark_running().is_ok();
            Some((frame, first))
        });
        let Some((frame, first)) = prepared else {
            tracing::trace!(instance, tile = pass.tile, "nothing to program, unwinding pass");
            self.defer_completion(instance);
            return;
        };
        if first {
            self.state_changed(instance, FrameState::Starting, FrameState::Running);
        }

        match self.hardware.program(&pass, &frame) {
            Ok(()) if pass.tile == 0 => self.notify_peer(Command::Schedule {
                unit: instance,
                buffers: schedule_buffers(&frame),
            }),
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(instance, tile = pass.tile, error = %e, "programming failed, dropping frame");
                slot.faulted.store(true, Ordering::Release);
                self.defer_completion(instance);
            }
        }
    }

    /// Complete a pass that never reached the hardware, without restarting.
    fn defer_completion(&self, instance: u32) {
        let job = Job::PassDone {
            instance,
            error: true,
            restart: false,
        };
        if self.enqueue(job).is_err() {
            self.finish_pass(instance, true, false);
        }
    }

    fn finish_pass(&self, instance: u32, error: bool, restart: bool) {
        let Some(slot) = self.instances.get(instance as usize) else {
            return;
        };
        if let Some(unit) = &self.unit {
            let Some(done) = unit.running().filter(|p| p.instance == instance) else {
                tracing::debug!(instance, "completion without a running pass ignored");
                return;
            };
            let Ok(next) = unit.complete() else {
                return;
            };
            if error {
                slot.context.with(|c| c.mark_defective());
            }
            if !done.is_last() {
                if let Some(next) = next {
                    self.program(next);
                }
                return;
            }
            self.retire(instance, slot);
            if let Some(next) = next {
                self.program(next);
            }
        } else {
            if !slot.in_flight.swap(false, Ordering::AcqRel) {
                tracing::debug!(instance, "completion without a running pass ignored");
                return;
            }
            if error {
                slot.context.with(|c| c.mark_defective());
            }
            self.retire(instance, slot);
        }
        if restart {
            self.try_start_frame(instance);
        }
    }

    /// Release the loaned frame and finish a pending stop.
    ///
    /// Buffers reach their ports only after the context lock is dropped:
    /// completing them fires hooks that may run other stages.
    fn retire(&self, instance: u32, slot: &Instance) {
        let (released, stopped) = slot.context.with(|c| {
            let mut released = c.take_frame();
            if c.state() != FrameState::Stopping {
                return (released, false);
            }
            if let Ok(rest) = c.take_stop() {
                released.merge(rest);
            }
            (released, true)
        });
        self.publish(instance, &released.complete());
        if stopped {
            slot.starved.store(false, Ordering::Release);
            self.state_changed(instance, FrameState::Stopping, FrameState::Stopped);
        }
    }

    fn stop_instance(&self, instance: u32) {
        let Some(slot) = self.instances.get(instance as usize) else {
            return;
        };
        let engaged = match &self.unit {
            Some(unit) => {
                unit.running().is_some_and(|p| p.instance == instance)
                    || unit.is_pending(instance)
            }
            None => slot.in_flight.load(Ordering::Acquire),
        };
        slot.starved.store(false, Ordering::Release);
        slot.retry.store(false, Ordering::Release);
        slot.faulted.store(false, Ordering::Release);

        let (from, finished) = slot.context.with(|c| {
            let from = c.state();
            c.stop();
            if engaged || c.state() != FrameState::Stopping {
                return (from, None);
            }
            (from, Some(c.take_stop()))
        });
        if !from.accepts_frames() {
            return;
        }
        match finished {
            None => self.state_changed(instance, from, FrameState::Stopping),
            Some(Ok(released)) => {
                self.publish(instance, &released.complete());
                self.state_changed(instance, from, FrameState::Stopped);
            }
            Some(Err(e)) => tracing::debug!(instance, error = %e, "stop not finished"),
        }
    }

    fn reset_unit(&self) {
        let flushed = self.unit.as_ref().map_or(0, SharedUnit::reset);
        self.hardware.reset();
        tracing::info!(flushed, "hardware unit reset");
        for (i, slot) in self.instances.iter().enumerate() {
            slot.in_flight.store(false, Ordering::Release);
            slot.faulted.store(false, Ordering::Release);
            slot.context.with(|c| c.mark_defective());
            self.retire(i as u32, slot);
        }
        for i in 0..self.instances() {
            self.try_start_frame(i);
        }
    }

    fn publish(&self, instance: u32, report: &ReleaseReport) {
        if report.sequence == 0 {
            return;
        }
        let dropped = report.dropped;
        self.metrics.record_frame(dropped);
        if self.config.tracing.frame_events {
            trace_frame_done(&self.name, instance, report.sequence, dropped);
        }
        self.emit(StageEvent::FrameDone {
            instance,
            sequence: report.sequence,
            dropped,
        });
        self.notify_peer(Command::FrameDone {
            instance,
            sequence: report.sequence,
            dropped,
        });
    }

    fn state_changed(&self, instance: u32, from: FrameState, to: FrameState) {
        trace_state_change(&self.name, instance, from.name(), to.name());
        self.emit(StageEvent::StateChanged { instance, state: to });
    }

    fn emit(&self, event: StageEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn notify_peer(&self, cmd: Command) {
        if let Some(endpoint) = self.endpoint.get() {
            if let Err(e) = endpoint.post(cmd) {
                tracing::trace!(error = %e, "peer notification skipped");
            }
        }
    }

    // ========================================================================
    // Bus
    // ========================================================================

    /// Register this driver on the bus.
    ///
    /// Incoming commands are handled by [`handle_message`](Self::handle_message);
    /// schedule and frame-done notifications are posted to the peer.
    pub fn bind(&self, registry: &BusRegistry, record: BindRecord) -> Result<BindInfo> {
        if self.endpoint.get().is_some() {
            return Err(Error::InvalidState {
                from: "bound",
                to: "bind",
            });
        }
        let this = self.this.clone();
        let id = record.logical_id;
        let (endpoint, info) = registry.register(
            record,
            move |msg: &Message<'_>, reply: &mut ReplyWriter<'_>| match this.upgrade() {
                Some(driver) => driver.handle_message(msg, reply),
                None => Error::Unbound(id).code(),
            },
        )?;
        self.endpoint.set(endpoint).map_err(|_| Error::InvalidState {
            from: "bound",
            to: "bind",
        })?;
        tracing::info!(parent: &self.span, endpoint = format_args!("{id:#x}"), "stage bound");
        Ok(info)
    }

    /// The bus endpoint, once bound.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.get()
    }

    /// Post a command to the bound peer.
    pub fn post(&self, cmd: Command) -> Result<u16> {
        self.endpoint
            .get()
            .ok_or(Error::InvalidState {
                from: "unbound",
                to: "post",
            })?
            .post(cmd)
    }

    /// Apply one bus message. Returns `0` or a negative error code.
    pub fn handle_message(&self, msg: &Message<'_>, reply: &mut ReplyWriter<'_>) -> i32 {
        let Some(cmd) = msg.command() else {
            tracing::debug!(len = msg.header.length, "user payload ignored");
            return 0;
        };
        let result = match cmd {
            Command::Bound | Command::Unbound => {
                tracing::debug!(parent: &self.span, ?cmd, "peer link changed");
                Ok(())
            }
            Command::SetState(state) => self.apply_state(state),
            Command::ResetControl => self.reset(),
            Command::ChangeInput { input } => self.change_input(input),
            Command::SetFormatCap {
                pad,
                format,
                width,
                height,
            } => self
                .set_format(PadFormat {
                    pad,
                    format,
                    width,
                    height,
                })
                .and_then(|()| {
                    let mut accepted = [0u8; 8];
                    accepted[..4].copy_from_slice(&width.to_le_bytes());
                    accepted[4..].copy_from_slice(&height.to_le_bytes());
                    reply.write(&accepted)
                }),
            // Upstream progress: re-check starved instances.
            Command::Schedule { .. } | Command::FrameDone { .. } => {
                self.advance();
                Ok(())
            }
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::debug!(parent: &self.span, ?cmd, error = %e, "command rejected");
                e.code()
            }
        }
    }

    fn apply_state(&self, state: StageState) -> Result<()> {
        match state {
            StageState::Inited => Ok(()),
            StageState::Started => self.start_all(),
            StageState::Stopped | StageState::Closed => self.stop_all(),
        }
    }

    fn change_input(&self, input: u32) -> Result<()> {
        if !self.kind.selects_input() {
            return Err(Error::InvalidArgument(format!(
                "{} stage has no selectable input",
                self.kind
            )));
        }
        let prev = self.input.swap(input, Ordering::AcqRel);
        tracing::info!(parent: &self.span, from = prev, to = input, "input changed");
        Ok(())
    }

    /// Currently selected input (capture stages).
    pub fn input(&self) -> u32 {
        self.input.load(Ordering::Acquire)
    }

    fn set_format(&self, fmt: PadFormat) -> Result<()> {
        let pads = self.config.sources as u32 + u32::from(self.config.has_sink);
        if fmt.pad >= pads {
            return Err(Error::InvalidArgument(format!(
                "pad {} of {pads}",
                fmt.pad
            )));
        }
        let mut formats = self.formats.lock().unwrap_or_else(PoisonError::into_inner);
        match formats.iter_mut().find(|f| f.pad == fmt.pad) {
            Some(existing) => *existing = fmt,
            None => formats.push(fmt),
        }
        Ok(())
    }

    /// Format last set on `pad`.
    pub fn format(&self, pad: u32) -> Option<PadFormat> {
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.pad == pad)
            .copied()
    }
}

/// Output first, then the first two inputs; missing entries are null.
fn schedule_buffers(frame: &FrameBuffers) -> [crate::memory::MemBuf; 3] {
    [
        frame.sink.unwrap_or_default(),
        frame.sources.first().copied().unwrap_or_default(),
        frame.sources.get(1).copied().unwrap_or_default(),
    ]
}

impl std::fmt::Debug for StageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDriver")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instances", &self.instances.len())
            .field("shared", &self.unit.is_some())
            .field("bound", &self.endpoint.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, BufferId};
    use crate::bus::Direction;
    use crate::config::BusConfig;
    use crate::frame::{FramePool, FrameQueue};
    use crate::memory::MemBuf;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        passes: Mutex<Vec<(Pass, FrameBuffers)>>,
        fail: AtomicBool,
    }

    impl Recorder {
        fn hardware(self: &Arc<Self>) -> impl Hardware + 'static {
            let rec = Arc::clone(self);
            move |pass: &Pass, frame: &FrameBuffers| {
                if rec.fail.load(Ordering::Acquire) {
                    return Err(Error::InvalidArgument("register write failed".into()));
                }
                rec.passes.lock().unwrap().push((*pass, frame.clone()));
                Ok(())
            }
        }

        fn count(&self) -> usize {
            self.passes.lock().unwrap().len()
        }

        fn last(&self) -> (Pass, FrameBuffers) {
            self.passes.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn capture(rec: &Arc<Recorder>, buffers: usize) -> (Arc<StageDriver>, Arc<FramePool>) {
        let driver = StageDriver::new(
            "csi0",
            StageKind::Capture,
            StageKind::Capture.default_config(),
            rec.hardware(),
        )
        .unwrap();
        let pool = Arc::new(FramePool::with_buffers("csi0-out", 0, 0x8000_0000, 0x1000, buffers));
        driver.attach_sink(0, pool.clone()).unwrap();
        (driver, pool)
    }

    fn filled(id: u64) -> Buffer {
        Buffer::new(BufferId(id), MemBuf::new(0x4000_0000 + id * 0x1000, 0x1000))
    }

    fn drain(rx: &mut broadcast::Receiver<StageEvent>) -> Vec<StageEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_capture_cycle() {
        let rec = Arc::new(Recorder::default());
        let (driver, pool) = capture(&rec, 2);
        let mut rx = driver.subscribe();

        driver.start(0).unwrap();
        assert_eq!(driver.state(0).unwrap(), FrameState::Running);
        assert_eq!(rec.count(), 1);
        assert_eq!(rec.last().1.sink, Some(MemBuf::new(0x8000_0000, 0x1000)));

        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert_eq!(pool.produced_count(), 1);
        assert_eq!(rec.count(), 2);
        assert_eq!(rec.last().1.sequence, 2);

        let events = drain(&mut rx);
        assert!(events.contains(&StageEvent::FrameDone {
            instance: 0,
            sequence: 1,
            dropped: false
        }));
        assert!(events.contains(&StageEvent::StateChanged {
            instance: 0,
            state: FrameState::Running
        }));
    }

    #[test]
    fn test_starvation_clears_when_buffer_returns() {
        let rec = Arc::new(Recorder::default());
        let (driver, pool) = capture(&rec, 1);
        let mut rx = driver.subscribe();

        driver.start(0).unwrap();
        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert!(driver.is_starved(0).unwrap());
        assert_eq!(rec.count(), 1);

        // Consumer hands the frame back; the pool hook kicks the stage.
        pool.recycle(pool.take_produced().unwrap());
        assert!(!driver.is_starved(0).unwrap());
        assert_eq!(rec.count(), 2);

        let events = drain(&mut rx);
        let starved = events
            .iter()
            .position(|e| *e == StageEvent::Starved { instance: 0 })
            .unwrap();
        let resumed = events
            .iter()
            .position(|e| *e == StageEvent::Resumed { instance: 0 })
            .unwrap();
        assert!(starved < resumed);
    }

    #[test]
    fn test_missing_input_leaves_output_untouched() {
        let rec = Arc::new(Recorder::default());
        let driver = StageDriver::new(
            "isp0",
            StageKind::Isp,
            StageKind::Isp.default_config(),
            rec.hardware(),
        )
        .unwrap();
        let pool = Arc::new(FramePool::with_buffers("isp0-out", 0, 0x9000_0000, 0x1000, 2));
        let input = Arc::new(FrameQueue::new("isp0-in", 4));
        driver.attach_source(0, input.clone()).unwrap();
        driver.attach_sink(0, pool.clone()).unwrap();

        driver.start(0).unwrap();
        assert!(driver.is_starved(0).unwrap());
        assert_eq!(pool.free_count(), 2);
        assert_eq!(rec.count(), 0);

        input.enqueue_filled(filled(1));
        assert_eq!(rec.count(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(input.pending(), 0);
    }

    #[test]
    fn test_shared_unit_serializes_instances() {
        let rec = Arc::new(Recorder::default());
        let config = StageKind::Isp.default_config().with_instances(2);
        let driver = StageDriver::new("isp0", StageKind::Isp, config, rec.hardware()).unwrap();
        let mut inputs = Vec::new();
        for i in 0..2u32 {
            let pool = Arc::new(FramePool::with_buffers(
                format!("out{i}"),
                u64::from(i) * 10,
                0x9000_0000 + u64::from(i) * 0x10_0000,
                0x1000,
                2,
            ));
            let input = Arc::new(FrameQueue::new(format!("in{i}"), 4));
            driver.attach_source(i, input.clone()).unwrap();
            driver.attach_sink(i, pool).unwrap();
            driver.start(i).unwrap();
            inputs.push(input);
        }

        inputs[0].enqueue_filled(filled(1));
        inputs[1].enqueue_filled(filled(2));
        assert_eq!(rec.count(), 1);
        assert_eq!(rec.last().0.instance, 0);
        assert_eq!(driver.unit().unwrap().queued(), 1);

        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert_eq!(rec.count(), 2);
        assert_eq!(rec.last().0.instance, 1);
        assert_eq!(inputs[0].consumed_total(), 1);
        assert!(driver.is_starved(0).unwrap());

        // A completion for an instance that is not on the unit is ignored.
        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert_eq!(rec.count(), 2);
    }

    #[test]
    fn test_tiled_frame_keeps_unit_until_last_pass() {
        let rec = Arc::new(Recorder::default());
        let config = StageKind::Warp.default_config().with_tiles(3);
        let driver = StageDriver::new("warp0", StageKind::Warp, config, rec.hardware()).unwrap();
        let pool = Arc::new(FramePool::with_buffers("warp0-out", 0, 0xa000_0000, 0x1000, 2));
        let input = Arc::new(FrameQueue::new("warp0-in", 4));
        driver.attach_source(0, input.clone()).unwrap();
        driver.attach_sink(0, pool.clone()).unwrap();
        driver.start(0).unwrap();
        input.enqueue_filled(filled(1));

        for tile in 0..3u8 {
            let (pass, frame) = rec.last();
            assert_eq!(pass.tile, tile);
            assert_eq!(frame.sequence, 1);
            assert_eq!(pool.produced_count(), 0);
            driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        }
        assert_eq!(rec.count(), 3);
        assert_eq!(pool.produced_count(), 1);
        assert!(!driver.unit().unwrap().is_busy());
    }

    #[test]
    fn test_error_interrupt_drops_frame() {
        let rec = Arc::new(Recorder::default());
        let (driver, pool) = capture(&rec, 2);
        let mut rx = driver.subscribe();
        driver.start(0).unwrap();

        driver.on_interrupt(IrqStatus::error(0)).unwrap();
        assert_eq!(pool.stats().dropped, 1);
        assert_eq!(pool.produced_count(), 0);
        assert!(drain(&mut rx).contains(&StageEvent::FrameDone {
            instance: 0,
            sequence: 1,
            dropped: true
        }));
        // The next frame was programmed regardless.
        assert_eq!(rec.count(), 2);
    }

    #[test]
    fn test_stop_waits_for_frame_end() {
        let rec = Arc::new(Recorder::default());
        let (driver, pool) = capture(&rec, 2);
        driver.start(0).unwrap();

        driver.stop(0).unwrap();
        assert_eq!(driver.state(0).unwrap(), FrameState::Stopping);

        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert_eq!(driver.state(0).unwrap(), FrameState::Stopped);
        assert_eq!(pool.produced_count(), 1);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(rec.count(), 1);
    }

    #[test]
    fn test_stop_idle_instance_is_immediate() {
        let rec = Arc::new(Recorder::default());
        let (driver, _pool) = capture(&rec, 0);
        driver.start(0).unwrap();
        assert!(driver.is_starved(0).unwrap());

        driver.stop(0).unwrap();
        assert_eq!(driver.state(0).unwrap(), FrameState::Stopped);
        assert!(!driver.is_starved(0).unwrap());
    }

    #[test]
    fn test_programming_failure_drops_without_restart() {
        let rec = Arc::new(Recorder::default());
        rec.fail.store(true, Ordering::Release);
        let (driver, pool) = capture(&rec, 2);

        driver.start(0).unwrap();
        assert_eq!(pool.stats().dropped, 1);
        assert_eq!(pool.free_count(), 2);
        assert!(driver.frame_buffers(0).unwrap().is_none());
        assert!(driver.is_faulted(0).unwrap());

        rec.fail.store(false, Ordering::Release);
        driver.trigger(0).unwrap();
        assert_eq!(rec.count(), 1);
        assert_eq!(rec.last().1.sequence, 2);
    }

    #[test]
    fn test_reset_drops_loaned_frame_and_restarts() {
        let rec = Arc::new(Recorder::default());
        let (driver, pool) = capture(&rec, 2);
        driver.start(0).unwrap();

        driver.reset().unwrap();
        assert_eq!(pool.stats().dropped, 1);
        assert_eq!(rec.count(), 2);
        assert_eq!(driver.sequence(0).unwrap(), 2);
    }

    #[test]
    fn test_invalid_instance_and_interrupt_context() {
        let rec = Arc::new(Recorder::default());
        let (driver, _pool) = capture(&rec, 1);
        assert_eq!(
            driver.trigger(3),
            Err(Error::InvalidInstance { id: 3, max: 1 })
        );
        let _irq = crate::irq::enter(7);
        assert_eq!(driver.start(0), Err(Error::InInterrupt("start")));
    }

    #[test]
    fn test_interrupts_run_in_interrupt_context() {
        let contexts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&contexts);
        let driver = StageDriver::new(
            "csi0",
            StageKind::Capture,
            StageKind::Capture.default_config(),
            move |_: &Pass, _: &FrameBuffers| -> Result<()> {
                seen.lock().unwrap().push(crate::irq::current_device());
                Ok(())
            },
        )
        .unwrap();
        let pool = Arc::new(FramePool::with_buffers("csi0-out", 0, 0x8000_0000, 0x1000, 2));
        driver.attach_sink(0, pool).unwrap();

        driver.start(0).unwrap();
        driver.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert!(!crate::irq::in_interrupt());
        assert_eq!(*contexts.lock().unwrap(), vec![None, Some(driver.device())]);

        // Slow-path calls made while servicing the interrupt are refused.
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&driver);
        let hw = move |_: &Pass, _: &FrameBuffers| -> Result<()> {
            let _ = tx.send(inner.stop(0));
            Ok(())
        };
        let outer = StageDriver::new(
            "csi1",
            StageKind::Capture,
            StageKind::Capture.default_config(),
            hw,
        )
        .unwrap();
        let pool = Arc::new(FramePool::with_buffers("csi1-out", 0, 0x9000_0000, 0x1000, 2));
        outer.attach_sink(0, pool).unwrap();
        outer.start(0).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        outer.on_interrupt(IrqStatus::frame_end(0)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Err(Error::InInterrupt("stop")));
        assert_ne!(outer.device(), driver.device());
    }

    #[test]
    fn test_bus_commands_drive_the_stage() {
        let rec = Arc::new(Recorder::default());
        let (driver, _pool) = capture(&rec, 2);
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        driver
            .bind(&registry, BindRecord::new(0x100, Direction::DownToUp))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let (service, _) = registry
            .register(
                BindRecord::new(0x100, Direction::UpToDown),
                move |msg: &Message<'_>, _: &mut ReplyWriter<'_>| {
                    if let Some(cmd) = msg.command() {
                        let _ = tx.send(cmd);
                    }
                    0
                },
            )
            .unwrap();

        service.post(Command::ChangeInput { input: 2 }).unwrap();
        service.post(Command::SetState(StageState::Started)).unwrap();
        // Bound notice, input change, start.
        assert_eq!(driver.endpoint().unwrap().deliver().unwrap(), 3);
        assert_eq!(driver.input(), 2);
        assert_eq!(driver.state(0).unwrap(), FrameState::Running);

        service.deliver().unwrap();
        let seen: Vec<Command> = rx.try_iter().collect();
        assert!(seen.iter().any(|c| matches!(c, Command::Schedule { unit: 0, .. })));

        assert!(matches!(
            driver.bind(&registry, BindRecord::new(0x101, Direction::DownToUp)),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_format_and_rejected_commands() {
        let rec = Arc::new(Recorder::default());
        let driver = StageDriver::new(
            "isp0",
            StageKind::Isp,
            StageKind::Isp.default_config(),
            rec.hardware(),
        )
        .unwrap();
        let registry = BusRegistry::new(BusConfig::default()).unwrap();
        driver
            .bind(&registry, BindRecord::new(0x200, Direction::DownToUp))
            .unwrap();
        let (service, _) = registry
            .register(
                BindRecord::new(0x200, Direction::UpToDown),
                |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0,
            )
            .unwrap();
        let _dispatcher = driver.endpoint().unwrap().spawn_dispatcher().unwrap();

        let mut reply = [0u8; 8];
        let res = service
            .post_sync(
                Command::SetFormatCap {
                    pad: 1,
                    format: 0x3231_564e,
                    width: 1920,
                    height: 1080,
                },
                &mut reply,
            )
            .unwrap();
        assert_eq!(res.result, 0);
        assert_eq!(&reply[..4], &1920u32.to_le_bytes());
        assert_eq!(driver.format(1).map(|f| f.height), Some(1080));

        let res = service
            .post_sync(Command::ChangeInput { input: 1 }, &mut reply)
            .unwrap();
        assert_eq!(res.result, Error::InvalidArgument(String::new()).code());

        let res = service
            .post_sync(
                Command::SetFormatCap {
                    pad: 5,
                    format: 0,
                    width: 1,
                    height: 1,
                },
                &mut reply,
            )
            .unwrap();
        assert!(!res.is_ok());
    }
}
