//! Bound bus endpoints.

use super::Direction;
use super::channel::{Channel, LinkState, Scratch, Side, lock};
use super::extra::ExtraBuf;
use super::message::{
    Body, Command, ExtraRef, HEADER_LEN, Header, Message, MsgFlags, NO_WAIT_SLOT, Payload,
    ReplyWriter,
};
use super::registry::BusRegistry;
use super::wait::SyncReply;
use crate::error::{Error, Result};
use crate::irq::{SlowPath, ensure_worker};
use crate::memory::MemBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Memory handles returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindInfo {
    /// Base of this side's message ring.
    pub ring_base: u64,
    /// Ring size in bytes.
    pub ring_size: u64,
    /// Base of the extra-buffer pool, 0 without one.
    pub extra_base: u64,
    /// Extra pool size in bytes, 0 without one.
    pub extra_size: u64,
}

impl BindInfo {
    pub(crate) fn new(ring: MemBuf, extra: Option<MemBuf>) -> Self {
        let extra = extra.unwrap_or_default();
        Self {
            ring_base: ring.address,
            ring_size: ring.size,
            extra_base: extra.address,
            extra_size: extra.size,
        }
    }
}

/// Counters of one endpoint's outgoing ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Messages posted since registration.
    pub posted: u64,
    /// Messages the peer has finished.
    pub acknowledged: u64,
    /// Posted but not acknowledged.
    pub outstanding: usize,
    /// Wait slots in use by synchronous posts.
    pub waits_in_use: usize,
    /// Free extra-buffer slots.
    pub extra_free: usize,
}

pub(crate) struct EndpointInner {
    pub(crate) channel: Arc<Channel>,
    pub(crate) direction: Direction,
    pub(crate) side: Arc<Side>,
    pub(crate) registry: BusRegistry,
}

/// One side of a bound channel.
///
/// Not `Clone`: the endpoint is owned by the driver or service that
/// registered it. Dropping it unbinds.
///
/// [`post`](Self::post) and [`post_long`](Self::post_long) never block and
/// are allowed in interrupt context. Registration, synchronous posts, extra
/// allocation and unbinding refuse to run there.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn new(inner: EndpointInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Logical id shared with the peer.
    pub fn logical_id(&self) -> u32 {
        self.inner.channel.logical_id
    }

    /// Which side this endpoint is.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Current channel state.
    pub fn state(&self) -> LinkState {
        self.inner.channel.state()
    }

    /// Whether an open peer is registered.
    pub fn is_bound(&self) -> bool {
        self.state() == LinkState::Bound
    }

    /// Ring and extra-pool memory of this side.
    pub fn bind_info(&self) -> BindInfo {
        let (ring, extra) = self.inner.side.regions();
        BindInfo::new(ring, extra)
    }

    /// Post a message without waiting.
    ///
    /// Copies the payload into the next ring slot and wakes the peer's
    /// dispatcher. Returns the message sequence number.
    ///
    /// # Errors
    ///
    /// - [`Error::Unbound`] without an open peer
    /// - [`Error::RetryLater`] if every ring slot is outstanding
    /// - [`Error::InvalidArgument`] if the payload exceeds the slot size
    pub fn post<'a>(&self, payload: impl Into<Payload<'a>>) -> Result<u16> {
        self.inner
            .send(MsgFlags::NONE, NO_WAIT_SLOT, &payload.into(), None)
    }

    /// Post a message and block until the peer's handler has run.
    ///
    /// Up to `reply.len()` reply bytes are copied into `reply`. Fails with
    /// [`Error::Timeout`] after the configured sync timeout; the peer may
    /// still act on the message. Worker context only.
    pub fn post_sync<'a>(&self, payload: impl Into<Payload<'a>>, reply: &mut [u8]) -> Result<SyncReply> {
        ensure_worker("post_sync")?;
        let side = &self.inner.side;
        let slot = side.waits.reserve()?;
        let sequence = match self
            .inner
            .send(MsgFlags::SYNC, slot, &payload.into(), Some(slot))
        {
            Ok(seq) => seq,
            Err(e) => {
                side.waits.release(slot);
                return Err(e);
            }
        };
        let timeout = self.inner.channel.config.sync_timeout;
        side.waits
            .wait(slot, sequence, timeout, reply)
            .inspect_err(|e| {
                if let Error::Timeout { waited_ms } = e {
                    side.metrics.record_sync_timeout();
                    tracing::warn!(
                        parent: &side.span,
                        sequence,
                        waited_ms,
                        "synchronous post timed out"
                    );
                }
            })
    }

    /// Claim an extra-buffer slot of at least `size` bytes. Worker context
    /// only.
    ///
    /// # Errors
    ///
    /// [`Error::NoExtraSpace`] if `size` exceeds the slot size, the pool is
    /// full, or this side has no pool.
    pub fn alloc_extra(&self, size: usize) -> Result<ExtraBuf> {
        ensure_worker("alloc_extra")?;
        let pool = self.inner.side.extra.as_ref().ok_or(Error::NoExtraSpace)?;
        let buf = lock(pool).alloc(size)?;
        Ok(buf.attach(pool))
    }

    /// Fill an extra buffer.
    pub fn write_extra(&self, buf: &mut ExtraBuf, data: &[u8]) -> Result<()> {
        let pool = self.inner.side.extra.as_ref().ok_or(Error::NoExtraSpace)?;
        lock(pool).write(buf, data)
    }

    /// Give an unposted extra buffer back.
    pub fn free_extra(&self, mut buf: ExtraBuf) -> Result<()> {
        let pool = self.inner.side.extra.as_ref().ok_or(Error::NoExtraSpace)?;
        lock(pool).free(buf.disarm())
    }

    /// Post an extra buffer by reference.
    ///
    /// The peer frees the slot after its handler has run. If the post fails
    /// the slot is freed here and the error returned.
    pub fn post_long(&self, mut buf: ExtraBuf) -> Result<u16> {
        let mut encoded = [0u8; ExtraRef::ENCODED_LEN];
        buf.to_ref().encode(&mut encoded);
        let seq = self.inner.send(
            MsgFlags::LONG,
            NO_WAIT_SLOT,
            &Payload::User(&encoded),
            None,
        )?;
        buf.disarm();
        Ok(seq)
    }

    /// Run the handler on every message the peer has posted since the last
    /// call. Returns how many messages were handled.
    pub fn deliver(&self) -> Result<usize> {
        self.inner.deliver()
    }

    /// Start a worker thread that sleeps on this endpoint's doorbell and
    /// delivers whenever the peer posts. Stops on unbind or when the
    /// returned handle is dropped.
    pub fn spawn_dispatcher(&self) -> Result<Dispatcher> {
        ensure_worker("spawn_dispatcher")?;
        let side = &self.inner.side;
        if side.dispatching.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState {
                from: "dispatching",
                to: "spawn_dispatcher",
            });
        }
        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&self.inner);
        let thread_stop = Arc::clone(&stop);
        let name = format!(
            "bus-{:#x}-{}",
            self.logical_id(),
            self.direction().as_str()
        );
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || inner.dispatch_loop(&thread_stop))
            .map_err(|e| {
                side.dispatching.store(false, Ordering::Release);
                Error::AllocationFailed(format!("dispatcher thread: {e}"))
            })?;
        Ok(Dispatcher {
            stop,
            doorbell: side.doorbell_tx.clone(),
            handle: Some(handle),
        })
    }

    /// Ring counters.
    pub fn stats(&self) -> EndpointStats {
        let side = &self.inner.side;
        let (written, acked) = side.ring.with(|r| r.counters());
        EndpointStats {
            posted: written,
            acknowledged: acked,
            outstanding: (written - acked) as usize,
            waits_in_use: side.waits.in_use(),
            extra_free: side.extra.as_ref().map_or(0, |p| lock(p).free_count()),
        }
    }

    /// Close this side.
    ///
    /// The peer (if open) receives an `Unbound` command; pending synchronous
    /// posts on this side fail with [`Error::Unbound`]. The channel is
    /// released once both sides are closed. Worker context only.
    pub fn unbind(&self) -> Result<()> {
        ensure_worker("unbind")?;
        self.inner.close();
        Ok(())
    }
}

impl SlowPath for Endpoint {}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("logical_id", &format_args!("{:#x}", self.logical_id()))
            .field("direction", &self.direction())
            .field("state", &self.state())
            .finish()
    }
}

impl EndpointInner {
    fn send(
        &self,
        flags: MsgFlags,
        wait_slot: u16,
        payload: &Payload<'_>,
        arm: Option<u16>,
    ) -> Result<u16> {
        let id = self.channel.logical_id;
        if self.side.is_closed() {
            return Err(Error::Unbound(id));
        }
        let peer = self.channel.live_peer(self.direction).ok_or(Error::Unbound(id))?;
        let side = &self.side;
        let sequence = side
            .ring
            .with(|ring| {
                let seq = ring.push(flags, wait_slot, payload)?;
                if let Some(slot) = arm {
                    side.waits.arm(slot, seq);
                }
                Ok(seq)
            })
            .inspect_err(|e| {
                if *e == Error::RetryLater {
                    side.metrics.record_retry_later();
                    tracing::trace!(parent: &side.span, "ring full");
                }
            })?;
        side.metrics.record_post();
        peer.kick();
        Ok(sequence)
    }

    fn deliver(&self) -> Result<usize> {
        let Some(peer) = self.channel.side(self.direction.peer()) else {
            return Ok(0);
        };
        let mut scratch = lock(&self.side.scratch);
        let entry_len = peer.entry_len();
        if scratch.entry.len() < entry_len {
            scratch.entry.resize(entry_len, 0);
        }
        let reply_len = peer.record.slot_size as usize;
        if scratch.reply.len() < reply_len {
            scratch.reply.resize(reply_len, 0);
        }

        let mut delivered = 0;
        loop {
            let Scratch { entry, .. } = &mut *scratch;
            if peer.ring.with(|r| r.read_next(entry)).is_none() {
                break;
            }
            let outcome = self.dispatch(&peer, &mut scratch);
            peer.ring.with(|r| r.ack());
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(parent: &self.side.span, error = %e, "dropping undecodable message");
                }
            }
        }
        Ok(delivered)
    }

    fn dispatch(&self, peer: &Side, scratch: &mut Scratch) -> Result<()> {
        let Scratch {
            entry,
            extra,
            reply,
        } = scratch;
        let payload_size = peer.record.slot_size as usize;
        let header = Header::decode(entry, payload_size)?;
        let payload = &entry[HEADER_LEN..HEADER_LEN + header.length as usize];

        let body = if header.flags.contains(MsgFlags::LONG) {
            let extra_ref = ExtraRef::decode(payload)?;
            let pool = peer
                .extra
                .as_ref()
                .ok_or_else(|| Error::Malformed("long message without extra pool".into()))?;
            let mut pool = lock(pool);
            let data = pool.read(&extra_ref)?;
            extra.clear();
            extra.extend_from_slice(data);
            pool.free(extra_ref.slot)?;
            Body::Long(extra.as_slice())
        } else if header.flags.contains(MsgFlags::USER) {
            Body::User(payload)
        } else {
            Body::Command(Command::decode(payload)?)
        };

        let msg = Message { header, body };
        let mut writer = ReplyWriter::new(&mut reply[..payload_size]);
        let result = self.side.handle(&msg, &mut writer);
        if header.is_sync() {
            peer.waits
                .complete(header.wait_slot, header.sequence, result, writer.written());
        }
        Ok(())
    }

    fn dispatch_loop(&self, stop: &AtomicBool) {
        let _span = self.side.span.enter();
        tracing::debug!("dispatcher started");
        while self.side.doorbell_rx.recv().is_ok() {
            if stop.load(Ordering::Acquire) || self.side.is_closed() {
                break;
            }
            if let Err(e) = self.deliver() {
                tracing::debug!(error = %e, "deliver failed");
            }
        }
        self.side.dispatching.store(false, Ordering::Release);
        tracing::debug!("dispatcher stopped");
    }

    /// Idempotent close shared by `unbind` and `Drop`.
    pub(crate) fn close(&self) {
        let side = &self.side;
        if side.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let aborted = side.waits.abort_all();
        if let Some(peer) = self.channel.live_peer(self.direction) {
            if let Err(e) = side.push_command(Command::Unbound) {
                tracing::debug!(parent: &side.span, error = %e, "unbound notice not queued");
            }
            peer.kick();
        }
        side.kick();
        tracing::info!(parent: &side.span, aborted, "endpoint unbound");
        self.registry.release_if_closed(&self.channel);
    }
}

/// Handle of a dispatcher thread started by
/// [`Endpoint::spawn_dispatcher`].
pub struct Dispatcher {
    stop: Arc<AtomicBool>,
    doorbell: kanal::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.doorbell.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
