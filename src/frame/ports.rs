//! Buffer ports a frame context draws from and returns to.
//!
//! The buffer layer itself (allocation, import, reference counting) lives
//! outside this crate. A frame context only sees it through two roles:
//!
//! - [`SinkPort`]: hands out *free* buffers for hardware to write and takes
//!   them back as produced or dropped
//! - [`SourcePort`]: hands out *filled* buffers for hardware to read and
//!   takes them back as consumed
//!
//! [`FramePool`] and [`FrameQueue`] are in-memory implementations used by the
//! stage drivers and tests. Their fast-path methods never allocate: every
//! deque is sized for the full buffer population up front.

use crate::buffer::{Buffer, BufferId, Completion};
use crate::irq::{FastPath, IrqLock};
use crate::memory::MemBuf;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

/// Callback fired when a port gains a buffer a stalled stage may be waiting
/// for. Must only do fast-path work (typically pushing a job).
pub type ReadyHook = Arc<dyn Fn() + Send + Sync>;

/// Output role: free buffers in, finished frames out.
pub trait SinkPort: Send + Sync {
    /// Take a free buffer, or `None` if the pool is starved.
    fn try_acquire(&self) -> Option<Buffer>;

    /// Undo a [`try_acquire`](Self::try_acquire) made in a cycle that could
    /// not complete. The buffer becomes free again.
    fn cancel(&self, buffer: Buffer);

    /// Hand a finished buffer back as produced or dropped.
    fn complete(&self, buffer: Buffer, completion: Completion);

    /// Register a hook fired when a free buffer becomes available.
    fn watch(&self, _hook: ReadyHook) {}
}

/// Input role: filled buffers in, consumed buffers out.
pub trait SourcePort: Send + Sync {
    /// Take the oldest filled buffer, or `None` if none is pending.
    fn try_dequeue(&self) -> Option<Buffer>;

    /// Undo a [`try_dequeue`](Self::try_dequeue): the buffer goes back to the
    /// front so ordering is preserved.
    fn requeue(&self, buffer: Buffer);

    /// Hand a buffer back once hardware has read it.
    fn complete(&self, buffer: Buffer);

    /// Number of filled buffers waiting.
    fn pending(&self) -> usize;

    /// Register a hook fired when a filled buffer arrives.
    fn watch(&self, _hook: ReadyHook) {}
}

/// Completion counters of a [`FramePool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers completed as produced.
    pub produced: u64,
    /// Buffers completed as dropped, or as consumed which an output
    /// buffer never is.
    pub dropped: u64,
    /// Acquisitions undone by [`SinkPort::cancel`].
    pub cancelled: u64,
}

struct PoolState {
    free: VecDeque<Buffer>,
    produced: VecDeque<Buffer>,
    total: usize,
    stats: PoolStats,
}

/// A pool of output buffers.
///
/// Produced frames either collect in the pool (see
/// [`take_produced`](Self::take_produced)) or, once [`link`](Self::link)ed,
/// flow straight into a downstream [`FrameQueue`] whose consumed buffers come
/// back here as free.
pub struct FramePool {
    name: String,
    state: IrqLock<PoolState>,
    downstream: OnceLock<Arc<FrameQueue>>,
    hook: IrqLock<Option<ReadyHook>>,
}

impl FramePool {
    /// Create an empty pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: IrqLock::new(PoolState {
                free: VecDeque::new(),
                produced: VecDeque::new(),
                total: 0,
                stats: PoolStats::default(),
            }),
            downstream: OnceLock::new(),
            hook: IrqLock::new(None),
        }
    }

    /// Create a pool of `count` buffers of `size` bytes laid out from `base`.
    ///
    /// Buffer ids start at `first_id`.
    pub fn with_buffers(
        name: impl Into<String>,
        first_id: u64,
        base: u64,
        size: u64,
        count: usize,
    ) -> Self {
        let pool = Self::new(name);
        for i in 0..count as u64 {
            pool.add(Buffer::new(
                BufferId(first_id + i),
                MemBuf::new(base + i * size, size),
            ));
        }
        pool
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a new buffer to the free list.
    ///
    /// Worker context only: grows the bookkeeping deques.
    pub fn add(&self, buffer: Buffer) {
        self.state.with(|s| {
            s.total += 1;
            s.free.reserve(s.total.saturating_sub(s.free.len()));
            s.produced.reserve(s.total.saturating_sub(s.produced.len()));
            s.free.push_back(buffer);
        });
        if let Some(queue) = self.downstream.get() {
            queue.reserve(self.total());
        }
        self.fire_hook();
    }

    /// Forward produced buffers to `queue` and take its consumed buffers back.
    ///
    /// Returns `false` if the pool was already linked.
    pub fn link(self: &Arc<Self>, queue: &Arc<FrameQueue>) -> bool {
        if self.downstream.set(Arc::clone(queue)).is_err() {
            return false;
        }
        queue.reserve(self.total());
        queue.set_owner(Arc::downgrade(self));
        true
    }

    /// Return a consumed buffer to the free list.
    pub fn recycle(&self, mut buffer: Buffer) {
        buffer.set_defective(false);
        self.state.with(|s| s.free.push_back(buffer));
        self.fire_hook();
    }

    /// Take the oldest produced buffer (unlinked pools only).
    pub fn take_produced(&self) -> Option<Buffer> {
        self.state.with(|s| s.produced.pop_front())
    }

    /// Number of free buffers.
    pub fn free_count(&self) -> usize {
        self.state.with(|s| s.free.len())
    }

    /// Number of produced buffers held in the pool.
    pub fn produced_count(&self) -> usize {
        self.state.with(|s| s.produced.len())
    }

    /// Number of buffers ever added.
    pub fn total(&self) -> usize {
        self.state.with(|s| s.total)
    }

    /// Completion counters.
    pub fn stats(&self) -> PoolStats {
        self.state.with(|s| s.stats)
    }

    fn fire_hook(&self) {
        if let Some(hook) = self.hook.with(|h| h.clone()) {
            hook();
        }
    }
}

impl SinkPort for FramePool {
    fn try_acquire(&self) -> Option<Buffer> {
        self.state.with(|s| s.free.pop_front())
    }

    fn cancel(&self, buffer: Buffer) {
        self.state.with(|s| {
            s.stats.cancelled += 1;
            s.free.push_front(buffer);
        });
    }

    fn complete(&self, buffer: Buffer, completion: Completion) {
        match completion {
            Completion::Dropped => {
                tracing::trace!(pool = %self.name, id = %buffer.id(), "frame dropped");
                self.state.with(|s| s.stats.dropped += 1);
                self.recycle(buffer);
            }
            Completion::Consumed => {
                tracing::warn!(
                    pool = %self.name,
                    id = %buffer.id(),
                    "consumed completion on an output buffer"
                );
                self.state.with(|s| s.stats.dropped += 1);
                self.recycle(buffer);
            }
            Completion::Produced => {
                self.state.with(|s| s.stats.produced += 1);
                match self.downstream.get() {
                    Some(queue) => queue.enqueue_filled(buffer),
                    None => self.state.with(|s| s.produced.push_back(buffer)),
                }
            }
        }
    }

    fn watch(&self, hook: ReadyHook) {
        self.hook.with(|h| *h = Some(hook));
    }
}

impl FastPath for FramePool {}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("name", &self.name)
            .field("free", &self.free_count())
            .field("produced", &self.produced_count())
            .finish()
    }
}

struct QueueState {
    filled: VecDeque<Buffer>,
    consumed: VecDeque<Buffer>,
    consumed_count: u64,
}

/// A FIFO of filled input buffers.
pub struct FrameQueue {
    name: String,
    state: IrqLock<QueueState>,
    owner: OnceLock<Weak<FramePool>>,
    hook: IrqLock<Option<ReadyHook>>,
}

impl FrameQueue {
    /// Create a queue able to hold `capacity` buffers without reallocating.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: IrqLock::new(QueueState {
                filled: VecDeque::with_capacity(capacity),
                consumed: VecDeque::with_capacity(capacity),
                consumed_count: 0,
            }),
            owner: OnceLock::new(),
            hook: IrqLock::new(None),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a filled buffer and fire the ready hook.
    pub fn enqueue_filled(&self, buffer: Buffer) {
        self.state.with(|s| s.filled.push_back(buffer));
        if let Some(hook) = self.hook.with(|h| h.clone()) {
            hook();
        }
    }

    /// Take the oldest consumed buffer (queues without an owning pool).
    pub fn take_consumed(&self) -> Option<Buffer> {
        self.state.with(|s| s.consumed.pop_front())
    }

    /// Number of buffers completed as consumed so far.
    pub fn consumed_total(&self) -> u64 {
        self.state.with(|s| s.consumed_count)
    }

    fn reserve(&self, capacity: usize) {
        self.state.with(|s| {
            s.filled.reserve(capacity.saturating_sub(s.filled.len()));
            s.consumed.reserve(capacity.saturating_sub(s.consumed.len()));
        });
    }

    fn set_owner(&self, owner: Weak<FramePool>) {
        let _ = self.owner.set(owner);
    }
}

impl SourcePort for FrameQueue {
    fn try_dequeue(&self) -> Option<Buffer> {
        self.state.with(|s| s.filled.pop_front())
    }

    fn requeue(&self, buffer: Buffer) {
        self.state.with(|s| s.filled.push_front(buffer));
    }

    fn complete(&self, buffer: Buffer) {
        self.state.with(|s| s.consumed_count += 1);
        match self.owner.get().and_then(Weak::upgrade) {
            Some(pool) => pool.recycle(buffer),
            None => self.state.with(|s| s.consumed.push_back(buffer)),
        }
    }

    fn pending(&self) -> usize {
        self.state.with(|s| s.filled.len())
    }

    fn watch(&self, hook: ReadyHook) {
        self.hook.with(|h| *h = Some(hook));
    }
}

impl FastPath for FrameQueue {}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
