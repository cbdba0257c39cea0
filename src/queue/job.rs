//! Capacity-bounded job queue.

use super::IndexList;
use crate::error::{Error, Result};
use crate::irq::{FastPath, IrqLock};

/// A fixed pool of job slots split into an idle free list and a ready list.
///
/// Hands units of work from an event producer (an interrupt, an external
/// trigger) to the stage's frame-advance routine. Every slot is
/// preallocated; `push` reports [`Error::QueueFull`] instead of growing, which
/// is ordinary back-pressure rather than a fault.
///
/// `push`, `pop` and `reset` each take the queue's lock once, run in O(1)
/// and never block or allocate, so all three are usable from interrupt
/// context.
///
/// # Example
///
/// ```rust
/// use campipe::queue::JobQueue;
/// use campipe::Error;
///
/// let queue = JobQueue::new(2).unwrap();
/// queue.push('a').unwrap();
/// queue.push('b').unwrap();
/// assert_eq!(queue.push('c'), Err(Error::QueueFull));
/// assert_eq!(queue.pop(), Ok('a'));
/// ```
pub struct JobQueue<T> {
    inner: IrqLock<JobState<T>>,
}

struct JobState<T> {
    list: IndexList,
    slots: Box<[Option<T>]>,
}

impl<T: Copy> JobQueue<T> {
    /// Preallocate `capacity` idle slots.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailed`] if `capacity` is zero or the slots cannot
    /// be reserved.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::AllocationFailed(
                "job queue capacity must be > 0".into(),
            ));
        }
        if capacity >= u32::MAX as usize {
            return Err(Error::AllocationFailed(format!(
                "job queue capacity {} too large",
                capacity
            )));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        slots.resize_with(capacity, || None);

        Ok(Self {
            inner: IrqLock::new(JobState {
                list: IndexList::new(capacity),
                slots: slots.into_boxed_slice(),
            }),
        })
    }

    /// Copy `item` into the next idle slot and make it ready.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] if every slot is already ready.
    pub fn push(&self, item: T) -> Result<()> {
        self.inner.with(|state| {
            let idx = state.list.activate().ok_or(Error::QueueFull)?;
            state.slots[idx] = Some(item);
            Ok(())
        })
    }

    /// Take the oldest ready item and return its slot to the idle list.
    ///
    /// # Errors
    ///
    /// [`Error::QueueEmpty`] if nothing is ready.
    pub fn pop(&self) -> Result<T> {
        self.inner.with(|state| {
            let idx = state.list.retire().ok_or(Error::QueueEmpty)?;
            state.slots[idx].take().ok_or(Error::QueueEmpty)
        })
    }

    /// Discard every ready item.
    ///
    /// Used when a stage stops; buffers referenced by the discarded jobs are
    /// not touched. The ready list is spliced onto the idle list whole; stale
    /// payloads stay in their slots until the next `push` overwrites them.
    /// Returns how many items were dropped.
    pub fn reset(&self) -> usize {
        self.inner.with(|state| state.list.reset())
    }

    /// Number of ready items.
    pub fn len(&self) -> usize {
        self.inner.with(|state| state.list.active_len())
    }

    /// Whether no item is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle slots.
    pub fn idle(&self) -> usize {
        self.inner.with(|state| state.list.idle_len())
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.with(|state| state.list.capacity())
    }
}

impl<T> FastPath for JobQueue<T> {}

impl<T> std::fmt::Debug for JobQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.with(|state| {
            f.debug_struct("JobQueue")
                .field("capacity", &state.list.capacity())
                .field("ready", &state.list.active_len())
                .finish()
        })
    }
}
