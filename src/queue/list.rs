//! Fixed-capacity intrusive index lists.

/// Sentinel for "no next node".
const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Ends {
    head: u32,
    tail: u32,
    len: usize,
}

impl Ends {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

/// Two singly linked lists threaded through one preallocated index array.
///
/// Every index `0..capacity` is in exactly one of the two lists at all
/// times: the *idle* free list or the *active* list. Nodes only move
/// between them, so the invariant holds by construction.
///
/// All operations are O(1) and never allocate, including
/// [`reset`](Self::reset), which splices the whole active list onto the
/// idle tail.
#[derive(Debug, Clone)]
pub struct IndexList {
    next: Box<[u32]>,
    idle: Ends,
    active: Ends,
}

impl IndexList {
    /// Create a list set with every index idle, in ascending order.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` does not fit below `u32::MAX`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity < NIL as usize, "index list capacity too large");
        let next: Vec<u32> = (0..capacity)
            .map(|i| if i + 1 < capacity { i as u32 + 1 } else { NIL })
            .collect();
        let idle = if capacity == 0 {
            Ends::EMPTY
        } else {
            Ends {
                head: 0,
                tail: capacity as u32 - 1,
                len: capacity,
            }
        };
        Self {
            next: next.into_boxed_slice(),
            idle,
            active: Ends::EMPTY,
        }
    }

    /// Total number of indices.
    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Number of idle indices.
    pub fn idle_len(&self) -> usize {
        self.idle.len
    }

    /// Number of active indices.
    pub fn active_len(&self) -> usize {
        self.active.len
    }

    /// Move the idle head to the active tail and return it.
    ///
    /// Returns `None` when no index is idle.
    pub fn activate(&mut self) -> Option<usize> {
        let idx = Self::pop_front(&mut self.next, &mut self.idle)?;
        Self::push_back(&mut self.next, &mut self.active, idx);
        Some(idx as usize)
    }

    /// Move the active head back to the idle tail and return it.
    ///
    /// Returns `None` when no index is active.
    pub fn retire(&mut self) -> Option<usize> {
        let idx = Self::pop_front(&mut self.next, &mut self.active)?;
        Self::push_back(&mut self.next, &mut self.idle, idx);
        Some(idx as usize)
    }

    /// Detach the active head without putting it back on either list.
    ///
    /// The caller must hand it back with [`release`](Self::release); until
    /// then it is counted in neither list.
    pub fn detach(&mut self) -> Option<usize> {
        Self::pop_front(&mut self.next, &mut self.active).map(|i| i as usize)
    }

    /// Return a detached index to the idle tail.
    pub fn release(&mut self, idx: usize) {
        debug_assert!(idx < self.capacity());
        Self::push_back(&mut self.next, &mut self.idle, idx as u32);
    }

    /// Index at the head of the active list.
    pub fn front(&self) -> Option<usize> {
        (self.active.head != NIL).then_some(self.active.head as usize)
    }

    /// Splice every active index onto the idle tail.
    ///
    /// Returns how many indices moved.
    pub fn reset(&mut self) -> usize {
        let moved = self.active.len;
        if moved == 0 {
            return 0;
        }
        if self.idle.len == 0 {
            self.idle = self.active;
        } else {
            self.next[self.idle.tail as usize] = self.active.head;
            self.idle.tail = self.active.tail;
            self.idle.len += moved;
        }
        self.active = Ends::EMPTY;
        moved
    }

    /// Iterate active indices from head to tail.
    pub fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.active.head;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let idx = cur;
            cur = self.next[idx as usize];
            Some(idx as usize)
        })
    }

    fn pop_front(next: &mut [u32], list: &mut Ends) -> Option<u32> {
        if list.head == NIL {
            return None;
        }
        let idx = list.head;
        list.head = next[idx as usize];
        if list.head == NIL {
            list.tail = NIL;
        }
        next[idx as usize] = NIL;
        list.len -= 1;
        Some(idx)
    }

    fn push_back(next: &mut [u32], list: &mut Ends, idx: u32) {
        next[idx as usize] = NIL;
        if list.tail == NIL {
            list.head = idx;
        } else {
            next[list.tail as usize] = idx;
        }
        list.tail = idx;
        list.len += 1;
    }
}
