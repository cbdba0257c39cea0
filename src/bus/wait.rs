//! Wait slots for synchronous posts.

use crate::error::{Error, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Reply to a synchronous post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReply {
    /// Result code returned by the peer's handler.
    pub result: i32,
    /// Reply bytes copied into the caller's buffer.
    pub len: usize,
}

impl SyncReply {
    /// Whether the peer reported success.
    pub fn is_ok(&self) -> bool {
        self.result >= 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Reserved,
    Pending { sequence: u16 },
    Done { sequence: u16, result: i32, len: usize },
    Aborted,
}

struct Slots {
    states: Box<[SlotState]>,
    replies: Box<[Box<[u8]>]>,
}

/// A small fixed set of wait slots, one per concurrent synchronous post.
///
/// Lifecycle of a slot: `Free -> Reserved -> Pending -> Done -> Free`.
/// A reply is accepted only while the slot is pending on the same
/// sequence number, so a late reply to a timed-out call cannot complete a
/// newer call that reused the slot.
pub(crate) struct WaitTable {
    logical_id: u32,
    slots: Mutex<Slots>,
    cond: Condvar,
}

impl WaitTable {
    pub(crate) fn new(logical_id: u32, count: usize, reply_capacity: usize) -> Self {
        Self {
            logical_id,
            slots: Mutex::new(Slots {
                states: vec![SlotState::Free; count].into_boxed_slice(),
                replies: (0..count)
                    .map(|_| vec![0u8; reply_capacity].into_boxed_slice())
                    .collect(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a free slot.
    pub(crate) fn reserve(&self) -> Result<u16> {
        let mut slots = self.lock();
        let idx = slots
            .states
            .iter()
            .position(|s| *s == SlotState::Free)
            .ok_or(Error::NoWaitSlot)?;
        slots.states[idx] = SlotState::Reserved;
        Ok(idx as u16)
    }

    /// Bind a reserved slot to the sequence number of the posted message.
    pub(crate) fn arm(&self, slot: u16, sequence: u16) {
        let mut slots = self.lock();
        if let Some(state) = slots.states.get_mut(slot as usize) {
            if *state == SlotState::Reserved {
                *state = SlotState::Pending { sequence };
            }
        }
    }

    /// Give back a slot whose post never went out.
    pub(crate) fn release(&self, slot: u16) {
        let mut slots = self.lock();
        if let Some(state) = slots.states.get_mut(slot as usize) {
            *state = SlotState::Free;
        }
    }

    /// Deliver a reply. Returns `false` if nobody waits for it.
    pub(crate) fn complete(&self, slot: u16, sequence: u16, result: i32, reply: &[u8]) -> bool {
        let mut guard = self.lock();
        let Slots { states, replies } = &mut *guard;
        let Some(state) = states.get_mut(slot as usize) else {
            return false;
        };
        if *state != (SlotState::Pending { sequence }) {
            tracing::debug!(
                endpoint = format_args!("{:#x}", self.logical_id),
                slot,
                sequence,
                "stale reply ignored"
            );
            return false;
        }
        let storage = &mut replies[slot as usize];
        let len = reply.len().min(storage.len());
        storage[..len].copy_from_slice(&reply[..len]);
        *state = SlotState::Done {
            sequence,
            result,
            len,
        };
        drop(guard);
        self.cond.notify_all();
        true
    }

    /// Block until the reply for (`slot`, `sequence`) arrives or `timeout`
    /// elapses. The slot is free again when this returns.
    pub(crate) fn wait(
        &self,
        slot: u16,
        sequence: u16,
        timeout: Duration,
        out: &mut [u8],
    ) -> Result<SyncReply> {
        let start = Instant::now();
        let deadline = start + timeout;
        let idx = slot as usize;
        let mut guard = self.lock();
        loop {
            let state = guard.states[idx];
            match state {
                SlotState::Done {
                    sequence: done,
                    result,
                    len,
                } if done == sequence => {
                    let n = len.min(out.len());
                    out[..n].copy_from_slice(&guard.replies[idx][..n]);
                    guard.states[idx] = SlotState::Free;
                    return Ok(SyncReply { result, len: n });
                }
                SlotState::Aborted => {
                    guard.states[idx] = SlotState::Free;
                    return Err(Error::Unbound(self.logical_id));
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                guard.states[idx] = SlotState::Free;
                return Err(Error::Timeout {
                    waited_ms: now.duration_since(start).as_millis() as u64,
                });
            }
            guard = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Fail every outstanding wait with [`Error::Unbound`].
    pub(crate) fn abort_all(&self) -> usize {
        let mut slots = self.lock();
        let mut aborted = 0;
        for state in slots.states.iter_mut() {
            if matches!(state, SlotState::Reserved | SlotState::Pending { .. }) {
                *state = SlotState::Aborted;
                aborted += 1;
            }
        }
        drop(slots);
        self.cond.notify_all();
        aborted
    }

    /// Slots not free.
    pub(crate) fn in_use(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|s| **s != SlotState::Free)
            .count()
    }
}

impl std::fmt::Debug for WaitTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitTable")
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reserve_until_exhausted() {
        let table = WaitTable::new(1, 2, 8);
        assert_eq!(table.reserve(), Ok(0));
        assert_eq!(table.reserve(), Ok(1));
        assert_eq!(table.reserve(), Err(Error::NoWaitSlot));
        table.release(0);
        assert_eq!(table.reserve(), Ok(0));
    }

    #[test]
    fn test_reply_wakes_waiter() {
        let table = Arc::new(WaitTable::new(1, 1, 8));
        let slot = table.reserve().unwrap();
        table.arm(slot, 42);

        let replier = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                assert!(table.complete(slot, 42, 7, b"pong"));
            })
        };
        let mut out = [0u8; 8];
        let reply = table
            .wait(slot, 42, Duration::from_secs(5), &mut out)
            .unwrap();
        replier.join().unwrap();

        assert_eq!(reply, SyncReply { result: 7, len: 4 });
        assert_eq!(&out[..4], b"pong");
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_timeout_frees_slot_and_ignores_late_reply() {
        let table = WaitTable::new(1, 1, 8);
        let slot = table.reserve().unwrap();
        table.arm(slot, 1);
        let err = table
            .wait(slot, 1, Duration::from_millis(30), &mut [])
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { waited_ms } if waited_ms >= 30));

        // Slot is immediately reusable; the old reply cannot complete it.
        let again = table.reserve().unwrap();
        assert_eq!(again, slot);
        table.arm(again, 2);
        assert!(!table.complete(slot, 1, 0, &[]));
        assert!(table.complete(slot, 2, 0, &[]));
        assert!(table.wait(slot, 2, Duration::from_millis(10), &mut []).is_ok());
    }

    #[test]
    fn test_reply_before_wait_is_kept() {
        let table = WaitTable::new(1, 1, 4);
        let slot = table.reserve().unwrap();
        table.arm(slot, 9);
        assert!(table.complete(slot, 9, -5, b"abcdef"));
        let mut out = [0u8; 2];
        // Reply truncated to slot storage (4), then to the caller buffer (2).
        let reply = table.wait(slot, 9, Duration::ZERO, &mut out).unwrap();
        assert_eq!(reply, SyncReply { result: -5, len: 2 });
        assert!(!reply.is_ok());
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let table = Arc::new(WaitTable::new(3, 1, 0));
        let slot = table.reserve().unwrap();
        table.arm(slot, 0);
        let aborter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.abort_all()
            })
        };
        let err = table
            .wait(slot, 0, Duration::from_secs(5), &mut [])
            .unwrap_err();
        assert_eq!(aborter.join().unwrap(), 1);
        assert_eq!(err, Error::Unbound(3));
        assert_eq!(table.in_use(), 0);
    }
}
