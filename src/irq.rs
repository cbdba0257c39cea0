//! Execution-context tiers.
//!
//! Stage drivers run in two contexts: a per-device interrupt context that must
//! never block or allocate, and ordinary worker contexts that may do both.
//! This module makes the split explicit:
//!
//! - [`enter`] marks the current thread as servicing a device interrupt for
//!   the lifetime of the returned guard.
//! - [`in_interrupt`] lets slow-path operations refuse to run there.
//! - [`IrqLock`] is the short-held lock shared by both tiers. Access goes
//!   through a closure so no guard can be held across a blocking call.
//!
//! Types whose operations are all safe on the fast path implement
//! [`FastPath`]; types with blocking operations implement [`SlowPath`].

use crate::error::{Error, Result};
use std::cell::Cell;
use std::sync::{Mutex, PoisonError};

thread_local! {
    static IRQ_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IRQ_DEVICE: Cell<u32> = const { Cell::new(0) };
}

/// Marker for types whose operations never block or allocate.
///
/// Implemented by the job queue, frame context mutation, the admission
/// scheduler lists and non-synchronous bus posts.
pub trait FastPath {}

/// Marker for types with operations that may block (synchronous bus posts,
/// registration, teardown). Such operations check [`in_interrupt`].
pub trait SlowPath {}

/// Guard returned by [`enter`].
///
/// While alive, [`in_interrupt`] returns `true` on this thread.
#[must_use = "interrupt context ends when the guard is dropped"]
pub struct IrqGuard {
    prev_device: u32,
}

/// Enter interrupt context for `device`.
///
/// Nesting is allowed; the outermost guard restores worker context.
pub fn enter(device: u32) -> IrqGuard {
    let prev_device = IRQ_DEVICE.with(|d| d.replace(device));
    IRQ_DEPTH.with(|d| d.set(d.get() + 1));
    IrqGuard { prev_device }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        IRQ_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        IRQ_DEVICE.with(|d| d.set(self.prev_device));
    }
}

/// Is the current thread servicing an interrupt?
#[inline]
pub fn in_interrupt() -> bool {
    IRQ_DEPTH.with(|d| d.get() > 0)
}

/// The device whose interrupt is being serviced, if any.
pub fn current_device() -> Option<u32> {
    if in_interrupt() {
        Some(IRQ_DEVICE.with(|d| d.get()))
    } else {
        None
    }
}

/// Fail with [`Error::InInterrupt`] when called from interrupt context.
#[inline]
pub fn ensure_worker(op: &'static str) -> Result<()> {
    if in_interrupt() {
        tracing::debug!(op, device = ?current_device(), "slow-path call refused");
        return Err(Error::InInterrupt(op));
    }
    Ok(())
}

/// Short-held lock shared between interrupt and worker contexts.
///
/// The critical section is a closure; it must not block, allocate or call
/// back into the bus.
#[derive(Debug, Default)]
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqLock<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access.
    ///
    /// A panic inside an earlier critical section does not poison the lock;
    /// list state is always left consistent between statements.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Consume the lock and return the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
