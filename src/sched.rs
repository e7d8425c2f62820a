//! Sleep/wake scheduling for user threads
//!
//! User (application) threads never busy-wait inside the stack: whenever a
//! socket-like call has to wait for the event thread to produce something,
//! it parks on a [`SchedCtx`] while holding the mutex that guards the
//! state it is waiting on. The event thread wakes it through the same
//! context. Every wait is cancellable via [`SchedCtx::interrupt`], which
//! is how shutdown unblocks sockets.

use crate::error::{Error, Result};
use parking_lot::{Condvar, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Scheduling context for one blocking endpoint.
///
/// The interrupted flag is sticky: once set, every thread currently
/// sleeping on the context and every thread that subsequently tries to
/// sleep gets [`Error::Interrupted`], until the last waiter has drained,
/// at which point the flag clears itself.
///
/// Callers of [`wakeup`](Self::wakeup) and [`interrupt`](Self::interrupt)
/// must hold the mutex the sleepers pass to [`sleep`](Self::sleep);
/// otherwise a thread between its entry check and the park can miss the
/// broadcast.
#[derive(Debug, Default)]
pub struct SchedCtx {
    cond: Condvar,
    waiters: AtomicUsize,
    interrupted: AtomicBool,
}

impl SchedCtx {
    pub fn new() -> Self {
        SchedCtx::default()
    }

    /// Atomically release `guard`, park the calling thread, and re-acquire
    /// the mutex before returning.
    ///
    /// Returns `Ok(())` on a normal [`wakeup`](Self::wakeup),
    /// `Err(Error::Timeout)` when `deadline` passes first, and
    /// `Err(Error::Interrupted)` if the context was interrupted. Callers
    /// must re-check their predicate in a loop; wakeups can be spurious.
    pub fn sleep<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(Error::Interrupted);
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let timed_out = match deadline {
            Some(when) => self.cond.wait_until(guard, when).timed_out(),
            None => {
                self.cond.wait(guard);
                false
            }
        };
        let remaining = self.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if self.interrupted.load(Ordering::Acquire) {
            // The last waiter out clears the flag.
            if remaining == 0 {
                self.interrupted.store(false, Ordering::Release);
            }
            return Err(Error::Interrupted);
        }
        if timed_out {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Wake every thread sleeping on this context.
    pub fn wakeup(&self) {
        self.cond.notify_all();
    }

    /// True while any thread is parked on this context.
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    /// Mark the context interrupted and wake every sleeper.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}
