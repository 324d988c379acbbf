//! # Atomic primitives (C1)
//!
//! Three compare-and-swap-retry operations over a shared 32-bit counter,
//! all sequentially consistent. These are the building block every
//! semaphore (`run`, `counter`) in the rest of the crate is built from.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A spin lock whose critical section is not lexically scoped: one CPU
/// can acquire it and a different CPU can release it later (the `busy`
/// and token locks in this crate are both held across a dispatch that
/// runs on a different processor than the one that later releases it).
/// `smm_hal`'s `SpinLock` is RAII-guard-based and cannot express that, so
/// the core's own locks are built on this instead.
pub struct RawSpinLock(AtomicBool);

impl RawSpinLock {
    /// A new, unheld lock.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Spin until the lock is free, then take it.
    pub fn acquire(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            while self.0.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Take the lock only if it is currently free.
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditionally mark the lock free.
    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Busy-wait until the lock is free, without taking it. Used by the
    /// BSP to drain another CPU's `busy` lock, which that CPU releases on
    /// its own schedule.
    pub fn wait_until_free(&self) {
        while self.is_locked() {
            core::hint::spin_loop();
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel value meaning "locked down" — enrollment closed, no further
/// releases may succeed.
pub const LOCKED: u32 = 0xFFFF_FFFF;

/// Busy-wait until `s != 0`, then attempt to store `s - 1`.
///
/// Returns the post-decrement value. Retries (with a pause hint) on CAS
/// contention or while the counter is currently zero.
pub fn wait_for_semaphore(s: &AtomicU32) -> u32 {
    loop {
        let current = s.load(Ordering::SeqCst);
        if current == 0 {
            core::hint::spin_loop();
            continue;
        }
        let next = current - 1;
        if s.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return next;
        }
        core::hint::spin_loop();
    }
}

/// Attempt to store `s + 1`, retrying on contention.
///
/// If `s` is already [`LOCKED`], incrementing would wrap to zero; the
/// release is refused and `0` is returned without touching `s`. Callers
/// use that `0` to detect "enrollment already closed" (§4.7 step 6).
pub fn release_semaphore(s: &AtomicU32) -> u32 {
    loop {
        let current = s.load(Ordering::SeqCst);
        if current == LOCKED {
            return 0;
        }
        let next = current + 1;
        if s.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return next;
        }
        core::hint::spin_loop();
    }
}

/// Unconditionally CAS `s` to [`LOCKED`]. Returns the value observed
/// immediately before the lockdown took effect.
pub fn lockdown_semaphore(s: &AtomicU32) -> u32 {
    loop {
        let current = s.load(Ordering::SeqCst);
        if s.compare_exchange(current, LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return current;
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_then_release_round_trips() {
        let s = AtomicU32::new(1);
        assert_eq!(wait_for_semaphore(&s), 0);
        assert_eq!(release_semaphore(&s), 1);
    }

    #[test]
    fn lockdown_reports_prior_value_and_sticks() {
        let s = AtomicU32::new(3);
        assert_eq!(lockdown_semaphore(&s), 3);
        assert_eq!(s.load(Ordering::SeqCst), LOCKED);
    }

    #[test]
    fn release_on_locked_counter_refuses_and_returns_zero() {
        let s = AtomicU32::new(LOCKED);
        assert_eq!(release_semaphore(&s), 0);
        assert_eq!(s.load(Ordering::SeqCst), LOCKED);
    }

    #[test]
    fn release_saturates_just_below_locked() {
        let s = AtomicU32::new(LOCKED - 1);
        assert_eq!(release_semaphore(&s), LOCKED);
    }
}
