//! # TSC-based interval timer
//!
//! The rendezvous core's arrival protocol (§4.4, §5 "Cancellation &
//! timeouts") needs exactly one timer capability: "start a budget, tell me
//! when it has elapsed". This wraps the Time Stamp Counter to provide
//! that, calibrated once against a caller-supplied frequency (the HAL does
//! not own frequency calibration — platforms already have one).

use core::sync::atomic::{AtomicU64, Ordering};

/// Read the raw TSC.
#[inline]
pub fn read_tsc() -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

static TSC_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(2_000_000_000);

/// Record the calibrated TSC frequency, used to convert microsecond
/// budgets into tick counts.
pub fn set_tsc_frequency(freq_hz: u64) {
    TSC_FREQUENCY_HZ.store(freq_hz, Ordering::Relaxed);
}

fn us_to_ticks(us: u64) -> u64 {
    let freq = TSC_FREQUENCY_HZ.load(Ordering::Relaxed);
    (us * freq) / 1_000_000
}

/// A single-shot interval timer started from "now" for a fixed microsecond
/// budget. `expired` is a plain, repeatable poll — it does not consume the
/// timer — matching the `{start() -> t, expired(t) -> bool}` capability
/// the spec's design notes describe for the sync timer.
#[derive(Debug, Clone, Copy)]
pub struct TscTimer {
    start: u64,
    budget_ticks: u64,
}

impl TscTimer {
    /// Start a timer with a budget expressed in microseconds.
    pub fn start(budget_us: u64) -> Self {
        Self {
            start: read_tsc(),
            budget_ticks: us_to_ticks(budget_us),
        }
    }

    /// True once the budget has elapsed.
    pub fn expired(&self) -> bool {
        read_tsc().wrapping_sub(self.start) >= self.budget_ticks
    }
}
