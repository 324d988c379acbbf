//! # Semaphore pool (C2)
//!
//! The source allocates one contiguous block of cache-line-strided slots
//! for the global flags and each CPU's counters, to keep unrelated CPUs'
//! hot words off the same cache line. This crate has no custom allocator
//! to carve a byte buffer out of, so the same property is expressed with
//! `#[repr(align(64))]` on each slot directly — the compiler lays out
//! padding for us instead of a manually computed stride.

use core::sync::atomic::{AtomicBool, AtomicU32};

use crate::atomics::RawSpinLock;

/// Typical x86_64 cache line size, used only as the alignment below.
pub const CACHE_LINE_SIZE: usize = 64;

/// Pads `T` out to its own cache line so neighboring slots never share
/// one.
#[repr(align(64))]
#[derive(Default)]
pub struct CacheAligned<T>(pub T);

impl<T> core::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

static_assertions::const_assert!(core::mem::align_of::<CacheAligned<AtomicU32>>() == CACHE_LINE_SIZE);

/// The process-wide rendezvous flags (§3 "Global rendezvous state").
pub struct GlobalSlots {
    /// Number of CPUs checked in for the current SMI, or [`crate::atomics::LOCKED`].
    pub counter: CacheAligned<AtomicU32>,
    /// True between BSP entry and BSP exit.
    pub inside_smm: CacheAligned<AtomicBool>,
    /// True while APs must spin at the final exit barrier.
    pub all_cpus_in_sync: CacheAligned<AtomicBool>,
}

impl GlobalSlots {
    /// All flags clear, counter at zero.
    pub const fn new() -> Self {
        Self {
            counter: CacheAligned(AtomicU32::new(0)),
            inside_smm: CacheAligned(AtomicBool::new(false)),
            all_cpus_in_sync: CacheAligned(AtomicBool::new(false)),
        }
    }
}

/// Per-CPU counters and locks (§3 "Per-CPU block"), excluding the
/// non-atomic work-item fields which live alongside these in
/// [`crate::context::CpuData`] and are only touched while `busy` is held.
pub struct CpuSlots {
    /// Held while a scheduled procedure is outstanding on this CPU.
    pub busy: CacheAligned<RawSpinLock>,
    /// Ping-pong signal between the BSP and this CPU.
    pub run: CacheAligned<AtomicU32>,
    /// True between this CPU's own check-in and its cleanup this SMI.
    pub present: CacheAligned<AtomicBool>,
}

impl CpuSlots {
    /// A CPU that has not yet checked in for any SMI.
    pub const fn new() -> Self {
        Self {
            busy: CacheAligned(RawSpinLock::new()),
            run: CacheAligned(AtomicU32::new(0)),
            present: CacheAligned(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_occupy_a_full_cache_line() {
        assert_eq!(core::mem::size_of::<CacheAligned<AtomicU32>>(), CACHE_LINE_SIZE);
    }
}
