//! # Rendezvous context (§3, §9 "shared mutable global state")
//!
//! The source keeps its rendezvous state in a handful of `mSmm*`
//! singletons. This crate instead threads a single [`RendezvousContext`]
//! explicitly through the public API, so a test harness can instantiate
//! several independent contexts to simulate more than one SMI-capable
//! system at once.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use smm_hal::x86_64::smp::SpinLock;

use crate::config::Config;
use crate::error::DispatchStatus;
use crate::platform::Platform;
use crate::semaphore_pool::{CpuSlots, GlobalSlots};
use crate::token::{TokenAllocator, TokenHandle};

/// `bsp_index`'s sentinel: no BSP elected yet this SMI.
pub const BSP_UNSET: i32 = -1;

/// Per-AP work procedure: receives the opaque `parameter` and returns a
/// status code written back to `status_out` when requested.
pub type ApProcedure = fn(parameter: usize) -> u32;

/// The pre-hook run once before the dispatcher on every SMI.
pub type StartupProcedure = fn(args: usize);

/// The dispatcher callback (`SmmCoreEntry`), invoked once per SMI by the
/// BSP between the arrival/MTRR barriers and the busy-drain barrier.
pub type SmiEntry = fn(cpu_index: usize);

/// The work item dispatched to a single CPU (§3 "procedure, parameter,
/// status"). Only touched by the BSP while it holds that CPU's `busy`
/// lock, or by the CPU itself while running inside its own work loop —
/// never both at once, by construction of the `busy` handoff.
#[derive(Clone, Copy)]
pub struct WorkItem {
    /// Procedure to invoke, if a dispatch is outstanding.
    pub procedure: Option<ApProcedure>,
    /// Opaque argument passed to `procedure`.
    pub parameter: usize,
    /// Result of the last dispatch to this CPU.
    pub status: DispatchStatus,
    /// Token gating a non-blocking dispatch, if any.
    pub token: Option<TokenHandle>,
}

impl WorkItem {
    const fn new() -> Self {
        Self {
            procedure: None,
            parameter: 0,
            status: DispatchStatus::Pending,
            token: None,
        }
    }
}

/// One CPU's atomic slots plus its (non-atomic, `busy`-guarded) work item.
pub struct CpuData {
    /// `busy`/`run`/`present` — see [`CpuSlots`].
    pub slots: CpuSlots,
    work: UnsafeCell<WorkItem>,
}

unsafe impl Sync for CpuData {}

impl CpuData {
    const fn new() -> Self {
        Self {
            slots: CpuSlots::new(),
            work: UnsafeCell::new(WorkItem::new()),
        }
    }

    /// Access this CPU's work item.
    ///
    /// # Safety
    /// The caller must either be the BSP currently holding this CPU's
    /// `busy` lock, or be this CPU itself running inside its own work
    /// loop (where `busy` is known to be held on its behalf).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn work_mut(&self) -> &mut WorkItem {
        unsafe { &mut *self.work.get() }
    }
}

/// Registration state set by `RegisterSmmEntry` / `RegisterStartupProcedure`.
#[derive(Clone, Copy, Default)]
pub struct Registrations {
    /// The dispatcher callback, once registered.
    pub smm_entry: Option<SmiEntry>,
    /// The pre-hook procedure and its argument, once registered.
    pub startup_procedure: Option<(StartupProcedure, usize)>,
    /// Whether the context has finished its one-time init.
    pub initialized: bool,
}

/// The full rendezvous state for up to `N` logical processors, running
/// against platform capability `P`.
pub struct RendezvousContext<P: Platform, const N: usize> {
    /// Platform capability façade (§6).
    pub platform: P,
    /// Fixed-at-init configuration.
    pub config: Config,
    /// `counter` / `inside_smm` / `all_cpus_in_sync`.
    pub global: GlobalSlots,
    /// Per-CPU blocks, indexed `0..num_cpus`.
    pub cpus: [CpuData; N],
    /// Logical processor count for this SMI-capable system (`<= N`).
    pub num_cpus: usize,
    /// Elected BSP's CPU index, or [`BSP_UNSET`].
    pub bsp_index: AtomicI32,
    /// Set by the arrival protocol when all non-exempt CPUs checked in.
    pub all_ap_arrived_with_exception: AtomicBool,
    /// Tokens for non-blocking dispatch (C3).
    pub tokens: TokenAllocator<N>,
    /// Registered callbacks.
    pub registrations: SpinLock<Registrations>,
}

impl<P: Platform, const N: usize> RendezvousContext<P, N> {
    /// Build a context for `num_cpus` logical processors (`num_cpus <= N`).
    ///
    /// Fatal (halts) if `num_cpus > N` or the configured token chunk size
    /// is zero — both are init-time assertion failures per §7.
    pub fn new(platform: P, config: Config, num_cpus: usize) -> Self {
        if num_cpus > N {
            crate::error::fatal("num_cpus exceeds context capacity");
        }
        if config.token_count_per_chunk == 0 {
            crate::error::fatal("token_count_per_chunk must be nonzero");
        }

        Self {
            platform,
            config,
            global: GlobalSlots::new(),
            cpus: [const { CpuData::new() }; N],
            num_cpus,
            bsp_index: AtomicI32::new(BSP_UNSET),
            all_ap_arrived_with_exception: AtomicBool::new(false),
            tokens: TokenAllocator::new(config.token_count_per_chunk as usize),
            registrations: SpinLock::new(Registrations::default()),
        }
    }

    /// The current BSP index, if elected this SMI.
    pub fn bsp_index(&self) -> Option<usize> {
        let idx = self.bsp_index.load(Ordering::SeqCst);
        if idx == BSP_UNSET {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// Number of CPUs currently marked `present`.
    pub fn present_count(&self) -> usize {
        self.cpus[..self.num_cpus]
            .iter()
            .filter(|cpu| cpu.slots.present.load(Ordering::SeqCst))
            .count()
    }

    /// Block until `ap_count` APs have each pinged the BSP's own `run`
    /// slot.
    ///
    /// The BSP does not keep a dedicated completion counter: every AP
    /// that needs to tell the BSP "I've reached this barrier" releases
    /// the BSP's `run` semaphore instead of its own, and the BSP drains
    /// it exactly `ap_count` times. See the design notes on why a second,
    /// BSP-private counter would be redundant with this one.
    pub fn wait_for_all_aps(&self, bsp_index: usize, ap_count: u32) {
        for _ in 0..ap_count {
            crate::atomics::wait_for_semaphore(&self.cpus[bsp_index].slots.run);
        }
    }

    /// Wake every present AP waiting on its own `run` slot.
    pub fn release_all_aps(&self, bsp_index: usize) {
        for cpu in 0..self.num_cpus {
            if cpu == bsp_index {
                continue;
            }
            if self.cpus[cpu].slots.present.load(Ordering::SeqCst) {
                crate::atomics::release_semaphore(&self.cpus[cpu].slots.run);
            }
        }
    }

    /// Signal the BSP that this CPU has reached a barrier (releases the
    /// BSP's `run` slot, drained by [`Self::wait_for_all_aps`]).
    pub fn ping_bsp(&self, bsp_index: usize) {
        crate::atomics::release_semaphore(&self.cpus[bsp_index].slots.run);
    }

    /// Block until the BSP releases this CPU's own `run` slot.
    pub fn wait_for_bsp_go(&self, my_index: usize) {
        crate::atomics::wait_for_semaphore(&self.cpus[my_index].slots.run);
    }

    /// Reset all per-SMI mutable state (§3 "Lifecycle"), called by the
    /// BSP just before it releases APs to exit.
    pub fn reset_for_next_smi(&self) {
        self.global.counter.store(0, Ordering::SeqCst);
        self.global.inside_smm.store(false, Ordering::SeqCst);
        self.global.all_cpus_in_sync.store(false, Ordering::SeqCst);
        self.all_ap_arrived_with_exception
            .store(false, Ordering::SeqCst);
        self.tokens.reset();
        if self.config.enable_bsp_election {
            self.bsp_index.store(BSP_UNSET, Ordering::SeqCst);
        }
    }
}
