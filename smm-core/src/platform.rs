//! # Platform façade (§6, §9 design notes)
//!
//! Everything the rendezvous core consumes from its environment — SMI
//! validity, BSP election, MTRRs, the sync timer, IPI delivery, and the
//! LMCE MSR reads — sits behind this trait so tests can inject a fake
//! implementation instead of real hardware.
//!
//! `smm-hal` supplies the x86_64 mechanism (MSR reads, IPI delivery, TSC
//! timer); this trait is the policy seam between that mechanism and the
//! core's protocol logic.

/// Which per-CPU SMM register the core is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmRegister {
    /// Platform reports this CPU as Delayed (temporarily unavailable).
    Delayed,
    /// Platform reports this CPU as Blocked (unavailable this SMI).
    Blocked,
    /// Platform reports this CPU as Disabled (removed from service).
    Disabled,
    /// Platform reports SMM is enabled for this CPU.
    SmmEnable,
}

/// Opaque snapshot of a CPU's MTRR state, round-tripped by [`Platform`]
/// without the core inspecting its contents.
pub trait MtrrState: Clone {}

impl<T: Clone> MtrrState for T {}

/// Everything the core needs from its environment.
///
/// `Instant` is the sync timer's opaque handle: `start_sync_timer`
/// captures a budget-relative deadline, `is_sync_timer_timeout` polls it.
/// The core never reads wall-clock time directly (§9 design notes).
pub trait Platform {
    /// Handle returned by [`Platform::start_sync_timer`].
    type Instant: Copy;
    /// MTRR snapshot type round-tripped by [`Platform::mtrr_get_all`] /
    /// [`Platform::mtrr_set_all`].
    type Mtrrs: Clone;

    /// Probe whether the current SMI is one this platform recognizes as
    /// legitimate (vs. spurious).
    fn platform_valid_smi(&self) -> bool;

    /// Ask the platform to elect a BSP. `Some(true)` means the platform
    /// picked the calling CPU; `Some(false)` means it picked someone
    /// else; `None` means the platform cannot decide and the core should
    /// fall back to a CAS race.
    fn platform_smm_bsp_election(&self) -> Option<bool>;

    /// Clear the platform's top-level SMI status. Must succeed; a
    /// `false` return is treated as fatal by the caller.
    fn clear_top_level_smi_status(&self) -> bool;

    /// Read a per-CPU SMM register bit.
    fn smm_cpu_feature(&self, cpu: usize, register: SmmRegister) -> bool;

    /// Whether this platform needs its MTRRs reprogrammed for SMM entry.
    fn need_configure_mtrrs(&self) -> bool;

    /// APIC id for a CPU index, if known and valid.
    fn apic_id(&self, cpu: usize) -> Option<u32>;

    /// Deliver a directed SMI-IPI to the given APIC id.
    fn send_smi_ipi(&self, apic_id: u32);

    /// Start the sync timer's budget for the current arrival round.
    fn start_sync_timer(&self) -> Self::Instant;

    /// True once the budget captured by `start_sync_timer` has elapsed.
    fn is_sync_timer_timeout(&self, start: Self::Instant) -> bool;

    /// Snapshot this CPU's current MTRRs.
    fn mtrr_get_all(&self) -> Self::Mtrrs;

    /// Install an MTRR snapshot on this CPU.
    fn mtrr_set_all(&self, mtrrs: &Self::Mtrrs);

    /// Install this platform's SMI-time MTRR layout, once the OS snapshot
    /// has been captured via [`Platform::mtrr_get_all`]. Distinct from
    /// `mtrr_set_all` because the SMI layout is platform-internal state,
    /// not a snapshot the core round-trips.
    fn install_smi_mtrrs(&self) {}

    /// Disable SMRR protection ahead of an MTRR swap, if the platform
    /// uses one.
    fn disable_smrr(&self) {}

    /// Re-enable SMRR protection after an MTRR swap.
    fn reenable_smrr(&self) {}

    /// Whether this CPU implements Machine Check Architecture (gates the
    /// LMCE early-exit check).
    fn mca_supported(&self) -> bool {
        false
    }

    /// Whether a local machine-check exception is currently pending on
    /// this CPU. Only meaningful when [`Platform::mca_supported`] is true.
    fn lmce_pending(&self) -> bool {
        false
    }

    /// Debug-agent hook invoked as the BSP enters its handler.
    fn debug_entry(&self) {}

    /// Debug-agent hook invoked as the BSP leaves its handler.
    fn debug_exit(&self) {}

    /// Rendezvous-entry hook (per-CPU, every SMI, before election).
    fn rendezvous_entry(&self) {}

    /// Rendezvous-exit hook (per-CPU, every SMI, after the run).
    fn rendezvous_exit(&self) {}

    /// Ran by the BSP just before invoking the dispatcher (C5 step 6).
    /// Out-of-scope collaborators (performance logging, debug agent
    /// pre-work) hang off this in a real platform; the core itself has
    /// no opinion on what runs here.
    fn pre_dispatch_tasks(&self) {}

    /// Ran by the BSP right after the busy-drain barrier, before the
    /// Relaxed-mode late-arrival scan (C5 step 9).
    fn remaining_tasks(&self) {}

    /// Hot-plug bookkeeping, run once by the BSP near exit when
    /// [`crate::config::Config::hot_plug_support`] is set.
    fn hot_plug_update(&self) {}
}
