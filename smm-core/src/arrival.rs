//! # Arrival protocol (C4)
//!
//! Invoked by the BSP when the sync mode is Traditional or MTRRs must be
//! reprogrammed. Waits until every CPU is in SMM except those the
//! platform reports as Blocked or Disabled, with a two-round
//! timeout-then-IPI escalation.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::context::RendezvousContext;
use crate::platform::{Platform, SmmRegister};

/// Lazily-initialized package → first-thread-index map (§9 design
/// notes). Blocked/Disabled counts are only attributed once per package,
/// to the first CPU index observed for that package.
pub struct PackageFirstThreadMap<const MAX_PACKAGES: usize> {
    first_index: [AtomicI32; MAX_PACKAGES],
}

impl<const MAX_PACKAGES: usize> PackageFirstThreadMap<MAX_PACKAGES> {
    /// An empty map; every package unassigned.
    pub const fn new() -> Self {
        Self {
            first_index: [const { AtomicI32::new(-1) }; MAX_PACKAGES],
        }
    }

    /// Return `package_id`'s first-seen CPU index, recording `cpu_index`
    /// as that index if none has been seen yet.
    pub fn ensure(&self, package_id: usize, cpu_index: usize) -> usize {
        loop {
            let current = self.first_index[package_id].load(Ordering::SeqCst);
            if current != -1 {
                return current as usize;
            }
            if self.first_index[package_id]
                .compare_exchange(-1, cpu_index as i32, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return cpu_index;
            }
        }
    }

    /// Whether `cpu_index` is the first-seen thread of `package_id`.
    pub fn is_first(&self, package_id: usize, cpu_index: usize) -> bool {
        self.ensure(package_id, cpu_index) == cpu_index
    }
}

/// Summed Blocked/Disabled CPU counts, attributed once per package.
fn count_blocked_and_disabled<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    packages: &PackageFirstThreadMap<N>,
    package_of: impl Fn(usize) -> usize,
) -> (usize, usize) {
    let mut blocked = 0;
    let mut disabled = 0;
    for cpu in 0..ctx.num_cpus {
        let package_id = package_of(cpu);
        if !packages.is_first(package_id, cpu) {
            continue;
        }
        if ctx.platform.smm_cpu_feature(cpu, SmmRegister::Blocked) {
            blocked += 1;
        }
        if ctx.platform.smm_cpu_feature(cpu, SmmRegister::Disabled) {
            disabled += 1;
        }
    }
    (blocked, disabled)
}

/// `AllCpusInSmmExceptBlockedDisabled` (§4.4).
pub fn all_cpus_in_smm_except_blocked_disabled<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    packages: &PackageFirstThreadMap<N>,
    package_of: impl Fn(usize) -> usize,
) -> bool {
    let counter = ctx.global.counter.load(Ordering::SeqCst) as usize;
    if counter == ctx.num_cpus {
        return true;
    }
    let (blocked, disabled) = count_blocked_and_disabled(ctx, packages, package_of);
    counter + blocked + disabled >= ctx.num_cpus
}

/// Outcome of running the two-round arrival protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Every expected CPU (minus Blocked/Disabled) checked in.
    AllArrived,
    /// A pending local machine-check exception cut the wait short.
    LmceExit,
    /// Round 2 still did not see every expected CPU; proceeding anyway.
    TimedOut,
}

/// Run the arrival protocol: poll the predicate, escalate to a directed
/// SMI-IPI round on timeout, poll once more, then give up regardless.
pub fn run<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    packages: &PackageFirstThreadMap<N>,
    package_of: impl Fn(usize) -> usize,
) -> ArrivalOutcome {
    let predicate = || all_cpus_in_smm_except_blocked_disabled(ctx, packages, &package_of);

    let mca_checkable = ctx.platform.mca_supported();

    let mut timer = ctx.platform.start_sync_timer();
    loop {
        if predicate() {
            ctx.all_ap_arrived_with_exception
                .store(true, Ordering::SeqCst);
            return ArrivalOutcome::AllArrived;
        }
        if mca_checkable && ctx.platform.lmce_pending() {
            return ArrivalOutcome::LmceExit;
        }
        if ctx.platform.is_sync_timer_timeout(timer) {
            break;
        }
        core::hint::spin_loop();
    }

    for cpu in 0..ctx.num_cpus {
        if ctx.cpus[cpu].slots.present.load(Ordering::SeqCst) {
            continue;
        }
        if let Some(apic_id) = ctx.platform.apic_id(cpu) {
            ctx.platform.send_smi_ipi(apic_id);
        }
    }

    timer = ctx.platform.start_sync_timer();
    loop {
        if predicate() {
            ctx.all_ap_arrived_with_exception
                .store(true, Ordering::SeqCst);
            return ArrivalOutcome::AllArrived;
        }
        if mca_checkable && ctx.platform.lmce_pending() {
            return ArrivalOutcome::LmceExit;
        }
        if ctx.platform.is_sync_timer_timeout(timer) {
            return ArrivalOutcome::TimedOut;
        }
        core::hint::spin_loop();
    }
}
