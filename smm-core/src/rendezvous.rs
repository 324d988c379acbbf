//! # SMI entry and BSP election (C7, §4.3, §4.7)
//!
//! `smi_rendezvous` is what every logical processor's SMI handler calls
//! first. It decides whether this SMI is worth acting on, checks in,
//! elects a BSP if one hasn't already claimed the run, and dispatches to
//! [`crate::bsp`] or [`crate::ap`] accordingly.

use core::sync::atomic::Ordering;

use crate::ap;
use crate::arrival::PackageFirstThreadMap;
use crate::bsp;
use crate::context::{RendezvousContext, BSP_UNSET};
use crate::platform::Platform;

/// Outcome of a single call to [`smi_rendezvous`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousOutcome {
    /// This CPU ran as BSP for this SMI.
    Bsp,
    /// This CPU ran as AP for this SMI, with the given result.
    Ap(ap::ApOutcome),
    /// The platform reported this SMI as not one to act on.
    NotValid,
    /// Enrollment was already closed by the time this CPU checked in
    /// (§4.7 step 6); it spun on the exit barrier and left.
    MissedWindow,
}

/// Entry point for `cpu_index`'s SMI handler. `packages`/`package_of`
/// are only consulted on the BSP path, forwarded to the arrival
/// protocol.
pub fn smi_rendezvous<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    cpu_index: usize,
    packages: &PackageFirstThreadMap<N>,
    package_of: impl Fn(usize) -> usize,
) -> RendezvousOutcome {
    ctx.platform.rendezvous_entry();

    let bsp_in_progress = ctx.global.inside_smm.load(Ordering::SeqCst);
    if !bsp_in_progress && !ctx.platform.platform_valid_smi() {
        ctx.platform.rendezvous_exit();
        return RendezvousOutcome::NotValid;
    }

    if crate::atomics::release_semaphore(&ctx.global.counter) == 0 {
        while ctx.global.all_cpus_in_sync.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        ctx.platform.rendezvous_exit();
        return RendezvousOutcome::MissedWindow;
    }

    let outcome = if bsp_in_progress {
        let bsp_index = ctx.bsp_index().unwrap_or(cpu_index);
        RendezvousOutcome::Ap(ap::run(ctx, cpu_index, bsp_index))
    } else if elect_bsp(ctx, cpu_index) {
        bsp::run(ctx, cpu_index, packages, package_of);
        RendezvousOutcome::Bsp
    } else {
        let bsp_index = wait_for_elected_bsp(ctx);
        RendezvousOutcome::Ap(ap::run(ctx, cpu_index, bsp_index))
    };

    while ctx.global.all_cpus_in_sync.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }

    ctx.platform.rendezvous_exit();
    outcome
}

/// Decide whether `cpu_index` becomes BSP for this SMI: ask the platform
/// first, fall back to a CAS race on `bsp_index` if it declines to pick
/// (or if BSP election is disabled outright — a BSP must still be
/// resolved deterministically, or every other CPU spins forever in
/// [`wait_for_elected_bsp`]).
fn elect_bsp<P: Platform, const N: usize>(ctx: &RendezvousContext<P, N>, cpu_index: usize) -> bool {
    let platform_choice = if ctx.config.enable_bsp_election {
        ctx.platform.platform_smm_bsp_election()
    } else {
        None
    };
    match platform_choice {
        Some(chosen) => {
            if chosen {
                ctx.bsp_index.store(cpu_index as i32, Ordering::SeqCst);
            }
            chosen
        }
        None => ctx
            .bsp_index
            .compare_exchange(
                BSP_UNSET,
                cpu_index as i32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok(),
    }
}

/// Spin until a BSP has published its index (lost the election race but
/// arrived before the winner finished writing `bsp_index`).
fn wait_for_elected_bsp<P: Platform, const N: usize>(ctx: &RendezvousContext<P, N>) -> usize {
    loop {
        let idx = ctx.bsp_index.load(Ordering::SeqCst);
        if idx != BSP_UNSET {
            return idx as usize;
        }
        core::hint::spin_loop();
    }
}
