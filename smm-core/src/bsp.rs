//! # BSP state machine (C5, §4.5)
//!
//! Runs once per SMI, on whichever CPU [`crate::rendezvous`] elected as
//! BSP. Gathers APs (Traditional mode or when MTRRs need reprogramming),
//! invokes the registered dispatcher, drains outstanding AP work, and
//! tears the rendezvous back down for the next SMI.

use core::sync::atomic::Ordering;

use crate::arrival::{self, PackageFirstThreadMap};
use crate::config::SyncMode;
use crate::context::RendezvousContext;
use crate::platform::Platform;

/// Run the full BSP sequence for `bsp_index`. `package_of` maps a CPU
/// index to its physical package id, used only by the arrival protocol's
/// Blocked/Disabled accounting.
pub fn run<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    bsp_index: usize,
    packages: &PackageFirstThreadMap<N>,
    package_of: impl Fn(usize) -> usize,
) {
    ctx.global.inside_smm.store(true, Ordering::SeqCst);
    ctx.global.all_cpus_in_sync.store(true, Ordering::SeqCst);
    ctx.platform.debug_entry();

    ctx.cpus[bsp_index]
        .slots
        .present
        .store(true, Ordering::SeqCst);

    if !ctx.platform.clear_top_level_smi_status() {
        crate::error::fatal("platform failed to clear top-level SMI status");
    }

    let needs_mtrr_swap = ctx.platform.need_configure_mtrrs();
    let must_gather = ctx.config.sync_mode == SyncMode::Traditional || needs_mtrr_swap;

    let mut ap_count = 0u32;
    if must_gather {
        arrival::run(ctx, packages, &package_of);
        let prior = crate::atomics::lockdown_semaphore(&ctx.global.counter);
        ap_count = prior.saturating_sub(1);
        ctx.wait_for_all_aps(bsp_index, ap_count);
    }

    let backed_up_mtrrs = if needs_mtrr_swap {
        Some(run_mtrr_dance(ctx, bsp_index, ap_count))
    } else {
        None
    };

    ctx.cpus[bsp_index].slots.busy.acquire();
    ctx.platform.pre_dispatch_tasks();

    let (startup_procedure, smm_entry) = {
        let registrations = ctx.registrations.lock();
        (registrations.startup_procedure, registrations.smm_entry)
    };
    if let Some((procedure, args)) = startup_procedure {
        procedure(args);
    }
    if let Some(entry) = smm_entry {
        entry(bsp_index);
    }

    ctx.cpus[bsp_index].slots.busy.release();

    for cpu in 0..ctx.num_cpus {
        if cpu == bsp_index {
            continue;
        }
        if ctx.cpus[cpu].slots.present.load(Ordering::SeqCst) {
            ctx.cpus[cpu].slots.busy.wait_until_free();
        }
    }

    ctx.platform.remaining_tasks();

    if ctx.config.sync_mode == SyncMode::Relaxed && !needs_mtrr_swap {
        let prior = crate::atomics::lockdown_semaphore(&ctx.global.counter);
        let late_ap_count = prior.saturating_sub(1);
        while (ctx.present_count() as u32) < late_ap_count + 1 {
            core::hint::spin_loop();
        }
        ap_count = late_ap_count;
    }

    ctx.global.inside_smm.store(false, Ordering::SeqCst);
    ctx.release_all_aps(bsp_index);
    ctx.wait_for_all_aps(bsp_index, ap_count);

    if let Some(os_mtrrs) = backed_up_mtrrs {
        ctx.platform.mtrr_set_all(&os_mtrrs);
        ctx.platform.reenable_smrr();
        ctx.release_all_aps(bsp_index);
        ctx.wait_for_all_aps(bsp_index, ap_count);
    }

    ctx.platform.debug_exit();
    ctx.release_all_aps(bsp_index);

    if ctx.config.hot_plug_support {
        ctx.platform.hot_plug_update();
    }

    ctx.cpus[bsp_index]
        .slots
        .present
        .store(false, Ordering::SeqCst);
    ctx.wait_for_all_aps(bsp_index, ap_count);

    ctx.reset_for_next_smi();
}

/// The four-barrier MTRR swap: APs back up their own MTRRs, the BSP
/// installs SMI MTRRs for itself at the same point, then both sides
/// program the SMI set. `ap_count` APs must participate.
fn run_mtrr_dance<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    bsp_index: usize,
    ap_count: u32,
) -> P::Mtrrs {
    ctx.platform.disable_smrr();

    // "backup ready": every AP has captured its own OS MTRRs and is
    // waiting for the signal to proceed.
    ctx.wait_for_all_aps(bsp_index, ap_count);

    // "backup": BSP captures its own OS MTRRs.
    let os_mtrrs = ctx.platform.mtrr_get_all();
    ctx.release_all_aps(bsp_index);

    // "program ready": APs have backed up and are waiting to install.
    ctx.wait_for_all_aps(bsp_index, ap_count);

    // "program": BSP installs its SMI set, then releases APs to do the same.
    ctx.platform.install_smi_mtrrs();
    ctx.release_all_aps(bsp_index);

    os_mtrrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::RendezvousContext;
    use crate::platform::SmmRegister;
    use core::sync::atomic::AtomicUsize;

    struct FakePlatform {
        ticks: AtomicUsize,
        needs_mtrrs: bool,
    }

    impl Platform for FakePlatform {
        type Instant = usize;
        type Mtrrs = ();

        fn platform_valid_smi(&self) -> bool {
            true
        }
        fn platform_smm_bsp_election(&self) -> Option<bool> {
            None
        }
        fn clear_top_level_smi_status(&self) -> bool {
            true
        }
        fn smm_cpu_feature(&self, _cpu: usize, _register: SmmRegister) -> bool {
            false
        }
        fn need_configure_mtrrs(&self) -> bool {
            self.needs_mtrrs
        }
        fn apic_id(&self, cpu: usize) -> Option<u32> {
            Some(cpu as u32)
        }
        fn send_smi_ipi(&self, _apic_id: u32) {}
        fn start_sync_timer(&self) -> usize {
            self.ticks.load(Ordering::SeqCst)
        }
        fn is_sync_timer_timeout(&self, start: usize) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst) > start + 2
        }
        fn mtrr_get_all(&self) {}
        fn mtrr_set_all(&self, _mtrrs: &()) {}
    }

    fn dispatcher(_cpu: usize) {}

    #[test]
    fn solo_bsp_runs_dispatcher_and_resets_state() {
        let platform = FakePlatform {
            ticks: AtomicUsize::new(0),
            needs_mtrrs: false,
        };
        let ctx: RendezvousContext<FakePlatform, 4> =
            RendezvousContext::new(platform, Config::new(4), 1);
        ctx.registrations.lock().smm_entry = Some(dispatcher);
        ctx.global.counter.store(1, Ordering::SeqCst);

        let packages: PackageFirstThreadMap<4> = PackageFirstThreadMap::new();
        run(&ctx, 0, &packages, |_| 0);

        assert!(!ctx.global.inside_smm.load(Ordering::SeqCst));
        assert!(!ctx.cpus[0].slots.present.load(Ordering::SeqCst));
        assert_eq!(ctx.global.counter.load(Ordering::SeqCst), 0);
        assert!(!ctx.cpus[0].slots.busy.is_locked());
    }
}
