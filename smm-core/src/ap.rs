//! # AP state machine (C6, §4.6)
//!
//! Runs on every non-BSP CPU that took the SMI. Waits for the BSP to
//! finish electing itself, participates in the MTRR dance if asked, then
//! sits in a work loop dispatching whatever the BSP hands it until the
//! BSP tears the rendezvous down.

use core::sync::atomic::Ordering;

use crate::context::RendezvousContext;
use crate::error::DispatchStatus;
use crate::platform::Platform;

/// Why an AP gave up waiting for a BSP to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApOutcome {
    /// Ran to completion alongside a BSP.
    Completed,
    /// No BSP ever appeared; this AP backed out of the rendezvous.
    NoBsp,
}

/// Run the AP sequence for `my_index`, given the already-elected
/// `bsp_index`.
pub fn run<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    my_index: usize,
    bsp_index: usize,
) -> ApOutcome {
    if !wait_for_bsp_inside_smm(ctx) {
        if let Some(apic_id) = ctx.platform.apic_id(bsp_index) {
            ctx.platform.send_smi_ipi(apic_id);
        }
        if !wait_for_bsp_inside_smm(ctx) {
            crate::atomics::release_semaphore(&ctx.global.counter);
            return ApOutcome::NoBsp;
        }
    }

    ctx.cpus[my_index].slots.present.store(true, Ordering::SeqCst);

    let needs_mtrr_swap = ctx.platform.need_configure_mtrrs();
    if ctx.config.sync_mode == crate::config::SyncMode::Traditional || needs_mtrr_swap {
        // Tell the BSP we've checked in; it is waiting on this exact
        // signal before it counts us toward `ap_count`.
        ctx.ping_bsp(bsp_index);
    }

    let backed_up_mtrrs = if needs_mtrr_swap {
        Some(run_mtrr_dance(ctx, my_index, bsp_index))
    } else {
        None
    };

    ctx.cpus[my_index].slots.busy.release();
    work_loop(ctx, my_index);

    // The BSP released every present AP's `run` once to wake it out of
    // the work loop; that release is this ping's counterpart.
    ctx.ping_bsp(bsp_index);

    if let Some(os_mtrrs) = backed_up_mtrrs {
        ctx.wait_for_bsp_go(my_index);
        ctx.platform.mtrr_set_all(&os_mtrrs);
        ctx.ping_bsp(bsp_index);
    }

    ctx.wait_for_bsp_go(my_index);
    ctx.cpus[my_index]
        .slots
        .present
        .store(false, Ordering::SeqCst);
    ctx.ping_bsp(bsp_index);

    ApOutcome::Completed
}

/// Poll `inside_smm` until set or the sync timer expires.
fn wait_for_bsp_inside_smm<P: Platform, const N: usize>(ctx: &RendezvousContext<P, N>) -> bool {
    let timer = ctx.platform.start_sync_timer();
    loop {
        if ctx.global.inside_smm.load(Ordering::SeqCst) {
            return true;
        }
        if ctx.platform.is_sync_timer_timeout(timer) {
            return false;
        }
        core::hint::spin_loop();
    }
}

/// Mirror of [`crate::bsp::run_mtrr_dance`]'s four barriers from the AP
/// side: back up the OS MTRRs, wait for the go, install SMI MTRRs, wait
/// for the next go.
fn run_mtrr_dance<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    my_index: usize,
    bsp_index: usize,
) -> P::Mtrrs {
    let os_mtrrs = ctx.platform.mtrr_get_all();

    // "backup ready"
    ctx.ping_bsp(bsp_index);
    // "backup"
    ctx.wait_for_bsp_go(my_index);

    // "program ready"
    ctx.ping_bsp(bsp_index);
    // "program"
    ctx.wait_for_bsp_go(my_index);
    ctx.platform.install_smi_mtrrs();

    os_mtrrs
}

/// Dispatch whatever the BSP leaves in this CPU's work item, in a loop,
/// until `inside_smm` drops (the rendezvous is tearing down).
fn work_loop<P: Platform, const N: usize>(ctx: &RendezvousContext<P, N>, my_index: usize) {
    loop {
        crate::atomics::wait_for_semaphore(&ctx.cpus[my_index].slots.run);

        if !ctx.global.inside_smm.load(Ordering::SeqCst) {
            return;
        }

        // SAFETY: this CPU's own `busy` lock gates the work item, and we
        // only reach here after observing our `run` slot released —
        // which only happens once the BSP has fully written the item.
        let item = unsafe { ctx.cpus[my_index].work_mut() };
        if let Some(procedure) = item.procedure.take() {
            let parameter = item.parameter;
            let token = item.token.take();
            item.status = DispatchStatus::Success;
            let _ = procedure(parameter);
            if let Some(token) = token {
                ctx.tokens.release_token(token);
            }
        }
        ctx.cpus[my_index].slots.busy.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::platform::SmmRegister;
    use core::sync::atomic::AtomicUsize;

    struct FakePlatform {
        ticks: AtomicUsize,
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
            false
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

    #[test]
    fn ap_backs_out_without_incrementing_present_when_no_bsp_ever_shows() {
        let platform = FakePlatform {
            ticks: AtomicUsize::new(0),
        };
        let ctx: RendezvousContext<FakePlatform, 4> =
            RendezvousContext::new(platform, Config::new(4), 2);
        ctx.global.counter.store(5, Ordering::SeqCst);

        let outcome = run(&ctx, 1, 0);
        assert_eq!(outcome, ApOutcome::NoBsp);
        assert!(!ctx.cpus[1].slots.present.load(Ordering::SeqCst));
        assert_eq!(ctx.global.counter.load(Ordering::SeqCst), 6);
    }
}
