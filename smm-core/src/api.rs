//! # Public scheduling API (§4.8, §7)
//!
//! What a dispatcher running inside the BSP's `SmmCoreEntry` callback
//! calls to hand work to one or more APs. Every entry point here
//! validates its arguments against the taxonomy in
//! [`crate::error::ScheduleError`] instead of panicking.

use core::sync::atomic::Ordering;

use crate::context::{ApProcedure, RendezvousContext, SmiEntry, StartupProcedure};
use crate::error::{DispatchStatus, ScheduleError, ScheduleResult};
use crate::platform::{Platform, SmmRegister};
use crate::token::TokenHandle;

/// Register the dispatcher callback invoked once per SMI by the BSP.
/// Idempotent: a later registration simply replaces the earlier one.
pub fn register_smm_entry<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    entry: SmiEntry,
) -> ScheduleResult<()> {
    let mut registrations = ctx.registrations.lock();
    registrations.smm_entry = Some(entry);
    registrations.initialized = true;
    Ok(())
}

/// Register the pre-dispatch hook and its argument. A `None` procedure
/// paired with a nonzero `args` is rejected — there is nothing to do
/// with an argument for a hook that was never registered.
pub fn register_startup_procedure<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    procedure: Option<StartupProcedure>,
    args: usize,
) -> ScheduleResult<()> {
    if procedure.is_none() && args != 0 {
        return Err(ScheduleError::InvalidParameter(
            "startup procedure argument given without a procedure",
        ));
    }
    let mut registrations = ctx.registrations.lock();
    if registrations.initialized {
        return Err(ScheduleError::NotReady);
    }
    registrations.startup_procedure = procedure.map(|p| (p, args));
    Ok(())
}

/// Validate `cpu` as a dispatch target: in range, present, not the BSP,
/// not marked for removal.
fn validate_target<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    cpu: usize,
) -> ScheduleResult<()> {
    if cpu >= ctx.num_cpus {
        return Err(ScheduleError::InvalidParameter("cpu index out of range"));
    }
    if ctx.bsp_index() == Some(cpu) {
        return Err(ScheduleError::InvalidParameter("cpu is the BSP"));
    }
    if !ctx.cpus[cpu].slots.present.load(Ordering::SeqCst) {
        return Err(ScheduleError::InvalidParameter("cpu is not present"));
    }
    if ctx.platform.smm_cpu_feature(cpu, SmmRegister::Disabled) {
        return Err(ScheduleError::InvalidParameter("cpu is marked for removal"));
    }
    Ok(())
}

/// Claim `cpu`'s work item and wake it. Returns `NotReady` if a dispatch
/// is already outstanding on that CPU.
fn dispatch<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    cpu: usize,
    procedure: ApProcedure,
    parameter: usize,
    token: Option<TokenHandle>,
) -> ScheduleResult<()> {
    if !ctx.cpus[cpu].slots.busy.try_acquire() {
        return Err(ScheduleError::NotReady);
    }

    // SAFETY: `busy` was just claimed above; the owning CPU's work loop
    // will not touch this work item until it observes `run` released,
    // which happens after this write.
    let item = unsafe { ctx.cpus[cpu].work_mut() };
    item.procedure = Some(procedure);
    item.parameter = parameter;
    item.status = DispatchStatus::Pending;
    item.token = token;

    crate::atomics::release_semaphore(&ctx.cpus[cpu].slots.run);
    Ok(())
}

/// Dispatch `procedure` to `cpu` without blocking. The returned token
/// tracks completion through [`is_ap_ready`].
pub fn smm_startup_this_ap<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    cpu: usize,
    procedure: ApProcedure,
    parameter: usize,
) -> ScheduleResult<TokenHandle> {
    validate_target(ctx, cpu)?;
    let token = ctx.tokens.get_free_token(1).ok_or_else(|| {
        log::warn!("smm-core: token pool exhausted, dispatch to cpu {cpu} untracked");
        ScheduleError::NotReady
    })?;
    dispatch(ctx, cpu, procedure, parameter, Some(token))?;
    Ok(token)
}

/// Dispatch `procedure` to `cpu` and block until it completes.
pub fn smm_blocking_startup_this_ap<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    cpu: usize,
    procedure: ApProcedure,
    parameter: usize,
) -> ScheduleResult<()> {
    validate_target(ctx, cpu)?;
    dispatch(ctx, cpu, procedure, parameter, None)?;
    ctx.cpus[cpu].slots.busy.wait_until_free();
    Ok(())
}

/// Dispatch `procedure` to every present, non-BSP CPU. `statuses` must be
/// at least `ctx.num_cpus` long; non-present/invalid slots are written
/// [`DispatchStatus::NotStarted`] and skipped.
///
/// If `blocking` is false, one shared token is allocated across the
/// broadcast and returned: its `running_ap_count` is sized to however
/// many targets actually got dispatched, so the last AP to finish its
/// procedure is the one that releases the token's lock (checked through
/// [`is_ap_ready`]). If `blocking` is true, this busy-waits for every
/// dispatched target's `busy` lock to drain before returning `None`.
pub fn internal_smm_startup_all_aps<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    procedure: ApProcedure,
    parameter: usize,
    blocking: bool,
    statuses: &mut [DispatchStatus],
) -> ScheduleResult<Option<TokenHandle>> {
    if statuses.len() < ctx.num_cpus {
        return Err(ScheduleError::InvalidParameter(
            "status slice shorter than cpu count",
        ));
    }

    let bsp_index = ctx.bsp_index();

    // Targets are every non-BSP cpu index; §4.8's "ap_count = max CPUs"
    // sizing, expressed against this context's actual cpu count rather
    // than a separate platform-wide maximum.
    let candidate_count = if bsp_index.is_some() {
        ctx.num_cpus.saturating_sub(1)
    } else {
        ctx.num_cpus
    } as u32;

    let token = if blocking {
        None
    } else {
        Some(ctx.tokens.get_free_token(candidate_count).ok_or_else(|| {
            log::warn!("smm-core: token pool exhausted, broadcast dispatch untracked");
            ScheduleError::NotReady
        })?)
    };

    let mut dispatched_any = false;

    for cpu in 0..ctx.num_cpus {
        if Some(cpu) == bsp_index {
            statuses[cpu] = DispatchStatus::NotStarted;
            continue;
        }
        if validate_target(ctx, cpu).is_err() {
            statuses[cpu] = DispatchStatus::NotStarted;
            if let Some(token) = token {
                // This slot will never run to release its own share of
                // the token; account for it here instead.
                ctx.tokens.release_token(token);
            }
            continue;
        }
        match dispatch(ctx, cpu, procedure, parameter, token) {
            Ok(()) => {
                statuses[cpu] = DispatchStatus::Pending;
                dispatched_any = true;
            }
            Err(_) => {
                statuses[cpu] = DispatchStatus::NotStarted;
                if let Some(token) = token {
                    ctx.tokens.release_token(token);
                }
            }
        }
    }

    if !dispatched_any {
        return Err(ScheduleError::NotStarted);
    }

    if !blocking {
        return Ok(token);
    }

    for cpu in 0..ctx.num_cpus {
        if statuses[cpu] == DispatchStatus::Pending {
            ctx.cpus[cpu].slots.busy.wait_until_free();
            statuses[cpu] = DispatchStatus::Success;
        }
    }

    Ok(None)
}

/// Poll whether a non-blocking dispatch has finished.
pub fn is_ap_ready<P: Platform, const N: usize>(
    ctx: &RendezvousContext<P, N>,
    token: TokenHandle,
) -> ScheduleResult<bool> {
    if !ctx.tokens.is_token_in_use(token) {
        return Err(ScheduleError::InvalidParameter("token is not in use"));
    }
    Ok(ctx.tokens.is_ap_ready(token))
}
