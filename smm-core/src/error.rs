//! # Scheduling result taxonomy
//!
//! The rendezvous core never panics on external input; every public entry
//! point returns one of these. Internal consistency violations (the things
//! the source calls assertions, not input errors) are a different path —
//! see [`crate::context::fatal`].

use core::fmt;

/// Result of a scheduling request against the public API (§4.8 / §7).
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Semantic result kinds for the public scheduling API.
///
/// `SUCCESS` is modeled as `Ok(())`/`Ok(token)`; everything else is an
/// error variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// cpu out of range, cpu is self/BSP, cpu not present, cpu has an
    /// invalid APIC id, procedure is null, cpu is marked for removal,
    /// a timeout was requested but is unsupported, or
    /// `RegisterStartupProcedure` was called with a null procedure and a
    /// non-null argument.
    InvalidParameter(&'static str),
    /// `StartupAllAPs` found a target CPU already busy, or
    /// `RegisterStartupProcedure`/`IsApReady` was called while the core
    /// (or token) has an outstanding request.
    NotReady,
    /// `StartupAllAPs` ran with no AP present, or a per-slot status for a
    /// non-present AP during a broadcast dispatch.
    NotStarted,
    /// The dispatched procedure did not complete within the caller's
    /// timeout budget.
    Timeout,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(reason) => write!(f, "invalid parameter: {reason}"),
            Self::NotReady => write!(f, "not ready"),
            Self::NotStarted => write!(f, "not started"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Per-slot dispatch status, written back through `status_out` /
/// `status_array` (§4.8, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Not yet written.
    Pending,
    /// Procedure ran to completion.
    Success,
    /// Slot was never present; the procedure was never invoked.
    NotStarted,
    /// Timeout budget elapsed before completion.
    Timeout,
}

/// Halt the current CPU forever.
///
/// Mirrors `CpuDeadLoop`: the handler for conditions the spec says must be
/// fatal (invariant violations, allocation failure during init). There is
/// no supervisor to report to and no stack to unwind in SMM, so this never
/// returns.
#[cold]
pub fn fatal(reason: &'static str) -> ! {
    log::error!("smm-core: fatal: {reason}");
    loop {
        core::hint::spin_loop();
    }
}
