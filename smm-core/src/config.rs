//! # Configuration (§6 "Configuration flags")
//!
//! Build/platform-time choices. These are read once at context creation
//! and never change for the lifetime of the core.

/// Synchronization mode: whether APs are gathered before or after the
/// BSP's dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Gather all APs before invoking the dispatcher.
    Traditional,
    /// Invoke the dispatcher first; gather stragglers afterward.
    Relaxed,
}

/// Fixed-at-init configuration for a [`crate::context::RendezvousContext`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Whether the core elects a BSP itself (vs. trusting the platform).
    pub enable_bsp_election: bool,
    /// Whether `SmmStartupThisAp` defaults to blocking mode.
    pub block_startup_this_ap: bool,
    /// Traditional vs. Relaxed gather/dispatch ordering.
    pub sync_mode: SyncMode,
    /// Tokens appended per chunk when the token free list runs dry. Must
    /// be nonzero.
    pub token_count_per_chunk: u32,
    /// Whether hot-plug bookkeeping runs at BSP exit.
    pub hot_plug_support: bool,
    /// Whether to emit verbose rendezvous tracing.
    pub smm_debug: bool,
    /// Whether per-CPU profiling hooks are active.
    pub smm_profile_enable: bool,
}

impl Config {
    /// A conservative default: traditional sync, BSP election enabled,
    /// blocking dispatch by default.
    pub const fn new(token_count_per_chunk: u32) -> Self {
        Self {
            enable_bsp_election: true,
            block_startup_this_ap: true,
            sync_mode: SyncMode::Traditional,
            token_count_per_chunk,
            hot_plug_support: false,
            smm_debug: false,
            smm_profile_enable: false,
        }
    }
}
