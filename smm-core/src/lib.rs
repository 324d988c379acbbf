//! # SMM Multi-Processor Rendezvous Core
//!
//! Coordinates every logical processor's entry into and exit from
//! system-management mode: one CPU is elected BSP, every other present
//! CPU gathers behind an arrival barrier, the registered dispatcher runs
//! once on the BSP, and outstanding AP work drains before any CPU leaves
//! SMM. See [`rendezvous::smi_rendezvous`] for the entry point and
//! [`api`] for the scheduling surface a dispatcher calls into.
//!
//! Everything the core needs from its environment — SMI validity, BSP
//! election, MTRRs, the sync timer, IPI delivery — sits behind
//! [`platform::Platform`], so the protocol logic here never touches raw
//! hardware directly; `smm-hal` supplies that for a real x86_64 target.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod ap;
pub mod api;
pub mod arrival;
pub mod atomics;
pub mod bsp;
pub mod config;
pub mod context;
pub mod error;
pub mod platform;
pub mod rendezvous;
pub mod semaphore_pool;
pub mod token;

pub use config::{Config, SyncMode};
pub use context::RendezvousContext;
pub use error::{ScheduleError, ScheduleResult};
pub use platform::{Platform, SmmRegister};
pub use rendezvous::{smi_rendezvous, RendezvousOutcome};
pub use token::TokenHandle;
