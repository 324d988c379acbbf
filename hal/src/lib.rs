//! # SMM Hardware Abstraction Layer
//!
//! Low-level x86_64 primitives needed by the SMM rendezvous core: raw MSR
//! access, CPUID queries used to detect machine-check support, local-APIC
//! IPI delivery (including SMI-IPI), a TSC-based interval timer, and a pair
//! of spinlock flavors used to protect the rendezvous' shared state.
//!
//! This crate has no opinion about *why* any of this is used — it only
//! exposes the hardware mechanism. Policy (when to send an SMI-IPI, how long
//! to wait) lives in `smm-core`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arch;

pub use arch::x86_64;
