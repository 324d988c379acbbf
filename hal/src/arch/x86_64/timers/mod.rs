//! # Timing
//!
//! [`tsc`] is the only timer backend this HAL carries: a TSC-calibrated
//! interval budget, used by the rendezvous core's two-round arrival
//! protocol and by the AP's first-contact BSP wait.

pub mod tsc;

pub use tsc::{read_tsc, set_tsc_frequency, TscTimer};
