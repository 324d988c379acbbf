//! Architecture-specific backends.
//!
//! The SMM rendezvous protocol is an x86 System-Management-Mode concept;
//! this HAL only ships the x86_64 backend.

pub mod x86_64;
