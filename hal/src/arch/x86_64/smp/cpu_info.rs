//! # CPU topology
//!
//! The arrival protocol's package-first-thread bookkeeping needs to turn a
//! raw APIC id into `(package, core, thread)` coordinates. This detects the
//! APIC id's bit layout from CPUID (extended topology leaf 0x0B, falling
//! back to leaf 0x04 and then leaf 0x01) and extracts those coordinates.
//!
//! CPU enumeration, online/offline state tracking and AP bring-up belong to
//! the platform's boot sequence and live outside this crate.

use core::arch::asm;

/// Bit-field layout of a local APIC id, as reported by CPUID.
#[derive(Debug, Clone, Copy)]
pub struct CpuTopology {
    /// Number of packages/sockets.
    pub packages: u32,
    /// Cores per package.
    pub cores_per_package: u32,
    /// Threads per core (SMT).
    pub threads_per_core: u32,
    /// Total logical CPUs reported by CPUID.
    pub total_logical_cpus: u32,
    /// Width, in bits, of the SMT (thread) field within an APIC id.
    pub smt_mask_width: u32,
    /// Width, in bits, of the core field within an APIC id (inclusive of
    /// the SMT bits below it).
    pub core_mask_width: u32,
}

impl CpuTopology {
    /// A single-package, single-core, single-thread default.
    pub const fn new() -> Self {
        Self {
            packages: 1,
            cores_per_package: 1,
            threads_per_core: 1,
            total_logical_cpus: 1,
            smt_mask_width: 0,
            core_mask_width: 0,
        }
    }
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self::new()
    }
}

/// Detect CPU topology, preferring the extended topology leaf when present.
pub fn detect_topology() -> CpuTopology {
    let mut topology = CpuTopology::new();

    let (max_leaf, _, _, _) = cpuid(0);

    if max_leaf >= 0x0B {
        detect_topology_0b(&mut topology);
    } else if max_leaf >= 0x04 {
        detect_topology_04(&mut topology);
    } else {
        detect_topology_01(&mut topology);
    }

    topology
}

fn detect_topology_0b(topology: &mut CpuTopology) {
    let mut level = 0u32;
    let mut total_threads = 0u32;
    let mut total_cores = 0u32;

    loop {
        let (eax, ebx, ecx, _) = cpuid_subleaf(0x0B, level);

        let level_type = (ecx >> 8) & 0xFF;
        if level_type == 0 && level > 0 {
            break;
        }

        match level_type {
            1 => {
                topology.threads_per_core = ebx & 0xFFFF;
                topology.smt_mask_width = eax & 0x1F;
            }
            2 => {
                total_cores = ebx & 0xFFFF;
                topology.core_mask_width = eax & 0x1F;
            }
            _ => {}
        }

        total_threads = (ebx & 0xFFFF).max(total_threads);
        level += 1;

        if level > 10 {
            break;
        }
    }

    if total_threads > 0 {
        topology.total_logical_cpus = total_threads;
    }

    if total_cores > 0 && topology.threads_per_core > 0 {
        topology.cores_per_package = total_cores / topology.threads_per_core;
    }

    if topology.total_logical_cpus > 0 && total_cores > 0 {
        topology.packages = (topology.total_logical_cpus / total_cores).max(1);
    }
}

fn detect_topology_04(topology: &mut CpuTopology) {
    let (_, ebx, _, _) = cpuid(1);
    let max_logical = (ebx >> 16) & 0xFF;

    let (eax, _, _, _) = cpuid_subleaf(0x04, 0);
    let max_cores = ((eax >> 26) & 0x3F) + 1;

    topology.total_logical_cpus = max_logical;
    topology.cores_per_package = max_cores;
    topology.threads_per_core = if max_cores > 0 {
        (max_logical / max_cores).max(1)
    } else {
        1
    };
    topology.packages = 1;
}

fn detect_topology_01(topology: &mut CpuTopology) {
    let (_, ebx, _, edx) = cpuid(1);

    if edx & (1 << 28) != 0 {
        let max_logical = (ebx >> 16) & 0xFF;
        topology.total_logical_cpus = max_logical;

        if max_logical > 1 {
            topology.threads_per_core = 2;
            topology.cores_per_package = max_logical / 2;
        }
    }
}

/// Split an APIC id into `(package, core, thread)` using a detected topology.
pub fn extract_topology_ids(apic_id: u32, topology: &CpuTopology) -> (u8, u8, u8) {
    let smt_mask = (1u32 << topology.smt_mask_width) - 1;
    let core_mask = (1u32 << topology.core_mask_width) - 1;

    let thread_id = (apic_id & smt_mask) as u8;
    let core_id =
        ((apic_id >> topology.smt_mask_width) & (core_mask >> topology.smt_mask_width)) as u8;
    let package_id = (apic_id >> topology.core_mask_width) as u8;

    (package_id, core_id, thread_id)
}

fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (mut eax, ebx, ecx, edx): (u32, u32, u32, u32);
    eax = leaf;
    unsafe {
        asm!(
            "mov {tmp:r}, rbx",
            "cpuid",
            "xchg {tmp:r}, rbx",
            tmp = out(reg) ebx,
            inout("eax") eax,
            out("ecx") ecx,
            out("edx") edx,
            options(nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

fn cpuid_subleaf(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let (mut eax, ebx, mut ecx, edx): (u32, u32, u32, u32);
    eax = leaf;
    ecx = subleaf;
    unsafe {
        asm!(
            "mov {tmp:r}, rbx",
            "cpuid",
            "xchg {tmp:r}, rbx",
            tmp = out(reg) ebx,
            inout("eax") eax,
            inout("ecx") ecx,
            out("edx") edx,
            options(nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}
