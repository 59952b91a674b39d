//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

use crate::arch::aarch64::defs::BLOCK_SIZE_2MB;

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;
pub const UART_SIZE: u64 = 0x1000;

// ── GIC ──────────────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1_0000;
pub const GICC_BASE: u64 = 0x0801_0000;
pub const GIC_REGION_BASE: u64 = 0x0800_0000;
/// 16MB covers GICD + GICR (8 x 2MB blocks: 0x0800_0000 - 0x0900_0000)
pub const GIC_REGION_SIZE: u64 = 8 * BLOCK_SIZE_2MB;

// ── Guest memory layout ──────────────────────────────────────────────
pub const GUEST_RAM_BASE: u64 = 0x4000_0000;
pub const GUEST_LOAD_ADDR: u64 = 0x4800_0000;
pub const LINUX_DTB_ADDR: u64 = 0x4700_0000;
pub const LINUX_MEM_SIZE: u64 = 1024 * 1024 * 1024;
pub const ZEPHYR_MEM_SIZE: u64 = 128 * 1024 * 1024;
pub const GUEST_STACK_RESERVE: u64 = 0x1000;

// ── Virtio-blk disk image ───────────────────────────────────────────
/// Disk image load address (loaded by QEMU -device loader)
pub const VIRTIO_DISK_ADDR: u64 = 0x5800_0000;
/// Disk image size (2MB default — overridden if image is smaller/larger)
pub const VIRTIO_DISK_SIZE: u64 = 2 * 1024 * 1024;

// ── Virtio-MMIO slot layout ───────────────────────────────────────
/// Base address of the first virtio-mmio transport (QEMU virt convention)
pub const VIRTIO_MMIO_BASE: u64 = 0x0a00_0000;
/// Stride between virtio-mmio transports
pub const VIRTIO_MMIO_STRIDE: u64 = 0x200;
/// First SPI INTID for virtio devices (SPI 16 = INTID 48)
pub const VIRTIO_SPI_BASE: u32 = 48;

/// Compute (base_addr, intid) for virtio-mmio slot N.
/// Slot 0: virtio-blk (0x0a000000, INTID 48)
/// Slot 1: virtio-net (0x0a000200, INTID 49)
pub const fn virtio_slot(n: usize) -> (u64, u32) {
    (
        VIRTIO_MMIO_BASE + (n as u64) * VIRTIO_MMIO_STRIDE,
        VIRTIO_SPI_BASE + n as u32,
    )
}

// ── SMP ──────────────────────────────────────────────────────────────
/// Maximum CPUs supported (compile-time capacity for array sizing)
pub const MAX_SMP_CPUS: usize = 8;
/// Default CPU count (used when DTB is not available)
pub const SMP_CPUS: usize = 4;
/// Runtime CPU count from DTB (falls back to SMP_CPUS default)
pub fn num_cpus() -> usize {
    crate::dtb::platform_info().num_cpus
}

// ── GICR redistributor offsets ───────────────────────────────────────
// Per-CPU GICR bases are now computed at runtime from DTB:
//   crate::dtb::gicr_rd_base(cpu_id)  → RD frame
//   crate::dtb::gicr_sgi_base(cpu_id) → SGI frame
/// GICR_WAKER offset from RD base
pub const GICR_WAKER_OFF: u64 = 0x014;
/// GICR_IGROUPR0 offset within SGI frame (interrupt group)
pub const GICR_IGROUPR0_OFF: u64 = 0x080;
/// GICR_ISENABLER0 offset within SGI frame (write-1-to-enable)
pub const GICR_ISENABLER0_OFF: u64 = 0x100;
/// GICR_ISPENDR0 offset within SGI frame
pub const GICR_ISPENDR0_OFF: u64 = 0x200;
/// GICR_ICPENDR0 offset within SGI frame
pub const GICR_ICPENDR0_OFF: u64 = 0x280;

// ── VM 1 memory layout (multi-VM mode) ──────────────────────────────
pub const VM1_GUEST_LOAD_ADDR: u64 = 0x6800_0000;
pub const VM1_LINUX_DTB_ADDR: u64 = 0x6700_0000;
pub const VM1_LINUX_MEM_SIZE: u64 = 256 * 1024 * 1024;
pub const VM1_VIRTIO_DISK_ADDR: u64 = 0x7800_0000;

// ── Heap ─────────────────────────────────────────────────────────────
pub const HEAP_START: u64 = 0x4100_0000;
pub const HEAP_SIZE: u64 = 0x100_0000; // 16MB

// ── Power/timer/IPI external-collaborator surface (spec §6 "Platform
// module"). The object/capability core and scheduling substrate call
// through these free functions rather than touching PSCI/GIC/timer
// registers directly, the same narrow-interface style the arch trampoline
// and page-table traits use.

use crate::primitives::cpulocal::CpuIndex;

/// Whether `cpu` is a CPU this platform instance actually has.
pub fn cpu_exists(cpu: CpuIndex) -> bool {
    cpu.index() < num_cpus()
}

pub fn max_cores() -> usize {
    num_cpus()
}

/// PSCI `CPU_ON`. The MPIDR affinity value equals the CPU index on the QEMU
/// virt machine's default topology (see [`CpuIndex::current`]).
#[cfg(target_arch = "aarch64")]
pub fn cpu_on(cpu: CpuIndex, entry_point: u64, context_id: u64) -> crate::error::HypResult<()> {
    let r = crate::ffa::smc_forward::forward_smc(0xC400_0003, cpu.index() as u64, entry_point, context_id, 0, 0, 0, 0);
    match r.x0 as i64 {
        0 => Ok(()),
        -2 => Err(crate::error::HypError::Retry), // PSCI INVALID_PARAMETERS races a concurrent CPU_OFF
        _ => Err(crate::error::HypError::Failure),
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn cpu_on(_cpu: CpuIndex, _entry_point: u64, _context_id: u64) -> crate::error::HypResult<()> {
    Ok(())
}

/// PSCI `CPU_OFF`. Does not return on real hardware; the host stand-in
/// returns so unit tests that exercise the power-vote bookkeeping around
/// this call can observe its effects.
#[cfg(target_arch = "aarch64")]
pub fn cpu_off() -> ! {
    crate::ffa::smc_forward::forward_smc(0x8400_0002, 0, 0, 0, 0, 0, 0, 0);
    loop {
        unsafe { core::arch::asm!("wfi", options(nostack, nomem)) };
    }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn cpu_off() {}

/// PSCI `CPU_SUSPEND`. `power_state` is the raw PSCI power-state argument.
#[cfg(target_arch = "aarch64")]
pub fn cpu_suspend(power_state: u32) -> crate::error::HypResult<()> {
    let r = crate::ffa::smc_forward::forward_smc(0xC400_0001, power_state as u64, 0, 0, 0, 0, 0, 0);
    if r.x0 == 0 { Ok(()) } else { Err(crate::error::HypError::Failure) }
}

#[cfg(not(target_arch = "aarch64"))]
pub fn cpu_suspend(_power_state: u32) -> crate::error::HypResult<()> {
    Ok(())
}

/// Send a physical IPI carrying `reason_bits` to `cpu` (GICv3 SGI on
/// aarch64). `reason_bits` is the sender's `ipi::Reason` bitmask, used only
/// as a hint — the receiver re-reads its own pending word regardless.
pub fn ipi_one(reason_bits: u32, cpu: CpuIndex) {
    let _ = reason_bits;
    #[cfg(target_arch = "aarch64")]
    {
        // SGI 0, targeting Aff0 == cpu.index() within affinity level 0
        // (QEMU virt's default single-cluster topology), via ICC_SGI1R_EL1.
        const IPI_SGI_ID: u64 = 0;
        let target_list: u64 = 1 << (cpu.index() & 0xF);
        let sgi1r = (IPI_SGI_ID << 24) | target_list;
        unsafe {
            core::arch::asm!(
                "msr S3_0_C12_C11_5, {v}", // ICC_SGI1R_EL1
                "isb",
                v = in(reg) sgi1r,
                options(nostack, nomem),
            );
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = cpu;
}

pub fn timer_get_current_ticks() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        crate::arch::aarch64::peripherals::timer::get_counter()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

pub fn timer_get_frequency() -> u64 {
    #[cfg(target_arch = "aarch64")]
    {
        crate::arch::aarch64::peripherals::timer::get_frequency()
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        1_000_000_000
    }
}

pub fn convert_ns_to_ticks(ns: u64) -> u64 {
    let freq = timer_get_frequency().max(1);
    // ns * freq / 1e9, reordered to reduce overflow risk for small `ns`.
    (ns / 1_000_000_000).saturating_mul(freq) + (ns % 1_000_000_000) * freq / 1_000_000_000
}

/// One hardware RNG draw (`RNDR` on aarch64). `None` if the instruction
/// reports the RNG as transiently unavailable.
pub fn get_random32() -> Option<u32> {
    #[cfg(target_arch = "aarch64")]
    {
        let value: u64;
        let ok: u64;
        unsafe {
            core::arch::asm!(
                "mrs {val}, s3_3_c2_c4_0", // RNDR
                "cset {ok}, ne",
                val = out(reg) value,
                ok = out(reg) ok,
                options(nomem, nostack),
            );
        }
        if ok != 0 { Some(value as u32) } else { None }
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        None
    }
}

pub fn get_entropy256() -> Option<[u8; 32]> {
    let mut out = [0u8; 32];
    for chunk in out.chunks_mut(4) {
        let word = get_random32()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(out)
}
