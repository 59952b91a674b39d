//! ARM64 Exception Handling
//!
//! This module provides the interface to the exception vector table and
//! exception handlers for EL2. `handle_exception`/`handle_irq_exception`
//! decode one trap and decide whether the calling VCPU thread should be
//! re-entered immediately (`true`) or whether control should fall back to
//! whatever scheduled it (`false`) — the scheduling choreography itself
//! (blocking, directed switches, power votes) lives in `sched`/`vcpu`/`power`
//! and is invoked from here, not reimplemented.

use crate::arch::aarch64::regs::VcpuContext;
use crate::arch::aarch64::defs::*;
use crate::kernel::KERNEL;
use crate::primitives::cpulocal::CpuIndex;
use crate::uart_puts;
use crate::uart_put_hex;
use core::sync::atomic::{AtomicU32, Ordering};

// External assembly functions defined in exception.S
extern "C" {
    /// Exception vector table base address
    ///
    /// This is the base address of the exception vector table that should
    /// be loaded into VBAR_EL2.
    pub static exception_vector_table: u8;

    /// Enter guest VM
    ///
    /// This function is implemented in assembly and will:
    /// 1. Restore guest context from VcpuContext
    /// 2. Execute ERET to enter the guest at EL1
    ///
    /// When the guest exits (due to exception), this function will:
    /// 1. Save guest context to VcpuContext
    /// 2. Return to the caller
    pub fn enter_guest(context: *mut VcpuContext) -> u64;
}

/// Initialize EL2 exception handling
///
/// This sets up the exception vector table for EL2 by:
/// 1. Loading VBAR_EL2 with the exception vector table address
/// 2. Configuring HCR_EL2 to enable necessary traps
pub fn init() {
    unsafe {
        // Get the address of the exception vector table
        let vbar = &exception_vector_table as *const _ as u64;

        // Load VBAR_EL2 with the exception vector table address
        core::arch::asm!(
            "msr vbar_el2, {vbar}",
            "isb",
            vbar = in(reg) vbar,
            options(nostack, nomem),
        );

        // Configure HCR_EL2 (Hypervisor Configuration Register)
        //
        // NOTE: Do NOT set bit 12 (DC = Default Cacheability).
        // DC=1 changes cache attributes when guest MMU is off, which can
        // cause stale page table data during the MMU-on transition.
        let hcr: u64 = HCR_RW         // EL1 is AArch64
                      | HCR_SWIO       // Set/Way Invalidation Override
                      | HCR_FMO        // Route physical FIQ to EL2
                      | HCR_IMO        // Route physical IRQ to EL2
                      | HCR_AMO        // Route physical SError to EL2
                      | HCR_FB         // Force Broadcast TLB/cache maintenance
                      | HCR_BSU_INNER  // Barrier Shareability Upgrade = IS
                      | HCR_TWI        // Trap WFI to EL2 (for vCPU scheduling)
                      // TWE NOT set: WFE executes natively (used in spinlocks,
                      // woken by SEV not SGI — trapping would cause deadlock)
                      | HCR_TEA        // Trap External Aborts to EL2
                      | HCR_APK        // Don't trap PAC key register accesses
                      | HCR_API;       // Don't trap PAC instructions

        core::arch::asm!(
            "msr hcr_el2, {hcr}",
            "isb",
            hcr = in(reg) hcr,
            options(nostack, nomem),
        );
    }
}

// Exception loop prevention: track consecutive exceptions
static EXCEPTION_COUNT: AtomicU32 = AtomicU32::new(0);
const MAX_CONSECUTIVE_EXCEPTIONS: u32 = 100;

/// Reset all exception counters (call before entering a new guest)
pub fn reset_exception_counters() {
    EXCEPTION_COUNT.store(0, Ordering::Relaxed);
}

/// Exception handler called from assembly
///
/// # Returns
/// * `true` - Continue running guest
/// * `false` - Exit to host
#[no_mangle]
pub extern "C" fn handle_exception(context: &mut VcpuContext) -> bool {
    // Read ESR_EL2 to determine exception cause
    let esr: u64;
    unsafe {
        core::arch::asm!(
            "mrs {esr}, esr_el2",
            esr = out(reg) esr,
            options(nostack, nomem),
        );
    }
    context.sys_regs.esr_el2 = esr;

    // Read FAR_EL2 for fault address
    let far: u64;
    unsafe {
        core::arch::asm!(
            "mrs {far}, far_el2",
            far = out(reg) far,
            options(nostack, nomem),
        );
    }
    context.sys_regs.far_el2 = far;

    // Check for exception loop
    let count = EXCEPTION_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    if count > MAX_CONSECUTIVE_EXCEPTIONS {
        uart_puts(b"\n[FATAL] Too many consecutive exceptions, halting system\n");
        uart_puts(b"[DEBUG] ESR_EL2=0x");
        uart_put_hex(esr);
        uart_puts(b" FAR_EL2=0x");
        uart_put_hex(far);
        uart_puts(b" PC=0x");
        uart_put_hex(context.pc);
        uart_puts(b"\n");
        // Halt the system completely to prevent further execution
        loop {
            unsafe { core::arch::asm!("wfe"); }
        }
    }

    // Get exit reason
    let exit_reason = context.exit_reason();

    use crate::arch::aarch64::regs::ExitReason;

    match exit_reason {
        ExitReason::WfiWfe => {
            EXCEPTION_COUNT.store(0, Ordering::Relaxed);
            context.pc += AARCH64_INSN_SIZE;
            handle_wfi(context)
        }

        ExitReason::HvcCall => {
            EXCEPTION_COUNT.store(0, Ordering::Relaxed);
            handle_hypercall(context);
            // ELR_EL2 already points at the instruction after HVC.
            true
        }

        ExitReason::TrapMsrMrs => {
            EXCEPTION_COUNT.store(0, Ordering::Relaxed);
            handle_msr_mrs_trap(context, esr);
            context.pc += AARCH64_INSN_SIZE;
            true // Continue
        }

        ExitReason::InstructionAbort => {
            uart_puts(b"[VCPU] Instruction abort at FAR=0x");
            uart_put_hex(context.sys_regs.far_el2);
            uart_puts(b" PC=0x");
            uart_put_hex(context.pc);
            uart_puts(b"\n");
            false // Fatal
        }

        ExitReason::DataAbort => {
            // Data abort - determine the faulting IPA (guest physical address).
            //
            // When Stage-2 is enabled (HCR_EL2.VM=1), FAR_EL2 holds the
            // guest virtual address, NOT the IPA. The IPA page is in HPFAR_EL2.
            // We combine HPFAR_EL2 (page frame) with FAR_EL2 (page offset).
            let hpfar: u64;
            unsafe {
                core::arch::asm!(
                    "mrs {}, hpfar_el2",
                    out(reg) hpfar,
                    options(nostack, nomem),
                );
            }
            // HPFAR_EL2[43:4] = IPA[47:12] (page number)
            // FAR_EL2[11:0] = page offset within the 4KB page
            let ipa_page = (hpfar & 0x0000_0FFF_FFFF_FFF0) << 8;
            let page_offset = context.sys_regs.far_el2 & 0xFFF;
            let addr = ipa_page | page_offset;

            if handle_mmio_abort(context, addr) {
                EXCEPTION_COUNT.store(0, Ordering::Relaxed);
                false // Exit: the proxy owner services the fault via vcpu_run.
            } else {
                uart_puts(b"[VCPU] Data abort IPA=0x");
                uart_put_hex(addr);
                uart_puts(b" VA=0x");
                uart_put_hex(context.sys_regs.far_el2);
                uart_puts(b" (no vdevice owns this range)\n");
                false // Exit
            }
        }

        ExitReason::Other(ec) => {
            // Handle specific ECs that aren't fatal
            match ec {
                EC_TRAPPED_SIMD_FP => {
                    uart_puts(b"[VCPU] FP/SIMD trap at PC=0x");
                    uart_put_hex(context.pc);
                    uart_puts(b"\n");
                    context.pc += AARCH64_INSN_SIZE;
                    true
                }
                EC_TRAPPED_SVE => {
                    uart_puts(b"[VCPU] SVE/SME trap at PC=0x");
                    uart_put_hex(context.pc);
                    uart_puts(b"\n");
                    context.pc += AARCH64_INSN_SIZE;
                    true
                }
                EC_SVE_TRAP => {
                    uart_puts(b"[VCPU] SVE trap (EC=0x19) at PC=0x");
                    uart_put_hex(context.pc);
                    uart_puts(b"\n");
                    context.pc += AARCH64_INSN_SIZE;
                    true
                }
                _ => {
                    uart_puts(b"[VCPU] Unknown exception EC=0x");
                    uart_put_hex(ec);
                    uart_puts(b" ESR=0x");
                    uart_put_hex(esr);
                    uart_puts(b" PC=0x");
                    uart_put_hex(context.pc);
                    uart_puts(b"\n");
                    false // Exit
                }
            }
        }

        ExitReason::Unknown => {
            uart_puts(b"[VCPU] Unknown exception, ESR=0x");
            uart_put_hex(esr);
            uart_puts(b" PC=0x");
            uart_put_hex(context.pc);
            uart_puts(b"\n");
            false // Exit
        }
    }
}

/// Route a trapped WFI/WFE through the thread-level fastpath (spec §4.I),
/// blocking the calling VCPU thread with `VCPU_WFI` and switching away when
/// nothing is pending. Returns whether the guest should resume immediately.
fn handle_wfi(_context: &mut VcpuContext) -> bool {
    use crate::arch::aarch64::peripherals::gicv3::GicV3VirtualInterface;
    use crate::arch::aarch64::peripherals::timer;

    let cpu = CpuIndex::current();
    let thread_id = KERNEL.scheduler.active(cpu);
    let cur_ticks = crate::platform::timer_get_current_ticks();

    let outcome = crate::vcpu::wfi::wfi_trap(&KERNEL.scheduler, cpu, thread_id, cur_ticks, || {
        !timer::is_guest_vtimer_pending() && GicV3VirtualInterface::pending_count() == 0
    });

    matches!(outcome, crate::vcpu::wfi::WfiOutcome::ResumedInline)
}

/// IRQ exception handler called from assembly (irq_exception_handler)
///
/// This handles physical IRQs that trap from the guest to EL2
/// (e.g., virtual timer interrupt). Unlike sync exceptions, ESR_EL2
/// is NOT valid - we acknowledge via ICC_IAR1_EL1.
///
/// # Returns
/// * `true` - Continue running guest
/// * `false` - Exit to host
#[no_mangle]
pub extern "C" fn handle_irq_exception(_context: &mut VcpuContext) -> bool {
    use crate::arch::aarch64::peripherals::gicv3::{GicV3SystemRegs, GicV3VirtualInterface, VTIMER_IRQ};
    use crate::arch::aarch64::peripherals::timer;

    EXCEPTION_COUNT.store(0, Ordering::Relaxed);

    let cpu = CpuIndex::current();
    let intid = GicV3SystemRegs::read_iar1();

    if intid >= GIC_SPURIOUS_INTID {
        return true;
    }

    match intid {
        0..=15 => {
            // Physical SGI: this hypervisor's own IPI mechanism
            // (`sched::ipi`). Acknowledge and let the scheduler drain its
            // pending-reason word on the way back out.
            GicV3SystemRegs::write_eoir1(intid);
            GicV3SystemRegs::write_dir(intid);
        }
        26 => {
            // EL2 hypervisor physical timer (CNTHP) — preemption watchdog.
            timer::disable_timer();
            GicV3SystemRegs::write_eoir1(intid);
            GicV3SystemRegs::write_dir(intid); // No HW linkage
        }
        33 => {
            // Physical UART RX interrupt (SPI 1 = INTID 33). Drain the FIFO
            // so the level-triggered interrupt doesn't keep re-firing.
            loop {
                let fr: u32;
                unsafe {
                    core::arch::asm!(
                        "ldr {val:w}, [{addr}]",
                        addr = in(reg) (crate::platform::UART_BASE + 0x18),
                        val = out(reg) fr,
                        options(nostack, readonly),
                    );
                }
                if fr & (1 << 4) != 0 {
                    break; // RXFE — FIFO empty
                }
                unsafe {
                    let _data: u32;
                    core::arch::asm!(
                        "ldr {val:w}, [{addr}]",
                        addr = in(reg) crate::platform::UART_BASE,
                        val = out(reg) _data,
                        options(nostack, readonly),
                    );
                }
            }
            GicV3SystemRegs::write_eoir1(intid);
            GicV3SystemRegs::write_dir(intid);
        }
        27 => {
            // Virtual timer interrupt (PPI 27). Mask and inject HW=1 so the
            // guest's own EOI deactivates the physical interrupt.
            timer::mask_guest_vtimer();
            let _ = GicV3VirtualInterface::inject_hw_interrupt(VTIMER_IRQ, VTIMER_IRQ, IRQ_DEFAULT_PRIORITY);
            // EOImode=1: priority drop only; no DIR for HW=1 timer.
            GicV3SystemRegs::write_eoir1(intid);
            return !KERNEL.scheduler.reschedule_needed(cpu);
        }
        _ => {
            uart_puts(b"[IRQ] Unhandled INTID=");
            uart_put_hex(intid as u64);
            uart_puts(b"\n");
            GicV3SystemRegs::write_eoir1(intid);
            GicV3SystemRegs::write_dir(intid);
        }
    }

    !KERNEL.scheduler.reschedule_needed(cpu)
}

/// Handle MSR/MRS trap (EC=0x18)
///
/// Decodes the ISS to identify the trapped system register and emulates
/// the access.
///
/// ISS encoding (from KVM/ARM):
///   [21:20] Op0, [19:17] Op2, [16:14] Op1, [13:10] CRn, [9:5] Rt, [4:1] CRm, [0] Direction
fn handle_msr_mrs_trap(context: &mut VcpuContext, esr: u64) {
    let iss = (esr & ESR_ISS_MASK) as u32;
    let op0 = (iss >> 20) & 0x3;
    let op2 = (iss >> 17) & 0x7;
    let op1 = (iss >> 14) & 0x7;
    let crn = (iss >> 10) & 0xF;
    let rt  = ((iss >> 5) & 0x1F) as u8;
    let crm = (iss >> 1) & 0xF;
    let is_read = (iss & 1) == 1;

    if is_read {
        // MRS: Read system register, write value to Rt
        let value = emulate_mrs(op0, op1, crn, crm, op2);
        if rt < 31 {
            context.gp_regs.set_reg(rt, value);
        }
        // rt=31 means xzr, discard result
    } else {
        // MSR: Read value from Rt, write to system register
        let value = if rt < 31 {
            context.gp_regs.get_reg(rt)
        } else {
            0 // xzr
        };
        emulate_msr(op0, op1, crn, crm, op2, value);
    }
}

/// Emulate MRS (system register read) for trapped registers
///
/// Returns the value that should be placed in the destination register.
fn emulate_mrs(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32) -> u64 {
    match (op0, op1, crn, crm, op2) {
        // Debug registers (Op0=2) - return safe defaults
        (2, 0, 0, 2, 2) => {
            // MDSCR_EL1 - Debug Status and Control
            unsafe {
                let val: u64;
                core::arch::asm!("mrs {}, mdscr_el1", out(reg) val);
                val
            }
        }
        (2, 0, 1, 1, 4) => {
            // OSLSR_EL1 - OS Lock Status (report unlocked)
            1 << 3 // OSLM=1 (OS Lock implemented), OSLK=0 (unlocked)
        }
        (2, 0, 1, 3, 4) => {
            // OSDLR_EL1 - OS Double Lock Register (report unlocked)
            0
        }
        // PMU registers (Op0=3, Op1=3, CRn=9) - return 0 (no PMU)
        (3, 3, 9, _, _) => 0,
        // PMU registers (Op0=3, Op1=0, CRn=9) - return 0
        (3, 0, 9, _, _) => 0,
        // Any other trapped register: Read-As-Zero
        _ => 0,
    }
}

/// Emulate MSR (system register write) for trapped registers
///
/// Writes the value to the system register if we know how, otherwise ignores.
fn emulate_msr(op0: u32, op1: u32, crn: u32, crm: u32, op2: u32, value: u64) {
    match (op0, op1, crn, crm, op2) {
        // ICC_SGI1R_EL1 (S3_0_C12_C11_5) — Software Generated Interrupt
        // Trapped by ICH_HCR_EL2.TALL1. Decode target vCPUs and queue SGIs.
        (3, 0, 12, 11, 5) => {
            handle_sgi_trap(value);
        }
        // Debug registers
        (2, 0, 0, 2, 2) => {
            // MDSCR_EL1 - Debug Status and Control
            unsafe {
                core::arch::asm!("msr mdscr_el1, {}", in(reg) value);
            }
        }
        (2, 0, 1, 0, 4) => {
            // OSLAR_EL1 - OS Lock Access (write-only)
            unsafe {
                core::arch::asm!("msr oslar_el1, {}", in(reg) value);
            }
        }
        (2, 0, 1, 3, 4) => {
            // OSDLR_EL1 - OS Double Lock
            // Ignore (don't actually lock)
        }
        // PMU registers - ignore writes
        (3, 3, 9, _, _) | (3, 0, 9, _, _) => {}
        // Any other trapped register: Write-Ignored
        _ => {}
    }
}

/// Handle trapped ICC_SGI1R_EL1 write (MSR trap via TALL1).
///
/// Decodes the target vCPU list from the value the guest intended to write
/// and asserts the matching private virq on the calling thread's VIC (spec
/// §4.J `Virq::Private`), rather than queuing a physical IPI: guest-visible
/// SGIs are virtual interrupts delivered through the VIC object, independent
/// of this hypervisor's own physical-IPI-based scheduler wakeups.
///
/// ICC_SGI1R_EL1 encoding:
///   [55:48] Aff3, [47:44] RS, [40] IRM, [39:32] Aff2,
///   [27:24] INTID, [23:16] Aff1, [15:0] TargetList
fn handle_sgi_trap(value: u64) {
    use crate::vgic::vic::Virq;

    let target_list = (value & 0xFFFF) as u32;
    let intid = ((value >> 24) & 0xF) as u32;
    let irm = (value >> 40) & 1;

    let cpu = CpuIndex::current();
    let Some(thread) = KERNEL.scheduler.thread(KERNEL.scheduler.active(cpu)) else { return };
    let Some(vic_idx) = thread.vgic_index() else { return };
    let Some(vic) = KERNEL.vics.get(vic_idx as usize) else { return };

    if irm == 1 {
        // IRM=1: target every other VCPU bound to this VIC.
        for target in 0..crate::limits::MAX_VCPUS_PER_VIC as u8 {
            if let Some(virq) = Virq::from_intid(target, intid) {
                let _ = vic.assert_edge(virq);
            }
        }
    } else {
        for bit in 0..crate::limits::MAX_VCPUS_PER_VIC as u32 {
            if target_list & (1 << bit) == 0 {
                continue;
            }
            if let Some(virq) = Virq::from_intid(bit as u8, intid) {
                let _ = vic.assert_edge(virq);
            }
        }
    }
}

/// Handle a trapped HVC instruction: decode the SMCCC function-ID word and
/// route it through the standard owner-dispatch table rather than a
/// bespoke ABI (spec §4.L).
fn handle_hypercall(context: &mut VcpuContext) {
    let function_id = context.gp_regs.x0 as u32;
    let cap = context.gp_regs.x1 as u32;
    let args = [
        context.gp_regs.x2,
        context.gp_regs.x3,
        context.gp_regs.x4,
        context.gp_regs.x5,
        context.gp_regs.x6,
    ];
    let id = crate::smccc::decode(function_id);
    let r = crate::smccc::dispatch(id, CpuIndex::current(), cap, args);
    context.gp_regs.x0 = r.x0;
    context.gp_regs.x1 = r.x1;
    context.gp_regs.x2 = r.x2;
    context.gp_regs.x3 = r.x3;
}

/// Handle MMIO data abort.
///
/// Looks the faulting IPA up against the calling thread's addrspace vdevice
/// map; on a hit, records the access on the thread (spec §4.I "ADDRSPACE_
/// VMMIO_READ/WRITE") for the proxy owner to service via `vcpu_run`, rather
/// than emulating the device inline here.
///
/// # Returns
/// * `true` if the range is owned by a vdevice (fault recorded)
/// * `false` if no vdevice claims this address
fn handle_mmio_abort(context: &mut VcpuContext, addr: u64) -> bool {
    use crate::arch::aarch64::hypervisor::decode::MmioAccess;

    let cpu = CpuIndex::current();
    let thread_id = KERNEL.scheduler.active(cpu);
    let Some(thread) = KERNEL.scheduler.thread(thread_id) else { return false };
    let Some(addrspace_idx) = thread.addrspace() else { return false };
    let Some(addrspace) = KERNEL.addrspaces.get(addrspace_idx as usize) else { return false };
    if addrspace.lookup_vdevice(addr).is_none() {
        return false;
    }

    // Get ISS from ESR_EL2
    let iss = (context.sys_regs.esr_el2 & ESR_ISS_MASK) as u32;
    let isv = (iss >> 24) & 1;

    let insn = if isv == 1 {
        0 // ISS decode doesn't need the instruction
    } else if context.pc < 0x8000_0000_0000 {
        unsafe { core::ptr::read_volatile(context.pc as *const u32) }
    } else {
        uart_puts(b"[MMIO] Can't decode: guest VA PC=0x");
        uart_put_hex(context.pc);
        uart_puts(b" ISV=0\n");
        return false;
    };

    let access = match MmioAccess::decode(insn, iss) {
        Some(a) => a,
        None => {
            uart_puts(b"[MMIO] Failed to decode instruction at 0x");
            uart_put_hex(context.pc);
            uart_puts(b"\n");
            return false;
        }
    };

    thread.set_vmmio_pending(access.is_store());
    thread.set_vmmio_fault_info(addr, access.size() as u64);
    context.pc += AARCH64_INSN_SIZE;
    thread.block(crate::sched::thread::BlockReason::ADDRSPACE_VMMIO_ACCESS);
    let cur_ticks = crate::platform::timer_get_current_ticks();
    KERNEL.scheduler.schedule(cpu, cur_ticks);
    true
}
