//! Architecture-Portable Trait Definitions
//!
//! These traits abstract the hardware-specific operations needed by the
//! hypervisor core, enabling future support for additional architectures
//! (e.g., RISC-V) without changing the core VM/vCPU logic.

/// Interrupt controller operations (GICv3 on ARM, PLIC on RISC-V)
pub trait InterruptController {
    fn init(&mut self);
    fn enable(&mut self);
    fn disable(&mut self);
    fn acknowledge(&mut self) -> u32;
    fn eoi(&mut self, intid: u32);
    fn deactivate(&mut self, intid: u32);
    fn set_priority_mask(&mut self, mask: u8);
}

/// Virtual interrupt injection (ICH_LR on ARM, vstip on RISC-V)
pub trait VirtualInterruptController {
    fn inject_interrupt(&mut self, intid: u32, priority: u8) -> Result<(), &'static str>;
    fn inject_hw_interrupt(
        &mut self,
        vintid: u32,
        pintid: u32,
        priority: u8,
    ) -> Result<(), &'static str>;
    fn clear_interrupt(&mut self, intid: u32);
    fn pending_count(&self) -> usize;
}

/// Guest timer operations
pub trait GuestTimer {
    fn init_hypervisor(&mut self);
    fn init_guest(&mut self);
    fn is_pending(&self) -> bool;
    fn mask(&mut self);
    fn get_frequency(&self) -> u64;
    fn get_counter(&self) -> u64;
}

/// Memory type for Stage-2 / G-stage mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Normal,
    Device,
    ReadOnly,
}

/// Stage-2 / G-stage page table mapper
pub trait Stage2Mapper {
    fn map_region(&mut self, ipa: u64, size: u64, mem_type: MemoryType) -> Result<(), &'static str>;
    fn reset(&mut self);
    fn install(&self);
    fn root_table_addr(&self) -> u64;
}

/// Architecture-specific vCPU context operations
pub trait VcpuContextOps {
    fn new(entry: u64, sp: u64) -> Self;
    fn pc(&self) -> u64;
    fn set_pc(&mut self, val: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, val: u64);
    fn get_reg(&self, n: u8) -> u64;
    fn set_reg(&mut self, n: u8, val: u64);
    fn advance_pc(&mut self);
}

/// Exception cause (decoded from arch-specific registers)
pub trait ExceptionInfo {
    fn is_wfi(&self) -> bool;
    fn is_hypercall(&self) -> bool;
    fn is_data_abort(&self) -> bool;
    fn is_instruction_abort(&self) -> bool;
    fn fault_address(&self) -> Option<u64>;
}

/// The arch trampoline (spec §6 "External interfaces"): context-switches a
/// physical CPU between two kernel-thread contexts. This is the narrow
/// interface the core calls through [`crate::sched::scheduler`]; it does not
/// know about threads, priorities, or anything above "swap this opaque
/// register block for that one".
pub trait ArchTrampoline {
    /// Opaque per-thread register save area.
    type Context;

    /// Save the running thread's context into `prev`, install `next`'s
    /// stack and translation regime, and return executing as `next`.
    /// `cur_ticks` lets the implementation stamp a last-switched timestamp
    /// used by the scheduler's timeslice accounting.
    ///
    /// # Safety
    /// Both pointers must reference live, correctly initialized contexts,
    /// and `prev` must be the context of the CPU actually calling this.
    unsafe fn thread_switch_to(prev: *mut Self::Context, next: *mut Self::Context, cur_ticks: u64);

    fn interrupt_enable();
    fn interrupt_disable();

    /// Architectural context-synchronization barrier (`ISB` on aarch64),
    /// required after system register writes that affect instruction
    /// fetch/decode (e.g. HCR_EL2, SCTLR_EL1).
    fn context_sync();

    /// A fence covering device memory, used by IPI senders to ensure a
    /// `fetch_or` on the pending-reason word is visible before the physical
    /// interrupt line is asserted.
    fn device_fence();
}

/// Page-table module (spec §6): transactional at commit granularity; a
/// concurrent fault during a pending operation should retry rather than
/// fault through a half-built mapping. Treated as an external module with no
/// algorithm specified here (spec §1 Non-goals).
pub trait PageTable {
    type Attrs;

    /// # Safety
    /// `pa`/`size` must describe memory the caller owns exclusively in the
    /// hypervisor's own (EL2) address space.
    unsafe fn pgtable_hyp_map(&mut self, va: u64, pa: u64, size: u64, attrs: Self::Attrs) -> Result<(), &'static str>;
    unsafe fn pgtable_hyp_unmap(&mut self, va: u64, size: u64) -> Result<(), &'static str>;
    fn pgtable_hyp_commit(&mut self);
    fn pgtable_hyp_start(&mut self);

    /// Stage-2 lookup for a guest VM identified by `asid` (VMID).
    fn pgtable_vm_lookup(&self, asid: u16, va: u64) -> Option<(u64, u64, Self::Attrs)>;

    /// AT-style translation of the faulting VA as seen at EL1/EL2, used by
    /// the permission-fault path in [`crate::mem::addrspace`] to recover a
    /// physical address for a memdb lookup.
    fn va_to_pa_read(&self, va: u64) -> Option<u64>;
    fn va_to_pa_write(&self, va: u64) -> Option<u64>;
}
