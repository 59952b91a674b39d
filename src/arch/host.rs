//! Host stand-in for [`aarch64`](super::aarch64), compiled only when
//! `target_arch != "aarch64"` (i.e. under `cargo test` on a developer
//! machine). Never linked into the `aarch64-unknown-none` image.

use crate::arch::traits::ArchTrampoline;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub last_switch_ticks: u64,
}

impl CpuContext {
    pub const fn new() -> Self {
        Self { last_switch_ticks: 0 }
    }

    pub fn prepare(&mut self, _entry: extern "C" fn(u64) -> !, _arg: u64, _stack_top: u64) {
        *self = Self::new();
    }
}

pub struct Trampoline;

/// Host stand-in for [`super::aarch64::IdentityMapper`]'s [`crate::arch::traits::PageTable`]
/// impl: every address is trivially "mapped" identity-style, just enough for
/// `mem::addrspace` unit tests to exercise lookup/fault-translation logic
/// without a real stage-2 walker.
#[derive(Default)]
pub struct Pgtable;

impl Pgtable {
    pub const fn new() -> Self {
        Self
    }
}

impl crate::arch::traits::PageTable for Pgtable {
    type Attrs = ();

    unsafe fn pgtable_hyp_map(&mut self, _va: u64, _pa: u64, _size: u64, _attrs: ()) -> Result<(), &'static str> {
        Ok(())
    }
    unsafe fn pgtable_hyp_unmap(&mut self, _va: u64, _size: u64) -> Result<(), &'static str> {
        Ok(())
    }
    fn pgtable_hyp_commit(&mut self) {}
    fn pgtable_hyp_start(&mut self) {}
    fn pgtable_vm_lookup(&self, _asid: u16, va: u64) -> Option<(u64, u64, ())> {
        Some((va, 0x1000, ()))
    }
    fn va_to_pa_read(&self, va: u64) -> Option<u64> {
        Some(va)
    }
    fn va_to_pa_write(&self, va: u64) -> Option<u64> {
        Some(va)
    }
}

impl ArchTrampoline for Trampoline {
    type Context = CpuContext;

    unsafe fn thread_switch_to(_prev: *mut CpuContext, next: *mut CpuContext, cur_ticks: u64) {
        (*next).last_switch_ticks = cur_ticks;
    }

    fn interrupt_enable() {}
    fn interrupt_disable() {}
    fn context_sync() {}
    fn device_fence() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
