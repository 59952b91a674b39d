//! Nestable preempt-disable (spec §4.G).
//!
//! The depth counter is tracked per-CPU rather than per-thread: a thread can
//! only ever suspend (block, yield, `rcu_sync`, `wait_queue_wait`) while its
//! preempt count is zero — "preempt-disabled regions never suspend" is a
//! hard invariant of the concurrency model (spec §5) — so the depth a thread
//! left with at its last suspension point is always zero, and per-CPU
//! storage is observationally equivalent to per-thread storage while being
//! simpler to reach from [`crate::primitives::spinlock`] without circular
//! module dependencies. A `boot` bit additionally prevents enabling
//! preemption before bring-up completes, and an `in_interrupt` bit gates
//! context-switch safety inside nested ISRs.

use crate::primitives::cpulocal::{CpuIndex, CpuLocal};
use core::sync::atomic::{AtomicU32, Ordering};

const BOOT_BIT: u32 = 1 << 31;
const IN_INTERRUPT_BIT: u32 = 1 << 30;
const DEPTH_MASK: u32 = !(BOOT_BIT | IN_INTERRUPT_BIT);

struct PreemptState(AtomicU32);

static STATE: CpuLocal<PreemptState> = CpuLocal::new({
    const INIT: PreemptState = PreemptState(AtomicU32::new(BOOT_BIT));
    [INIT; crate::limits::MAX_CORES]
});

/// Mark bring-up complete on the calling CPU, allowing preemption to be
/// enabled for the first time.
pub fn end_boot() {
    STATE.this().0.fetch_and(!BOOT_BIT, Ordering::AcqRel);
}

pub fn disable() {
    STATE.this().0.fetch_add(1, Ordering::AcqRel);
}

pub fn enable() {
    let prev = STATE.this().0.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev & DEPTH_MASK != 0, "preempt_enable without matching disable");
}

pub fn depth() -> u32 {
    STATE.this().0.load(Ordering::Acquire) & DEPTH_MASK
}

pub fn is_disabled() -> bool {
    depth() != 0 || is_booting()
}

pub fn is_booting() -> bool {
    STATE.this().0.load(Ordering::Acquire) & BOOT_BIT != 0
}

pub fn enter_interrupt(cpu: CpuIndex) {
    STATE.get(cpu).0.fetch_or(IN_INTERRUPT_BIT, Ordering::AcqRel);
}

pub fn exit_interrupt(cpu: CpuIndex) {
    STATE.get(cpu).0.fetch_and(!IN_INTERRUPT_BIT, Ordering::AcqRel);
}

pub fn in_interrupt(cpu: CpuIndex) -> bool {
    STATE.get(cpu).0.load(Ordering::Acquire) & IN_INTERRUPT_BIT != 0
}

/// Panics in debug builds if preemption is not currently disabled. Used by
/// code (per-CPU accessors, scheduler internals) that assumes the caller
/// already holds off migration.
#[inline]
pub fn assert_disabled() {
    debug_assert!(is_disabled(), "expected preemption to be disabled here");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_tracks_depth() {
        assert_eq!(depth(), 0);
        disable();
        disable();
        assert_eq!(depth(), 2);
        enable();
        assert_eq!(depth(), 1);
        enable();
        assert_eq!(depth(), 0);
    }
}
