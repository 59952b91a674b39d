//! Low-power event wait (spec §4.A "Event wait").
//!
//! `load_before_wait` performs an acquire load of the watched word and
//! registers the calling CPU's interest in its cache line; `wait` then parks
//! the CPU (`WFE` on aarch64) until any store to that line wakes it, or until
//! the fallback busy-wait simply spins. Callers must always pair
//! `load_before_wait` with a predicate check before calling `wait`, mirroring
//! the spin loop in [`crate::primitives::spinlock::SpinLock`]: a store that
//! lands between the load and the `wait` must not be missed.

use core::sync::atomic::{AtomicU32, Ordering};

/// Acquire-load `addr` and arm the local monitor for its cache line.
///
/// On aarch64 this is `LDAXR` (load-exclusive-acquire); elsewhere it is a
/// plain acquire load and `wait` degrades to a bounded busy spin.
#[inline]
pub fn load_before_wait(addr: &AtomicU32) -> u32 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let value: u32;
        core::arch::asm!(
            "ldaxr {value:w}, [{addr}]",
            addr = in(reg) addr as *const AtomicU32,
            value = out(reg) value,
            options(nostack),
        );
        value
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        addr.load(Ordering::Acquire)
    }
}

/// Park the calling CPU in a low-power state until the monitored line is
/// touched by a store anywhere in the coherence domain.
///
/// # Safety requirement (not enforced by the type system)
/// Callers must have called [`load_before_wait`] on the *same* address
/// and re-checked their predicate immediately before this call, or a store
/// that lands in the gap is silently missed (`WFE` is a hint, not a barrier
/// against lost wakeups by itself).
#[inline]
pub fn wait() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("wfe", options(nostack, nomem));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        core::hint::spin_loop();
    }
}

/// Store a new value and wake any CPU parked in [`wait`] on this line.
#[inline]
pub fn store_and_wake(addr: &AtomicU32, value: u32, order: Ordering) {
    addr.store(value, order);
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("sev", options(nostack, nomem));
    }
}

/// Spin on `predicate` using the load/wait protocol until it returns `true`.
///
/// This is the idiom every blocking primitive in this crate (spinlock,
/// scheduler runqueue poll, wait queue) is built from.
#[inline]
pub fn wait_until(addr: &AtomicU32, mut predicate: impl FnMut(u32) -> bool) -> u32 {
    loop {
        let v = load_before_wait(addr);
        if predicate(v) {
            return v;
        }
        wait();
    }
}
