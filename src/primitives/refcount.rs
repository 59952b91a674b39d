//! Atomic reference count (spec §4.A).
//!
//! A 32-bit atomic counter with three acquisition modes distinguished by how
//! much the caller already knows about liveness:
//!
//! - [`Refcount::get_additional`] — the count is already known nonzero (the
//!   caller holds another reference, or is inside an RCU read section that
//!   guarantees the object has not yet reached its grace period). No memory
//!   barrier is needed since the existing reference already establishes the
//!   happens-before edge.
//! - [`Refcount::get_safe`] — the caller only has a raw pointer (e.g. from an
//!   RCU-protected array) and must CAS against zero in a loop, acquiring on
//!   success.
//! - [`Refcount::put`] — release; returns `true` iff this was the last
//!   reference, which also means the drop is acquire-ordered with every
//!   prior `put`.

use core::sync::atomic::{AtomicU32, Ordering};

pub struct Refcount(AtomicU32);

impl Refcount {
    pub const fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    /// Current count. Racy by nature; for diagnostics/tests only.
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Increment a refcount known to already be nonzero. No ordering is
    /// required because the caller's existing reference already pairs with
    /// whatever established it.
    pub fn get_additional(&self) {
        let prev = self.0.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "get_additional on a dead object");
    }

    /// Increment only if the count is currently nonzero. Returns `false` if
    /// the object has already hit zero (deactivated).
    pub fn get_safe(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release one reference. Returns `true` iff the count reached zero,
    /// i.e. the caller must run the type's deactivator. A `true` result is
    /// acquire-ordered with respect to every previous holder's writes.
    pub fn put(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "refcount underflow");
        if prev == 1 {
            core::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_additional_then_put_is_identity() {
        let rc = Refcount::new(1);
        rc.get_additional();
        assert_eq!(rc.count(), 2);
        assert!(!rc.put());
        assert_eq!(rc.count(), 1);
    }

    #[test]
    fn get_safe_fails_once_dead() {
        let rc = Refcount::new(1);
        assert!(rc.put());
        assert!(!rc.get_safe());
    }

    #[test]
    fn last_put_reports_deactivation() {
        let rc = Refcount::new(2);
        assert!(!rc.put());
        assert!(rc.put());
    }
}
