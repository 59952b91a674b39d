//! Bounded trace ring (spec §4.M).
//!
//! Grounded on the reference trace interface: events are tagged with a
//! trace-class bitmask and only recorded while at least one of their classes
//! is enabled in a global flags word, checked with a single relaxed load on
//! the hot path. Unlike the reference implementation this never grows a
//! dynamically-allocated buffer (spec §1 Non-goals bar a general allocator
//! from the core) — the ring is a fixed `TRACE_RING_CAPACITY`-entry array,
//! reset on cold boot per §5 persisted-state.

use crate::limits::TRACE_RING_CAPACITY;
use crate::primitives::spinlock::SpinLock;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Trace classes, one bit each. Matches the reference's "up to 64
    /// classes" budget loosely; this crate only needs a handful so far.
    pub struct Class: u32 {
        const SCHED    = 1 << 0;
        const POWER    = 1 << 1;
        const VGIC     = 1 << 2;
        const CSPACE   = 1 << 3;
        const HYPERCALL = 1 << 4;
        const IPI      = 1 << 5;
    }
}

static ENABLED: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy)]
pub struct Entry {
    pub class: Class,
    pub id: u16,
    pub args: [u64; 4],
    pub ticks: u64,
}

const EMPTY: Entry = Entry { class: Class::empty(), id: 0, args: [0; 4], ticks: 0 };

struct Ring {
    entries: [Entry; TRACE_RING_CAPACITY],
    next: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Self {
        Self { entries: [EMPTY; TRACE_RING_CAPACITY], next: 0, len: 0 }
    }

    fn push(&mut self, entry: Entry) {
        self.entries[self.next] = entry;
        self.next = (self.next + 1) % TRACE_RING_CAPACITY;
        self.len = (self.len + 1).min(TRACE_RING_CAPACITY);
    }
}

static RING: SpinLock<Ring> = SpinLock::new(Ring::new());

/// Enable the given trace classes (additive).
pub fn set_class_flags(flags: Class) {
    ENABLED.fetch_or(flags.bits(), Ordering::Relaxed);
}

/// Disable the given trace classes.
pub fn clear_class_flags(flags: Class) {
    ENABLED.fetch_and(!flags.bits(), Ordering::Relaxed);
}

pub fn class_flags() -> Class {
    Class::from_bits_truncate(ENABLED.load(Ordering::Relaxed))
}

/// Record `id`/`args` under `class` if any of its bits are currently
/// enabled. Checked with one relaxed load so disabled trace points cost
/// almost nothing on the hot path, matching the reference's `TRACE_MAYBE`.
#[inline]
pub fn add(class: Class, id: u16, args: [u64; 4]) {
    if ENABLED.load(Ordering::Relaxed) & class.bits() == 0 {
        return;
    }
    let ticks = crate::platform::timer_get_current_ticks();
    RING.lock().push(Entry { class, id, args, ticks });
}

/// Clear the ring and disable every class (spec §5: "trace ring is reset on
/// cold boot").
pub fn reset() {
    *RING.lock() = Ring::new();
    ENABLED.store(0, Ordering::Relaxed);
}

/// Copy up to `out.len()` of the most recent entries, oldest first. Returns
/// the number written.
pub fn drain(out: &mut [Entry]) -> usize {
    let ring = RING.lock();
    let count = ring.len.min(out.len());
    let start = (ring.next + TRACE_RING_CAPACITY - ring.len) % TRACE_RING_CAPACITY;
    for i in 0..count {
        out[i] = ring.entries[(start + i) % TRACE_RING_CAPACITY];
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_class_is_not_recorded() {
        reset();
        add(Class::SCHED, 1, [0; 4]);
        let mut out = [EMPTY; 4];
        assert_eq!(drain(&mut out), 0);
    }

    #[test]
    fn enabled_class_is_recorded_and_drained_in_order() {
        reset();
        set_class_flags(Class::SCHED);
        add(Class::SCHED, 1, [1, 0, 0, 0]);
        add(Class::SCHED, 2, [2, 0, 0, 0]);
        let mut out = [EMPTY; 4];
        let n = drain(&mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0].id, 1);
        assert_eq!(out[1].id, 2);
    }

    #[test]
    fn ring_wraps_and_keeps_only_the_most_recent_entries() {
        reset();
        set_class_flags(Class::POWER);
        for i in 0..(TRACE_RING_CAPACITY as u16 + 3) {
            add(Class::POWER, i, [0; 4]);
        }
        let mut out = [EMPTY; TRACE_RING_CAPACITY];
        let n = drain(&mut out);
        assert_eq!(n, TRACE_RING_CAPACITY);
        assert_eq!(out[0].id, 3);
        assert_eq!(out[TRACE_RING_CAPACITY - 1].id, TRACE_RING_CAPACITY as u16 + 2);
    }
}
