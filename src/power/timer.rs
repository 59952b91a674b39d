//! Per-CPU timer queue (spec §4.H).
//!
//! A small fixed-capacity, deadline-ordered array of armed timers per CPU.
//! Each timer is identified by the slot the caller chooses to reuse (e.g.
//! [`crate::power::power`]'s per-CPU retry timer always uses the same slot),
//! mirroring the original `timer_enqueue`/`timer_dequeue`/`timer_is_queued`
//! trio rather than introducing a generic allocator for timer nodes.

use crate::limits::MAX_TIMERS_PER_CPU;
use crate::primitives::cpulocal::{CpuIndex, CpuLocal};
use crate::primitives::spinlock::SpinLock;

pub type TimerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    PowerCpuOnRetry,
    Generic,
}

#[derive(Clone, Copy)]
struct Slot {
    deadline: u64,
    action: TimerAction,
    queued: bool,
}

const EMPTY_SLOT: Slot = Slot { deadline: 0, action: TimerAction::Generic, queued: false };

struct Queue {
    slots: SpinLock<[Slot; MAX_TIMERS_PER_CPU]>,
}

impl Queue {
    const fn new() -> Self {
        Self { slots: SpinLock::new([EMPTY_SLOT; MAX_TIMERS_PER_CPU]) }
    }
}

pub struct TimerQueue {
    per_cpu: CpuLocal<Queue>,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            per_cpu: CpuLocal::new({
                const INIT: Queue = Queue::new();
                [INIT; crate::limits::MAX_CORES]
            }),
        }
    }

    /// Arm `id` to fire at `deadline` (in platform ticks) unless already
    /// queued, matching the original's "enqueue if not already queued"
    /// idempotence for retry timers.
    pub fn enqueue(&self, cpu: CpuIndex, id: TimerId, deadline: u64, action: TimerAction) {
        let mut slots = self.per_cpu.get(cpu).slots.lock();
        let slot = &mut slots[id];
        if !slot.queued {
            *slot = Slot { deadline, action, queued: true };
        }
    }

    pub fn dequeue(&self, cpu: CpuIndex, id: TimerId) {
        self.per_cpu.get(cpu).slots.lock()[id].queued = false;
    }

    pub fn is_queued(&self, cpu: CpuIndex, id: TimerId) -> bool {
        self.per_cpu.get(cpu).slots.lock()[id].queued
    }

    /// Pop one timer whose deadline has elapsed, if any (spec: a tick
    /// handler drains these one at a time and dispatches by `TimerAction`).
    pub fn pop_due(&self, cpu: CpuIndex, now: u64) -> Option<(TimerId, TimerAction)> {
        let mut slots = self.per_cpu.get(cpu).slots.lock();
        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.queued && slot.deadline <= now {
                slot.queued = false;
                return Some((id, slot.action));
            }
        }
        None
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_is_idempotent_while_already_queued() {
        let q = TimerQueue::new();
        let cpu = CpuIndex::new(0).unwrap();
        q.enqueue(cpu, 0, 100, TimerAction::PowerCpuOnRetry);
        q.enqueue(cpu, 0, 999, TimerAction::PowerCpuOnRetry);
        assert!(q.is_queued(cpu, 0));
        assert_eq!(q.pop_due(cpu, 100), Some((0, TimerAction::PowerCpuOnRetry)));
    }

    #[test]
    fn pop_due_ignores_timers_not_yet_elapsed() {
        let q = TimerQueue::new();
        let cpu = CpuIndex::new(0).unwrap();
        q.enqueue(cpu, 1, 500, TimerAction::Generic);
        assert_eq!(q.pop_due(cpu, 100), None);
        assert_eq!(q.pop_due(cpu, 500), Some((1, TimerAction::Generic)));
        assert!(!q.is_queued(cpu, 1));
    }
}
