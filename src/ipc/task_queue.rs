//! Per-CPU task queue (spec §4.K "Task queue", §3 "Task queue entry").
//!
//! Mirrors [`crate::power::timer::TimerQueue`]'s fixed-slot-per-CPU shape: a
//! caller picks a class tag and payload, the entry is appended to the
//! target CPU's slot array, and `ipi::Reason::TASK_QUEUE` wakes that CPU to
//! drain it. Cancellation is best-effort — clearing `queued` racing a
//! concurrent drain is fine, it just means the entry either ran once or not
//! at all, never twice.

use crate::limits::MAX_TASK_QUEUE_ENTRIES_PER_CPU;
use crate::primitives::cpulocal::{CpuIndex, CpuLocal};
use crate::primitives::spinlock::SpinLock;
use crate::sched::ipi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Reclaim storage behind an RCU grace period (see `primitives::rcu`).
    RcuCallback,
    /// Opaque caller-defined work, dispatched by whoever calls `pop`.
    Generic,
}

#[derive(Clone, Copy)]
struct Entry {
    class: TaskClass,
    payload: usize,
    queued: bool,
}

const EMPTY: Entry = Entry { class: TaskClass::Generic, payload: 0, queued: false };

struct PerCpuQueue {
    entries: SpinLock<[Entry; MAX_TASK_QUEUE_ENTRIES_PER_CPU]>,
}

impl PerCpuQueue {
    const fn new() -> Self {
        Self {
            entries: SpinLock::new([EMPTY; MAX_TASK_QUEUE_ENTRIES_PER_CPU]),
        }
    }
}

pub struct TaskQueue {
    per_cpu: CpuLocal<PerCpuQueue>,
}

impl TaskQueue {
    pub const fn new() -> Self {
        Self {
            per_cpu: CpuLocal::new({
                const INIT: PerCpuQueue = PerCpuQueue::new();
                [INIT; crate::limits::MAX_CORES]
            }),
        }
    }

    /// Schedule a one-shot execution of `class`/`payload` on `cpu`, posting
    /// a relaxed `TASK_QUEUE` IPI so it drains even if `cpu` is idle.
    /// Returns `NoResources` if that CPU's slot array is full.
    pub fn enqueue(&self, cpu: CpuIndex, class: TaskClass, payload: usize) -> Result<(), crate::error::HypError> {
        let mut entries = self.per_cpu.get(cpu).entries.lock();
        let slot = entries
            .iter_mut()
            .find(|e| !e.queued)
            .ok_or(crate::error::HypError::NoResources)?;
        *slot = Entry { class, payload, queued: true };
        drop(entries);
        ipi::one_relaxed(ipi::Reason::TASK_QUEUE, cpu);
        Ok(())
    }

    /// Drain and run every queued entry on `cpu`, dispatching to `handler`.
    /// Called from the `TASK_QUEUE` IPI handler path.
    pub fn drain(&self, cpu: CpuIndex, mut handler: impl FnMut(TaskClass, usize)) {
        loop {
            let popped = {
                let mut entries = self.per_cpu.get(cpu).entries.lock();
                entries.iter_mut().find(|e| e.queued).map(|slot| {
                    slot.queued = false;
                    (slot.class, slot.payload)
                })
            };
            match popped {
                Some((class, payload)) => handler(class, payload),
                None => break,
            }
        }
    }

    pub fn is_empty(&self, cpu: CpuIndex) -> bool {
        self.per_cpu.get(cpu).entries.lock().iter().all(|e| !e.queued)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_drain_runs_each_entry_once() {
        let q = TaskQueue::new();
        let cpu = CpuIndex::new(0).unwrap();
        q.enqueue(cpu, TaskClass::Generic, 7).unwrap();
        q.enqueue(cpu, TaskClass::RcuCallback, 9).unwrap();
        let mut seen = [0usize; 4];
        let mut n = 0;
        q.drain(cpu, |_class, payload| {
            seen[n] = payload;
            n += 1;
        });
        assert_eq!(&seen[..n], &[7, 9]);
        assert!(q.is_empty(cpu));
    }

    #[test]
    fn enqueue_fails_once_the_slot_array_is_full() {
        let q = TaskQueue::new();
        let cpu = CpuIndex::new(0).unwrap();
        for i in 0..MAX_TASK_QUEUE_ENTRIES_PER_CPU {
            q.enqueue(cpu, TaskClass::Generic, i).unwrap();
        }
        assert_eq!(q.enqueue(cpu, TaskClass::Generic, 0), Err(crate::error::HypError::NoResources));
    }
}
