//! Wait queue object (spec §4.K: "a list of waiters under a spinlock").
//!
//! Four-step protocol per waiter: `prepare` (enqueue self before checking
//! the condition, so a concurrent `wakeup` can never race ahead of the
//! enqueue), `get` (mark blocked), `wait` (actually yield the CPU), `finish`
//! (dequeue self once scheduled back in). `wakeup` unblocks every waiter
//! currently on the list behind one `SeqCst` fence that pairs with the fence
//! `get` raises, rather than a per-waiter fence.

use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::cpulocal::CpuIndex;
use crate::primitives::list::List;
use crate::primitives::spinlock::SpinLock;
use crate::sched::scheduler::Scheduler;
use crate::sched::thread::{BlockReason, Thread, ThreadId};
use core::sync::atomic::Ordering;

pub struct WaitQueue {
    pub header: Header,
    waiters: SpinLock<List>,
}

impl WaitQueue {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::WaitQueue),
            waiters: SpinLock::new(List::new()),
        }
    }

    pub fn configure(&self) -> Result<(), crate::error::HypError> {
        let _g = self.header.lock_config();
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(crate::error::HypError::ObjectState);
        }
        Ok(())
    }

    /// Enqueue `tid` onto the waiter list. Must happen before the caller
    /// re-checks whatever condition it is about to sleep on.
    pub fn prepare(&self, scheduler: &Scheduler, tid: ThreadId) {
        self.waiters.lock().push_back(scheduler.thread_slab(), tid as usize);
    }

    /// Mark `thread` blocked. Raises the acquire-side fence that pairs with
    /// `wakeup`'s single `SeqCst` fence.
    pub fn get(&self, thread: &Thread) {
        thread.block(BlockReason::WAIT_QUEUE);
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Actually yield the CPU. Returns whatever `Scheduler::schedule`
    /// returns (whether a context switch occurred).
    pub fn wait(&self, scheduler: &Scheduler, cpu: CpuIndex, cur_ticks: u64) -> bool {
        scheduler.schedule(cpu, cur_ticks)
    }

    /// Dequeue `tid`, called once the waiter is scheduled back in (whether
    /// due to `wakeup` or a spurious wake it needs to re-check).
    pub fn finish(&self, scheduler: &Scheduler, tid: ThreadId) {
        self.waiters.lock().delete(scheduler.thread_slab(), tid as usize);
    }

    /// Unblock every waiter currently linked, each onto its own affinity
    /// (or `default_cpu` if unset/migratable). One `SeqCst` fence for the
    /// whole batch, not one per waiter.
    pub fn wakeup(&self, scheduler: &Scheduler, default_cpu: CpuIndex) {
        core::sync::atomic::fence(Ordering::SeqCst);
        let slab = scheduler.thread_slab();
        let waiters = self.waiters.lock();
        for idx in waiters.iter(slab) {
            let tid = idx as ThreadId;
            let target_cpu = slab[idx].affinity().unwrap_or(default_cpu);
            let became_runnable = scheduler.unblock(target_cpu, tid, BlockReason::WAIT_QUEUE);
            if became_runnable {
                scheduler.trigger(target_cpu);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

pub struct WaitQueueSlab {
    queues: [WaitQueue; crate::limits::MAX_WAIT_QUEUES],
}

impl WaitQueueSlab {
    pub const fn new() -> Self {
        const Q: WaitQueue = WaitQueue::new_uninit();
        Self {
            queues: [Q; crate::limits::MAX_WAIT_QUEUES],
        }
    }

    pub fn get(&self, index: usize) -> Option<&WaitQueue> {
        self.queues.get(index)
    }
}

impl Default for WaitQueueSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_get_wait_finish_cycle_reports_blocked_state() {
        let wq = WaitQueue::new_uninit();
        wq.configure().unwrap();
        let scheduler = Scheduler::new();
        let tid: ThreadId = 3;
        wq.prepare(&scheduler, tid);
        assert!(!wq.is_empty());
        wq.get(scheduler.thread(tid).unwrap());
        assert!(scheduler.thread(tid).unwrap().is_blocked());
        wq.finish(&scheduler, tid);
        assert!(wq.is_empty());
    }

    #[test]
    fn wakeup_unblocks_every_linked_waiter() {
        let wq = WaitQueue::new_uninit();
        wq.configure().unwrap();
        let scheduler = Scheduler::new();
        for tid in [2u32, 4u32] {
            wq.prepare(&scheduler, tid);
            wq.get(scheduler.thread(tid).unwrap());
        }
        let cpu = CpuIndex::new(0).unwrap();
        wq.wakeup(&scheduler, cpu);
        assert!(scheduler.thread(2).unwrap().is_runnable());
        assert!(scheduler.thread(4).unwrap().is_runnable());
    }
}
