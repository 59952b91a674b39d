//! FPRR scheduler (spec §4.E), with a `sched_trivial`-feature degenerate
//! single-priority variant.
//!
//! Per-CPU state: one FIFO runqueue per priority, the active thread, and a
//! "reschedule required" flag. `schedule`/`yield`/`yield_to` all run with
//! preemption disabled throughout, matching the teacher's single-priority
//! round-robin `Scheduler` this module replaces (see `scheduler.rs` at the
//! workspace root, kept for reference until the final trim pass).

use crate::limits::{MAX_CORES, NUM_PRIORITIES};
use crate::primitives::cpulocal::{CpuIndex, CpuLocal};
use crate::primitives::list::List;
use crate::primitives::spinlock::SpinLock;
use crate::sched::thread::{BlockReason, Thread, ThreadId, ThreadSlab, NO_THREAD};
use crate::sched::{ipi, preempt};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(not(feature = "sched_trivial"))]
const PRIORITY_LEVELS: usize = NUM_PRIORITIES;
#[cfg(feature = "sched_trivial")]
const PRIORITY_LEVELS: usize = 1;

struct PerCpu {
    runqueues: [List; PRIORITY_LEVELS],
    active: AtomicU32,
    reschedule_needed: AtomicBool,
    lock: SpinLock<()>,
}

impl PerCpu {
    const fn new() -> Self {
        const EMPTY: List = List::new();
        Self {
            runqueues: [EMPTY; PRIORITY_LEVELS],
            active: AtomicU32::new(NO_THREAD),
            reschedule_needed: AtomicBool::new(false),
            lock: SpinLock::new(()),
        }
    }
}

pub struct Scheduler {
    threads: ThreadSlab,
    per_cpu: CpuLocal<PerCpu>,
}

fn level_of(thread: &Thread) -> usize {
    #[cfg(feature = "sched_trivial")]
    {
        let _ = thread;
        0
    }
    #[cfg(not(feature = "sched_trivial"))]
    {
        thread.priority() as usize
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            threads: ThreadSlab::new(),
            per_cpu: CpuLocal::new({
                const INIT: PerCpu = PerCpu::new();
                [INIT; MAX_CORES]
            }),
        }
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    /// The whole system thread slab, for callers outside this module that
    /// need to drive the intrusive-list primitives directly (e.g.
    /// `ipc::wait_queue`'s own waiter list).
    pub fn thread_slab(&self) -> &[Thread; crate::limits::MAX_THREADS] {
        self.threads.slab()
    }

    /// Enqueue `id` onto the tail of its CPU's priority runqueue.
    ///
    /// # Safety invariant
    /// Only the owning CPU (or a caller holding `pc.lock`, which every path
    /// here does) mutates a given `PerCpu`'s runqueues, matching
    /// [`CpuLocal::get_mut`]'s contract.
    fn enqueue(&self, cpu: CpuIndex, id: ThreadId) {
        let level = level_of(self.thread(id).unwrap());
        let slab = self.threads.slab();
        let pc = unsafe { self.per_cpu.get_mut(cpu) };
        let _g = pc.lock.lock();
        pc.runqueues[level].push_back(slab, id as usize);
    }

    fn pop_highest(&self, cpu: CpuIndex) -> Option<ThreadId> {
        let slab = self.threads.slab();
        let pc = unsafe { self.per_cpu.get_mut(cpu) };
        let _g = pc.lock.lock();
        for level in (0..PRIORITY_LEVELS).rev() {
            if let Some(id) = pc.runqueues[level].pop_front(slab) {
                return Some(id as ThreadId);
            }
        }
        None
    }

    /// Pick the highest-priority runnable thread and, if different from the
    /// current active thread, context-switch to it. Returns whether a
    /// switch occurred. Caller must already have preemption disabled; this
    /// function asserts it.
    pub fn schedule(&self, cpu: CpuIndex, cur_ticks: u64) -> bool {
        preempt::assert_disabled();
        let pc = self.per_cpu.get(cpu);
        let current = pc.active.load(Ordering::Acquire);
        let Some(next) = self.pop_highest(cpu) else {
            return false;
        };
        if next == current {
            return false;
        }
        if current != NO_THREAD {
            if let Some(cur_thread) = self.thread(current) {
                if cur_thread.is_runnable() {
                    self.enqueue(cpu, current);
                }
                cur_thread.set_cpu(None);
            }
        }
        let next_thread = self.thread(next).expect("popped thread id always valid");
        next_thread.set_cpu(Some(cpu));
        pc.active.store(next, Ordering::Release);
        pc.reschedule_needed.store(false, Ordering::Release);

        crate::primitives::rcu::quiescent(cpu);

        let prev_ctx = current_thread_context(self, current);
        let next_ctx = next_thread.context.get();
        unsafe {
            <crate::arch::Trampoline as crate::arch::traits::ArchTrampoline>::thread_switch_to(
                prev_ctx, next_ctx, cur_ticks,
            );
        }
        true
    }

    /// Rotate the current thread to the tail of its priority queue, then
    /// schedule.
    pub fn yield_now(&self, cpu: CpuIndex, cur_ticks: u64) -> bool {
        preempt::assert_disabled();
        let pc = self.per_cpu.get(cpu);
        let current = pc.active.load(Ordering::Acquire);
        if current != NO_THREAD {
            if let Some(t) = self.thread(current) {
                if t.is_runnable() {
                    self.enqueue(cpu, current);
                }
            }
        }
        self.schedule(cpu, cur_ticks)
    }

    /// Directed switch to `target`, temporarily donating the caller's
    /// effective priority to avoid priority inversion (spec §4.E
    /// `yield_to`). The caller is responsible for re-blocking itself on a
    /// yield-complete condition around this call; this function only
    /// performs the priority donation and the directed switch.
    pub fn yield_to(&self, cpu: CpuIndex, target: ThreadId, cur_ticks: u64) {
        preempt::assert_disabled();
        let pc = self.per_cpu.get(cpu);
        let current = pc.active.load(Ordering::Acquire);
        let caller_priority = current.ne(&NO_THREAD).then(|| self.thread(current).unwrap().priority());
        if let (Some(p), Some(target_thread)) = (caller_priority, self.thread(target)) {
            target_thread.donate_priority(p);
        }
        // Force the target to the front regardless of strict priority
        // ordering: remove it from wherever it sits and splice it directly
        // into the active slot.
        {
            let slab = self.threads.slab();
            let pc_mut = unsafe { self.per_cpu.get_mut(cpu) };
            let _g = pc_mut.lock.lock();
            for level in 0..PRIORITY_LEVELS {
                pc_mut.runqueues[level].delete(slab, target as usize);
            }
        }
        if current != NO_THREAD {
            self.enqueue(cpu, current);
            self.thread(current).unwrap().set_cpu(None);
        }
        let target_thread = self.thread(target).expect("yield_to target valid");
        target_thread.set_cpu(Some(cpu));
        pc.active.store(target, Ordering::Release);
        crate::primitives::rcu::quiescent(cpu);
        let prev_ctx = current_thread_context(self, current);
        let next_ctx = target_thread.context.get();
        unsafe {
            <crate::arch::Trampoline as crate::arch::traits::ArchTrampoline>::thread_switch_to(
                prev_ctx, next_ctx, cur_ticks,
            );
        }
    }

    pub fn block(&self, id: ThreadId, reason: BlockReason) {
        if let Some(t) = self.thread(id) {
            t.block(reason);
        }
    }

    /// Unblock `id`; if it became runnable, enqueue it at the tail of its
    /// level and return true (caller should `trigger()` or `schedule()` on
    /// the target's CPU).
    pub fn unblock(&self, cpu_of_target: CpuIndex, id: ThreadId, reason: BlockReason) -> bool {
        let Some(t) = self.thread(id) else { return false };
        let became_runnable = t.unblock(reason);
        if became_runnable {
            self.enqueue(cpu_of_target, id);
        }
        became_runnable
    }

    pub fn is_running(&self, id: ThreadId) -> bool {
        self.thread(id).map_or(false, |t| t.is_running())
    }

    pub fn active(&self, cpu: CpuIndex) -> ThreadId {
        self.per_cpu.get(cpu).active.load(Ordering::Acquire)
    }

    /// Post a relaxed reschedule IPI to `cpu` (spec §4.E `trigger()`).
    pub fn trigger(&self, cpu: CpuIndex) {
        self.per_cpu.get(cpu).reschedule_needed.store(true, Ordering::Release);
        ipi::one_relaxed(ipi::Reason::RESCHEDULE, cpu);
    }

    pub fn reschedule_needed(&self, cpu: CpuIndex) -> bool {
        self.per_cpu.get(cpu).reschedule_needed.load(Ordering::Acquire)
    }
}

fn current_thread_context(sched: &Scheduler, current: ThreadId) -> *mut crate::arch::CpuContext {
    if current == NO_THREAD {
        // No previous thread (very first switch on this CPU): scratch
        // context discarded immediately, never read back.
        static DISCARD: core::cell::UnsafeCell<core::mem::MaybeUninit<crate::arch::CpuContext>> =
            core::cell::UnsafeCell::new(core::mem::MaybeUninit::uninit());
        DISCARD.get() as *mut crate::arch::CpuContext
    } else {
        sched.thread(current).unwrap().context.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_picks_enqueued_thread_over_idle() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        sched.enqueue(cpu, 5);
        assert_eq!(sched.active(cpu), NO_THREAD);
        let switched = sched.schedule(cpu, 0);
        assert!(switched);
        assert_eq!(sched.active(cpu), 5);
    }

    #[test]
    fn unblock_reports_whether_a_reschedule_is_warranted() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        sched.thread(7).unwrap().block(BlockReason::VCPU_WFI);
        assert!(!sched.unblock(cpu, 7, BlockReason::WAIT_QUEUE));
        assert!(sched.unblock(cpu, 7, BlockReason::VCPU_WFI));
    }
}
