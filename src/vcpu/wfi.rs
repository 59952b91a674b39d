//! WFI trap fastpath and `wakeup`/`pending_wakeup` (spec §4.I).

use crate::primitives::cpulocal::CpuIndex;
use crate::sched::idle::{idle_yield, IdleOutcome};
use crate::sched::thread::{BlockReason, Thread, ThreadId};
use crate::sched::Scheduler;
use core::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfiOutcome {
    /// The guest should resume immediately; it never actually blocked.
    ResumedInline,
    /// The VCPU blocked with `VCPU_WFI` and a reschedule was attempted.
    Blocked,
}

/// Consulted around the idle-polling loop (spec: "block_start handlers" /
/// "block_finish" / "wakeup handlers" / a handler-reported pending wakeup).
/// Default no-op methods, mirroring [`crate::sched::idle::IdleHandler`]'s
/// empty-by-default registration.
pub trait WfiHandler: Sync {
    fn block_start(&self, _thread: &Thread) {}
    fn block_finish(&self, _thread: &Thread) {}
    fn on_wakeup(&self, _thread: &Thread) {}
    fn pending(&self, _thread: &Thread) -> bool {
        false
    }
}

const HANDLERS: &[&dyn WfiHandler] = &[];

pub fn pending_wakeup(thread: &Thread) -> bool {
    thread.interrupted.load(Ordering::Acquire) || HANDLERS.iter().any(|h| h.pending(thread))
}

/// Handle a trapped WFI. If the CPU can idle and no wakeup is already
/// pending, spins on `idle_yield` until either the idle condition drops or
/// the thread is interrupted; only then actually blocks with `VCPU_WFI` and
/// reschedules. `can_idle` is re-evaluated every iteration since it reflects
/// live arch state (pending timer deadline, maintenance interrupt, …).
pub fn wfi_trap(
    scheduler: &Scheduler,
    cpu: CpuIndex,
    thread_id: ThreadId,
    cur_ticks: u64,
    can_idle: impl Fn() -> bool,
) -> WfiOutcome {
    let thread = scheduler.thread(thread_id).expect("wfi_trap target thread must exist");
    if !can_idle() || pending_wakeup(thread) {
        return WfiOutcome::ResumedInline;
    }
    for h in HANDLERS {
        h.block_start(thread);
    }
    while can_idle() && !thread.interrupted.load(Ordering::Acquire) {
        match idle_yield(cpu) {
            IdleOutcome::Idle => continue,
            _ => break,
        }
    }
    for h in HANDLERS {
        h.block_finish(thread);
    }
    if thread.interrupted.swap(false, Ordering::AcqRel) {
        return WfiOutcome::ResumedInline;
    }
    thread.block(BlockReason::VCPU_WFI);
    scheduler.schedule(cpu, cur_ticks);
    WfiOutcome::Blocked
}

/// Wake a VCPU parked in the WFI fastpath (or mark the wakeup so a
/// concurrent fastpath entry sees it before blocking). Returns whether a
/// reschedule was warranted.
pub fn wakeup(scheduler: &Scheduler, cpu_of_target: CpuIndex, thread_id: ThreadId) -> bool {
    let Some(thread) = scheduler.thread(thread_id) else { return false };
    thread.interrupted.store(true, Ordering::Release);
    for h in HANDLERS {
        h.on_wakeup(thread);
    }
    let became_runnable = scheduler.unblock(cpu_of_target, thread_id, BlockReason::VCPU_WFI);
    if became_runnable {
        scheduler.trigger(cpu_of_target);
    }
    became_runnable
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn resumes_inline_when_the_cpu_cannot_idle() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        assert_eq!(wfi_trap(&sched, cpu, 1, 0, || false), WfiOutcome::ResumedInline);
        assert!(sched.thread(1).unwrap().is_runnable());
    }

    #[test]
    fn resumes_inline_when_a_wakeup_is_already_pending() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        sched.thread(2).unwrap().interrupted.store(true, Ordering::Release);
        assert_eq!(wfi_trap(&sched, cpu, 2, 0, || true), WfiOutcome::ResumedInline);
    }

    #[test]
    fn blocks_once_idle_condition_drops_without_a_wakeup() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        let rounds = Cell::new(0);
        let outcome = wfi_trap(&sched, cpu, 3, 0, || {
            rounds.set(rounds.get() + 1);
            rounds.get() <= 2
        });
        assert_eq!(outcome, WfiOutcome::Blocked);
        assert!(sched.thread(3).unwrap().block_bits().contains(BlockReason::VCPU_WFI));
    }

    #[test]
    fn wakeup_clears_the_block_and_reports_reschedule_needed() {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        sched.thread(4).unwrap().block(BlockReason::VCPU_WFI);
        assert!(wakeup(&sched, cpu, 4));
        assert!(sched.thread(4).unwrap().is_runnable());
    }
}
