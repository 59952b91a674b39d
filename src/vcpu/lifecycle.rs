//! `poweron`/`poweroff`/`warm_reset` (spec §4.I).
//!
//! Power voting piggybacks on [`crate::power::Power`]: a VCPU's "on" state is
//! just one more reason its affinity CPU must stay powered, so `poweron`
//! casts a vote and `poweroff` releases it, exactly like any other keepalive
//! vote `Power` already tracks.

use crate::error::{HypError, HypResult};
use crate::power::Power;
use crate::primitives::cpulocal::CpuIndex;
use crate::sched::thread::{BlockReason, Thread, ThreadId};
use crate::sched::Scheduler;

/// Consulted by `poweroff` before a VCPU blocks itself (spec: "runs poweroff
/// handlers (may veto)"). Mirrors [`crate::sched::idle::IdleHandler`]'s
/// registration-order consultation; empty by default since this crate has no
/// handlers that need to veto a poweroff yet.
pub trait PoweroffHandler: Sync {
    fn veto(&self, thread: &Thread) -> bool;
}

const HANDLERS: &[&dyn PoweroffHandler] = &[];

fn any_handler_vetoes(thread: &Thread) -> bool {
    HANDLERS.iter().any(|h| h.veto(thread))
}

/// May only be called while `VCPU_OFF` is set. Clears the block, records the
/// resume PC/x0, and votes the VCPU's affinity CPU on. Returns whether a
/// reschedule is warranted on that CPU.
pub fn poweron(scheduler: &Scheduler, power: &Power, thread_id: ThreadId, entry: u64, ctx: u64) -> HypResult<bool> {
    let thread = scheduler.thread(thread_id).ok_or(HypError::ArgumentInvalid)?;
    if !thread.block_bits().contains(BlockReason::VCPU_OFF) {
        return Err(HypError::ObjectState);
    }
    thread.set_entry(entry, ctx);
    let target_cpu = thread.affinity().unwrap_or_else(CpuIndex::current);
    power.vote_cpu_on(target_cpu)?;
    Ok(scheduler.unblock(target_cpu, thread_id, BlockReason::VCPU_OFF))
}

/// Self-operation: the calling VCPU powers itself off. Runs poweroff
/// handlers (any veto fails the call with `Denied`), then blocks with
/// `VCPU_OFF`, releases its power vote, and yields. When next `poweron`'d it
/// resumes at the newly recorded entry/ctx.
pub fn poweroff(scheduler: &Scheduler, power: &Power, cpu: CpuIndex, thread_id: ThreadId, cur_ticks: u64) -> HypResult<()> {
    let thread = scheduler.thread(thread_id).ok_or(HypError::ArgumentInvalid)?;
    if any_handler_vetoes(thread) {
        return Err(HypError::Denied);
    }
    thread.block(BlockReason::VCPU_OFF);
    power.vote_cpu_off(cpu);
    scheduler.yield_now(cpu, cur_ticks);
    Ok(())
}

/// Resets the VCPU's EL1 architectural state (arch-specific, out of scope
/// here) and records a new resume entry/ctx. The actual non-returning jump
/// happens in the arch trap-return path the next time this thread is
/// entered; this just updates the state it reads.
pub fn warm_reset(scheduler: &Scheduler, thread_id: ThreadId, entry: u64, ctx: u64) -> HypResult<()> {
    let thread = scheduler.thread(thread_id).ok_or(HypError::ArgumentInvalid)?;
    thread.set_entry(entry, ctx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::NO_THREAD;

    fn boot_scheduler() -> (Scheduler, Power, CpuIndex) {
        let sched = Scheduler::new();
        let power = Power::new();
        let cpu = CpuIndex::new(0).unwrap();
        power.handle_boot_cold_init(cpu);
        (sched, power, cpu)
    }

    #[test]
    fn poweron_requires_vcpu_off_and_clears_it() {
        let (sched, power, cpu) = boot_scheduler();
        let t = sched.thread(3).unwrap();
        assert_eq!(poweron(&sched, &power, 3, 0x1000, 7), Err(HypError::ObjectState));
        t.block(BlockReason::VCPU_OFF);
        t.set_affinity(Some(cpu)).unwrap();
        assert!(poweron(&sched, &power, 3, 0x1000, 7).unwrap());
        assert!(t.is_runnable());
        assert_eq!(t.entry(), (0x1000, 7));
    }

    #[test]
    fn poweroff_blocks_self_and_releases_the_power_vote() {
        let (sched, power, cpu) = boot_scheduler();
        let t = sched.thread(4).unwrap();
        t.set_affinity(Some(cpu)).unwrap();
        power.vote_cpu_on(cpu).unwrap();
        let before = power.vote_count(cpu);
        poweroff(&sched, &power, cpu, 4, 0).unwrap();
        assert!(t.block_bits().contains(BlockReason::VCPU_OFF));
        assert_eq!(power.vote_count(cpu), before - 1);
        let _ = NO_THREAD;
    }

    #[test]
    fn warm_reset_records_new_entry_without_touching_block_state() {
        let (sched, _power, _cpu) = boot_scheduler();
        let t = sched.thread(5).unwrap();
        t.block(BlockReason::VCPU_WFI);
        warm_reset(&sched, 5, 0x2000, 99).unwrap();
        assert_eq!(t.entry(), (0x2000, 99));
        assert!(t.block_bits().contains(BlockReason::VCPU_WFI));
    }
}
