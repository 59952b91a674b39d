//! Idle threads and `idle_yield()` (spec §4.E "Idle handling", §4.G).
//!
//! Each CPU has an idle thread permanently blocked with `IDLE`; the
//! scheduler only ever picks it when nothing else is runnable, so the idle
//! thread's own loop never needs to re-check the runqueue itself — it just
//! keeps calling `idle_yield` until a handler reports work arrived.

use crate::primitives::cpulocal::CpuIndex;
use crate::sched::ipi;

/// Result of one consultation round with the power/ipi/vcpu handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Nothing pending; go back to sleep (WFI/WFE per `event::wait`).
    Idle,
    /// Something completed without needing a scheduler pass (e.g. a
    /// relaxed IPI was only a wakeup nudge).
    Wakeup,
    /// A runnable thread appeared; the caller should run `schedule()`.
    Reschedule,
}

/// A handler consulted once per `idle_yield` round, in registration order.
/// The first handler to report anything other than `Idle` short-circuits
/// the rest.
pub trait IdleHandler: Sync {
    fn poll(&self, cpu: CpuIndex) -> IdleOutcome;
}

struct IpiIdleHandler;

impl IdleHandler for IpiIdleHandler {
    fn poll(&self, cpu: CpuIndex) -> IdleOutcome {
        let pending = ipi::pending();
        if pending.contains(ipi::Reason::RESCHEDULE) || pending.contains(ipi::Reason::TASK_QUEUE) {
            IdleOutcome::Reschedule
        } else if pending.contains(ipi::Reason::ABORT_STOP) {
            IdleOutcome::Wakeup
        } else {
            let _ = cpu;
            IdleOutcome::Idle
        }
    }
}

const HANDLERS: &[&dyn IdleHandler] = &[&IpiIdleHandler];

/// One round of idle polling: mark the CPU as parked (so a racing
/// `ipi::one_idle` either observes it and skips the physical IPI, or
/// observes the clear and sends one), consult every registered handler, and
/// either return an outcome or park with `event::wait` and loop.
pub fn idle_yield(cpu: CpuIndex) -> IdleOutcome {
    ipi::enter_idle_poll();
    for handler in HANDLERS {
        match handler.poll(cpu) {
            IdleOutcome::Idle => continue,
            other => {
                ipi::exit_idle_poll();
                return other;
            }
        }
    }
    let pending_before = crate::primitives::event::load_before_wait(pending_word());
    if pending_before == 0 {
        crate::primitives::event::wait();
    }
    ipi::exit_idle_poll();
    IdleOutcome::Idle
}

/// Placeholder coherence-domain address the idle loop parks on; in the real
/// platform this is the per-CPU pending-IPI word exposed by
/// [`crate::sched::ipi`]. Kept as a function so the polling address can be
/// swapped without touching callers.
fn pending_word() -> &'static core::sync::atomic::AtomicU32 {
    static DUMMY: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);
    &DUMMY
}

/// Runs on a CPU's idle thread: loop `idle_yield` until it reports
/// something other than `Idle`.
pub fn run_until_woken(cpu: CpuIndex) -> IdleOutcome {
    loop {
        match idle_yield(cpu) {
            IdleOutcome::Idle => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reschedule_ipi_short_circuits_idle_yield() {
        let cpu = CpuIndex::current();
        ipi::one_relaxed(ipi::Reason::RESCHEDULE, cpu);
        assert_eq!(idle_yield(cpu), IdleOutcome::Reschedule);
        ipi::handle_relaxed();
    }
}
