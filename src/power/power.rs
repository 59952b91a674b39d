//! Per-CPU power votes and system suspend/resume orchestration (spec §4.H).
//!
//! Grounded directly on the reference power-management core: every CPU
//! carries a vote count (the number of outstanding reasons it must stay
//! powered on) and a coarse state machine; the system as a whole is
//! "suspended" exactly when every CPU's online bit has been cleared, and
//! "resumed" the instant the first CPU sets its bit again. The boot CPU's
//! vote count starts at 1 so early bring-up can't race a premature suspend
//! before the root VM has cast its own vote.

use crate::error::{HypError, HypResult};
use crate::power::timer::{TimerAction, TimerQueue};
use crate::primitives::cpulocal::{CpuIndex, CpuLocal};
use crate::primitives::spinlock::{SpinLock, SpinLockGuard};
use crate::sched::idle::IdleOutcome;

const POWER_CPU_ON_RETRY_DELAY_NS: u64 = 10_000_000;
const MAX_CPU_ON_RETRIES: u32 = 10;
const RETRY_TIMER_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPowerState {
    Off,
    Started,
    Online,
    Suspend,
    Offline,
    ColdBoot,
}

struct Voting {
    vote_count: u32,
    retry_count: u32,
    state: CpuPowerState,
}

pub struct Power {
    voting: CpuLocal<SpinLock<Voting>>,
    online_cpus: SpinLock<u64>,
    suspend_state: SpinLock<u32>,
    retry_delay_ticks: core::sync::atomic::AtomicU64,
    timers: TimerQueue,
}

/// Outcome of a warm-boot event the caller should act on (spec: the real
/// core fires `power_cpu_online`/`power_system_resume` hooks here; this
/// crate has no event-handler registry, so the caller inspects these flags
/// directly instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmInitOutcome {
    pub cpu_came_online_from_started: bool,
    pub system_resumed: bool,
}

impl Power {
    pub const fn new() -> Self {
        const INIT: Voting = Voting { vote_count: 0, retry_count: 0, state: CpuPowerState::Off };
        Self {
            voting: CpuLocal::new({
                const LOCK: SpinLock<Voting> = SpinLock::new(INIT);
                [LOCK; crate::limits::MAX_CORES]
            }),
            online_cpus: SpinLock::new(0),
            suspend_state: SpinLock::new(0),
            retry_delay_ticks: core::sync::atomic::AtomicU64::new(0),
            timers: TimerQueue::new(),
        }
    }

    fn voting(&self, cpu: CpuIndex) -> SpinLockGuard<'_, Voting> {
        self.voting.get(cpu).lock()
    }

    pub fn handle_boot_cold_init(&self, boot_cpu: CpuIndex) {
        self.retry_delay_ticks.store(
            crate::platform::convert_ns_to_ticks(POWER_CPU_ON_RETRY_DELAY_NS).max(1),
            core::sync::atomic::Ordering::Relaxed,
        );
        for cpu in CpuIndex::all() {
            let mut v = self.voting(cpu);
            v.retry_count = 0;
            v.vote_count = if cpu == boot_cpu { 1 } else { 0 };
            v.state = if cpu == boot_cpu { CpuPowerState::ColdBoot } else { CpuPowerState::Off };
        }
        *self.online_cpus.lock() = 1 << boot_cpu.index();
    }

    /// Per-CPU warm-boot entry (every CPU_ON target runs this once live).
    pub fn handle_boot_cpu_warm_init(&self, cpu: CpuIndex) -> WarmInitOutcome {
        let mut v = self.voting(cpu);
        debug_assert!(matches!(v.state, CpuPowerState::ColdBoot | CpuPowerState::Started | CpuPowerState::Suspend));
        let came_from_started = v.state == CpuPowerState::Started;
        v.state = CpuPowerState::Online;
        drop(v);

        let mut online = self.online_cpus.lock();
        let system_resumed = *online == 0;
        *online |= 1 << cpu.index();
        WarmInitOutcome { cpu_came_online_from_started: came_from_started, system_resumed }
    }

    fn try_cpu_on(&self, voting: &mut Voting, cpu: CpuIndex) -> HypResult<()> {
        if !crate::platform::cpu_exists(cpu) {
            return Err(HypError::ArgumentInvalid);
        }
        if !matches!(voting.state, CpuPowerState::Off | CpuPowerState::Offline) {
            return Ok(());
        }
        match crate::platform::cpu_on(cpu, 0, 0) {
            Ok(()) => {
                voting.state = CpuPowerState::Started;
                voting.retry_count = 0;
                Ok(())
            }
            Err(HypError::Retry) if voting.retry_count < MAX_CPU_ON_RETRIES => {
                if !self.timers.is_queued(cpu, RETRY_TIMER_SLOT) {
                    let deadline = crate::platform::timer_get_current_ticks()
                        + self.retry_delay_ticks.load(core::sync::atomic::Ordering::Relaxed);
                    self.timers.enqueue(cpu, RETRY_TIMER_SLOT, deadline, TimerAction::PowerCpuOnRetry);
                }
                // We raced a power-off in progress; the retry will
                // eventually succeed, so report success optimistically
                // (mirrors the reference core's handling of this race).
                Ok(())
            }
            Err(HypError::Retry) => Err(HypError::Failure),
            Err(e) => Err(e),
        }
    }

    /// Cast a vote to keep `cpu` powered on, starting it if this is the
    /// first vote.
    pub fn vote_cpu_on(&self, cpu: CpuIndex) -> HypResult<()> {
        let mut v = self.voting(cpu);
        if v.vote_count == 0 {
            self.try_cpu_on(&mut v, cpu)?;
        }
        v.vote_count += 1;
        Ok(())
    }

    /// Release a vote. Once the count reaches zero, a later idle poll on
    /// `cpu` is free to actually power it off; wake it so it notices.
    pub fn vote_cpu_off(&self, cpu: CpuIndex) {
        let mut v = self.voting(cpu);
        debug_assert!(v.vote_count > 0);
        v.vote_count -= 1;
        if v.vote_count == 0 {
            v.retry_count = 0;
            self.timers.dequeue(cpu, RETRY_TIMER_SLOT);
            crate::sched::ipi::one_relaxed(crate::sched::ipi::Reason::IDLE, cpu);
        }
    }

    /// Drive a retry timer that fired for `cpu` (spec `power_handle_timer_action`).
    pub fn handle_retry_timer(&self, cpu: CpuIndex) -> HypResult<()> {
        let mut v = self.voting(cpu);
        if v.vote_count > 0 {
            v.retry_count += 1;
            self.try_cpu_on(&mut v, cpu)?;
        }
        Ok(())
    }

    pub fn poll_timers(&self, cpu: CpuIndex, now: u64) {
        while let Some((_, TimerAction::PowerCpuOnRetry)) = self.timers.pop_due(cpu, now) {
            let _ = self.handle_retry_timer(cpu);
        }
    }

    /// The idle-loop hook (spec `power_handle_idle_yield`): if this CPU's
    /// vote count has dropped to zero and no RCU grace period is in
    /// progress, clear its online bit, suspend the system if it was the
    /// last one, and physically power the CPU off.
    pub fn handle_idle_yield(&self, cpu: CpuIndex, in_idle_thread: bool, rcu_pending: bool) -> IdleOutcome {
        if !in_idle_thread || rcu_pending {
            return IdleOutcome::Idle;
        }
        let mut v = self.voting(cpu);
        if v.vote_count != 0 {
            return IdleOutcome::Idle;
        }
        let mut online = self.online_cpus.lock();
        *online &= !(1 << cpu.index());
        if *online == 0 {
            *self.suspend_state.lock() = 0;
        }
        debug_assert_eq!(v.state, CpuPowerState::Online);
        v.state = CpuPowerState::Offline;
        drop(online);
        drop(v);
        crate::platform::cpu_off();
        IdleOutcome::Wakeup
    }

    pub fn online_cpus(&self) -> impl Iterator<Item = CpuIndex> + Clone {
        let mask = *self.online_cpus.lock();
        CpuIndex::all().filter(move |c| mask & (1 << c.index()) != 0)
    }

    pub fn state_of(&self, cpu: CpuIndex) -> CpuPowerState {
        self.voting(cpu).state
    }

    pub fn vote_count(&self, cpu: CpuIndex) -> u32 {
        self.voting(cpu).vote_count
    }
}

impl Default for Power {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_cpu_starts_with_a_keepalive_vote() {
        let power = Power::new();
        let boot = CpuIndex::new(0).unwrap();
        power.handle_boot_cold_init(boot);
        assert_eq!(power.vote_count(boot), 1);
        assert_eq!(power.state_of(boot), CpuPowerState::ColdBoot);
        assert_eq!(power.online_cpus().count(), 1);
    }

    #[test]
    fn vote_on_then_off_round_trips_and_wakes_idle() {
        let power = Power::new();
        let boot = CpuIndex::new(0).unwrap();
        let other = CpuIndex::new(1).unwrap();
        power.handle_boot_cold_init(boot);
        power.vote_cpu_on(other).unwrap();
        assert_eq!(power.state_of(other), CpuPowerState::Started);
        assert_eq!(power.vote_count(other), 1);
        power.vote_cpu_off(other);
        assert_eq!(power.vote_count(other), 0);
    }

    #[test]
    fn idle_yield_is_noop_while_votes_remain() {
        let power = Power::new();
        let boot = CpuIndex::new(0).unwrap();
        power.handle_boot_cold_init(boot);
        assert_eq!(power.handle_idle_yield(boot, true, false), IdleOutcome::Idle);
    }
}
