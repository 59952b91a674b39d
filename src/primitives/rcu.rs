//! RCU grace-period tracking (spec §4.A).
//!
//! `read_start`/`read_finish` never suspend — they just delimit a region in
//! which the reader promises not to block, so the scheduler's quiescent-point
//! calls (context switch, idle entry, return to EL1) are sufficient grace
//! period evidence. The blocking `sync()`/`sync_killable()` wrappers that
//! park a *thread* on a grace period live in [`crate::power::rcu_sync`] (spec
//! §4.H), since they need the scheduler; this module only tracks epochs and
//! queues deferred reclamation callbacks.

use crate::limits::MAX_CORES;
use crate::primitives::cpulocal::CpuIndex;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Monotonic global epoch. Bumped by whoever starts a new grace period.
static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Per-CPU last-observed epoch, updated at every quiescent point.
static OBSERVED: [AtomicU64; MAX_CORES] = {
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; MAX_CORES]
};

/// A deferred-reclamation class tag, grouping callbacks for debugging/trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcuClass {
    ListNode,
    CspaceSlot,
    VgicSource,
    HwirqTable,
    SchedulerActive,
    Generic,
}

/// One deferred callback, queued until the grace period it was enqueued in
/// has fully elapsed.
pub struct RcuEntry {
    pub class: RcuClass,
    target_epoch: u64,
    callback: Option<fn(&RcuEntry)>,
    payload: usize,
    next: AtomicUsize,
}

const NO_NEXT: usize = usize::MAX;

impl RcuEntry {
    pub const fn new(class: RcuClass) -> Self {
        Self {
            class,
            target_epoch: 0,
            callback: None,
            payload: 0,
            next: AtomicUsize::new(NO_NEXT),
        }
    }

    pub fn payload(&self) -> usize {
        self.payload
    }

    pub fn target_epoch(&self) -> u64 {
        self.target_epoch
    }

    pub fn is_due(&self, current_epoch: u64) -> bool {
        current_epoch >= self.target_epoch
    }

    pub fn run(&self) {
        if let Some(cb) = self.callback {
            cb(self);
        }
    }
}

/// Arm `entry` to fire `callback` once the grace period in flight at the
/// moment of this call has fully elapsed, and record `payload` (typically an
/// index or pointer the callback needs) for it to act on.
///
/// Matches the spec's `rcu_enqueue(entry, class)` contract: the entry is the
/// caller's storage (embedded in the object being reclaimed), so this never
/// allocates.
pub fn enqueue(entry: &mut RcuEntry, callback: fn(&RcuEntry), payload: usize) {
    entry.target_epoch = start_grace_period();
    entry.callback = Some(callback);
    entry.payload = payload;
}

/// Begin an RCU read-side critical section. Never suspends.
///
/// Returns an opaque token whose `Drop` calls [`read_finish`] — read
/// sections should be scoped with this guard rather than calling
/// `read_finish` directly, mirroring how `SpinLockGuard` releases its lock.
#[inline]
pub fn read_start() -> ReadGuard {
    ReadGuard { _private: () }
}

pub struct ReadGuard {
    _private: (),
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        // No-op: read sections carry no state of their own. Grace-period
        // detection relies entirely on quiescent points, never on matching
        // start/finish pairs, so readers that never suspend are always safe
        // to nest or overlap.
    }
}

/// Record that the calling CPU has passed a quiescent point (scheduler
/// context switch, idle entry, or return to EL1). Advances that CPU's
/// observed epoch to the current global epoch.
#[inline]
pub fn quiescent(cpu: CpuIndex) {
    let epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
    OBSERVED[cpu.index()].store(epoch, Ordering::Release);
}

/// Start a new grace period and return the epoch a waiter must see every CPU
/// reach before the grace period is complete.
pub fn start_grace_period() -> u64 {
    GLOBAL_EPOCH.fetch_add(1, Ordering::AcqRel) + 1
}

/// True once every online CPU has observed at least `target_epoch`.
pub fn grace_period_complete(target_epoch: u64, online: impl Iterator<Item = CpuIndex>) -> bool {
    online.into_iter().all(|cpu| OBSERVED[cpu.index()].load(Ordering::Acquire) >= target_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_period_needs_every_cpu_to_advance() {
        let cpu0 = CpuIndex::new(0).unwrap();
        let cpu1 = CpuIndex::new(1).unwrap();
        let target = start_grace_period();
        assert!(!grace_period_complete(target, [cpu0, cpu1].into_iter()));
        quiescent(cpu0);
        assert!(!grace_period_complete(target, [cpu0, cpu1].into_iter()));
        quiescent(cpu1);
        assert!(grace_period_complete(target, [cpu0, cpu1].into_iter()));
    }
}
