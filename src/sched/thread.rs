//! Thread object (spec §3 "Thread", §4.E).
//!
//! A thread is either a VCPU or a kernel service thread (idle, test,
//! sched-test); both share this struct, differing only in `kind` and which
//! optional fields (`addrspace`, vgic state) are populated. Threads live in
//! a static per-system slab and are referenced by [`ThreadId`] rather than
//! `Arc`, keeping the allocation-free style of the rest of the core (spec §9
//! suggests `Arc<Thread>`; see DESIGN.md for why an index is used instead).

use crate::arch::CpuContext;
use crate::limits::MAX_THREADS;
use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::cpulocal::CpuIndex;
use crate::primitives::list::ListLink;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const INVALID_CPU: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadKind {
    Vcpu,
    Idle,
    Kernel,
}

bitflags::bitflags! {
    /// Block-reason bitmap (spec §4.E). A thread is runnable iff this is
    /// empty; multiple reasons may be set at once (e.g. VCPU_RUN alongside
    /// ADDRSPACE_VMMIO_ACCESS during proxy scheduling).
    pub struct BlockReason: u32 {
        const IDLE                     = 1 << 0;
        const VCPU_OFF                 = 1 << 1;
        const VCPU_SUSPEND             = 1 << 2;
        const VCPU_WFI                 = 1 << 3;
        const WAIT_QUEUE               = 1 << 4;
        const RCU_SYNC                 = 1 << 5;
        const ADDRSPACE_VMMIO_ACCESS   = 1 << 6;
        const VCPU_RUN                 = 1 << 7;
        const VCPU_FAULT               = 1 << 8;
        const THREAD_LIFECYCLE         = 1 << 9;
        const TEST                     = 1 << 10;
    }
}

pub type ThreadId = u32;
pub const NO_THREAD: ThreadId = ThreadId::MAX;

/// A thread's place in its CPU's per-priority runqueue FIFO.
pub struct RunqueueLink {
    pub link: ListLink,
}

impl crate::primitives::list::Linked for Thread {
    fn link(&self) -> &ListLink {
        &self.runq.link
    }
}

pub struct Thread {
    pub header: Header,
    pub id: ThreadId,
    pub kind: ThreadKind,

    /// `INVALID_CPU` while not actively running anywhere. Only the CPU
    /// currently running the thread may set this to its own index; the
    /// previous CPU's clearing of its own `active` slot and this store
    /// happen in the same context-switch critical section (spec §3
    /// invariant: a thread never observes itself with `cpu==INVALID` while
    /// `scheduler::is_running` is true for it).
    cpu: AtomicU32,
    /// `INVALID_CPU` means migratable.
    affinity: AtomicU32,
    pinned_count: AtomicU32,

    priority: AtomicU8,
    /// Priority temporarily donated by `yield_to`; `None` (encoded as
    /// `u8::MAX`) when no donation is active.
    donated_priority: AtomicU8,
    timeslice_ticks: AtomicU64,

    block_bits: AtomicU32,
    dying: AtomicBool,

    pub runq: RunqueueLink,

    /// Opaque register save area. Accessed only while the thread is not
    /// running, under the owning CPU's scheduler lock.
    pub context: core::cell::UnsafeCell<CpuContext>,

    /// Index into `mem::addrspace`'s slab, for VCPU threads. `NO_ADDRSPACE`
    /// while unattached. Atomic (rather than the plain `Option<u32>` most of
    /// this struct's scalar config started as) so `object::hypercall`'s
    /// `addrspace_attach_thread` can bind it through a shared `&Thread`.
    addrspace: AtomicU32,
    /// Index into `vgic::vic`'s per-VCPU state, for VCPU threads.
    vgic_index: AtomicU32,

    pub interrupted: AtomicBool,

    /// Requested guest resume point (spec §4.I `poweron`/`warm_reset`: "sets
    /// PC=entry and x0=ctx"). A plain scalar pair, not a byte-level register
    /// layout; the arch trap-return path reads this when it next actually
    /// enters the guest.
    entry_pc: AtomicU64,
    entry_ctx: AtomicU64,

    /// Set by the (arch-specific, out of scope here) address-space trap
    /// handler before blocking a proxy-scheduled VCPU with
    /// `ADDRSPACE_VMMIO_ACCESS`, so `vcpu::run` can report which of
    /// `ADDRSPACE_VMMIO_READ`/`WRITE` applies without re-decoding the fault.
    vmmio_pending: AtomicBool,
    vmmio_is_write: AtomicBool,
    /// Faulting IPA/access size recorded alongside `vmmio_pending`, read
    /// back by `vcpu::run` to fill in `RunState::AddrspaceVmmio{Read,Write}`.
    vmmio_ipa: AtomicU64,
    vmmio_size: AtomicU64,

    /// Proxy `vcpu_run` mode (spec §4.I): while enabled, this VCPU is kept
    /// blocked with `VCPU_RUN` between external `vcpu_run` calls and power
    /// voting is skipped for it.
    run_enabled: AtomicBool,
    /// Index into `ipc::doorbell`'s slab this VCPU rings to tell its proxy
    /// owner a reschedule is warranted. `NO_DOORBELL` if unbound.
    run_doorbell: AtomicU32,
    /// Value an external `vcpu_run` caller supplies on resume, read by the
    /// (out of scope) trap-return path to populate the faulting GPR.
    resume_value: AtomicU64,

    /// Index into `object::cspace`'s slab this thread looks capability
    /// arguments up against (spec §4.C `cspace attach_thread`).
    cspace: AtomicU32,
}

pub const NO_DOORBELL: u32 = u32::MAX;
pub const NO_SLOT: u32 = u32::MAX;

unsafe impl Sync for Thread {}

impl Thread {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::Thread),
            id: 0,
            kind: ThreadKind::Kernel,
            cpu: AtomicU32::new(INVALID_CPU),
            affinity: AtomicU32::new(INVALID_CPU),
            pinned_count: AtomicU32::new(0),
            priority: AtomicU8::new(crate::limits::PRIORITY_IDLE),
            donated_priority: AtomicU8::new(u8::MAX),
            timeslice_ticks: AtomicU64::new(0),
            block_bits: AtomicU32::new(0),
            dying: AtomicBool::new(false),
            runq: RunqueueLink { link: ListLink::new() },
            context: core::cell::UnsafeCell::new(CpuContext::new()),
            addrspace: AtomicU32::new(NO_SLOT),
            vgic_index: AtomicU32::new(NO_SLOT),
            interrupted: AtomicBool::new(false),
            entry_pc: AtomicU64::new(0),
            entry_ctx: AtomicU64::new(0),
            vmmio_pending: AtomicBool::new(false),
            vmmio_is_write: AtomicBool::new(false),
            vmmio_ipa: AtomicU64::new(0),
            vmmio_size: AtomicU64::new(0),
            run_enabled: AtomicBool::new(false),
            run_doorbell: AtomicU32::new(NO_DOORBELL),
            resume_value: AtomicU64::new(0),
            cspace: AtomicU32::new(NO_SLOT),
        }
    }

    pub fn set_run_enabled(&self, enabled: bool) {
        self.run_enabled.store(enabled, Ordering::Release);
    }

    pub fn run_enabled(&self) -> bool {
        self.run_enabled.load(Ordering::Acquire)
    }

    pub fn bind_run_doorbell(&self, doorbell_index: u32) {
        self.run_doorbell.store(doorbell_index, Ordering::Release);
    }

    pub fn run_doorbell(&self) -> Option<u32> {
        let v = self.run_doorbell.load(Ordering::Acquire);
        (v != NO_DOORBELL).then_some(v)
    }

    /// Record the PC/x0 pair the guest should resume at next time it is
    /// actually entered (spec §4.I).
    pub fn set_entry(&self, pc: u64, ctx: u64) {
        self.entry_pc.store(pc, Ordering::Release);
        self.entry_ctx.store(ctx, Ordering::Release);
    }

    pub fn entry(&self) -> (u64, u64) {
        (self.entry_pc.load(Ordering::Acquire), self.entry_ctx.load(Ordering::Acquire))
    }

    /// Record that this VCPU trapped into an emulated MMIO access and is
    /// about to block with `ADDRSPACE_VMMIO_ACCESS`, for `vcpu::run` to
    /// report back to the proxy-scheduling caller.
    pub fn set_vmmio_pending(&self, is_write: bool) {
        self.vmmio_is_write.store(is_write, Ordering::Release);
        self.vmmio_pending.store(true, Ordering::Release);
    }

    /// Consume (clear) a pending MMIO marker, returning whether it was a
    /// write access. `None` if no MMIO access was pending.
    pub fn take_vmmio_pending(&self) -> Option<bool> {
        if self.vmmio_pending.swap(false, Ordering::AcqRel) {
            Some(self.vmmio_is_write.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Record the faulting IPA/size alongside `set_vmmio_pending`.
    pub fn set_vmmio_fault_info(&self, ipa: u64, size: u64) {
        self.vmmio_ipa.store(ipa, Ordering::Release);
        self.vmmio_size.store(size, Ordering::Release);
    }

    pub fn vmmio_fault_info(&self) -> (u64, u64) {
        (self.vmmio_ipa.load(Ordering::Acquire), self.vmmio_size.load(Ordering::Acquire))
    }

    /// Record the value an external `vcpu_run` caller supplies on resume
    /// (spec §4.I scenario 5: "V unblocks, its GPR is populated with
    /// `value`"). The arch-specific GPR placement is out of scope; this
    /// just holds the value for that (external) trap-return path to read.
    pub fn set_resume_value(&self, value: u64) {
        self.resume_value.store(value, Ordering::Release);
    }

    pub fn resume_value(&self) -> u64 {
        self.resume_value.load(Ordering::Acquire)
    }

    pub fn cpu(&self) -> Option<CpuIndex> {
        let raw = self.cpu.load(Ordering::Acquire);
        (raw != INVALID_CPU).then(|| CpuIndex::new(raw as u8).expect("thread cpu field always valid or INVALID"))
    }

    pub fn set_cpu(&self, cpu: Option<CpuIndex>) {
        let raw = cpu.map_or(INVALID_CPU, |c| c.index() as u32);
        self.cpu.store(raw, Ordering::Release);
    }

    pub fn affinity(&self) -> Option<CpuIndex> {
        let raw = self.affinity.load(Ordering::Acquire);
        (raw != INVALID_CPU).then(|| CpuIndex::new(raw as u8).unwrap())
    }

    /// `set_affinity` per spec §4.E: only effective if migratable (not
    /// pinned). Returns `Busy` if pinned.
    pub fn set_affinity(&self, target: Option<CpuIndex>) -> crate::error::HypResult<()> {
        if self.pinned_count.load(Ordering::Acquire) != 0 {
            return Err(crate::error::HypError::Busy);
        }
        let raw = target.map_or(INVALID_CPU, |c| c.index() as u32);
        self.affinity.store(raw, Ordering::Release);
        Ok(())
    }

    pub fn pin(&self) {
        self.pinned_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pinned_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn priority(&self) -> u8 {
        let donated = self.donated_priority.load(Ordering::Acquire);
        let base = self.priority.load(Ordering::Acquire);
        if donated == u8::MAX {
            base
        } else {
            donated.max(base)
        }
    }

    pub fn set_base_priority(&self, p: u8) {
        self.priority.store(p, Ordering::Release);
    }

    pub fn donate_priority(&self, p: u8) {
        self.donated_priority.store(p, Ordering::Release);
    }

    pub fn clear_donated_priority(&self) {
        self.donated_priority.store(u8::MAX, Ordering::Release);
    }

    pub fn timeslice_ticks(&self) -> u64 {
        self.timeslice_ticks.load(Ordering::Relaxed)
    }

    pub fn set_timeslice_ticks(&self, ticks: u64) {
        self.timeslice_ticks.store(ticks, Ordering::Relaxed);
    }

    pub fn block_bits(&self) -> BlockReason {
        BlockReason::from_bits_truncate(self.block_bits.load(Ordering::Acquire))
    }

    /// Sets `reason`; returns true if this made the thread blocked where it
    /// was previously runnable (release-ordered, per spec §5
    /// "scheduler_unblock is a release... schedule after a block is
    /// acquire-ordered").
    pub fn block(&self, reason: BlockReason) -> bool {
        let prev = self.block_bits.fetch_or(reason.bits(), Ordering::AcqRel);
        prev == 0
    }

    /// Clears `reason`; returns true if the thread is now fully runnable
    /// (no reason bits remain), meaning a reschedule may be warranted on
    /// its CPU.
    pub fn unblock(&self, reason: BlockReason) -> bool {
        let prev = self.block_bits.fetch_and(!reason.bits(), Ordering::AcqRel);
        (prev & !reason.bits()) == 0 && (prev & reason.bits()) != 0
    }

    pub fn is_blocked(&self) -> bool {
        self.block_bits.load(Ordering::Acquire) != 0
    }

    pub fn is_runnable(&self) -> bool {
        !self.is_blocked()
    }

    pub fn is_running(&self) -> bool {
        self.cpu().is_some()
    }

    /// Bind this thread's addrspace (spec §6 hypercall `addrspace
    /// attach_thread`). Only meaningful for VCPU threads.
    pub fn set_addrspace(&self, index: u32) {
        self.addrspace.store(index, Ordering::Release);
    }

    pub fn addrspace(&self) -> Option<u32> {
        let v = self.addrspace.load(Ordering::Acquire);
        (v != NO_SLOT).then_some(v)
    }

    pub fn set_vgic_index(&self, index: u32) {
        self.vgic_index.store(index, Ordering::Release);
    }

    pub fn vgic_index(&self) -> Option<u32> {
        let v = self.vgic_index.load(Ordering::Acquire);
        (v != NO_SLOT).then_some(v)
    }

    pub fn set_cspace(&self, index: u32) {
        self.cspace.store(index, Ordering::Release);
    }

    pub fn cspace(&self) -> Option<u32> {
        let v = self.cspace.load(Ordering::Acquire);
        (v != NO_SLOT).then_some(v)
    }

    pub fn mark_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }
}

/// Static system-wide thread slab. Index 0 is never a valid thread (used as
/// a "no thread" sentinel distinct from [`NO_THREAD`]'s `u32::MAX` so a
/// zeroed `ThreadId` field is also visibly invalid).
pub struct ThreadSlab {
    threads: [Thread; MAX_THREADS],
}

impl ThreadSlab {
    pub const fn new() -> Self {
        const T: Thread = Thread::new_uninit();
        Self { threads: [T; MAX_THREADS] }
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id as usize)
    }

    /// The whole slab as a contiguous slice, for intrusive-list operations
    /// that index by `ThreadId` (see [`crate::sched::scheduler`]).
    pub fn slab(&self) -> &[Thread; MAX_THREADS] {
        &self.threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_unblock_report_transition_edges() {
        let t = Thread::new_uninit();
        assert!(t.is_runnable());
        assert!(t.block(BlockReason::VCPU_WFI));
        assert!(!t.is_runnable());
        // A second, different reason while already blocked: not a fresh
        // transition into blocked.
        assert!(!t.block(BlockReason::WAIT_QUEUE));
        assert!(!t.unblock(BlockReason::VCPU_WFI));
        assert!(t.unblock(BlockReason::WAIT_QUEUE));
        assert!(t.is_runnable());
    }

    #[test]
    fn donated_priority_wins_only_when_higher() {
        let t = Thread::new_uninit();
        t.set_base_priority(5);
        assert_eq!(t.priority(), 5);
        t.donate_priority(10);
        assert_eq!(t.priority(), 10);
        t.donate_priority(2);
        assert_eq!(t.priority(), 5);
        t.clear_donated_priority();
        assert_eq!(t.priority(), 5);
    }

    #[test]
    fn pinned_thread_rejects_affinity_change() {
        let t = Thread::new_uninit();
        t.pin();
        assert_eq!(
            t.set_affinity(Some(CpuIndex::new(1).unwrap())),
            Err(crate::error::HypError::Busy)
        );
        t.unpin();
        assert!(t.set_affinity(Some(CpuIndex::new(1).unwrap())).is_ok());
    }

    #[test]
    fn entry_defaults_to_zero_and_round_trips() {
        let t = Thread::new_uninit();
        assert_eq!(t.entry(), (0, 0));
        t.set_entry(0x4000_0000, 42);
        assert_eq!(t.entry(), (0x4000_0000, 42));
    }

    #[test]
    fn addrspace_vgic_and_cspace_bindings_round_trip() {
        let t = Thread::new_uninit();
        assert_eq!(t.addrspace(), None);
        assert_eq!(t.vgic_index(), None);
        assert_eq!(t.cspace(), None);
        t.set_addrspace(3);
        t.set_vgic_index(1);
        t.set_cspace(0);
        assert_eq!(t.addrspace(), Some(3));
        assert_eq!(t.vgic_index(), Some(1));
        assert_eq!(t.cspace(), Some(0));
    }

    #[test]
    fn vmmio_pending_is_consumed_once() {
        let t = Thread::new_uninit();
        assert_eq!(t.take_vmmio_pending(), None);
        t.set_vmmio_pending(true);
        assert_eq!(t.take_vmmio_pending(), Some(true));
        assert_eq!(t.take_vmmio_pending(), None);
    }
}
