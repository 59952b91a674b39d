//! Global kernel state: the static slabs and subsystems every hypercall
//! resolves capabilities and object indices against.
//!
//! The rest of the crate deliberately keeps objects free-standing (a
//! `Doorbell` doesn't know which slab it lives in, a `Thread` doesn't know
//! its `Scheduler`) so that unit tests can build one object at a time. This
//! module is the one place that wires them all together into a single
//! static, because [`crate::object::hypercall::dispatch`] needs a single
//! entry point that can go from "a capability number the guest handed us"
//! to "the object it names, in the right slab".
//!
//! `Cspace` predates the rest of the object model's interior-mutability
//! convention: its mutating methods take `&mut self` rather than locking
//! internally. A single [`crate::primitives::spinlock::SpinLock`] around
//! the whole [`CspaceSlab`] covers that; cspace operations are control-plane
//! calls, not a scheduling hot path, so one lock for the table is not a
//! contended one.

use crate::error::{HypError, HypResult};
use crate::ipc::doorbell::DoorbellSlab;
use crate::ipc::task_queue::TaskQueue;
use crate::ipc::vpm::VpmGroupSlab;
use crate::ipc::vrtc::VrtcSlab;
use crate::ipc::wait_queue::WaitQueueSlab;
use crate::mem::addrspace::AddrspaceSlab;
use crate::mem::memdb::Memdb;
use crate::mem::memextent::MemextentSlab;
use crate::mem::partition::PartitionSlab;
use crate::object::cspace::{Cspace, CspaceSlab};
use crate::object::header::{Header, ObjectType};
use crate::power::power::Power;
use crate::power::rcu_sync::RcuSync;
use crate::primitives::cpulocal::CpuIndex;
use crate::primitives::spinlock::SpinLock;
use crate::sched::thread::ThreadId;
use crate::sched::Scheduler;
use crate::vcpu::run::VcpuRunSlab;
use crate::vgic::vic::VicSlab;

pub struct Kernel {
    pub scheduler: Scheduler,
    pub power: Power,
    pub rcu_sync: RcuSync,
    pub task_queue: TaskQueue,
    pub memdb: Memdb,
    pub partitions: PartitionSlab,
    pub cspaces: SpinLock<CspaceSlab>,
    pub memextents: MemextentSlab,
    pub addrspaces: AddrspaceSlab,
    pub vics: VicSlab,
    pub doorbells: DoorbellSlab,
    pub wait_queues: WaitQueueSlab,
    pub vpm_groups: VpmGroupSlab,
    pub vrtcs: VrtcSlab,
    pub vcpu_runs: VcpuRunSlab,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            power: Power::new(),
            rcu_sync: RcuSync::new(),
            task_queue: TaskQueue::new(),
            memdb: Memdb::new(),
            partitions: PartitionSlab::new(),
            cspaces: SpinLock::new(CspaceSlab::new()),
            memextents: MemextentSlab::new(),
            addrspaces: AddrspaceSlab::new(),
            vics: VicSlab::new(),
            doorbells: DoorbellSlab::new(),
            wait_queues: WaitQueueSlab::new(),
            vpm_groups: VpmGroupSlab::new(),
            vrtcs: VrtcSlab::new(),
            vcpu_runs: VcpuRunSlab::new(),
        }
    }

    /// The cspace index the currently-running thread on `cpu` resolves
    /// capabilities against, per the calling-convention `hypercall::dispatch`
    /// documents ("the calling cspace is the current thread's own").
    pub fn caller_cspace_index(&self, cpu: CpuIndex) -> Option<u32> {
        let thread_id = self.scheduler.active(cpu);
        self.scheduler.thread(thread_id)?.cspace()
    }

    /// Read-only cspace access (lookups don't need `&mut`, but still go
    /// through the same table lock since the slab itself is shared).
    pub fn with_caller_cspace_ref<R>(&self, cpu: CpuIndex, f: impl FnOnce(&Cspace) -> HypResult<R>) -> HypResult<R> {
        let index = self.caller_cspace_index(cpu).ok_or(HypError::CapInvalid)?;
        let slab = self.cspaces.lock();
        let cspace = slab.get(index).ok_or(HypError::CapInvalid)?.as_ref().ok_or(HypError::CapInvalid)?;
        f(cspace)
    }

    /// Resolve `cap` against the calling cspace and return the object's
    /// slab index and type, checking `required_rights` (spec §4.C lookup
    /// path common to every hypercall).
    pub fn resolve_cap(&self, cpu: CpuIndex, cap: u32, expect: ObjectType, rights: u32) -> HypResult<u32> {
        self.with_caller_cspace_ref(cpu, |cs| cs.lookup_object(cap, expect, rights))
    }

    /// The `Header` belonging to object `index` of kind `object_type`,
    /// across every slab (used by the generic `ObjectActivate`/`ObjectReset`
    /// hypercalls, which dispatch on the looked-up type rather than a fixed
    /// one).
    pub fn header_for(&self, object_type: ObjectType, index: u32) -> Option<&Header> {
        let i = index as usize;
        match object_type {
            ObjectType::Memextent => self.memextents.get(i).map(|o| &o.header),
            ObjectType::Addrspace => self.addrspaces.get(i).map(|o| &o.header),
            ObjectType::Vic => self.vics.get(i).map(|o| &o.header),
            ObjectType::Doorbell => self.doorbells.get(i).map(|o| &o.header),
            ObjectType::VpmGroup => self.vpm_groups.get(i).map(|o| &o.header),
            ObjectType::Vrtc => self.vrtcs.get(i).map(|o| &o.header),
            ObjectType::Thread => self.scheduler.thread(i as ThreadId).map(|t| &t.header),
            ObjectType::Partition | ObjectType::Cspace | ObjectType::WaitQueue => None,
        }
    }
}

pub static KERNEL: Kernel = Kernel::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_with_no_bound_cspace_is_cap_invalid() {
        let k = Kernel::new();
        let cpu = CpuIndex::new(0).unwrap();
        assert_eq!(k.caller_cspace_index(cpu), None);
        assert_eq!(
            k.resolve_cap(cpu, 0, ObjectType::Doorbell, 0),
            Err(HypError::CapInvalid)
        );
    }

    #[test]
    fn header_for_finds_the_right_slab() {
        let k = Kernel::new();
        let h = k.header_for(ObjectType::Doorbell, 0).unwrap();
        assert_eq!(h.object_type, ObjectType::Doorbell);
        assert!(k.header_for(ObjectType::WaitQueue, 0).is_none());
    }
}
