//! Memory extents (spec §3 "Memextent", §4.B, §4.D).
//!
//! A refcounted, possibly parent-linked range of physical memory. `Basic`
//! extents are one contiguous span; `Sparse` extents are modeled as a small
//! fixed array of contiguous sub-ranges (spec: "basic = contiguous, sparse =
//! set of contiguous regions") since the core never allocates a `Vec`.
//! Mapping an extent into an addrspace's stage-2 table bumps the addrspace's
//! refcount on the extent (spec §5 invariant: "Addrspace holds a refcount on
//! every memextent it currently maps").

use crate::arch::traits::PageTable;
use crate::error::{HypError, HypResult};
use crate::limits::MAX_ADDRSPACES;
use crate::mem::memdb::{Memdb, MemdbType, Owner};
use crate::mem::partition::Partition;
use crate::object::header::{Header, Lifecycle, ObjectType, PartitionId};
use crate::primitives::spinlock::SpinLock;

bitflags::bitflags! {
    /// Stage-2 access permissions an extent grants when mapped.
    pub struct Access: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    Normal,
    Device,
    ReadOnly,
}

const MAX_SPARSE_REGIONS: usize = 4;
const MAX_MAPPINGS: usize = MAX_ADDRSPACES;

#[derive(Clone, Copy)]
struct Region {
    base: u64,
    size: u64,
}

enum Kind {
    Basic(Region),
    Sparse { regions: [Option<Region>; MAX_SPARSE_REGIONS], count: usize },
}

#[derive(Clone, Copy)]
struct Mapping {
    addrspace: u32,
    vm_base: u64,
    attrs: MemAttr,
    generation: u32,
}

struct Inner {
    kind: Kind,
    attr: MemAttr,
    access: Access,
    parent: Option<u32>,
    mappings: [Option<Mapping>; MAX_MAPPINGS],
}

pub struct Memextent {
    pub header: Header,
    inner: SpinLock<Inner>,
}

impl Memextent {
    pub const fn new_uninit() -> Self {
        const NO_MAPPING: Option<Mapping> = None;
        Self {
            header: Header::new(PartitionId(0), ObjectType::Memextent),
            inner: SpinLock::new(Inner {
                kind: Kind::Basic(Region { base: 0, size: 0 }),
                attr: MemAttr::Normal,
                access: Access::empty(),
                parent: None,
                mappings: [NO_MAPPING; MAX_MAPPINGS],
            }),
        }
    }

    /// Claim a fresh, contiguous physical range for this extent (spec
    /// `memextent configure`).
    pub fn configure(
        &self,
        partition: &Partition,
        memdb: &Memdb,
        id: PartitionId,
        object_index: u32,
        base: u64,
        size: u64,
        attr: MemAttr,
        access: Access,
    ) -> HypResult<()> {
        let _g = self.header.lock_config();
        if self.header.state() != Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        if size == 0 {
            return Err(HypError::ArgumentSize);
        }
        memdb.insert(base, base + size, Owner { partition: id, object_index, kind: MemdbType::Extent })?;
        let _ = partition;
        let mut inner = self.inner.lock();
        inner.kind = Kind::Basic(Region { base, size });
        inner.attr = attr;
        inner.access = access;
        Ok(())
    }

    /// Carve a child extent out of `parent`'s range (spec `configure_derive`).
    /// The child must lie entirely within an unmapped, unshared sub-range of
    /// the parent; the parent keeps the memdb entry, the child only records
    /// its own sub-range and a back-link.
    pub fn configure_derive(&self, parent: &Memextent, parent_index: u32, offset: u64, size: u64) -> HypResult<()> {
        let _g = self.header.lock_config();
        if self.header.state() != Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        let parent_inner = parent.inner.lock();
        let Kind::Basic(parent_region) = parent_inner.kind else {
            return Err(HypError::Unimplemented);
        };
        if offset.checked_add(size).map_or(true, |end| end > parent_region.size) {
            return Err(HypError::ArgumentSize);
        }
        let attr = parent_inner.attr;
        let access = parent_inner.access;
        drop(parent_inner);
        let mut inner = self.inner.lock();
        inner.kind = Kind::Basic(Region { base: parent_region.base + offset, size });
        inner.attr = attr;
        inner.access = access;
        inner.parent = Some(parent_index);
        Ok(())
    }

    fn region_for(kind: &Kind, rel_offset: u64, len: u64) -> Option<(u64, u64)> {
        match kind {
            Kind::Basic(r) => {
                if rel_offset + len > r.size {
                    return None;
                }
                Some((r.base + rel_offset, len))
            }
            Kind::Sparse { regions, count } => {
                let mut walked = 0u64;
                for region in regions.iter().take(*count).flatten() {
                    if rel_offset >= walked && rel_offset + len <= walked + region.size {
                        return Some((region.base + (rel_offset - walked), len));
                    }
                    walked += region.size;
                }
                None
            }
        }
    }

    fn whole_range(kind: &Kind) -> Option<(u64, u64)> {
        match kind {
            Kind::Basic(r) => Some((r.base, r.size)),
            Kind::Sparse { .. } => None,
        }
    }

    /// Map this extent's full range into `pgtable` at `vm_base` (spec `map`).
    pub fn map<P: PageTable>(
        &self,
        pgtable: &mut P,
        addrspace: u32,
        vm_base: u64,
        attrs: P::Attrs,
        mem_attr: MemAttr,
    ) -> HypResult<()> {
        if !self.header.is_active() {
            return Err(HypError::ObjectState);
        }
        let mut inner = self.inner.lock();
        let (base, size) = match inner.kind {
            Kind::Basic(r) => (r.base, r.size),
            Kind::Sparse { .. } => return Err(HypError::Unimplemented),
        };
        let slot = inner.mappings.iter().position(Option::is_none).ok_or(HypError::NoResources)?;
        unsafe { pgtable.pgtable_hyp_map(vm_base, base, size, attrs).map_err(|_| HypError::Busy)? };
        let generation = inner.mappings[slot].map_or(1, |m| m.generation + 1);
        inner.mappings[slot] = Some(Mapping { addrspace, vm_base, attrs: mem_attr, generation });
        Ok(())
    }

    /// Remove every mapping this extent currently has of `addrspace` (spec
    /// `unmap`/`unmap_all`).
    pub fn unmap<P: PageTable>(&self, pgtable: &mut P, addrspace: u32) -> HypResult<()> {
        let mut inner = self.inner.lock();
        let (_base, size) = Self::whole_range(&inner.kind).ok_or(HypError::Unimplemented)?;
        for slot in inner.mappings.iter_mut() {
            if matches!(slot, Some(m) if m.addrspace == addrspace) {
                let vm_base = slot.unwrap().vm_base;
                unsafe { pgtable.pgtable_hyp_unmap(vm_base, size).map_err(|_| HypError::Busy)? };
                *slot = None;
            }
        }
        Ok(())
    }

    pub fn unmap_all<P: PageTable>(&self, pgtable: &mut P) -> HypResult<()> {
        let mut inner = self.inner.lock();
        let (_base, size) = Self::whole_range(&inner.kind).ok_or(HypError::Unimplemented)?;
        for slot in inner.mappings.iter_mut() {
            if let Some(m) = slot.take() {
                unsafe { pgtable.pgtable_hyp_unmap(m.vm_base, size).map_err(|_| HypError::Busy)? };
            }
        }
        Ok(())
    }

    /// Map only `[offset, offset+len)` of this extent's range (spec
    /// `map_partial`).
    pub fn map_partial<P: PageTable>(
        &self,
        pgtable: &mut P,
        addrspace: u32,
        vm_base: u64,
        offset: u64,
        len: u64,
        attrs: P::Attrs,
        mem_attr: MemAttr,
    ) -> HypResult<()> {
        if !self.header.is_active() {
            return Err(HypError::ObjectState);
        }
        let mut inner = self.inner.lock();
        let (phys, size) = Self::region_for(&inner.kind, offset, len).ok_or(HypError::ArgumentInvalid)?;
        let slot = inner.mappings.iter().position(Option::is_none).ok_or(HypError::NoResources)?;
        unsafe { pgtable.pgtable_hyp_map(vm_base, phys, size, attrs).map_err(|_| HypError::Busy)? };
        let generation = inner.mappings[slot].map_or(1, |m| m.generation + 1);
        inner.mappings[slot] = Some(Mapping { addrspace, vm_base, attrs: mem_attr, generation });
        Ok(())
    }

    pub fn unmap_partial<P: PageTable>(&self, pgtable: &mut P, addrspace: u32, vm_base: u64, len: u64) -> HypResult<()> {
        let mut inner = self.inner.lock();
        for slot in inner.mappings.iter_mut() {
            if matches!(slot, Some(m) if m.addrspace == addrspace && m.vm_base == vm_base) {
                unsafe { pgtable.pgtable_hyp_unmap(vm_base, len).map_err(|_| HypError::Busy)? };
                *slot = None;
                return Ok(());
            }
        }
        Err(HypError::ArgumentInvalid)
    }

    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.iter().filter(|m| m.is_some()).count()
    }

    pub fn parent(&self) -> Option<u32> {
        self.inner.lock().parent
    }

    /// Turn this extent into an empty sparse extent derived from `parent`
    /// (spec `configure_derive`, sparse variant): records the back-link only,
    /// region ownership is populated later by [`Memextent::donate_child`].
    pub fn configure_derive_sparse(&self, parent_index: u32) -> HypResult<()> {
        let _g = self.header.lock_config();
        if self.header.state() != Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        let mut inner = self.inner.lock();
        inner.kind = Kind::Sparse { regions: [None; MAX_SPARSE_REGIONS], count: 0 };
        inner.parent = Some(parent_index);
        Ok(())
    }

    /// Move ownership of the physical range `[phys_base, phys_base+size)`
    /// — which must lie within `parent`'s range — between `parent` and this
    /// (sparse) extent (spec `donate_child`). Per the worked example in the
    /// spec's sparse-extent scenario, the addressing is by absolute physical
    /// address, not an offset relative to the parent's base. `reverse =
    /// false` moves the range from the parent to `self`; `true` gives it
    /// back. Both `memdb` and each extent's own region bookkeeping are
    /// updated atomically under `self`'s lock, matching `memdb.update`'s
    /// "only if every byte currently matches the expected pair" contract.
    #[allow(clippy::too_many_arguments)]
    pub fn donate_child(
        &self,
        self_index: u32,
        parent: &Memextent,
        parent_index: u32,
        memdb: &Memdb,
        owner_partition: PartitionId,
        phys_base: u64,
        size: u64,
        reverse: bool,
    ) -> HypResult<()> {
        if size == 0 {
            return Err(HypError::ArgumentSize);
        }
        let parent_region = {
            let parent_inner = parent.inner.lock();
            match parent_inner.kind {
                Kind::Basic(r) => r,
                Kind::Sparse { .. } => return Err(HypError::Unimplemented),
            }
        };
        let in_bounds = phys_base >= parent_region.base
            && phys_base.checked_add(size).map_or(false, |end| end <= parent_region.base + parent_region.size);
        if !in_bounds {
            return Err(HypError::ArgumentSize);
        }

        let mut inner = self.inner.lock();
        let Kind::Sparse { regions, count } = &mut inner.kind else {
            return Err(HypError::Unimplemented);
        };

        if !reverse {
            memdb.update(
                phys_base,
                phys_base + size,
                Owner { partition: owner_partition, object_index: self_index, kind: MemdbType::Extent },
                Owner { partition: owner_partition, object_index: parent_index, kind: MemdbType::Extent },
            )?;
            if *count >= MAX_SPARSE_REGIONS {
                // Undo the memdb move — this extent has no room left to record it.
                memdb.update(
                    phys_base,
                    phys_base + size,
                    Owner { partition: owner_partition, object_index: parent_index, kind: MemdbType::Extent },
                    Owner { partition: owner_partition, object_index: self_index, kind: MemdbType::Extent },
                )?;
                return Err(HypError::NoResources);
            }
            regions[*count] = Some(Region { base: phys_base, size });
            *count += 1;
        } else {
            let pos = regions
                .iter()
                .take(*count)
                .position(|r| matches!(r, Some(rr) if rr.base == phys_base && rr.size == size))
                .ok_or(HypError::ArgumentInvalid)?;
            memdb.update(
                phys_base,
                phys_base + size,
                Owner { partition: owner_partition, object_index: parent_index, kind: MemdbType::Extent },
                Owner { partition: owner_partition, object_index: self_index, kind: MemdbType::Extent },
            )?;
            for i in pos..*count - 1 {
                regions[i] = regions[i + 1];
            }
            regions[*count - 1] = None;
            *count -= 1;
        }
        Ok(())
    }

    /// Move ownership of the physical range `[phys_base, phys_base+size)`
    /// directly between two sparse sibling extents that share the same
    /// parent (spec `donate_sibling`, "requires shared parent and atomic
    /// memdb update"). Locks are taken in index order to avoid deadlocking
    /// against a concurrent donation the other way.
    pub fn donate_sibling(
        from: &Memextent,
        from_index: u32,
        to: &Memextent,
        to_index: u32,
        memdb: &Memdb,
        owner_partition: PartitionId,
        phys_base: u64,
        size: u64,
    ) -> HypResult<()> {
        if size == 0 {
            return Err(HypError::ArgumentSize);
        }
        let (first, second, first_is_from) = if from_index <= to_index { (from, to, true) } else { (to, from, false) };
        let mut first_inner = first.inner.lock();
        let mut second_inner = second.inner.lock();
        let (from_inner, to_inner) = if first_is_from {
            (&mut first_inner, &mut second_inner)
        } else {
            (&mut second_inner, &mut first_inner)
        };

        if from_inner.parent.is_none() || from_inner.parent != to_inner.parent {
            return Err(HypError::ArgumentInvalid);
        }
        let Kind::Sparse { regions: from_regions, count: from_count } = &mut from_inner.kind else {
            return Err(HypError::Unimplemented);
        };
        let pos = from_regions
            .iter()
            .take(*from_count)
            .position(|r| matches!(r, Some(rr) if rr.base == phys_base && rr.size == size))
            .ok_or(HypError::ArgumentInvalid)?;
        let region = from_regions[pos].unwrap();

        let Kind::Sparse { regions: to_regions, count: to_count } = &mut to_inner.kind else {
            return Err(HypError::Unimplemented);
        };
        if *to_count >= MAX_SPARSE_REGIONS {
            return Err(HypError::NoResources);
        }

        memdb.update(
            region.base,
            region.base + region.size,
            Owner { partition: owner_partition, object_index: to_index, kind: MemdbType::Extent },
            Owner { partition: owner_partition, object_index: from_index, kind: MemdbType::Extent },
        )?;

        for i in pos..*from_count - 1 {
            from_regions[i] = from_regions[i + 1];
        }
        from_regions[*from_count - 1] = None;
        *from_count -= 1;
        to_regions[*to_count] = Some(region);
        *to_count += 1;
        Ok(())
    }
}

/// Static slab of memextents, mirroring [`crate::mem::partition::PartitionSlab`].
pub struct MemextentSlab {
    extents: [Memextent; crate::limits::MAX_MEMEXTENTS],
}

impl MemextentSlab {
    pub const fn new() -> Self {
        const E: Memextent = Memextent::new_uninit();
        Self { extents: [E; crate::limits::MAX_MEMEXTENTS] }
    }

    pub fn get(&self, index: usize) -> Option<&Memextent> {
        self.extents.get(index)
    }
}

impl Default for MemextentSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePgtable { mapped: Vec<(u64, u64, u64)> }
    impl PageTable for FakePgtable {
        type Attrs = ();
        unsafe fn pgtable_hyp_map(&mut self, va: u64, pa: u64, size: u64, _attrs: ()) -> Result<(), &'static str> {
            self.mapped.push((va, pa, size));
            Ok(())
        }
        unsafe fn pgtable_hyp_unmap(&mut self, va: u64, _size: u64) -> Result<(), &'static str> {
            self.mapped.retain(|(v, ..)| *v != va);
            Ok(())
        }
        fn pgtable_hyp_commit(&mut self) {}
        fn pgtable_hyp_start(&mut self) {}
        fn pgtable_vm_lookup(&self, _asid: u16, _va: u64) -> Option<(u64, u64, ())> { None }
        fn va_to_pa_read(&self, va: u64) -> Option<u64> { Some(va) }
        fn va_to_pa_write(&self, va: u64) -> Option<u64> { Some(va) }
    }

    fn activated_extent(memdb: &Memdb, partition: &Partition, base: u64, size: u64) -> Memextent {
        let e = Memextent::new_uninit();
        e.configure(partition, memdb, PartitionId(0), 1, base, size, MemAttr::Normal, Access::READ | Access::WRITE).unwrap();
        e.header.activate().unwrap();
        e
    }

    #[test]
    fn map_then_unmap_round_trips() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let e = activated_extent(&memdb, &partition, 0x1000, 0x1000);
        let mut pg = FakePgtable { mapped: Vec::new() };
        e.map(&mut pg, 7, 0x8000, (), MemAttr::Normal).unwrap();
        assert_eq!(e.mapping_count(), 1);
        assert_eq!(pg.mapped, vec![(0x8000, 0x1000, 0x1000)]);
        e.unmap(&mut pg, 7).unwrap();
        assert_eq!(e.mapping_count(), 0);
        assert!(pg.mapped.is_empty());
    }

    #[test]
    fn derive_rejects_out_of_bounds_child() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let parent = activated_extent(&memdb, &partition, 0x1000, 0x2000);
        let child = Memextent::new_uninit();
        assert_eq!(child.configure_derive(&parent, 0, 0x1000, 0x2000), Err(HypError::ArgumentSize));
        child.configure_derive(&parent, 0, 0x1000, 0x1000).unwrap();
        assert_eq!(child.parent(), Some(0));
    }

    /// Mirrors spec §8 scenario 3: parent P covers [0x1000,0x5000), children
    /// C1/C2 both derive from P; donating [0x2000,0x3000) to C1 then sibling
    /// it over to C2 moves `memdb_lookup(0x2500)`'s owner each time.
    fn derived_sparse_child(parent_index: u32) -> Memextent {
        let child = Memextent::new_uninit();
        child.configure_derive_sparse(parent_index).unwrap();
        child.header.activate().unwrap();
        child
    }

    #[test]
    fn sparse_donate_child_then_sibling_moves_memdb_owner() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let parent = Memextent::new_uninit();
        parent.configure(&partition, &memdb, PartitionId(0), 0, 0x1000, 0x4000, MemAttr::Normal, Access::READ | Access::WRITE).unwrap();
        parent.header.activate().unwrap();
        let c1 = derived_sparse_child(0);
        let c2 = derived_sparse_child(0);

        c1.donate_child(1, &parent, 0, &memdb, PartitionId(0), 0x2000, 0x1000, false).unwrap();
        assert_eq!(memdb.lookup(0x2500), Some(Owner { partition: PartitionId(0), object_index: 1, kind: MemdbType::Extent }));

        Memextent::donate_sibling(&c1, 1, &c2, 2, &memdb, PartitionId(0), 0x2000, 0x1000).unwrap();
        assert_eq!(memdb.lookup(0x2500), Some(Owner { partition: PartitionId(0), object_index: 2, kind: MemdbType::Extent }));
    }

    #[test]
    fn sparse_donate_child_reverse_returns_range_to_parent() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let parent = Memextent::new_uninit();
        parent.configure(&partition, &memdb, PartitionId(0), 0, 0x1000, 0x4000, MemAttr::Normal, Access::READ | Access::WRITE).unwrap();
        parent.header.activate().unwrap();
        let child = derived_sparse_child(0);

        child.donate_child(1, &parent, 0, &memdb, PartitionId(0), 0x2000, 0x1000, false).unwrap();
        child.donate_child(1, &parent, 0, &memdb, PartitionId(0), 0x2000, 0x1000, true).unwrap();
        assert_eq!(memdb.lookup(0x2500), Some(Owner { partition: PartitionId(0), object_index: 0, kind: MemdbType::Extent }));
    }

    #[test]
    fn donate_child_rejects_range_outside_parent() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let parent = Memextent::new_uninit();
        parent.configure(&partition, &memdb, PartitionId(0), 0, 0x1000, 0x1000, MemAttr::Normal, Access::READ | Access::WRITE).unwrap();
        parent.header.activate().unwrap();
        let child = derived_sparse_child(0);
        assert_eq!(
            child.donate_child(1, &parent, 0, &memdb, PartitionId(0), 0x5000, 0x1000, false),
            Err(HypError::ArgumentSize)
        );
    }
}
