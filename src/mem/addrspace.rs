//! Guest address space (spec §3 "Addrspace", §4.D).
//!
//! A VMID, a stage-2 page-table handle ([`crate::arch::Pgtable`]), a vdevice
//! map (a small linear range table stands in for the guarded-page-table the
//! spec allows as an equivalent, spec §4.D), and the optional info-area/vRTC
//! mappings. Stage-2 fault handling (§6 "page-table module") is two paths:
//! a translation fault looks the faulting IPA up in the vdevice map; a
//! permission fault resolves the faulting VA to a PA via the page table's AT
//! accessor and matches that PA against [`crate::mem::memdb`].

use crate::arch::traits::PageTable;
use crate::arch::Pgtable;
use crate::error::{HypError, HypResult};
use crate::limits::MAX_VDEVICES_PER_ADDRSPACE;
use crate::mem::memdb::Memdb;
use crate::mem::memextent::{Access, MemAttr, Memextent};
use crate::object::header::{Header, Lifecycle, ObjectType, PartitionId};
use crate::primitives::spinlock::SpinLock;

#[cfg(target_arch = "aarch64")]
fn to_arch_attrs(attr: MemAttr) -> <Pgtable as PageTable>::Attrs {
    use crate::arch::aarch64::MemoryAttributes;
    match attr {
        MemAttr::Normal => MemoryAttributes::NORMAL,
        MemAttr::Device => MemoryAttributes::DEVICE,
        MemAttr::ReadOnly => MemoryAttributes::READONLY,
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn to_arch_attrs(_attr: MemAttr) -> <Pgtable as PageTable>::Attrs {}

#[derive(Clone, Copy)]
struct VdeviceRange {
    ipa_base: u64,
    size: u64,
    vdevice_id: u32,
}

pub struct Addrspace {
    pub header: Header,
    vmid: SpinLock<u16>,
    pgtable: SpinLock<Pgtable>,
    vdevices: SpinLock<([Option<VdeviceRange>; MAX_VDEVICES_PER_ADDRSPACE], usize)>,
    info_area: SpinLock<Option<u32>>,
}

impl Addrspace {
    pub const fn new_uninit() -> Self {
        const NONE_RANGE: Option<VdeviceRange> = None;
        Self {
            header: Header::new(PartitionId(0), ObjectType::Addrspace),
            vmid: SpinLock::new(0),
            pgtable: SpinLock::new(Pgtable::new()),
            vdevices: SpinLock::new(([NONE_RANGE; MAX_VDEVICES_PER_ADDRSPACE], 0)),
            info_area: SpinLock::new(None),
        }
    }

    pub fn configure(&self, vmid: u16) -> HypResult<()> {
        let _g = self.header.lock_config();
        if self.header.state() != Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        *self.vmid.lock() = vmid;
        Ok(())
    }

    pub fn vmid(&self) -> u16 {
        *self.vmid.lock()
    }

    /// Register a vdevice's IPA range so stage-2 translation faults inside
    /// it dispatch to that device (spec §4.D vdevice map).
    pub fn attach_vdevice(&self, ipa_base: u64, size: u64, vdevice_id: u32) -> HypResult<()> {
        let mut v = self.vdevices.lock();
        let (table, count) = &mut *v;
        if *count == MAX_VDEVICES_PER_ADDRSPACE {
            return Err(HypError::NoResources);
        }
        for existing in table.iter().flatten() {
            if ipa_base < existing.ipa_base + existing.size && existing.ipa_base < ipa_base + size {
                return Err(HypError::Busy);
            }
        }
        let idx = table.iter().position(Option::is_none).unwrap();
        table[idx] = Some(VdeviceRange { ipa_base, size, vdevice_id });
        *count += 1;
        Ok(())
    }

    /// Look up which vdevice, if any, owns `ipa` (translation-fault path).
    pub fn lookup_vdevice(&self, ipa: u64) -> Option<(u32, u64)> {
        let v = self.vdevices.lock();
        v.0.iter().flatten().find(|r| r.ipa_base <= ipa && ipa < r.ipa_base + r.size).map(|r| (r.vdevice_id, ipa - r.ipa_base))
    }

    /// Permission-fault path: translate the faulting VA to a PA via the
    /// architectural AT accessor, then match it against `memdb` to recover
    /// the owning extent (spec §4.D).
    pub fn resolve_permission_fault(&self, memdb: &Memdb, fault_va: u64, is_write: bool) -> Option<crate::mem::memdb::Owner> {
        let pg = self.pgtable.lock();
        let pa = if is_write { pg.va_to_pa_write(fault_va) } else { pg.va_to_pa_read(fault_va) }?;
        memdb.lookup(pa)
    }

    pub fn map(&self, extent: &Memextent, vm_base: u64, addrspace_id: u32, access: Access, mem_attr: MemAttr) -> HypResult<()> {
        if !self.header.is_active() {
            return Err(HypError::ObjectState);
        }
        let _ = access;
        let mut pg = self.pgtable.lock();
        extent.map(&mut *pg, addrspace_id, vm_base, to_arch_attrs(mem_attr), mem_attr)
    }

    pub fn unmap(&self, extent: &Memextent, addrspace_id: u32) -> HypResult<()> {
        let mut pg = self.pgtable.lock();
        extent.unmap(&mut *pg, addrspace_id)
    }

    /// Remove every mapping `extent` currently has, assuming they were all
    /// made into this addrspace's own page table.
    pub fn unmap_all_of(&self, extent: &Memextent) -> HypResult<()> {
        let mut pg = self.pgtable.lock();
        extent.unmap_all(&mut *pg)
    }

    pub fn attach_info_area(&self, extent_index: u32) -> HypResult<()> {
        let mut info = self.info_area.lock();
        if info.is_some() {
            return Err(HypError::Busy);
        }
        *info = Some(extent_index);
        Ok(())
    }

    pub fn commit(&self) {
        self.pgtable.lock().pgtable_hyp_commit();
    }
}

/// Static slab of addrspaces, mirroring [`crate::mem::partition::PartitionSlab`].
pub struct AddrspaceSlab {
    addrspaces: [Addrspace; crate::limits::MAX_ADDRSPACES],
}

impl AddrspaceSlab {
    pub const fn new() -> Self {
        const A: Addrspace = Addrspace::new_uninit();
        Self { addrspaces: [A; crate::limits::MAX_ADDRSPACES] }
    }

    pub fn get(&self, index: usize) -> Option<&Addrspace> {
        self.addrspaces.get(index)
    }
}

impl Default for AddrspaceSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::partition::Partition;

    #[test]
    fn vdevice_lookup_finds_owning_range() {
        let a = Addrspace::new_uninit();
        a.configure(3).unwrap();
        a.attach_vdevice(0x1_0000, 0x1000, 42).unwrap();
        assert_eq!(a.lookup_vdevice(0x1_0080), Some((42, 0x80)));
        assert_eq!(a.lookup_vdevice(0x2_0000), None);
    }

    #[test]
    fn overlapping_vdevice_attach_rejected() {
        let a = Addrspace::new_uninit();
        a.configure(3).unwrap();
        a.attach_vdevice(0x1_0000, 0x1000, 1).unwrap();
        assert_eq!(a.attach_vdevice(0x1_0800, 0x1000, 2), Err(HypError::Busy));
    }

    #[test]
    fn map_before_activation_is_rejected() {
        let memdb = Memdb::new();
        let partition = Partition::new_uninit();
        let extent = Memextent::new_uninit();
        extent.configure(&partition, &memdb, PartitionId(0), 1, 0x2000, 0x1000, MemAttr::Normal, Access::READ).unwrap();
        extent.header.activate().unwrap();
        let a = Addrspace::new_uninit();
        a.configure(1).unwrap();
        assert_eq!(a.map(&extent, 0x4000, 0, Access::READ, MemAttr::Normal), Err(HypError::ObjectState));
    }
}
