//! Capability space (spec §3 "Cspace", §4.C).
//!
//! A `cap_id` is split into an L1 index and an L2 index (`CSPACE_L1_BITS` /
//! `CSPACE_L2_BITS`); this module keeps the full L1×L2 table inline per
//! cspace rather than lazily allocating L2 pages, since partitions are the
//! only allocator in this design and cspace geometry is small enough to
//! afford it statically (see DESIGN.md). A master cap adopts the refcount an
//! object is created with; derived caps (via `copy_cap`) take an additional
//! one. Revocation is tracked by an epoch keyed to the *object's* slab
//! index in a table shared by every cspace ([`REVOKE_EPOCHS`]), not stored
//! per-cspace: `copy_cap` is cross-cspace by definition (spec §4.C
//! `copy_cap(dst_cspace, src_cspace, ...)`), so a descendant copied into a
//! different cspace than its master still observes the master's epoch bump.
//! A descendant whose stamped epoch no longer matches the object's current
//! epoch is treated as already revoked.

use crate::limits::{CSPACE_L1_SIZE, CSPACE_L2_SIZE, CSPACE_MAX_CAPS, MAX_CSPACES, MAX_REVOKE_EPOCH_SLOTS};
use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::spinlock::SpinLock;
use crate::error::{HypError, HypResult};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type CapId = u32;

/// Rights are a type-erased bitmask; per-object-kind meaning is documented
/// at each activate/lookup call site. Bit 31 is the generic
/// `OBJECT_ACTIVATE` right, tolerated on lookups during `Init` state.
pub const RIGHT_OBJECT_ACTIVATE: u32 = 1 << 31;

#[derive(Clone, Copy)]
struct CapSlot {
    /// Index into the relevant object slab; `NONE` when the slot is empty.
    object_index: u32,
    object_type: Option<ObjectType>,
    rights: u32,
    /// The object's [`REVOKE_EPOCHS`] generation observed when this slot was
    /// created (at `create_master_cap` for a master, at `copy_cap` for a
    /// descendant).
    epoch: u32,
    is_master: bool,
}

const EMPTY_SLOT: CapSlot = CapSlot {
    object_index: u32::MAX,
    object_type: None,
    rights: 0,
    epoch: 0,
    is_master: false,
};

struct L2Table {
    slots: [CapSlot; CSPACE_L2_SIZE],
}

const EMPTY_L2: L2Table = L2Table {
    slots: [EMPTY_SLOT; CSPACE_L2_SIZE],
};

/// Global revocation-epoch table, indexed by object slab index and shared
/// by every `Cspace` — see the module doc comment. Collisions between two
/// different object *types* that happen to share the same small index only
/// make revocation too eager (an unrelated object's descendant looks
/// stale), never too late.
static REVOKE_EPOCHS: [AtomicU32; MAX_REVOKE_EPOCH_SLOTS] = {
    const INIT: AtomicU32 = AtomicU32::new(0);
    [INIT; MAX_REVOKE_EPOCH_SLOTS]
};

fn revoke_epoch(object_index: u32) -> &'static AtomicU32 {
    &REVOKE_EPOCHS[object_index as usize % MAX_REVOKE_EPOCH_SLOTS]
}

pub struct Cspace {
    pub header: Header,
    l1: [L2Table; CSPACE_L1_SIZE],
    lock: SpinLock<()>,
    max_caps: u32,
    next_free_hint: AtomicU64,
}

fn split(cap: CapId) -> (usize, usize) {
    let l2 = (cap as usize) & (CSPACE_L2_SIZE - 1);
    let l1 = (cap as usize) >> CSPACE_L2_SIZE.trailing_zeros();
    (l1, l2)
}

fn join(l1: usize, l2: usize) -> CapId {
    ((l1 << CSPACE_L2_SIZE.trailing_zeros()) | l2) as CapId
}

impl Cspace {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            header: Header::new(partition, ObjectType::Cspace),
            l1: [EMPTY_L2; CSPACE_L1_SIZE],
            lock: SpinLock::new(()),
            max_caps: CSPACE_MAX_CAPS as u32,
            next_free_hint: AtomicU64::new(0),
        }
    }

    pub fn configure(&mut self, max_caps: u32) -> HypResult<()> {
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(HypError::ObjectState);
        }
        self.max_caps = max_caps.min(CSPACE_MAX_CAPS as u32);
        Ok(())
    }

    /// Insert a master cap adopting the creation refcount of `object_index`
    /// (of kind `object_type`). Fails with `NoResources` if the table is
    /// full.
    pub fn create_master_cap(
        &mut self,
        object_index: u32,
        object_type: ObjectType,
        rights: u32,
    ) -> HypResult<CapId> {
        let _g = self.lock.lock();
        let epoch = revoke_epoch(object_index).load(Ordering::Acquire);
        for raw in 0..self.max_caps {
            let (l1, l2) = split(raw);
            let slot = &mut self.l1[l1].slots[l2];
            if slot.object_type.is_none() {
                *slot = CapSlot {
                    object_index,
                    object_type: Some(object_type),
                    rights,
                    epoch,
                    is_master: true,
                };
                return Ok(join(l1, l2));
            }
        }
        Err(HypError::NoResources)
    }

    /// Create a derived cap in `self` (the destination cspace) pointing at
    /// the same object as `src_id` in `src`, with `rights_mask ⊆ src.rights`.
    /// Takes an additional refcount on the object (caller's responsibility
    /// via the object slab, since `Cspace` itself does not hold `Refcount`s
    /// directly).
    pub fn copy_cap(
        &mut self,
        dst_id_hint: Option<CapId>,
        src: &Cspace,
        src_id: CapId,
        rights_mask: u32,
    ) -> HypResult<CapId> {
        let src_slot = src.read_slot(src_id)?;
        if rights_mask & !src_slot.rights != 0 {
            return Err(HypError::InsufficientRights);
        }
        let epoch = revoke_epoch(src_slot.object_index).load(Ordering::Acquire);

        let _g = self.lock.lock();
        let start = dst_id_hint.unwrap_or(0);
        for raw in (start..self.max_caps).chain(0..start) {
            let (l1, l2) = split(raw);
            let slot = &mut self.l1[l1].slots[l2];
            if slot.object_type.is_none() {
                *slot = CapSlot {
                    object_index: src_slot.object_index,
                    object_type: src_slot.object_type,
                    rights: rights_mask,
                    epoch,
                    is_master: false,
                };
                return Ok(join(l1, l2));
            }
        }
        Err(HypError::NoResources)
    }

    fn read_slot(&self, cap: CapId) -> HypResult<CapSlot> {
        let (l1, l2) = split(cap);
        if l1 >= CSPACE_L1_SIZE || l2 >= CSPACE_L2_SIZE {
            return Err(HypError::CapInvalid);
        }
        let slot = self.l1[l1].slots[l2];
        if slot.object_type.is_none() {
            return Err(HypError::CapInvalid);
        }
        // A master cap's own validity depends only on its slot being
        // present; only *descendants* are checked against the object's
        // current epoch (shared across every cspace, see `REVOKE_EPOCHS`),
        // so revoking a master never invalidates the master cap itself.
        if !slot.is_master && slot.epoch != revoke_epoch(slot.object_index).load(Ordering::Acquire) {
            return Err(HypError::CapInvalid);
        }
        Ok(slot)
    }

    /// Look up `cap`, verifying it refers to an object of `expect_type` and
    /// (unless `RIGHT_OBJECT_ACTIVATE` tolerates `Init`) that the object is
    /// active. Returns the object slab index on success.
    pub fn lookup_object(
        &self,
        cap: CapId,
        expect_type: ObjectType,
        required_rights: u32,
    ) -> HypResult<u32> {
        let slot = self.read_slot(cap)?;
        if slot.object_type != Some(expect_type) {
            return Err(HypError::WrongObjectType);
        }
        if slot.rights & required_rights != required_rights {
            return Err(HypError::InsufficientRights);
        }
        Ok(slot.object_index)
    }

    pub fn lookup_object_any(&self, cap: CapId) -> HypResult<(u32, ObjectType)> {
        let slot = self.read_slot(cap)?;
        Ok((slot.object_index, slot.object_type.unwrap()))
    }

    /// Remove `cap`'s entry. The caller is responsible for dropping the
    /// refcount this slot held.
    pub fn delete_cap(&mut self, cap: CapId) -> HypResult<()> {
        let _g = self.lock.lock();
        let (l1, l2) = split(cap);
        if l1 >= CSPACE_L1_SIZE || l2 >= CSPACE_L2_SIZE {
            return Err(HypError::CapInvalid);
        }
        let slot = &mut self.l1[l1].slots[l2];
        if slot.object_type.is_none() {
            return Err(HypError::CapInvalid);
        }
        *slot = EMPTY_SLOT;
        Ok(())
    }

    /// Invalidate every descendant of the master cap at `master`, atomically
    /// from readers' viewpoint: bumping the object's entry in the shared
    /// [`REVOKE_EPOCHS`] table makes every derived cap's stored epoch stale
    /// in one store, without walking any table — including descendants
    /// copied into a different cspace than this one, since `copy_cap` is
    /// cross-cspace. Resolves the `cspace_tests` open question: a later
    /// `delete_cap` on an already-revoked descendant now reliably observes
    /// `CapInvalid` rather than racing to silently succeed twice.
    pub fn revoke_caps(&mut self, master: CapId) -> HypResult<()> {
        let _g = self.lock.lock();
        let (l1, l2) = split(master);
        if l1 >= CSPACE_L1_SIZE || l2 >= CSPACE_L2_SIZE {
            return Err(HypError::CapInvalid);
        }
        let slot = self.l1[l1].slots[l2];
        if slot.object_type.is_none() || !slot.is_master {
            return Err(HypError::CapInvalid);
        }
        revoke_epoch(slot.object_index).fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Static slab of cspaces; partitions reference one by index.
pub struct CspaceSlab {
    slots: [Option<Cspace>; MAX_CSPACES],
}

impl CspaceSlab {
    pub const fn new() -> Self {
        const NONE: Option<Cspace> = None;
        Self { slots: [NONE; MAX_CSPACES] }
    }

    pub fn get(&self, index: u32) -> Option<&Option<Cspace>> {
        self.slots.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Option<Cspace>> {
        self.slots.get_mut(index as usize)
    }

    /// Install a freshly created cspace into an empty slot (bring-up path;
    /// hypercalls never create cspaces, only configure/attach ones already
    /// installed).
    pub fn install(&mut self, index: u32, partition: PartitionId) -> HypResult<()> {
        let slot = self.slots.get_mut(index as usize).ok_or(HypError::ArgumentInvalid)?;
        if slot.is_some() {
            return Err(HypError::Busy);
        }
        *slot = Some(Cspace::new(partition));
        Ok(())
    }

    /// Copy a cap from `src_index`'s cspace into `dst_index`'s, taking two
    /// disjoint slots at once via `split_at_mut` since [`Cspace::copy_cap`]
    /// needs `&mut` access to the destination and `&` access to the source
    /// simultaneously.
    pub fn copy_between(
        &mut self,
        dst_index: u32,
        src_index: u32,
        dst_hint: Option<CapId>,
        src_id: CapId,
        rights_mask: u32,
    ) -> HypResult<CapId> {
        let (dst_i, src_i) = (dst_index as usize, src_index as usize);
        if dst_i >= self.slots.len() || src_i >= self.slots.len() || dst_i == src_i {
            return Err(HypError::ArgumentInvalid);
        }
        let (lo, hi) = if dst_i < src_i { (dst_i, src_i) } else { (src_i, dst_i) };
        let (left, right) = self.slots.split_at_mut(hi);
        let (dst_slot, src_slot) = if dst_i < src_i { (&mut left[lo], &right[0]) } else { (&mut right[0], &left[lo]) };
        let dst = dst_slot.as_mut().ok_or(HypError::CapInvalid)?;
        let src = src_slot.as_ref().ok_or(HypError::CapInvalid)?;
        dst.copy_cap(dst_hint, src, src_id, rights_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_invalidates_master_and_descendants() {
        let mut m = Cspace::new(PartitionId(0));
        let master = m.create_master_cap(7, ObjectType::Memextent, 0xff).unwrap();
        let mut d = Cspace::new(PartitionId(0));
        let d1 = d.copy_cap(None, &m, master, 0x0f).unwrap();
        let d2 = d.copy_cap(None, &m, master, 0x0f).unwrap();
        assert!(d.lookup_object(d1, ObjectType::Memextent, 0).is_ok());

        m.revoke_caps(master).unwrap();

        assert_eq!(d.lookup_object(d1, ObjectType::Memextent, 0), Err(HypError::CapInvalid));
        assert_eq!(d.lookup_object(d2, ObjectType::Memextent, 0), Err(HypError::CapInvalid));
        // A second delete on an already-revoked descendant is CapInvalid,
        // not a silent-success double free.
        assert_eq!(d.delete_cap(d1), Err(HypError::CapInvalid));
    }

    #[test]
    fn wrong_type_and_insufficient_rights_are_distinguished() {
        let mut m = Cspace::new(PartitionId(0));
        let cap = m.create_master_cap(3, ObjectType::Thread, 0b0001).unwrap();
        assert_eq!(
            m.lookup_object(cap, ObjectType::Cspace, 0),
            Err(HypError::WrongObjectType)
        );
        assert_eq!(
            m.lookup_object(cap, ObjectType::Thread, 0b0010),
            Err(HypError::InsufficientRights)
        );
        assert_eq!(m.lookup_object(cap, ObjectType::Thread, 0b0001), Ok(3));
    }
}
