//! Virtual interrupt controller object (spec §4.J).
//!
//! One `Vic` is bound to a VM and fans out to up to [`MAX_VCPUS_PER_VIC`]
//! VCPUs. SPIs are shared across every bound VCPU and routed to exactly one
//! at a time; SGIs/PPIs are private per-VCPU. List-register occupancy is
//! tracked as a plain bitmap — which abstract slot holds which virq — rather
//! than the physical `ICH_LR_EL2` bit layout, which stays arch-side (spec:
//! byte-level physical GIC register layouts are out of scope for this module).

use crate::limits::{MAX_DEFERRED_VIRQS, MAX_LIST_REGISTERS, MAX_PRIVATE_IRQS, MAX_SPIS, MAX_VCPUS_PER_VIC, MAX_VICS};
use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::spinlock::SpinLock;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::delivery_state::VirqDeliveryState;

pub const SGI_PPI_BASE: u32 = 0;
pub const SPI_BASE: u32 = 32;

/// A virq identified the way guests address it: the INTID space, split into
/// the private (SGI/PPI) range owned by one VCPU and the shared SPI range
/// owned by the whole VIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Virq {
    Private { vcpu: u8, intid: u8 },
    Spi(u16),
}

impl Virq {
    pub fn from_intid(vcpu: u8, intid: u32) -> Option<Self> {
        if intid < SPI_BASE {
            Some(Virq::Private { vcpu, intid: intid as u8 })
        } else {
            let spi = intid - SPI_BASE;
            if (spi as usize) < MAX_SPIS {
                Some(Virq::Spi(spi as u16))
            } else {
                None
            }
        }
    }

    pub fn intid(self) -> u32 {
        match self {
            Virq::Private { intid, .. } => intid as u32,
            Virq::Spi(spi) => SPI_BASE + spi as u32,
        }
    }
}

const NO_VIRQ: u32 = u32::MAX;

/// Per-VCPU list-register bank: which virq (if any) occupies each abstract
/// slot. A slot is free iff its occupant is `NO_VIRQ`.
struct LrBank {
    occupant: [AtomicU32; MAX_LIST_REGISTERS],
}

impl LrBank {
    const fn new() -> Self {
        const EMPTY: AtomicU32 = AtomicU32::new(NO_VIRQ);
        Self {
            occupant: [EMPTY; MAX_LIST_REGISTERS],
        }
    }

    fn alloc(&self, intid: u32) -> Option<usize> {
        for (slot, occ) in self.occupant.iter().enumerate() {
            if occ
                .compare_exchange(NO_VIRQ, intid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(slot);
            }
        }
        None
    }

    fn free(&self, slot: usize) -> u32 {
        self.occupant[slot].swap(NO_VIRQ, Ordering::AcqRel)
    }

    fn is_full(&self) -> bool {
        self.occupant.iter().all(|o| o.load(Ordering::Acquire) != NO_VIRQ)
    }
}

/// Bounded FIFO of virqs that missed out on a list register and must be
/// redelivered once one frees up (spec: "deferred/overflow virq queue").
struct DeferredQueue {
    slots: [AtomicU32; MAX_DEFERRED_VIRQS],
    lock: SpinLock<()>,
}

impl DeferredQueue {
    const fn new() -> Self {
        const EMPTY: AtomicU32 = AtomicU32::new(NO_VIRQ);
        Self {
            slots: [EMPTY; MAX_DEFERRED_VIRQS],
            lock: SpinLock::new(()),
        }
    }

    fn push(&self, intid: u32) -> bool {
        let _g = self.lock.lock();
        for slot in &self.slots {
            if slot.load(Ordering::Relaxed) == NO_VIRQ {
                slot.store(intid, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    fn pop(&self) -> Option<u32> {
        let _g = self.lock.lock();
        for slot in &self.slots {
            let v = slot.load(Ordering::Relaxed);
            if v != NO_VIRQ {
                slot.store(NO_VIRQ, Ordering::Relaxed);
                return Some(v);
            }
        }
        None
    }
}

struct PrivateBank {
    irqs: [VirqDeliveryState; MAX_PRIVATE_IRQS],
    lrs: LrBank,
    deferred: DeferredQueue,
    bound: AtomicU8,
}

impl PrivateBank {
    const fn new() -> Self {
        const IRQ: VirqDeliveryState = VirqDeliveryState::new();
        Self {
            irqs: [IRQ; MAX_PRIVATE_IRQS],
            lrs: LrBank::new(),
            deferred: DeferredQueue::new(),
            bound: AtomicU8::new(0),
        }
    }
}

pub struct Vic {
    pub header: Header,
    spis: [VirqDeliveryState; MAX_SPIS],
    /// Target VCPU index for each SPI, `NONE_ROUTE` until configured.
    spi_route: [AtomicUsize; MAX_SPIS],
    vcpus: [PrivateBank; MAX_VCPUS_PER_VIC],
    vcpu_count: SpinLock<usize>,
}

const NONE_ROUTE: usize = usize::MAX;

impl Vic {
    pub const fn new_uninit() -> Self {
        const SPI: VirqDeliveryState = VirqDeliveryState::new();
        const ROUTE: AtomicUsize = AtomicUsize::new(NONE_ROUTE);
        const BANK: PrivateBank = PrivateBank::new();
        Self {
            header: Header::new(PartitionId(0), ObjectType::Vic),
            spis: [SPI; MAX_SPIS],
            spi_route: [ROUTE; MAX_SPIS],
            vcpus: [BANK; MAX_VCPUS_PER_VIC],
            vcpu_count: SpinLock::new(0),
        }
    }

    pub fn configure(&self, partition: PartitionId, vcpu_count: usize) -> Result<(), crate::error::HypError> {
        if vcpu_count == 0 || vcpu_count > MAX_VCPUS_PER_VIC {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        let _g = self.header.lock_config();
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(crate::error::HypError::ObjectState);
        }
        let _ = partition;
        *self.vcpu_count.lock() = vcpu_count;
        for bank in &self.vcpus[..vcpu_count] {
            bank.bound.store(1, Ordering::Release);
        }
        Ok(())
    }

    /// Detach a VCPU from this VIC (e.g. on VCPU teardown) so its private
    /// virqs stop accepting asserts and it drops out of SPI 1-of-N selection.
    pub fn unbind_vcpu(&self, vcpu_index: usize) -> Result<(), crate::error::HypError> {
        let max = *self.vcpu_count.lock();
        if vcpu_index >= max {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        self.vcpus[vcpu_index].bound.store(0, Ordering::Release);
        Ok(())
    }

    pub fn set_spi_route(&self, spi: u16, vcpu_index: usize) -> Result<(), crate::error::HypError> {
        if spi as usize >= MAX_SPIS || vcpu_index >= *self.vcpu_count.lock() {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        self.spi_route[spi as usize].store(vcpu_index, Ordering::Release);
        self.spis[spi as usize].set_routing_valid(true);
        Ok(())
    }

    pub fn configure_virq(&self, virq: Virq, is_edge: bool, group: u8, priority: u8) -> Result<(), crate::error::HypError> {
        self.delivery_state(virq)?.configure(is_edge, group, priority);
        Ok(())
    }

    pub fn enable_virq(&self, virq: Virq, enabled: bool) -> Result<(), crate::error::HypError> {
        self.delivery_state(virq)?.set_enabled(enabled);
        Ok(())
    }

    fn delivery_state(&self, virq: Virq) -> Result<&VirqDeliveryState, crate::error::HypError> {
        match virq {
            Virq::Private { vcpu, intid } => self
                .vcpus
                .get(vcpu as usize)
                .and_then(|b| b.irqs.get(intid as usize))
                .ok_or(crate::error::HypError::ArgumentInvalid),
            Virq::Spi(spi) => self.spis.get(spi as usize).ok_or(crate::error::HypError::ArgumentInvalid),
        }
    }

    /// Assert path (spec §4.J step-by-step): mark pending, then try to
    /// deliver straight into a free list register on the routed VCPU; if
    /// none is free, park it on that VCPU's deferred queue instead.
    pub fn assert_edge(&self, virq: Virq) -> Result<(), crate::error::HypError> {
        let target = self.route(virq)?;
        self.delivery_state(virq)?.assert_edge();
        self.try_deliver(target, virq);
        Ok(())
    }

    pub fn assert_level(&self, virq: Virq, source: super::delivery_state::LevelSource) -> Result<(), crate::error::HypError> {
        let target = self.route(virq)?;
        self.delivery_state(virq)?.assert_level(source);
        self.try_deliver(target, virq);
        Ok(())
    }

    pub fn clear_level(&self, virq: Virq, source: super::delivery_state::LevelSource) -> Result<(), crate::error::HypError> {
        self.delivery_state(virq)?.clear_level(source);
        Ok(())
    }

    fn bound_mask(&self) -> [bool; MAX_VCPUS_PER_VIC] {
        let mut mask = [false; MAX_VCPUS_PER_VIC];
        for (i, slot) in mask.iter_mut().enumerate() {
            *slot = self.vcpus[i].bound.load(Ordering::Acquire) != 0;
        }
        mask
    }

    fn route(&self, virq: Virq) -> Result<usize, crate::error::HypError> {
        match virq {
            Virq::Private { vcpu, .. } => {
                let bound = self.bound_mask();
                if super::route::private_target_is_valid(vcpu as usize, &bound) {
                    Ok(vcpu as usize)
                } else {
                    Err(crate::error::HypError::VirqNotBound)
                }
            }
            Virq::Spi(spi) => {
                let configured = match self.spi_route[spi as usize].load(Ordering::Acquire) {
                    NONE_ROUTE => None,
                    target => Some(target),
                };
                let bound = self.bound_mask();
                super::route::select_spi_target(configured, &bound).ok_or(crate::error::HypError::VirqNotBound)
            }
        }
    }

    /// Route-change path (spec: "Route changes may migrate an inflight
    /// VIRQ"): withdraw the SPI from wherever it currently sits, point it at
    /// the new target, and re-assert if it was still pending or active.
    pub fn defer_spi(&self, spi: u16, new_target: usize) -> Result<(), crate::error::HypError> {
        if spi as usize >= MAX_SPIS || new_target >= *self.vcpu_count.lock() {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        let virq = Virq::Spi(spi);
        let old_target = self.route(virq).ok();
        if let Some(old) = old_target {
            if let Some(bank) = self.bank(old) {
                for slot in 0..MAX_LIST_REGISTERS {
                    if bank.lrs.occupant[slot].load(Ordering::Acquire) == virq.intid() {
                        bank.lrs.free(slot);
                        self.delivery_state(virq)?.deactivate();
                        break;
                    }
                }
            }
        }
        self.spi_route[spi as usize].store(new_target, Ordering::Release);
        self.spis[spi as usize].set_routing_valid(true);
        if self.delivery_state(virq)?.load().pending() {
            self.try_deliver(new_target, virq);
        }
        Ok(())
    }

    fn bank(&self, vcpu_index: usize) -> Option<&PrivateBank> {
        self.vcpus.get(vcpu_index)
    }

    /// Try to occupy a free list register on `vcpu_index` for `virq`; defer
    /// it if the bank is full (spec: "overflow" path feeds the deferred queue).
    fn try_deliver(&self, vcpu_index: usize, virq: Virq) {
        let Some(bank) = self.bank(vcpu_index) else { return };
        if !self.delivery_state(virq).map(|s| s.load().should_route()).unwrap_or(false) {
            return;
        }
        if let Some(_slot) = bank.lrs.alloc(virq.intid()) {
            if let Ok(state) = self.delivery_state(virq) {
                state.deliver();
            }
        } else {
            bank.deferred.push(virq.intid());
        }
    }

    /// Called from the VCPU's run loop once a list register frees up (after
    /// EOI) to pull the next deferred virq in, if any.
    pub fn drain_deferred(&self, vcpu_index: usize) {
        let Some(bank) = self.bank(vcpu_index) else { return };
        while !bank.lrs.is_full() {
            let Some(intid) = bank.deferred.pop() else { break };
            let virq = if intid < SPI_BASE {
                Virq::Private { vcpu: vcpu_index as u8, intid: intid as u8 }
            } else {
                Virq::Spi((intid - SPI_BASE) as u16)
            };
            self.try_deliver(vcpu_index, virq);
        }
    }

    /// Deactivate path (EOI/DIR): free the list register and, if the virq's
    /// level source is still asserted, requeue it for redelivery rather than
    /// leaving it silently dropped.
    pub fn deactivate(&self, vcpu_index: usize, lr_slot: usize) -> Result<(), crate::error::HypError> {
        let bank = self.bank(vcpu_index).ok_or(crate::error::HypError::ArgumentInvalid)?;
        let intid = bank.lrs.free(lr_slot);
        if intid == NO_VIRQ {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        let virq = if intid < SPI_BASE {
            Virq::Private { vcpu: vcpu_index as u8, intid: intid as u8 }
        } else {
            Virq::Spi((intid - SPI_BASE) as u16)
        };
        let snapshot = self.delivery_state(virq)?.deactivate();
        let _ = snapshot;
        if self.delivery_state(virq)?.load().pending() {
            self.try_deliver(vcpu_index, virq);
        }
        Ok(())
    }

    /// Read-only snapshot accessor for diagnostics/hypercall query paths.
    pub fn virq_query(&self, virq: Virq) -> Result<super::delivery_state::Snapshot, crate::error::HypError> {
        Ok(self.delivery_state(virq)?.load())
    }
}

pub struct VicSlab {
    vics: [Vic; MAX_VICS],
}

impl VicSlab {
    pub const fn new() -> Self {
        const V: Vic = Vic::new_uninit();
        Self { vics: [V; MAX_VICS] }
    }

    pub fn get(&self, index: usize) -> Option<&Vic> {
        self.vics.get(index)
    }
}

impl Default for VicSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::PartitionId;

    #[test]
    fn spi_falls_back_to_1_of_n_until_explicitly_routed() {
        let vic = Vic::new_uninit();
        vic.configure(PartitionId(0), 2).unwrap();
        vic.configure_virq(Virq::Spi(0), true, 0, 0x80).unwrap();
        vic.enable_virq(Virq::Spi(0), true).unwrap();
        // No explicit route yet: falls back to the first bound VCPU rather
        // than failing outright.
        assert!(vic.assert_edge(Virq::Spi(0)).is_ok());
        assert!(vic.virq_query(Virq::Spi(0)).unwrap().active());

        vic.deactivate(0, 0).unwrap();
        vic.set_spi_route(1, 1).unwrap();
        assert!(vic.assert_edge(Virq::Spi(1)).is_ok());
        assert!(vic.virq_query(Virq::Spi(1)).unwrap().active());
    }

    #[test]
    fn spi_assert_fails_once_no_vcpu_is_bound() {
        let vic = Vic::new_uninit();
        vic.configure(PartitionId(0), 1).unwrap();
        vic.unbind_vcpu(0).unwrap();
        vic.configure_virq(Virq::Spi(0), true, 0, 0).unwrap();
        vic.enable_virq(Virq::Spi(0), true).unwrap();
        assert!(matches!(vic.assert_edge(Virq::Spi(0)), Err(crate::error::HypError::VirqNotBound)));
    }

    #[test]
    fn lr_overflow_defers_and_drains_on_eoi() {
        let vic = Vic::new_uninit();
        vic.configure(PartitionId(0), 1).unwrap();
        for i in 0..MAX_LIST_REGISTERS as u16 + 1 {
            vic.configure_virq(Virq::Spi(i), true, 0, 0).unwrap();
            vic.enable_virq(Virq::Spi(i), true).unwrap();
            vic.set_spi_route(i, 0).unwrap();
            vic.assert_edge(Virq::Spi(i)).unwrap();
        }
        // The last one could not find a free LR and should be active=false,
        // still pending, parked on the deferred queue.
        let overflow = Virq::Spi(MAX_LIST_REGISTERS as u16);
        assert!(!vic.virq_query(overflow).unwrap().active());
        assert!(vic.virq_query(overflow).unwrap().pending());

        // Free one LR; the deferred one should now be delivered.
        vic.deactivate(0, 0).unwrap();
        vic.drain_deferred(0);
        assert!(vic.virq_query(overflow).unwrap().active());
    }

    #[test]
    fn private_virq_routes_to_its_own_vcpu_without_configuration() {
        let vic = Vic::new_uninit();
        vic.configure(PartitionId(0), 2).unwrap();
        let virq = Virq::Private { vcpu: 1, intid: 5 };
        vic.configure_virq(virq, true, 0, 0).unwrap();
        vic.enable_virq(virq, true).unwrap();
        assert!(vic.assert_edge(virq).is_ok());
        assert!(vic.virq_query(virq).unwrap().active());
    }
}
