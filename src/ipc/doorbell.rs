//! Doorbell object (spec §4.K, §3 "Doorbell": "a flag register with masking,
//! bound to a VIRQ, used for cross-VM signalling").
//!
//! A 64-bit flag register plus an enable mask and an ack mask. `send` OR's
//! new flags in and, if any newly-set bit is enabled, asserts the bound
//! VIRQ and auto-clears whatever bits the ack mask names. The bound VIC/virq
//! is supplied by the caller on every call rather than stored inside the
//! doorbell, the same collaborator-by-parameter style `mem::memextent` uses
//! for its page table.

use crate::limits::MAX_DOORBELLS;
use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::spinlock::SpinLock;
use crate::vgic::vic::{Vic, Virq};
use core::sync::atomic::{AtomicU64, Ordering};

pub struct Doorbell {
    pub header: Header,
    flags: AtomicU64,
    enable_mask: AtomicU64,
    ack_mask: AtomicU64,
    binding: SpinLock<Option<Virq>>,
}

impl Doorbell {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::Doorbell),
            flags: AtomicU64::new(0),
            enable_mask: AtomicU64::new(0),
            ack_mask: AtomicU64::new(0),
            binding: SpinLock::new(None),
        }
    }

    pub fn configure(&self, enable_mask: u64, ack_mask: u64) -> Result<(), crate::error::HypError> {
        let _g = self.header.lock_config();
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(crate::error::HypError::ObjectState);
        }
        self.enable_mask.store(enable_mask, Ordering::Relaxed);
        self.ack_mask.store(ack_mask, Ordering::Relaxed);
        Ok(())
    }

    pub fn bind_virq(&self, virq: Virq) {
        *self.binding.lock() = Some(virq);
    }

    pub fn unbind_virq(&self) {
        *self.binding.lock() = None;
    }

    /// Clear all pending flags without touching the masks or binding.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Relaxed);
    }

    /// `send` per spec: OR in `new_flags`; if the result newly intersects
    /// the enable mask, assert the bound virq and clear whatever ack-masked
    /// bits are set.
    pub fn send(&self, new_flags: u64, vic: &Vic) -> Result<(), crate::error::HypError> {
        let enable = self.enable_mask.load(Ordering::Relaxed);
        let prev = self.flags.fetch_or(new_flags, Ordering::AcqRel);
        let now = prev | new_flags;
        let newly_pending = (now & enable) & !(prev & enable);
        if newly_pending != 0 {
            self.deliver(vic)?;
            let ack = self.ack_mask.load(Ordering::Relaxed);
            if ack != 0 {
                self.flags.fetch_and(!ack, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Read-and-clear: returns the flags as observed before `clear` is
    /// applied.
    pub fn receive(&self, clear: u64) -> u64 {
        self.flags.fetch_and(!clear, Ordering::AcqRel)
    }

    /// `mask` per spec: install new enable/ack masks and re-evaluate
    /// pending bits that just became unmasked, edge-delivering if so.
    pub fn mask(&self, new_enable: u64, new_ack: u64, vic: &Vic) -> Result<(), crate::error::HypError> {
        let old_enable = self.enable_mask.swap(new_enable, Ordering::AcqRel);
        self.ack_mask.store(new_ack, Ordering::Relaxed);
        let flags = self.flags.load(Ordering::Acquire);
        let newly_unmasked = (flags & new_enable) & !(flags & old_enable);
        if newly_unmasked != 0 {
            self.deliver(vic)?;
        }
        Ok(())
    }

    fn deliver(&self, vic: &Vic) -> Result<(), crate::error::HypError> {
        let virq = self.binding.lock().ok_or(crate::error::HypError::VirqNotBound)?;
        vic.assert_edge(virq)
    }

    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::Relaxed)
    }
}

pub struct DoorbellSlab {
    doorbells: [Doorbell; MAX_DOORBELLS],
}

impl DoorbellSlab {
    pub const fn new() -> Self {
        const D: Doorbell = Doorbell::new_uninit();
        Self { doorbells: [D; MAX_DOORBELLS] }
    }

    pub fn get(&self, index: usize) -> Option<&Doorbell> {
        self.doorbells.get(index)
    }

    pub fn all(&self) -> &[Doorbell] {
        &self.doorbells
    }
}

impl Default for DoorbellSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::PartitionId as Pid;
    use crate::vgic::vic::Virq;

    fn bound_vic() -> Vic {
        let vic = Vic::new_uninit();
        vic.configure(Pid(0), 1).unwrap();
        vic.configure_virq(Virq::Spi(0), true, 0, 0).unwrap();
        vic.enable_virq(Virq::Spi(0), true).unwrap();
        vic.set_spi_route(0, 0).unwrap();
        vic
    }

    #[test]
    fn send_asserts_virq_only_for_enabled_bits() {
        let vic = bound_vic();
        let db = Doorbell::new_uninit();
        db.configure(0b1, 0).unwrap();
        db.bind_virq(Virq::Spi(0));

        db.send(0b10, &vic).unwrap();
        assert!(!vic.virq_query(Virq::Spi(0)).unwrap().active(), "bit not enabled, no assert");

        db.send(0b01, &vic).unwrap();
        assert!(vic.virq_query(Virq::Spi(0)).unwrap().active());
    }

    #[test]
    fn send_with_ack_mask_autoclears() {
        let vic = bound_vic();
        let db = Doorbell::new_uninit();
        db.configure(0b1, 0b1).unwrap();
        db.bind_virq(Virq::Spi(0));
        db.send(0b1, &vic).unwrap();
        assert_eq!(db.flags(), 0);
    }

    #[test]
    fn receive_reads_then_clears_requested_bits() {
        let db = Doorbell::new_uninit();
        db.configure(0, 0).unwrap();
        let vic = bound_vic();
        db.send(0b11, &vic).unwrap();
        let read = db.receive(0b01);
        assert_eq!(read, 0b11);
        assert_eq!(db.flags(), 0b10);
    }

    #[test]
    fn mask_delivers_for_bits_newly_unmasked() {
        let vic = bound_vic();
        let db = Doorbell::new_uninit();
        db.configure(0, 0).unwrap();
        db.bind_virq(Virq::Spi(0));
        db.send(0b1, &vic).unwrap();
        assert!(!vic.virq_query(Virq::Spi(0)).unwrap().active());
        db.mask(0b1, 0, &vic).unwrap();
        assert!(vic.virq_query(Virq::Spi(0)).unwrap().active());
    }
}
