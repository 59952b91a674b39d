//! vPM (paravirt power) group object (spec §4.K, §3: "paravirt power group").
//!
//! Aggregates the power state of a set of VCPUs attached to the group so a
//! guest-facing management VM can be told, via the group's bound VIRQ,
//! whenever the group as a whole transitions between "every member off" and
//! "at least one member on" — the minimal signal a paravirt power-domain
//! driver needs, without emulating any specific hardware power controller.

use crate::object::header::{Header, ObjectType, PartitionId};
use crate::primitives::bitmap::AtomicBitmap;
use crate::primitives::spinlock::SpinLock;
use crate::vgic::vic::{Vic, Virq};
use core::sync::atomic::Ordering;

/// Members are addressed by a small per-group index, not a global VCPU id;
/// the group is typically one per VM with one member per VCPU, bounded the
/// same way a VIC's VCPU fan-out is.
pub const MAX_MEMBERS: usize = crate::limits::MAX_VCPUS_PER_VIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    AllOff,
    SomeOn,
}

pub struct VpmGroup {
    pub header: Header,
    attached: AtomicBitmap<1>,
    online: AtomicBitmap<1>,
    binding: SpinLock<Option<Virq>>,
}

impl VpmGroup {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::VpmGroup),
            attached: AtomicBitmap::new(),
            online: AtomicBitmap::new(),
            binding: SpinLock::new(None),
        }
    }

    pub fn configure(&self) -> Result<(), crate::error::HypError> {
        let _g = self.header.lock_config();
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(crate::error::HypError::ObjectState);
        }
        Ok(())
    }

    pub fn attach_vcpu(&self, member: usize) -> Result<(), crate::error::HypError> {
        if member >= MAX_MEMBERS {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        self.attached.set(member, Ordering::AcqRel);
        Ok(())
    }

    pub fn bind_virq(&self, virq: Virq) {
        *self.binding.lock() = Some(virq);
    }

    pub fn unbind_virq(&self) {
        *self.binding.lock() = None;
    }

    /// Record a member's power transition. If this flips the aggregate
    /// `GroupState`, assert the bound virq so the owning management VM can
    /// react.
    pub fn set_member_online(&self, member: usize, online: bool, vic: &Vic) -> Result<(), crate::error::HypError> {
        if !self.attached.get(member, Ordering::Acquire) {
            return Err(crate::error::HypError::ArgumentInvalid);
        }
        let before = self.state();
        if online {
            self.online.set(member, Ordering::AcqRel);
        } else {
            self.online.clear(member, Ordering::AcqRel);
        }
        let after = self.state();
        if before != after {
            if let Some(virq) = *self.binding.lock() {
                vic.assert_edge(virq)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> GroupState {
        if self.online.is_empty(Ordering::Acquire) {
            GroupState::AllOff
        } else {
            GroupState::SomeOn
        }
    }
}

pub struct VpmGroupSlab {
    groups: [VpmGroup; crate::limits::MAX_VPM_GROUPS],
}

impl VpmGroupSlab {
    pub const fn new() -> Self {
        const G: VpmGroup = VpmGroup::new_uninit();
        Self {
            groups: [G; crate::limits::MAX_VPM_GROUPS],
        }
    }

    pub fn get(&self, index: usize) -> Option<&VpmGroup> {
        self.groups.get(index)
    }
}

impl Default for VpmGroupSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::header::PartitionId as Pid;

    fn bound_vic() -> Vic {
        let vic = Vic::new_uninit();
        vic.configure(Pid(0), 1).unwrap();
        vic.configure_virq(Virq::Spi(0), true, 0, 0).unwrap();
        vic.enable_virq(Virq::Spi(0), true).unwrap();
        vic.set_spi_route(0, 0).unwrap();
        vic
    }

    #[test]
    fn group_starts_all_off_and_flips_once_any_member_is_on() {
        let vic = bound_vic();
        let g = VpmGroup::new_uninit();
        g.configure().unwrap();
        g.attach_vcpu(0).unwrap();
        g.attach_vcpu(1).unwrap();
        g.bind_virq(Virq::Spi(0));
        assert_eq!(g.state(), GroupState::AllOff);

        g.set_member_online(0, true, &vic).unwrap();
        assert_eq!(g.state(), GroupState::SomeOn);
        assert!(vic.virq_query(Virq::Spi(0)).unwrap().active());
    }

    #[test]
    fn state_stays_some_on_until_every_member_is_off() {
        let vic = bound_vic();
        let g = VpmGroup::new_uninit();
        g.configure().unwrap();
        g.attach_vcpu(0).unwrap();
        g.attach_vcpu(1).unwrap();
        g.set_member_online(0, true, &vic).unwrap();
        g.set_member_online(1, true, &vic).unwrap();
        g.set_member_online(0, false, &vic).unwrap();
        assert_eq!(g.state(), GroupState::SomeOn);
        g.set_member_online(1, false, &vic).unwrap();
        assert_eq!(g.state(), GroupState::AllOff);
    }

    #[test]
    fn unattached_member_is_rejected() {
        let vic = bound_vic();
        let g = VpmGroup::new_uninit();
        g.configure().unwrap();
        assert_eq!(
            g.set_member_online(3, true, &vic),
            Err(crate::error::HypError::ArgumentInvalid)
        );
    }
}
