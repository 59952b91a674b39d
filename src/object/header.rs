//! Common object prefix (spec §4.C, §3 "Object header").
//!
//! Every first-class object (thread, cspace, memextent, addrspace,
//! partition, doorbell, vic, vpm group, vrtc) embeds a `Header` as its first
//! field. Creation returns an object in `Init` state with refcount 1;
//! configuration setters require the header lock and `Init` state;
//! `activate` publishes the object and is a release operation so that any
//! later acquire observer of `Active` sees every configuration write.

use crate::primitives::refcount::Refcount;
use crate::primitives::spinlock::SpinLock;
use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Thread,
    Cspace,
    Memextent,
    Addrspace,
    Partition,
    Doorbell,
    WaitQueue,
    Vic,
    VpmGroup,
    Vrtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Init = 0,
    Active = 1,
    Deactivated = 2,
}

impl Lifecycle {
    fn from_raw(v: u8) -> Self {
        match v {
            0 => Lifecycle::Init,
            1 => Lifecycle::Active,
            _ => Lifecycle::Deactivated,
        }
    }
}

/// Identifies the partition that owns an object's memory. Partitions
/// themselves live in a static slab (spec §4.B); index 0 is always the
/// private hypervisor partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionId(pub u16);

pub struct Header {
    pub partition: PartitionId,
    pub object_type: ObjectType,
    pub refcount: Refcount,
    state: AtomicU8,
    /// Guards lifecycle transitions and pre-activation configuration writes.
    config_lock: SpinLock<()>,
}

impl Header {
    pub const fn new(partition: PartitionId, object_type: ObjectType) -> Self {
        Self {
            partition,
            object_type,
            refcount: Refcount::new(1),
            state: AtomicU8::new(Lifecycle::Init as u8),
            config_lock: SpinLock::new(()),
        }
    }

    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == Lifecycle::Active
    }

    /// Acquire the lock guarding configuration writes. Callers must check
    /// [`Header::state`] is `Init` before mutating object fields under it.
    pub fn lock_config(&self) -> crate::primitives::spinlock::SpinLockGuard<'_, ()> {
        self.config_lock.lock()
    }

    /// Publish the object, transitioning `Init` → `Active`. Release-ordered:
    /// every write made under `lock_config` before this call is visible to
    /// any thread that subsequently observes `Active` via an acquire load of
    /// [`Header::state`].
    pub fn activate(&self) -> Result<(), crate::error::HypError> {
        self.state
            .compare_exchange(
                Lifecycle::Init as u8,
                Lifecycle::Active as u8,
                Ordering::Release,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| crate::error::HypError::ObjectState)
    }

    /// Transition `Active` → `Deactivated`. Called once the refcount has
    /// dropped to zero; reverses whatever `activate` published.
    pub fn deactivate(&self) {
        self.state.store(Lifecycle::Deactivated as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_requires_init_state() {
        let h = Header::new(PartitionId(0), ObjectType::Thread);
        assert_eq!(h.state(), Lifecycle::Init);
        assert!(h.activate().is_ok());
        assert_eq!(h.state(), Lifecycle::Active);
        assert!(h.activate().is_err());
    }

    #[test]
    fn deactivate_is_terminal() {
        let h = Header::new(PartitionId(0), ObjectType::Cspace);
        h.activate().unwrap();
        h.deactivate();
        assert_eq!(h.state(), Lifecycle::Deactivated);
    }
}
