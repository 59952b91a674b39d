//! vRTC object (spec §4.K, §3: wraps real-time clock state for a VM).
//!
//! Holds only the object-model state a `vrtc` capability needs: the epoch
//! offset applied to the architectural counter, and which address space's
//! vdevice range it is attached to. The PL031 register-level emulation
//! (`RTCDR`/`RTCLR`/etc.) is out of kernel scope: a stage-2 fault against
//! the attached vdevice range turns into an `ADDRSPACE_VMMIO_READ/WRITE`
//! report to the proxy owner via `vcpu_run`, which reads this offset rather
//! than the kernel duplicating it.

use crate::object::header::{Header, ObjectType, PartitionId};
use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};

const NO_ADDRSPACE: u32 = u32::MAX;

pub struct Vrtc {
    pub header: Header,
    /// Seconds added to the architectural counter's reading so `now()`
    /// reflects wall-clock time rather than time-since-boot.
    epoch_offset: AtomicI64,
    addrspace: AtomicU32,
}

impl Vrtc {
    pub const fn new_uninit() -> Self {
        Self {
            header: Header::new(PartitionId(0), ObjectType::Vrtc),
            epoch_offset: AtomicI64::new(0),
            addrspace: AtomicU32::new(NO_ADDRSPACE),
        }
    }

    pub fn configure(&self) -> Result<(), crate::error::HypError> {
        let _g = self.header.lock_config();
        if self.header.state() != crate::object::header::Lifecycle::Init {
            return Err(crate::error::HypError::ObjectState);
        }
        Ok(())
    }

    pub fn set_time_base(&self, epoch_offset: i64) {
        self.epoch_offset.store(epoch_offset, Ordering::Release);
    }

    pub fn attach_addrspace(&self, addrspace_index: u32) -> Result<(), crate::error::HypError> {
        self.addrspace.store(addrspace_index, Ordering::Release);
        Ok(())
    }

    pub fn addrspace(&self) -> Option<u32> {
        let v = self.addrspace.load(Ordering::Acquire);
        (v != NO_ADDRSPACE).then_some(v)
    }

    /// Apply the configured epoch offset to a raw counter-seconds reading.
    pub fn now(&self, counter_seconds: u64) -> u64 {
        (counter_seconds as i64 + self.epoch_offset.load(Ordering::Acquire)) as u64
    }
}

pub struct VrtcSlab {
    vrtcs: [Vrtc; crate::limits::MAX_VRTCS],
}

impl VrtcSlab {
    pub const fn new() -> Self {
        const V: Vrtc = Vrtc::new_uninit();
        Self {
            vrtcs: [V; crate::limits::MAX_VRTCS],
        }
    }

    pub fn get(&self, index: usize) -> Option<&Vrtc> {
        self.vrtcs.get(index)
    }
}

impl Default for VrtcSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_base_shifts_now_by_the_configured_offset() {
        let r = Vrtc::new_uninit();
        r.configure().unwrap();
        assert_eq!(r.now(1_000), 1_000);
        r.set_time_base(500);
        assert_eq!(r.now(1_000), 1_500);
        r.set_time_base(-200);
        assert_eq!(r.now(1_000), 800);
    }

    #[test]
    fn attach_addrspace_is_queryable() {
        let r = Vrtc::new_uninit();
        assert_eq!(r.addrspace(), None);
        r.attach_addrspace(4).unwrap();
        assert_eq!(r.addrspace(), Some(4));
    }
}
