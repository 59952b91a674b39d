//! Hypercall dispatch table (spec §4.C, §6 "Hypercall ABI").
//!
//! The SMCCC bridge ([`crate::smccc::dispatch`]) decodes a vendor-hyp
//! function number into a [`HypercallId`] and calls [`dispatch`], which
//! decodes the SMCCC argument registers, performs the cspace lookups the
//! call's category needs, invokes the core method, and packs the result
//! into the return registers via [`crate::error::to_result_register`].

use crate::error::{HypError, HypResult};
use crate::kernel::KERNEL;
use crate::mem::memextent::{Access, MemAttr};
use crate::object::cspace::CapId;
use crate::object::header::ObjectType;
use crate::primitives::cpulocal::CpuIndex;
use crate::vgic::vic::Virq;

/// Numbered per the categories in spec §6. Numbering is internal to this
/// build; nothing outside the hypervisor observes these values directly
/// (they're wrapped by the SMCCC function-ID encoding in `smccc::dispatch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HypercallId {
    CspaceDeleteCapFrom = 0x00,
    CspaceCopyCapFrom = 0x01,
    CspaceRevokeCapsFrom = 0x02,
    CspaceConfigure = 0x03,
    CspaceAttachThread = 0x04,

    ObjectActivate = 0x10,
    ObjectActivateFrom = 0x11,
    ObjectReset = 0x12,

    AddrspaceConfigure = 0x20,
    AddrspaceAttachThread = 0x21,
    AddrspaceAttachVdma = 0x22,
    AddrspaceMap = 0x23,
    AddrspaceUnmap = 0x24,
    AddrspaceUpdateAccess = 0x25,

    MemextentUnmapAll = 0x30,
    MemextentConfigure = 0x31,
    MemextentConfigureDerive = 0x32,

    VcpuConfigure = 0x40,
    VcpuSetAffinity = 0x41,
    VcpuSetPriority = 0x42,
    VcpuSetTimeslice = 0x43,
    VcpuPoweron = 0x44,
    VcpuPoweroff = 0x45,
    VcpuRun = 0x46,
    VcpuRunCheck = 0x47,

    VicBindVirq = 0x50,
    VicUnbindVirq = 0x51,

    DoorbellBindVirq = 0x60,
    DoorbellUnbindVirq = 0x61,
    DoorbellSend = 0x62,
    DoorbellReceive = 0x63,
    DoorbellReset = 0x64,
    DoorbellMask = 0x65,

    VpmGroupConfigure = 0x70,
    VpmGroupAttachVcpu = 0x71,
    VpmGroupBindVirq = 0x72,
    VpmGroupUnbindVirq = 0x73,
    VpmGroupGetState = 0x74,

    VrtcConfigure = 0x80,
    VrtcSetTimeBase = 0x81,
    VrtcAttachAddrspace = 0x82,

    PrngGetEntropy = 0x90,
}

impl HypercallId {
    pub fn from_raw(raw: u16) -> Option<Self> {
        use HypercallId::*;
        Some(match raw {
            0x00 => CspaceDeleteCapFrom,
            0x01 => CspaceCopyCapFrom,
            0x02 => CspaceRevokeCapsFrom,
            0x03 => CspaceConfigure,
            0x04 => CspaceAttachThread,
            0x10 => ObjectActivate,
            0x11 => ObjectActivateFrom,
            0x12 => ObjectReset,
            0x20 => AddrspaceConfigure,
            0x21 => AddrspaceAttachThread,
            0x22 => AddrspaceAttachVdma,
            0x23 => AddrspaceMap,
            0x24 => AddrspaceUnmap,
            0x25 => AddrspaceUpdateAccess,
            0x30 => MemextentUnmapAll,
            0x31 => MemextentConfigure,
            0x32 => MemextentConfigureDerive,
            0x40 => VcpuConfigure,
            0x41 => VcpuSetAffinity,
            0x42 => VcpuSetPriority,
            0x43 => VcpuSetTimeslice,
            0x44 => VcpuPoweron,
            0x45 => VcpuPoweroff,
            0x46 => VcpuRun,
            0x47 => VcpuRunCheck,
            0x50 => VicBindVirq,
            0x51 => VicUnbindVirq,
            0x60 => DoorbellBindVirq,
            0x61 => DoorbellUnbindVirq,
            0x62 => DoorbellSend,
            0x63 => DoorbellReceive,
            0x64 => DoorbellReset,
            0x65 => DoorbellMask,
            0x70 => VpmGroupConfigure,
            0x71 => VpmGroupAttachVcpu,
            0x72 => VpmGroupBindVirq,
            0x73 => VpmGroupUnbindVirq,
            0x74 => VpmGroupGetState,
            0x80 => VrtcConfigure,
            0x81 => VrtcSetTimeBase,
            0x82 => VrtcAttachAddrspace,
            0x90 => PrngGetEntropy,
            _ => return None,
        })
    }
}

/// The decoded SMCCC argument/result registers for a single hypercall,
/// following the SMCCC 64-bit convention (x1..x6 args, x0..x3 results with
/// x0 carrying the error code per spec §6).
pub struct Args {
    pub cap: u32,
    pub a: [u64; 5],
}

pub struct Results {
    pub r: [u64; 3],
}

impl Results {
    fn ok(r1: u64, r2: u64, r3: u64) -> Self {
        Self { r: [r1, r2, r3] }
    }
    fn empty() -> Self {
        Self::ok(0, 0, 0)
    }
}

fn mem_attr_from(raw: u64) -> MemAttr {
    match raw {
        1 => MemAttr::Device,
        2 => MemAttr::ReadOnly,
        _ => MemAttr::Normal,
    }
}

/// Dispatch one hypercall, returning SMCCC result registers with the error
/// tag (or `OK`) packed into `r[0]` per spec §6. `cpu` is the physical CPU
/// the call trapped on; the calling cspace is the current thread's own,
/// resolved through [`crate::kernel::KERNEL`], and `args.cap` is looked up
/// against it per-category before the core method runs.
pub fn dispatch(id: HypercallId, cpu: CpuIndex, args: &Args) -> Results {
    let result = dispatch_inner(id, cpu, args);
    match result {
        Ok(mut r) => {
            r.r[0] = HypError::Ok as u64;
            r
        }
        Err(e) => Results::ok(e as u64, 0, 0),
    }
}

fn dispatch_inner(id: HypercallId, cpu: CpuIndex, args: &Args) -> HypResult<Results> {
    let k = &KERNEL;
    match id {
        HypercallId::CspaceConfigure => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Cspace, 0)?;
            let mut slab = k.cspaces.lock();
            let cs = slab.get_mut(idx).and_then(|s| s.as_mut()).ok_or(HypError::CapInvalid)?;
            cs.configure(args.a[0] as u32)?;
            Ok(Results::empty())
        }

        HypercallId::CspaceDeleteCapFrom => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Cspace, 0)?;
            let mut slab = k.cspaces.lock();
            let cs = slab.get_mut(idx).and_then(|s| s.as_mut()).ok_or(HypError::CapInvalid)?;
            cs.delete_cap(args.a[0] as CapId)?;
            Ok(Results::empty())
        }

        HypercallId::CspaceCopyCapFrom => {
            let src_idx = k.resolve_cap(cpu, args.cap, ObjectType::Cspace, 0)?;
            let dst_idx = k.caller_cspace_index(cpu).ok_or(HypError::CapInvalid)?;
            let hint = if args.a[2] == u64::MAX { None } else { Some(args.a[2] as CapId) };
            let mut slab = k.cspaces.lock();
            let new_cap = slab.copy_between(dst_idx, src_idx, hint, args.a[0] as CapId, args.a[1] as u32)?;
            Ok(Results::ok(new_cap as u64, 0, 0))
        }

        HypercallId::CspaceRevokeCapsFrom => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Cspace, 0)?;
            let mut slab = k.cspaces.lock();
            let cs = slab.get_mut(idx).and_then(|s| s.as_mut()).ok_or(HypError::CapInvalid)?;
            cs.revoke_caps(args.a[0] as CapId)?;
            Ok(Results::empty())
        }

        HypercallId::CspaceAttachThread => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Cspace, 0)?;
            let thread_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::ArgumentInvalid)?;
            thread.set_cspace(idx);
            Ok(Results::empty())
        }

        HypercallId::ObjectActivate | HypercallId::ObjectActivateFrom => {
            let (index, object_type) = k.with_caller_cspace_ref(cpu, |cs| cs.lookup_object_any(args.cap))?;
            let header = k.header_for(object_type, index).ok_or(HypError::CapInvalid)?;
            header.activate()?;
            Ok(Results::empty())
        }

        HypercallId::ObjectReset => {
            let (index, object_type) = k.with_caller_cspace_ref(cpu, |cs| cs.lookup_object_any(args.cap))?;
            let header = k.header_for(object_type, index).ok_or(HypError::CapInvalid)?;
            header.deactivate();
            Ok(Results::empty())
        }

        HypercallId::AddrspaceConfigure => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Addrspace, 0)?;
            let a = k.addrspaces.get(idx as usize).ok_or(HypError::CapInvalid)?;
            a.configure(args.a[0] as u16)?;
            Ok(Results::empty())
        }

        HypercallId::AddrspaceAttachThread => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Addrspace, 0)?;
            let thread_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::ArgumentInvalid)?;
            thread.set_addrspace(idx);
            Ok(Results::empty())
        }

        HypercallId::AddrspaceAttachVdma => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Addrspace, 0)?;
            let a = k.addrspaces.get(idx as usize).ok_or(HypError::CapInvalid)?;
            a.attach_vdevice(args.a[0], args.a[1], args.a[2] as u32)?;
            Ok(Results::empty())
        }

        HypercallId::AddrspaceMap => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Addrspace, 0)?;
            let extent_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Memextent, 0)?;
            let a = k.addrspaces.get(idx as usize).ok_or(HypError::CapInvalid)?;
            let extent = k.memextents.get(extent_idx as usize).ok_or(HypError::CapInvalid)?;
            let access = Access::from_bits_truncate(args.a[2] as u8);
            a.map(extent, args.a[1], idx, access, mem_attr_from(args.a[3]))?;
            Ok(Results::empty())
        }

        HypercallId::AddrspaceUnmap => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Addrspace, 0)?;
            let extent_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Memextent, 0)?;
            let a = k.addrspaces.get(idx as usize).ok_or(HypError::CapInvalid)?;
            let extent = k.memextents.get(extent_idx as usize).ok_or(HypError::CapInvalid)?;
            a.unmap(extent, idx)?;
            Ok(Results::empty())
        }

        // No stage-2 permission-update primitive exists yet (map/unmap are
        // the only mutators memextent.rs provides); left unimplemented
        // rather than faked.
        HypercallId::AddrspaceUpdateAccess => Err(HypError::Unimplemented),

        HypercallId::MemextentUnmapAll => {
            let extent_idx = k.resolve_cap(cpu, args.cap, ObjectType::Memextent, 0)?;
            let addrspace_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Addrspace, 0)?;
            let extent = k.memextents.get(extent_idx as usize).ok_or(HypError::CapInvalid)?;
            let a = k.addrspaces.get(addrspace_idx as usize).ok_or(HypError::CapInvalid)?;
            a.unmap_all_of(extent)?;
            Ok(Results::empty())
        }

        HypercallId::MemextentConfigure => {
            let extent_idx = k.resolve_cap(cpu, args.cap, ObjectType::Memextent, 0)?;
            let extent = k.memextents.get(extent_idx as usize).ok_or(HypError::CapInvalid)?;
            let partition_id = extent.header.partition;
            let partition = k.partitions.get(partition_id).ok_or(HypError::ArgumentInvalid)?;
            let access = Access::from_bits_truncate(args.a[2] as u8);
            extent.configure(
                partition,
                &k.memdb,
                partition_id,
                extent_idx,
                args.a[0],
                args.a[1],
                mem_attr_from(args.a[3]),
                access,
            )?;
            Ok(Results::empty())
        }

        HypercallId::MemextentConfigureDerive => {
            let extent_idx = k.resolve_cap(cpu, args.cap, ObjectType::Memextent, 0)?;
            let parent_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Memextent, 0)?;
            let extent = k.memextents.get(extent_idx as usize).ok_or(HypError::CapInvalid)?;
            let parent = k.memextents.get(parent_idx as usize).ok_or(HypError::CapInvalid)?;
            extent.configure_derive(parent, parent_idx, args.a[1], args.a[2])?;
            Ok(Results::empty())
        }

        HypercallId::VcpuConfigure => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            thread.set_entry(args.a[0], args.a[1]);
            Ok(Results::empty())
        }

        HypercallId::VcpuSetAffinity => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            let target = CpuIndex::new(args.a[0] as usize).ok_or(HypError::ArgumentInvalid)?;
            thread.set_affinity(Some(target))?;
            Ok(Results::empty())
        }

        HypercallId::VcpuSetPriority => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            thread.set_base_priority(args.a[0] as u8);
            Ok(Results::empty())
        }

        HypercallId::VcpuSetTimeslice => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            thread.set_timeslice_ticks(args.a[0]);
            Ok(Results::empty())
        }

        HypercallId::VcpuPoweron => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let came_online = crate::vcpu::lifecycle::poweron(&k.scheduler, &k.power, thread_idx, args.a[0], args.a[1])?;
            Ok(Results::ok(came_online as u64, 0, 0))
        }

        HypercallId::VcpuPoweroff => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let target = CpuIndex::new(args.a[0] as usize).ok_or(HypError::ArgumentInvalid)?;
            let cur_ticks = crate::platform::timer_get_current_ticks();
            crate::vcpu::lifecycle::poweroff(&k.scheduler, &k.power, target, thread_idx, cur_ticks)?;
            Ok(Results::empty())
        }

        HypercallId::VcpuRun => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            let vgic_idx = thread.vgic_index().ok_or(HypError::ObjectConfig)? as usize;
            let vic = k.vics.get(vgic_idx).ok_or(HypError::CapInvalid)?;
            let resume_value = if args.a[0] != 0 { Some(args.a[1]) } else { None };
            let cur_ticks = crate::platform::timer_get_current_ticks();
            let run = k.vcpu_runs.for_thread(thread_idx);
            let state = run.run(&k.scheduler, vic, k.doorbells.all(), cpu, cur_ticks, resume_value)?;
            let (tag, ipa) = match state {
                crate::vcpu::run::RunState::Ready => (0u64, 0u64),
                crate::vcpu::run::RunState::Blocked => (1, 0),
                crate::vcpu::run::RunState::PoweredOff => (2, 0),
                crate::vcpu::run::RunState::AddrspaceVmmioRead { ipa, size } => (3 | (size << 8), ipa),
                crate::vcpu::run::RunState::AddrspaceVmmioWrite { ipa, size } => (4 | (size << 8), ipa),
            };
            Ok(Results::ok(tag, ipa, 0))
        }

        HypercallId::VcpuRunCheck => {
            let thread_idx = k.resolve_cap(cpu, args.cap, ObjectType::Thread, 0)?;
            let thread = k.scheduler.thread(thread_idx).ok_or(HypError::CapInvalid)?;
            Ok(Results::ok(thread.run_enabled() as u64, 0, 0))
        }

        HypercallId::VicBindVirq => {
            let vic_idx = k.resolve_cap(cpu, args.cap, ObjectType::Vic, 0)? as usize;
            let vic = k.vics.get(vic_idx).ok_or(HypError::CapInvalid)?;
            let virq = Virq::Spi(args.a[0] as u16);
            vic.configure_virq(virq, args.a[2] != 0, args.a[3] as u8, args.a[4] as u8)?;
            vic.enable_virq(virq, true)?;
            vic.set_spi_route(args.a[0] as u16, args.a[1] as usize)?;
            Ok(Results::empty())
        }

        HypercallId::VicUnbindVirq => {
            let vic_idx = k.resolve_cap(cpu, args.cap, ObjectType::Vic, 0)? as usize;
            let vic = k.vics.get(vic_idx).ok_or(HypError::CapInvalid)?;
            vic.unbind_vcpu(args.a[0] as usize)?;
            Ok(Results::empty())
        }

        HypercallId::DoorbellBindVirq => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            db.bind_virq(Virq::Spi(args.a[0] as u16));
            Ok(Results::empty())
        }

        HypercallId::DoorbellUnbindVirq => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            db.unbind_virq();
            Ok(Results::empty())
        }

        HypercallId::DoorbellSend => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let vic_idx = k.resolve_cap(cpu, args.a[1] as u32, ObjectType::Vic, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            let vic = k.vics.get(vic_idx).ok_or(HypError::CapInvalid)?;
            db.send(args.a[0], vic)?;
            Ok(Results::empty())
        }

        HypercallId::DoorbellReceive => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            let flags = db.receive(args.a[0]);
            Ok(Results::ok(flags, 0, 0))
        }

        HypercallId::DoorbellReset => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            db.reset();
            Ok(Results::empty())
        }

        HypercallId::DoorbellMask => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Doorbell, 0)? as usize;
            let vic_idx = k.resolve_cap(cpu, args.a[2] as u32, ObjectType::Vic, 0)? as usize;
            let db = k.doorbells.get(idx).ok_or(HypError::CapInvalid)?;
            let vic = k.vics.get(vic_idx).ok_or(HypError::CapInvalid)?;
            db.mask(args.a[0], args.a[1], vic)?;
            Ok(Results::empty())
        }

        HypercallId::VpmGroupConfigure => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::VpmGroup, 0)? as usize;
            let g = k.vpm_groups.get(idx).ok_or(HypError::CapInvalid)?;
            g.configure()?;
            Ok(Results::empty())
        }

        HypercallId::VpmGroupAttachVcpu => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::VpmGroup, 0)? as usize;
            let g = k.vpm_groups.get(idx).ok_or(HypError::CapInvalid)?;
            g.attach_vcpu(args.a[0] as usize)?;
            Ok(Results::empty())
        }

        HypercallId::VpmGroupBindVirq => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::VpmGroup, 0)? as usize;
            let g = k.vpm_groups.get(idx).ok_or(HypError::CapInvalid)?;
            g.bind_virq(Virq::Spi(args.a[0] as u16));
            Ok(Results::empty())
        }

        HypercallId::VpmGroupUnbindVirq => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::VpmGroup, 0)? as usize;
            let g = k.vpm_groups.get(idx).ok_or(HypError::CapInvalid)?;
            g.unbind_virq();
            Ok(Results::empty())
        }

        HypercallId::VpmGroupGetState => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::VpmGroup, 0)? as usize;
            let g = k.vpm_groups.get(idx).ok_or(HypError::CapInvalid)?;
            Ok(Results::ok(g.state() as u64, 0, 0))
        }

        HypercallId::VrtcConfigure => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Vrtc, 0)? as usize;
            let v = k.vrtcs.get(idx).ok_or(HypError::CapInvalid)?;
            v.configure()?;
            Ok(Results::empty())
        }

        HypercallId::VrtcSetTimeBase => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Vrtc, 0)? as usize;
            let v = k.vrtcs.get(idx).ok_or(HypError::CapInvalid)?;
            v.set_time_base(args.a[0] as i64);
            Ok(Results::empty())
        }

        HypercallId::VrtcAttachAddrspace => {
            let idx = k.resolve_cap(cpu, args.cap, ObjectType::Vrtc, 0)? as usize;
            let addrspace_idx = k.resolve_cap(cpu, args.a[0] as u32, ObjectType::Addrspace, 0)?;
            let v = k.vrtcs.get(idx).ok_or(HypError::CapInvalid)?;
            v.attach_addrspace(addrspace_idx)?;
            Ok(Results::empty())
        }

        HypercallId::PrngGetEntropy => {
            let mut buf = [0u8; 32];
            crate::prng::get_entropy256(&mut buf);
            let lo = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            let hi = u64::from_le_bytes(buf[8..16].try_into().unwrap());
            Ok(Results::ok(lo, hi, 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_raw_id_is_none() {
        assert!(HypercallId::from_raw(0xffff).is_none());
    }

    #[test]
    fn prng_hypercall_returns_ok() {
        let cpu = CpuIndex::new(0).unwrap();
        let r = dispatch(HypercallId::PrngGetEntropy, cpu, &Args { cap: 0, a: [0; 5] });
        assert_eq!(r.r[0], HypError::Ok as u64);
    }

    #[test]
    fn unresolved_capability_packs_error_in_r0() {
        let cpu = CpuIndex::new(0).unwrap();
        let r = dispatch(HypercallId::VcpuPoweron, cpu, &Args { cap: 0, a: [0; 5] });
        assert_eq!(r.r[0], HypError::CapInvalid as u64);
    }
}
