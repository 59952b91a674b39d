//! SMCCC function-ID decode and owner dispatch shell (spec §4.L).
//!
//! Decodes the function-ID word the trap handler hands over after an SMC/HVC
//! exception, routes it by owner namespace, and for `OWNER_VENDOR_HYP`
//! delegates the numbered hypercall table to [`crate::object::hypercall`].
//! Every other owner is either answered directly (ARCH) or forwarded
//! untouched to the secure side (STANDARD/PSCI) via
//! [`crate::ffa::smc_forward`], matching how the teacher's FF-A path already
//! forwards validated calls to EL3.

use crate::object::hypercall::{self, HypercallId};
use crate::primitives::cpulocal::CpuIndex;

/// SMCCC function-ID bit layout (ARM DEN0028).
const FAST_CALL: u32 = 1 << 31;
const SMC64: u32 = 1 << 30;
const OWNER_SHIFT: u32 = 24;
const OWNER_MASK: u32 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Arch,
    Cpu,
    Sip,
    Oem,
    Standard,
    StandardHyp,
    VendorHyp,
    TrustedOs,
    Unknown(u32),
}

impl Owner {
    fn from_bits(owner: u32) -> Self {
        match owner {
            0 => Owner::Arch,
            1 => Owner::Cpu,
            2 => Owner::Sip,
            3 => Owner::Oem,
            4 => Owner::Standard,
            5 => Owner::StandardHyp,
            6 => Owner::VendorHyp,
            48..=63 => Owner::TrustedOs,
            n => Owner::Unknown(n),
        }
    }
}

pub struct FunctionId {
    pub is_fast: bool,
    pub is_smc64: bool,
    pub owner: Owner,
    pub function: u16,
}

pub fn decode(function_id: u32) -> FunctionId {
    FunctionId {
        is_fast: function_id & FAST_CALL != 0,
        is_smc64: function_id & SMC64 != 0,
        owner: Owner::from_bits((function_id >> OWNER_SHIFT) & OWNER_MASK),
        function: (function_id & 0xFFFF) as u16,
    }
}

/// SMCCC_VERSION / ARCH_FEATURES function numbers (OWNER_ARCH).
const ARCH_FN_VERSION: u16 = 0x0000;
const ARCH_FN_FEATURES: u16 = 0x0001;

/// `SMCCC_UNKNOWN_FUNCTION64`, returned for any call this shell does not
/// recognize, per spec §4.L "to satisfy a defined ABI".
pub const UNKNOWN_FUNCTION: i64 = -1;

/// Result of one SMCCC call: up to 4 result registers, following the
/// convention the teacher's [`crate::ffa::smc_forward::SmcResult`] already
/// uses.
pub struct CallResult {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
}

impl CallResult {
    fn single(x0: i64) -> Self {
        Self { x0: x0 as u64, x1: 0, x2: 0, x3: 0 }
    }
}

/// Dispatch one decoded SMC/HVC call. `cap` and `args` are the vendor-hyp
/// argument registers (x1..x6), passed through unchanged to
/// [`hypercall::dispatch`] when `owner == VendorHyp`. `cpu` is the physical
/// CPU the trap was taken on, which the vendor-hyp path needs to resolve
/// the calling cspace (spec §6 "the calling cspace is the current thread's
/// own").
pub fn dispatch(id: FunctionId, cpu: CpuIndex, cap: u32, args: [u64; 5]) -> CallResult {
    match id.owner {
        Owner::Arch => dispatch_arch(id.function),
        Owner::Standard => forward_to_secure(id, cap, args),
        Owner::StandardHyp => dispatch_standard_hyp(id.function, args),
        Owner::VendorHyp => dispatch_vendor_hyp(id.function, cpu, cap, args),
        _ => CallResult::single(UNKNOWN_FUNCTION),
    }
}

fn dispatch_arch(function: u16) -> CallResult {
    match function {
        ARCH_FN_VERSION => CallResult::single(1 << 16), // SMCCC v1.0
        ARCH_FN_FEATURES => CallResult::single(0),
        _ => CallResult::single(UNKNOWN_FUNCTION),
    }
}

/// PV-time (stolen-time IPA / features). Not a named module of its own
/// (spec §1 Non-goals excludes emulating legacy system registers; PV-time
/// is a thin constant query, not a register model), so it's answered
/// directly here rather than via a dedicated handler.
fn dispatch_standard_hyp(function: u16, _args: [u64; 5]) -> CallResult {
    const PV_TIME_FEATURES: u16 = 0x0020;
    const PV_TIME_ST: u16 = 0x0021;
    match function {
        PV_TIME_FEATURES => CallResult::single(0),
        PV_TIME_ST => CallResult::single(UNKNOWN_FUNCTION), // no stolen-time IPA configured
        _ => CallResult::single(UNKNOWN_FUNCTION),
    }
}

const VENDOR_HYP_UID: u16 = 0xFF01;
const VENDOR_HYP_REVISION: u16 = 0xFF03;

fn dispatch_vendor_hyp(function: u16, cpu: CpuIndex, cap: u32, args: [u64; 5]) -> CallResult {
    match function {
        VENDOR_HYP_UID => CallResult { x0: 0, x1: 0, x2: 0, x3: 0 },
        VENDOR_HYP_REVISION => CallResult::single(1),
        _ => {
            let Some(hyp_id) = HypercallId::from_raw(function) else {
                return CallResult::single(UNKNOWN_FUNCTION);
            };
            let r = hypercall::dispatch(hyp_id, cpu, &hypercall::Args { cap, a: args });
            CallResult { x0: r.r[0], x1: r.r[1], x2: r.r[2], x3: 0 }
        }
    }
}

/// PSCI calls (`OWNER_STANDARD`) are forwarded to the secure monitor rather
/// than emulated here, matching the teacher's existing FF-A forwarding path
/// and spec §1's Non-goal of modeling physical firmware.
#[cfg(target_arch = "aarch64")]
fn forward_to_secure(id: FunctionId, _cap: u32, args: [u64; 5]) -> CallResult {
    const OWNER_STANDARD_RAW: u32 = 4;
    let function_id = (if id.is_fast { FAST_CALL } else { 0 })
        | (if id.is_smc64 { SMC64 } else { 0 })
        | (OWNER_STANDARD_RAW << OWNER_SHIFT)
        | id.function as u32;
    let r = crate::ffa::smc_forward::forward_smc(
        function_id as u64,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4],
        0,
        0,
    );
    CallResult { x0: r.x0, x1: r.x1, x2: r.x2, x3: r.x3 }
}

#[cfg(not(target_arch = "aarch64"))]
fn forward_to_secure(_id: FunctionId, _cap: u32, _args: [u64; 5]) -> CallResult {
    CallResult::single(UNKNOWN_FUNCTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_fast_smc64_owner_and_function() {
        let raw = FAST_CALL | SMC64 | (6 << OWNER_SHIFT) | 0x90;
        let id = decode(raw);
        assert!(id.is_fast);
        assert!(id.is_smc64);
        assert_eq!(id.owner, Owner::VendorHyp);
        assert_eq!(id.function, 0x90);
    }

    #[test]
    fn unknown_function_returns_the_smccc_sentinel() {
        let id = decode(FAST_CALL | SMC64 | (6 << OWNER_SHIFT) | 0x1234);
        let r = dispatch(id, CpuIndex::new(0).unwrap(), 0, [0; 5]);
        assert_eq!(r.x0 as i64, UNKNOWN_FUNCTION);
    }

    #[test]
    fn vendor_hyp_prng_routes_through_hypercall_dispatch() {
        let id = decode(FAST_CALL | SMC64 | (6 << OWNER_SHIFT) | 0x90);
        let r = dispatch(id, CpuIndex::new(0).unwrap(), 0, [0; 5]);
        assert_eq!(r.x0, crate::error::HypError::Ok as u64);
    }

    #[test]
    fn arch_version_reports_v1_0() {
        let id = decode(FAST_CALL | (0 << OWNER_SHIFT) | ARCH_FN_VERSION as u32);
        let r = dispatch(id, CpuIndex::new(0).unwrap(), 0, [0; 5]);
        assert_eq!(r.x0, 1 << 16);
    }
}
