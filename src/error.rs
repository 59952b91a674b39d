//! Result-typed error taxonomy (spec §7).
//!
//! Every core API returns `Result<T, HypError>`. There are no exceptions and
//! no panics on expected-failure paths; `panic!` is reserved for the fatal
//! class (bring-up failures, broken invariants) and always follows with an
//! `ipi::abort_stop()` broadcast before halting (see [`crate::sched::ipi`]).

use core::fmt;

/// A single error tag, returned in the first hypercall result register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HypError {
    /// Operation completed successfully. Never constructed as an `Err`;
    /// kept here only so the hypercall ABI can encode it as result 0.
    Ok = 0,

    // Argument errors.
    ArgumentInvalid,
    ArgumentSize,
    ArgumentAlignment,
    AddrInvalid,
    AddrOverflow,

    // State errors.
    ObjectState,
    ObjectConfig,
    Busy,
    Idle,
    Unimplemented,

    // Capability errors.
    CapInvalid,
    WrongObjectType,
    InsufficientRights,

    // Resource errors.
    NoMemory,
    NoResources,

    // Transient.
    Retry,

    // vgic-specific.
    VirqNotBound,

    // Fatal (surfaced, not necessarily a panic).
    Failure,
    NoEntropy,
    Denied,
}

pub type HypResult<T> = Result<T, HypError>;

impl fmt::Display for HypError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HypError::Ok => "ok",
            HypError::ArgumentInvalid => "argument invalid",
            HypError::ArgumentSize => "argument size invalid",
            HypError::ArgumentAlignment => "argument alignment invalid",
            HypError::AddrInvalid => "address invalid",
            HypError::AddrOverflow => "address range overflows",
            HypError::ObjectState => "object in wrong lifecycle state",
            HypError::ObjectConfig => "object missing required configuration",
            HypError::Busy => "operation conflicts with one in flight",
            HypError::Idle => "nothing to cancel",
            HypError::Unimplemented => "operation not implemented",
            HypError::CapInvalid => "capability invalid",
            HypError::WrongObjectType => "capability refers to wrong object type",
            HypError::InsufficientRights => "capability lacks required rights",
            HypError::NoMemory => "partition out of memory",
            HypError::NoResources => "no free slots for this object kind",
            HypError::Retry => "transient conflict, retry",
            HypError::VirqNotBound => "virq source not bound to a live vic/vcpu",
            HypError::Failure => "platform or bring-up failure",
            HypError::NoEntropy => "entropy source exhausted",
            HypError::Denied => "operation denied by policy",
        };
        f.write_str(s)
    }
}

impl core::error::Error for HypError {}

/// Pack an error (or `Ok`) into the SMCCC-style first result register,
/// per §6: "All hypercalls return an error code in the first result
/// register; success is `OK`."
pub fn to_result_register<T>(r: &HypResult<T>) -> u64 {
    match r {
        Ok(_) => HypError::Ok as u64,
        Err(e) => *e as u64,
    }
}
