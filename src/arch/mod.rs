//! Architecture-specific code
//!
//! This module contains architecture-specific implementations and
//! portable trait definitions for hypervisor hardware abstraction.

pub mod traits;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

// Non-aarch64 builds occur only under `cargo test` on a host machine (the
// `aarch64-unknown-none` target this crate actually ships on has no other
// use). `host` stands in for the handful of arch-level types the rest of
// the core names directly (`CpuContext`, `Trampoline`) so that scheduler,
// object, and primitive unit tests build and run without a cross toolchain.
#[cfg(not(target_arch = "aarch64"))]
pub mod host;

#[cfg(not(target_arch = "aarch64"))]
pub use host::*;
