//! SMC forwarding to the secure monitor at EL3.
//!
//! The teacher's FF-A proxy trapped and emulated a full Arm FF-A exchange
//! between guests and a secure partition manager. This kernel forwards
//! standard-owner SMC64/SMC32 calls (PSCI in particular) straight through
//! instead of modeling that firmware, so only the raw forwarding primitive
//! survives here; see [`crate::smccc::dispatch`] for the owner-routing table
//! that calls it.

pub mod smc_forward;
