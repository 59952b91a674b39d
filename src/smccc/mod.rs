//! SMCCC function-ID decode and owner dispatch shell (spec §4.L).

pub mod dispatch;

pub use dispatch::{decode, CallResult, FunctionId, Owner, UNKNOWN_FUNCTION};
