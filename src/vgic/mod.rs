//! Virtual interrupt controller (spec §4.J).
//!
//! Arch-independent VIRQ delivery state machine and VIC object. The byte
//! layout of physical GIC registers (`ICC_*_EL1`, `ICH_*_EL2`) stays in
//! [`crate::arch::aarch64::peripherals::gicv3`]; this module only tracks
//! which abstract list-register slot holds which virq and hands that back
//! to the arch layer to actually program.

pub mod delivery_state;
pub mod route;
pub mod vic;

pub use delivery_state::{LevelSource, Snapshot, VirqDeliveryState};
pub use vic::{Vic, VicSlab, Virq};
