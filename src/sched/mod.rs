//! Scheduling substrate (spec §4.E, §4.F, §4.G): threads, the FPRR/trivial
//! scheduler, the IPI layer, idle handling and nestable preempt-disable.

pub mod idle;
pub mod ipi;
pub mod preempt;
pub mod scheduler;
pub mod thread;

pub use scheduler::Scheduler;
pub use thread::{BlockReason, Thread, ThreadKind};
