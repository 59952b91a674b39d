//! VCPU lifecycle and trap/dispatch plane (spec §4.I): power state
//! transitions, the WFI trap fastpath, and proxy `vcpu_run`.
//!
//! A VCPU is a [`crate::sched::Thread`] of kind [`crate::sched::ThreadKind::Vcpu`];
//! this module adds the state machine and scheduling choreography around it
//! rather than a separate object type, the same way the teacher's own
//! vCPU handling was just another code path over its thread/runqueue
//! machinery.

pub mod lifecycle;
pub mod run;
pub mod wfi;

pub use lifecycle::{poweroff, poweron, warm_reset, PoweroffHandler};
pub use run::{RunState, VcpuRun, VcpuRunSlab};
pub use wfi::{wfi_trap, WfiHandler, WfiOutcome};
