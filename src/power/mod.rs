//! Power management: per-CPU vote/state machine, retry timers, and blocking
//! RCU synchronization (spec §4.H).

pub mod power;
pub mod rcu_sync;
pub mod timer;

pub use power::{CpuPowerState, Power, WarmInitOutcome};
pub use rcu_sync::RcuSync;
pub use timer::{TimerAction, TimerId, TimerQueue};
