//! Cross-VM notification and deferred-work primitives (spec §4.K).

pub mod doorbell;
pub mod task_queue;
pub mod vpm;
pub mod vrtc;
pub mod wait_queue;

pub use doorbell::{Doorbell, DoorbellSlab};
pub use task_queue::{TaskClass, TaskQueue};
pub use vpm::{GroupState, VpmGroup, VpmGroupSlab};
pub use vrtc::{Vrtc, VrtcSlab};
pub use wait_queue::{WaitQueue, WaitQueueSlab};
