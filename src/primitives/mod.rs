//! Building-block primitives shared by every other module (spec §4.A).
//!
//! Typed bitmaps, an intrusive ordered list with RCU-safe deletion, atomic
//! reference counts, a ticket spinlock, per-CPU storage, and a low-power
//! event-wait primitive. Nothing here knows about objects, capabilities, or
//! scheduling; those are built on top in [`crate::object`] and [`crate::sched`].

pub mod bitmap;
pub mod cpulocal;
pub mod event;
pub mod list;
pub mod rcu;
pub mod refcount;
pub mod spinlock;

pub use cpulocal::CpuIndex;
pub use refcount::Refcount;
pub use spinlock::{SpinLock, SpinLockGuard};
