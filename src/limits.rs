//! Compile-time capacity constants.
//!
//! The core never allocates dynamically (see [`crate::mem::allocator`]); every
//! bounded collection is sized by a constant here so the whole static
//! footprint is visible in one place, the way `platform::MAX_SMP_CPUS` and
//! `vm::MAX_VCPUS` worked in the single-VM teacher.

/// Maximum physical CPUs in the system.
pub const MAX_CORES: usize = 8;

/// Maximum live partitions (including the private and root partitions).
pub const MAX_PARTITIONS: usize = 16;

/// Maximum live threads (VCPUs + kernel service threads) system-wide.
pub const MAX_THREADS: usize = 64;

/// Maximum live cspaces.
pub const MAX_CSPACES: usize = 32;

/// Size of the global revocation-epoch table (`object::cspace`), indexed by
/// object slab index and shared by every cspace in the system so that a
/// revocation made through one cspace is visible to a descendant cap copied
/// into any other.
pub const MAX_REVOKE_EPOCH_SLOTS: usize = 64;

/// Two-level cspace geometry: `cap_id` splits into (L1 index, L2 index).
pub const CSPACE_L1_BITS: u32 = 6;
pub const CSPACE_L2_BITS: u32 = 6;
pub const CSPACE_L1_SIZE: usize = 1 << CSPACE_L1_BITS;
pub const CSPACE_L2_SIZE: usize = 1 << CSPACE_L2_BITS;
pub const CSPACE_MAX_CAPS: usize = CSPACE_L1_SIZE * CSPACE_L2_SIZE;

/// Maximum live memory extents.
pub const MAX_MEMEXTENTS: usize = 64;

/// Maximum live address spaces (one per VM, typically).
pub const MAX_ADDRSPACES: usize = 16;

/// Maximum vdevice ranges registered per address space.
pub const MAX_VDEVICES_PER_ADDRSPACE: usize = 16;

/// Maximum live VICs (virtual interrupt controllers), one per VM.
pub const MAX_VICS: usize = 16;

/// Number of SPIs backed by a VIC (INTIDs 32..32+MAX_SPIS).
pub const MAX_SPIS: usize = 224;

/// Number of private IRQs (SGIs 0-15 + PPIs 16-31) per VCPU.
pub const MAX_PRIVATE_IRQS: usize = 32;

/// Maximum VCPUs bound to a single VIC.
pub const MAX_VCPUS_PER_VIC: usize = 8;

/// Number of hardware list registers modeled per VCPU.
pub const MAX_LIST_REGISTERS: usize = 4;

/// Maximum entries held in a VIC's deferred (LR-overflow) virq queue.
pub const MAX_DEFERRED_VIRQS: usize = 16;

/// Maximum live doorbells.
pub const MAX_DOORBELLS: usize = 32;

/// Maximum live wait queues.
pub const MAX_WAIT_QUEUES: usize = 32;

/// Maximum waiters parked on a single wait queue.
pub const MAX_WAITERS_PER_QUEUE: usize = MAX_THREADS;

/// Maximum live vPM (paravirt power) groups.
pub const MAX_VPM_GROUPS: usize = 8;

/// Maximum live vRTC instances.
pub const MAX_VRTCS: usize = 4;

/// Maximum outstanding timers per CPU.
pub const MAX_TIMERS_PER_CPU: usize = 32;

/// Maximum outstanding one-shot task-queue entries per CPU.
pub const MAX_TASK_QUEUE_ENTRIES_PER_CPU: usize = 16;

/// Maximum threads parked in `power::rcu_sync` waiting on a grace period.
pub const MAX_RCU_WAITERS: usize = MAX_THREADS;

/// Maximum entries in the bounded trace ring.
pub const TRACE_RING_CAPACITY: usize = 256;

/// Maximum live partitions' worth of allocator metadata is unbounded (the
/// free list lives inline in freed memory itself, see
/// [`crate::mem::allocator`]); this bounds `memdb`'s ownership table instead.
pub const MAX_MEMDB_RANGES: usize = 256;

/// Minimum free block size the partition allocator will track; anything
/// smaller is withheld rather than fragment the free list (spec §4.B).
pub const MIN_FREE_BLOCK: u64 = 32;

/// Scheduler priority levels (FPRR variant). 0 is lowest.
pub const NUM_PRIORITIES: usize = 16;

/// Default/idle priority.
pub const PRIORITY_IDLE: u8 = 0;

/// Highest priority a VCPU may request.
pub const PRIORITY_MAX: u8 = (NUM_PRIORITIES - 1) as u8;
