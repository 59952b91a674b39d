//! Memory management: partitions, the free-list allocator, the physical
//! ownership map, memory extents, and guest address spaces (spec §4.B, §4.D).

pub mod addrspace;
pub mod allocator;
pub mod memdb;
pub mod memextent;
pub mod partition;

pub use addrspace::{Addrspace, AddrspaceSlab};
pub use memdb::Memdb;
pub use memextent::{Access, MemAttr, Memextent, MemextentSlab};
pub use partition::{Partition, PartitionSlab, PRIVATE_PARTITION, ROOT_PARTITION};
