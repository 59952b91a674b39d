//! Physical-address ownership map (spec §3 "Memdb", §4.B).
//!
//! A transactional map from a physical address range to an (owner, type)
//! pair. Ranges are non-overlapping and are expected to completely tile
//! installed RAM minus reserved image regions (spec §3 invariant). Backed by
//! a fixed-capacity sorted array under a single spinlock rather than a true
//! lock-free RCU-published tree — the teacher has no precedent for a
//! lock-free tree and the core never allocates, so a bounded array is the
//! natural generalization (documented simplification, see `DESIGN.md`).
//! [`lookup`] still wraps the read in an RCU read-section guard so callers
//! get the spec's `rcu::read_start/finish` discipline even though this
//! implementation's particular backing store happens to also take a lock.

use crate::limits::MAX_MEMDB_RANGES;
use crate::object::header::PartitionId;
use crate::primitives::spinlock::SpinLock;
use crate::error::{HypError, HypResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemdbType {
    Partition,
    Allocator,
    Extent,
    PartitionNoMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub partition: PartitionId,
    pub object_index: u32,
    pub kind: MemdbType,
}

#[derive(Clone, Copy)]
struct Range {
    start: u64,
    end: u64,
    owner: Owner,
}

struct Table {
    ranges: [Option<Range>; MAX_MEMDB_RANGES],
    len: usize,
}

impl Table {
    const fn new() -> Self {
        const NONE: Option<Range> = None;
        Self { ranges: [NONE; MAX_MEMDB_RANGES], len: 0 }
    }

    fn find_index(&self, addr: u64) -> Option<usize> {
        self.ranges[..self.len]
            .iter()
            .position(|r| matches!(r, Some(r) if r.start <= addr && addr < r.end))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.ranges[..self.len]
            .iter()
            .any(|r| matches!(r, Some(r) if start < r.end && r.start < end))
    }

    fn remove_at(&mut self, idx: usize) {
        for i in idx..self.len - 1 {
            self.ranges[i] = self.ranges[i + 1];
        }
        self.ranges[self.len - 1] = None;
        self.len -= 1;
    }

    fn push(&mut self, r: Range) -> HypResult<()> {
        if self.len == MAX_MEMDB_RANGES {
            return Err(HypError::NoResources);
        }
        self.ranges[self.len] = Some(r);
        self.len += 1;
        Ok(())
    }
}

pub struct Memdb {
    table: SpinLock<Table>,
}

impl Memdb {
    pub const fn new() -> Self {
        Self { table: SpinLock::new(Table::new()) }
    }

    /// Claim a fresh range. Fails with `Busy` if any byte in `[start,end)` is
    /// already owned (spec: "fails if any byte is already owned").
    pub fn insert(&self, start: u64, end: u64, owner: Owner) -> HypResult<()> {
        let mut t = self.table.lock();
        if t.overlaps(start, end) {
            return Err(HypError::Busy);
        }
        if t.len == MAX_MEMDB_RANGES {
            return Err(HypError::NoResources);
        }
        let len = t.len;
        t.ranges[len] = Some(Range { start, end, owner });
        t.len += 1;
        Ok(())
    }

    /// Atomically exchange ownership of `[start,end)`, but only if the whole
    /// range currently lies within one existing range owned by `expect`
    /// (spec: "atomically exchanges ownership ... only if every byte
    /// currently matches the expected pair"). `[start,end)` need not equal
    /// the existing range exactly: a strict sub-range is carved out of it,
    /// leaving up to two remainder ranges under the original owner (this is
    /// how a sparse memextent donates part of its parent's single basic
    /// range — see `Memextent::donate_child`/`donate_sibling`).
    pub fn update(&self, start: u64, end: u64, new_owner: Owner, expect: Owner) -> HypResult<()> {
        let mut t = self.table.lock();
        let idx = match t.find_index(start) {
            Some(i) => i,
            None => return Err(HypError::ArgumentInvalid),
        };
        let existing = t.ranges[idx].unwrap();
        if start < existing.start || end > existing.end || existing.owner != expect {
            return Err(HypError::Busy);
        }

        let needs_head = start > existing.start;
        let needs_tail = end < existing.end;
        let extra_slots = needs_head as usize + needs_tail as usize;
        if t.len + extra_slots > MAX_MEMDB_RANGES {
            return Err(HypError::NoResources);
        }

        t.remove_at(idx);
        if needs_head {
            t.push(Range { start: existing.start, end: start, owner: existing.owner })?;
        }
        t.push(Range { start, end, owner: new_owner })?;
        if needs_tail {
            t.push(Range { start: end, end: existing.end, owner: existing.owner })?;
        }
        Ok(())
    }

    /// Look up the owner of `pa`. Per spec, callers should hold an RCU read
    /// section since in a real lock-free implementation the prior owner may
    /// be freed after the next grace period; this implementation's lock
    /// already prevents that, but the guard is taken anyway for interface
    /// fidelity.
    pub fn lookup(&self, pa: u64) -> Option<Owner> {
        let _guard = crate::primitives::rcu::read_start();
        let t = self.table.lock();
        t.find_index(pa).map(|i| t.ranges[i].unwrap().owner)
    }

    pub fn range_count(&self) -> usize {
        self.table.lock().len
    }
}

impl Default for Memdb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(kind: MemdbType) -> Owner {
        Owner { partition: PartitionId(0), object_index: 0, kind }
    }

    #[test]
    fn insert_rejects_overlap() {
        let db = Memdb::new();
        db.insert(0x1000, 0x2000, owner(MemdbType::Partition)).unwrap();
        assert_eq!(db.insert(0x1800, 0x2800, owner(MemdbType::Extent)), Err(HypError::Busy));
        db.insert(0x2000, 0x3000, owner(MemdbType::Extent)).unwrap();
    }

    #[test]
    fn update_requires_exact_expected_match() {
        let db = Memdb::new();
        let part = owner(MemdbType::Partition);
        let extent = owner(MemdbType::Extent);
        db.insert(0x1000, 0x2000, part).unwrap();
        assert_eq!(db.update(0x1000, 0x2000, extent, extent), Err(HypError::Busy));
        db.update(0x1000, 0x2000, extent, part).unwrap();
        assert_eq!(db.lookup(0x1500), Some(extent));
    }

    #[test]
    fn lookup_misses_unowned_address() {
        let db = Memdb::new();
        assert!(db.lookup(0x9999).is_none());
    }

    #[test]
    fn update_splits_strict_interior_subrange() {
        let db = Memdb::new();
        let parent = owner(MemdbType::Extent);
        let child = owner(MemdbType::Allocator);
        db.insert(0x1000, 0x5000, parent).unwrap();

        db.update(0x2000, 0x3000, child, parent).unwrap();
        assert_eq!(db.lookup(0x1500), Some(parent));
        assert_eq!(db.lookup(0x2500), Some(child));
        assert_eq!(db.lookup(0x3500), Some(parent));
        assert_eq!(db.range_count(), 3);

        // The remainder is still two separate parent-owned ranges until a
        // matching reverse update recombines the interior piece.
        assert_eq!(db.update(0x0000, 0x1000, child, parent), Err(HypError::ArgumentInvalid));
    }

    #[test]
    fn update_splits_edge_aligned_subrange() {
        let db = Memdb::new();
        let parent = owner(MemdbType::Extent);
        let child = owner(MemdbType::Allocator);
        db.insert(0x1000, 0x4000, parent).unwrap();

        db.update(0x1000, 0x2000, child, parent).unwrap();
        assert_eq!(db.lookup(0x1500), Some(child));
        assert_eq!(db.lookup(0x2500), Some(parent));
        assert_eq!(db.range_count(), 2);
    }
}
