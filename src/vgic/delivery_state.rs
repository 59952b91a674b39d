//! Virtual IRQ delivery-state word (spec §3 "VIRQ delivery state", §4.J).
//!
//! Every virtual IRQ's state is a single `AtomicU64` bitfield word, mutated
//! only via CAS loops so a reader always observes one consistent snapshot
//! rather than a torn mix of fields (spec: "Concurrency: only modified by
//! CAS; readers observe consistent snapshots").

use core::sync::atomic::{AtomicU64, Ordering};

const ENABLED: u64 = 1 << 0;
const PENDING_EDGE: u64 = 1 << 1;
const LEVEL_SW: u64 = 1 << 2;
const LEVEL_MSG: u64 = 1 << 3;
const LEVEL_SRC: u64 = 1 << 4;
const ACTIVE: u64 = 1 << 5;
const CFG_IS_EDGE: u64 = 1 << 6;
const HW_DETACH: u64 = 1 << 7;
const ROUTING_VALID: u64 = 1 << 8;

const GROUP_SHIFT: u32 = 9;
const GROUP_MASK: u64 = 0x1 << GROUP_SHIFT;

const PRIORITY_SHIFT: u32 = 10;
const PRIORITY_BITS: u32 = 8;
const PRIORITY_MASK: u64 = ((1u64 << PRIORITY_BITS) - 1) << PRIORITY_SHIFT;

const LEVEL_BITS: u64 = LEVEL_SW | LEVEL_MSG | LEVEL_SRC;

/// A decoded, point-in-time snapshot. Never constructed directly by callers
/// outside this module; returned by [`VirqDeliveryState::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot(u64);

impl Snapshot {
    pub fn enabled(self) -> bool {
        self.0 & ENABLED != 0
    }
    pub fn pending(self) -> bool {
        self.0 & (PENDING_EDGE | LEVEL_BITS) != 0
    }
    pub fn active(self) -> bool {
        self.0 & ACTIVE != 0
    }
    pub fn is_edge_configured(self) -> bool {
        self.0 & CFG_IS_EDGE != 0
    }
    pub fn level_asserted(self) -> bool {
        self.0 & LEVEL_BITS != 0
    }
    pub fn hw_detach(self) -> bool {
        self.0 & HW_DETACH != 0
    }
    pub fn routing_valid(self) -> bool {
        self.0 & ROUTING_VALID != 0
    }
    pub fn group(self) -> u8 {
        ((self.0 & GROUP_MASK) >> GROUP_SHIFT) as u8
    }
    pub fn priority(self) -> u8 {
        ((self.0 & PRIORITY_MASK) >> PRIORITY_SHIFT) as u8
    }
    /// Whether this virq is currently eligible to be routed: enabled,
    /// pending, and not already active (spec §4.J assert-path step 3).
    pub fn should_route(self) -> bool {
        self.enabled() && self.pending() && !self.active()
    }
}

pub struct VirqDeliveryState(AtomicU64);

impl VirqDeliveryState {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> Snapshot {
        Snapshot(self.0.load(Ordering::Acquire))
    }

    /// CAS helper: apply `f` to the current word, retrying on conflict.
    /// Returns the snapshot observed *before* the successful update, so
    /// callers can tell what changed (e.g. whether this assert is the one
    /// that made the virq newly pending).
    fn update(&self, mut f: impl FnMut(u64) -> u64) -> Snapshot {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(current);
            match self.0.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Snapshot(current),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn configure(&self, is_edge: bool, group: u8, priority: u8) {
        self.update(|w| {
            let mut w = w & !(CFG_IS_EDGE | GROUP_MASK | PRIORITY_MASK);
            if is_edge {
                w |= CFG_IS_EDGE;
            }
            w |= (group as u64 & 1) << GROUP_SHIFT;
            w |= (priority as u64) << PRIORITY_SHIFT;
            w
        });
    }

    pub fn set_enabled(&self, enabled: bool) -> Snapshot {
        self.update(|w| if enabled { w | ENABLED } else { w & !ENABLED })
    }

    pub fn set_routing_valid(&self, valid: bool) {
        self.update(|w| if valid { w | ROUTING_VALID } else { w & !ROUTING_VALID });
    }

    /// Edge assert: latch `pending_edge`. Returns the pre-assert snapshot so
    /// the caller can tell whether this transitioned pending 0→1.
    pub fn assert_edge(&self) -> Snapshot {
        self.update(|w| w | PENDING_EDGE)
    }

    /// Level assert from one of the three level sources (spec: "level_sw",
    /// "level_msg", "level_src" bits, sofware/message/hw-source).
    pub fn assert_level(&self, bit: LevelSource) -> Snapshot {
        self.update(|w| w | bit.mask())
    }

    pub fn clear_level(&self, bit: LevelSource) -> Snapshot {
        self.update(|w| w & !bit.mask())
    }

    /// Deliver: move into a list register. Clears `pending_edge` (edge
    /// virqs are one-shot once delivered) and sets `active`.
    pub fn deliver(&self) -> Snapshot {
        self.update(|w| (w | ACTIVE) & !PENDING_EDGE)
    }

    /// Deactivate path (EOI/DIR): clear `active`. If any level source is
    /// still asserted the virq remains/returns pending and should be
    /// redelivered (spec §4.J deactivate-path step 2).
    pub fn deactivate(&self) -> Snapshot {
        self.update(|w| w & !ACTIVE)
    }

    pub fn set_hw_detach(&self, detach: bool) {
        self.update(|w| if detach { w | HW_DETACH } else { w & !HW_DETACH });
    }
}

impl Default for VirqDeliveryState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Sw,
    Msg,
    Src,
}

impl LevelSource {
    fn mask(self) -> u64 {
        match self {
            LevelSource::Sw => LEVEL_SW,
            LevelSource::Msg => LEVEL_MSG,
            LevelSource::Src => LEVEL_SRC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_assert_then_deliver_then_eoi_cycle() {
        let d = VirqDeliveryState::new();
        d.configure(true, 0, 0x80);
        d.set_enabled(true);
        assert!(!d.load().pending());
        d.assert_edge();
        assert!(d.load().pending());
        assert!(d.load().should_route());
        d.deliver();
        let snap = d.load();
        assert!(snap.active());
        assert!(!snap.pending());
        d.deactivate();
        assert!(!d.load().active());
    }

    #[test]
    fn level_clear_drops_pending_only_once_every_source_clear() {
        let d = VirqDeliveryState::new();
        d.configure(false, 0, 0);
        d.set_enabled(true);
        d.assert_level(LevelSource::Sw);
        d.assert_level(LevelSource::Src);
        assert!(d.load().pending());
        d.clear_level(LevelSource::Sw);
        assert!(d.load().pending());
        d.clear_level(LevelSource::Src);
        assert!(!d.load().pending());
    }

    #[test]
    fn level_virq_redelivers_after_eoi_if_still_asserted() {
        let d = VirqDeliveryState::new();
        d.configure(false, 0, 0);
        d.set_enabled(true);
        d.assert_level(LevelSource::Msg);
        d.deliver();
        assert!(d.load().active());
        d.deactivate();
        let snap = d.load();
        assert!(!snap.active());
        // Level source never cleared, so still pending: caller must redeliver.
        assert!(snap.pending());
    }

    #[test]
    fn should_route_requires_enabled_pending_and_not_active() {
        let d = VirqDeliveryState::new();
        d.assert_edge();
        assert!(!d.load().should_route(), "not enabled yet");
        d.set_enabled(true);
        assert!(d.load().should_route());
        d.deliver();
        assert!(!d.load().should_route(), "already active");
    }
}
