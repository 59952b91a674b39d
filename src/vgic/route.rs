//! VIRQ routing decisions (spec §4.J "Routing").
//!
//! Kept separate from [`super::vic::Vic`]'s storage so the selection rules
//! — SGI goes to its explicit target, PPI to its owning VCPU, SPI to a
//! configured affinity or else the first eligible bound VCPU — are testable
//! as plain functions over slices rather than against the whole object.

/// Choose the delivery target for a shared (SPI) virq: honor a configured
/// affinity if that VCPU is still bound to the VIC, otherwise fall back to
/// 1-of-N by picking the first bound VCPU (spec: "either configured affinity
/// or 1-of-N to first eligible").
pub fn select_spi_target(configured: Option<usize>, bound: &[bool]) -> Option<usize> {
    if let Some(target) = configured {
        if bound.get(target).copied().unwrap_or(false) {
            return Some(target);
        }
    }
    bound.iter().position(|&b| b)
}

/// SGIs carry an explicit target cpu chosen by the sender; PPIs are always
/// routed to the VCPU that owns them. Both resolve trivially once the
/// caller has already identified which VCPU index the virq is private to —
/// this just validates that VCPU is still bound.
pub fn private_target_is_valid(vcpu: usize, bound: &[bool]) -> bool {
    bound.get(vcpu).copied().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spi_prefers_configured_affinity_when_still_bound() {
        let bound = [true, true, false];
        assert_eq!(select_spi_target(Some(1), &bound), Some(1));
    }

    #[test]
    fn spi_falls_back_to_first_bound_when_affinity_unbound() {
        let bound = [false, true, true];
        assert_eq!(select_spi_target(Some(0), &bound), Some(1));
    }

    #[test]
    fn spi_with_no_affinity_picks_first_bound() {
        let bound = [false, false, true];
        assert_eq!(select_spi_target(None, &bound), Some(2));
    }

    #[test]
    fn private_target_must_still_be_bound() {
        let bound = [true, false];
        assert!(private_target_is_valid(0, &bound));
        assert!(!private_target_is_valid(1, &bound));
    }
}
