//! Availability-zone spreading
//!
//! Worker groups without a pinned AZ are spread across the region's
//! three target zones. The spread is a finite, restartable iterator so
//! the manifest renderer can walk it as many times as it needs.

use crate::descriptor::ZoneDistribution;
use serde::Serialize;

/// One worker-group slice assigned to a single availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneShare {
    /// Zone index, 0..3.
    pub index: usize,
    /// Zone name, e.g. `eu-west-1a`.
    pub az: String,
    pub quantity: u32,
    pub min_size: u32,
    pub max_size: u32,
}

/// Share of `total` assigned to zone `i` under the given distribution.
///
/// Balanced gives every zone the floor; unbalanced hands the remainder
/// out one by one to the lowest-indexed zones so the shares sum to the
/// requested total.
pub fn zone_share(total: u32, i: usize, dist: ZoneDistribution) -> u32 {
    let base = total / 3;
    match dist {
        ZoneDistribution::Balanced => base,
        ZoneDistribution::Unbalanced => base + u32::from((i as u32) < total % 3),
    }
}

/// Iterator over the three zone shares of a worker group.
#[derive(Debug, Clone)]
pub struct ZoneSpread {
    azs: Vec<String>,
    dist: ZoneDistribution,
    quantity: u32,
    min_size: u32,
    max_size: u32,
    next: usize,
}

impl ZoneSpread {
    pub fn new(
        azs: &[String],
        dist: ZoneDistribution,
        quantity: u32,
        min_size: u32,
        max_size: u32,
    ) -> Self {
        Self {
            azs: azs.to_vec(),
            dist,
            quantity,
            min_size,
            max_size,
            next: 0,
        }
    }
}

impl Iterator for ZoneSpread {
    type Item = ZoneShare;

    fn next(&mut self) -> Option<ZoneShare> {
        if self.next >= self.azs.len() || self.next >= 3 {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(ZoneShare {
            index: i,
            az: self.azs[i].clone(),
            quantity: zone_share(self.quantity, i, self.dist),
            min_size: zone_share(self.min_size, i, self.dist),
            max_size: zone_share(self.max_size, i, self.dist),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ZoneDistribution::{Balanced, Unbalanced};

    fn azs() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    #[test]
    fn test_balanced_share_is_floor() {
        for q in [0u32, 1, 2, 3, 4, 6, 7] {
            for i in 0..3 {
                assert_eq!(zone_share(q, i, Balanced), q / 3, "q={q} i={i}");
            }
        }
    }

    #[test]
    fn test_unbalanced_shares_sum_to_total() {
        for q in [0u32, 1, 2, 3, 4, 6, 7, 10, 11] {
            let sum: u32 = (0..3).map(|i| zone_share(q, i, Unbalanced)).sum();
            assert_eq!(sum, q, "q={q}");
        }
    }

    #[test]
    fn test_unbalanced_remainder_goes_to_low_zones() {
        // q=7 -> {3, 2, 2}
        assert_eq!(zone_share(7, 0, Unbalanced), 3);
        assert_eq!(zone_share(7, 1, Unbalanced), 2);
        assert_eq!(zone_share(7, 2, Unbalanced), 2);
        // q=4 -> {2, 1, 1}
        assert_eq!(zone_share(4, 0, Unbalanced), 2);
        assert_eq!(zone_share(4, 1, Unbalanced), 1);
        assert_eq!(zone_share(4, 2, Unbalanced), 1);
    }

    #[test]
    fn test_spread_yields_one_share_per_zone() {
        let shares: Vec<_> = ZoneSpread::new(&azs(), Unbalanced, 6, 3, 9).collect();
        assert_eq!(shares.len(), 3);
        assert_eq!(shares[0].az, "a");
        assert_eq!(shares.iter().map(|s| s.quantity).sum::<u32>(), 6);
        assert_eq!(shares.iter().map(|s| s.min_size).sum::<u32>(), 3);
        assert_eq!(shares.iter().map(|s| s.max_size).sum::<u32>(), 9);
    }

    #[test]
    fn test_spread_is_restartable() {
        let spread = ZoneSpread::new(&azs(), Balanced, 3, 0, 0);
        let first: Vec<_> = spread.clone().collect();
        let second: Vec<_> = spread.collect();
        assert_eq!(first, second);
    }
}
