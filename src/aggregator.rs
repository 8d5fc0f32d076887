//! CIDR aggregation for provider ranges.
//!
//! Aggregation only shrinks the ipset; it must never change what is allowed.
//! [`aggregate_checked`] verifies coverage and falls back to the input when
//! the merged list would lose any range.

use ipnet::Ipv4Net;
use std::collections::BTreeSet;

/// Aggregate IPv4 ranges into the smallest equivalent list.
///
/// For example: [192.168.0.0/25, 192.168.0.128/25] -> [192.168.0.0/24]
pub fn aggregate(nets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let nets: Vec<Ipv4Net> = nets.to_vec();
    Ipv4Net::aggregate(&nets)
}

/// Outcome of a checked aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    /// Merged list, covering exactly the input
    Aggregated(Vec<Ipv4Net>),
    /// Merging lost coverage; the deduplicated input is returned unchanged
    Fallback(Vec<Ipv4Net>),
}

impl Aggregation {
    pub fn ranges(&self) -> &[Ipv4Net] {
        match self {
            Aggregation::Aggregated(r) | Aggregation::Fallback(r) => r,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Aggregation::Fallback(_))
    }
}

/// Aggregate, then confirm that every input range is still covered.
pub fn aggregate_checked(nets: &[Ipv4Net]) -> Aggregation {
    aggregate_checked_with(nets, aggregate)
}

/// [`aggregate_checked`] with a caller-supplied merge step.
pub fn aggregate_checked_with<F>(nets: &[Ipv4Net], merge: F) -> Aggregation
where
    F: FnOnce(&[Ipv4Net]) -> Vec<Ipv4Net>,
{
    let merged = merge(nets);
    if covers_all(&merged, nets) && count_ips(&merged) <= count_ips(&dedup(nets)) {
        Aggregation::Aggregated(merged)
    } else {
        Aggregation::Fallback(dedup(nets))
    }
}

/// Whether every network in `nets` is contained in some network of `cover`.
pub fn covers_all(cover: &[Ipv4Net], nets: &[Ipv4Net]) -> bool {
    nets.iter()
        .all(|net| cover.iter().any(|c| c.contains(net)))
}

fn dedup(nets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    nets.iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Total number of addresses covered by a list of ranges.
///
/// Overlapping ranges are counted twice; use on aggregated lists.
pub fn count_ips(nets: &[Ipv4Net]) -> u64 {
    nets.iter()
        .map(|net| 1u64 << (32 - net.prefix_len()))
        .fold(0u64, |acc, n| acc.saturating_add(n))
}
