//! Multipoint relay selection (greedy heuristic of RFC 3626 section 8.3.1).

use manet_packet::Willingness;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// Select MPRs covering every strict two-hop neighbor.
///
/// `neighbors` maps each symmetric neighbor to its willingness; `two_hop`
/// lists (neighbor, two-hop address) pairs. Two-hop addresses that are the
/// local node or a symmetric neighbor are not coverage targets.
pub fn select_mprs(
    local: Ipv4Addr,
    neighbors: &BTreeMap<Ipv4Addr, Willingness>,
    two_hop: &BTreeSet<(Ipv4Addr, Ipv4Addr)>,
) -> BTreeSet<Ipv4Addr> {
    let candidates: BTreeMap<Ipv4Addr, Willingness> = neighbors
        .iter()
        .filter(|(_, w)| **w != Willingness::Never)
        .map(|(a, w)| (*a, *w))
        .collect();

    // Coverage of each candidate over strict two-hop neighbors.
    let mut coverage: BTreeMap<Ipv4Addr, BTreeSet<Ipv4Addr>> = BTreeMap::new();
    for &(via, target) in two_hop {
        if target == local || neighbors.contains_key(&target) || !candidates.contains_key(&via) {
            continue;
        }
        coverage.entry(via).or_default().insert(target);
    }
    let mut uncovered: BTreeSet<Ipv4Addr> = coverage.values().flatten().copied().collect();
    let mut mprs = BTreeSet::new();

    for (&addr, &willingness) in &candidates {
        if willingness == Willingness::Always {
            mprs.insert(addr);
        }
    }

    // Neighbors that are the only path to some two-hop node.
    for target in uncovered.clone() {
        let providers: Vec<Ipv4Addr> = coverage
            .iter()
            .filter(|(_, covered)| covered.contains(&target))
            .map(|(via, _)| *via)
            .collect();
        if providers.len() == 1 {
            mprs.insert(providers[0]);
        }
    }

    for mpr in &mprs {
        if let Some(covered) = coverage.get(mpr) {
            for target in covered {
                uncovered.remove(target);
            }
        }
    }

    while !uncovered.is_empty() {
        // Highest willingness, then reachability, then degree; BTreeMap order
        // makes the lowest address win remaining ties.
        let best = coverage
            .iter()
            .filter(|(via, _)| !mprs.contains(*via))
            .map(|(via, covered)| {
                let reachability = covered.intersection(&uncovered).count();
                (*via, candidates[via], reachability, covered.len())
            })
            .filter(|(_, _, reachability, _)| *reachability > 0)
            .fold(None, |best: Option<(Ipv4Addr, Willingness, usize, usize)>, c| match best {
                Some(b) if (b.1, b.2, b.3) >= (c.1, c.2, c.3) => Some(b),
                _ => Some(c),
            });

        let Some((via, _, _, _)) = best else {
            break;
        };
        mprs.insert(via);
        if let Some(covered) = coverage.get(&via) {
            for target in covered {
                uncovered.remove(target);
            }
        }
    }

    mprs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, i)
    }

    fn neighbors(list: &[(u8, Willingness)]) -> BTreeMap<Ipv4Addr, Willingness> {
        list.iter().map(|(i, w)| (addr(*i), *w)).collect()
    }

    fn pairs(list: &[(u8, u8)]) -> BTreeSet<(Ipv4Addr, Ipv4Addr)> {
        list.iter().map(|(a, b)| (addr(*a), addr(*b))).collect()
    }

    #[test]
    fn test_sole_provider_is_selected() {
        let n = neighbors(&[(2, Willingness::Default), (3, Willingness::Default)]);
        let two = pairs(&[(2, 4), (3, 5)]);
        let mprs = select_mprs(addr(1), &n, &two);
        assert_eq!(mprs, [addr(2), addr(3)].into_iter().collect());
    }

    #[test]
    fn test_greedy_prefers_larger_coverage() {
        let n = neighbors(&[(2, Willingness::Default), (3, Willingness::Default), (4, Willingness::Default)]);
        let two = pairs(&[(2, 5), (3, 5), (3, 6), (4, 6)]);
        let mprs = select_mprs(addr(1), &n, &two);
        assert_eq!(mprs, [addr(3)].into_iter().collect());
    }

    #[test]
    fn test_neighbors_and_self_are_not_targets() {
        let n = neighbors(&[(2, Willingness::Default), (3, Willingness::Default)]);
        let two = pairs(&[(2, 1), (2, 3), (3, 2)]);
        assert!(select_mprs(addr(1), &n, &two).is_empty());
    }

    #[test]
    fn test_willingness_never_and_always() {
        let n = neighbors(&[(2, Willingness::Never), (3, Willingness::Always), (4, Willingness::Default)]);
        let two = pairs(&[(2, 5), (4, 5)]);
        let mprs = select_mprs(addr(1), &n, &two);
        assert_eq!(mprs, [addr(3), addr(4)].into_iter().collect());
    }

    #[test]
    fn test_full_mesh_needs_no_mprs() {
        let n = neighbors(&[(2, Willingness::Default), (3, Willingness::Default), (4, Willingness::Default)]);
        let two = pairs(&[(2, 3), (2, 4), (3, 2), (3, 4), (4, 2), (4, 3)]);
        assert!(select_mprs(addr(1), &n, &two).is_empty());
    }
}
