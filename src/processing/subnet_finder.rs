//! Free block search within a region's top-level pool.
//!
//! Splits each top-level block into candidates of the requested size and
//! keeps the ones that do not collide with anything already reserved.

use crate::error::{AllocationError, Result};
use crate::models::{AddressBlock, MAX_LENGTH};
use std::collections::HashSet;

/// Lazily yield every available block of `prefix_len`.
///
/// Top blocks are visited in input order, candidates in ascending address
/// order. A top block smaller than the request contributes nothing. A
/// candidate is dropped when it overlaps any used block, or when an earlier
/// (overlapping) top block already yielded it.
pub fn available_blocks<'a>(
    top_blocks: &'a [AddressBlock],
    used_blocks: &'a [AddressBlock],
    prefix_len: u8,
) -> impl Iterator<Item = AddressBlock> + 'a {
    let mut emitted: HashSet<AddressBlock> = HashSet::new();

    top_blocks
        .iter()
        .filter(move |top| top.prefix_len() <= prefix_len && prefix_len <= MAX_LENGTH)
        .flat_map(move |top| {
            // Only used blocks touching this top block can exclude a candidate
            let in_top: Vec<&AddressBlock> =
                used_blocks.iter().filter(|u| u.overlaps(top)).collect();
            top.partition(prefix_len)
                .into_iter()
                .flatten()
                .filter(move |candidate| !in_top.iter().any(|u| u.overlaps(candidate)))
        })
        .filter(move |candidate| emitted.insert(*candidate))
}

/// Find all CIDRs of `prefix_len` not overlapping `used_blocks`.
pub fn find_all(
    top_blocks: &[AddressBlock],
    used_blocks: &[AddressBlock],
    prefix_len: u8,
) -> Vec<AddressBlock> {
    let available: Vec<AddressBlock> =
        available_blocks(top_blocks, used_blocks, prefix_len).collect();
    log::debug!(
        "find_all /{prefix_len}: {} available from {} top blocks, {} used",
        available.len(),
        top_blocks.len(),
        used_blocks.len()
    );
    available
}

/// Find the first available CIDR of `prefix_len`.
pub fn find_first(
    top_blocks: &[AddressBlock],
    used_blocks: &[AddressBlock],
    prefix_len: u8,
) -> Result<AddressBlock> {
    available_blocks(top_blocks, used_blocks, prefix_len)
        .next()
        .ok_or(AllocationError::NoCapacity(prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(cidrs: &[&str]) -> Vec<AddressBlock> {
        cidrs.iter().map(|c| c.parse().unwrap()).collect()
    }

    fn strings(found: &[AddressBlock]) -> Vec<String> {
        found.iter().map(|b| b.to_string()).collect()
    }

    #[test]
    fn test_find_first_empty_pool_usage() {
        let top = blocks(&["10.1.0.0/16"]);
        assert_eq!(
            find_first(&top, &[], 24).unwrap().to_string(),
            "10.1.0.0/24"
        );
    }

    #[test]
    fn test_find_first_skips_used() {
        let top = blocks(&["10.1.0.0/16"]);
        let used = blocks(&["10.1.0.0/24"]);
        assert_eq!(
            find_first(&top, &used, 24).unwrap().to_string(),
            "10.1.1.0/24"
        );
    }

    #[test]
    fn test_request_larger_than_pool() {
        let top = blocks(&["10.1.0.0/24"]);
        assert!(find_all(&top, &[], 16).is_empty());
        assert!(matches!(
            find_first(&top, &[], 16),
            Err(AllocationError::NoCapacity(16))
        ));
    }

    #[test]
    fn test_empty_top_blocks() {
        assert!(find_all(&[], &blocks(&["10.0.0.0/8"]), 24).is_empty());
        assert!(find_first(&[], &[], 24).is_err());
    }

    #[test]
    fn test_prefix_beyond_32_yields_nothing() {
        assert!(find_all(&blocks(&["10.0.0.0/30"]), &[], 33).is_empty());
    }

    #[test]
    fn test_find_all_matches_mocked_table() {
        // Same shape as a region with three /24s reserved out of a /22
        let top = blocks(&["10.1.0.0/22"]);
        let used = blocks(&["10.1.1.0/24", "10.1.2.0/24", "10.1.3.0/24"]);
        assert_eq!(strings(&find_all(&top, &used, 24)), vec!["10.1.0.0/24"]);
        assert_eq!(
            strings(&find_all(&top, &used, 25)),
            vec!["10.1.0.0/25", "10.1.0.128/25"]
        );
    }

    #[test]
    fn test_top_block_order_is_kept() {
        let top = blocks(&["192.168.0.0/23", "10.0.0.0/23", "172.16.0.0/28"]);
        let used = blocks(&["192.168.1.0/24"]);
        assert_eq!(
            strings(&find_all(&top, &used, 24)),
            vec!["192.168.0.0/24", "10.0.0.0/24", "10.0.1.0/24"]
        );
    }

    #[test]
    fn test_larger_used_block_excludes_all_inside() {
        let top = blocks(&["10.0.0.0/16"]);
        let used = blocks(&["10.0.0.0/17"]);
        let found = find_all(&top, &used, 24);
        assert_eq!(found.len(), 128);
        assert_eq!(found[0].to_string(), "10.0.128.0/24");
    }

    #[test]
    fn test_smaller_used_block_excludes_container() {
        let top = blocks(&["10.0.0.0/22"]);
        let used = blocks(&["10.0.1.17/32", "10.0.3.0/26"]);
        assert_eq!(
            strings(&find_all(&top, &used, 24)),
            vec!["10.0.0.0/24", "10.0.2.0/24"]
        );
    }

    #[test]
    fn test_used_blocks_are_idempotent_and_order_insensitive() {
        let top = blocks(&["10.0.0.0/20"]);
        let used = blocks(&["10.0.4.0/22", "10.0.1.0/24"]);
        let dup = blocks(&["10.0.1.0/24", "10.0.4.0/22", "10.0.5.0/24", "10.0.1.0/24"]);
        assert_eq!(find_all(&top, &used, 24), find_all(&top, &dup, 24));
    }

    #[test]
    fn test_overlapping_pools_yield_no_duplicates() {
        let top = blocks(&["10.0.0.0/23", "10.0.0.0/22"]);
        assert_eq!(
            strings(&find_all(&top, &[], 24)),
            vec!["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"]
        );
    }

    #[test]
    fn test_results_never_overlap_used_or_each_other() {
        let pools = [
            blocks(&["10.0.0.0/20"]),
            blocks(&["10.0.0.0/22", "10.0.2.0/23", "10.0.8.0/21"]),
            blocks(&["10.0.0.0/24", "10.0.0.128/25"]),
        ];
        let used_sets = [
            blocks(&[]),
            blocks(&["10.0.1.0/24", "10.0.2.64/26"]),
            blocks(&["10.0.0.0/21", "10.0.9.0/25", "10.0.0.0/21"]),
        ];
        for top in &pools {
            for used in &used_sets {
                for size in 20..=28 {
                    let found = find_all(top, used, size);
                    for (i, a) in found.iter().enumerate() {
                        assert_eq!(a.prefix_len(), size);
                        assert!(top.iter().any(|t| t.contains(a)));
                        assert!(!used.iter().any(|u| u.overlaps(a)), "{a} overlaps used");
                        for b in &found[i + 1..] {
                            assert!(!a.overlaps(b), "{a} overlaps {b}");
                        }
                    }
                    match find_first(top, used, size) {
                        Ok(first) => assert_eq!(Some(&first), found.first()),
                        Err(_) => assert!(found.is_empty()),
                    }
                }
            }
        }
    }
}
