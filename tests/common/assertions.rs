//! Custom test assertions for frontiers and decoded output

use ledgerstream::index::{Frontier, IndexNode};

/// Smallest `k` with `degree^k >= n`
pub fn ceil_log(n: u64, degree: u64) -> u32 {
    let mut k = 0;
    let mut reach = 1u64;
    while reach < n {
        reach = reach.saturating_mul(degree);
        k += 1;
    }
    k
}

/// Assert the frontier holds `leaves` leaves and `bytes` bytes and stays logarithmic
pub fn assert_frontier_shape(frontier: &Frontier, degree: u64, leaves: u64, bytes: u64) {
    assert_eq!(frontier.weight(), leaves, "weight must equal leaves appended");
    assert_eq!(frontier.size(), bytes, "size must equal bytes appended");

    let bound = degree as usize * ceil_log(leaves, degree) as usize + 1;
    assert!(
        frontier.len() <= bound,
        "frontier of {} entries exceeds bound {} after {} leaves (degree {})",
        frontier.len(),
        bound,
        leaves,
        degree
    );

    for node in frontier.nodes() {
        if let IndexNode::Internal(internal) = node {
            assert!(internal.weight >= 2, "internal node must fold at least two leaves");
        }
    }
}

/// Weights of the frontier entries, oldest first
pub fn weights(frontier: &Frontier) -> Vec<u64> {
    frontier.nodes().iter().map(IndexNode::weight).collect()
}

/// Assert two byte streams are equal, reporting the first difference
pub fn assert_same_bytes(actual: &[u8], expected: &[u8]) {
    if let Some(pos) = actual.iter().zip(expected).position(|(a, b)| a != b) {
        panic!(
            "streams differ at byte {pos}: got {:#04x}, expected {:#04x}",
            actual[pos], expected[pos]
        );
    }
    assert_eq!(
        actual.len(),
        expected.len(),
        "stream lengths differ"
    );
}
