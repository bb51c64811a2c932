use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::SignalTreeError;

/// Signals packed into each leaf word.
const BITS_PER_LEAF: usize = 64;

/// A lock-free binary tree for signal selection and management.
///
/// Internal nodes track active signal counts in their subtrees while leaf
/// nodes pack 64 signals each into bit fields, giving O(log n) selection
/// with good cache behavior. Multiple threads can set, select, and clear
/// signals concurrently; fairness comes from the bias word callers thread
/// through [`select`](Self::select).
///
/// The word array holds `2 * leaves - 1` entries: the root at index 0,
/// children of `i` at `2i + 1` and `2i + 2`, leaves starting at
/// `leaves - 1`. Counters use relaxed ordering; the leaf bitmap writes carry
/// the release/acquire edges, so a reader that observes a counter above zero
/// may still find the leaf empty and must tolerate a spurious "empty"
/// result.
#[derive(Debug)]
pub struct SignalTree {
    nodes: Box<[CachePadded<AtomicU64>]>,
    leaf_count: usize,
    capacity: usize,
}

impl SignalTree {
    /// Creates a tree able to hold at least `min_signals` signals.
    ///
    /// The leaf count is rounded up to a power of two and never below 2: a
    /// single-leaf tree would make the root double as both counter and
    /// bitmap.
    pub fn with_capacity(min_signals: usize) -> Self {
        let leaves = min_signals
            .div_ceil(BITS_PER_LEAF)
            .next_power_of_two()
            .max(2);
        Self::new_unchecked(leaves)
    }

    /// Creates a tree with exactly `leaf_count` leaves.
    ///
    /// Total signal capacity is `leaf_count * 64`. Fails if `leaf_count` is
    /// not a power of two or is below 2.
    pub fn try_with_leaves(leaf_count: usize) -> Result<Self, SignalTreeError> {
        if leaf_count < 2 {
            return Err(SignalTreeError::TooFewLeaves(leaf_count));
        }
        if !leaf_count.is_power_of_two() {
            return Err(SignalTreeError::LeafCountNotPowerOfTwo(leaf_count));
        }
        Ok(Self::new_unchecked(leaf_count))
    }

    fn new_unchecked(leaf_count: usize) -> Self {
        let total = 2 * leaf_count - 1;
        let nodes = (0..total)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            nodes,
            leaf_count,
            capacity: leaf_count * BITS_PER_LEAF,
        }
    }

    /// Total number of signals the tree can track.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of leaf words.
    #[inline]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of currently set signals (root counter).
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes[0].load(Ordering::Acquire) as usize
    }

    /// Whether no signal is currently set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes[0].load(Ordering::Acquire) == 0
    }

    #[inline]
    fn leaf_start(&self) -> usize {
        self.leaf_count - 1
    }

    /// Weight of a subtree: the counter for internal nodes, the popcount
    /// for leaf bitmaps.
    #[inline]
    fn subtree_weight(&self, node: usize) -> u64 {
        let value = self.nodes[node].load(Ordering::Acquire);
        if node >= self.leaf_start() {
            u64::from(value.count_ones())
        } else {
            value
        }
    }

    /// Marks signal `index` as set.
    ///
    /// Idempotent: setting an already-set signal leaves every counter
    /// untouched. Returns `true` if the signal transitioned 0 -> 1.
    pub fn set(&self, index: usize) -> bool {
        assert!(index < self.capacity, "signal index {index} out of range");

        let leaf = self.leaf_start() + index / BITS_PER_LEAF;
        let mask = 1u64 << (index % BITS_PER_LEAF);

        let previous = self.nodes[leaf].fetch_or(mask, Ordering::Release);
        if previous & mask != 0 {
            return false;
        }

        // The bit was clear; exactly this path bumps every ancestor once.
        let mut node = leaf;
        while node > 0 {
            node = (node - 1) / 2;
            self.nodes[node].fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Clears signal `index` without selecting it.
    ///
    /// Idempotent. Returns `true` if the signal transitioned 1 -> 0.
    pub fn clear(&self, index: usize) -> bool {
        assert!(index < self.capacity, "signal index {index} out of range");

        let leaf = self.leaf_start() + index / BITS_PER_LEAF;
        let mask = 1u64 << (index % BITS_PER_LEAF);

        let previous = self.nodes[leaf].fetch_and(!mask, Ordering::Release);
        if previous & mask == 0 {
            return false;
        }

        let mut node = leaf;
        while node > 0 {
            node = (node - 1) / 2;
            self.nodes[node].fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    /// Atomically finds a set signal, clears it, and returns its index.
    ///
    /// The bias word guides the descent: at each level the matching bit
    /// (LSB at the root, shifting up per level) prefers the right subtree
    /// when it has signals. On success the bias is rewritten with a hint of
    /// which right subtrees held work during this descent, so rotating the
    /// word between calls walks the selections across the tree.
    ///
    /// Returns `(selected_index, tree_now_empty)`. A `None` index means no
    /// signal was found; counters racing ahead of leaf writes can produce a
    /// spurious `None` even while signals exist elsewhere, and callers are
    /// expected to retry or back off.
    pub fn select(&self, bias: &mut u64) -> (Option<usize>, bool) {
        let leaf_start = self.leaf_start();
        let mut node = 0usize;
        let mut hint = 0u64;
        let mut level_bit = 1u64;

        while node < leaf_start {
            let left = 2 * node + 1;
            let right = 2 * node + 2;
            let left_weight = self.subtree_weight(left);
            let right_weight = self.subtree_weight(right);

            if right_weight > 0 {
                hint |= level_bit;
            }

            let prefer_right = *bias & level_bit != 0;
            if (prefer_right || left_weight == 0) && right_weight > 0 {
                node = right;
            } else if left_weight > 0 {
                node = left;
            } else {
                return (None, self.is_empty());
            }
            level_bit <<= 1;
        }

        // Claim the lowest set bit in the leaf. Another selector may race us
        // here; retry until the CAS lands or the leaf drains.
        let mut word = self.nodes[node].load(Ordering::Acquire);
        let bit = loop {
            if word == 0 {
                return (None, self.is_empty());
            }
            let bit = word.trailing_zeros() as usize;
            match self.nodes[node].compare_exchange_weak(
                word,
                word & !(1u64 << bit),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break bit,
                Err(current) => word = current,
            }
        };

        *bias = hint;

        let mut ancestor = node;
        while ancestor > 0 {
            ancestor = (ancestor - 1) / 2;
            self.nodes[ancestor].fetch_sub(1, Ordering::Relaxed);
        }
        let now_empty = self.nodes[0].load(Ordering::Acquire) == 0;

        let index = (node - leaf_start) * BITS_PER_LEAF + bit;
        (Some(index), now_empty)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two_leaves() {
        let tree = SignalTree::with_capacity(1);
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(tree.capacity(), 128);

        let tree = SignalTree::with_capacity(129);
        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.capacity(), 256);

        let tree = SignalTree::with_capacity(256);
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn leaf_count_validation() {
        assert_eq!(
            SignalTree::try_with_leaves(0).unwrap_err(),
            SignalTreeError::TooFewLeaves(0)
        );
        assert_eq!(
            SignalTree::try_with_leaves(1).unwrap_err(),
            SignalTreeError::TooFewLeaves(1)
        );
        assert_eq!(
            SignalTree::try_with_leaves(3).unwrap_err(),
            SignalTreeError::LeafCountNotPowerOfTwo(3)
        );
        assert!(SignalTree::try_with_leaves(8).is_ok());
    }

    #[test]
    fn set_select_clear_keep_counters_consistent() {
        let tree = SignalTree::with_capacity(256);
        assert!(tree.is_empty());

        assert!(tree.set(0));
        assert!(tree.set(63));
        assert!(tree.set(64));
        assert!(tree.set(255));
        assert_eq!(tree.len(), 4);

        assert!(tree.clear(63));
        assert_eq!(tree.len(), 3);

        let mut bias = 0u64;
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let (index, _) = tree.select(&mut bias);
            seen.insert(index.expect("signal available"));
        }
        assert_eq!(seen, HashSet::from([0, 64, 255]));
        assert!(tree.is_empty());

        let (index, now_empty) = tree.select(&mut bias);
        assert_eq!(index, None);
        assert!(now_empty);
    }

    #[test]
    fn set_is_idempotent() {
        let tree = SignalTree::with_capacity(128);
        assert!(tree.set(7));
        assert!(!tree.set(7));
        assert_eq!(tree.len(), 1);

        assert!(tree.clear(7));
        assert!(!tree.clear(7));
        assert!(tree.is_empty());
    }

    #[test]
    fn select_reports_now_empty_on_last_signal() {
        let tree = SignalTree::with_capacity(128);
        tree.set(10);
        tree.set(20);

        let mut bias = 0;
        let (first, empty_after_first) = tree.select(&mut bias);
        assert!(first.is_some());
        assert!(!empty_after_first);

        let (second, empty_after_second) = tree.select(&mut bias);
        assert!(second.is_some());
        assert!(empty_after_second);
    }

    #[test]
    fn full_tree_drains_every_signal_exactly_once() {
        let tree = SignalTree::with_capacity(256);
        let capacity = tree.capacity();
        for i in 0..capacity {
            tree.set(i);
        }
        assert_eq!(tree.len(), capacity);

        let mut bias = 0u64;
        let mut seen = HashSet::new();
        for _ in 0..capacity {
            let (index, _) = tree.select(&mut bias);
            assert!(seen.insert(index.expect("tree not drained yet")));
            // Rotate the hint so the next descent prefers other subtrees.
            bias = bias.rotate_left(1);
        }
        assert_eq!(seen.len(), capacity);
        assert!(tree.is_empty());
    }

    #[test]
    fn bias_rotation_spreads_selections() {
        let tree = SignalTree::with_capacity(256);
        for i in 0..tree.capacity() {
            tree.set(i);
        }

        // With a rotating bias, consecutive selections should not all come
        // from the same leaf word.
        let mut bias = 0u64;
        let mut leaves = HashSet::new();
        for _ in 0..8 {
            let (index, _) = tree.select(&mut bias);
            leaves.insert(index.expect("signals available") / BITS_PER_LEAF);
            bias = bias.rotate_left(1);
        }
        assert!(leaves.len() > 1, "bias should steer across leaves");
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_uniqueness() {
        let tree = Arc::new(SignalTree::with_capacity(1024));
        let capacity = tree.capacity();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in (p..capacity).step_by(4) {
                        tree.set(i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(tree.len(), capacity);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let mut bias = fastrand::u64(..);
                    let mut collected = Vec::new();
                    loop {
                        let (index, _) = tree.select(&mut bias);
                        match index {
                            Some(i) => collected.push(i),
                            // Selection can come up empty while racing
                            // selectors hold signals mid-claim; only the
                            // root counter says the tree is truly drained.
                            None => {
                                if tree.is_empty() {
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                        bias = bias.rotate_left(1);
                    }
                    collected
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for consumer in consumers {
            for index in consumer.join().unwrap() {
                assert!(seen.insert(index), "signal {index} selected twice");
            }
        }
        assert_eq!(seen.len(), capacity);
        assert!(tree.is_empty());
    }
}
