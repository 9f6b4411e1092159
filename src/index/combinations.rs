//! Brightest-first enumeration of k-subsets.
//!
//! Subsets come out in order of increasing sum of positions, so when the items
//! are ranked brightest first the early subsets use the brightest members. Ties
//! in the sum are broken lexicographically, which keeps the order fully
//! deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Iterator over the `K`-subsets of `items`, as arrays of items.
pub struct BreadthFirstCombinations<const K: usize> {
    items: Vec<usize>,
    heap: BinaryHeap<Reverse<(usize, [u32; K])>>,
    seen: HashSet<[u32; K]>,
}

impl<const K: usize> BreadthFirstCombinations<K> {
    pub fn new(items: &[usize]) -> Self {
        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        if K > 0 && items.len() >= K {
            let first: [u32; K] = std::array::from_fn(|i| i as u32);
            seen.insert(first);
            heap.push(Reverse((position_sum(&first), first)));
        }
        Self {
            items: items.to_vec(),
            heap,
            seen,
        }
    }
}

fn position_sum<const K: usize>(positions: &[u32; K]) -> usize {
    positions.iter().map(|&p| p as usize).sum()
}

impl<const K: usize> Iterator for BreadthFirstCombinations<K> {
    type Item = [usize; K];

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, positions)) = self.heap.pop()?;

        // Successors bump one position by one while staying strictly increasing.
        let n = self.items.len() as u32;
        for i in 0..K {
            let bumped = positions[i] + 1;
            let limit = if i + 1 < K { positions[i + 1] } else { n };
            if bumped < limit {
                let mut next = positions;
                next[i] = bumped;
                if self.seen.insert(next) {
                    self.heap.push(Reverse((position_sum(&next), next)));
                }
            }
        }

        Some(positions.map(|p| self.items[p as usize]))
    }
}
