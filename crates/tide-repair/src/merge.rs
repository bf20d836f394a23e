//! K-way merge of pre-sorted listings.
//!
//! Recovery lists a partition on every holder and needs the union of what
//! they saw, with a count of how many listings contained each object. Each
//! input must already be sorted; duplicates within or across inputs are
//! folded into one output entry.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Merge sorted `lists` into their sorted, duplicate-free union.
///
/// Each output value is paired with its total number of occurrences across
/// all inputs.
pub fn merge<T, L>(lists: &[L]) -> Vec<(T, usize)>
where
    T: Ord + Clone,
    L: AsRef<[T]>,
{
    // (value, list, position) ordered by value, then list for stability.
    let mut heap: BinaryHeap<Reverse<(T, usize, usize)>> = lists
        .iter()
        .enumerate()
        .filter_map(|(list, items)| {
            items
                .as_ref()
                .first()
                .map(|first| Reverse((first.clone(), list, 0)))
        })
        .collect();

    let mut out: Vec<(T, usize)> = Vec::new();
    while let Some(Reverse((value, list, pos))) = heap.pop() {
        match out.last_mut() {
            Some((last, count)) if *last == value => *count += 1,
            _ => out.push((value, 1)),
        }
        if let Some(next) = lists[list].as_ref().get(pos + 1) {
            heap.push(Reverse((next.clone(), list, pos + 1)));
        }
    }
    out
}
