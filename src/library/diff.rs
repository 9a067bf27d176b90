//! Index-set diff between two ordered lists.

use std::collections::HashMap;
use std::hash::Hash;

/// Differences between an old and a new ordering of keyed items.
///
/// `removed` holds indices into the old list; `inserted` and `changed` hold
/// indices into the new list; `moves` pairs an old index with a new index for
/// surviving items that left the longest order-preserving run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    pub removed: Vec<usize>,
    pub inserted: Vec<usize>,
    pub changed: Vec<usize>,
    pub moves: Vec<(usize, usize)>,
}

impl IndexDiff {
    pub fn compute<T, K, FK, FC>(before: &[T], after: &[T], key: FK, changed: FC) -> Self
    where
        K: Eq + Hash,
        FK: Fn(&T) -> K,
        FC: Fn(&T, &T) -> bool,
    {
        let after_pos: HashMap<K, usize> = after
            .iter()
            .enumerate()
            .map(|(i, item)| (key(item), i))
            .collect();
        let before_pos: HashMap<K, usize> = before
            .iter()
            .enumerate()
            .map(|(i, item)| (key(item), i))
            .collect();

        let mut diff = IndexDiff::default();
        let mut survivors = Vec::new();

        for (old, item) in before.iter().enumerate() {
            match after_pos.get(&key(item)) {
                Some(&new) => survivors.push((old, new)),
                None => diff.removed.push(old),
            }
        }

        diff.inserted = after
            .iter()
            .enumerate()
            .filter(|(_, item)| !before_pos.contains_key(&key(item)))
            .map(|(i, _)| i)
            .collect();

        diff.changed = survivors
            .iter()
            .filter(|(old, new)| changed(&before[*old], &after[*new]))
            .map(|(_, new)| *new)
            .collect();
        diff.changed.sort_unstable();

        let new_order: Vec<usize> = survivors.iter().map(|(_, new)| *new).collect();
        let keep = longest_increasing(&new_order);
        diff.moves = survivors
            .iter()
            .zip(keep)
            .filter(|(_, kept)| !kept)
            .map(|(pair, _)| *pair)
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.inserted.is_empty()
            && self.changed.is_empty()
            && self.moves.is_empty()
    }

    /// Lowest position (old or new) touched by a removal, insertion or move.
    pub fn first_structural_index(&self) -> Option<usize> {
        self.removed
            .iter()
            .chain(self.inserted.iter())
            .copied()
            .chain(self.moves.iter().map(|(old, new)| (*old).min(*new)))
            .min()
    }
}

/// Marks the members of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for (i, &value) in seq.iter().enumerate() {
        let pos = tails.partition_point(|&t| seq[t] < value);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut keep = vec![false; seq.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = prev[i];
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(before: &[&str], after: &[&str]) -> IndexDiff {
        IndexDiff::compute(before, after, |s| s.to_string(), |_, _| false)
    }

    #[test]
    fn test_identical_lists() {
        let d = diff(&["a", "b", "c"], &["a", "b", "c"]);
        assert!(d.is_empty());
        assert_eq!(d.first_structural_index(), None);
    }

    #[test]
    fn test_insert_and_remove() {
        let d = diff(&["a", "b", "c"], &["new", "a", "c"]);
        assert_eq!(d.removed, vec![1]);
        assert_eq!(d.inserted, vec![0]);
        assert!(d.moves.is_empty());
        assert_eq!(d.first_structural_index(), Some(0));
    }

    #[test]
    fn test_single_move() {
        let d = diff(&["a", "b", "c", "d"], &["b", "c", "a", "d"]);
        assert!(d.removed.is_empty());
        assert!(d.inserted.is_empty());
        assert_eq!(d.moves, vec![(0, 2)]);
    }

    #[test]
    fn test_changed_uses_new_indices() {
        let before = [("a", 1), ("b", 1), ("c", 1)];
        let after = [("x", 1), ("a", 1), ("b", 2), ("c", 1)];
        let d = IndexDiff::compute(&before, &after, |t| t.0, |old, new| old.1 != new.1);
        assert_eq!(d.inserted, vec![0]);
        assert_eq!(d.changed, vec![2]);
        assert!(!d.is_empty());
    }

    #[test]
    fn test_longest_increasing_marks_run() {
        assert_eq!(
            longest_increasing(&[2, 0, 1, 3]),
            vec![false, true, true, true]
        );
        assert!(longest_increasing(&[]).is_empty());
    }
}
