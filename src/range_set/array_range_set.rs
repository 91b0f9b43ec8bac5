use std::ops::Range;

use tinyvec::TinyVec;

/// A set of u64 values backed by an array of ranges
///
/// The inline representation avoids heap allocating ACK ranges for sent
/// packets in the common case where acknowledgements arrive in consecutive
/// runs, and iteration touches a single contiguous region of memory.
#[derive(Debug, Default, Clone)]
pub struct ArrayRangeSet(TinyVec<[Range<u64>; INLINE_CAPACITY]>);

/// Number of ranges stored without spilling to the heap
///
/// Two ranges keep the per-packet tracking state small while covering the
/// overwhelmingly common case of at most one reordering gap.
const INLINE_CAPACITY: usize = 2;

impl ArrayRangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.0.iter().cloned()
    }

    pub fn elts(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, x: u64) -> bool {
        for range in self.0.iter() {
            if range.start > x {
                // Ranges are sorted, so no later range can contain x either
                return false;
            } else if range.contains(&x) {
                return true;
            }
        }
        false
    }

    pub fn subtract(&mut self, other: &Self) {
        for range in &other.0 {
            self.remove(range.clone());
        }
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    pub fn insert(&mut self, x: Range<u64>) -> bool {
        let mut result = false;

        if x.is_empty() {
            return false;
        }

        let mut idx = 0;
        while idx != self.0.len() {
            let range = &mut self.0[idx];

            if range.start > x.end {
                // Fully before this range and not extensible; insert to the left
                self.0.insert(idx, x);
                return true;
            } else if range.start > x.start {
                // Starts before this range but overlaps; extend it leftward.
                // A potential merge with the left neighbour was already taken
                // care of by the previous iteration.
                result = true;
                range.start = x.start;
            }

            if x.end <= range.end {
                // Fully contained
                return result;
            } else if x.start <= range.end {
                // Extend this range to the end of the new one, then fold in
                // any successors it now overlaps
                range.end = x.end;
                while idx != self.0.len() - 1 {
                    let curr = self.0[idx].clone();
                    let next = self.0[idx + 1].clone();
                    if curr.end >= next.start {
                        self.0[idx].end = next.end.max(curr.end);
                        self.0.remove(idx + 1);
                    } else {
                        break;
                    }
                }
                return true;
            }

            idx += 1;
        }

        self.0.push(x);
        true
    }

    pub fn remove(&mut self, x: Range<u64>) -> bool {
        let mut result = false;

        if x.is_empty() {
            return false;
        }

        let mut idx = 0;
        while idx != self.0.len() {
            let range = self.0[idx].clone();

            if x.end <= range.start {
                // Fully before this range
                return result;
            } else if x.start >= range.end {
                // Fully after this range
                idx += 1;
                continue;
            }

            result = true;

            let left = range.start..x.start;
            let right = x.end..range.end;
            if left.is_empty() && right.is_empty() {
                self.0.remove(idx);
            } else if left.is_empty() {
                self.0[idx] = right;
                idx += 1;
            } else if right.is_empty() {
                self.0[idx] = left;
                idx += 1;
            } else {
                self.0[idx] = right;
                self.0.insert(idx, left);
                idx += 2;
            }
        }

        result
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        if !self.0.is_empty() {
            Some(self.0.remove(0))
        } else {
            None
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.iter().next().map(|x| x.start)
    }

    pub fn max(&self) -> Option<u64> {
        self.iter().next_back().map(|x| x.end - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elts(set: &ArrayRangeSet) -> Vec<u64> {
        set.elts().collect()
    }

    #[test]
    fn insert_merges_neighbours() {
        let mut set = ArrayRangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert_eq!(set.len(), 2);
        assert!(set.insert(2..4));
        assert_eq!(set.len(), 1);
        assert_eq!(&elts(&set)[..], [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn insert_contained_is_noop() {
        let mut set = ArrayRangeSet::new();
        assert!(set.insert(0..5));
        assert!(!set.insert(1..3));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn insert_wide_swallows() {
        let mut set = ArrayRangeSet::new();
        assert!(set.insert(1..2));
        assert!(set.insert(4..5));
        assert!(set.insert(7..8));
        assert!(set.insert(0..9));
        assert_eq!(set.len(), 1);
        assert_eq!(set.min(), Some(0));
        assert_eq!(set.max(), Some(8));
    }

    #[test]
    fn remove_splits() {
        let mut set = ArrayRangeSet::new();
        set.insert(0..10);
        assert!(set.remove(3..7));
        assert_eq!(&elts(&set)[..], [0, 1, 2, 7, 8, 9]);
        assert!(!set.contains(5));
    }

    #[test]
    fn remove_across_ranges() {
        let mut set = ArrayRangeSet::new();
        set.insert(0..2);
        set.insert(4..6);
        assert!(set.remove(1..5));
        assert_eq!(&elts(&set)[..], [0, 5]);
    }

    #[test]
    fn subtract() {
        let mut set = ArrayRangeSet::new();
        set.insert(0..10);
        let mut other = ArrayRangeSet::new();
        other.insert(2..4);
        other.insert(6..8);
        set.subtract(&other);
        assert_eq!(&elts(&set)[..], [0, 1, 4, 5, 8, 9]);
    }

    #[test]
    fn ordered_pop() {
        let mut set = ArrayRangeSet::new();
        set.insert(5..7);
        set.insert(0..2);
        assert_eq!(set.pop_min(), Some(0..2));
        assert_eq!(set.pop_min(), Some(5..7));
        assert_eq!(set.pop_min(), None);
    }

    #[test]
    fn out_of_order_inserts() {
        let mut set = ArrayRangeSet::new();
        assert!(set.insert_one(9));
        assert!(set.insert_one(2));
        assert!(set.insert_one(3));
        assert!(!set.insert_one(2));
        assert_eq!(set.len(), 2);
        assert_eq!(&elts(&set)[..], [2, 3, 9]);
        assert_eq!(set.max(), Some(9));
    }
}
