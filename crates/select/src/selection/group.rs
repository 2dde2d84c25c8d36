//! Index groups: named, strictly increasing sets of atom indices.
//!
//! All set operations run in O(|a| + |b|) two-finger walks and assume sorted
//! inputs; sortedness is checked with debug assertions at the entry points.

/// An ordered set of atom indices with an optional name.
///
/// The indices are strictly increasing; the live length is the length of the
/// underlying vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexGroup {
    name: Option<String>,
    index: Vec<usize>,
}

impl IndexGroup {
    /// Create an empty, unnamed group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group from sorted indices.
    pub fn from_indices(index: Vec<usize>) -> Self {
        debug_assert!(is_strictly_increasing(&index), "index group not sorted");
        Self { name: None, index }
    }

    /// Create the group `0..n`.
    pub fn full(n: usize) -> Self {
        Self {
            name: None,
            index: (0..n).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.index
    }

    pub fn contains(&self, atom: usize) -> bool {
        self.index.binary_search(&atom).is_ok()
    }

    /// Drop all indices, keeping the name and the allocation.
    pub fn clear(&mut self) {
        self.index.clear();
    }

    /// Replace the indices, keeping this group's name.
    pub fn set_indices(&mut self, indices: &[usize]) {
        debug_assert!(is_strictly_increasing(indices), "index group not sorted");
        self.index.clear();
        self.index.extend_from_slice(indices);
    }

    /// Copy both indices and name from another group.
    pub fn copy_from(&mut self, src: &IndexGroup) {
        self.index.clear();
        self.index.extend_from_slice(&src.index);
        self.name = src.name.clone();
    }

    /// `self = a ∩ b`.
    pub fn assign_intersection(&mut self, a: &IndexGroup, b: &IndexGroup) {
        debug_assert!(a.is_sorted() && b.is_sorted());
        self.index.clear();
        let (mut i, mut j) = (0, 0);
        while i < a.index.len() && j < b.index.len() {
            match a.index[i].cmp(&b.index[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    self.index.push(a.index[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
    }

    /// `self = self ∩ other`, in place.
    pub fn intersect_with(&mut self, other: &IndexGroup) {
        debug_assert!(self.is_sorted() && other.is_sorted());
        let mut j = 0;
        self.index.retain(|&atom| {
            while j < other.index.len() && other.index[j] < atom {
                j += 1;
            }
            j < other.index.len() && other.index[j] == atom
        });
    }

    /// `self = a \ b`.
    pub fn assign_difference(&mut self, a: &IndexGroup, b: &IndexGroup) {
        debug_assert!(a.is_sorted() && b.is_sorted());
        self.index.clear();
        let mut j = 0;
        for &atom in &a.index {
            while j < b.index.len() && b.index[j] < atom {
                j += 1;
            }
            if j >= b.index.len() || b.index[j] != atom {
                self.index.push(atom);
            }
        }
    }

    /// `self = self ∪ other` for disjoint sorted groups, merging in place
    /// with a single high-end walk.
    pub fn merge_with(&mut self, other: &IndexGroup) {
        debug_assert!(self.is_sorted() && other.is_sorted());
        let nold = self.index.len();
        let nnew = other.index.len();
        if nnew == 0 {
            return;
        }
        self.index.resize(nold + nnew, 0);
        let mut i = nold as isize - 1;
        let mut j = nnew as isize - 1;
        for k in (0..nold + nnew).rev() {
            if i < 0 || (j >= 0 && self.index[i as usize] < other.index[j as usize]) {
                self.index[k] = other.index[j as usize];
                j -= 1;
            } else {
                self.index[k] = self.index[i as usize];
                i -= 1;
            }
        }
        debug_assert!(self.is_sorted(), "merge inputs were not disjoint");
    }

    /// Split this group into the part present in `probe` and the part absent
    /// from it, preserving order.
    pub fn partition(&self, probe: &IndexGroup) -> (IndexGroup, IndexGroup) {
        debug_assert!(self.is_sorted() && probe.is_sorted());
        let mut inside = IndexGroup::new();
        let mut outside = IndexGroup::new();
        let mut j = 0;
        for &atom in &self.index {
            while j < probe.index.len() && probe.index[j] < atom {
                j += 1;
            }
            if j < probe.index.len() && probe.index[j] == atom {
                inside.index.push(atom);
            } else {
                outside.index.push(atom);
            }
        }
        (inside, outside)
    }

    /// Append another group's indices without re-sorting; call [`sort`] once
    /// the accumulation is complete.
    ///
    /// [`sort`]: IndexGroup::sort
    pub fn extend_from(&mut self, other: &IndexGroup) {
        self.index.extend_from_slice(&other.index);
    }

    /// Sort the indices ascending.
    pub fn sort(&mut self) {
        self.index.sort_unstable();
        debug_assert!(self.is_sorted(), "duplicate indices after sort");
    }

    pub fn is_sorted(&self) -> bool {
        is_strictly_increasing(&self.index)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.index.iter().copied()
    }

    pub(crate) fn from_buffer(mut buf: Vec<usize>) -> Self {
        buf.clear();
        Self {
            name: None,
            index: buf,
        }
    }

    pub(crate) fn into_buffer(self) -> Vec<usize> {
        self.index
    }
}

fn is_strictly_increasing(index: &[usize]) -> bool {
    index.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn g(idx: &[usize]) -> IndexGroup {
        IndexGroup::from_indices(idx.to_vec())
    }

    #[test]
    fn test_full() {
        assert_eq!(IndexGroup::full(4).indices(), &[0, 1, 2, 3]);
        assert!(IndexGroup::full(0).is_empty());
    }

    #[test]
    fn test_copy_adopts_name_but_set_indices_keeps_it() {
        let src = g(&[1, 5]).with_name("probe");
        let mut dst = IndexGroup::new().with_name("cache");
        dst.set_indices(src.indices());
        assert_eq!(dst.name(), Some("cache"));
        dst.copy_from(&src);
        assert_eq!(dst.name(), Some("probe"));
    }

    #[test]
    fn test_intersection() {
        let mut out = IndexGroup::new();
        out.assign_intersection(&g(&[0, 2, 4, 6]), &g(&[1, 2, 3, 4]));
        assert_eq!(out.indices(), &[2, 4]);
    }

    #[test]
    fn test_intersect_with() {
        let mut a = g(&[0, 1, 2, 5, 9]);
        a.intersect_with(&g(&[1, 5, 6]));
        assert_eq!(a.indices(), &[1, 5]);
    }

    #[test]
    fn test_difference() {
        let mut out = IndexGroup::new();
        out.assign_difference(&g(&[0, 1, 2, 3, 4]), &g(&[1, 3]));
        assert_eq!(out.indices(), &[0, 2, 4]);
    }

    #[test]
    fn test_merge_disjoint() {
        let mut a = g(&[0, 2, 4]);
        a.merge_with(&g(&[1, 3, 6]));
        assert_eq!(a.indices(), &[0, 1, 2, 3, 4, 6]);

        let mut b = g(&[5, 6]);
        b.merge_with(&g(&[0, 1]));
        assert_eq!(b.indices(), &[0, 1, 5, 6]);

        let mut c = IndexGroup::new();
        c.merge_with(&g(&[2, 3]));
        assert_eq!(c.indices(), &[2, 3]);
    }

    #[test]
    fn test_partition() {
        let (inside, outside) = g(&[0, 1, 2, 3, 4]).partition(&g(&[1, 3, 7]));
        assert_eq!(inside.indices(), &[1, 3]);
        assert_eq!(outside.indices(), &[0, 2, 4]);
    }

    #[test]
    fn test_sort_after_extend() {
        let mut acc = g(&[4, 7]);
        acc.extend_from(&g(&[1, 2]));
        acc.sort();
        assert_eq!(acc.indices(), &[1, 2, 4, 7]);
    }

    fn sorted_set() -> impl Strategy<Value = Vec<usize>> {
        proptest::collection::btree_set(0usize..64, 0..24)
            .prop_map(|s| s.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_intersection_matches_sets(a in sorted_set(), b in sorted_set()) {
            let (ga, gb) = (g(&a), g(&b));
            let mut out = IndexGroup::new();
            out.assign_intersection(&ga, &gb);
            let expect: Vec<usize> = a.iter().filter(|x| b.contains(x)).copied().collect();
            prop_assert_eq!(out.indices(), &expect[..]);
            prop_assert!(out.is_sorted());
        }

        #[test]
        fn prop_difference_matches_sets(a in sorted_set(), b in sorted_set()) {
            let mut out = IndexGroup::new();
            out.assign_difference(&g(&a), &g(&b));
            let expect: Vec<usize> = a.iter().filter(|x| !b.contains(x)).copied().collect();
            prop_assert_eq!(out.indices(), &expect[..]);
            prop_assert!(out.is_sorted());
        }

        #[test]
        fn prop_merge_is_sorted_union(a in sorted_set(), b in sorted_set()) {
            // merge operands are disjoint on the evaluator's paths
            let b: Vec<usize> = b.iter().filter(|x| !a.contains(x)).copied().collect();
            let mut out = g(&a);
            out.merge_with(&g(&b));
            let expect: BTreeSet<usize> = a.iter().chain(b.iter()).copied().collect();
            let expect: Vec<usize> = expect.into_iter().collect();
            prop_assert_eq!(out.indices(), &expect[..]);
        }

        #[test]
        fn prop_partition_is_exact(a in sorted_set(), b in sorted_set()) {
            let (inside, outside) = g(&a).partition(&g(&b));
            prop_assert!(inside.is_sorted() && outside.is_sorted());
            prop_assert_eq!(inside.len() + outside.len(), a.len());
            for atom in inside.iter() {
                prop_assert!(b.contains(&atom));
            }
            for atom in outside.iter() {
                prop_assert!(!b.contains(&atom));
            }
        }
    }
}
