use alloc::collections::BTreeMap;

/// A set of `u32` ids stored as disjoint, non-adjacent closed intervals,
/// keyed by their first id.
///
/// Closed intervals let the set hold `u32::MAX`, the last id of the top id space.
#[derive(Debug, Default)]
pub(crate) struct IdSet {
    intervals: BTreeMap<u32, u32>,
}

impl IdSet {
    /// Creates a set holding every id in `[first, last]`.
    pub(crate) fn with_range(first: u32, last: u32) -> IdSet {
        let mut set = IdSet::default();
        if first <= last {
            set.intervals.insert(first, last);
        }
        set
    }

    /// Removes and returns the lowest id in the set.
    pub(crate) fn take_lowest(&mut self) -> Option<u32> {
        let (first, last) = self.intervals.pop_first()?;
        if first < last {
            self.intervals.insert(first + 1, last);
        }
        Some(first)
    }

    /// Adds `id` to the set, merging it with the intervals on either side.
    /// Returns false if it was already present.
    pub(crate) fn insert(&mut self, id: u32) -> bool {
        let prev = self.intervals.range(..=id).next_back().map(|(&f, &l)| (f, l));
        if let Some((_, last)) = prev {
            if id <= last {
                return false;
            }
        }
        let mut first = id;
        let mut last = id;
        if let Some(next_last) = id.checked_add(1).and_then(|next| self.intervals.remove(&next)) {
            last = next_last;
        }
        match prev {
            Some((prev_first, prev_last)) if prev_last + 1 == id => {
                first = prev_first;
            }
            _ => {}
        }
        self.intervals.insert(first, last);
        true
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.intervals.range(..=id).next_back().map_or(false, |(_, &last)| id <= last)
    }

    pub(crate) fn len(&self) -> usize {
        self.intervals.iter().map(|(f, l)| (l - f) as usize + 1).sum()
    }

    #[cfg(test)]
    pub(crate) fn intervals(&self) -> alloc::vec::Vec<(u32, u32)> {
        self.intervals.iter().map(|(&f, &l)| (f, l)).collect()
    }
}
