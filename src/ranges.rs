// Copyright (c) 2026 The TSCTP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ops::Range;

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::Bound::Included;
use std::collections::Bound::Unbounded;

/// A set of u64 values, support range operations, like insert, remove, etc.
///
/// The output path uses it to track the transmission sequence numbers
/// received beyond the cumulative ack point, from which the gap ack blocks
/// of an outgoing SACK are derived.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// The inner `RangeSet`.
    set: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Create a new empty `RangeSet`.
    pub fn new() -> Self {
        RangeSet::default()
    }

    /// Insert `range` into the set.
    /// Note that the range is [start, end), i.e. contains `start` but not `end`.
    pub fn insert(&mut self, mut range: Range<u64>) {
        // If the given range is empty, do nothing.
        if range.is_empty() {
            return;
        }

        if let Some(r) = self.prev_to(range.start) {
            if r.end >= range.end {
                // Fully covered by preceding existing range, do nothing.
                return;
            } else if r.end >= range.start {
                // The new range overlaps with the preceding existing range,
                // merge them into a single range.
                self.set.remove(&r.start);
                range.start = r.start;
            }
        }

        while let Some(r) = self.next_to(range.start) {
            // There is no overlap between the new range and the following
            // existing range, break.
            if r.start > range.end {
                break;
            }

            // The new range overlaps with the following existing range,
            // merge them into a single range.
            self.set.remove(&r.start);
            range.end = std::cmp::max(r.end, range.end);
        }

        // Insert the new range.
        self.set.insert(range.start, range.end);
    }

    /// Add `elem` to the set, i.e. insert range [elem, elem + 1) into the set.
    pub fn add_elem(&mut self, elem: u64) {
        self.insert(elem..elem + 1);
    }

    /// Remove all ranges that are smaller or equal to `elem` from the set.
    pub fn remove_until(&mut self, elem: u64) {
        let ranges: Vec<Range<u64>> = self
            .set
            .range((Unbounded, Included(&elem)))
            .map(|(&s, &e)| (s..e))
            .collect();

        for r in ranges {
            self.set.remove(&r.start);

            if r.end > elem + 1 {
                let start = elem + 1;
                self.insert(start..r.end);
            }
        }
    }

    /// Clear the range set.
    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Return true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Return the minimum value in the set.
    pub fn min(&self) -> Option<u64> {
        self.iter().next().map(|x| x.start)
    }

    /// Return the maximum value in the set.
    #[allow(clippy::manual_next_back)]
    pub fn max(&self) -> Option<u64> {
        self.iter().rev().next().map(|x| x.end - 1)
    }

    /// Return the number of ranges in the set.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Return an iterator over the ranges in the set.
    pub fn iter(&self) -> Iter {
        Iter {
            set: self.set.iter(),
        }
    }

    /// Find the closest range to `elem` that begins *at* or before it.
    fn prev_to(&self, elem: u64) -> Option<Range<u64>> {
        self.set
            .range((Unbounded, Included(elem)))
            .map(|(&s, &e)| (s..e))
            .next_back()
    }

    /// Find the closest range to `elem` that begins *at* or after it.
    fn next_to(&self, elem: u64) -> Option<Range<u64>> {
        self.set
            .range((Included(elem), Unbounded))
            .map(|(&s, &e)| (s..e))
            .next()
    }

    /// Check if the element exists or not
    pub fn contains(&self, elem: u64) -> bool {
        if let Some(prev) = self.prev_to(elem) {
            if prev.contains(&elem) {
                return true;
            }
        }
        if let Some(next) = self.next_to(elem) {
            if next.contains(&elem) {
                return true;
            }
        }
        false
    }

    /// Peek at the smallest range in the set.
    pub fn peek_min(&self) -> Option<Range<u64>> {
        let (&start, &end) = self.set.iter().next()?;
        Some(start..end)
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ranges: Vec<Range<u64>> = self.iter().map(|r| (r.start..r.end - 1)).collect();
        write!(f, "{:?}", ranges)
    }
}

/// An iterator over the ranges in the `RangeSet`.
pub struct Iter<'a> {
    set: btree_map::Iter<'a, u64, u64>,
}

impl Iterator for Iter<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.set.next()?;
        Some(start..end)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.set.next_back()?;
        Some(start..end)
    }
}

impl ExactSizeIterator for Iter<'_> {
    fn len(&self) -> usize {
        self.set.len()
    }
}
