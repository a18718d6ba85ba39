//! Canonical, coalesced set of block indices.
//!
//! Ranges are kept sorted and disjoint with a gap of at least one block
//! between any two consecutive ranges: two ranges that touch (`a.end + 1 ==
//! b.start`) are merged, never stored side by side. This invariant is
//! maintained incrementally by `add`; nothing re-checks it afterwards.

use crate::error::{DdbError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, BufRead, Read, Write};

/// On-disk magic for the binary block-range-list format.
pub const MAGIC: &[u8; 8] = b"BlockLst";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRangeSet {
    ranges: Vec<(u64, u64)>,
    count: u64,
}

impl BlockRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint ranges currently stored. Mostly useful for tests.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Cached `Σ(end − start + 1)`.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Add the inclusive range `[s, e]`, coalescing with any range that
    /// touches or overlaps it.
    ///
    /// `O(k)` where `k` is the number of ranges the new range touches: a
    /// single linear walk extends the left/right neighbour in place and
    /// swallows any ranges the extension now overlaps, rather than
    /// rebuilding the whole vector.
    pub fn add(&mut self, s: u64, e: u64) {
        assert!(s <= e, "add: start {s} must be <= end {e}");

        // Find the first range whose end is not strictly left-disjoint from
        // the new range (i.e. could touch or overlap it).
        let mut i = 0;
        while i < self.ranges.len() && self.ranges[i].1 + 1 < s {
            i += 1;
        }

        if i == self.ranges.len() || self.ranges[i].0 > e + 1 {
            // No touching/overlapping neighbour: insert a fresh range.
            self.ranges.insert(i, (s, e));
            self.count += e - s + 1;
            return;
        }

        // self.ranges[i] touches or overlaps [s, e]. Extend it, then
        // swallow any following ranges that the extension now reaches.
        let new_start = self.ranges[i].0.min(s);
        let mut new_end = self.ranges[i].1.max(e);

        let old_len = self.ranges[i].1 - self.ranges[i].0 + 1;
        self.count -= old_len;

        let mut j = i + 1;
        while j < self.ranges.len() && self.ranges[j].0 <= new_end + 1 {
            new_end = new_end.max(self.ranges[j].1);
            self.count -= self.ranges[j].1 - self.ranges[j].0 + 1;
            j += 1;
        }
        self.ranges.splice(i..j, [(new_start, new_end)]);
        self.count += new_end - new_start + 1;
    }

    pub fn has(&self, b: u64) -> bool {
        // Binary search over disjoint, sorted ranges.
        match self.ranges.binary_search_by(|r| {
            if b < r.0 {
                std::cmp::Ordering::Greater
            } else if b > r.1 {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// New set containing exactly `self ∩ [s, e]`.
    pub fn sub(&self, s: u64, e: u64) -> BlockRangeSet {
        let mut out = BlockRangeSet::new();
        for &(rs, re) in &self.ranges {
            if re < s || rs > e {
                continue;
            }
            out.add(rs.max(s), re.min(e));
        }
        out
    }

    /// Union of a slice of sets. Empty slice yields the empty set.
    pub fn union(sets: &[&BlockRangeSet]) -> BlockRangeSet {
        let mut out = BlockRangeSet::new();
        for s in sets {
            for &(rs, re) in &s.ranges {
                out.add(rs, re);
            }
        }
        out
    }

    /// Intersection of a slice of sets. Empty slice yields the empty set;
    /// a single-element slice yields a copy.
    ///
    /// Implemented as a sweep-line over `n` sorted cursors: advance the
    /// cursor(s) lagging behind the current window, emit the overlap when
    /// every cursor covers it, then push the window past the overlap.
    pub fn intersect(sets: &[&BlockRangeSet]) -> BlockRangeSet {
        let mut out = BlockRangeSet::new();
        match sets.len() {
            0 => return out,
            1 => return sets[0].clone(),
            _ => {}
        }

        let mut cursors = vec![0usize; sets.len()];
        loop {
            // Any list exhausted => no more possible overlaps.
            if cursors.iter().zip(sets).any(|(&c, s)| c >= s.ranges.len()) {
                break;
            }

            let rs = cursors
                .iter()
                .zip(sets)
                .map(|(&c, s)| s.ranges[c].0)
                .max()
                .unwrap();
            let re = cursors
                .iter()
                .zip(sets)
                .map(|(&c, s)| s.ranges[c].1)
                .min()
                .unwrap();

            if rs <= re {
                out.add(rs, re);
            }

            // Advance every cursor whose range ends at or before `re`.
            let mut advanced_any = false;
            for (c, s) in cursors.iter_mut().zip(sets) {
                if s.ranges[*c].1 <= re {
                    *c += 1;
                    advanced_any = true;
                }
            }
            if !advanced_any {
                // Every remaining range starts after `re`; nothing more to
                // do at this window, force progress on the earliest one.
                let min_idx = cursors
                    .iter()
                    .zip(sets)
                    .enumerate()
                    .min_by_key(|(_, (&c, s))| s.ranges[c].0)
                    .map(|(i, _)| i)
                    .unwrap();
                cursors[min_idx] += 1;
            }
        }
        out
    }

    /// Invoke `f(start, end)` on each range in ascending order. Stops early
    /// if `f` returns `false`.
    pub fn iterate<F: FnMut(u64, u64) -> bool>(&self, mut f: F) {
        for &(s, e) in &self.ranges {
            if !f(s, e) {
                break;
            }
        }
    }

    // ── Binary (de)serialization ─────────────────────────────────────────

    pub fn save<W: Write>(&self, mut w: W) -> io::Result<()> {
        let n = self.ranges.len() as u64;
        w.write_all(MAGIC)?;
        w.write_u64::<BigEndian>(n)?;
        for &(s, e) in &self.ranges {
            w.write_u64::<BigEndian>(s)?;
            w.write_u64::<BigEndian>(e)?;
        }
        // Trailing record equal to the header.
        w.write_all(MAGIC)?;
        w.write_u64::<BigEndian>(n)?;
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<BlockRangeSet> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DdbError::invalid("block range list: bad magic"));
        }
        let n = r.read_u64::<BigEndian>()?;

        let mut set = BlockRangeSet::new();
        let mut prev_end: Option<u64> = None;
        for _ in 0..n {
            let s = r.read_u64::<BigEndian>()?;
            let e = r.read_u64::<BigEndian>()?;
            if s > e {
                return Err(DdbError::invalid("block range list: start > end"));
            }
            if let Some(pe) = prev_end {
                if pe + 2 > s {
                    return Err(DdbError::invalid("block range list: ranges not properly spaced"));
                }
            }
            set.ranges.push((s, e));
            set.count += e - s + 1;
            prev_end = Some(e);
        }

        let mut trailer_magic = [0u8; 8];
        r.read_exact(&mut trailer_magic)?;
        let trailer_n = r.read_u64::<BigEndian>()?;
        if trailer_magic != magic || trailer_n != n {
            return Err(DdbError::invalid("block range list: trailer mismatch"));
        }
        Ok(set)
    }

    // ── Text (de)serialization ───────────────────────────────────────────

    pub fn print<W: Write>(&self, mut w: W) -> io::Result<()> {
        for &(s, e) in &self.ranges {
            if s == e {
                writeln!(w, "{s}")?;
            } else {
                writeln!(w, "{s}:{e}")?;
            }
        }
        Ok(())
    }

    pub fn read<R: Read>(r: R) -> Result<BlockRangeSet> {
        let mut set = BlockRangeSet::new();
        for line in io::BufReader::new(r).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((s, e)) => {
                    let s: u64 = s
                        .parse()
                        .map_err(|_| DdbError::invalid(format!("bad range line: {line}")))?;
                    let e: u64 = e
                        .parse()
                        .map_err(|_| DdbError::invalid(format!("bad range line: {line}")))?;
                    set.add(s, e);
                }
                None => {
                    let b: u64 = line
                        .parse()
                        .map_err(|_| DdbError::invalid(format!("bad range line: {line}")))?;
                    set.add(b, b);
                }
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_merges_touching_ranges_on_both_sides() {
        let mut s = BlockRangeSet::new();
        s.add(10, 20);
        s.add(30, 40);
        s.add(21, 29); // touches both neighbours -> merges into one
        assert_eq!(s.ranges(), &[(10, 40)]);
        assert_eq!(s.count(), 31);
    }

    #[test]
    fn merge_sub_union_intersect_scenario() {
        let mut s = BlockRangeSet::new();
        assert_eq!(s.count(), 0);

        s.add(42, 99);
        assert_eq!(s.count(), 58);
        assert_eq!(s.ranges(), &[(42, 99)]);
        assert!(!s.has(39));
        assert!(s.has(42));
        assert!(s.has(99));
        assert!(!s.has(100));

        s.add(3, 16); // disjoint range before the first one
        assert_eq!(s.count(), 72);
        assert_eq!(s.ranges(), &[(3, 16), (42, 99)]);

        s.add(40, 41); // joins the second range to the left
        assert_eq!(s.count(), 74);
        assert_eq!(s.ranges(), &[(3, 16), (40, 99)]);

        s.add(38, 40); // ditto, with a 1-element overlap
        assert_eq!(s.count(), 76);
        assert_eq!(s.ranges(), &[(3, 16), (38, 99)]);

        s.add(35, 40); // ditto, with more overlap
        assert_eq!(s.count(), 79);
        assert_eq!(s.ranges(), &[(3, 16), (35, 99)]);

        s.add(135, 142); // past the end again
        assert_eq!(s.count(), 87);
        assert_eq!(s.ranges(), &[(3, 16), (35, 99), (135, 142)]);

        s.add(100, 101); // joins the second range to the right
        assert_eq!(s.count(), 89);
        assert_eq!(s.ranges(), &[(3, 16), (35, 101), (135, 142)]);

        s.add(101, 103); // 1-element overlap
        assert_eq!(s.count(), 91);
        assert_eq!(s.ranges(), &[(3, 16), (35, 103), (135, 142)]);

        s.add(101, 105); // more overlap
        assert_eq!(s.count(), 93);
        assert_eq!(s.ranges(), &[(3, 16), (35, 105), (135, 142)]);

        s.add(1, 5); // left of the first range
        assert_eq!(s.count(), 95);
        assert_eq!(s.ranges(), &[(1, 16), (35, 105), (135, 142)]);

        s.add(9, 45); // joins the first two ranges together
        assert_eq!(s.count(), 113);
        assert_eq!(s.ranges(), &[(1, 105), (135, 142)]);

        s.add(200, 203);
        assert_eq!(s.count(), 117);
        assert_eq!(s.ranges(), &[(1, 105), (135, 142), (200, 203)]);

        s.add(190, 193);
        assert_eq!(s.count(), 121);
        assert_eq!(s.ranges(), &[(1, 105), (135, 142), (190, 193), (200, 203)]);

        let a = s.sub(42, 192);
        assert_eq!(a.count(), 75);
        assert_eq!(a.ranges(), &[(42, 105), (135, 142), (190, 192)]);

        let b = s.sub(142, 999);
        assert_eq!(b.count(), 9);
        assert_eq!(b.ranges(), &[(142, 142), (190, 193), (200, 203)]);

        let c = s.sub(0, 35);
        assert_eq!(c.count(), 35);
        assert_eq!(c.ranges(), &[(1, 35)]);

        s.add(42, 202); // join everything together to test multiple overlaps
        assert_eq!(s.count(), 203);
        assert_eq!(s.ranges(), &[(1, 203)]);

        let u = BlockRangeSet::union(&[&a, &b, &c]);
        assert_eq!(u.count(), 115);
        assert_eq!(u.ranges(), &[(1, 35), (42, 105), (135, 142), (190, 193), (200, 203)]);

        let all = BlockRangeSet::intersect(&[&a, &b, &c]);
        assert_eq!(all.count(), 0);
        assert!(all.is_empty());

        let ab = BlockRangeSet::intersect(&[&a, &b]);
        assert_eq!(ab.count(), 4);
        assert_eq!(ab.ranges(), &[(142, 142), (190, 192)]);
        assert!(!ab.has(139));
        assert!(ab.has(142));
        assert!(!ab.has(143));
        assert!(!ab.has(189));
        assert!(ab.has(190));
        assert!(ab.has(192));
        assert!(!ab.has(193));
    }

    #[test]
    fn has_matches_membership() {
        let mut s = BlockRangeSet::new();
        s.add(5, 10);
        s.add(20, 20);
        for b in 0..30 {
            let expect = (5..=10).contains(&b) || b == 20;
            assert_eq!(s.has(b), expect, "block {b}");
        }
    }

    #[test]
    fn sub_is_intersection_with_range() {
        let mut s = BlockRangeSet::new();
        s.add(0, 100);
        let sub = s.sub(40, 60);
        for b in 0..120 {
            assert_eq!(sub.has(b), s.has(b) && (40..=60).contains(&b));
        }
    }

    #[test]
    fn union_and_intersect_laws() {
        let mut a = BlockRangeSet::new();
        a.add(0, 10);
        a.add(20, 30);
        let mut b = BlockRangeSet::new();
        b.add(5, 25);

        let u = BlockRangeSet::union(&[&a, &b]);
        let i = BlockRangeSet::intersect(&[&a, &b]);
        for x in 0..40 {
            assert_eq!(u.has(x), a.has(x) || b.has(x), "union at {x}");
            assert_eq!(i.has(x), a.has(x) && b.has(x), "intersect at {x}");
        }
    }

    #[test]
    fn intersect_empty_and_single() {
        let empty = BlockRangeSet::intersect(&[]);
        assert!(empty.is_empty());

        let mut a = BlockRangeSet::new();
        a.add(1, 5);
        let copy = BlockRangeSet::intersect(&[&a]);
        assert_eq!(copy, a);
    }

    #[test]
    fn binary_round_trip() {
        let mut s = BlockRangeSet::new();
        s.add(1, 5);
        s.add(10, 10);
        s.add(1000, 2000);

        let mut buf = Vec::new();
        s.save(&mut buf).unwrap();
        let loaded = BlockRangeSet::load(&buf[..]).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn text_round_trip() {
        let mut s = BlockRangeSet::new();
        s.add(1, 5);
        s.add(10, 10);

        let mut buf = Vec::new();
        s.print(&mut buf).unwrap();
        let loaded = BlockRangeSet::read(&buf[..]).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn load_rejects_bad_trailer() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&1u64.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&5u64.to_be_bytes());
        // trailer count wrong (2 instead of 1)
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&2u64.to_be_bytes());
        assert!(BlockRangeSet::load(&buf[..]).is_err());
    }

    #[test]
    fn iterate_stops_early() {
        let mut s = BlockRangeSet::new();
        s.add(1, 2);
        s.add(10, 11);
        s.add(20, 21);
        let mut seen = Vec::new();
        s.iterate(|a, b| {
            seen.push((a, b));
            a < 10
        });
        assert_eq!(seen, vec![(1, 2), (10, 11)]);
    }
}
