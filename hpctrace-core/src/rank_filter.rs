//! RankFilter (§4.2): predicates over `(process_id, thread_id)` and the
//! `FilterMap` (logical rank -> physical rank) they produce.

use crate::rank_index::RankIndex;

/// `(min, max, stride)` over a single integer dimension. Matches `v` iff
/// `min <= v <= max && (v - min) % stride == 0`. An empty range (`stride ==
/// 0`, or `min > max`) matches nothing.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub min: i32,
    pub max: i32,
    pub stride: i32,
}

impl Range {
    pub fn matches(&self, v: i32) -> bool {
        if self.stride <= 0 || self.min > self.max {
            return false;
        }
        v >= self.min && v <= self.max && (v - self.min) % self.stride == 0
    }
}

/// A single predicate over `(process_id, thread_id)`: both ranges must
/// match.
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    pub process: Range,
    pub thread: Range,
}

impl Filter {
    pub fn matches(&self, pid: i32, tid: i32) -> bool {
        self.process.matches(pid) && self.thread.matches(tid)
    }
}

/// An ordered list of [`Filter`]s plus a polarity bit. `matches` ANDs each
/// filter's match result XORed with the polarity bit (§4.2).
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    pub filters: Vec<Filter>,
    pub polarity: bool,
}

impl FilterSet {
    pub fn matches(&self, pid: i32, tid: i32) -> bool {
        self.filters.iter().all(|f| f.matches(pid, tid) ^ self.polarity)
    }

    pub fn is_identity(&self) -> bool {
        self.filters.is_empty() && !self.polarity
    }
}

/// Logical rank index -> physical rank index (§3). Recomputed whenever the
/// filter set is replaced; never mutated mid-request.
pub struct RankFilter {
    current: FilterSet,
    map: Vec<usize>,
}

impl RankFilter {
    /// The default mapping is the identity (§4.2).
    pub fn identity(index: &RankIndex) -> Self {
        let mut f = Self { current: FilterSet::default(), map: Vec::new() };
        f.recompute(index);
        f
    }

    pub fn set_filters(&mut self, index: &RankIndex, filters: FilterSet) {
        self.current = filters;
        self.recompute(index);
    }

    fn recompute(&mut self, index: &RankIndex) {
        self.map = (0..index.rank_count())
            .filter(|&i| self.current.matches(index.pid_of(i), index.tid_of(i)))
            .collect();
    }

    pub fn logical_count(&self) -> usize {
        self.map.len()
    }

    pub fn physical_of(&self, logical: usize) -> usize {
        self.map[logical]
    }

    pub fn slice_of(&self, index: &RankIndex, logical: usize) -> (u64, u64) {
        let p = self.physical_of(logical);
        (index.start_of(p), index.end_of(p))
    }

    pub fn pid_tid_in_logical_order(&self, index: &RankIndex) -> Vec<(i32, i32)> {
        self.map.iter().map(|&p| (index.pid_of(p), index.tid_of(p))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank_index::RankIndex;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn db_with_ranks(ranks: &[(u32, u32)]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&3u32.to_be_bytes()).unwrap();
        f.write_all(&(ranks.len() as u32).to_be_bytes()).unwrap();
        let header_len = 8 + ranks.len() * 16;
        let mut offset = header_len as u64;
        let mut starts = Vec::new();
        for _ in ranks {
            starts.push(offset);
            offset += 12; // one record per rank
        }
        for (i, (pid, tid)) in ranks.iter().enumerate() {
            f.write_all(&pid.to_be_bytes()).unwrap();
            f.write_all(&tid.to_be_bytes()).unwrap();
            f.write_all(&starts[i].to_be_bytes()).unwrap();
        }
        for _ in ranks {
            f.write_all(&0u64.to_be_bytes()).unwrap();
            f.write_all(&0u32.to_be_bytes()).unwrap();
        }
        f.write_all(&0xFFFFFFFFDEADF00Du64.to_be_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn identity_keeps_every_rank() {
        let f = db_with_ranks(&[(0, 0), (0, 1), (1, 0)]);
        let pf = crate::paged_file::PagedFile::open(
            f.path(),
            crate::paged_file::round_page_size(4096),
            8,
        )
        .unwrap();
        let idx = RankIndex::parse(&pf).unwrap();
        let filter = RankFilter::identity(&idx);
        assert_eq!(filter.logical_count(), 3);
        for i in 0..3 {
            assert_eq!(filter.physical_of(i), i);
        }
    }

    #[test]
    fn polarity_excludes_all_matches() {
        let f = db_with_ranks(&[(0, 0), (0, 1), (1, 0)]);
        let pf = crate::paged_file::PagedFile::open(
            f.path(),
            crate::paged_file::round_page_size(4096),
            8,
        )
        .unwrap();
        let idx = RankIndex::parse(&pf).unwrap();
        let mut filter = RankFilter::identity(&idx);
        let fs = FilterSet {
            filters: vec![Filter {
                process: Range { min: 0, max: 0, stride: 1 },
                thread: Range { min: 0, max: 0, stride: 1 },
            }],
            polarity: true,
        };
        filter.set_filters(&idx, fs);
        assert_eq!(filter.logical_count(), 0);
        for i in 0..idx.rank_count() {
            assert!(!filter.current.matches(idx.pid_of(i), idx.tid_of(i)) || (idx.pid_of(i), idx.tid_of(i)) != (0, 0));
        }
    }

    #[test]
    fn empty_identity_filter_set_is_a_no_op() {
        let f = db_with_ranks(&[(0, 0), (2, 5)]);
        let pf = crate::paged_file::PagedFile::open(
            f.path(),
            crate::paged_file::round_page_size(4096),
            8,
        )
        .unwrap();
        let idx = RankIndex::parse(&pf).unwrap();
        let mut filter = RankFilter::identity(&idx);
        let before: Vec<usize> = (0..filter.logical_count()).map(|i| filter.physical_of(i)).collect();
        filter.set_filters(&idx, FilterSet::default());
        let after: Vec<usize> = (0..filter.logical_count()).map(|i| filter.physical_of(i)).collect();
        assert_eq!(before, after);
    }
}
