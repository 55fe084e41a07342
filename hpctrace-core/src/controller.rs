//! SpaceTimeController (§4.3): the composition root for one opened database.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paged_file::PagedFile;
use crate::rank_filter::{FilterSet, RankFilter};
use crate::rank_index::RankIndex;
use crate::trace_cursor::TraceCursor;

/// The most recent DATA request's parameters (§3). Mutated only by
/// `SessionServer` between requests; read by workers during a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageAttributes {
    pub rank_lo: i32,
    pub rank_hi: i32,
    pub t_lo: i64,
    pub t_hi: i64,
    pub pixels_h: i32,
    pub pixels_v: i32,
    pub cursor_line: i32,
}

/// Pure mapping from a cursor line to the logical rank it samples (§4.3):
/// strided when the request spans more ranks than output lines, 1-to-1
/// otherwise. Exposed as a free function (rather than buried in
/// `next_cursor`'s mutable counter) so both the inline iteration and the
/// distributed workers' independent line assignments can call the same
/// logic without sharing state.
pub fn cursor_line_to_rank(rank_lo: i32, rank_hi: i32, pixels_v: i32, cursor_line: i32) -> i32 {
    let span = rank_hi - rank_lo;
    if span > pixels_v && pixels_v > 0 {
        rank_lo + ((cursor_line as i64 * span as i64) / pixels_v as i64) as i32
    } else {
        rank_lo + cursor_line
    }
}

pub struct SpaceTimeController {
    trace_path: PathBuf,
    xml_path: PathBuf,
    page_size: u64,
    memory_budget: u64,
    paged_file: PagedFile,
    rank_index: RankIndex,
    rank_filter: RankFilter,
    header_size: i32,
    attrs: ImageAttributes,
}

impl SpaceTimeController {
    pub fn open(
        xml_path: impl Into<PathBuf>,
        trace_path: impl Into<PathBuf>,
        page_size: u64,
        memory_budget: u64,
    ) -> Result<Self> {
        let trace_path = trace_path.into();
        let xml_path = xml_path.into();
        let paged_file = PagedFile::open_with_budget(&trace_path, page_size, memory_budget)?;
        let rank_index = RankIndex::parse(&paged_file)?;
        let rank_filter = RankFilter::identity(&rank_index);
        let header_size = Self::default_header_size(&rank_index);

        Ok(Self {
            trace_path,
            xml_path,
            page_size,
            memory_budget,
            paged_file,
            rank_index,
            rank_filter,
            header_size,
            attrs: ImageAttributes::default(),
        })
    }

    /// §9 Open Question: the original's `SpaceTimeDataController` assumes a
    /// fixed 24-byte header at open time regardless of rank count; a `set_info`
    /// call whose `header_size` differs from this constant is what triggers the
    /// PagedFile rebuild, not a mismatch against the merged file's actual
    /// `(type, N, entries)` header length.
    const DEFAULT_HEADER_SIZE: i32 = 24;

    fn default_header_size(_index: &RankIndex) -> i32 {
        Self::DEFAULT_HEADER_SIZE
    }

    pub fn xml_path(&self) -> &Path {
        &self.xml_path
    }

    pub fn rank_count(&self) -> usize {
        self.rank_filter.logical_count()
    }

    pub fn pid_tid_roster(&self) -> Vec<(i32, i32)> {
        self.rank_filter.pid_tid_in_logical_order(&self.rank_index)
    }

    pub fn is_multi_process(&self) -> bool {
        self.rank_index.is_multi_process()
    }

    pub fn is_multi_threading(&self) -> bool {
        self.rank_index.is_multi_threading()
    }

    pub fn paged_file(&self) -> &PagedFile {
        &self.paged_file
    }

    pub fn rank_index(&self) -> &RankIndex {
        &self.rank_index
    }

    pub fn rank_filter(&self) -> &RankFilter {
        &self.rank_filter
    }

    /// `set_info` (§4.3): records the experiment's time bounds and, if
    /// `header_size` differs from the default derived at open time,
    /// rebuilds the PagedFile over the same already-merged file rather than
    /// re-running the shard merge (§9 Open Question).
    pub fn set_info(&mut self, header_size: i32) -> Result<()> {
        if header_size != self.header_size {
            self.paged_file = PagedFile::open_with_budget(&self.trace_path, self.page_size, self.memory_budget)?;
            self.rank_index = RankIndex::parse(&self.paged_file)?;
            self.rank_filter = RankFilter::identity(&self.rank_index);
            self.header_size = header_size;
        }
        Ok(())
    }

    pub fn apply_filters(&mut self, filters: FilterSet) {
        self.rank_filter.set_filters(&self.rank_index, filters);
    }

    /// Begin a new DATA request: resets `cursor_line` to 0 (§4.3 invariant).
    pub fn begin_request(&mut self, rank_lo: i32, rank_hi: i32, t_lo: i64, t_hi: i64, pixels_h: i32, pixels_v: i32) {
        self.attrs = ImageAttributes { rank_lo, rank_hi, t_lo, t_hi, pixels_h, pixels_v, cursor_line: 0 };
    }

    pub fn attrs(&self) -> ImageAttributes {
        self.attrs
    }

    /// Advances `cursor_line` and returns the logical rank it maps to, or
    /// `None` once the request's output is exhausted.
    pub fn next_cursor_line(&mut self) -> Option<(i32, i32)> {
        let a = self.attrs;
        let line_count = std::cmp::min(a.pixels_v, a.rank_hi - a.rank_lo);
        if a.cursor_line >= line_count {
            return None;
        }
        let rank = cursor_line_to_rank(a.rank_lo, a.rank_hi, a.pixels_v, a.cursor_line);
        let line = a.cursor_line;
        self.attrs.cursor_line += 1;
        Some((line, rank))
    }

    /// Produce a TraceCursor for `logical_rank`, borrowing the controller's
    /// PagedFile for the duration of the sample.
    pub fn cursor(&self) -> TraceCursor<'_> {
        TraceCursor::new(&self.paged_file)
    }

    pub fn rank_slice(&self, logical_rank: i32) -> Result<(u64, u64)> {
        let logical = logical_rank as usize;
        if logical >= self.rank_filter.logical_count() {
            return Err(crate::error::Error::InvalidRequest(format!(
                "logical rank {logical_rank} out of range (have {})",
                self.rank_filter.logical_count()
            )));
        }
        Ok(self.rank_filter.slice_of(&self.rank_index, logical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_mapping_subsamples_oversubscribed_ranks() {
        // rank_hi - rank_lo = 10 > pixels_v = 4: strided.
        assert_eq!(cursor_line_to_rank(0, 10, 4, 0), 0);
        assert_eq!(cursor_line_to_rank(0, 10, 4, 1), 2);
        assert_eq!(cursor_line_to_rank(0, 10, 4, 3), 7);
    }

    #[test]
    fn one_to_one_mapping_when_not_oversubscribed() {
        assert_eq!(cursor_line_to_rank(5, 9, 10, 0), 5);
        assert_eq!(cursor_line_to_rank(5, 9, 10, 3), 8);
    }
}
