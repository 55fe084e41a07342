//! RankIndex (§4.2): the fixed header at the front of the merged trace file,
//! and the physical rank table it describes.

use crate::error::{Error, Result};
use crate::paged_file::PagedFile;
use crate::record::RECORD_SIZE;

const TYPE_FLAG_MULTI_PROCESS: u32 = 1 << 0;
const TYPE_FLAG_MULTI_THREADING: u32 = 1 << 1;

/// `(process_id, thread_id, [start,end])` for one physical rank (§3).
#[derive(Debug, Clone, Copy)]
pub struct RankSlice {
    pub process_id: i32,
    pub thread_id: i32,
    pub start: u64,
    pub end: u64,
}

impl RankSlice {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// The physical rank table plus the type flag, read once at open time and
/// immutable for the lifetime of the opened database.
pub struct RankIndex {
    type_flag: u32,
    slices: Vec<RankSlice>,
}

impl RankIndex {
    /// `header_size` is the byte offset at which the *first* rank's records
    /// begin relative to the raw header bytes already consumed here; it only
    /// matters for callers that want to tolerate a non-default INFO
    /// `header_size` (§9 Open Question) by reopening the PagedFile at a
    /// different base offset. RankIndex itself always parses starting at
    /// file offset 0, since the header it reads *is* `(type, N, entries)`.
    pub fn parse(file: &PagedFile) -> Result<Self> {
        if file.size() < 8 {
            return Err(Error::InvalidDatabase(
                "trace file too small to contain a rank index header".into(),
            ));
        }
        let type_flag = file.get_u32(0)?;
        let rank_count = file.get_u32(4)?;

        let entry_size = 4 + 4 + 8; // pid:u32, tid:u32, start:u64
        let entries_end = 8 + entry_size as u64 * rank_count as u64;
        if entries_end > file.size() {
            return Err(Error::InvalidDatabase(
                "rank index header extends past end of file".into(),
            ));
        }

        let mut starts = Vec::with_capacity(rank_count as usize);
        let mut pids = Vec::with_capacity(rank_count as usize);
        let mut tids = Vec::with_capacity(rank_count as usize);
        let mut offset = 8u64;
        for _ in 0..rank_count {
            let pid = file.get_u32(offset)?;
            let tid = file.get_u32(offset + 4)?;
            let start = file.get_u64(offset + 8)?;
            pids.push(pid as i32);
            tids.push(tid as i32);
            starts.push(start);
            offset += entry_size as u64;
        }

        // end_marker occupies the final 8 bytes of the file (§6.2).
        const END_MARKER_SIZE: u64 = 8;
        let mut slices = Vec::with_capacity(rank_count as usize);
        for i in 0..rank_count as usize {
            let start = starts[i];
            let end = if i + 1 < starts.len() {
                starts[i + 1].saturating_sub(RECORD_SIZE)
            } else {
                file.size().saturating_sub(RECORD_SIZE + END_MARKER_SIZE)
            };
            slices.push(RankSlice { process_id: pids[i], thread_id: tids[i], start, end });
        }

        Ok(Self { type_flag, slices })
    }

    pub fn rank_count(&self) -> usize {
        self.slices.len()
    }

    pub fn pid_of(&self, i: usize) -> i32 {
        self.slices[i].process_id
    }

    pub fn tid_of(&self, i: usize) -> i32 {
        self.slices[i].thread_id
    }

    pub fn start_of(&self, i: usize) -> u64 {
        self.slices[i].start
    }

    pub fn end_of(&self, i: usize) -> u64 {
        self.slices[i].end
    }

    pub fn slice(&self, i: usize) -> RankSlice {
        self.slices[i]
    }

    pub fn is_multi_process(&self) -> bool {
        self.type_flag & TYPE_FLAG_MULTI_PROCESS != 0
    }

    pub fn is_multi_threading(&self) -> bool {
        self.type_flag & TYPE_FLAG_MULTI_THREADING != 0
    }
}
