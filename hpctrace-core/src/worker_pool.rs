//! WorkerPool (§4.5, §9 "Dynamic dispatch on transport"): one contract,
//! two implementations. `InlineWorkerPool` runs every cursor line itself;
//! `DistributedWorkerPool` simulates the coordinator/peer split with scoped
//! threads and channels standing in for the group transport this repo
//! treats as an external collaborator (see DESIGN.md).

use std::path::Path;
use std::sync::mpsc;

use crate::compression::{encode_rank_body, RankStreamCompressor};
use crate::controller::cursor_line_to_rank;
use crate::error::Result;
use crate::paged_file::PagedFile;
use crate::rank_filter::{FilterSet, RankFilter};
use crate::rank_index::RankIndex;
use crate::trace_cursor::TraceCursor;

/// The resolved parameters of one DATA request (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct DataWindow {
    pub rank_lo: i32,
    pub rank_hi: i32,
    pub t_lo: i64,
    pub t_hi: i64,
    pub pixels_h: i32,
    pub pixels_v: i32,
    /// Whether per-rank bodies are DEFLATE-compressed (§4.6) or sent as the
    /// raw delta stream. Mirrors the session's `compression` flag (§3).
    pub compress: bool,
}

impl DataWindow {
    pub fn line_count(&self) -> i32 {
        std::cmp::min(self.pixels_v, self.rank_hi - self.rank_lo).max(0)
    }
}

/// One finished rank's worth of work, ready to be framed onto the wire by
/// `SessionServer` as a `RankPayloadHeader` + body. `body` is DEFLATE-
/// compressed when the request's `DataWindow::compress` was set, otherwise
/// it is the raw delta stream (§4.6).
#[derive(Debug, Clone)]
pub struct RankReply {
    pub cursor_line: i32,
    pub rank_id: i32,
    pub begin_time: u64,
    pub end_time: u64,
    pub entry_count: i32,
    pub body: Vec<u8>,
}

/// Read-only view of an opened database, borrowed for the lifetime of one
/// DATA request. `RankIndex`/`RankFilter` never mutate mid-request (§3), so
/// scoped worker threads can borrow them directly without cloning.
#[derive(Clone, Copy)]
pub struct DataSnapshot<'a> {
    pub paged_file: &'a PagedFile,
    pub rank_index: &'a RankIndex,
    pub rank_filter: &'a RankFilter,
}

fn sample_one_rank(snapshot: &DataSnapshot<'_>, window: &DataWindow, cursor_line: i32, rank: i32) -> Result<(i32, i32, u64, u64, i32, Vec<u8>)> {
    let (lo, hi) = snapshot.rank_filter.slice_of(snapshot.rank_index, rank as usize);
    let cursor = TraceCursor::new(snapshot.paged_file);
    let samples = cursor.sample(lo, hi, window.t_lo, window.t_hi - window.t_lo, window.pixels_h)?;
    let begin_time = samples.first().map(|r| r.time).unwrap_or(0);
    let end_time = samples.last().map(|r| r.time).unwrap_or(0);
    let raw = encode_rank_body(&samples, begin_time);
    Ok((cursor_line, rank, begin_time, end_time, samples.len() as i32, raw))
}

/// `{broadcast_info, broadcast_open, broadcast_filter, dispatch_data,
/// collect_into(sink)}` (§9): inline is the degenerate implementation where
/// every `broadcast_*` is a local call and `dispatch_data` runs cursors
/// inline.
pub trait WorkerPool: Send {
    fn broadcast_open(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
    fn broadcast_info(&mut self, _header_size: i32) -> Result<()> {
        Ok(())
    }
    fn broadcast_filter(&mut self, _filters: FilterSet) -> Result<()> {
        Ok(())
    }

    /// Compute every logical rank in `[window.rank_lo, window.rank_hi)`
    /// selected by the cursor-line mapping and buffer the results for
    /// `collect_into` to drain.
    fn dispatch_data(&mut self, snapshot: DataSnapshot<'_>, window: DataWindow) -> Result<()>;

    /// Drain the buffered results, calling `sink` once per rank in the
    /// order they became available (arrival order, not rank order, in
    /// distributed mode — §5).
    fn collect_into(&mut self, sink: &mut dyn FnMut(RankReply) -> Result<()>) -> Result<()>;
}

#[derive(Default)]
pub struct InlineWorkerPool {
    pending: Vec<RankReply>,
}

impl InlineWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerPool for InlineWorkerPool {
    fn dispatch_data(&mut self, snapshot: DataSnapshot<'_>, window: DataWindow) -> Result<()> {
        self.pending.clear();
        let mut compressor = RankStreamCompressor::new();
        for cursor_line in 0..window.line_count() {
            let rank = cursor_line_to_rank(window.rank_lo, window.rank_hi, window.pixels_v, cursor_line);
            let (_, _, begin_time, end_time, entry_count, raw) =
                sample_one_rank(&snapshot, &window, cursor_line, rank)?;
            let body = if window.compress { compressor.compress_rank(&raw)? } else { raw };
            self.pending.push(RankReply { cursor_line, rank_id: rank, begin_time, end_time, entry_count, body });
        }
        Ok(())
    }

    fn collect_into(&mut self, sink: &mut dyn FnMut(RankReply) -> Result<()>) -> Result<()> {
        for reply in self.pending.drain(..) {
            sink(reply)?;
        }
        Ok(())
    }
}

/// Deterministic partition of `[rank_lo, rank_hi)` logical ranks across
/// `peers` workers (§4.5), peer indices compacted so the coordinator (peer
/// 0) never appears here.
fn partition_range(rank_lo: i32, rank_hi: i32, peers: i32, k: i32) -> (i32, i32) {
    let n = (rank_hi - rank_lo) as i64;
    let peers = peers as i64;
    let k = k as i64;
    let md = if peers > 0 { n % peers } else { 0 };
    let q = n as f64 / peers as f64;
    let ceil_q = q.ceil();
    let floor_q = q.floor();

    let min_k = md.min(k);
    let min_k1 = md.min(k + 1);
    let lo = rank_lo as i64 + (min_k as f64 * ceil_q + (k - min_k) as f64 * floor_q) as i64;
    let hi = rank_lo as i64 + (min_k1 as f64 * ceil_q + (k + 1 - min_k1) as f64 * floor_q) as i64 - 1;
    (lo as i32, hi as i32)
}

enum WorkerMsg {
    Reply(RankReply),
    Done { lines_sent: i32 },
}

/// Simulated cluster of `worker_count` peers (including the coordinator,
/// which does no sampling — §4.5). Peers are `std::thread::scope`d threads
/// communicating over `std::sync::mpsc`, standing in for the MPI-style
/// group transport treated here as an external collaborator.
pub struct DistributedWorkerPool {
    worker_count: usize,
    pending: Vec<RankReply>,
    compress: bool,
    compressor: RankStreamCompressor,
}

impl DistributedWorkerPool {
    /// `worker_count` includes the coordinator; must be at least 2 for any
    /// peer to exist.
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(2),
            pending: Vec::new(),
            compress: false,
            compressor: RankStreamCompressor::new(),
        }
    }
}

impl WorkerPool for DistributedWorkerPool {
    fn dispatch_data(&mut self, snapshot: DataSnapshot<'_>, window: DataWindow) -> Result<()> {
        self.pending.clear();
        // Only the coordinator runs a compressor, and only one (§4.6): if
        // each peer ran its own, the wire would carry several independent
        // interleaved deflate streams that no single persistent
        // `Decompress` on the client side could untangle. Workers therefore
        // send raw delta bodies; compression happens here, sequentially, as
        // replies are drained in emission order.
        self.compress = window.compress;
        self.compressor = RankStreamCompressor::new();
        let peers = (self.worker_count - 1) as i32;
        let line_count = window.line_count();
        let (tx, rx) = mpsc::channel::<WorkerMsg>();

        std::thread::scope(|scope| {
            for k in 0..peers {
                let tx = tx.clone();
                let snapshot = snapshot;
                scope.spawn(move || {
                    let (lo, hi) = partition_range(window.rank_lo, window.rank_hi, peers, k);
                    let mut lines_sent = 0i32;
                    // Autoskip seed (§4.5): start near this worker's share
                    // of the output instead of scanning from cursor_line 0.
                    let seed = if peers > 0 { (k as i64 * line_count as i64) / peers as i64 } else { 0 } as i32;
                    for cursor_line in seed..line_count {
                        let rank = cursor_line_to_rank(window.rank_lo, window.rank_hi, window.pixels_v, cursor_line);
                        if rank < lo {
                            continue;
                        }
                        if rank > hi {
                            break; // mapping is monotonic non-decreasing in cursor_line
                        }
                        match sample_one_rank(&snapshot, &window, cursor_line, rank) {
                            Ok((cursor_line, rank, begin_time, end_time, entry_count, raw)) => {
                                lines_sent += 1;
                                let _ = tx.send(WorkerMsg::Reply(RankReply {
                                    cursor_line,
                                    rank_id: rank,
                                    begin_time,
                                    end_time,
                                    entry_count,
                                    body: raw,
                                }));
                            }
                            Err(_) => break,
                        }
                    }
                    let _ = tx.send(WorkerMsg::Done { lines_sent });
                });
            }
            drop(tx);

            let mut dones = 0;
            while dones < peers {
                match rx.recv() {
                    Ok(WorkerMsg::Reply(reply)) => self.pending.push(reply),
                    Ok(WorkerMsg::Done { .. }) => dones += 1,
                    Err(_) => break,
                }
            }
        });

        Ok(())
    }

    fn collect_into(&mut self, sink: &mut dyn FnMut(RankReply) -> Result<()>) -> Result<()> {
        for mut reply in self.pending.drain(..) {
            if self.compress {
                reply.body = self.compressor.compress_rank(&reply.body)?;
            }
            sink(reply)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_every_rank_exactly_once() {
        // W = 3 (1 coordinator + 2 workers), ranks [0,4) (§8 scenario S6).
        let (lo0, hi0) = partition_range(0, 4, 2, 0);
        let (lo1, hi1) = partition_range(0, 4, 2, 1);
        assert_eq!((lo0, hi0), (0, 1));
        assert_eq!((lo1, hi1), (2, 3));
    }

    #[test]
    fn partition_handles_uneven_split() {
        let (lo0, hi0) = partition_range(0, 5, 2, 0);
        let (lo1, hi1) = partition_range(0, 5, 2, 1);
        // Every rank assigned exactly once, contiguous, non-overlapping.
        assert_eq!(hi0 + 1, lo1);
        assert_eq!(lo0, 0);
        assert_eq!(hi1, 4);
    }
}
