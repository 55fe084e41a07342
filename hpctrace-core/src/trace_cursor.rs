//! TraceCursor (§4.4): per-rank sampling over a byte slice `[lo, hi]`,
//! answering `sample(t_start, t_range, pixel_width)` with at most
//! `pixel_width` interior points plus up to two boundary points.

use crate::error::Result;
use crate::paged_file::PagedFile;
use crate::record::{TraceRecord, RECORD_SIZE};

/// Borrows the PagedFile read-only for the duration of one per-rank sample;
/// never outlives the controller that owns the file (§9 redesign note on
/// the pointer graph).
pub struct TraceCursor<'a> {
    file: &'a PagedFile,
}

impl<'a> TraceCursor<'a> {
    pub fn new(file: &'a PagedFile) -> Self {
        Self { file }
    }

    fn read_record(&self, offset: u64) -> Result<TraceRecord> {
        Ok(TraceRecord::decode(&self.file.get_record(offset)?))
    }

    fn read_time(&self, offset: u64) -> Result<i64> {
        Ok(self.file.get_u64(offset)? as i64)
    }

    /// Interpolated binary search over record indices in `[lo, hi]` (§4.4).
    /// Converges when the bracket narrows to adjacent records, then returns
    /// whichever is closer to `t` (ties go left), capped at `hi`.
    fn find_time(&self, lo: u64, hi: u64, t: i64) -> Result<u64> {
        let mut l = lo;
        let mut r = hi;
        let mut l_time = self.read_time(l)?;
        let mut r_time = self.read_time(r)?;

        if t <= l_time {
            return Ok(l);
        }
        if t >= r_time {
            return Ok(r);
        }

        loop {
            let l_index = l / RECORD_SIZE;
            let r_index = r / RECORD_SIZE;
            if r_index <= l_index + 1 {
                return Ok(if (t - l_time).abs() <= (r_time - t).abs() { l } else { r });
            }

            let span = (r_index - l_index) as f64;
            let frac = (t - l_time) as f64 / (r_time - l_time) as f64;
            let mut pred_index = l_index + (span * frac) as u64;
            if pred_index <= l_index {
                pred_index = l_index + 1;
            }
            if pred_index >= r_index {
                pred_index = r_index - 1;
            }
            let pred_offset = pred_index * RECORD_SIZE;
            let pred_time = self.read_time(pred_offset)?;

            match pred_time.cmp(&t) {
                std::cmp::Ordering::Equal => return Ok(pred_offset),
                std::cmp::Ordering::Less => {
                    l = pred_offset;
                    l_time = pred_time;
                }
                std::cmp::Ordering::Greater => {
                    r = pred_offset;
                    r_time = pred_time;
                }
            }
        }
    }

    /// Recursive column sampler. Inserts sampled byte offsets into `out` at
    /// `insert_at`, preserving file order, and returns the count inserted.
    #[allow(clippy::too_many_arguments)]
    fn sample_columns(
        &self,
        lo: u64,
        hi: u64,
        col_lo: i64,
        col_hi: i64,
        t_start: i64,
        dt_per_pixel: f64,
        out: &mut Vec<u64>,
        insert_at: usize,
    ) -> Result<usize> {
        let mid = (col_lo + col_hi) / 2;
        if mid == col_lo {
            return Ok(0);
        }
        let t_mid = (t_start as f64 + mid as f64 * dt_per_pixel).floor() as i64;
        let loc = self.find_time(lo, hi, t_mid)?;
        out.insert(insert_at, loc);

        let added_l = self.sample_columns(lo, loc, col_lo, mid, t_start, dt_per_pixel, out, insert_at)?;
        let added_r =
            self.sample_columns(loc, hi, mid, col_hi, t_start, dt_per_pixel, out, insert_at + added_l + 1)?;
        Ok(added_l + added_r + 1)
    }

    /// `sample(t_start, t_range, pixel_width) -> Vec<(time, context_id)>`
    /// for the rank's byte slice `[lo, hi]` (inclusive record-start
    /// offsets). An empty slice (`hi < lo`, i.e. the rank holds zero
    /// records) yields an empty result.
    pub fn sample(&self, lo: u64, hi: u64, t_start: i64, t_range: i64, pixel_width: i32) -> Result<Vec<TraceRecord>> {
        if hi < lo {
            return Ok(Vec::new());
        }
        let pixel_width = pixel_width.max(1);
        let t_end = t_start + t_range;
        let dt_per_pixel = t_range as f64 / pixel_width as f64;

        let loc_start = self.find_time(lo, hi, t_start)?;
        let loc_end = std::cmp::min(self.find_time(lo, hi, t_end)? + RECORD_SIZE, hi);

        let n = (loc_end - loc_start) / RECORD_SIZE + 1;
        let mut offsets: Vec<u64> = Vec::new();
        if n <= pixel_width as u64 {
            let mut off = loc_start;
            while off <= loc_end {
                offsets.push(off);
                off += RECORD_SIZE;
            }
        } else {
            self.sample_columns(loc_start, loc_end, 0, pixel_width as i64, t_start, dt_per_pixel, &mut offsets, 0)?;
        }

        if loc_end < hi {
            offsets.push(loc_end);
        }
        if loc_start > lo {
            offsets.insert(0, loc_start - RECORD_SIZE);
        }

        let mut samples = Vec::with_capacity(offsets.len());
        for off in offsets {
            samples.push(self.read_record(off)?);
        }

        samples.dedup_by(|a, b| a.time == b.time);
        Ok(samples)
    }
}
