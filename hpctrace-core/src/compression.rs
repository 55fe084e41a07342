//! WirePayload compression (§4.6, §6.3): one persistent zlib stream flushed
//! with `Z_SYNC_FLUSH` between ranks, plus a one-shot gzip stream for the
//! XML payload.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::record::TraceRecord;

/// Delta-encode one rank's samples: `delta_time:i32` (relative to the
/// running previous time, seeded with `begin_time`) then `context_id:i32`,
/// both big-endian, per record (§4.6).
pub fn encode_rank_body(records: &[TraceRecord], begin_time: u64) -> Vec<u8> {
    let mut raw = Vec::with_capacity(records.len() * 8);
    let mut prev = begin_time;
    for r in records {
        let delta = (r.time as i64).wrapping_sub(prev as i64) as i32;
        raw.extend_from_slice(&delta.to_be_bytes());
        raw.extend_from_slice(&(r.context_id as i32).to_be_bytes());
        prev = r.time;
    }
    raw
}

pub fn decode_rank_body(raw: &[u8], begin_time: u64) -> Vec<TraceRecord> {
    let mut out = Vec::with_capacity(raw.len() / 8);
    let mut prev = begin_time;
    for chunk in raw.chunks_exact(8) {
        let delta = i32::from_be_bytes(chunk[0..4].try_into().unwrap());
        let context_id = i32::from_be_bytes(chunk[4..8].try_into().unwrap()) as u32;
        let time = (prev as i64).wrapping_add(delta as i64) as u64;
        out.push(TraceRecord { time, context_id });
        prev = time;
    }
    out
}

/// One zlib DEFLATE stream, shared across every rank of a single DATA
/// response, flushed with `Z_SYNC_FLUSH` after each rank so the receiver
/// can decode rank bodies independently without the overall stream ever
/// closing (§4.6).
pub struct RankStreamCompressor {
    inner: Compress,
}

impl RankStreamCompressor {
    pub fn new() -> Self {
        Self { inner: Compress::new(Compression::default(), true) }
    }

    pub fn compress_rank(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw.len());
        let status = self
            .inner
            .compress_vec(raw, &mut out, FlushCompress::Sync)
            .map_err(|e| Error::InvalidRequest(format!("deflate error: {e}")))?;
        if status == Status::BufError {
            return Err(Error::InvalidRequest("deflate buffer error".into()));
        }
        Ok(out)
    }
}

impl Default for RankStreamCompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirror of [`RankStreamCompressor`] for decoding a stream of
/// `Z_SYNC_FLUSH`-delimited rank bodies (used by the probe client and
/// tests).
pub struct RankStreamDecompressor {
    inner: Decompress,
}

impl RankStreamDecompressor {
    pub fn new() -> Self {
        Self { inner: Decompress::new(true) }
    }

    pub fn decompress_rank(&mut self, compressed: &[u8], expected_raw_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_raw_len);
        self.inner
            .decompress_vec(compressed, &mut out, FlushDecompress::Sync)
            .map_err(|e| Error::InvalidRequest(format!("inflate error: {e}")))?;
        Ok(out)
    }
}

impl Default for RankStreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Gzip-wrap the experiment XML for the `EXML` payload (§4.6, §6.3): window
/// bits 31 (gzip wrapper over a 15-bit window), default level.
pub fn gzip_xml(xml_bytes: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml_bytes)?;
    encoder.finish().map_err(Error::Io)
}

pub fn gunzip_xml(compressed: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_body_delta_round_trips() {
        let records = vec![
            TraceRecord { time: 100, context_id: 1 },
            TraceRecord { time: 250, context_id: 2 },
            TraceRecord { time: 250, context_id: 3 },
        ];
        let raw = encode_rank_body(&records, 100);
        let back = decode_rank_body(&raw, 100);
        assert_eq!(back, records);
    }

    #[test]
    fn compressed_stream_round_trips_across_ranks() {
        let rank_a = vec![TraceRecord { time: 10, context_id: 1 }, TraceRecord { time: 20, context_id: 2 }];
        let rank_b = vec![TraceRecord { time: 5, context_id: 9 }];

        let mut compressor = RankStreamCompressor::new();
        let raw_a = encode_rank_body(&rank_a, 10);
        let raw_b = encode_rank_body(&rank_b, 5);
        let compressed_a = compressor.compress_rank(&raw_a).unwrap();
        let compressed_b = compressor.compress_rank(&raw_b).unwrap();

        let mut decompressor = RankStreamDecompressor::new();
        let decoded_a = decompressor.decompress_rank(&compressed_a, raw_a.len()).unwrap();
        let decoded_b = decompressor.decompress_rank(&compressed_b, raw_b.len()).unwrap();

        assert_eq!(decode_rank_body(&decoded_a, 10), rank_a);
        assert_eq!(decode_rank_body(&decoded_b, 5), rank_b);
    }

    #[test]
    fn xml_gzip_round_trips() {
        let xml = b"<experiment><metrics/></experiment>".to_vec();
        let compressed = gzip_xml(&xml).unwrap();
        let back = gunzip_xml(&compressed).unwrap();
        assert_eq!(back, xml);
    }
}
