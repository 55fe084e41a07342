//! Wire tags and framed message bodies for the main data-port protocol (§6.1).
//!
//! Every multi-byte field on the wire is big-endian; `binrw` is asked to
//! enforce that with `#[brw(big)]` rather than hand-rolled byte shuffling.

use binrw::{BinRead, BinWrite};

/// The protocol version this build speaks. A mismatch is `InvalidProtocol`
/// (§9 Design Notes: the redesign drops the original's partial "compatibility
/// mode" in favor of an exact match).
pub const PROTOCOL_VERSION: i32 = 1;

/// Arbitrary default port, carried over from the system this protocol is
/// modeled on.
pub const DEFAULT_PORT: u16 = 21590;

/// Longest `OPEN` path the framing will accept before the session is
/// rejected with `Error::PathTooLong`.
pub const MAX_PATH_LEN: usize = 1023;

macro_rules! tag {
    ($name:ident, $bytes:expr) => {
        pub const $name: u32 = u32::from_be_bytes(*$bytes);
    };
}

// Client -> server
tag!(TAG_OPEN, b"OPEN");
tag!(TAG_INFO, b"INFO");
tag!(TAG_DATA, b"DATA");
tag!(TAG_FLTR, b"FLTR");
tag!(TAG_DONE, b"DONE");

// Server -> client
tag!(TAG_DBOK, b"DBOK");
tag!(TAG_NODB, b"NODB");
tag!(TAG_HERE, b"HERE");
tag!(TAG_EXML, b"EXML");

pub fn tag_name(tag: u32) -> String {
    match std::str::from_utf8(&tag.to_be_bytes()) {
        Ok(s) if s.bytes().all(|b| b.is_ascii_graphic()) => s.to_string(),
        _ => format!("0x{tag:08X}"),
    }
}

/// Body of an `OPEN` command, minus the length-prefixed path that follows it
/// (read separately since its length is data-dependent).
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct OpenHeader {
    pub protocol_version: i32,
}

impl OpenHeader {
    pub const WIRE_LEN: usize = 4;
}

/// Body of an `INFO` command.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct InfoRequest {
    pub min_begin: i64,
    pub max_end: i64,
    pub header_size: i32,
}

impl InfoRequest {
    pub const WIRE_LEN: usize = 8 + 8 + 4;
}

/// Body of a `DATA` command.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct DataRequest {
    pub rank_lo: i32,
    pub rank_hi: i32,
    pub t_lo: i64,
    pub t_hi: i64,
    pub pixels_v: i32,
    pub pixels_h: i32,
}

impl DataRequest {
    pub const WIRE_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4;
}

/// Fixed portion of a `FLTR` command, preceding `count` `FilterDescriptor`s.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct FilterHeader {
    pub pad: u8,
    pub polarity: u8,
    pub count: i16,
}

impl FilterHeader {
    pub const WIRE_LEN: usize = 1 + 1 + 2;
}

/// One `(process, thread)` range pair as sent on the wire.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct FilterDescriptor {
    pub pmin: i32,
    pub pmax: i32,
    pub pstride: i32,
    pub tmin: i32,
    pub tmax: i32,
    pub tstride: i32,
}

impl FilterDescriptor {
    pub const WIRE_LEN: usize = 4 * 6;
}

/// One entry of the `DBOK` roster: `(process_id:i32, thread_id:i16)` in
/// logical-rank order.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct RankRosterEntry {
    pub process_id: i32,
    pub thread_id: i16,
}

impl RankRosterEntry {
    pub const WIRE_LEN: usize = 4 + 2;
}

/// Fixed 32-byte per-rank payload header (§4.6). The named fields sum to 28
/// bytes against a declared fixed size of 32; `_reserved` makes up the
/// remaining 4 bytes (written zero, ignored on read) rather than changing the
/// declared size.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct RankPayloadHeader {
    pub cursor_line: i32,
    pub entry_count: i32,
    pub begin_time: u64,
    pub end_time: u64,
    pub compressed_bytes: i32,
    pub _reserved: i32,
}

impl RankPayloadHeader {
    pub const WIRE_LEN: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn tags_match_ascii() {
        assert_eq!(tag_name(TAG_DATA), "DATA");
        assert_eq!(tag_name(TAG_OPEN), "OPEN");
        assert_eq!(tag_name(TAG_DBOK), "DBOK");
    }

    #[test]
    fn payload_header_round_trips_at_32_bytes() {
        let header = RankPayloadHeader {
            cursor_line: 3,
            entry_count: 42,
            begin_time: 100,
            end_time: 900,
            compressed_bytes: 128,
            _reserved: 0,
        };
        let mut buf = Vec::new();
        header.write(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(buf.len(), RankPayloadHeader::WIRE_LEN);

        let decoded = RankPayloadHeader::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.cursor_line, 3);
        assert_eq!(decoded.entry_count, 42);
        assert_eq!(decoded.compressed_bytes, 128);
    }
}
