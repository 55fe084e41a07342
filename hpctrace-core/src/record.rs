//! The on-disk trace record (§3): `(time: u64, context_id: u32)`, big-endian,
//! 12 bytes.

pub const RECORD_SIZE: u64 = 12;

/// One decoded `(time, context_id)` pair. `context_id` identifies a node in
/// the experiment's static calling-context tree; this crate treats it as
/// opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub time: u64,
    pub context_id: u32,
}

impl TraceRecord {
    pub fn decode(bytes: &[u8; 12]) -> Self {
        let time = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let context_id = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        Self { time, context_id }
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&self.time.to_be_bytes());
        out[8..12].copy_from_slice(&self.context_id.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let r = TraceRecord { time: 123456789, context_id: 42 };
        let bytes = r.encode();
        assert_eq!(TraceRecord::decode(&bytes), r);
    }
}
