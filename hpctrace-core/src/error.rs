//! Error types for hpctrace-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid database: {0}")]
    InvalidDatabase(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("path too long: {0} bytes (max {max})", max = crate::wire::MAX_PATH_LEN)]
    PathTooLong(usize),

    #[error("failed to map page {page}: {source}")]
    MapFailed { page: u64, source: std::io::Error },

    #[error("read of {len} bytes at offset {offset} exceeds file size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        Error::InvalidProtocol(e.to_string())
    }
}
