//! hpctrace-core: the sampling and wire-framing engine behind a remote
//! trace-query server.
//!
//! A client opens a directory of per-rank execution-trace shards plus an
//! XML experiment description, then repeatedly asks for rectangular
//! space-time views (a rank range × a time range, rendered onto a pixel
//! grid). This crate is the machinery that answers those requests: paged
//! random access over the merged trace file, the per-rank interpolated
//! binary search and column sampler, the inline/distributed worker pools
//! that split the work, and the wire framing and compression used to
//! stream results back.

pub mod compression;
pub mod controller;
pub mod database;
pub mod error;
pub mod paged_file;
pub mod rank_filter;
pub mod rank_index;
pub mod record;
pub mod trace_cursor;
pub mod wire;
pub mod worker_pool;

pub use controller::{cursor_line_to_rank, ImageAttributes, SpaceTimeController};
pub use database::DatabaseOpener;
pub use error::{Error, Result};
pub use rank_filter::{Filter, FilterSet, Range};
pub use record::TraceRecord;
pub use worker_pool::{DataSnapshot, DataWindow, DistributedWorkerPool, InlineWorkerPool, RankReply, WorkerPool};
