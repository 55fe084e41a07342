//! SessionServer (§4.7): the per-connection command/response state machine.
//!
//! `hpctrace-server` handles one connection at a time on the main port
//! (§6.1), so a `Session` owns the socket outright for its whole lifetime:
//! read a 4-byte tag, dispatch, reply, repeat, until the client sends `DONE`
//! or closes the connection.

use std::path::Path;

use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use hpctrace_core::compression::gzip_xml;
use hpctrace_core::controller::SpaceTimeController;
use hpctrace_core::database::DatabaseOpener;
use hpctrace_core::error::Error as CoreError;
use hpctrace_core::rank_filter::{Filter, FilterSet, Range};
use hpctrace_core::wire::{
    tag_name, DataRequest, FilterDescriptor, FilterHeader, InfoRequest, OpenHeader, RankPayloadHeader,
    RankRosterEntry, MAX_PATH_LEN, PROTOCOL_VERSION, TAG_DATA, TAG_DBOK, TAG_DONE, TAG_EXML, TAG_FLTR, TAG_HERE,
    TAG_INFO, TAG_NODB, TAG_OPEN,
};
use hpctrace_core::worker_pool::{DataSnapshot, DataWindow, DistributedWorkerPool, InlineWorkerPool, WorkerPool};

use crate::config::Config;

/// Mirrors the `IDLE -> AWAIT_INFO -> READY` ladder of §4.7. `Idle` also
/// covers the "no database open yet" case after a failed OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitInfo,
    Ready,
}

enum Outcome {
    Continue,
    Close,
}

pub struct Session {
    stream: TcpStream,
    peer: std::net::SocketAddr,
    config: Config,
    state: State,
    controller: Option<SpaceTimeController>,
    pool: Option<Box<dyn WorkerPool>>,
}

impl Session {
    pub fn new(stream: TcpStream, peer: std::net::SocketAddr, config: Config) -> Self {
        Self { stream, peer, config, state: State::Idle, controller: None, pool: None }
    }

    /// Drive this session to completion: read commands until `DONE`, a
    /// protocol violation, or the client disconnecting.
    pub async fn serve(mut self) {
        loop {
            match self.step().await {
                Ok(Outcome::Continue) => continue,
                Ok(Outcome::Close) => {
                    debug!(peer = %self.peer, "session closed");
                    return;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "session aborted");
                    return;
                }
            }
        }
    }

    async fn step(&mut self) -> anyhow::Result<Outcome> {
        let tag = match self.read_tag().await? {
            Some(t) => t,
            None => return Ok(Outcome::Close),
        };

        match tag {
            TAG_OPEN => self.handle_open().await?,
            TAG_INFO => self.handle_info().await?,
            TAG_DATA => self.handle_data().await?,
            TAG_FLTR => self.handle_filter().await?,
            TAG_DONE => return Ok(Outcome::Close),
            other => {
                return Err(CoreError::InvalidProtocol(format!("unexpected command {}", tag_name(other))).into());
            }
        }
        Ok(Outcome::Continue)
    }

    // -- framing helpers -----------------------------------------------

    async fn read_tag(&mut self) -> anyhow::Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(u32::from_be_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_struct<T>(&mut self, len: usize) -> anyhow::Result<T>
    where
        T: for<'a> BinRead<Args<'a> = ()>,
    {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(T::read(&mut Cursor::new(buf)).map_err(CoreError::from)?)
    }

    async fn write_struct<T>(&mut self, value: &T) -> anyhow::Result<()>
    where
        T: for<'a> BinWrite<Args<'a> = ()>,
    {
        let mut buf = Vec::new();
        value.write(&mut Cursor::new(&mut buf)).map_err(CoreError::from)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn write_tag(&mut self, tag: u32) -> anyhow::Result<()> {
        self.stream.write_all(&tag.to_be_bytes()).await?;
        Ok(())
    }

    async fn read_path_string(&mut self) -> anyhow::Result<String> {
        let mut len_buf = [0u8; 2];
        self.stream.read_exact(&mut len_buf).await?;
        let len = i16::from_be_bytes(len_buf);
        if len < 0 {
            return Err(CoreError::InvalidProtocol("negative OPEN path length".into()).into());
        }
        let mut bytes = vec![0u8; len as usize];
        self.stream.read_exact(&mut bytes).await?;
        String::from_utf8(bytes).map_err(|e| CoreError::InvalidProtocol(format!("OPEN path is not UTF-8: {e}")).into())
    }

    async fn reply_nodb(&mut self, code: i32) -> anyhow::Result<()> {
        self.write_tag(TAG_NODB).await?;
        self.stream.write_all(&code.to_be_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    // -- command handlers ------------------------------------------------

    /// §4.7 OPEN protocol: version check, path, DatabaseOpener, DBOK roster,
    /// then the EXML payload on the same connection (xml_port == main port).
    async fn handle_open(&mut self) -> anyhow::Result<()> {
        let header: OpenHeader = self.read_struct(OpenHeader::WIRE_LEN).await?;
        if header.protocol_version != PROTOCOL_VERSION {
            warn!(peer = %self.peer, got = header.protocol_version, want = PROTOCOL_VERSION, "protocol version mismatch");
            self.reply_nodb(0).await?;
            return Ok(());
        }

        let path = self.read_path_string().await?;
        if path.len() > MAX_PATH_LEN {
            warn!(peer = %self.peer, len = path.len(), "OPEN path exceeds worker command field width");
            self.reply_nodb(0).await?;
            return Ok(());
        }

        match DatabaseOpener::open(&path, self.config.page_size_rounded(), self.config.memory_budget) {
            Ok(controller) => {
                info!(peer = %self.peer, %path, ranks = controller.rank_count(), "database opened");

                let mut pool: Box<dyn WorkerPool> = if self.config.worker_count > 1 {
                    Box::new(DistributedWorkerPool::new(self.config.worker_count))
                } else {
                    Box::new(InlineWorkerPool::new())
                };
                pool.broadcast_open(Path::new(&path))?;

                self.write_tag(TAG_DBOK).await?;
                let xml_port = self.stream.local_addr()?.port() as i32;
                self.stream.write_all(&xml_port.to_be_bytes()).await?;
                self.stream.write_all(&(controller.rank_count() as i32).to_be_bytes()).await?;
                let compression_flag: i32 = if self.config.compression { 1 } else { 0 };
                self.stream.write_all(&compression_flag.to_be_bytes()).await?;
                for (process_id, thread_id) in controller.pid_tid_roster() {
                    let entry = RankRosterEntry { process_id, thread_id: thread_id as i16 };
                    self.write_struct(&entry).await?;
                }
                self.stream.flush().await?;

                let xml_bytes = std::fs::read(controller.xml_path())?;
                let compressed = gzip_xml(&xml_bytes)?;
                self.write_tag(TAG_EXML).await?;
                self.stream.write_all(&(compressed.len() as i32).to_be_bytes()).await?;
                self.stream.write_all(&compressed).await?;
                self.stream.flush().await?;

                self.controller = Some(controller);
                self.pool = Some(pool);
                self.state = State::AwaitInfo;
            }
            Err(e) => {
                warn!(peer = %self.peer, %path, error = %e, "failed to open database");
                self.reply_nodb(0).await?;
            }
        }
        Ok(())
    }

    /// §4.7 INFO protocol: passes `header_size` to the controller and
    /// broadcasts to workers in distributed mode.
    async fn handle_info(&mut self) -> anyhow::Result<()> {
        let info: InfoRequest = self.read_struct(InfoRequest::WIRE_LEN).await?;
        let controller = self
            .controller
            .as_mut()
            .ok_or_else(|| CoreError::InvalidProtocol("INFO received before a successful OPEN".into()))?;

        controller.set_info(info.header_size)?;
        if let Some(pool) = self.pool.as_mut() {
            pool.broadcast_info(info.header_size)?;
        }
        self.state = State::Ready;
        debug!(
            peer = %self.peer,
            min_begin = info.min_begin,
            max_end = info.max_end,
            header_size = info.header_size,
            "INFO applied"
        );
        Ok(())
    }

    /// §4.7 DATA protocol: validates the rectangle (including `rank_hi`
    /// against the controller's current, possibly filter-shrunk, rank
    /// count — out of range is `InvalidRequest`, never a raw index panic),
    /// dispatches to the worker pool, replies `HERE`, then streams one
    /// payload per rank.
    async fn handle_data(&mut self) -> anyhow::Result<()> {
        let req: DataRequest = self.read_struct(DataRequest::WIRE_LEN).await?;

        if self.state != State::Ready {
            return Err(CoreError::InvalidProtocol("DATA received before INFO completed".into()).into());
        }
        if req.rank_hi < req.rank_lo || req.rank_lo < 0 || req.pixels_v < 0 || req.pixels_h < 0 || req.t_lo > req.t_hi
        {
            return Err(CoreError::InvalidRequest(format!(
                "rank_lo={} rank_hi={} pixels_v={} pixels_h={} t_lo={} t_hi={}",
                req.rank_lo, req.rank_hi, req.pixels_v, req.pixels_h, req.t_lo, req.t_hi
            ))
            .into());
        }

        let controller = self.controller.as_mut().expect("Ready implies a controller");
        if req.rank_hi as usize > controller.rank_count() {
            return Err(CoreError::InvalidRequest(format!(
                "rank_hi={} exceeds the open database's current rank count {} (a filter may have shrunk it)",
                req.rank_hi,
                controller.rank_count()
            ))
            .into());
        }
        controller.begin_request(req.rank_lo, req.rank_hi, req.t_lo, req.t_hi, req.pixels_h, req.pixels_v);

        let window = DataWindow {
            rank_lo: req.rank_lo,
            rank_hi: req.rank_hi,
            t_lo: req.t_lo,
            t_hi: req.t_hi,
            pixels_h: req.pixels_h,
            pixels_v: req.pixels_v,
            compress: self.config.compression,
        };

        let pool = self.pool.as_mut().expect("OPEN always installs a pool");
        let snapshot = DataSnapshot {
            paged_file: controller.paged_file(),
            rank_index: controller.rank_index(),
            rank_filter: controller.rank_filter(),
        };
        pool.dispatch_data(snapshot, window)?;

        let mut replies = Vec::new();
        pool.collect_into(&mut |r| {
            replies.push(r);
            Ok(())
        })?;

        self.write_tag(TAG_HERE).await?;
        self.stream.flush().await?;

        debug!(peer = %self.peer, lines = replies.len(), "streaming DATA response");
        for reply in replies {
            let header = RankPayloadHeader {
                cursor_line: reply.cursor_line,
                entry_count: reply.entry_count,
                begin_time: reply.begin_time,
                end_time: reply.end_time,
                compressed_bytes: reply.body.len() as i32,
                _reserved: 0,
            };
            self.write_struct(&header).await?;
            self.stream.write_all(&reply.body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// §4.7 FLTR protocol: rebuilds the `FilterMap` and broadcasts to
    /// workers. Takes effect only between requests (§5).
    async fn handle_filter(&mut self) -> anyhow::Result<()> {
        let header: FilterHeader = self.read_struct(FilterHeader::WIRE_LEN).await?;
        let mut filters = Vec::with_capacity(header.count.max(0) as usize);
        for _ in 0..header.count.max(0) {
            let d: FilterDescriptor = self.read_struct(FilterDescriptor::WIRE_LEN).await?;
            filters.push(Filter {
                process: Range { min: d.pmin, max: d.pmax, stride: d.pstride },
                thread: Range { min: d.tmin, max: d.tmax, stride: d.tstride },
            });
        }
        let filter_set = FilterSet { filters, polarity: header.polarity != 0 };

        let controller = self
            .controller
            .as_mut()
            .ok_or_else(|| CoreError::InvalidProtocol("FLTR received before a successful OPEN".into()))?;
        controller.apply_filters(filter_set.clone());
        if let Some(pool) = self.pool.as_mut() {
            pool.broadcast_filter(filter_set)?;
        }
        debug!(peer = %self.peer, ranks = controller.rank_count(), "filter applied");
        Ok(())
    }
}
