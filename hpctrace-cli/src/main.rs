//! hpctrace-probe: a thin diagnostic client for `hpctrace-serverd`.
//!
//! This is not the interactive trace viewer named in §1 — that GUI is an
//! external collaborator out of scope for this repo. `hpctrace-probe` is a
//! small client for exercising the daemon's wire protocol by hand.

use std::io::{Read, Write};
use std::net::TcpStream;

use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use clap::{Parser, Subcommand};

use hpctrace_core::compression::{decode_rank_body, RankStreamDecompressor};
use hpctrace_core::wire::{
    tag_name, DataRequest, InfoRequest, OpenHeader, RankPayloadHeader, RankRosterEntry, DEFAULT_PORT,
    MAX_PATH_LEN, PROTOCOL_VERSION, TAG_DATA, TAG_DBOK, TAG_DONE, TAG_EXML, TAG_HERE, TAG_INFO, TAG_NODB, TAG_OPEN,
};

#[derive(Parser)]
#[command(name = "hpctrace-probe")]
#[command(about = "Exercise an hpctrace-serverd connection by hand")]
#[command(version)]
struct Cli {
    /// host:port of the running hpctrace-serverd
    #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// OPEN a database and print its rank roster, then disconnect.
    Open {
        /// Directory containing experiment.xml and the trace shards
        path: String,
    },
    /// OPEN + INFO + DATA, printing one summary line per returned rank.
    Query {
        path: String,
        #[arg(long, default_value_t = 0)]
        rank_lo: i32,
        #[arg(long)]
        rank_hi: i32,
        #[arg(long, default_value_t = 0)]
        t_lo: i64,
        #[arg(long)]
        t_hi: i64,
        #[arg(long, default_value_t = 1024)]
        pixels_h: i32,
        #[arg(long, default_value_t = 64)]
        pixels_v: i32,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

struct Probe {
    stream: TcpStream,
}

impl Probe {
    fn connect(addr: &str) -> anyhow::Result<Self> {
        Ok(Self { stream: TcpStream::connect(addr)? })
    }

    fn write_tag(&mut self, tag: u32) -> anyhow::Result<()> {
        self.stream.write_all(&tag.to_be_bytes())?;
        Ok(())
    }

    fn read_tag(&mut self) -> anyhow::Result<u32> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn write_struct<T: for<'a> BinWrite<Args<'a> = ()>>(&mut self, value: &T) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        value.write(&mut Cursor::new(&mut buf))?;
        self.stream.write_all(&buf)?;
        Ok(())
    }

    fn read_struct<T: for<'a> BinRead<Args<'a> = ()>>(&mut self, len: usize) -> anyhow::Result<T> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(T::read(&mut Cursor::new(buf))?)
    }

    fn write_path(&mut self, path: &str) -> anyhow::Result<()> {
        if path.len() > MAX_PATH_LEN {
            anyhow::bail!("path {path:?} is longer than {MAX_PATH_LEN} bytes");
        }
        self.stream.write_all(&(path.len() as i16).to_be_bytes())?;
        self.stream.write_all(path.as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(self.stream.flush()?)
    }

    /// Send `OPEN`, returning the rank roster on `DBOK` or `None` on `NODB`.
    fn open(&mut self, path: &str) -> anyhow::Result<Option<Vec<(i32, i16)>>> {
        self.write_tag(TAG_OPEN)?;
        self.write_struct(&OpenHeader { protocol_version: PROTOCOL_VERSION })?;
        self.write_path(path)?;
        self.flush()?;

        match self.read_tag()? {
            TAG_DBOK => {
                let mut hdr = [0u8; 4 + 4 + 4];
                self.stream.read_exact(&mut hdr)?;
                let xml_port = i32::from_be_bytes(hdr[0..4].try_into().unwrap());
                let rank_count = i32::from_be_bytes(hdr[4..8].try_into().unwrap());
                let compression_flag = i32::from_be_bytes(hdr[8..12].try_into().unwrap());
                println!(
                    "DBOK: xml_port={xml_port} rank_count={rank_count} compression={}",
                    compression_flag != 0
                );

                let mut roster = Vec::with_capacity(rank_count.max(0) as usize);
                for _ in 0..rank_count.max(0) {
                    let entry: RankRosterEntry = self.read_struct(RankRosterEntry::WIRE_LEN)?;
                    roster.push((entry.process_id, entry.thread_id));
                }

                let exml_tag = self.read_tag()?;
                if exml_tag != TAG_EXML {
                    anyhow::bail!("expected EXML after DBOK roster, got {}", tag_name(exml_tag));
                }
                let mut len_buf = [0u8; 4];
                self.stream.read_exact(&mut len_buf)?;
                let compressed_len = i32::from_be_bytes(len_buf) as usize;
                let mut xml_bytes = vec![0u8; compressed_len];
                self.stream.read_exact(&mut xml_bytes)?;
                println!("EXML: {compressed_len} compressed bytes");

                Ok(Some(roster))
            }
            TAG_NODB => {
                let mut code_buf = [0u8; 4];
                self.stream.read_exact(&mut code_buf)?;
                let code = i32::from_be_bytes(code_buf);
                println!("NODB: error_code={code}");
                Ok(None)
            }
            other => anyhow::bail!("unexpected response to OPEN: {}", tag_name(other)),
        }
    }

    fn info(&mut self, header_size: i32) -> anyhow::Result<()> {
        self.write_tag(TAG_INFO)?;
        self.write_struct(&InfoRequest { min_begin: 0, max_end: 0, header_size })?;
        self.flush()?;
        Ok(())
    }

    fn data(&mut self, req: DataRequest) -> anyhow::Result<()> {
        self.write_tag(TAG_DATA)?;
        self.write_struct(&req)?;
        self.flush()?;

        let tag = self.read_tag()?;
        if tag != TAG_HERE {
            anyhow::bail!("expected HERE after DATA, got {}", tag_name(tag));
        }

        let line_count = std::cmp::min(req.pixels_v, req.rank_hi - req.rank_lo).max(0);
        let mut decompressor = RankStreamDecompressor::new();
        for _ in 0..line_count {
            let header: RankPayloadHeader = self.read_struct(RankPayloadHeader::WIRE_LEN)?;
            let mut body = vec![0u8; header.compressed_bytes as usize];
            self.stream.read_exact(&mut body)?;

            let raw_len = header.entry_count as usize * 8;
            let raw = if body.len() == raw_len {
                body
            } else {
                decompressor.decompress_rank(&body, raw_len)?
            };
            let records = decode_rank_body(&raw, header.begin_time);

            println!(
                "cursor_line={:<4} entries={:<5} begin={:<12} end={:<12} first_ctx={}",
                header.cursor_line,
                header.entry_count,
                header.begin_time,
                header.end_time,
                records.first().map(|r| r.context_id as i64).unwrap_or(-1)
            );
        }
        Ok(())
    }

    fn done(&mut self) -> anyhow::Result<()> {
        self.write_tag(TAG_DONE)?;
        self.flush()
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut probe = Probe::connect(&cli.addr)?;

    match cli.command {
        Commands::Open { path } => {
            if let Some(roster) = probe.open(&path)? {
                for (i, (pid, tid)) in roster.iter().enumerate() {
                    println!("  rank {i}: pid={pid} tid={tid}");
                }
            }
            probe.done()?;
        }
        Commands::Query { path, rank_lo, rank_hi, t_lo, t_hi, pixels_h, pixels_v } => {
            if probe.open(&path)?.is_none() {
                return Ok(());
            }
            // The opener's default header size is the fixed constant 24
            // (`SpaceTimeController::DEFAULT_HEADER_SIZE`, §9 Open Question),
            // not a function of rank count; sending it back avoids the
            // PagedFile rebuild path for the common case.
            let header_size = 24;
            probe.info(header_size)?;
            probe.data(DataRequest { rank_lo, rank_hi, t_lo, t_hi, pixels_v, pixels_h })?;
            probe.done()?;
        }
    }
    Ok(())
}
