//! hpctrace-server: the daemon that answers space-time view requests over
//! TCP for a directory of per-rank execution-trace shards (§1, §2).

mod config;
mod server;
mod session;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::Config;
use hpctrace_core::wire::DEFAULT_PORT;

#[derive(Parser)]
#[command(name = "hpctrace-serverd")]
#[command(about = "Remote query engine for parallel-application execution traces")]
struct Cli {
    /// Bind address (host:port) for the main data port
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
    bind: String,

    /// Page size in bytes before rounding (§4.1 default: 6 MiB)
    #[arg(long)]
    page_size: Option<u64>,

    /// Page cache memory budget in bytes (§4.1 default: half of physical
    /// RAM, floored at 512 MiB)
    #[arg(long)]
    max_memory: Option<u64>,

    /// Number of simulated worker peers; 1 runs the inline pool, >1 the
    /// distributed coordinator/worker simulation (§4.5)
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Disable per-rank DEFLATE compression (§4.6)
    #[arg(long)]
    no_compression: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).compact().finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config {
        bind_addr: cli.bind,
        page_size: cli.page_size.unwrap_or_else(config::default_page_size),
        memory_budget: cli.max_memory.unwrap_or_else(config::detect_memory_budget),
        worker_count: cli.workers.max(1),
        compression: !cli.no_compression,
    };

    info!(
        bind = %config.bind_addr,
        page_size = config.page_size_rounded(),
        memory_budget = config.memory_budget,
        workers = config.worker_count,
        compression = config.compression,
        "hpctrace-server starting"
    );

    server::run(config).await
}
