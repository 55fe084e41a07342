//! Accept loop. Per §6.1 ("Only one connection is handled at a time on the
//! main port") this deliberately does not spawn a task per connection; it
//! serves one `Session` to completion, then accepts the next.

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::session::Session;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "hpctrace-server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        info!(%peer, "client connected");
        stream.set_nodelay(true).ok();
        Session::new(stream, peer, config.clone()).serve().await;
    }
}
