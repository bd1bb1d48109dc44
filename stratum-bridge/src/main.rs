use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use stratum_bridge::config::Config;
use stratum_bridge::node::{NodeApi, TcpNodeRpc, TemplateSource};
use stratum_bridge::stratum::{ClientRegistry, StratumServer};
use stratum_bridge::tracing::{self, prelude::*};
use stratum_bridge::vardiff::ShareHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path.as_ref())
            .with_context(|| format!("loading config from {path}"))?,
        None => Config::default(),
    };

    // An unreachable node at startup is fatal; everything after this point
    // retries instead.
    let rpc = TcpNodeRpc::connect(&config.node_address)
        .await
        .with_context(|| format!("connecting to node at {}", config.node_address))?;
    let node = Arc::new(NodeApi::new(Arc::new(rpc), config.block_wait_time()));

    let shares = Arc::new(ShareHandler::new());
    let registry = Arc::new(ClientRegistry::new(
        shares.clone(),
        config.min_share_diff,
        config.extranonce_size,
        config.solo_mining,
    ));
    let server = StratumServer::new(
        config.listen_address.clone(),
        registry.clone(),
        shares,
    );

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let server_cancel = running.clone();
    tracker.spawn(async move {
        if let Err(e) = server.run(server_cancel).await {
            error!(error = %e, "stratum server failed");
        }
    });
    tracker.close();

    let source: Arc<dyn TemplateSource> = node.clone();
    node.start(running.clone(), move || {
        let registry = registry.clone();
        let source = source.clone();
        async move {
            registry.new_block_available(source).await;
        }
    })
    .await
    .context("waiting for node sync")?;
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
