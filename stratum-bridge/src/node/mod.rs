//! Node-side plumbing: RPC client, message types, and the sync monitor.

pub mod messages;
pub mod rpc;

pub use messages::{
    serialized_header, AddressBalance, BlockDagInfo, NodeInfo, RpcBlock,
    RpcBlockHeader, RpcLevelParents,
};
pub use rpc::{NodeRpc, RpcError, TcpNodeRpc};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;

const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(30);
const HASHRATE_WINDOW_SIZE: u32 = 1000;

/// What the broadcast engine needs from the node: personalized templates
/// and batched balances. Split out from [`NodeRpc`] so broadcast tests can
/// substitute a stub.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn fetch_template(
        &self,
        pay_address: &str,
        remote_app: &str,
    ) -> Result<RpcBlock, RpcError>;

    async fn fetch_balances(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalance>, RpcError>;
}

/// Sync monitor for the upstream node.
///
/// Owns the RPC client and drives the recurring "new work is available"
/// trigger: push notifications when the node delivers them, a fallback
/// timer when it does not. Node connectivity trouble is contained here and
/// retried; it never escalates past construction.
pub struct NodeApi {
    rpc: Arc<dyn NodeRpc>,
    block_wait_time: Duration,
}

impl NodeApi {
    pub fn new(rpc: Arc<dyn NodeRpc>, block_wait_time: Duration) -> Self {
        Self {
            rpc,
            block_wait_time,
        }
    }

    /// Block until the node reports itself synced, polling every 5 seconds.
    ///
    /// Deliberately unbounded: a bridge in front of an unsynced node has
    /// nothing useful to do. An RPC failure while polling is propagated,
    /// which at startup is fatal to the caller.
    pub async fn wait_for_sync(&self, verbose: bool) -> Result<(), RpcError> {
        if verbose {
            info!("checking node sync state");
        }
        loop {
            let node_info = self.rpc.get_info().await?;
            if node_info.is_synced {
                break;
            }
            warn!("node is not synced, waiting for sync before starting bridge");
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
        if verbose {
            info!("node synced, starting bridge");
        }
        Ok(())
    }

    // Single non-blocking sync check used by the refresh loop.
    async fn check_sync(&self) -> Result<bool, RpcError> {
        Ok(self.rpc.get_info().await?.is_synced)
    }

    /// Wait for sync, then start the background loops: the 30s network
    /// stats poll and the template refresh loop driving `on_new_block`.
    pub async fn start<F, Fut>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_new_block: F,
    ) -> Result<(), RpcError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.wait_for_sync(true).await?;
        tokio::spawn(self.clone().stats_task(cancel.clone()));
        tokio::spawn(self.clone().template_task(cancel, on_new_block));
        Ok(())
    }

    async fn stats_task(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("shutdown requested, stopping stats task");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_network_stats().await;
                }
            }
        }
    }

    // Stats are observability-only: any failure is logged and the next
    // tick tries again.
    async fn poll_network_stats(&self) {
        let dag_info = match self.rpc.get_block_dag_info().await {
            Ok(dag_info) => dag_info,
            Err(e) => {
                warn!(error = %e, "failed to get DAG info from node");
                return;
            }
        };
        let Some(tip) = dag_info.tip_hashes.first() else {
            warn!("node reported no tip hashes");
            return;
        };
        match self
            .rpc
            .estimate_network_hashes_per_second(tip, HASHRATE_WINDOW_SIZE)
            .await
        {
            Ok(hashes_per_second) => {
                info!(
                    hashes_per_second,
                    block_count = dag_info.block_count,
                    difficulty = dag_info.difficulty,
                    "network stats"
                );
            }
            Err(e) => {
                warn!(error = %e, "failed to get network hashrate from node");
            }
        }
    }

    /// The template refresh loop.
    ///
    /// Fires `on_new_block` on every push notification and, as a fallback,
    /// whenever `block_wait_time` elapses without one. A notification
    /// resets the fallback timer; a timer fire does not, so the callback
    /// runs at least once per interval even with notifications dropped.
    async fn template_task<F, Fut>(
        self: Arc<Self>,
        cancel: CancellationToken,
        on_new_block: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // If registration fails, the fallback timer alone drives refreshes.
        // Hold the sender so the channel stays open either way.
        let (_idle_tx, mut notifications) = match self
            .rpc
            .subscribe_new_block_template()
            .await
        {
            Ok(rx) => (None, rx),
            Err(e) => {
                error!(error = %e, "failed to register for template notifications");
                let (tx, rx) = mpsc::channel(1);
                (Some(tx), rx)
            }
        };

        let mut ticker = tokio::time::interval(self.block_wait_time);
        // interval's first tick is immediate; push it out a full period.
        ticker.reset();

        loop {
            match self.check_sync().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("node is not synced, pausing job broadcasts");
                    tokio::time::sleep(SYNC_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "error checking node sync state, attempting reconnect");
                    if let Err(e) = self.rpc.reconnect().await {
                        error!(error = %e, "error reconnecting to node, waiting before retry");
                        tokio::time::sleep(RECONNECT_RETRY_DELAY).await;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("shutdown requested, stopping template listener");
                    return;
                }
                Some(()) = notifications.recv() => {
                    on_new_block().await;
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    on_new_block().await;
                }
            }
        }
    }
}

#[async_trait]
impl TemplateSource for NodeApi {
    async fn fetch_template(
        &self,
        pay_address: &str,
        remote_app: &str,
    ) -> Result<RpcBlock, RpcError> {
        let extra_data = format!(
            "'{}' via stratum-bridge_{}",
            remote_app,
            env!("CARGO_PKG_VERSION")
        );
        self.rpc.get_block_template(pay_address, &extra_data).await
    }

    async fn fetch_balances(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalance>, RpcError> {
        self.rpc.get_balances_by_addresses(addresses).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::Instant;

    struct FakeNode {
        synced: AtomicBool,
        notify_tx: Mutex<Option<mpsc::Sender<()>>>,
        reconnects: AtomicUsize,
        info_fails: AtomicBool,
    }

    impl FakeNode {
        fn new() -> Self {
            Self {
                synced: AtomicBool::new(true),
                notify_tx: Mutex::new(None),
                reconnects: AtomicUsize::new(0),
                info_fails: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl NodeRpc for FakeNode {
        async fn get_info(&self) -> Result<NodeInfo, RpcError> {
            if self.info_fails.load(Ordering::SeqCst) {
                return Err(RpcError::ConnectionLost);
            }
            Ok(NodeInfo {
                server_version: "0.0.1".into(),
                is_synced: self.synced.load(Ordering::SeqCst),
            })
        }

        async fn get_block_template(
            &self,
            _pay_address: &str,
            _extra_data: &str,
        ) -> Result<RpcBlock, RpcError> {
            Ok(crate::node::messages::test_block(0x1d00ffff, 0))
        }

        async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError> {
            Err(RpcError::ConnectionLost)
        }

        async fn estimate_network_hashes_per_second(
            &self,
            _start_hash: &str,
            _window_size: u32,
        ) -> Result<u64, RpcError> {
            Err(RpcError::ConnectionLost)
        }

        async fn get_balances_by_addresses(
            &self,
            _addresses: &[String],
        ) -> Result<Vec<AddressBalance>, RpcError> {
            Ok(vec![])
        }

        async fn subscribe_new_block_template(
            &self,
        ) -> Result<mpsc::Receiver<()>, RpcError> {
            let (tx, rx) = mpsc::channel(16);
            *self.notify_tx.lock() = Some(tx);
            Ok(rx)
        }

        async fn reconnect(&self) -> Result<(), RpcError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.info_fails.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn spawn_refresh_loop(
        node: Arc<FakeNode>,
        block_wait: Duration,
    ) -> (Arc<Mutex<Vec<Instant>>>, CancellationToken) {
        let api = Arc::new(NodeApi::new(node, block_wait));
        let fired: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let fired_in_cb = fired.clone();
        tokio::spawn(api.template_task(cancel.clone(), move || {
            let fired = fired_in_cb.clone();
            async move {
                fired.lock().push(Instant::now());
            }
        }));
        (fired, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_timer_fires_once_per_interval() {
        let node = Arc::new(FakeNode::new());
        let (fired, cancel) =
            spawn_refresh_loop(node.clone(), Duration::from_secs(1));

        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();

        let fired = fired.lock();
        assert_eq!(fired.len(), 2, "two fires in 2.5 intervals");
        assert_eq!(fired[0] - start, Duration::from_secs(1));
        assert_eq!(fired[1] - fired[0], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn notification_fires_callback_and_resets_timer() {
        let node = Arc::new(FakeNode::new());
        let (fired, cancel) =
            spawn_refresh_loop(node.clone(), Duration::from_secs(10));

        // Let the loop subscribe, then push a notification at t=1s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let start = Instant::now();
        let tx = node.notify_tx.lock().clone().unwrap();
        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.lock().len(), 1, "notification fired the callback");

        // The fallback timer restarts from the notification, so the next
        // fire lands a full interval later.
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        let fired = fired.lock();
        assert_eq!(fired.len(), 2);
        let gap = fired[1] - start;
        assert!(
            gap >= Duration::from_secs(10),
            "timer was not reset: second fire after {gap:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sync_check_failure_triggers_reconnect() {
        let node = Arc::new(FakeNode::new());
        node.info_fails.store(true, Ordering::SeqCst);
        let (_fired, cancel) =
            spawn_refresh_loop(node.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        assert!(node.reconnects.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sync_polls_until_synced() {
        let node = Arc::new(FakeNode::new());
        node.synced.store(false, Ordering::SeqCst);
        let api = Arc::new(NodeApi::new(
            node.clone() as Arc<dyn NodeRpc>,
            Duration::from_secs(1),
        ));

        let api_task = api.clone();
        let waiter =
            tokio::spawn(async move { api_task.wait_for_sync(false).await });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!waiter.is_finished(), "still polling while unsynced");

        node.synced.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(waiter.is_finished());
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_the_refresh_loop() {
        let node = Arc::new(FakeNode::new());
        let api = Arc::new(NodeApi::new(
            node.clone() as Arc<dyn NodeRpc>,
            Duration::from_secs(1),
        ));
        let fired = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let fired_in_cb = fired.clone();
        api.start(cancel.clone(), move || {
            let fired = fired_in_cb.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
