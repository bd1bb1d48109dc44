//! Node RPC client.
//!
//! The node speaks newline-delimited JSON-RPC over TCP: requests carry an
//! id, responses echo it, and template notifications arrive as id-less
//! method calls. [`NodeRpc`] is the seam the rest of the bridge depends on;
//! [`TcpNodeRpc`] is the concrete client, with one reader task per
//! connection routing responses to their waiting callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::messages::{AddressBalance, BlockDagInfo, NodeInfo, RpcBlock};
use crate::tracing::prelude::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the node RPC layer.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The node rejected the wallet address we asked it to pay. Permanent
    /// for the offending connection, which should be dropped.
    #[error("could not decode address: {0}")]
    InvalidAddress(String),

    /// The node returned an error for the request.
    #[error("node error: {0}")]
    Node(String),

    /// The TCP connection could not be established or has gone away.
    #[error("connection to node lost")]
    ConnectionLost,

    /// No response within the request timeout.
    #[error("node request timed out")]
    Timeout,

    /// The node sent something we could not parse.
    #[error("malformed node response: {0}")]
    Protocol(String),
}

/// Operations the bridge consumes from the node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn get_info(&self) -> Result<NodeInfo, RpcError>;

    /// Fetch a block template paying `pay_address`. `extra_data` identifies
    /// the requesting client software in the template payload.
    async fn get_block_template(
        &self,
        pay_address: &str,
        extra_data: &str,
    ) -> Result<RpcBlock, RpcError>;

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError>;

    async fn estimate_network_hashes_per_second(
        &self,
        start_hash: &str,
        window_size: u32,
    ) -> Result<u64, RpcError>;

    async fn get_balances_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalance>, RpcError>;

    /// Register for new-template push notifications. Each notification is
    /// one unit on the returned channel.
    async fn subscribe_new_block_template(
        &self,
    ) -> Result<mpsc::Receiver<()>, RpcError>;

    /// Tear down and re-establish the TCP connection.
    async fn reconnect(&self) -> Result<(), RpcError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcIncoming {
    id: Option<u64>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    message: String,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;
type Writer = FramedWrite<WriteHalf<TcpStream>, LinesCodec>;

/// JSON-RPC-over-TCP implementation of [`NodeRpc`].
pub struct TcpNodeRpc {
    address: String,
    writer: tokio::sync::Mutex<Writer>,
    pending: Pending,
    next_id: AtomicU64,
    template_notify: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    // Bumped on every reconnect; readers from retired connections compare
    // against it before touching the shared pending map.
    generation: Arc<AtomicU64>,
}

impl TcpNodeRpc {
    /// Connect to the node. Failure here is fatal to bridge startup.
    pub async fn connect(address: &str) -> Result<Self, RpcError> {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let template_notify = Arc::new(Mutex::new(None));
        let generation = Arc::new(AtomicU64::new(0));
        let writer = open_connection(
            address,
            pending.clone(),
            template_notify.clone(),
            generation.clone(),
            0,
        )
        .await?;
        Ok(Self {
            address: address.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            template_notify,
            generation,
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let line = serde_json::to_string(&RpcRequest { id, method, params })
            .map_err(|e| RpcError::Protocol(e.to_string()))?;
        {
            let mut writer = self.writer.lock().await;
            if writer.send(line).await.is_err() {
                self.pending.lock().remove(&id);
                return Err(RpcError::ConnectionLost);
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RpcError::Timeout)
            }
        }
    }

    async fn typed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("{method}: {e}")))
    }
}

/// Open the TCP stream and spawn a reader task routing responses and
/// notifications. Returns the write side.
async fn open_connection(
    address: &str,
    pending: Pending,
    template_notify: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
) -> Result<Writer, RpcError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|_| RpcError::ConnectionLost)?;
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = FramedWrite::new(write_half, LinesCodec::new());
    let mut reader = FramedRead::new(read_half, LinesCodec::new());

    tokio::spawn(async move {
        while let Some(line) = reader.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "node connection read failed");
                    break;
                }
            };
            let incoming: RpcIncoming = match serde_json::from_str(&line) {
                Ok(incoming) => incoming,
                Err(e) => {
                    warn!(error = %e, "unparseable line from node");
                    continue;
                }
            };
            dispatch(incoming, &pending, &template_notify);
        }
        // Connection gone: fail every in-flight request, unless a
        // reconnect has already retired this reader. A stale reader
        // hitting EOF on the dead socket must not touch requests issued
        // on the replacement connection.
        fail_pending_for(&pending, &generation, my_generation);
    });

    Ok(writer)
}

// Drain the pending map with ConnectionLost, but only on behalf of the
// connection that currently owns it.
fn fail_pending_for(
    pending: &Pending,
    generation: &AtomicU64,
    my_generation: u64,
) {
    if generation.load(Ordering::SeqCst) != my_generation {
        return;
    }
    let waiting: Vec<_> = pending.lock().drain().map(|(_, tx)| tx).collect();
    for tx in waiting {
        let _ = tx.send(Err(RpcError::ConnectionLost));
    }
}

fn dispatch(
    incoming: RpcIncoming,
    pending: &Pending,
    template_notify: &Arc<Mutex<Option<mpsc::Sender<()>>>>,
) {
    match (incoming.id, incoming.method.as_deref()) {
        (Some(id), _) => {
            let Some(tx) = pending.lock().remove(&id) else {
                debug!(id, "response for unknown request id");
                return;
            };
            let result = match incoming.error {
                Some(err) => Err(classify_node_error(err.message)),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        (None, Some("newBlockTemplateNotification")) => {
            if let Some(tx) = template_notify.lock().as_ref() {
                // A full channel already has a wakeup queued.
                let _ = tx.try_send(());
            }
        }
        (None, method) => {
            debug!(?method, "ignoring unsolicited message from node");
        }
    }
}

// The node reports a bad pay address as a plain error string; surface it as
// its own variant so callers classify by matching, not substring checks.
fn classify_node_error(message: String) -> RpcError {
    if message.contains("Could not decode address") {
        RpcError::InvalidAddress(message)
    } else {
        RpcError::Node(message)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateResponse {
    block: RpcBlock,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashrateResponse {
    network_hashes_per_second: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalancesResponse {
    entries: Vec<AddressBalance>,
}

#[async_trait]
impl NodeRpc for TcpNodeRpc {
    async fn get_info(&self) -> Result<NodeInfo, RpcError> {
        self.typed_request("getInfo", json!({})).await
    }

    async fn get_block_template(
        &self,
        pay_address: &str,
        extra_data: &str,
    ) -> Result<RpcBlock, RpcError> {
        let response: TemplateResponse = self
            .typed_request(
                "getBlockTemplate",
                json!({ "payAddress": pay_address, "extraData": extra_data }),
            )
            .await?;
        Ok(response.block)
    }

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo, RpcError> {
        self.typed_request("getBlockDagInfo", json!({})).await
    }

    async fn estimate_network_hashes_per_second(
        &self,
        start_hash: &str,
        window_size: u32,
    ) -> Result<u64, RpcError> {
        let response: HashrateResponse = self
            .typed_request(
                "estimateNetworkHashesPerSecond",
                json!({ "startHash": start_hash, "windowSize": window_size }),
            )
            .await?;
        Ok(response.network_hashes_per_second)
    }

    async fn get_balances_by_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalance>, RpcError> {
        let response: BalancesResponse = self
            .typed_request(
                "getBalancesByAddresses",
                json!({ "addresses": addresses }),
            )
            .await?;
        Ok(response.entries)
    }

    async fn subscribe_new_block_template(
        &self,
    ) -> Result<mpsc::Receiver<()>, RpcError> {
        let (tx, rx) = mpsc::channel(16);
        *self.template_notify.lock() = Some(tx);
        self.request("subscribeNewBlockTemplate", json!({})).await?;
        Ok(rx)
    }

    async fn reconnect(&self) -> Result<(), RpcError> {
        // Retire the old reader before anything else so its eventual EOF
        // cannot fail requests issued on the new connection, then fail the
        // old connection's in-flight requests ourselves.
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        fail_pending_for(&self.pending, &self.generation, next);
        let new_writer = open_connection(
            &self.address,
            self.pending.clone(),
            self.template_notify.clone(),
            self.generation.clone(),
            next,
        )
        .await?;
        *self.writer.lock().await = new_writer;
        // The subscription is per-connection state on the node side.
        if self.template_notify.lock().is_some() {
            self.request("subscribeNewBlockTemplate", json!({})).await?;
        }
        info!(address = %self.address, "reconnected to node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retired_reader_leaves_pending_requests_alone() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let generation = AtomicU64::new(1);
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(7, tx);

        // a reader from before the reconnect must not drain the map
        fail_pending_for(&pending, &generation, 0);
        assert!(pending.lock().contains_key(&7));
        assert!(rx.try_recv().is_err());

        // the owning connection's reader still fails them on a real loss
        fail_pending_for(&pending, &generation, 1);
        assert!(pending.lock().is_empty());
        assert!(matches!(rx.try_recv(), Ok(Err(RpcError::ConnectionLost))));
    }

    #[test]
    fn address_rejections_get_their_own_variant() {
        let err = classify_node_error(
            "Could not decode address synthex:qq0abc".to_string(),
        );
        assert!(matches!(err, RpcError::InvalidAddress(_)));
        let err = classify_node_error("block not found".to_string());
        assert!(matches!(err, RpcError::Node(_)));
    }
}
