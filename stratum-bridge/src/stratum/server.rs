//! TCP listener and per-connection session loops.
//!
//! Each accepted socket gets two tasks: a writer draining the connection's
//! outbox channel into the framed sink, and the session loop reading and
//! dispatching client requests. Share validation is out of scope here;
//! submits are acknowledged and counted against the vardiff stats window.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::connection::StratumConn;
use super::messages::{JsonRpcRequest, JsonRpcResponse};
use super::registry::ClientRegistry;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::vardiff::ShareHandler;

const OUTBOX_CAPACITY: usize = 256;

pub struct StratumServer {
    listen_address: String,
    registry: Arc<ClientRegistry>,
    shares: Arc<ShareHandler>,
}

impl StratumServer {
    pub fn new(
        listen_address: String,
        registry: Arc<ClientRegistry>,
        shares: Arc<ShareHandler>,
    ) -> Self {
        Self {
            listen_address,
            registry,
            shares,
        }
    }

    /// Accept loop. Runs until cancelled; a bind failure is fatal.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_address).await?;
        info!(address = %self.listen_address, "listening for stratum connections");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = self.registry.clone();
                            let shares = self.shares.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                run_session(
                                    registry,
                                    shares,
                                    stream,
                                    peer.to_string(),
                                    cancel,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed accepting connection");
                        }
                    }
                }
            }
        }
    }
}

async fn run_session(
    registry: Arc<ClientRegistry>,
    shares: Arc<ShareHandler>,
    stream: TcpStream,
    peer: String,
    cancel: CancellationToken,
) {
    // Share traffic is tiny line-oriented messages where latency matters.
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    let conn = registry.register(peer, outbox_tx);

    let writer_conn = conn.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbox_rx.recv().await {
            if writer.send(line).await.is_err() {
                writer_conn.disconnect();
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = conn.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(line)) => {
                    if let Err(e) = handle_request(&conn, &shares, &line).await {
                        warn!(client = conn.id(), error = %e, "error handling client message");
                    }
                }
                Some(Err(e)) => {
                    warn!(client = conn.id(), error = %e, "read error");
                    break;
                }
                None => break,
            },
        }
    }

    registry.unregister(&conn);
    writer_task.abort();
}

async fn handle_request(
    conn: &Arc<StratumConn>,
    shares: &ShareHandler,
    line: &str,
) -> Result<()> {
    let request: JsonRpcRequest = serde_json::from_str(line)
        .map_err(|e| Error::Serialization(e.to_string()))?;

    match request.method.as_str() {
        "mining.subscribe" => {
            if let Some(app) = request.params.get(0).and_then(Value::as_str) {
                conn.set_remote_app(app.to_string());
            }
            debug!(
                client = conn.id(),
                remote_app = conn.remote_app(),
                "client subscribed"
            );
            let extranonce = conn
                .extranonce()
                .map(Value::String)
                .unwrap_or(Value::Null);
            respond(conn, request.id, json!([true, extranonce])).await
        }
        "mining.authorize" => {
            // Convention is "walletaddress.workername"; only the address
            // part goes to the node.
            if let Some(user) = request.params.get(0).and_then(Value::as_str) {
                let address = user.split('.').next().unwrap_or(user);
                conn.set_wallet_addr(address.to_string());
                info!(
                    client = conn.id(),
                    address, worker = user, "client authorized"
                );
            }
            respond(conn, request.id, json!(true)).await
        }
        "mining.submit" => {
            // params: [worker, jobId, nonce]. The job must still be live in
            // the ring; hash checking is downstream's problem.
            let job = request
                .params
                .get(1)
                .and_then(Value::as_str)
                .and_then(|id| id.parse::<u64>().ok())
                .and_then(|id| conn.state().get_job(id));
            match job {
                Some(_) => {
                    shares.record_share(conn);
                    debug!(client = conn.id(), "share submitted");
                    respond(conn, request.id, json!(true)).await
                }
                None => {
                    warn!(client = conn.id(), "share submitted for unknown job");
                    respond(conn, request.id, json!(false)).await
                }
            }
        }
        other => {
            warn!(client = conn.id(), method = other, "unknown method");
            respond(conn, request.id, json!(true)).await
        }
    }
}

async fn respond(
    conn: &StratumConn,
    id: Option<Value>,
    result: Value,
) -> Result<()> {
    let response = JsonRpcResponse::ok(id, result);
    let line = serde_json::to_string(&response)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    conn.send_raw(line).await
}
