//! Client registry and broadcast engine.
//!
//! Owns the set of live connections and turns the sync monitor's "new work
//! available" trigger into personalized job packets, one independent task
//! per connection. A failure fetching or sending for one connection never
//! blocks or aborts delivery to the others.

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::connection::StratumConn;
use super::jobs;
use super::messages::JsonRpcEvent;
use crate::error::{record_worker_error, Error, WorkerErrorKind};
use crate::node::{serialized_header, RpcError, TemplateSource};
use crate::tracing::prelude::*;
use crate::types::{target_from_bits, target_to_difficulty};
use crate::vardiff::VardiffTracker;

const BALANCE_DELAY: Duration = Duration::from_secs(60);
const STATS_CREATION_DELAY: Duration = Duration::from_secs(5);

pub struct ClientRegistry {
    clients: RwLock<HashMap<u32, Arc<StratumConn>>>,
    client_counter: AtomicU32,
    next_extranonce: AtomicU32,
    max_extranonce: u32,
    extranonce_size: u8,
    min_share_diff: f64,
    solo_mining: bool,
    last_balance_check: Mutex<Option<Instant>>,
    vardiff: Arc<dyn VardiffTracker>,
}

impl ClientRegistry {
    pub fn new(
        vardiff: Arc<dyn VardiffTracker>,
        min_share_diff: f64,
        extranonce_size: u8,
        solo_mining: bool,
    ) -> Self {
        let max_extranonce = if extranonce_size > 0 {
            (1u32 << (8 * extranonce_size.min(3) as u32)) - 1
        } else {
            0
        };
        Self {
            clients: RwLock::new(HashMap::new()),
            client_counter: AtomicU32::new(0),
            next_extranonce: AtomicU32::new(0),
            max_extranonce,
            extranonce_size,
            min_share_diff,
            solo_mining,
            last_balance_check: Mutex::new(None),
            vardiff,
        }
    }

    /// Register a freshly accepted connection.
    ///
    /// Assigns the next identity (never reused) and, when extra-nonces are
    /// enabled, the next prefix from the bounded counter. Stats tracking
    /// with the vardiff tracker is created after a short delay, giving the
    /// client time to authorize first.
    pub fn register(
        self: &Arc<Self>,
        remote: String,
        outbox: mpsc::Sender<String>,
    ) -> Arc<StratumConn> {
        let id = self.client_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let extranonce = self.next_extranonce();
        let conn = Arc::new(StratumConn::new(id, remote, extranonce, outbox));

        self.clients.write().insert(id, conn.clone());
        info!(client = id, remote = conn.remote(), "client connected");

        let registry = self.clone();
        let for_stats = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STATS_CREATION_DELAY).await;
            if for_stats.is_connected() {
                registry.vardiff.get_create_stats(&for_stats);
            }
        });

        conn
    }

    // Allocate the next extra-nonce prefix, already hex-encoded to the
    // configured fixed width. Wrapping trades a warning for the risk that
    // an old and a new connection share search space.
    fn next_extranonce(&self) -> Option<String> {
        if self.extranonce_size == 0 {
            return None;
        }
        let max = self.max_extranonce;
        let value = self
            .next_extranonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v < max { v + 1 } else { 0 })
            })
            .unwrap_or(0);
        if value == max {
            warn!("wrapped extranonce! new clients may be duplicating work...");
        }
        Some(format!(
            "{:0width$x}",
            value,
            width = self.extranonce_size as usize * 2
        ))
    }

    /// Remove a connection that is going away.
    ///
    /// Drops the tracker's stats entry too: ids are never reused, so an
    /// entry surviving its connection would be leaked for the life of the
    /// process.
    pub fn unregister(&self, conn: &StratumConn) {
        conn.disconnect();
        self.clients.write().remove(&conn.id());
        self.vardiff.drop_stats(conn);
        info!(
            client = conn.id(),
            remote = conn.remote(),
            uptime_secs = conn.state().connect_time().elapsed().as_secs(),
            "client disconnected"
        );
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Fan a fresh round of jobs out to every live connection.
    ///
    /// Invoked by the sync monitor on every push notification or fallback
    /// timer fire. Connections are snapshotted under one read critical
    /// section; everything after runs per-connection with no ordering
    /// or synchronization between them.
    pub async fn new_block_available(&self, source: Arc<dyn TemplateSource>) {
        let (connections, addresses) = {
            let clients = self.clients.read();
            let mut connections = Vec::with_capacity(clients.len());
            let mut addresses = Vec::new();
            for conn in clients.values() {
                if !conn.is_connected() {
                    continue;
                }
                connections.push(conn.clone());
                let addr = conn.wallet_addr();
                if !addr.is_empty() {
                    addresses.push(addr);
                }
            }
            (connections, addresses)
        };

        for conn in connections {
            let source = source.clone();
            let vardiff = self.vardiff.clone();
            let min_share_diff = self.min_share_diff;
            let solo_mining = self.solo_mining;
            tokio::spawn(async move {
                deliver_job(conn, source, vardiff, min_share_diff, solo_mining)
                    .await;
            });
        }

        let sweep_due = {
            let mut last = self.last_balance_check.lock();
            let due = last.map(|t| t.elapsed() > BALANCE_DELAY).unwrap_or(true);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if sweep_due && !addresses.is_empty() {
            tokio::spawn(async move {
                match source.fetch_balances(&addresses).await {
                    Ok(balances) => {
                        let total: u64 =
                            balances.iter().map(|b| b.balance).sum();
                        info!(
                            addresses = balances.len(),
                            total, "balance sweep"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to get balances from node, stats will be out of date");
                    }
                }
            });
        }
    }
}

/// Fetch, personalize, and deliver one job to one connection.
///
/// Every failure here is contained to this connection: the next broadcast
/// cycle is the retry.
async fn deliver_job(
    conn: Arc<StratumConn>,
    source: Arc<dyn TemplateSource>,
    vardiff: Arc<dyn VardiffTracker>,
    min_share_diff: f64,
    solo_mining: bool,
) {
    // Capture the address by value: a client re-identifying mid-cycle must
    // not corrupt this fetch, and this fetch must not clobber the new
    // address.
    let wallet_addr = conn.wallet_addr();
    if wallet_addr.is_empty() {
        debug!(client = conn.id(), "no wallet address yet, skipping");
        return;
    }
    let remote_app = conn.remote_app();

    let template = match source.fetch_template(&wallet_addr, &remote_app).await {
        Ok(template) => template,
        Err(RpcError::InvalidAddress(msg)) => {
            record_worker_error(&wallet_addr, WorkerErrorKind::InvalidAddressFmt);
            error!(client = conn.id(), error = %msg, "malformed address, disconnecting client");
            conn.disconnect();
            return;
        }
        Err(e) => {
            record_worker_error(&wallet_addr, WorkerErrorKind::FailedBlockFetch);
            error!(client = conn.id(), error = %e, "failed fetching new block template from node");
            return;
        }
    };

    let network_target = target_from_bits(template.header.bits);
    let timestamp = template.header.timestamp;
    let header = match serialized_header(&template) {
        Ok(header) => header,
        Err(e) => {
            record_worker_error(&wallet_addr, WorkerErrorKind::BadHeaderData);
            error!(client = conn.id(), error = %e, "failed to serialize block header");
            return;
        }
    };

    let job_id = conn.state().add_job(template);

    let (first_job, use_big_job, current_diff) = {
        let mut inner = conn.state().lock();
        inner.network_target = network_target;
        let first_job = !inner.initialized;
        if first_job {
            inner.initialized = true;
            inner.use_big_job = jobs::uses_big_job(&remote_app);
            inner.stratum_diff.set_value(min_share_diff);
        }
        (first_job, inner.use_big_job, inner.stratum_diff.value())
    };

    if first_job {
        if !solo_mining {
            send_client_diff(&conn, &wallet_addr, current_diff).await;
        }
        vardiff.set_client_vardiff(&conn, min_share_diff);
    }

    let network_diff = target_to_difficulty(&network_target);
    vardiff.set_solo_diff(network_diff);
    let mut effective_diff = if solo_mining {
        network_diff
    } else {
        vardiff.get_client_vardiff(&conn).unwrap_or(current_diff)
    };
    if effective_diff == 0.0 {
        effective_diff = current_diff;
    }
    if effective_diff != current_diff {
        conn.state().lock().stratum_diff.set_value(effective_diff);
        if !solo_mining {
            info!(
                client = conn.id(),
                from = current_diff,
                to = effective_diff,
                "changing difficulty"
            );
            send_client_diff(&conn, &wallet_addr, effective_diff).await;
            vardiff.start_client_vardiff(&conn);
        }
    }

    let params = jobs::build_job_params(job_id, &header, timestamp, use_big_job);
    match conn
        .send(&JsonRpcEvent::with_id("mining.notify", job_id, params))
        .await
    {
        Ok(()) => {
            debug!(client = conn.id(), job_id, "sent work packet");
        }
        Err(Error::Disconnected) => {
            record_worker_error(&wallet_addr, WorkerErrorKind::Disconnected);
        }
        Err(e) => {
            record_worker_error(&wallet_addr, WorkerErrorKind::FailedSendWork);
            error!(client = conn.id(), job_id, error = %e, "failed sending work packet");
        }
    }
}

// Difficulty announcements are best-effort: a failure is logged and the
// connection stays open.
async fn send_client_diff(conn: &StratumConn, wallet_addr: &str, diff: f64) {
    let event =
        JsonRpcEvent::notification("mining.set_difficulty", vec![json!(diff)]);
    if let Err(e) = conn.send(&event).await {
        record_worker_error(wallet_addr, WorkerErrorKind::FailedSetDiff);
        error!(client = conn.id(), error = %e, "failed sending difficulty");
    }
}
