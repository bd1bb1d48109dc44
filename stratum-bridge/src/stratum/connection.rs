//! One live mining client connection.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::JsonRpcEvent;
use super::mining_state::MiningState;
use crate::error::{Error, Result};

/// A duplex channel to one mining client.
///
/// The registry is the only owner of the id-to-connection mapping; the
/// connection itself owns its mining state exclusively for its lifetime.
/// Outbound traffic goes through a channel drained by the transport's
/// writer task, so `send` never blocks on the socket.
pub struct StratumConn {
    id: u32,
    remote: String,
    wallet_addr: Mutex<String>,
    remote_app: Mutex<String>,
    extranonce: Mutex<Option<String>>,
    state: MiningState,
    connected: AtomicBool,
    cancel: CancellationToken,
    outbox: mpsc::Sender<String>,
}

impl StratumConn {
    pub fn new(
        id: u32,
        remote: String,
        extranonce: Option<String>,
        outbox: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            remote,
            wallet_addr: Mutex::new(String::new()),
            remote_app: Mutex::new(String::new()),
            extranonce: Mutex::new(extranonce),
            state: MiningState::new(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            outbox,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn wallet_addr(&self) -> String {
        self.wallet_addr.lock().clone()
    }

    /// A client may legitimately re-identify with a new address between
    /// jobs; broadcasts capture the address by value before fetching, so a
    /// change here never corrupts an in-flight fetch.
    pub fn set_wallet_addr(&self, addr: String) {
        *self.wallet_addr.lock() = addr;
    }

    pub fn remote_app(&self) -> String {
        self.remote_app.lock().clone()
    }

    pub fn set_remote_app(&self, app: String) {
        *self.remote_app.lock() = app;
    }

    pub fn extranonce(&self) -> Option<String> {
        self.extranonce.lock().clone()
    }

    pub fn state(&self) -> &MiningState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection terminated and wake its transport tasks.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Queue an event for the client.
    ///
    /// Fails with [`Error::Disconnected`] once the connection is gone (or
    /// its writer task has stopped), [`Error::Send`] if the event cannot be
    /// encoded.
    pub async fn send(&self, event: &JsonRpcEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| Error::Send(e.to_string()))?;
        self.send_raw(line).await
    }

    /// Queue an already-encoded line for the client.
    pub async fn send_raw(&self, line: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.outbox
            .send(line)
            .await
            .map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_conn(buffer: usize) -> (StratumConn, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (StratumConn::new(1, "test:1".into(), None, tx), rx)
    }

    #[tokio::test]
    async fn send_delivers_encoded_event() {
        let (conn, mut rx) = test_conn(4);
        conn.send(&JsonRpcEvent::notification("mining.set_difficulty", vec![json!(1.0)]))
            .await
            .unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.contains("mining.set_difficulty"));
    }

    #[tokio::test]
    async fn send_after_disconnect_is_classified() {
        let (conn, _rx) = test_conn(4);
        conn.disconnect();
        let err = conn
            .send(&JsonRpcEvent::notification("mining.notify", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn send_with_writer_gone_is_classified() {
        let (conn, rx) = test_conn(4);
        drop(rx);
        let err = conn
            .send(&JsonRpcEvent::notification("mining.notify", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }
}
