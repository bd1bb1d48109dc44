//! Seam to the variable-difficulty tracker.
//!
//! The adaptation *decision* algorithm (observing share rate, proposing a
//! new difficulty) lives outside this crate. What the broadcast engine
//! needs is the interaction surface: per-connection stats creation, the
//! currently suggested difficulty, and window restarts after a change is
//! applied. [`ShareHandler`] is the storage-only implementation backing the
//! binary.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

use crate::stratum::connection::StratumConn;

/// Interaction points the broadcast engine has with the tracker.
pub trait VardiffTracker: Send + Sync {
    /// Ensure stats exist for this connection, creating them if needed.
    fn get_create_stats(&self, conn: &StratumConn);

    /// Record the difficulty just applied to this connection.
    fn set_client_vardiff(&self, conn: &StratumConn, diff: f64);

    /// The tracker's current suggestion, if it has one yet.
    fn get_client_vardiff(&self, conn: &StratumConn) -> Option<f64>;

    /// Restart the adaptation window after a difficulty change was sent.
    fn start_client_vardiff(&self, conn: &StratumConn);

    /// Forget a disconnected connection's stats. Ids are never reused, so
    /// an entry left behind here is leaked for the life of the process.
    fn drop_stats(&self, conn: &StratumConn);

    /// Inform the tracker of the current network difficulty (solo mode).
    fn set_solo_diff(&self, diff: f64);
}

struct MinerStats {
    window_started: Option<Instant>,
    shares_in_window: u64,
    var_diff: Option<f64>,
}

/// Per-connection stats store.
#[derive(Default)]
pub struct ShareHandler {
    stats: Mutex<HashMap<u32, MinerStats>>,
    solo_diff: Mutex<f64>,
}

impl ShareHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a submitted share against the connection's current window.
    pub fn record_share(&self, conn: &StratumConn) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(conn.id()).or_insert_with(new_stats);
        entry.shares_in_window += 1;
    }

}

fn new_stats() -> MinerStats {
    MinerStats {
        window_started: None,
        shares_in_window: 0,
        var_diff: None,
    }
}

impl VardiffTracker for ShareHandler {
    fn get_create_stats(&self, conn: &StratumConn) {
        self.stats.lock().entry(conn.id()).or_insert_with(new_stats);
    }

    fn set_client_vardiff(&self, conn: &StratumConn, diff: f64) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(conn.id()).or_insert_with(new_stats);
        entry.var_diff = Some(diff);
        entry.window_started = Some(Instant::now());
        entry.shares_in_window = 0;
    }

    fn get_client_vardiff(&self, conn: &StratumConn) -> Option<f64> {
        self.stats.lock().get(&conn.id()).and_then(|s| s.var_diff)
    }

    fn start_client_vardiff(&self, conn: &StratumConn) {
        if let Some(entry) = self.stats.lock().get_mut(&conn.id()) {
            entry.window_started = Some(Instant::now());
            entry.shares_in_window = 0;
        }
    }

    fn drop_stats(&self, conn: &StratumConn) {
        self.stats.lock().remove(&conn.id());
    }

    fn set_solo_diff(&self, diff: f64) {
        *self.solo_diff.lock() = diff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(id: u32) -> StratumConn {
        let (tx, _rx) = mpsc::channel(1);
        StratumConn::new(id, format!("test:{id}"), None, tx)
    }

    #[test]
    fn vardiff_absent_until_set() {
        let handler = ShareHandler::new();
        let c = conn(1);
        handler.get_create_stats(&c);
        assert_eq!(handler.get_client_vardiff(&c), None);
        handler.set_client_vardiff(&c, 1000.0);
        assert_eq!(handler.get_client_vardiff(&c), Some(1000.0));
    }

    #[test]
    fn stats_are_per_connection() {
        let handler = ShareHandler::new();
        let (a, b) = (conn(1), conn(2));
        handler.set_client_vardiff(&a, 10.0);
        assert_eq!(handler.get_client_vardiff(&b), None);
    }

    #[test]
    fn window_restart_clears_share_count() {
        let handler = ShareHandler::new();
        let c = conn(1);
        handler.set_client_vardiff(&c, 10.0);
        handler.record_share(&c);
        handler.record_share(&c);
        handler.start_client_vardiff(&c);
        {
            let stats = handler.stats.lock();
            assert_eq!(stats[&c.id()].shares_in_window, 0);
            assert!(stats[&c.id()].window_started.is_some());
        }
        // the suggestion itself survives a window restart
        assert_eq!(handler.get_client_vardiff(&c), Some(10.0));
    }

    #[test]
    fn solo_diff_is_process_wide() {
        let handler = ShareHandler::new();
        handler.set_solo_diff(123.0);
        assert_eq!(*handler.solo_diff.lock(), 123.0);
    }

    #[test]
    fn drop_stats_forgets_disconnected_connections() {
        let handler = ShareHandler::new();
        for id in 1..=100 {
            let c = conn(id);
            handler.set_client_vardiff(&c, 10.0);
            handler.record_share(&c);
            handler.drop_stats(&c);
        }
        assert!(handler.stats.lock().is_empty(), "stats entries leaked");
        // re-registering after a drop starts from a clean entry
        let c = conn(1);
        assert_eq!(handler.get_client_vardiff(&c), None);
    }
}
