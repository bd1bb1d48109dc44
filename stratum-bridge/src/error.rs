//! Common error types for the bridge.
//!
//! This module provides a centralized Error enum using thiserror, plus the
//! short-code classification attached to per-worker failure events.

use thiserror::Error;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node RPC errors
    #[error(transparent)]
    Rpc(#[from] crate::node::RpcError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Block header could not be serialized for a job packet
    #[error("Header serialization error: {0}")]
    Serialization(String),

    /// The client connection is gone
    #[error("client disconnected")]
    Disconnected,

    /// Sending to a still-connected client failed
    #[error("Send error: {0}")]
    Send(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Short codes classifying per-worker failures for observability.
///
/// These mirror the states a broadcast cycle can leave an individual
/// connection in; they are attached to the structured log events recorded
/// against a worker's wallet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    InvalidAddressFmt,
    FailedBlockFetch,
    BadHeaderData,
    Disconnected,
    FailedSendWork,
    FailedSetDiff,
}

impl WorkerErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerErrorKind::InvalidAddressFmt => "invalid_address_fmt",
            WorkerErrorKind::FailedBlockFetch => "failed_block_fetch",
            WorkerErrorKind::BadHeaderData => "bad_header_data",
            WorkerErrorKind::Disconnected => "disconnected",
            WorkerErrorKind::FailedSendWork => "failed_send_work",
            WorkerErrorKind::FailedSetDiff => "failed_set_diff",
        }
    }
}

/// Record a classified per-worker failure.
///
/// The bridge keeps no metrics registry; classified failures surface as
/// structured warn events that downstream log collection can count.
pub fn record_worker_error(wallet: &str, kind: WorkerErrorKind) {
    tracing::warn!(wallet, code = kind.as_str(), "worker error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_codes_are_distinct() {
        let codes = [
            WorkerErrorKind::InvalidAddressFmt,
            WorkerErrorKind::FailedBlockFetch,
            WorkerErrorKind::BadHeaderData,
            WorkerErrorKind::Disconnected,
            WorkerErrorKind::FailedSendWork,
            WorkerErrorKind::FailedSetDiff,
        ];
        let strs: std::collections::HashSet<_> =
            codes.iter().map(|c| c.as_str()).collect();
        assert_eq!(strs.len(), codes.len());
    }
}
