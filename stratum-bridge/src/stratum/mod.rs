//! Stratum v1 face of the bridge: the listener, per-connection state, the
//! job ring, and the broadcast engine that fans fresh work out to miners.

pub mod connection;
pub mod jobs;
pub mod messages;
pub mod mining_state;
pub mod registry;
pub mod server;

pub use connection::StratumConn;
pub use mining_state::MiningState;
pub use registry::ClientRegistry;
pub use server::StratumServer;
