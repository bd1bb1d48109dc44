//! Stratum bridge between mining clients and a synthex node.
//!
//! The node side keeps a single RPC connection healthy and watches sync
//! state; the stratum side accepts miner connections and fans personalized
//! block templates out to them whenever the node announces (or a fallback
//! timer suspects) fresh work.

pub mod config;
pub mod error;
pub mod node;
pub mod stratum;
pub mod tracing;
pub mod types;
pub mod vardiff;

pub use error::{Error, Result};
