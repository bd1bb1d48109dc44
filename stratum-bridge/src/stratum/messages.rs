//! Stratum wire messages.
//!
//! The client-facing protocol is JSON-RPC over newline-delimited TCP.
//! Server-to-client traffic is [`JsonRpcEvent`] notifications; requests
//! from clients arrive as [`JsonRpcRequest`] and are answered with
//! [`JsonRpcResponse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server-initiated event (job notification, difficulty change).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcEvent {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub params: Vec<Value>,
}

impl JsonRpcEvent {
    /// An id-less notification.
    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            id: None,
            params,
        }
    }

    /// A notification carrying an id; job packets use the job id here.
    pub fn with_id(method: &str, id: u64, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            id: Some(id),
            params,
        }
    }
}

/// A request from a mining client.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A reply to a client request, echoing its id.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub id: Option<Value>,
    pub result: Value,
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }
}
