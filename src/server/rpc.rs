/// JSON-RPC 2.0 wire types for the WebSocket transport
/// Failure responses bridge both taxonomies: the numeric JSON-RPC code plus
/// the REST status and kind name travel together
use crate::errors::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A single incoming RPC call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// A server-initiated request (broadcast push); no reply is expected
    pub fn outbound(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// A single outgoing RPC response, success or failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RpcResponse {
    /// Create a successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            code: None,
            status: None,
            error: None,
            message: None,
            trace: None,
        }
    }

    /// Create a failure response carrying both taxonomies
    pub fn failure(id: Value, error: &ApiError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            code: Some(error.rpc_code()),
            status: Some(error.status()),
            error: Some(error.kind.name().to_string()),
            message: Some(error.message.clone()),
            trace: error.trace.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}
