// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 request/response/notification shapes used over the MCP
//! WebSocket connection (source spec §4.8/§6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutboundNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// An inbound frame. Frames carrying `id` are responses (dispatched to the
/// pending map); frames without one are server-initiated notifications
/// dispatched by `method`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

impl InboundFrame {
    pub fn is_response(&self) -> bool {
        self.id.is_some()
    }
}

pub const NOTIFICATION_TOOL_UPDATE: &str = "tool_update";
pub const NOTIFICATION_RESOURCE_UPDATE: &str = "resource_update";
pub const NOTIFICATION_PROGRESS: &str = "progress";
pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "tools/list_changed";

/// Cached capability lists returned by the `initialize` handshake's
/// follow-up `tools/list`, `resources/list`, `prompts/list` calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}
