// SPDX-License-Identifier: MIT
//! C8 — MCP connection pool: JSON-RPC wire types plus the pooled WebSocket
//! multiplexer built on top of them.

pub mod pool;
pub mod protocol;

pub use pool::{Connection, McpPool};
