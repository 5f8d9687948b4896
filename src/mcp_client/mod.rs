//! MCP Client: JSON-RPC over stdio transport to one MCP server.
//!
//! This module handles:
//! - Newline-delimited JSON-RPC framing over the server's stdio
//! - Request/response correlation with per-request timeouts
//! - The protocol session: handshake, tool/resource catalog discovery,
//!   notification handling, tool calls and resource reads
//! - Process supervision with fixed-delay reconnection and a retry budget
//!
//! The session is used by the ToolRouter to execute tools selected for a
//! user utterance.

pub mod config;
pub mod correlator;
pub mod errors;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::McpClientConfig;
pub use errors::{ErrorKind, McpError};
pub use session::{ConnectionStatus, McpSession, ToolCall};
pub use supervisor::{CommandLauncher, ConnectionState, ServerLauncher};
pub use types::{
    InvocationLog, ResourceDescriptor, ResourceReadResult, ToolCallResult, ToolDescriptor,
    ToolInvocationRecord, ToolOutput,
};
