//! Agent Core: the layer between chat turns and the MCP session.
//!
//! Submodules:
//! - `tool_router`: Ranks tools for an utterance and executes model-requested calls
//! - `database`: SQLite persistence for the tool invocation log
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod database;
pub mod errors;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use database::InvocationDatabase;
pub use errors::AgentError;
pub use tool_router::ToolRouter;
pub use types::{InvocationEntry, ToolExecution, ToolSuggestion, ToolUsageStats, ToolUseMarker};
