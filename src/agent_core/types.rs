//! Shared types for the agent core.

use serde::Serialize;

use crate::mcp_client::types::ToolCallResult;

// ─── Invocation Log ─────────────────────────────────────────────────────────

/// One row of the tool invocation log.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationEntry {
    pub id: i64,
    pub session_id: String,
    pub timestamp: String,
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub response: serde_json::Value,
    pub success: bool,
    pub execution_time_ms: u64,
}

/// Aggregate usage for one tool across all sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUsageStats {
    pub tool_name: String,
    pub calls: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
}

// ─── Routing ────────────────────────────────────────────────────────────────

/// A catalog tool ranked against a user utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSuggestion {
    pub tool_name: String,
    pub description: String,
    pub server: String,
    pub category: Option<String>,
    /// In `[0, 1]`, in steps of 0.1.
    pub relevance_score: f64,
}

/// A `[TOOL_USE:name:{json}]` marker found in model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseMarker {
    pub tool_name: String,
    /// `Err` holds the JSON parse error when the payload is malformed.
    pub parameters: Result<serde_json::Value, String>,
}

/// A tool executed on behalf of a model response.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    #[serde(flatten)]
    pub result: ToolCallResult,
    pub server: String,
    /// True when the call came from utterance pattern matching rather than
    /// an explicit marker.
    pub auto_detected: bool,
}
