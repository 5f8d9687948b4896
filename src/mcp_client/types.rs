//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP catalog structures, and the normalized
//! result types returned by the session.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::{ErrorKind, McpError};

/// JSON-RPC version stamped on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision declared during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Opaque request identifier (UUID v4 on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh, globally unique identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (client → server, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        let message = if err.message.is_empty() {
            "MCP request failed".to_string()
        } else {
            err.message
        };
        McpError::ServerError {
            code: err.code,
            message,
            data: err.data,
        }
    }
}

/// Any message read from the server: a response, a notification, or a
/// server-initiated request. Classified by which fields are present.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl InboundMessage {
    /// The message id as a [`RequestId`]. Numeric ids compare by their
    /// decimal form; `null` and other shapes have no id.
    pub fn request_id(&self) -> Option<RequestId> {
        match self.id.as_ref()? {
            Value::String(s) => Some(RequestId(s.clone())),
            Value::Number(n) => Some(RequestId(n.to_string())),
            _ => None,
        }
    }

    /// Split into the outcome a pending caller should observe.
    pub fn into_outcome(self) -> Result<Value, McpError> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Notifications ──────────────────────────────────────────────────────────

/// Server-initiated notifications this client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotification {
    ToolsListChanged,
    ResourcesListChanged,
    ResourceUpdated { uri: Option<String> },
    /// Anything else. Logged and ignored so newer servers keep working.
    Unknown { method: String },
}

impl ServerNotification {
    pub fn parse(method: &str, params: Option<&Value>) -> Self {
        match method {
            "notifications/tools/list_changed" => Self::ToolsListChanged,
            "notifications/resources/list_changed" => Self::ResourcesListChanged,
            "notifications/resources/updated" => Self::ResourceUpdated {
                uri: params
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => Self::Unknown {
                method: other.to_string(),
            },
        }
    }
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn new(client_name: &str, client_version: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {
                roots: RootsCapability { list_changed: true },
                sampling: serde_json::Map::new(),
            },
            client_info: ClientInfo {
                name: client_name.to_string(),
                version: client_version.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCapabilities {
    pub roots: RootsCapability,
    pub sampling: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Catalog ────────────────────────────────────────────────────────────────

/// A tool advertised by the server via `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
    /// Owning server (assigned locally on discovery).
    #[serde(default)]
    pub server: String,
    /// Category used by the relevance router (assigned from config).
    #[serde(default)]
    pub category: Option<String>,
}

/// One parameter from a tool's `inputSchema`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ToolDescriptor {
    /// Typed view over `inputSchema.properties` / `inputSchema.required`.
    pub fn parameters(&self) -> Vec<ParameterSpec> {
        let required: HashSet<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let Some(properties) = self.input_schema.get("properties").and_then(Value::as_object)
        else {
            return Vec::new();
        };

        properties
            .iter()
            .map(|(name, spec)| ParameterSpec {
                name: name.clone(),
                kind: spec
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any")
                    .to_string(),
                description: spec
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                required: required.contains(name.as_str()),
            })
            .collect()
    }
}

/// A resource advertised by the server via `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// `resources/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Tools and resources known for the current connection.
///
/// Each list call replaces its half wholesale. Server order is preserved;
/// a repeated name (or uri) keeps its first occurrence.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
}

impl Catalog {
    pub fn replace_tools(&mut self, tools: Vec<ToolDescriptor>) {
        let mut seen = HashSet::new();
        self.tools = tools
            .into_iter()
            .filter(|t| seen.insert(t.name.clone()))
            .collect();
    }

    pub fn replace_resources(&mut self, resources: Vec<ResourceDescriptor>) {
        let mut seen = HashSet::new();
        self.resources = resources
            .into_iter()
            .filter(|r| seen.insert(r.uri.clone()))
            .collect();
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn resource(&self, uri: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn resource_uris(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.uri.clone()).collect()
    }
}

// ─── Tool Output ────────────────────────────────────────────────────────────

/// The shapes a `tools/call` result shows up in, classified once on receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToolResult {
    /// A bare string, number or boolean.
    Plain(String),
    /// An array whose first element carries a string `text` field.
    Blocks(String),
    /// An object whose `content[0].text` is a string.
    Envelope(String),
    /// Anything else, kept verbatim.
    Other(Value),
}

impl From<Value> for RawToolResult {
    fn from(raw: Value) -> Self {
        match raw {
            Value::String(s) => Self::Plain(s),
            Value::Number(n) => Self::Plain(n.to_string()),
            Value::Bool(b) => Self::Plain(b.to_string()),
            raw => {
                if let Some(text) = raw
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(|first| first.get("text"))
                    .and_then(Value::as_str)
                {
                    return Self::Blocks(text.to_string());
                }
                if let Some(text) = raw
                    .get("content")
                    .and_then(|c| c.get(0))
                    .and_then(|first| first.get("text"))
                    .and_then(Value::as_str)
                {
                    return Self::Envelope(text.to_string());
                }
                Self::Other(raw)
            }
        }
    }
}

impl RawToolResult {
    pub fn normalize(self) -> ToolOutput {
        match self {
            Self::Plain(text) | Self::Blocks(text) | Self::Envelope(text) => ToolOutput::Text(text),
            Self::Other(value) => ToolOutput::Structured(value),
        }
    }
}

/// Canonical tool output after normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Structured(Value),
}

impl ToolOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    /// JSON form, used for audit logging.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
        }
    }
}

/// Normalize a raw `tools/call` result in one step.
pub fn normalize_tool_output(raw: Value) -> ToolOutput {
    RawToolResult::from(raw).normalize()
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Result of a tool call execution. Failures are values, never panics.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub parameters: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ToolCallResult {
    pub fn succeeded(tool_name: &str, parameters: Value, output: ToolOutput, elapsed_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            parameters,
            success: true,
            result: Some(output),
            error: None,
            error_kind: None,
            execution_time_ms: Some(elapsed_ms),
        }
    }

    pub fn failed(tool_name: &str, parameters: Value, error: &McpError) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            parameters,
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            execution_time_ms: None,
        }
    }
}

/// Result of a `resources/read`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceReadResult {
    pub uri: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ResourceReadResult {
    pub fn succeeded(uri: &str, contents: Value) -> Self {
        Self {
            uri: uri.to_string(),
            success: true,
            contents: Some(contents),
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(uri: &str, error: &McpError) -> Self {
        Self {
            uri: uri.to_string(),
            success: false,
            contents: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }
}

// ─── Invocation Logging ─────────────────────────────────────────────────────

/// One `call_tool` outcome, handed to the invocation log.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocationRecord {
    pub session_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub response: Value,
    pub success: bool,
    pub execution_time_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn from_result(session_id: &str, result: &ToolCallResult) -> Self {
        let response = match (&result.result, &result.error) {
            (Some(output), _) => output.to_value(),
            (None, Some(error)) => serde_json::json!({ "error": error }),
            (None, None) => Value::Null,
        };
        Self {
            session_id: session_id.to_string(),
            tool_name: result.tool_name.clone(),
            parameters: result.parameters.clone(),
            response,
            success: result.success,
            execution_time_ms: result.execution_time_ms.unwrap_or(0),
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only sink for tool invocations, keyed by session.
///
/// Called opportunistically after every tool call; a failing sink never
/// changes the caller's result.
pub trait InvocationLog: Send + Sync {
    fn record(&self, record: &ToolInvocationRecord) -> anyhow::Result<()>;
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
