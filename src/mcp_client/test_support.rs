//! In-memory scripted MCP server for tests.
//!
//! Implements [`ServerLauncher`] over `tokio::io::duplex` pairs, so sessions
//! run their real transport, correlator and supervisor code against it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use super::config::McpClientConfig;
use super::errors::McpError;
use super::supervisor::{ServerIo, ServerLauncher};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the next launch behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Serve,
    /// Streams are closed before the client can say anything.
    ExitImmediately,
    FailSpawn,
    /// Answers through `tools/list`, then closes stdout but keeps reading
    /// stdin.
    CloseStdoutAfterToolsList,
}

enum Control {
    Push(String),
    Close,
}

struct FakeState {
    behavior: Behavior,
    tools: Vec<Value>,
    resources: Option<Vec<Value>>,
    received: Vec<Value>,
    control: Option<mpsc::UnboundedSender<Control>>,
}

/// Cloneable handle; clones share the same script and recordings.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
    launches: Arc<AtomicUsize>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                behavior: Behavior::Serve,
                tools: default_tools(),
                resources: Some(vec![json!({
                    "uri": "playground://info",
                    "name": "Server info",
                    "mimeType": "text/plain"
                })]),
                received: Vec::new(),
                control: None,
            })),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.lock().behavior = behavior;
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        self.lock().tools = tools;
    }

    /// Answer `resources/list` with "method not found".
    pub fn without_resources(&self) {
        self.lock().resources = None;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Methods of every message the server has received, in order.
    pub fn received_methods(&self) -> Vec<String> {
        self.lock()
            .received
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn received(&self) -> Vec<Value> {
        self.lock().received.clone()
    }

    /// Send a notification on the live connection.
    pub fn notify(&self, method: &str) {
        let line = json!({"jsonrpc": "2.0", "method": method}).to_string();
        self.push_line(&line);
    }

    /// Write a raw line on the live connection.
    pub fn push_line(&self, line: &str) {
        if let Some(control) = &self.lock().control {
            let _ = control.send(Control::Push(line.to_string()));
        }
    }

    /// Simulate the server process dying.
    pub fn close_connection(&self) {
        if let Some(control) = self.lock().control.take() {
            let _ = control.send(Control::Close);
        }
    }

    fn handle(&self, line: &str) -> Option<Value> {
        let message: Value = serde_json::from_str(line).ok()?;
        let mut state = self.lock();
        state.received.push(message.clone());

        let id = message.get("id")?.clone();
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": {"name": "fake-tools", "version": "0.0.1"}
            })),
            "tools/list" => Ok(json!({ "tools": state.tools })),
            "resources/list" => match &state.resources {
                Some(resources) => Ok(json!({ "resources": resources })),
                None => Err((-32601, "Method not found".to_string())),
            },
            "tools/call" => call_tool(&params)?,
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({
                    "contents": [{"uri": uri, "mimeType": "text/plain", "text": "fake server info"}]
                }))
            }
            other => Err((-32601, format!("Method not found: {other}"))),
        };

        Some(match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        })
    }
}

/// `None` means the call is never answered.
fn call_tool(params: &Value) -> Option<Result<Value, (i64, String)>> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);
    let text = |t: String| json!({"content": [{"type": "text", "text": t}]});

    match name {
        "echo" => {
            let message = args.get("message").and_then(Value::as_str).unwrap_or("");
            Some(Ok(text(format!("Echo: {message}"))))
        }
        "add_numbers" => {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            Some(Ok(text(format!("{}", a + b))))
        }
        "get_time" => Some(Ok(json!("2024-01-01T00:00:00Z"))),
        "slow" => None,
        other => Some(Err((-32602, format!("Unknown tool: {other}")))),
    }
}

pub fn default_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "echo",
            "description": "Echo back the input text",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string", "description": "Text to echo"}},
                "required": ["message"]
            }
        }),
        json!({
            "name": "add_numbers",
            "description": "Add two numbers together",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "number", "description": "First number"},
                    "b": {"type": "number", "description": "Second number"}
                },
                "required": ["a", "b"]
            }
        }),
        json!({
            "name": "slow",
            "description": "Never answers",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ]
}

/// Config tuned for tests: short delays, small budget.
pub fn test_config() -> McpClientConfig {
    McpClientConfig {
        server_name: "fake".into(),
        max_retries: 2,
        retry_delay_ms: 1_000,
        request_timeout_ms: 5_000,
        init_timeout_ms: 5_000,
        call_timeout_ms: 5_000,
        ..McpClientConfig::default()
    }
}

impl ServerLauncher for FakeServer {
    fn describe(&self) -> String {
        "in-memory fake server".into()
    }

    fn launch(&self) -> Result<ServerIo, McpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = self.lock().behavior;

        match behavior {
            Behavior::FailSpawn => Err(McpError::SpawnFailed {
                name: "fake".into(),
                reason: "scripted spawn failure".into(),
            }),
            Behavior::ExitImmediately => {
                let (client_in, server_in) = tokio::io::duplex(PIPE_CAPACITY);
                let (server_out, client_out) = tokio::io::duplex(PIPE_CAPACITY);
                drop(server_in);
                drop(server_out);
                Ok(ServerIo {
                    stdin: Box::new(client_in),
                    stdout: Box::new(client_out),
                    stderr: None,
                    child: None,
                })
            }
            Behavior::Serve | Behavior::CloseStdoutAfterToolsList => {
                let (client_in, server_in) = tokio::io::duplex(PIPE_CAPACITY);
                let (server_out, client_out) = tokio::io::duplex(PIPE_CAPACITY);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                self.lock().control = Some(control_tx);
                let half_close = behavior == Behavior::CloseStdoutAfterToolsList;
                tokio::spawn(serve(self.clone(), server_in, server_out, control_rx, half_close));
                Ok(ServerIo {
                    stdin: Box::new(client_in),
                    stdout: Box::new(client_out),
                    stderr: None,
                    child: None,
                })
            }
        }
    }
}

async fn serve(
    server: FakeServer,
    input: DuplexStream,
    output: DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    half_close: bool,
) {
    let mut output = Some(output);
    let mut lines = BufReader::new(input).lines();
    loop {
        let mut close_stdout = false;
        let outgoing = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    close_stdout = half_close && line.contains("\"tools/list\"");
                    server.handle(&line).map(|reply| reply.to_string())
                }
                _ => break,
            },
            control = control.recv() => match control {
                Some(Control::Push(line)) => Some(line),
                Some(Control::Close) | None => break,
            },
        };
        if let (Some(mut line), Some(out)) = (outgoing, output.as_mut()) {
            line.push('\n');
            if out.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        if close_stdout {
            output = None;
        }
    }
}
