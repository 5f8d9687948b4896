//! MCP protocol session.
//!
//! One [`McpSession`] per server. It drives the connection through
//! handshake and catalog discovery, routes inbound traffic, reacts to
//! list-changed notifications, and exposes tool calls and resource reads as
//! structured results.
//!
//! Lifecycle:
//! ```text
//! Disconnected -> Connecting -> Handshaking -> DiscoveringCatalog -> Ready
//!                    ^                                                |
//!                    +------ Reconnecting <-- (process exit / EOF) ---+
//!                                 |
//!                                 +--> Failed (retry budget spent)
//! ```

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use super::config::McpClientConfig;
use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::supervisor::{
    CommandLauncher, ConnectionState, LossDecision, ServerLauncher, Supervisor,
};
use super::transport::{spawn_reader, spawn_stderr_logger, FrameWriter, TransportEvent};
use super::types::{
    error_codes, normalize_tool_output, Catalog, InboundMessage, InitializeParams,
    InitializeResult, InvocationLog, JsonRpcNotification, ListResourcesResult, ListToolsResult,
    ResourceDescriptor, ResourceReadResult, ServerNotification, ToolCallResult, ToolDescriptor,
    ToolInvocationRecord,
};

// ─── Public Types ────────────────────────────────────────────────────────────

/// One entry of a batch tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Snapshot of the session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub server: String,
    pub server_path: String,
    pub tools: usize,
    pub resources: usize,
    pub tool_names: Vec<String>,
    pub resource_uris: Vec<String>,
    pub pending_requests: usize,
    pub reconnect_attempts: u32,
    pub max_retries: u32,
    pub process_id: Option<u32>,
}

// ─── Internals ───────────────────────────────────────────────────────────────

/// Live streams of one connection generation.
struct Connection {
    generation: u64,
    writer: Arc<FrameWriter>,
    tasks: Vec<AbortHandle>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct InvocationSink {
    log: Arc<dyn InvocationLog>,
    session_id: String,
}

struct SessionInner {
    config: McpClientConfig,
    supervisor: Supervisor,
    correlator: RequestCorrelator,
    catalog: RwLock<Catalog>,
    connection: RwLock<Option<Arc<Connection>>>,
    invocation_log: RwLock<Option<InvocationSink>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn invalid_result(server: &str, method: &str, error: serde_json::Error) -> McpError {
    McpError::TransportError {
        server: server.to_string(),
        reason: format!("invalid {method} result: {error}"),
    }
}

impl SessionInner {
    fn name(&self) -> &str {
        &self.config.server_name
    }

    // ─── Connecting ──────────────────────────────────────────────────────

    /// Run one connection attempt. A failed attempt counts as a loss.
    async fn establish(self: &Arc<Self>) -> Result<(), McpError> {
        let generation = self.supervisor.begin_attempt()?;
        match self.start(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(server = %self.name(), generation, error = %e, "MCP connection attempt failed");
                self.handle_loss(generation, &e.to_string());
                Err(e)
            }
        }
    }

    async fn start(self: &Arc<Self>, generation: u64) -> Result<(), McpError> {
        let spawned = self.supervisor.launch(generation)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = Arc::new(FrameWriter::new(self.name(), generation, spawned.stdin));
        let mut tasks = vec![spawn_reader(self.name(), spawned.stdout, events_tx).abort_handle()];
        if let Some(stderr) = spawned.stderr {
            tasks.push(spawn_stderr_logger(self.name(), stderr).abort_handle());
        }
        *write(&self.connection) = Some(Arc::new(Connection {
            generation,
            writer: Arc::clone(&writer),
            tasks,
        }));
        tokio::spawn(run_events(
            Arc::downgrade(self),
            generation,
            events_rx,
            spawned.exited,
        ));

        self.enter(generation, ConnectionState::Handshaking)?;
        self.handshake(&writer).await?;

        self.enter(generation, ConnectionState::DiscoveringCatalog)?;
        let tools = self.fetch_tools(&writer).await?;
        let resources = self.fetch_resources(&writer).await?;
        {
            let mut catalog = write(&self.catalog);
            catalog.replace_tools(tools);
            catalog.replace_resources(resources);
        }

        if !self.supervisor.mark_ready(generation) {
            return Err(McpError::ConnectionLost {
                reason: "connection lost during startup".into(),
            });
        }

        let catalog = read(&self.catalog);
        tracing::info!(
            server = %self.name(),
            generation,
            tools = catalog.tools().len(),
            resources = catalog.resources().len(),
            "MCP session ready"
        );
        Ok(())
    }

    /// Move to the next startup phase, unless this attempt was already lost.
    fn enter(&self, generation: u64, state: ConnectionState) -> Result<(), McpError> {
        if self.supervisor.advance(generation, state) {
            return Ok(());
        }
        Err(McpError::ConnectionLost {
            reason: format!("connection lost before {state}"),
        })
    }

    async fn handshake(&self, writer: &FrameWriter) -> Result<(), McpError> {
        let params = InitializeParams::new(&self.config.client_name, &self.config.client_version);
        let params = serde_json::to_value(params).map_err(|e| McpError::InitFailed {
            name: self.name().to_string(),
            reason: format!("failed to encode initialize params: {e}"),
        })?;

        let result = self
            .correlator
            .request(writer, "initialize", params, self.config.init_timeout())
            .await
            .map_err(|e| match e {
                McpError::ServerError { message, .. } => McpError::InitFailed {
                    name: self.name().to_string(),
                    reason: message,
                },
                other => other,
            })?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        let server_info = init.server_info.unwrap_or_default();
        tracing::info!(
            server = %self.name(),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            server_name = server_info.name.as_deref().unwrap_or("unknown"),
            server_version = server_info.version.as_deref().unwrap_or("unknown"),
            "MCP handshake complete"
        );

        writer
            .write(&JsonRpcNotification::new("notifications/initialized", None))
            .await
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    async fn fetch_tools(&self, writer: &FrameWriter) -> Result<Vec<ToolDescriptor>, McpError> {
        let value = self
            .correlator
            .request(writer, "tools/list", json!({}), self.config.request_timeout())
            .await?;
        let listed: ListToolsResult =
            serde_json::from_value(value).map_err(|e| invalid_result(self.name(), "tools/list", e))?;

        Ok(listed
            .tools
            .into_iter()
            .map(|mut tool| {
                tool.server = self.config.server_name.clone();
                tool.category = self.config.category.clone();
                tool
            })
            .collect())
    }

    async fn fetch_resources(
        &self,
        writer: &FrameWriter,
    ) -> Result<Vec<ResourceDescriptor>, McpError> {
        let value = match self
            .correlator
            .request(writer, "resources/list", json!({}), self.config.request_timeout())
            .await
        {
            Ok(value) => value,
            Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                tracing::debug!(server = %self.name(), "server has no resources");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let listed: ListResourcesResult = serde_json::from_value(value)
            .map_err(|e| invalid_result(self.name(), "resources/list", e))?;
        Ok(listed.resources)
    }

    async fn refresh_tools(&self) -> Result<usize, McpError> {
        let writer = self.ready_writer(Catalog::tool_names)?;
        let tools = self.fetch_tools(&writer).await?;
        let count = tools.len();
        write(&self.catalog).replace_tools(tools);
        tracing::info!(server = %self.name(), tools = count, "MCP tool catalog refreshed");
        Ok(count)
    }

    async fn refresh_resources(&self) -> Result<usize, McpError> {
        let writer = self.ready_writer(Catalog::resource_uris)?;
        let resources = self.fetch_resources(&writer).await?;
        let count = resources.len();
        write(&self.catalog).replace_resources(resources);
        tracing::info!(server = %self.name(), resources = count, "MCP resource catalog refreshed");
        Ok(count)
    }

    // ─── Inbound Traffic ─────────────────────────────────────────────────

    fn on_message(self: &Arc<Self>, message: InboundMessage) {
        let Some(unmatched) = self.correlator.on_message(message) else {
            return;
        };
        let Some(method) = unmatched.method.as_deref() else {
            tracing::debug!(
                server = %self.name(),
                id = ?unmatched.id,
                "ignoring response with no pending request"
            );
            return;
        };
        if unmatched.id.is_some() {
            tracing::debug!(server = %self.name(), method, "ignoring server-initiated request");
            return;
        }

        match ServerNotification::parse(method, unmatched.params.as_ref()) {
            ServerNotification::ToolsListChanged => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.refresh_tools().await {
                        tracing::warn!(server = %inner.name(), error = %e, "tool catalog refresh failed");
                    }
                });
            }
            ServerNotification::ResourcesListChanged => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.refresh_resources().await {
                        tracing::warn!(server = %inner.name(), error = %e, "resource catalog refresh failed");
                    }
                });
            }
            ServerNotification::ResourceUpdated { uri } => {
                tracing::info!(server = %self.name(), uri = uri.as_deref().unwrap_or("unknown"), "MCP resource updated");
            }
            ServerNotification::Unknown { method } => {
                tracing::debug!(server = %self.name(), %method, "ignoring unknown MCP notification");
            }
        }
    }

    // ─── Loss & Reconnect ────────────────────────────────────────────────

    fn drop_connection(&self, generation: u64) {
        let mut slot = write(&self.connection);
        if slot.as_ref().is_some_and(|c| c.generation == generation) {
            *slot = None;
        }
    }

    fn handle_loss(self: &Arc<Self>, generation: u64, reason: &str) {
        self.drop_connection(generation);

        match self.supervisor.mark_lost(generation, reason) {
            LossDecision::Stale => {}
            LossDecision::Reconnect {
                token,
                attempt,
                max_attempts,
                delay,
            } => {
                let in_flight = self.correlator.pending_methods();
                let failed = self.correlator.retire(generation, reason);
                tracing::warn!(
                    server = %self.name(),
                    %reason,
                    failed_requests = failed,
                    ?in_flight,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "MCP connection lost, scheduling reconnect"
                );

                let weak = Arc::downgrade(self);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if !inner.supervisor.claim_reconnect(token) {
                        return;
                    }
                    tracing::info!(server = %inner.name(), attempt, max_attempts, "reconnecting to MCP server");
                    // establish() already logs and schedules the next attempt on failure.
                    let _ = inner.establish().await;
                });
                self.supervisor.set_reconnect_handle(token, task.abort_handle());
            }
            LossDecision::Exhausted { attempts } => {
                let failed = self.correlator.retire(generation, reason);
                tracing::error!(
                    server = %self.name(),
                    %reason,
                    attempts,
                    failed_requests = failed,
                    "MCP reconnection attempts exhausted, giving up"
                );
            }
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Writer of the live connection. When not ready, the error lists the
    /// names `known` picks from the last discovered catalog.
    fn ready_writer(
        &self,
        known: fn(&Catalog) -> Vec<String>,
    ) -> Result<Arc<FrameWriter>, McpError> {
        let state = self.supervisor.state();
        let writer = if state == ConnectionState::Ready {
            read(&self.connection).as_ref().map(|c| Arc::clone(&c.writer))
        } else {
            None
        };
        writer.ok_or_else(|| McpError::NotReady {
            state,
            known: known(&read(&self.catalog)),
        })
    }

    async fn call_tool(&self, name: &str, parameters: &Value) -> Result<Value, McpError> {
        let writer = self.ready_writer(Catalog::tool_names)?;
        {
            let catalog = read(&self.catalog);
            if catalog.tool(name).is_none() {
                return Err(McpError::ToolUnavailable {
                    name: name.to_string(),
                    available: catalog.tool_names(),
                });
            }
        }

        let params = json!({ "name": name, "arguments": parameters });
        self.correlator
            .request(&writer, "tools/call", params, self.config.call_timeout())
            .await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let writer = self.ready_writer(Catalog::resource_uris)?;
        {
            let catalog = read(&self.catalog);
            if catalog.resource(uri).is_none() {
                return Err(McpError::ResourceUnavailable {
                    uri: uri.to_string(),
                    available: catalog.resource_uris(),
                });
            }
        }

        let result = self
            .correlator
            .request(
                &writer,
                "resources/read",
                json!({ "uri": uri }),
                self.config.request_timeout(),
            )
            .await?;
        Ok(match result {
            Value::Object(mut map) => map.remove("contents").unwrap_or(Value::Object(map)),
            other => other,
        })
    }

    fn record_invocation(&self, result: &ToolCallResult) {
        let sink = read(&self.invocation_log);
        let Some(sink) = sink.as_ref() else {
            return;
        };
        let record = ToolInvocationRecord::from_result(&sink.session_id, result);
        if let Err(e) = sink.log.record(&record) {
            tracing::warn!(
                server = %self.name(),
                tool = %result.tool_name,
                error = %e,
                "failed to record tool invocation"
            );
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.supervisor.shutdown();
        self.correlator.fail_all("MCP session dropped");
    }
}

/// Pump transport events for one generation until the connection ends.
async fn run_events(
    session: Weak<SessionInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut exited: Option<oneshot::Receiver<String>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            reason = wait_for_exit(&mut exited) => Some(TransportEvent::Closed { reason }),
        };
        let Some(inner) = session.upgrade() else {
            return;
        };
        match event {
            Some(TransportEvent::Message(message)) => inner.on_message(message),
            Some(TransportEvent::Closed { reason }) => {
                inner.handle_loss(generation, &reason);
                return;
            }
            None => return,
        }
    }
}

async fn wait_for_exit(exited: &mut Option<oneshot::Receiver<String>>) -> String {
    match exited {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| "MCP server process watcher stopped".to_string()),
        None => std::future::pending().await,
    }
}

// ─── McpSession ──────────────────────────────────────────────────────────────

/// Client session with one MCP server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct McpSession {
    inner: Arc<SessionInner>,
}

impl McpSession {
    pub fn new(config: McpClientConfig, launcher: Arc<dyn ServerLauncher>) -> Self {
        let supervisor = Supervisor::new(
            &config.server_name,
            launcher,
            config.max_retries,
            config.retry_delay(),
        );
        Self {
            inner: Arc::new(SessionInner {
                config,
                supervisor,
                correlator: RequestCorrelator::new(),
                catalog: RwLock::new(Catalog::default()),
                connection: RwLock::new(None),
                invocation_log: RwLock::new(None),
            }),
        }
    }

    /// Session that launches the configured server as a child process.
    pub fn from_config(config: McpClientConfig) -> Self {
        let launcher = Arc::new(CommandLauncher::from_config(&config));
        Self::new(config, launcher)
    }

    /// Record every subsequent tool call under `session_id`.
    pub fn set_invocation_log(&self, log: Arc<dyn InvocationLog>, session_id: impl Into<String>) {
        *write(&self.inner.invocation_log) = Some(InvocationSink {
            log,
            session_id: session_id.into(),
        });
    }

    /// Connect, handshake and discover the catalog. `Ok` at once if ready.
    ///
    /// A failed attempt is also reported to the supervisor, which schedules
    /// reconnection per the retry budget.
    pub async fn connect(&self) -> Result<(), McpError> {
        if !self.inner.config.enabled {
            return Err(McpError::ConfigError {
                reason: "MCP client is disabled".into(),
            });
        }
        if self.state() == ConnectionState::Ready {
            return Ok(());
        }
        tracing::info!(
            server = %self.inner.name(),
            path = %self.inner.supervisor.describe(),
            "connecting to MCP server"
        );
        self.inner.establish().await
    }

    /// Permanently close the session. Pending requests fail with
    /// `ConnectionLost`; later `connect()` calls return `SessionClosed`.
    pub async fn disconnect(&self) {
        self.inner.supervisor.shutdown();
        *write(&self.inner.connection) = None;
        let failed = self.inner.correlator.fail_all("MCP client disconnected");
        tracing::info!(server = %self.inner.name(), failed_requests = failed, "MCP session disconnected");
    }

    /// Call a tool. Failures come back as `success: false`, never as `Err`.
    pub async fn call_tool(&self, name: &str, parameters: Value) -> ToolCallResult {
        let started = Instant::now();
        let result = match self.inner.call_tool(name, &parameters).await {
            Ok(raw) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(server = %self.inner.name(), tool = name, elapsed_ms, "tool call succeeded");
                ToolCallResult::succeeded(name, parameters, normalize_tool_output(raw), elapsed_ms)
            }
            Err(e) => {
                tracing::warn!(server = %self.inner.name(), tool = name, error = %e, "tool call failed");
                ToolCallResult::failed(name, parameters, &e)
            }
        };
        self.inner.record_invocation(&result);
        result
    }

    /// Run calls one after another, one result per call.
    pub async fn call_multiple_tools(&self, calls: Vec<ToolCall>) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.call_tool(&call.name, call.parameters).await);
        }
        results
    }

    pub async fn read_resource(&self, uri: &str) -> ResourceReadResult {
        match self.inner.read_resource(uri).await {
            Ok(contents) => ResourceReadResult::succeeded(uri, contents),
            Err(e) => {
                tracing::warn!(server = %self.inner.name(), uri, error = %e, "resource read failed");
                ResourceReadResult::failed(uri, &e)
            }
        }
    }

    /// Re-discover both catalogs now.
    pub async fn refresh_catalog(&self) -> Result<(), McpError> {
        self.inner.refresh_tools().await?;
        self.inner.refresh_resources().await?;
        Ok(())
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        read(&self.inner.catalog).tools().to_vec()
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        read(&self.inner.catalog).resources().to_vec()
    }

    pub fn tool_info(&self, name: &str) -> Option<ToolDescriptor> {
        read(&self.inner.catalog).tool(name).cloned()
    }

    pub fn resource_info(&self, uri: &str) -> Option<ResourceDescriptor> {
        read(&self.inner.catalog).resource(uri).cloned()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.subscribe()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready && read(&self.inner.connection).is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        let catalog = read(&self.inner.catalog);
        ConnectionStatus {
            state: self.state(),
            server: self.inner.config.server_name.clone(),
            server_path: self.inner.supervisor.describe(),
            tools: catalog.tools().len(),
            resources: catalog.resources().len(),
            tool_names: catalog.tool_names(),
            resource_uris: catalog.resource_uris(),
            pending_requests: self.inner.correlator.pending_count(),
            reconnect_attempts: self.inner.supervisor.retry_attempts(),
            max_retries: self.inner.supervisor.max_retries(),
            process_id: self.inner.supervisor.pid(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
