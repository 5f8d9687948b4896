//! Server process supervision.
//!
//! Owns the connection state machine for one MCP server:
//! - Spawning the server process (through a [`ServerLauncher`])
//! - Watching it for exit, and killing it on request
//! - Deciding, once per connection generation, what a loss means:
//!   schedule a reconnect after a fixed delay, or give up as `Failed`
//! - Permanent shutdown on explicit disconnect
//!
//! Every connection attempt gets a new generation number. Loss reports from
//! an older generation, or a second report for the same one, are stale and
//! ignored, so each disconnect is handled exactly once.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

use super::config::McpClientConfig;
use super::errors::McpError;
use super::transport::{BoxedReader, BoxedWriter};

// ─── Connection State ────────────────────────────────────────────────────────

/// Where a session is in its connect/reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    DiscoveringCatalog,
    Ready,
    Reconnecting,
    /// Terminal: the retry budget ran out.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::DiscoveringCatalog => "discovering_catalog",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

// ─── Retry Budget ────────────────────────────────────────────────────────────

/// Fixed-delay reconnection allowance. Reset by a successful connect.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay,
        }
    }

    /// Spend one attempt. Returns the delay to wait, or `None` when exhausted.
    pub fn try_consume(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// ─── Launching ───────────────────────────────────────────────────────────────

/// The raw streams of a freshly started server.
pub struct ServerIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// Present for real processes; in-memory servers have none.
    pub child: Option<Child>,
}

/// Starts one server instance per call.
pub trait ServerLauncher: Send + Sync {
    /// Human-readable description of what gets launched (for status output).
    fn describe(&self) -> String;

    fn launch(&self) -> Result<ServerIo, McpError>;
}

/// Launches `<runtime> <server path> [args..]` as a child process.
pub struct CommandLauncher {
    server_name: String,
    runtime: String,
    server_path: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    /// Relative server paths resolve against `working_dir`, else the current
    /// directory.
    pub fn from_config(config: &McpClientConfig) -> Self {
        let base = config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            server_name: config.server_name.clone(),
            runtime: config.runtime.clone(),
            server_path: config.server_path(&base),
            args: config.args.clone(),
            env,
            working_dir: config.working_dir.clone(),
        }
    }
}

impl ServerLauncher for CommandLauncher {
    fn describe(&self) -> String {
        self.server_path.display().to_string()
    }

    fn launch(&self) -> Result<ServerIo, McpError> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg(&self.server_path);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.server_name.clone(),
            reason: format!("{} {}: {e}", self.runtime, self.server_path.display()),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: self.server_name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: self.server_name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

        tracing::info!(
            server = %self.server_name,
            pid = child.id(),
            path = %self.server_path.display(),
            "spawned MCP server process"
        );

        Ok(ServerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
        })
    }
}

/// Streams handed to the session for one connection generation.
pub struct SpawnedServer {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    /// Resolves with a reason when the watched process exits.
    pub exited: Option<oneshot::Receiver<String>>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// What a reported connection loss turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossDecision {
    /// Already handled, superseded, or the session is closed.
    Stale,
    /// A reconnect should run after `delay`, guarded by `token`.
    Reconnect {
        token: u64,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Budget spent; the session is now `Failed`.
    Exhausted { attempts: u32 },
}

/// The process slot. Reserved by `begin_attempt`, filled by `launch`.
struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

impl LiveProcess {
    fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

struct ScheduledReconnect {
    token: u64,
    task: Option<AbortHandle>,
}

struct SupervisorInner {
    generation: u64,
    loss_handled: bool,
    live: Option<LiveProcess>,
    budget: RetryBudget,
    reconnect: Option<ScheduledReconnect>,
    next_token: u64,
    closed: bool,
}

/// Process and reconnection policy for one server.
pub struct Supervisor {
    server_name: String,
    launcher: Arc<dyn ServerLauncher>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        server_name: &str,
        launcher: Arc<dyn ServerLauncher>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            server_name: server_name.to_string(),
            launcher,
            state_tx,
            inner: Mutex::new(SupervisorInner {
                generation: 0,
                loss_handled: true,
                live: None,
                budget: RetryBudget::new(max_retries, retry_delay),
                reconnect: None,
                next_token: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(server = %self.server_name, from = %previous, to = %state, "MCP connection state");
        }
    }

    /// Start a new connection generation.
    ///
    /// Refused when the session is closed, failed, or already owns a process.
    /// A reconnect that is scheduled but not yet running is superseded.
    pub fn begin_attempt(&self) -> Result<u64, McpError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(McpError::SessionClosed {
                name: self.server_name.clone(),
            });
        }
        if *self.state_tx.borrow() == ConnectionState::Failed {
            return Err(McpError::RestartExhausted {
                name: self.server_name.clone(),
                attempts: inner.budget.attempts(),
            });
        }
        if inner.live.is_some() {
            return Err(McpError::ConnectInProgress {
                name: self.server_name.clone(),
            });
        }
        if let Some(scheduled) = inner.reconnect.take() {
            if let Some(task) = scheduled.task {
                task.abort();
            }
        }

        inner.generation += 1;
        inner.loss_handled = false;
        let generation = inner.generation;
        inner.live = Some(LiveProcess {
            generation,
            pid: None,
            kill: None,
        });
        self.set_state(ConnectionState::Connecting);
        Ok(generation)
    }

    /// Launch the server for `generation` and start watching it.
    pub fn launch(&self, generation: u64) -> Result<SpawnedServer, McpError> {
        let io = self.launcher.launch()?;

        let (pid, kill, exited) = match io.child {
            Some(child) => {
                let pid = child.id();
                let (kill_tx, exit_rx) = self.watch_process(child);
                (pid, Some(kill_tx), Some(exit_rx))
            }
            None => (None, None, None),
        };

        let mut inner = self.lock();
        let current = !inner.closed
            && inner.generation == generation
            && inner.live.as_ref().is_some_and(|l| l.generation == generation);
        if !current {
            drop(inner);
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            return Err(McpError::SessionClosed {
                name: self.server_name.clone(),
            });
        }
        if let Some(live) = inner.live.as_mut() {
            live.pid = pid;
            live.kill = kill;
        }

        Ok(SpawnedServer {
            stdin: io.stdin,
            stdout: io.stdout,
            stderr: io.stderr,
            exited,
        })
    }

    /// The watcher owns the child: it reports exit, or kills on request.
    /// Dropping the kill sender counts as a request.
    fn watch_process(&self, mut child: Child) -> (oneshot::Sender<()>, oneshot::Receiver<String>) {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<String>();
        let server = self.server_name.clone();

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let reason = match exit {
                Some(Ok(status)) => format!("MCP server process exited ({status})"),
                Some(Err(e)) => format!("failed to wait on MCP server process: {e}"),
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server = %server, error = %e, "failed to kill MCP server process");
                    }
                    "MCP server process killed".to_string()
                }
            };
            tracing::info!(server = %server, %reason, "MCP server process stopped");
            let _ = exit_tx.send(reason);
        });

        (kill_tx, exit_rx)
    }

    /// Move a still-current generation through its startup phases.
    pub fn advance(&self, generation: u64, state: ConnectionState) -> bool {
        let inner = self.lock();
        if inner.closed || inner.generation != generation || inner.loss_handled {
            return false;
        }
        self.set_state(state);
        true
    }

    /// Mark `generation` connected. Resets the retry budget.
    pub fn mark_ready(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.generation != generation || inner.loss_handled {
            return false;
        }
        inner.budget.reset();
        self.set_state(ConnectionState::Ready);
        true
    }

    /// Record that `generation` lost its connection and decide what follows.
    pub fn mark_lost(&self, generation: u64, reason: &str) -> LossDecision {
        let mut inner = self.lock();
        if inner.closed || inner.generation != generation || inner.loss_handled {
            return LossDecision::Stale;
        }
        inner.loss_handled = true;
        if let Some(live) = inner.live.take() {
            live.kill();
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(server = %self.server_name, generation, %reason, "MCP connection generation ended");

        match inner.budget.try_consume() {
            Some(delay) => {
                inner.next_token += 1;
                let token = inner.next_token;
                inner.reconnect = Some(ScheduledReconnect { token, task: None });
                self.set_state(ConnectionState::Reconnecting);
                LossDecision::Reconnect {
                    token,
                    attempt: inner.budget.attempts(),
                    max_attempts: inner.budget.max_attempts(),
                    delay,
                }
            }
            None => {
                self.set_state(ConnectionState::Failed);
                LossDecision::Exhausted {
                    attempts: inner.budget.attempts(),
                }
            }
        }
    }

    /// Attach the timer task to a scheduled reconnect so shutdown can cancel it.
    pub fn set_reconnect_handle(&self, token: u64, task: AbortHandle) {
        let mut inner = self.lock();
        if let Some(scheduled) = inner.reconnect.as_mut().filter(|s| s.token == token) {
            scheduled.task = Some(task);
        }
    }

    /// Called by the reconnect task when its delay elapses. Only the holder
    /// of the current token may proceed.
    pub fn claim_reconnect(&self, token: u64) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        match inner.reconnect.as_ref() {
            Some(scheduled) if scheduled.token == token => {
                inner.reconnect = None;
                true
            }
            _ => false,
        }
    }

    /// Permanent stop: cancel any reconnect, kill the process, refuse new
    /// attempts.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.loss_handled = true;
        if let Some(scheduled) = inner.reconnect.take() {
            if let Some(task) = scheduled.task {
                task.abort();
            }
        }
        if let Some(live) = inner.live.take() {
            live.kill();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().live.as_ref().and_then(|l| l.pid)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.lock().budget.attempts()
    }

    pub fn max_retries(&self) -> u32 {
        self.lock().budget.max_attempts()
    }

    pub fn describe(&self) -> String {
        self.launcher.describe()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
