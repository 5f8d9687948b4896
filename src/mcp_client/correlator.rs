//! Request/response correlation.
//!
//! Every outbound request gets a fresh id and a pending entry holding the
//! completion channel. The entry is removed by exactly one of: the matching
//! response, its own expiry timer, or a teardown ([`RequestCorrelator::retire`]
//! or [`RequestCorrelator::fail_all`]). Whoever removes the entry completes
//! it, so a handle can never complete twice.
//!
//! Entries are tied to the connection generation of the writer they were
//! sent on. Once a generation is retired no request can be registered for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::errors::McpError;
use super::transport::FrameWriter;
use super::types::{InboundMessage, JsonRpcRequest, RequestId};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Completion = oneshot::Sender<Result<Value, McpError>>;

struct PendingRequest {
    method: String,
    generation: u64,
    created_at: Instant,
    completion: Completion,
    expiry: Option<AbortHandle>,
}

impl PendingRequest {
    fn complete(self, outcome: Result<Value, McpError>) {
        if let Some(expiry) = &self.expiry {
            expiry.abort();
        }
        // The caller may have stopped waiting; that is allowed.
        let _ = self.completion.send(outcome);
    }

    fn lose(self, reason: &str) {
        self.complete(Err(McpError::ConnectionLost {
            reason: reason.to_string(),
        }));
    }
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingRequest>,
    /// Every generation up to and including this one has been torn down.
    retired_through: u64,
}

/// Handle to one in-flight request.
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<Result<Value, McpError>>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the single outcome of this request.
    pub async fn wait(self) -> Result<Value, McpError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::ConnectionLost {
                reason: "request dropped before completion".into(),
            }),
        }
    }
}

/// Tracks in-flight requests for one session.
///
/// Cloning shares the same pending map.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<PendingTable>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        self.table().entries.remove(id)
    }

    /// Register and write a request, returning its completion handle.
    ///
    /// The entry exists before the frame is written, so a fast response can
    /// never miss it. If the write fails the entry is withdrawn and the write
    /// error returned instead. A writer whose generation is already retired
    /// gets `ConnectionLost` and nothing is written.
    pub async fn send(
        &self,
        writer: &FrameWriter,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingResponse, McpError> {
        let id = RequestId::generate();
        let receiver = self.register(id.clone(), writer.generation(), method, timeout)?;
        let request = JsonRpcRequest::new(id.clone(), method, params);

        tracing::debug!(request_id = %id, method, generation = writer.generation(), "sending MCP request");

        if let Err(e) = writer.write(&request).await {
            if let Some(entry) = self.take(&id) {
                if let Some(expiry) = &entry.expiry {
                    expiry.abort();
                }
            }
            return Err(e);
        }

        Ok(PendingResponse { id, receiver })
    }

    /// Send and wait in one step.
    pub async fn request(
        &self,
        writer: &FrameWriter,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.send(writer, method, params, timeout).await?.wait().await
    }

    fn register(
        &self,
        id: RequestId,
        generation: u64,
        method: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value, McpError>>, McpError> {
        let (completion, receiver) = oneshot::channel();
        {
            let mut table = self.table();
            if generation <= table.retired_through {
                return Err(McpError::ConnectionLost {
                    reason: format!("connection generation {generation} was already lost"),
                });
            }
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    generation,
                    created_at: Instant::now(),
                    completion,
                    expiry: None,
                },
            );
        }

        // Armed after insertion: a timer that fires early simply finds the
        // entry, never an empty slot that gets filled later.
        let correlator = self.clone();
        let timer_id = id.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.expire(&timer_id, timeout);
        })
        .abort_handle();

        match self.table().entries.get_mut(&id) {
            Some(entry) => entry.expiry = Some(expiry),
            None => expiry.abort(),
        }

        Ok(receiver)
    }

    fn expire(&self, id: &RequestId, timeout: Duration) {
        let Some(entry) = self.take(id) else {
            return;
        };
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(request_id = %id, method = %entry.method, timeout_ms, "MCP request timed out");
        let method = entry.method.clone();
        let _ = entry.completion.send(Err(McpError::Timeout { method, timeout_ms }));
    }

    /// Route an inbound message to its pending request.
    ///
    /// Returns the message back when no pending entry matches: it is then a
    /// notification, a server request, or a late response.
    pub fn on_message(&self, message: InboundMessage) -> Option<InboundMessage> {
        let Some(id) = message.request_id() else {
            return Some(message);
        };
        let Some(entry) = self.take(&id) else {
            return Some(message);
        };

        tracing::debug!(
            request_id = %id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            error = message.error.is_some(),
            "MCP response received"
        );
        entry.complete(message.into_outcome());
        None
    }

    /// Tear down `generation` and everything before it.
    ///
    /// Pending requests of those generations fail with `ConnectionLost`, and
    /// later sends on their writers are refused. Requests of newer
    /// generations are untouched. Returns how many requests were failed.
    pub fn retire(&self, generation: u64, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table();
            table.retired_through = table.retired_through.max(generation);
            let (lost, kept): (HashMap<_, _>, HashMap<_, _>) = std::mem::take(&mut table.entries)
                .into_iter()
                .partition(|(_, entry)| entry.generation <= generation);
            table.entries = kept;
            lost.into_values().collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.lose(reason);
        }
        count
    }

    /// Fail every pending request with a connection-lost error and refuse
    /// all further sends. Used for permanent teardown.
    ///
    /// Returns how many requests were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.retire(u64::MAX, reason)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Methods of the in-flight requests, oldest first.
    pub fn pending_methods(&self) -> Vec<String> {
        let table = self.table();
        let mut pending: Vec<(&Instant, &String)> = table
            .entries
            .values()
            .map(|e| (&e.created_at, &e.method))
            .collect();
        pending.sort_by_key(|(created, _)| **created);
        pending.into_iter().map(|(_, m)| m.clone()).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
