//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with the MCP server child process:
//! - Encoding outbound messages as single-line JSON frames
//! - Reassembling inbound frames from arbitrarily chunked stdout reads
//! - Forwarding decoded messages (and one terminal close event) to the session
//! - Relaying stderr to the log as diagnostics

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::InboundMessage;

/// Startup banner printed on stderr by the reference server; not worth logging.
pub const STARTUP_BANNER: &str = "MCP Server running";

/// Longest slice of a malformed line kept in error messages.
const MAX_LOGGED_LINE: usize = 200;

/// Read buffer size for stdout.
const READ_CHUNK: usize = 8 * 1024;

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Serialize a message into one newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Splits a byte stream into newline-delimited JSON messages.
///
/// Holds at most one incomplete trailing line between calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every message completed by it.
    ///
    /// Blank lines are skipped. A line that is not a valid message yields an
    /// `Err` entry in place and decoding carries on with the next line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<InboundMessage, McpError>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if let Some(message) = decode_line(&self.buffer[start..end]) {
                decoded.push(message);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        decoded
    }

    /// Bytes of the incomplete line currently buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<Result<InboundMessage, McpError>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(
        serde_json::from_str::<InboundMessage>(trimmed).map_err(|e| McpError::MalformedFrame {
            reason: e.to_string(),
            line: truncate_line(trimmed),
        }),
    )
}

fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LOGGED_LINE {
        return line.to_string();
    }
    let mut end = MAX_LOGGED_LINE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Boxed write half of the server's stdin.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of the server's stdout or stderr.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The single write entry point to a server's stdin.
///
/// Every frame is written and flushed under one lock, so concurrent callers
/// can never interleave partial frames.
pub struct FrameWriter {
    server_name: String,
    generation: u64,
    writer: Mutex<BoxedWriter>,
}

impl FrameWriter {
    /// `generation` is the connection attempt this stdin belongs to.
    pub fn new(server_name: &str, generation: u64, writer: BoxedWriter) -> Self {
        Self {
            server_name: server_name.to_string(),
            generation,
            writer: Mutex::new(writer),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write exactly one frame.
    pub async fn write<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let frame = encode_frame(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;

        Ok(())
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// What the stdout reader reports upstream.
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// Terminal: stdout reached EOF or failed. Sent exactly once.
    Closed { reason: String },
}

/// Pump `reader` through a [`FrameDecoder`] until EOF.
pub fn spawn_reader<R>(
    server_name: &str,
    mut reader: R,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let server = server_name.to_string();
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        let reason = loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break "server stdout closed (process may have exited)".to_string(),
                Ok(n) => n,
                Err(e) => break format!("failed to read from stdout: {e}"),
            };

            for decoded in decoder.push(&chunk[..n]) {
                match decoded {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            // Session side is gone; nobody left to report to.
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "dropping unparseable MCP frame");
                    }
                }
            }
        };

        if decoder.pending_bytes() > 0 {
            tracing::debug!(
                server = %server,
                bytes = decoder.pending_bytes(),
                "discarding incomplete trailing frame at end of stream"
            );
        }
        tracing::debug!(server = %server, %reason, "MCP transport closed");
        let _ = events.send(TransportEvent::Closed { reason });
    })
}

/// The part of a stderr line worth logging, if any.
pub fn stderr_diagnostic(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.contains(STARTUP_BANNER) {
        return None;
    }
    Some(line)
}

/// Relay server stderr lines to the log, minus the startup banner.
///
/// Returns how many lines were logged once stderr closes.
pub fn spawn_stderr_logger(server_name: &str, stderr: BoxedReader) -> JoinHandle<usize> {
    let server = server_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut logged = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(diagnostic) = stderr_diagnostic(&line) {
                        tracing::warn!(server = %server, stderr = %diagnostic, "MCP server stderr");
                        logged += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stopped reading server stderr");
                    break;
                }
            }
        }
        logged
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::{JsonRpcRequest, RequestId};
    use serde_json::json;

    const LINE: &str = r#"{"jsonrpc":"2.0","id":"req-1","result":{"tools":[]}}"#;

    #[test]
    fn test_encode_frame_single_line() {
        let req = JsonRpcRequest::new(
            RequestId::from("a"),
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "line one\nline two"}}),
        );
        let frame = encode_frame(&req).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_reassembles_line_split_across_three_chunks() {
        let bytes = format!("{LINE}\n").into_bytes();
        let (a, rest) = bytes.split_at(10);
        let (b, c) = rest.split_at(25);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(a).is_empty());
        assert!(decoder.push(b).is_empty());
        let out = decoder.push(c);
        assert_eq!(out.len(), 1);

        let mut whole = FrameDecoder::new();
        let single = whole.push(&bytes);
        assert_eq!(single.len(), 1);

        let chunked = out.into_iter().next().unwrap().unwrap();
        let direct = single.into_iter().next().unwrap().unwrap();
        assert_eq!(chunked.request_id(), direct.request_id());
        assert_eq!(chunked.result, direct.result);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_multiple_messages_in_one_chunk_keep_order() {
        let chunk = "{\"id\":\"1\",\"result\":1}\n{\"method\":\"notifications/tools/list_changed\"}\n{\"id\":\"2\",\"result\":2}\n";
        let out = FrameDecoder::new().push(chunk.as_bytes());
        assert_eq!(out.len(), 3);
        let msgs: Vec<InboundMessage> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(msgs[0].request_id(), Some(RequestId::from("1")));
        assert_eq!(msgs[1].method.as_deref(), Some("notifications/tools/list_changed"));
        assert_eq!(msgs[2].request_id(), Some(RequestId::from("2")));
    }

    #[test]
    fn test_malformed_line_is_recoverable() {
        let chunk = "not json at all\n{\"id\":\"ok\",\"result\":true}\n";
        let out = FrameDecoder::new().push(chunk.as_bytes());
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(McpError::MalformedFrame { .. })));
        assert!(out[1].is_ok());
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let chunk = "\n   \r\n{\"id\":\"x\",\"result\":0}\r\n";
        let out = FrameDecoder::new().push(chunk.as_bytes());
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[test]
    fn test_partial_line_is_retained() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push(b"{\"id\":\"1\",\"result\":1}\n{\"id\":");
        assert_eq!(out.len(), 1);
        assert_eq!(decoder.pending_bytes(), 6);
        let out = decoder.push(b"\"2\",\"result\":2}\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().request_id(), Some(RequestId::from("2")));
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let line = "{\"id\":\"u\",\"result\":\"héllo\"}\n".as_bytes().to_vec();
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&line[..split]).is_empty());
        let out = decoder.push(&line[split..]);
        assert_eq!(out[0].as_ref().unwrap().result, Some(json!("héllo")));
    }

    #[test]
    fn test_long_line_in_many_small_chunks() {
        let payload = "x".repeat(50_000);
        let line = format!("{{\"id\":\"big\",\"result\":\"{payload}\"}}\n{{\"id\":");
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in line.as_bytes().chunks(7) {
            decoded.extend(decoder.push(chunk));
        }
        assert_eq!(decoded.len(), 1);
        let message = decoded.pop().unwrap().unwrap();
        assert_eq!(message.request_id(), Some(RequestId::from("big")));
        assert_eq!(message.result, Some(json!(payload)));
        assert_eq!(decoder.pending_bytes(), 6);

        let out = decoder.push(b"\"next\",\"result\":null}\n");
        assert_eq!(out[0].as_ref().unwrap().request_id(), Some(RequestId::from("next")));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_stderr_banner_and_blank_lines_are_filtered() {
        assert_eq!(stderr_diagnostic("MCP Server running on stdio"), None);
        assert_eq!(stderr_diagnostic("   "), None);
        assert_eq!(
            stderr_diagnostic("  Error: tool crashed \n"),
            Some("Error: tool crashed")
        );
    }

    #[tokio::test]
    async fn test_stderr_logger_counts_diagnostics_until_eof() {
        let (mut server_side, client_side) = tokio::io::duplex(1024);
        let handle = spawn_stderr_logger("test", Box::new(client_side));

        server_side
            .write_all(b"MCP Server running on stdio\n\nwarning: slow disk\nfatal: oops\n")
            .await
            .unwrap();
        drop(server_side);

        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reader_emits_messages_then_single_close() {
        let (mut server_side, client_side) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_reader("test", client_side, tx);

        server_side.write_all(LINE.as_bytes()).await.unwrap();
        server_side.write_all(b"\ngarbage\n").await.unwrap();
        drop(server_side);

        match rx.recv().await {
            Some(TransportEvent::Message(msg)) => {
                assert_eq!(msg.request_id(), Some(RequestId::from("req-1")));
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed { .. })));
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_reports_broken_pipe() {
        let (client_side, server_side) = tokio::io::duplex(64);
        drop(server_side);
        let writer = FrameWriter::new("test", 1, Box::new(client_side));
        let err = writer.write(&json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }
}
