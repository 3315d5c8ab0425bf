//! JSON-RPC over stdio transport.
//!
//! Writes newline-terminated requests to the server's stdin and reads framed
//! messages from its stdout until the response with the matching `id`
//! arrives. Anything else on stdout (notifications, log output, responses
//! to other ids) is ignored.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::framing::MessageDecoder;
use super::process::{BoxedReader, BoxedWriter};
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

struct ReadHalf {
    stdout: BoxedReader,
    decoder: MessageDecoder,
}

/// Bi-directional JSON-RPC transport over a server's stdio pipes.
pub struct StdioTransport {
    server: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<ReadHalf>,
}

impl StdioTransport {
    pub fn new(server: &str, stdin: BoxedWriter, stdout: BoxedReader) -> Self {
        Self {
            server: server.to_string(),
            writer: Mutex::new(Some(stdin)),
            reader: Mutex::new(ReadHalf {
                stdout,
                decoder: MessageDecoder::new(),
            }),
        }
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_value(&req).map_err(|e| self.error(format!(
            "failed to serialize request: {e}"
        )))?;
        self.write_line(&json).await?;

        let mut reader = self.reader.lock().await;
        let mut chunk = [0u8; 8192];
        loop {
            while let Some(message) = reader.decoder.next_message() {
                match serde_json::from_value::<JsonRpcResponse>(message) {
                    Ok(resp) if resp.id == id => return Ok(resp),
                    Ok(resp) => {
                        tracing::trace!(server = %self.server, id = resp.id, "skipping unrelated response");
                    }
                    Err(_) => {
                        tracing::trace!(server = %self.server, "skipping non-response message");
                    }
                }
            }

            let n = reader
                .stdout
                .read(&mut chunk)
                .await
                .map_err(|e| self.error(format!("failed to read from stdout: {e}")))?;
            if n == 0 {
                return Err(self.error("server stdout closed (process may have exited)".into()));
            }
            reader.decoder.push(&chunk[..n]);
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.write_line(&notification).await
    }

    /// Close stdin, signalling the server to exit. Idempotent.
    pub async fn close_stdin(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_line(&self, message: &serde_json::Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| self.error(format!("failed to serialize message: {e}")))?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.error("stdin already closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    fn error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
