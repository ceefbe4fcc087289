//! Minimal `Content-Length` framed JSON-RPC server over stdio.
//!
//! Used as the child process in the stdio transport's integration tests and
//! handy for poking at the transport by hand. Methods:
//!
//! - `ping` → `"pong"`
//! - `echo` → the request params
//! - `sleep {"ms": N}` → `{"slept": N}` after N milliseconds (replies interleave)
//! - `notify` → emits a `notifications/message` notification, then `"ok"`
//! - `stderr {"message": ...}` → writes the message to stderr, then `"ok"`
//! - `fail {"code", "message"}` → a JSON-RPC error response
//! - `crash {"code": N}` → exits immediately with status N (default 3)
//!
//! The `exit` notification or EOF on stdin stops the server.

use std::time::Duration;

use agents_jsonrpc::protocol::error_codes;
use agents_jsonrpc::{
    encode_frame, FrameParser, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
};
use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type Outbox = mpsc::UnboundedSender<JsonRpcMessage>;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries frames, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let (outbox, mut rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let frame = encode_frame(&message)?;
            stdout.write_all(&frame).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut stdin = tokio::io::stdin();
    let mut parser = FrameParser::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let n = stdin.read(&mut chunk).await?;
        if n == 0 {
            info!("stdin closed, exiting");
            return Ok(());
        }
        for parsed in parser.push(&chunk[..n]) {
            match parsed {
                Ok(JsonRpcMessage::Request(request)) => {
                    tokio::spawn(handle(request, outbox.clone()));
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    if notification.method == "exit" {
                        info!("exit notification received");
                        return Ok(());
                    }
                    debug!(method = %notification.method, "ignoring notification");
                }
                Ok(JsonRpcMessage::Response(response)) => {
                    debug!(id = ?response.id, "ignoring response");
                }
                Err(e) => warn!(error = %e, "undecodable frame"),
            }
        }
    }
}

async fn handle(request: JsonRpcRequest, outbox: Outbox) {
    let params = request.params.unwrap_or(Value::Null);
    let outcome = match request.method.as_str() {
        "ping" => Ok(json!("pong")),
        "echo" => Ok(params),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        }
        "notify" => {
            let _ = outbox.send(JsonRpcMessage::notification(
                "notifications/message",
                Some(params),
            ));
            Ok(json!("ok"))
        }
        "stderr" => {
            let line = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("stderr output");
            eprintln!("{}", line);
            Ok(json!("ok"))
        }
        "fail" => Err(JsonRpcError::new(
            params.get("code").and_then(Value::as_i64).unwrap_or(-32000),
            params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed"),
        )),
        "crash" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(3) as i32;
            std::process::exit(code);
        }
        other => Err(JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        )),
    };

    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(request.id, result),
        Err(error) => JsonRpcResponse::failure(Some(request.id), error),
    };
    let _ = outbox.send(JsonRpcMessage::Response(response));
}
