// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 peer over stdio, for agent-host protocols that want request/
//! response/notification framing instead of the looser stream-json lines in
//! [`crate::stream_json`].
//!
//! Two methods are exposed: `prompt` (submit a user turn, block until the
//! turn ends, return the final assistant text) and `cancel` (interrupt the
//! turn currently in flight, if any). Both run over the same long-lived
//! [`sven_core::Agent`] so history accumulates across calls exactly as it
//! does for the stream-json peer.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};

use sven_bootstrap::{AgentBuilder, RuntimeContext, ToolSetProfile};
use sven_config::{AgentMode, Config};
use sven_core::{Agent, AgentEvent};
use sven_tools::events::TodoItem;

// ── Standard JSON-RPC 2.0 error codes ───────────────────────────────────────

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
/// Reserved (outside the standard range) for transport-level timeouts and
/// aborted/cancelled calls, per spec §6.
pub const TIMEOUT_OR_ABORTED: i64 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: Option<String>,
    /// Absent on a notification (fire-and-forget; no response is sent).
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }
    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code, message: message.into(), data: None }) }
    }
}

#[derive(Debug)]
pub struct RpcOptions {
    pub mode: AgentMode,
    pub model_override: Option<String>,
    pub project_root: Option<PathBuf>,
    pub append_system_prompt: Option<String>,
}

/// Run the JSON-RPC 2.0 peer until stdin closes.
///
/// Requests are handled sequentially in arrival order (the agent's history
/// is not safe to interleave across concurrent turns); `cancel` is the one
/// exception, dispatched as soon as it is read regardless of whatever
/// `prompt` call is in flight, via the shared `active_cancel` slot.
pub async fn run(config: Arc<Config>, opts: RpcOptions) -> anyhow::Result<()> {
    let model_cfg = match &opts.model_override {
        Some(name) => sven_model::resolve_model_from_config(&config, name),
        None => config.model.clone(),
    };
    let model = sven_model::from_config(&model_cfg)
        .context("failed to initialise model provider")?;
    let model: Arc<dyn sven_model::ModelProvider> = Arc::from(model);

    let runtime_ctx = RuntimeContext {
        project_root: opts.project_root.clone(),
        git_context: opts.project_root.as_ref().map(|r| sven_runtime::collect_git_context(r)),
        ci_context: Some(sven_runtime::detect_ci_context()),
        project_context_file: opts
            .project_root
            .as_ref()
            .and_then(|r| sven_runtime::load_project_context_file(r)),
        append_system_prompt: opts.append_system_prompt.clone(),
        system_prompt_override: None,
    };

    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
    let task_depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let profile = ToolSetProfile::Full { question_tx: None, todos, task_depth };

    let session_cwd = opts
        .project_root
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();

    let agent = AgentBuilder::new(config.clone())
        .with_runtime_context(runtime_ctx)
        .build_with_session_log(opts.mode, model, profile, &session_cwd, "rpc");
    let agent = Arc::new(Mutex::new(agent));

    let active_cancel: Arc<Mutex<Option<oneshot::Sender<()>>>> = Arc::new(Mutex::new(None));
    let shutting_down = Arc::new(AtomicBool::new(false));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if line_tx.blocking_send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                emit(&RpcResponse::err(Value::Null, INVALID_REQUEST, format!("parse error: {e}")));
                continue;
            }
        };
        if req.jsonrpc.as_deref() != Some("2.0") {
            if let Some(id) = req.id.clone() {
                emit(&RpcResponse::err(id, INVALID_REQUEST, "missing or wrong \"jsonrpc\" version"));
            }
            continue;
        }

        match req.method.as_str() {
            "prompt" => {
                let id = req.id.unwrap_or(Value::Null);
                let text = match req.params.get("text").and_then(Value::as_str) {
                    Some(t) => t.to_string(),
                    None => {
                        emit(&RpcResponse::err(id, INVALID_REQUEST, "params.text must be a string"));
                        continue;
                    }
                };
                let result = handle_prompt(&agent, &active_cancel, &text).await;
                match result {
                    Ok(value) => emit(&RpcResponse::ok(id, value)),
                    Err(RpcFailure::Aborted) => emit(&RpcResponse::err(id, TIMEOUT_OR_ABORTED, "turn was cancelled")),
                    Err(RpcFailure::Internal(msg)) => emit(&RpcResponse::err(id, INTERNAL_ERROR, msg)),
                }
            }
            "cancel" => {
                let had_active = active_cancel.lock().await.take();
                let cancelled = if let Some(tx) = had_active {
                    tx.send(()).is_ok()
                } else {
                    false
                };
                if let Some(id) = req.id {
                    emit(&RpcResponse::ok(id, serde_json::json!({ "cancelled": cancelled })));
                }
            }
            "shutdown" => {
                shutting_down.store(true, Ordering::SeqCst);
                if let Some(id) = req.id {
                    emit(&RpcResponse::ok(id, serde_json::json!({ "ok": true })));
                }
            }
            other => {
                if let Some(id) = req.id {
                    emit(&RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method: {other}")));
                }
            }
        }
    }

    Ok(())
}

enum RpcFailure {
    Aborted,
    Internal(String),
}

async fn handle_prompt(
    agent: &Arc<Mutex<Agent>>,
    active_cancel: &Arc<Mutex<Option<oneshot::Sender<()>>>>,
    text: &str,
) -> Result<Value, RpcFailure> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    *active_cancel.lock().await = Some(cancel_tx);

    let mut agent = agent.lock().await;
    let submit_fut = agent.submit_with_cancel(text, tx, cancel_rx);
    tokio::pin!(submit_fut);

    let mut final_text = String::new();
    let mut aborted = false;
    let mut tool_calls = 0u32;

    loop {
        tokio::select! {
            biased;
            Some(event) = rx.recv() => match event {
                AgentEvent::TextComplete(t) => final_text = t,
                AgentEvent::Aborted { partial_text } => {
                    aborted = true;
                    final_text = partial_text;
                }
                AgentEvent::ToolCallFinished { .. } => tool_calls += 1,
                _ => {}
            },
            result = &mut submit_fut => {
                if let Err(e) = result {
                    *active_cancel.lock().await = None;
                    return Err(RpcFailure::Internal(e.to_string()));
                }
                while let Ok(ev) = rx.try_recv() {
                    if let AgentEvent::TextComplete(t) = ev {
                        final_text = t;
                    }
                }
                break;
            }
        }
    }
    *active_cancel.lock().await = None;

    if aborted {
        return Err(RpcFailure::Aborted);
    }
    Ok(serde_json::json!({ "text": final_text, "tool_calls": tool_calls }))
}

fn emit(response: &RpcResponse) {
    let line = serde_json::to_string(response).unwrap_or_else(|e| {
        format!("{{\"jsonrpc\":\"2.0\",\"id\":null,\"error\":{{\"code\":{INTERNAL_ERROR},\"message\":\"serialization failed: {e}\"}}}}")
    });
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{line}");
    let _ = lock.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_request() {
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"prompt","params":{"text":"hi"}}"#;
        let req: RpcRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.method, "prompt");
        assert_eq!(req.id, Some(Value::from(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let line = r#"{"jsonrpc":"2.0","method":"cancel"}"#;
        let req: RpcRequest = serde_json::from_str(line).unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn error_response_serializes_with_standard_fields() {
        let resp = RpcResponse::err(Value::from(1), METHOD_NOT_FOUND, "unknown method: foo");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(v["jsonrpc"], "2.0");
    }
}
