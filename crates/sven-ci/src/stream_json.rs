// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream-JSON stdio protocol: one JSON object per line in each direction.
//!
//! This is the wire format a host process speaks to drive sven as a
//! subprocess instead of through the CI markdown runner: `user` lines carry
//! new turns, `control_request{interrupt}` aborts the active one, and sven
//! emits `system/init`, `assistant`, `control_response` and terminal `result`
//! lines back. Unlike [`crate::runner::CiRunner`] this mode is interactive —
//! it keeps reading `user` lines for the lifetime of the process rather than
//! draining a fixed step queue.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use sven_bootstrap::{AgentBuilder, RuntimeContext, ToolSetProfile};
use sven_config::{AgentMode, Config};
use sven_core::AgentEvent;
use sven_model::ContentPart;
use sven_tools::events::TodoItem;

/// Options for the stream-json peer, analogous to [`crate::runner::CiOptions`]
/// but for the long-lived interactive protocol.
#[derive(Debug)]
pub struct StreamJsonOptions {
    pub mode: AgentMode,
    pub model_override: Option<String>,
    pub project_root: Option<PathBuf>,
    pub append_system_prompt: Option<String>,
    pub system_prompt_file: Option<PathBuf>,
}

/// Incoming line shapes accepted on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IncomingLine {
    User {
        uuid: Option<String>,
        message: IncomingUserMessage,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
}

#[derive(Debug, Deserialize)]
struct IncomingUserMessage {
    #[allow(dead_code)]
    role: Option<String>,
    content: IncomingContent,
}

/// `content` may be a plain string or an array of content-part objects,
/// mirroring the Anthropic message content union.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IncomingContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Interrupt,
}

/// Run the stream-json peer: read lines from stdin, write lines to stdout,
/// until stdin closes.
pub async fn run(config: Arc<Config>, opts: StreamJsonOptions) -> anyhow::Result<()> {
    let model_cfg = match &opts.model_override {
        Some(name) => sven_model::resolve_model_from_config(&config, name),
        None => config.model.clone(),
    };
    let model = sven_model::from_config(&model_cfg)
        .context("failed to initialise model provider")?;
    let model: Arc<dyn sven_model::ModelProvider> = Arc::from(model);

    let mut runtime_ctx = RuntimeContext {
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
    if let Some(sp_file) = &opts.system_prompt_file {
        runtime_ctx.system_prompt_override =
            Some(std::fs::read_to_string(sp_file).with_context(|| {
                format!("failed to read --system-prompt-file {}", sp_file.display())
            })?);
    }

    let todos: Arc<tokio::sync::Mutex<Vec<TodoItem>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let task_depth = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let profile = ToolSetProfile::Full { question_tx: None, todos, task_depth };

    let session_cwd = opts
        .project_root
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();

    let mut agent = AgentBuilder::new(config.clone())
        .with_runtime_context(runtime_ctx)
        .build_with_session_log(opts.mode, model.clone(), profile, &session_cwd, "stream-json");

    let session_id = agent.session().id.clone();

    emit(&json_system_init(
        &session_id,
        &session_cwd,
        &model_cfg.name,
        &agent.tools().names_for_mode(opts.mode),
    ));

    // Incoming stdin lines are read on a blocking thread and forwarded over a
    // channel so the async loop can select between a new line arriving and
    // the active turn's event stream without blocking either.
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

    // Active turn's interrupt channel, present only while a submit is running.
    let mut active_cancel: Option<oneshot::Sender<()>> = None;

    while let Some(line) = line_rx.recv().await {
        let parsed: IncomingLine = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                emit(&serde_json::json!({
                    "type": "result",
                    "subtype": "error_during_execution",
                    "is_error": true,
                    "session_id": session_id,
                    "error": format!("malformed input line: {e}"),
                }));
                continue;
            }
        };

        match parsed {
            IncomingLine::ControlRequest { request_id, request } => match request {
                ControlRequestBody::Interrupt => {
                    if let Some(tx) = active_cancel.take() {
                        let _ = tx.send(());
                    }
                    emit(&serde_json::json!({
                        "type": "control_response",
                        "response": { "subtype": "success", "request_id": request_id },
                    }));
                }
            },
            IncomingLine::User { uuid, message } => {
                let user_uuid = uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
                let text_for_echo = match &message.content {
                    IncomingContent::Text(t) => t.clone(),
                    IncomingContent::Parts(parts) => serde_json::Value::Array(parts.clone()).to_string(),
                };
                emit(&serde_json::json!({
                    "type": "user",
                    "uuid": user_uuid,
                    "message": { "role": "user", "content": text_for_echo },
                }));

                let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
                let (cancel_tx, cancel_rx) = oneshot::channel();
                active_cancel = Some(cancel_tx);

                // Cancellable submission only has a plain-text entry point
                // today; image parts in a stream-json user turn are dropped
                // with a warning rather than silently mis-rendered as text.
                let input_text = flatten_to_text(message.content);
                let submit_fut = agent.submit_with_cancel(&input_text, tx, cancel_rx);

                let start = Instant::now();
                let mut num_turns = 0u32;
                let mut hit_max_turns = false;
                let mut saw_error = false;
                let mut aborted = false;

                tokio::pin!(submit_fut);
                loop {
                    tokio::select! {
                        biased;
                        Some(event) = rx.recv() => {
                            match &event {
                                AgentEvent::ToolCallFinished { .. } => num_turns += 1,
                                AgentEvent::MaxTurnsReached => hit_max_turns = true,
                                AgentEvent::Error(_) => saw_error = true,
                                AgentEvent::Aborted { .. } => aborted = true,
                                _ => {}
                            }
                            if let Some(line) = render_assistant_event(&event, &session_id) {
                                emit(&line);
                            }
                        }
                        result = &mut submit_fut => {
                            if let Err(e) = result {
                                saw_error = true;
                                tracing::warn!(error = %e, "submit failed");
                            }
                            while let Ok(ev) = rx.try_recv() {
                                if let Some(line) = render_assistant_event(&ev, &session_id) {
                                    emit(&line);
                                }
                            }
                            break;
                        }
                    }
                }
                active_cancel = None;
                num_turns += 1; // the final (tool-free) assistant round

                let subtype = if aborted {
                    "error_during_execution"
                } else if hit_max_turns {
                    "error_max_turns"
                } else if saw_error {
                    "error_during_execution"
                } else {
                    "success"
                };
                let duration_ms = start.elapsed().as_millis() as u64;
                emit(&serde_json::json!({
                    "type": "result",
                    "subtype": subtype,
                    "is_error": subtype != "success",
                    "num_turns": num_turns,
                    "total_cost_usd": 0.0,
                    "duration_ms": duration_ms,
                    "duration_api_ms": duration_ms,
                    "session_id": session_id,
                }));
            }
        }
    }

    Ok(())
}

/// Collapse an incoming `content` value down to plain text. Image parts are
/// dropped; a multi-part message's text parts are joined with newlines.
fn flatten_to_text(content: IncomingContent) -> String {
    match content {
        IncomingContent::Text(t) => t,
        IncomingContent::Parts(values) => values
            .into_iter()
            .filter_map(|v| serde_json::from_value::<ContentPart>(v).ok())
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text),
                ContentPart::Image { .. } => {
                    tracing::warn!("dropping image content part from stream-json user turn");
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Translate one [`AgentEvent`] into an outgoing stream-json line, if it maps
/// to one. Streaming deltas (`TextDelta`/`ThinkingDelta`) have no line of
/// their own here; only the completed block is emitted, matching the
/// `assistant` message shape in spec §6 (one message per content block
/// rather than one per delta).
fn render_assistant_event(event: &AgentEvent, session_id: &str) -> Option<serde_json::Value> {
    let block = match event {
        AgentEvent::TextComplete(text) if !text.is_empty() => {
            serde_json::json!({ "type": "text", "text": text })
        }
        AgentEvent::ThinkingComplete(text) => {
            serde_json::json!({ "type": "thinking", "thinking": text })
        }
        AgentEvent::ToolCallStarted(tc) => {
            serde_json::json!({ "type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.args })
        }
        AgentEvent::ToolCallFinished { call_id, output, is_error, .. } => {
            serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": output,
                "is_error": is_error,
            })
        }
        _ => return None,
    };
    Some(serde_json::json!({
        "type": "assistant",
        "uuid": Uuid::new_v4().to_string(),
        "session_id": session_id,
        "message": { "role": "assistant", "content": [block] },
    }))
}

fn json_system_init(session_id: &str, cwd: &std::path::Path, model: &str, tools: &[String]) -> serde_json::Value {
    serde_json::json!({
        "type": "system",
        "subtype": "init",
        "session_id": session_id,
        "cwd": cwd.display().to_string(),
        "model": model,
        "tools": tools,
    })
}

fn emit(value: &serde_json::Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|e| {
        format!("{{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"is_error\":true,\"error\":\"serialization failed: {e}\"}}")
    });
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{line}");
    let _ = lock.flush();
}
