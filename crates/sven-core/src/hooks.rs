// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Hook Dispatcher: runs external handler processes around tool execution
//! and session start, interpreting their stdout/exit-code contract.
//!
//! Grounded on `sven-tools::builtin::run_terminal_command`'s
//! `tokio::process::Command` + `tokio::time::timeout` idiom — hooks are just
//! another externally-run command, with a stricter stdin/stdout contract.
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Which lifecycle point a hook fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    SessionStart,
}

impl HookEvent {
    fn wire_name(self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::SessionStart => "SessionStart",
        }
    }
}

/// One registered hook: an event, a tool-name matcher, and the command to run.
#[derive(Debug, Clone)]
pub struct HookSpec {
    pub event: HookEvent,
    /// Regex matched against the tool name (pipe-alternation is common,
    /// e.g. `"Write|Edit"`). `None` matches every tool.
    pub matcher: Option<Regex>,
    pub command: String,
    pub timeout_secs: u64,
}

impl HookSpec {
    pub fn new(event: HookEvent, command: impl Into<String>) -> Self {
        Self { event, matcher: None, command: command.into(), timeout_secs: 30 }
    }

    pub fn with_matcher(mut self, pattern: &str) -> Option<Self> {
        self.matcher = Some(Regex::new(pattern).ok()?);
        Some(self)
    }

    fn matches_tool(&self, tool_name: &str) -> bool {
        self.matcher.as_ref().map(|re| re.is_match(tool_name)).unwrap_or(true)
    }
}

/// The input payload delivered to a hook on stdin.
#[derive(Debug, Clone, Serialize)]
pub struct HookInput {
    pub session_id: String,
    pub cwd: String,
    pub hook_event_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct HookOutput {
    #[serde(default)]
    #[serde(rename = "hookSpecificOutput")]
    hook_specific_output: Option<HookSpecificOutput>,
    #[serde(default)]
    #[serde(rename = "systemMessage")]
    system_message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HookSpecificOutput {
    #[serde(default)]
    #[serde(rename = "permissionDecision")]
    permission_decision: Option<String>,
    #[serde(default)]
    #[serde(rename = "updatedInput")]
    updated_input: Option<Value>,
    #[serde(default)]
    #[serde(rename = "additionalContext")]
    additional_context: Option<String>,
}

/// The dispatcher's verdict for one hook invocation, already collapsing the
/// stdout-JSON / exit-code precedence of spec §4.3.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    /// Proceed normally. Carries an optional replacement input (from a JSON
    /// `allow` decision's `updatedInput`) and optional additional context to
    /// surface to the user or fold into the system prompt.
    Allow { updated_input: Option<Value>, additional_context: Option<String> },
    /// Proceed, but surface `message` as a user-visible warning (exit code 1
    /// or an unrecognized non-zero code).
    Warn { message: String },
    /// Block the tool call entirely; `message` becomes the error Tool-Result
    /// content.
    Block { message: String },
}

impl HookDecision {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }
}

/// Dispatches hooks registered across project/user/policy/plugin sources.
#[derive(Debug, Clone, Default)]
pub struct HookDispatcher {
    specs: Vec<HookSpec>,
}

impl HookDispatcher {
    pub fn new(specs: Vec<HookSpec>) -> Self {
        Self { specs }
    }

    pub fn register(&mut self, spec: HookSpec) {
        self.specs.push(spec);
    }

    fn matching(&self, event: HookEvent, tool_name: Option<&str>) -> impl Iterator<Item = &HookSpec> {
        self.specs.iter().filter(move |s| {
            s.event == event && tool_name.map(|n| s.matches_tool(n)).unwrap_or(true)
        })
    }

    /// Run every hook registered for `event`/`tool_name` in registration
    /// order, short-circuiting on the first `Block`. `env_file` receives
    /// any `KEY=VALUE` lines a hook writes so the caller can export them —
    /// applied before the permission decision is evaluated, per the recorded
    /// env-file-then-decision ordering.
    pub async fn dispatch(
        &self,
        event: HookEvent,
        input: &HookInput,
        env_file: &mut HashMap<String, String>,
    ) -> HookDecision {
        let mut additional_context = String::new();
        for spec in self.matching(event, input.tool_name.as_deref()) {
            match run_one(spec, input, env_file).await {
                HookDecision::Block { message } => return HookDecision::Block { message },
                HookDecision::Warn { message } => return HookDecision::Warn { message },
                HookDecision::Allow { updated_input, additional_context: ctx } => {
                    if let Some(ctx) = ctx {
                        if !additional_context.is_empty() {
                            additional_context.push('\n');
                        }
                        additional_context.push_str(&ctx);
                    }
                    if updated_input.is_some() {
                        return HookDecision::Allow {
                            updated_input,
                            additional_context: Some(additional_context).filter(|s| !s.is_empty()),
                        };
                    }
                }
            }
        }
        HookDecision::Allow {
            updated_input: None,
            additional_context: Some(additional_context).filter(|s| !s.is_empty()),
        }
    }
}

async fn run_one(
    spec: &HookSpec,
    input: &HookInput,
    env_file: &mut HashMap<String, String>,
) -> HookDecision {
    let payload = serde_json::json!({
        "session_id": input.session_id,
        "cwd": input.cwd,
        "hook_event_name": spec.event.wire_name(),
        "tool_name": input.tool_name,
        "tool_use_id": input.tool_use_id,
        "tool_input": input.tool_input,
    });
    let stdin_json = match serde_json::to_vec(&payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize hook stdin payload");
            return HookDecision::Warn { message: format!("hook payload error: {e}") };
        }
    };

    let env_file_path = std::env::temp_dir().join(format!("sven-hook-env-{}.txt", uuid::Uuid::new_v4()));
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .env("CLAUDE_ENV_FILE", &env_file_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(command = %spec.command, error = %e, "hook failed to spawn");
            return HookDecision::Warn { message: format!("hook exec failed: {e}") };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&stdin_json).await {
            tracing::warn!(error = %e, "failed to write hook stdin");
        }
    }

    let result = tokio::time::timeout(Duration::from_secs(spec.timeout_secs), child.wait_with_output()).await;

    let output = match result {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => {
            tracing::warn!(command = %spec.command, error = %e, "hook process error");
            return HookDecision::Warn { message: format!("hook process error: {e}") };
        }
        Err(_) => {
            tracing::warn!(command = %spec.command, "hook timed out after {}s", spec.timeout_secs);
            return HookDecision::Warn { message: format!("hook timed out after {}s", spec.timeout_secs) };
        }
    };

    if let Ok(contents) = tokio::fs::read_to_string(&env_file_path).await {
        for line in contents.lines() {
            if let Some((k, v)) = line.split_once('=') {
                env_file.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    let _ = tokio::fs::remove_file(&env_file_path).await;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if let Ok(parsed) = serde_json::from_str::<HookOutput>(stdout.trim()) {
        if let Some(hso) = &parsed.hook_specific_output {
            match hso.permission_decision.as_deref() {
                Some("deny") => {
                    return HookDecision::Block {
                        message: parsed.system_message.clone().unwrap_or_else(|| "blocked by hook".into()),
                    };
                }
                Some("allow") => {
                    return HookDecision::Allow {
                        updated_input: hso.updated_input.clone(),
                        additional_context: hso.additional_context.clone(),
                    };
                }
                _ => {}
            }
        }
        if let Some(ctx) = parsed.hook_specific_output.as_ref().and_then(|h| h.additional_context.clone()) {
            return HookDecision::Allow { updated_input: None, additional_context: Some(ctx) };
        }
    }

    match output.status.code() {
        Some(0) | None => HookDecision::Allow { updated_input: None, additional_context: None },
        Some(2) => HookDecision::Block { message: if stderr.is_empty() { "blocked by hook".into() } else { stderr } },
        Some(_) => HookDecision::Warn { message: if stderr.is_empty() { "hook warning".into() } else { stderr } },
    }
}
