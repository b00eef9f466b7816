// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool Scheduler: generalizes the teacher's `Agent::run_agentic_loop`
//! "Phase 2" block (which unconditionally `tokio::spawn`s every tool call in
//! full parallel, with no ordering, permission, or hook semantics) into the
//! state machine of spec §4.4 — concurrency classification, a barrier for
//! non-concurrency-safe calls, Permission Engine + Hook Dispatcher as
//! explicit pre-execution phases, and synthesized aborted/error results on
//! cancellation.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use sven_tools::{Decision, PermissionContext, Suggestion, ToolCall, ToolOutput, ToolRegistry};

use crate::hooks::{HookDispatcher, HookEvent, HookInput};

/// The answer to an `Ask` permission decision. Implemented by whatever
/// surface collects user input (a TUI prompt, a CI `--yes` flag, a
/// programmatic policy). The default implementation used when an `Agent`
/// isn't given one explicitly auto-approves every ask, matching the
/// teacher's historical behavior of running every tool unconditionally.
#[async_trait]
pub trait CanUseTool: Send + Sync {
    async fn ask(&self, call: &ToolCall, reason: &str, suggestions: &[Suggestion]) -> AskReply;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AskReply {
    Allow,
    AllowWithSuggestions(Vec<Suggestion>),
    Deny(String),
}

/// Auto-approves every `Ask`. The scheduler's default policy.
pub struct AutoApprove;

#[async_trait]
impl CanUseTool for AutoApprove {
    async fn ask(&self, _call: &ToolCall, _reason: &str, _suggestions: &[Suggestion]) -> AskReply {
        AskReply::Allow
    }
}

/// Auto-denies every `Ask`. Useful for read-only/CI review sessions that
/// want the Permission Engine's `DontAsk` semantics without configuring it.
pub struct AutoDeny;

#[async_trait]
impl CanUseTool for AutoDeny {
    async fn ask(&self, _call: &ToolCall, reason: &str, _suggestions: &[Suggestion]) -> AskReply {
        AskReply::Deny(reason.to_string())
    }
}

/// One tool call's result, paired with the id it resolves so callers can
/// match it back against the originating `ToolCall` list.
#[derive(Debug, Clone)]
pub struct ScheduledResult {
    pub call_id: String,
    pub output: ToolOutput,
}

/// The outcome of running one scheduling epoch (one Assistant message's
/// worth of ToolUse blocks).
///
/// Per spec §5/§9, concurrency-safe results are emitted in completion
/// order, not block order — only the non-concurrency-safe barrier calls are
/// guaranteed to appear in block order (they run one at a time, each after
/// every prior in-flight call has drained). `results` reflects that: it is
/// NOT indexed by `tool_calls` position. Every id is still resolved exactly
/// once (invariant 4); callers that need to look a specific id up should
/// search by `call_id` rather than assume position.
#[derive(Debug, Clone)]
pub struct EpochOutcome {
    pub results: Vec<ScheduledResult>,
    /// Set once the cancellation signal fired during this epoch.
    pub cancelled: bool,
}

/// Shared context a scheduling epoch needs: the tool registry, permission
/// state, hook dispatcher, and the callback used to resolve `Ask` decisions.
pub struct SchedulerContext {
    pub registry: Arc<ToolRegistry>,
    pub permissions: Arc<Mutex<PermissionContext>>,
    pub hooks: Arc<HookDispatcher>,
    pub can_use_tool: Arc<dyn CanUseTool>,
    pub session_id: String,
    pub cwd: String,
}

impl SchedulerContext {
    pub fn new(registry: Arc<ToolRegistry>, permissions: Arc<Mutex<PermissionContext>>) -> Self {
        Self {
            registry,
            permissions,
            hooks: Arc::new(HookDispatcher::default()),
            can_use_tool: Arc::new(AutoApprove),
            session_id: String::new(),
            cwd: String::new(),
        }
    }
}

fn aborted(call_id: &str) -> ToolOutput {
    ToolOutput::err(call_id, "tool execution cancelled")
}

/// Queued → PermissionCheck → PreToolUseHook, producing either a resolved
/// `ToolOutput` (the call is finished without running — denied, blocked, or
/// rejected) or the possibly-updated `ToolCall` to actually execute.
async fn admit(call: &ToolCall, ctx: &SchedulerContext) -> Result<ToolCall, ToolOutput> {
    let decision = ctx.permissions.lock().await.check(&call.name, call);
    let mut effective = call.clone();
    match decision {
        Decision::Allow => {}
        Decision::Deny(reason) => {
            return Err(ToolOutput::err(&call.id, format!("denied: {reason}")));
        }
        Decision::Ask(reason, suggestions) => match ctx.can_use_tool.ask(call, &reason, &suggestions).await {
            AskReply::Allow => {}
            AskReply::AllowWithSuggestions(applied) => {
                let mut perms = ctx.permissions.lock().await;
                for s in applied {
                    perms.apply_suggestion(s);
                }
            }
            AskReply::Deny(reason) => {
                return Err(ToolOutput::err(&call.id, format!("rejected: {reason}")));
            }
        },
    }

    let hook_input = HookInput {
        session_id: ctx.session_id.clone(),
        cwd: ctx.cwd.clone(),
        hook_event_name: "PreToolUse".into(),
        tool_name: Some(call.name.clone()),
        tool_use_id: Some(call.id.clone()),
        tool_input: Some(call.args.clone()),
    };
    let mut scratch_env = HashMap::new();
    match ctx.hooks.dispatch(HookEvent::PreToolUse, &hook_input, &mut scratch_env).await {
        crate::hooks::HookDecision::Block { message } => {
            return Err(ToolOutput::err(&call.id, message));
        }
        crate::hooks::HookDecision::Warn { message } => {
            warn!(tool = %call.name, call_id = %call.id, "PreToolUse hook warning: {message}");
        }
        crate::hooks::HookDecision::Allow { updated_input, .. } => {
            if let Some(input) = updated_input {
                effective.args = input;
            }
        }
    }

    Ok(effective)
}

/// Run PostToolUse hooks after a tool executes. A `Block` decision can't
/// undo the side effect already performed, so it downgrades the result to
/// an error carrying the hook's message; a `Warn` is only logged.
async fn post_hook(call: &ToolCall, output: ToolOutput, ctx: &SchedulerContext) -> ToolOutput {
    let hook_input = HookInput {
        session_id: ctx.session_id.clone(),
        cwd: ctx.cwd.clone(),
        hook_event_name: "PostToolUse".into(),
        tool_name: Some(call.name.clone()),
        tool_use_id: Some(call.id.clone()),
        tool_input: Some(call.args.clone()),
    };
    let mut scratch_env = HashMap::new();
    match ctx.hooks.dispatch(HookEvent::PostToolUse, &hook_input, &mut scratch_env).await {
        crate::hooks::HookDecision::Block { message } => {
            ToolOutput::err(&call.id, format!("{message}\n\n[original output]\n{}", output.content))
        }
        crate::hooks::HookDecision::Warn { message } => {
            warn!(tool = %call.name, call_id = %call.id, "PostToolUse hook warning: {message}");
            output
        }
        crate::hooks::HookDecision::Allow { .. } => output,
    }
}

/// Run one scheduling epoch over every ToolUse block in an Assistant
/// message, honoring the concurrency policy, the Permission Engine, the
/// Hook Dispatcher, and cooperative cancellation.
pub async fn run_epoch(
    tool_calls: &[ToolCall],
    ctx: &SchedulerContext,
    cancel: &mut tokio::sync::oneshot::Receiver<()>,
    grace: Duration,
) -> EpochOutcome {
    let mut results: Vec<ScheduledResult> = Vec::with_capacity(tool_calls.len());
    let mut in_flight: Vec<(String, tokio::task::JoinHandle<ToolOutput>)> = Vec::new();
    let mut cancelled = false;

    for call in tool_calls {
        if !cancelled {
            if let Ok(()) | Err(tokio::sync::oneshot::error::TryRecvError::Closed) = cancel.try_recv() {
                cancelled = true;
            }
        }

        if cancelled {
            results.push(ScheduledResult { call_id: call.id.clone(), output: aborted(&call.id) });
            continue;
        }

        let tool = ctx.registry.get(&call.name);
        let read_only = tool.as_ref().map(|t| t.read_only(call)).unwrap_or(false);
        let concurrency_safe = tool.as_ref().map(|t| t.concurrency_safe(call)).unwrap_or(read_only);

        if !concurrency_safe {
            // Barrier: drain every in-flight task (in completion order)
            // before running this one alone, so it observes every earlier
            // concurrency-safe call's side effects.
            results.extend(drain(&mut in_flight, grace).await);
        }

        let effective = match admit(call, ctx).await {
            Ok(c) => c,
            Err(output) => {
                results.push(ScheduledResult { call_id: call.id.clone(), output });
                continue;
            }
        };

        let registry = Arc::clone(&ctx.registry);
        let call_for_post = effective.clone();
        let ctx_session = ctx.session_id.clone();
        let ctx_cwd = ctx.cwd.clone();
        let hooks = Arc::clone(&ctx.hooks);
        let handle = tokio::spawn(async move {
            let output = registry.execute(&call_for_post).await;
            let post_ctx = SchedulerContext {
                registry: Arc::clone(&registry),
                permissions: Arc::new(Mutex::new(PermissionContext::new(ctx_cwd.clone()))),
                hooks,
                can_use_tool: Arc::new(AutoApprove),
                session_id: ctx_session,
                cwd: ctx_cwd,
            };
            post_hook(&call_for_post, output, &post_ctx).await
        });

        if concurrency_safe {
            in_flight.push((call.id.clone(), handle));
        } else {
            let output = match handle.await {
                Ok(o) => o,
                Err(e) => ToolOutput::err(&call.id, format!("tool panicked: {e}")),
            };
            results.push(ScheduledResult { call_id: call.id.clone(), output });
        }
    }

    // Final drain: everything still running, in completion order. Give a
    // grace period if cancellation was observed mid-epoch, otherwise an
    // effectively unbounded wait (tools are expected to finish on their own).
    results.extend(drain(&mut in_flight, if cancelled { grace } else { Duration::from_secs(3600) }).await);

    debug_assert_eq!(results.len(), tool_calls.len(), "every tool call must resolve exactly once");

    EpochOutcome { results, cancelled }
}

/// Await every in-flight task, emitting each `ScheduledResult` in the order
/// the underlying task actually finishes (spec §5/§9: concurrency-safe
/// results are emitted in completion order, not block order). Anything
/// still running after `grace` is aborted and resolves to a synthesized
/// aborted result, carrying its real call id.
async fn drain(
    in_flight: &mut Vec<(String, tokio::task::JoinHandle<ToolOutput>)>,
    grace: Duration,
) -> Vec<ScheduledResult> {
    let mut pending = std::mem::take(in_flight);
    let mut completed = Vec::with_capacity(pending.len());
    let deadline = tokio::time::Instant::now() + grace;

    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let mut still_pending = Vec::new();
        let mut finished_this_round = Vec::new();
        for (call_id, handle) in pending {
            if handle.is_finished() {
                finished_this_round.push((call_id, handle));
            } else {
                still_pending.push((call_id, handle));
            }
        }
        for (call_id, handle) in finished_this_round {
            let output = match handle.await {
                Ok(o) => o,
                Err(e) => ToolOutput::err(&call_id, format!("tool panicked: {e}")),
            };
            completed.push(ScheduledResult { call_id, output });
        }
        pending = still_pending;
        if !pending.is_empty() {
            tokio::time::sleep(Duration::from_millis(20).min(remaining)).await;
        }
    }
    for (call_id, handle) in pending {
        handle.abort();
        completed.push(ScheduledResult { call_id: call_id.clone(), output: aborted(&call_id) });
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as async_trait_test;
    use serde_json::{json, Value};
    use sven_tools::{PermissionMode, Tool};

    struct EchoTool;

    #[async_trait_test]
    impl Tool for EchoTool {
        fn name(&self) -> &str { "echo" }
        fn description(&self) -> &str { "echoes" }
        fn parameters_schema(&self) -> Value { json!({"type": "object"}) }
        fn default_policy(&self) -> sven_tools::ApprovalPolicy { sven_tools::ApprovalPolicy::Auto }
        fn read_only(&self, _call: &ToolCall) -> bool { true }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    struct WriteTool;

    #[async_trait_test]
    impl Tool for WriteTool {
        fn name(&self) -> &str { "write" }
        fn description(&self) -> &str { "writes" }
        fn parameters_schema(&self) -> Value { json!({"type": "object"}) }
        fn default_policy(&self) -> sven_tools::ApprovalPolicy { sven_tools::ApprovalPolicy::Auto }
        fn read_only(&self, _call: &ToolCall) -> bool { false }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "wrote")
        }
    }

    fn ctx_bypass() -> SchedulerContext {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(WriteTool);
        let mut perms = PermissionContext::new("/work");
        perms.mode = PermissionMode::BypassPermissions;
        SchedulerContext::new(Arc::new(registry), Arc::new(Mutex::new(perms)))
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), args: json!({}) }
    }

    #[tokio::test]
    async fn every_call_resolves_exactly_once() {
        let ctx = ctx_bypass();
        let calls = vec![call("1", "echo"), call("2", "echo"), call("3", "write")];
        let (_tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        assert_eq!(outcome.results.len(), 3);
        let ids: std::collections::HashSet<&str> =
            outcome.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"].into_iter().collect());
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn unknown_tool_still_resolves() {
        let ctx = ctx_bypass();
        let calls = vec![call("1", "does_not_exist")];
        let (_tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        assert!(outcome.results[0].output.is_error);
    }

    #[tokio::test]
    async fn already_cancelled_epoch_aborts_every_call() {
        let ctx = ctx_bypass();
        let calls = vec![call("1", "echo"), call("2", "write")];
        let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx);
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        assert!(outcome.cancelled);
        assert!(outcome.results.iter().all(|r| r.output.is_error));
    }

    #[tokio::test]
    async fn deny_rule_short_circuits_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(WriteTool);
        let mut perms = PermissionContext::new("/work");
        perms.deny_rules.push(
            sven_tools::PermissionRule::parse("write", sven_tools::RuleOrigin::Project).unwrap(),
        );
        let ctx = SchedulerContext::new(Arc::new(registry), Arc::new(Mutex::new(perms)));
        let calls = vec![call("1", "write")];
        let (_tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        assert!(outcome.results[0].output.is_error);
        assert!(outcome.results[0].output.content.contains("denied"));
    }

    #[tokio::test]
    async fn ask_decision_resolved_by_callback() {
        let mut registry = ToolRegistry::new();
        registry.register(WriteTool);
        let perms = PermissionContext::new("/work");
        let mut ctx = SchedulerContext::new(Arc::new(registry), Arc::new(Mutex::new(perms)));
        ctx.can_use_tool = Arc::new(AutoDeny);
        let calls = vec![call("1", "write")];
        let (_tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        assert!(outcome.results[0].output.is_error);
        assert!(outcome.results[0].output.content.contains("rejected"));
    }

    #[tokio::test]
    async fn write_call_barriers_after_concurrent_reads() {
        let ctx = ctx_bypass();
        let calls = vec![call("1", "echo"), call("2", "echo"), call("3", "write")];
        let (_tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        let outcome = run_epoch(&calls, &ctx, &mut rx, Duration::from_millis(500)).await;
        let write_result = outcome.results.iter().find(|r| r.call_id == "3").unwrap();
        assert!(!write_result.output.is_error);
    }
}
