// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod hooks;
mod prompts;
mod runtime_context;
mod scheduler;
mod session;
mod sink;
mod timeline;
#[cfg(test)]
mod tests;

pub use agent::Agent;
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, recover_important_files,
    smart_truncate, RECOVERED_FILE_MAX_COUNT, RECOVERED_FILE_PER_FILE_TOKEN_CAP,
    RECOVERED_FILE_TOTAL_TOKEN_CAP,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use hooks::{HookDecision, HookDispatcher, HookEvent, HookSpec};
pub use prompts::system_prompt;
pub use runtime_context::AgentRuntimeContext;
pub use scheduler::{
    run_epoch, AskReply, AutoApprove, AutoDeny, CanUseTool, EpochOutcome, ScheduledResult,
    SchedulerContext,
};
pub use session::{Session, TurnRecord};
pub use sink::{log_path, read_log, sanitize_cwd, SessionSink, SinkEnvelope};
pub use timeline::{
    normalize, reorder, static_prefix_length, unresolved_tool_use_ids, EntryKind, NormalizedEntry,
};
