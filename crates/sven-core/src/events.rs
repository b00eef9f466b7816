// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sven_config::AgentMode;
use sven_tools::{events::TodoItem, ToolCall};

/// Which compaction path produced a given [`AgentEvent::ContextCompacted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// The configured narrative summarization prompt ran successfully.
    Narrative,
    /// The configured structured-checkpoint summarization prompt ran successfully.
    Structured,
    /// The model call failed, returned nothing, or couldn't fit even the
    /// compaction prompt; old messages were dropped deterministically instead.
    Emergency,
}

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// Tool-round counter at the time compaction ran, so a consumer can
        /// correlate this event with the turn that triggered it.
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running session totals, for a UI that wants cumulative figures
        /// without re-deriving them from individual deltas.
        cache_read_total: u32,
        cache_write_total: u32,
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The configured `max_tool_rounds` budget was exhausted this turn.
    /// Always immediately followed by `TurnComplete` (the agent is given one
    /// final tool-free round to summarize instead of hard-stopping); a
    /// consumer that needs spec §4.5 step 6's `error_max_turns` result
    /// subtype should key off this event rather than `TurnComplete` alone.
    MaxTurnsReached,
    /// The turn was cancelled before the model/tool loop reached a natural
    /// end. `partial_text` is whatever assistant text had streamed in
    /// before the cancellation was observed (already committed to the
    /// session as an assistant message if non-empty).
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// The agent is asking the user a question (id links to QuestionAnswer)
    Question { id: String, questions: Vec<String> },
    /// Answer to a previous Question event
    QuestionAnswer { id: String, answer: String },
}

impl AgentEvent {
    /// Whether this event ends the turn loop (spec §4.5 step 6 / step 4 "on
    /// cancellation, go to step 6"): `TurnComplete` and `Aborted` are the
    /// only events after which the turn loop does not call the model again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete | Self::Aborted { .. })
    }
}
