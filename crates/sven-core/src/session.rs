// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sven_model::Message;
use uuid::Uuid;

use crate::sink::SessionSink;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
///
/// Owns the live timeline (§3 "Ownership & Lifecycle": the Turn Loop
/// exclusively owns this). An attached [`SessionSink`] observes every
/// `push` as an append-only side effect; it never mutates `messages`.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the active model may produce; reserved out of
    /// `max_tokens` when computing [`Session::input_budget`].
    pub max_output_tokens: usize,
    /// Token overhead of items sent with every request but not stored in
    /// `messages` (tool schemas, dynamic context block). Recomputed by the
    /// turn loop before each budget check.
    pub schema_overhead: usize,
    /// Correction factor applied to the chars/4 estimate, continuously
    /// recalibrated against the provider's actual reported input token
    /// count. Starts at 1.0 (trust the estimate) and drifts toward the
    /// provider's tokenizer as usage reports arrive.
    pub calibration_factor: f32,
    /// Cumulative tokens served from the provider's prompt cache this session.
    pub cache_read_total: u32,
    /// Cumulative tokens written into the provider's prompt cache this session.
    pub cache_write_total: u32,

    /// Working directory this session was started in (spec §3 `Session.cwd`).
    pub cwd: String,
    pub started_at: DateTime<Utc>,
    /// Human-readable slug, used by the sink envelope and log directory naming.
    pub slug: String,
    pub custom_title: Option<String>,
    pub tag: Option<String>,

    /// Append-only observer. `None` when no on-disk log is wanted (e.g. most
    /// unit tests) — every `push` still works identically either way.
    sink: Option<Arc<SessionSink>>,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
            cwd: String::new(),
            started_at: Utc::now(),
            slug: String::new(),
            custom_title: None,
            tag: None,
            sink: None,
        }
    }

    /// Attach an append-only sink. Every subsequent `push` (and title/tag
    /// update) is mirrored to it; it is never consulted for reads.
    pub fn with_sink(mut self, sink: Arc<SessionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Attach a sink to an already-constructed session in place (the
    /// CLI/CI entry points build the model/tools/config first and only know
    /// the session's `cwd`/slug once `Agent::new` has run).
    pub fn attach_sink(&mut self, sink: Arc<SessionSink>) {
        self.sink = Some(sink);
    }

    /// Append one message to the timeline, stamping `seq`/`parent_uuid` so
    /// the chain is self-describing even if the message is later read back
    /// out of the in-memory `Vec`, and mirroring it to the sink if attached.
    pub fn push(&mut self, mut msg: Message) {
        msg.seq = self.messages.len() as u64;
        msg.parent_uuid = self.messages.last().map(|m| m.uuid);
        self.token_count += msg.approx_tokens();
        if let Some(sink) = &self.sink {
            sink.append_message(&msg);
        }
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Record a custom-title update (spec §4.6: custom-title updates are
    /// sink-observed events, not timeline entries).
    pub fn set_custom_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if let Some(sink) = &self.sink {
            sink.append_custom_title(&self.id, &title);
        }
        self.custom_title = Some(title);
    }

    /// Record a tag update, mirrored to the sink the same way as a custom title.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if let Some(sink) = &self.sink {
            sink.append_tag(&self.id, &tag);
        }
        self.tag = Some(tag);
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// The portion of the context window available for prompt (input)
    /// tokens: the full window minus the room reserved for the model's
    /// own output. Zero disables budget-driven compaction entirely.
    pub fn input_budget(&self) -> usize {
        if self.max_tokens == 0 {
            return 0;
        }
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Fold this turn's cache usage into the running session totals.
    pub fn add_cache_usage(&mut self, read: u32, write: u32) {
        self.cache_read_total += read;
        self.cache_write_total += write;
    }

    /// Nudge `calibration_factor` toward the ratio the provider's own
    /// token accounting implies, using an exponential moving average so a
    /// single noisy sample can't swing the estimate wildly. Clamped to a
    /// sane range to tolerate a provider reporting zero or garbage counts.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 || actual_input == 0 {
            return;
        }
        let sample = actual_input as f32 / estimated as f32;
        if !sample.is_finite() {
            return;
        }
        const EMA_WEIGHT: f32 = 0.3;
        let next = self.calibration_factor * (1.0 - EMA_WEIGHT) + sample * EMA_WEIGHT;
        self.calibration_factor = next.clamp(0.25, 4.0);
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sven_model::Message;
    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new(1000);
        let b = Session::new(1000);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn new_session_starts_empty() {
        let s = Session::new(1000);
        assert!(s.messages.is_empty());
        assert_eq!(s.token_count, 0);
    }

    #[test]
    fn new_session_has_default_calibration_of_one() {
        let s = Session::new(1000);
        assert_eq!(s.calibration_factor, 1.0);
    }

    #[test]
    fn new_session_has_no_sink_by_default() {
        let s = Session::new(1000);
        assert!(!s.has_sink());
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn push_increments_token_count() {
        let mut s = Session::new(1000);
        // "12345678" = 8 chars → 2 tokens
        s.push(Message::user("12345678"));
        assert_eq!(s.token_count, 2);
    }

    #[test]
    fn push_many_accumulates_tokens() {
        let mut s = Session::new(10_000);
        s.push_many([
            Message::user("12345678"),  // 2 tokens
            Message::assistant("abcd"), // 1 token
        ]);
        assert_eq!(s.token_count, 3);
    }

    #[test]
    fn push_stamps_seq_in_insertion_order() {
        let mut s = Session::new(1000);
        s.push(Message::user("a"));
        s.push(Message::assistant("b"));
        s.push(Message::user("c"));
        let seqs: Vec<u64> = s.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn push_chains_parent_uuid_to_previous_message() {
        let mut s = Session::new(1000);
        s.push(Message::user("a"));
        let first_uuid = s.messages[0].uuid;
        s.push(Message::assistant("b"));
        assert_eq!(s.messages[1].parent_uuid, Some(first_uuid));
    }

    #[test]
    fn first_pushed_message_has_no_parent() {
        let mut s = Session::new(1000);
        s.push(Message::user("a"));
        assert_eq!(s.messages[0].parent_uuid, None);
    }

    #[test]
    fn recalculate_tokens_matches_push_sum() {
        let mut s = Session::new(1000);
        s.push(Message::user("hello world")); // 11 chars → 2 tokens
        let after_push = s.token_count;
        s.recalculate_tokens();
        assert_eq!(s.token_count, after_push);
    }

    #[test]
    fn recalculate_after_manual_drain_resets_to_zero() {
        let mut s = Session::new(1000);
        s.push(Message::user("text"));
        s.messages.clear();
        s.recalculate_tokens();
        assert_eq!(s.token_count, 0);
    }

    #[test]
    fn replace_messages_sets_messages_and_recalculates_tokens() {
        let mut s = Session::new(1000);
        s.push(Message::user("first"));
        s.push(Message::assistant("reply"));
        assert_eq!(s.messages.len(), 2);
        let new_msgs = vec![Message::user("only")];
        s.replace_messages(new_msgs.clone());
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.messages[0].as_text(), Some("only"));
        assert_eq!(s.token_count, 1); // "only" → 1 token
    }

    // ── Context fraction ──────────────────────────────────────────────────────

    #[test]
    fn context_fraction_zero_when_empty() {
        let s = Session::new(1000);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_at_zero_max_does_not_panic() {
        let s = Session::new(0);
        assert_eq!(s.context_fraction(), 0.0);
    }

    #[test]
    fn context_fraction_increases_with_messages() {
        let mut s = Session::new(100);
        let before = s.context_fraction();
        s.push(Message::user("a long message that uses more tokens"));
        assert!(s.context_fraction() > before);
    }

    // ── Near-limit detection ──────────────────────────────────────────────────

    #[test]
    fn is_near_limit_false_when_empty() {
        let s = Session::new(1000);
        assert!(!s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_true_when_over_threshold() {
        let mut s = Session::new(4); // tiny window
        // Each char = 0.25 tokens; need 0.8 × 4 = 3.2 tokens → 13 chars
        s.push(Message::user("1234567890123")); // 13 chars = 3 tokens (floor) in 4-token window = 75%
        // Actually: 13/4 = 3 tokens; fraction = 3/4 = 0.75 < 0.8 → not near
        // Push one more to push it over
        s.push(Message::user("abcd")); // 1 more → 4 tokens, fraction = 1.0 ≥ 0.8
        assert!(s.is_near_limit(0.8));
    }

    #[test]
    fn is_near_limit_exactly_at_threshold() {
        let mut s = Session::new(10);
        // Need token_count / max_tokens ≥ threshold (0.5)
        // Fill exactly 5 tokens: 5*4=20 chars
        s.push(Message::user("12345678901234567890")); // 20 chars = 5 tokens
        assert!(s.is_near_limit(0.5));
        assert!(!s.is_near_limit(0.6));
    }

    // ── Input budget ──────────────────────────────────────────────────────────

    #[test]
    fn input_budget_zero_when_max_tokens_zero() {
        let s = Session::new(0);
        assert_eq!(s.input_budget(), 0);
    }

    #[test]
    fn input_budget_reserves_max_output_tokens() {
        let mut s = Session::new(1000);
        s.max_output_tokens = 200;
        assert_eq!(s.input_budget(), 800);
    }

    #[test]
    fn input_budget_never_underflows() {
        let mut s = Session::new(100);
        s.max_output_tokens = 500;
        assert_eq!(s.input_budget(), 0);
    }

    // ── Cache usage & calibration ────────────────────────────────────────────

    #[test]
    fn add_cache_usage_accumulates() {
        let mut s = Session::new(1000);
        s.add_cache_usage(10, 5);
        s.add_cache_usage(3, 2);
        assert_eq!(s.cache_read_total, 13);
        assert_eq!(s.cache_write_total, 7);
    }

    #[test]
    fn update_calibration_moves_toward_actual_ratio() {
        let mut s = Session::new(1000);
        let before = s.calibration_factor;
        // Provider reports twice as many input tokens as our estimate predicted.
        s.update_calibration(200, 100);
        assert!(s.calibration_factor > before);
    }

    #[test]
    fn update_calibration_ignores_zero_samples() {
        let mut s = Session::new(1000);
        s.update_calibration(0, 100);
        assert_eq!(s.calibration_factor, 1.0);
        s.update_calibration(100, 0);
        assert_eq!(s.calibration_factor, 1.0);
    }

    #[test]
    fn update_calibration_stays_clamped() {
        let mut s = Session::new(1000);
        for _ in 0..50 {
            s.update_calibration(10_000, 1);
        }
        assert!(s.calibration_factor <= 4.0);
    }
}
