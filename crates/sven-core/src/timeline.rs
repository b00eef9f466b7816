// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Timeline normalization: flattens the raw `Vec<Message>` a `Session` holds
//! into a sequence of stable, individually-addressable entries, pairs each
//! tool call with its result, and tracks the prefix of that sequence which
//! is guaranteed never to change again.
use std::collections::HashSet;

use sven_model::{ContentPart, Message, MessageContent, Role};

/// One flattened, individually-addressable unit of the timeline.
///
/// A single [`Message`] normalizes to one or more entries: a `ContentParts`
/// message with N parts yields N entries, each keyed `"{message uuid}:{n}"`
/// so the id is stable across re-normalization as long as the source
/// message isn't rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    /// Stable identifier for this entry. For single-block messages this is
    /// just the message's own uuid; for a block lifted out of a
    /// multi-part message it's `"{message uuid}:{block index}"`.
    pub id: String,
    /// Uuid of the `Message` this entry was lifted from.
    pub parent_uuid: String,
    pub role: Role,
    pub kind: EntryKind,
    /// Position of the source message in the input slice, used as a stable
    /// tie-break when entries would otherwise sort equal.
    pub original_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Text(String),
    Image { image_url: String },
    ToolUse { tool_call_id: String, name: String, arguments: String },
    ToolResult { tool_call_id: String, content: String, is_error: bool },
    Thinking(String),
}

impl NormalizedEntry {
    /// The ToolUse id this entry references, for `ToolUse`/`ToolResult` kinds.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::ToolUse { tool_call_id, .. } => Some(tool_call_id),
            EntryKind::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self.kind, EntryKind::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self.kind, EntryKind::ToolResult { .. })
    }
}

/// Flatten a raw message list into the canonical per-block form used for
/// scheduling and UI rendering.
///
/// Malformed blocks (e.g. a `ToolResult` whose content fails to stringify)
/// are dropped with a `tracing::warn!` rather than failing the whole turn.
pub fn normalize(messages: &[Message]) -> Vec<NormalizedEntry> {
    let mut out = Vec::with_capacity(messages.len());
    for (index, msg) in messages.iter().enumerate() {
        let parent_uuid = msg.uuid.to_string();
        match &msg.content {
            MessageContent::Text(t) => out.push(NormalizedEntry {
                id: parent_uuid.clone(),
                parent_uuid,
                role: msg.role.clone(),
                kind: EntryKind::Text(t.clone()),
                original_index: index,
            }),
            MessageContent::ContentParts(parts) => {
                if parts.is_empty() {
                    tracing::warn!(uuid = %parent_uuid, "dropping empty ContentParts message from timeline");
                    continue;
                }
                for (block_index, part) in parts.iter().enumerate() {
                    let id = format!("{parent_uuid}:{block_index}");
                    let kind = match part {
                        ContentPart::Text { text } => EntryKind::Text(text.clone()),
                        ContentPart::Image { image_url, .. } => {
                            EntryKind::Image { image_url: image_url.clone() }
                        }
                    };
                    out.push(NormalizedEntry {
                        id,
                        parent_uuid: parent_uuid.clone(),
                        role: msg.role.clone(),
                        kind,
                        original_index: index,
                    });
                }
            }
            MessageContent::ToolCall { tool_call_id, function } => out.push(NormalizedEntry {
                id: parent_uuid.clone(),
                parent_uuid,
                role: msg.role.clone(),
                kind: EntryKind::ToolUse {
                    tool_call_id: tool_call_id.clone(),
                    name: function.name.clone(),
                    arguments: function.arguments.clone(),
                },
                original_index: index,
            }),
            MessageContent::ToolResult { tool_call_id, content, is_error } => {
                out.push(NormalizedEntry {
                    id: parent_uuid.clone(),
                    parent_uuid,
                    role: msg.role.clone(),
                    kind: EntryKind::ToolResult {
                        tool_call_id: tool_call_id.clone(),
                        content: content.to_string(),
                        is_error: *is_error,
                    },
                    original_index: index,
                })
            }
            MessageContent::Thinking { text } => out.push(NormalizedEntry {
                id: parent_uuid.clone(),
                parent_uuid,
                role: msg.role.clone(),
                kind: EntryKind::Thinking(text.clone()),
                original_index: index,
            }),
        }
    }
    out
}

/// Pair each `ToolUse` entry with its matching `ToolResult`, moving the
/// result to immediately follow its call. Entries with no counterpart, and
/// entries already in order, are left in their stable (original-index)
/// position.
pub fn reorder(entries: &[NormalizedEntry]) -> Vec<NormalizedEntry> {
    let mut by_call_id_result: std::collections::HashMap<&str, usize> =
        std::collections::HashMap::new();
    for (i, e) in entries.iter().enumerate() {
        if e.is_tool_result() {
            if let Some(id) = e.tool_call_id() {
                by_call_id_result.entry(id).or_insert(i);
            }
        }
    }

    let mut placed: HashSet<usize> = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for (i, e) in entries.iter().enumerate() {
        if placed.contains(&i) {
            continue;
        }
        out.push(e.clone());
        placed.insert(i);
        if e.is_tool_use() {
            if let Some(id) = e.tool_call_id() {
                if let Some(&result_idx) = by_call_id_result.get(id) {
                    if !placed.contains(&result_idx) {
                        out.push(entries[result_idx].clone());
                        placed.insert(result_idx);
                    }
                }
            }
        }
    }
    out
}

/// The set of ToolUse ids with no matching Tool-Result anywhere in `entries`.
pub fn unresolved_tool_use_ids(entries: &[NormalizedEntry]) -> HashSet<String> {
    let mut calls: HashSet<&str> = HashSet::new();
    let mut resolved: HashSet<&str> = HashSet::new();
    for e in entries {
        match &e.kind {
            EntryKind::ToolUse { tool_call_id, .. } => {
                calls.insert(tool_call_id);
            }
            EntryKind::ToolResult { tool_call_id, .. } => {
                resolved.insert(tool_call_id);
            }
            _ => {}
        }
    }
    calls.difference(&resolved).map(|s| s.to_string()).collect()
}

/// The largest prefix length such that no entry in the prefix references an
/// unresolved ToolUse id, and no entry in the prefix follows one that does.
///
/// Used by callers (e.g. a UI) to memoize a stable visible history: once an
/// index is included in the static prefix on one call, it remains included
/// on every subsequent call unless Auto-Compaction rewrites the timeline.
pub fn static_prefix_length(entries: &[NormalizedEntry], unresolved: &HashSet<String>) -> usize {
    for (i, e) in entries.iter().enumerate() {
        if let Some(id) = e.tool_call_id() {
            if unresolved.contains(id) {
                return i;
            }
        }
    }
    entries.len()
}
