// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session Sink (spec §4.6): an append-only, observation-only JSONL stream
//! of every timeline entry a [`crate::Session`] appends.
//!
//! Grounded on `sven-ci::jsonl_export`, which already knows how to turn a
//! `Message` into a line of JSON — but that module is a batch, write-once
//! converter run once a conversation has finished. This module generalizes
//! the same serialization idea into a streaming observer that appends one
//! line per `Session::push`, flushing immediately so a crash mid-write
//! leaves at most one partial trailing line (spec §4.6's tolerant-reader
//! contract, implemented in [`read_log`] below).
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sven_model::Message;

/// One line of the on-disk session log, per spec §4.6 / §6.
#[derive(Debug, Clone, Serialize)]
pub struct SinkEnvelope {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub uuid: String,
    #[serde(rename = "parentUuid", skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(rename = "isSidechain")]
    pub is_sidechain: bool,
    pub cwd: String,
    /// The entry payload itself — a `Message`, or a `toolUseResult`-bearing
    /// user-message record, or a custom-title/tag notice. Flattened so the
    /// line reads as one flat object, matching the teacher's existing
    /// `serde_json::json!` construction style elsewhere in the codebase.
    #[serde(flatten)]
    pub payload: Value,
}

/// Sanitize a cwd for use as a path segment: spec §6 replaces `/`, `\`, and
/// spaces with `-`.
pub fn sanitize_cwd(cwd: &str) -> String {
    cwd.chars()
        .map(|c| if c == '/' || c == '\\' || c == ' ' { '-' } else { c })
        .collect()
}

/// `<config_dir>/projects/<sanitized_cwd>/<session_id>.jsonl`, per spec §6.
pub fn log_path(config_dir: &Path, cwd: &str, session_id: &str) -> PathBuf {
    config_dir
        .join("projects")
        .join(sanitize_cwd(cwd))
        .join(format!("{session_id}.jsonl"))
}

/// Append-only observer of a session's timeline. One writer per session
/// (spec §5 "Shared resources"); `parentUuid` chains in insertion order
/// across every record this sink appends, regardless of record type — the
/// first real entry has `parentUuid: null`.
pub struct SessionSink {
    file: Mutex<std::fs::File>,
    session_id: String,
    cwd: String,
    slug: Option<String>,
    last_uuid: Mutex<Option<String>>,
}

impl SessionSink {
    /// Open (creating parent directories and the file if necessary) the log
    /// at `path`, appending to any existing content rather than truncating —
    /// resuming a session must not lose prior records.
    pub fn open(
        path: impl AsRef<Path>,
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        slug: Option<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            session_id: session_id.into(),
            cwd: cwd.into(),
            slug,
            last_uuid: Mutex::new(None),
        })
    }

    /// Append one normalized `Message` as a timeline record. The message's
    /// own `type` discriminant is its role; a tool-result `User` message
    /// additionally carries `toolUseResult` with the structured tool output
    /// (not the assistant-facing string) when one is supplied.
    pub fn append_message(&self, msg: &Message) {
        let entry_type = role_type_name(&msg.role);
        let mut payload = serde_json::to_value(msg).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize message for session sink");
            Value::Null
        });
        if let Value::Object(ref mut map) = payload {
            map.remove("uuid");
            map.remove("parent_uuid");
        }
        self.write_entry(entry_type, &msg.uuid.to_string(), serde_json::json!({ "message": payload }));
    }

    /// Append a `toolUseResult`-bearing record: the structured tool output
    /// alongside the user-facing tool-result message, per spec §4.6.
    pub fn append_tool_result(&self, msg: &Message, tool_use_result: Value) {
        let mut payload = serde_json::to_value(msg).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = payload {
            map.remove("uuid");
            map.remove("parent_uuid");
        }
        self.write_entry(
            "user",
            &msg.uuid.to_string(),
            serde_json::json!({ "message": payload, "toolUseResult": tool_use_result }),
        );
    }

    /// Record a custom-title update as its own sink entry (spec §4.6: "Every
    /// appended entry (including file-history snapshots, custom-title
    /// updates, and tag updates)").
    pub fn append_custom_title(&self, session_id: &str, title: &str) {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.write_entry(
            "custom-title",
            &uuid,
            serde_json::json!({ "sessionId": session_id, "title": title }),
        );
    }

    /// Record a tag update, the same way as a custom title.
    pub fn append_tag(&self, session_id: &str, tag: &str) {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.write_entry("tag", &uuid, serde_json::json!({ "sessionId": session_id, "tag": tag }));
    }

    fn write_entry(&self, entry_type: &str, uuid: &str, payload: Value) {
        let mut last = self.last_uuid.lock().unwrap_or_else(|e| e.into_inner());
        let envelope = SinkEnvelope {
            entry_type: entry_type.to_string(),
            uuid: uuid.to_string(),
            parent_uuid: last.clone(),
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            slug: self.slug.clone(),
            is_sidechain: false,
            cwd: self.cwd.clone(),
            payload,
        };
        *last = Some(uuid.to_string());
        drop(last);

        let line = match serde_json::to_string(&envelope) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize session sink entry");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "failed to write session sink entry");
            return;
        }
        // Flush per line (spec §4.6): a crash mid-write leaves at most one
        // partial trailing line, never a lost-but-acknowledged record.
        if let Err(e) = file.flush() {
            tracing::warn!(error = %e, "failed to flush session sink entry");
        }
    }
}

/// Read a session log back, discarding any line that fails to parse as
/// JSON — spec §4.6's "readers MUST tolerate" contract, covering both a
/// truncated trailing line from a mid-write crash and any future unknown
/// record type.
pub fn read_log(path: impl AsRef<Path>) -> Vec<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn role_type_name(role: &sven_model::Role) -> &'static str {
    match role {
        sven_model::Role::User | sven_model::Role::Tool => "user",
        sven_model::Role::Assistant => "assistant",
        sven_model::Role::System => "system",
    }
}
