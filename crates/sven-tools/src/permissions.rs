// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Multi-scope permission engine.
//!
//! Generalizes [`crate::policy::ToolPolicy`] (glob auto/deny patterns, one
//! scope, no asking) into a full rule engine: scoped rules with deterministic
//! precedence, a permission-mode state machine, and Bash-specific injection
//! and read-only classification.

use regex::Regex;
use sven_config::ToolsConfig;

use crate::policy::glob_to_regex;
use crate::tool::ToolCall;

/// Where a [`PermissionRule`] was sourced from. Determines nothing about
/// precedence by itself — origin is tracked for diagnostics and `/permissions`
/// style introspection, but exact/deny/ask precedence is origin-agnostic
/// (any scope's deny wins over any scope's allow).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    Local,
    Project,
    User,
    Policy,
}

/// One compiled rule: a tool selector plus the scope it came from.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    /// Raw selector text, e.g. `Bash(git:*)`, `WebFetch(domain:*.example.com)`.
    pub selector: String,
    pub origin: RuleOrigin,
    tool: String,
    matcher: SelectorMatcher,
}

#[derive(Debug, Clone)]
enum SelectorMatcher {
    /// Matches the key value exactly.
    Exact(String),
    /// Matches a `prefix:*` style selector against the key's leading tokens.
    Prefix(String),
    /// Arbitrary glob, compiled the same way `policy::glob_to_regex` does.
    Glob(Regex),
    /// No key restriction — any input to this tool matches.
    Any,
}

impl PermissionRule {
    /// Parse a rule of the form `Tool(selector)` or bare `Tool`.
    pub fn parse(raw: &str, origin: RuleOrigin) -> Option<Self> {
        let raw = raw.trim();
        let (tool, inner) = match raw.find('(') {
            Some(idx) if raw.ends_with(')') => (&raw[..idx], &raw[idx + 1..raw.len() - 1]),
            Some(_) => return None,
            None => (raw, ""),
        };
        let tool = canonical_tool(tool);

        // `WebFetch(domain:example.com)` keys match against the bare hostname
        // `selector_key` derives — the `domain:` tag is selector syntax, not
        // part of the value being matched, so it's stripped here.
        let inner = if tool == "web_fetch" {
            inner.strip_prefix("domain:").unwrap_or(inner)
        } else {
            inner
        };
        let matcher = if inner.is_empty() {
            SelectorMatcher::Any
        } else if let Some(prefix) = inner.strip_suffix(":*") {
            SelectorMatcher::Prefix(prefix.to_string())
        } else if let Some(suffix) = inner.strip_prefix("*.") {
            SelectorMatcher::Glob(Regex::new(&format!("(?i)^(.*\\.)?{}$", regex::escape(suffix))).unwrap())
        } else if inner.contains('*') || inner.contains('?') {
            match glob_to_regex(inner) {
                Some(re) => SelectorMatcher::Glob(re),
                None => SelectorMatcher::Exact(inner.to_string()),
            }
        } else {
            SelectorMatcher::Exact(inner.to_string())
        };
        Some(Self { selector: raw.to_string(), origin, tool: tool.to_string(), matcher })
    }

    fn matches(&self, tool: &str, key: &str) -> bool {
        if self.tool != canonical_tool(tool) {
            return false;
        }
        match &self.matcher {
            SelectorMatcher::Any => true,
            SelectorMatcher::Exact(v) => v == key,
            SelectorMatcher::Prefix(p) => key == p.as_str() || key.starts_with(&format!("{p} ")),
            SelectorMatcher::Glob(re) => re.is_match(key),
        }
    }

    fn matches_exactly(&self, tool: &str, key: &str) -> bool {
        matches!(self.matcher, SelectorMatcher::Exact(_) | SelectorMatcher::Any)
            && self.matches(tool, key)
    }
}

/// The global permission mode. Cycled by a UI shortcut per spec §6:
/// `default → acceptEdits → plan → (bypassPermissions if available) → default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
    /// Deny every tool call with a fixed explanation; used for read-only
    /// review sessions.
    DontAsk,
}

impl PermissionMode {
    pub fn cycle_next(self, bypass_available: bool) -> Self {
        match self {
            Self::Default => Self::AcceptEdits,
            Self::AcceptEdits => Self::Plan,
            Self::Plan if bypass_available => Self::BypassPermissions,
            Self::Plan => Self::Default,
            Self::BypassPermissions => Self::Default,
            Self::DontAsk => Self::DontAsk,
        }
    }
}

/// A suggested update to the [`PermissionContext`], returned with `Ask`
/// decisions so a caller (or `canUseTool` callback) can apply it and retry.
#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    AddDirectory(String),
    SetMode(PermissionMode),
}

impl std::fmt::Display for Suggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddDirectory(dir) => write!(f, "addDirectories({dir})"),
            Self::SetMode(m) => write!(f, "setMode({m:?})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(String),
    Ask(String, Vec<Suggestion>),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Session-scoped permission state. Mutated only through
/// [`PermissionContext::apply_suggestion`] or explicit mode changes.
#[derive(Debug, Clone)]
pub struct PermissionContext {
    pub mode: PermissionMode,
    pub allow_rules: Vec<PermissionRule>,
    pub ask_rules: Vec<PermissionRule>,
    pub deny_rules: Vec<PermissionRule>,
    pub additional_working_dirs: Vec<String>,
    pub bypass_available: bool,
    /// Command execution runs inside a sandbox (container/jail); enables
    /// `autoAllowBashIfSandboxed`.
    pub sandboxed: bool,
    cwd: String,
    plan_file: Option<String>,
}

impl PermissionContext {
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            mode: PermissionMode::Default,
            allow_rules: Vec::new(),
            ask_rules: Vec::new(),
            deny_rules: Vec::new(),
            additional_working_dirs: Vec::new(),
            bypass_available: false,
            sandboxed: false,
            cwd: cwd.into(),
            plan_file: None,
        }
    }

    /// Seed allow/deny rules from the legacy glob-pattern config, treating
    /// every pattern as a `Bash(...)` selector (the only thing the teacher's
    /// config ever expressed).
    pub fn from_config(cfg: &ToolsConfig, cwd: impl Into<String>) -> Self {
        let mut ctx = Self::new(cwd);
        for p in &cfg.auto_approve_patterns {
            if let Some(rule) = PermissionRule::parse(&format!("Bash({p})"), RuleOrigin::Project) {
                ctx.allow_rules.push(rule);
            }
        }
        for p in &cfg.deny_patterns {
            if let Some(rule) = PermissionRule::parse(&format!("Bash({p})"), RuleOrigin::Project) {
                ctx.deny_rules.push(rule);
            }
        }
        ctx.sandboxed = cfg.use_docker;
        ctx
    }

    pub fn set_plan_file(&mut self, path: impl Into<String>) {
        self.plan_file = Some(path.into());
    }

    /// Update the primary working directory. Used once the real session
    /// `cwd` is known (construction often happens before it, e.g. in
    /// `Agent::new`, with `cwd` finalized later via `attach_sink`).
    pub fn set_cwd(&mut self, cwd: impl Into<String>) {
        self.cwd = cwd.into();
    }

    pub fn apply_suggestion(&mut self, s: Suggestion) {
        match s {
            Suggestion::AddDirectory(dir) => {
                if !self.additional_working_dirs.contains(&dir) {
                    self.additional_working_dirs.push(dir);
                }
            }
            Suggestion::SetMode(m) => self.mode = m,
        }
    }

    fn working_dirs(&self) -> Vec<&str> {
        std::iter::once(self.cwd.as_str())
            .chain(self.additional_working_dirs.iter().map(String::as_str))
            .collect()
    }

    fn path_in_working_dirs(&self, path: &str) -> bool {
        self.working_dirs().iter().any(|d| path.starts_with(d))
    }

    /// Evaluate the full precedence chain of spec §4.2 for one tool call.
    pub fn check(&self, tool_name: &str, call: &ToolCall) -> Decision {
        let key = selector_key(tool_name, call);
        let is_write = is_write_capable(tool_name);

        // 1. bypassPermissions ⇒ Allow, unless a policy-scope deny matches.
        if self.mode == PermissionMode::BypassPermissions {
            if let Some(d) = self.first_deny(tool_name, &key, Some(RuleOrigin::Policy)) {
                return d;
            }
            return Decision::Allow;
        }

        // 2. dontAsk ⇒ fixed deny.
        if self.mode == PermissionMode::DontAsk {
            return Decision::Deny("denied: dontAsk mode is active".into());
        }

        // 3. exact deny at any scope.
        if let Some(d) = self.first_deny(tool_name, &key, None) {
            return d;
        }

        // 4. exact ask at any scope — cannot be silenced by allow.
        if let Some(rule) = self.ask_rules.iter().find(|r| r.matches_exactly(tool_name, &key)) {
            return Decision::Ask(
                format!("matched ask rule {}", rule.selector),
                Vec::new(),
            );
        }

        // 5. plan mode.
        if self.mode == PermissionMode::Plan {
            if let Some(plan_file) = &self.plan_file {
                if tool_name == "write_file" || tool_name == "edit_file" {
                    if let Some(path) = call.args.get("path").and_then(|v| v.as_str()) {
                        if path == plan_file {
                            return Decision::Allow;
                        }
                    }
                }
            }
            if is_write {
                return Decision::Ask("plan mode: write requires confirmation".into(), Vec::new());
            }
            if matches!(tool_name, "read_file" | "list_dir" | "glob" | "glob_file_search" | "grep" | "search_codebase") {
                let path = read_scope_path(tool_name, call);
                if path == "." || self.path_in_working_dirs(&path) {
                    return Decision::Allow;
                }
            }
        }

        // Bash injection detection takes precedence over any prefix allow: a
        // command containing shell metacharacters must never be silently
        // allowed just because its visible prefix matches an allow rule.
        if (tool_name == "shell" || tool_name == "run_terminal_command") && bash_has_injection(&key) {
            return Decision::Ask(
                "command contains shell metacharacters; confirm before running".into(),
                Vec::new(),
            );
        }

        // 6. exact or prefix allow.
        if self.allow_rules.iter().any(|r| r.matches(tool_name, &key)) {
            return Decision::Allow;
        }

        // Bash-specific handling layered onto the generic chain.
        if (tool_name == "shell" || tool_name == "run_terminal_command") && self.sandboxed {
            return Decision::Allow;
        }

        // 7. acceptEdits ⇒ allow edits inside working dirs.
        if self.mode == PermissionMode::AcceptEdits && is_write {
            if let Some(path) = write_path(tool_name, call) {
                if self.path_in_working_dirs(&path) {
                    return Decision::Allow;
                }
                return Decision::Ask(
                    format!("{path} is outside the working directories"),
                    vec![
                        Suggestion::SetMode(PermissionMode::AcceptEdits),
                        Suggestion::AddDirectory(parent_dir(&path)),
                    ],
                );
            }
        }

        // 8. otherwise ⇒ ask, with filesystem suggestions when applicable.
        if let Some(path) = write_path(tool_name, call) {
            if !self.path_in_working_dirs(&path) {
                return Decision::Ask(
                    format!("{path} is outside the working directories"),
                    vec![
                        Suggestion::SetMode(PermissionMode::AcceptEdits),
                        Suggestion::AddDirectory(parent_dir(&path)),
                    ],
                );
            }
        }
        Decision::Ask(format!("confirm {tool_name}"), Vec::new())
    }

    fn first_deny(&self, tool: &str, key: &str, only: Option<RuleOrigin>) -> Option<Decision> {
        self.deny_rules
            .iter()
            .filter(|r| only.map(|o| r.origin == o).unwrap_or(true))
            .find(|r| r.matches(tool, key))
            .map(|r| Decision::Deny(format!("matched deny rule {}", r.selector)))
    }
}

fn is_write_capable(tool_name: &str) -> bool {
    matches!(
        tool_name,
        "write_file" | "edit_file" | "delete_file" | "shell" | "run_terminal_command"
    )
}

fn write_path(tool_name: &str, call: &ToolCall) -> Option<String> {
    if matches!(tool_name, "write_file" | "edit_file" | "delete_file") {
        call.args.get("path").and_then(|v| v.as_str()).map(str::to_string)
    } else {
        None
    }
}

/// Extracts the directory a read-only tool call is scoped to, for the
/// plan-mode working-directory check. `glob`/`glob_file_search` key their
/// scope as `root`; the others as `path`. Tools that omit the argument
/// default to the current directory, same as their `execute` impls.
fn read_scope_path(tool_name: &str, call: &ToolCall) -> String {
    let key = match tool_name {
        "glob" | "glob_file_search" => "root",
        _ => "path",
    };
    call.args.get(key).and_then(|v| v.as_str()).unwrap_or(".").to_string()
}

fn parent_dir(path: &str) -> String {
    std::path::Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Maps both the spec's display-style tool names (`Bash`, `WebFetch`, ...)
/// used in rule selector text and this crate's internal snake_case tool
/// names to a single canonical token, so `Bash(git:*)` matches a call to
/// either the `shell` or `run_terminal_command` tool.
fn canonical_tool(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "bash" | "shell" | "run_terminal_command" => "bash".to_string(),
        "webfetch" | "web_fetch" => "web_fetch".to_string(),
        "websearch" | "web_search" => "web_search".to_string(),
        "fileread" | "read_file" => "read_file".to_string(),
        "filewrite" | "write_file" => "write_file".to_string(),
        "fileedit" | "edit_file" => "edit_file".to_string(),
        "filedelete" | "delete_file" => "delete_file".to_string(),
        _ => lower,
    }
}

/// Derive the selector "key" a rule is matched against for a given tool
/// call, per spec §4.2's keying rules (Bash command, WebFetch hostname,
/// WebSearch query text, FileRead/FileWrite path).
pub fn selector_key(tool_name: &str, call: &ToolCall) -> String {
    match tool_name {
        "shell" => call.args.get("shell_command").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        "run_terminal_command" => call.args.get("command").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        "web_fetch" => {
            let url = call.args.get("url").and_then(|v| v.as_str()).unwrap_or_default();
            url_hostname(url).unwrap_or_else(|| url.to_string())
        }
        "web_search" => call.args.get("query").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        "read_file" | "write_file" | "edit_file" | "delete_file" => {
            call.args.get("path").and_then(|v| v.as_str()).unwrap_or_default().to_string()
        }
        _ => String::new(),
    }
}

fn url_hostname(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host = rest.split(['/', '?', '#']).next()?;
    Some(host.to_string())
}

/// Conservative shell-injection detector: anything that could chain or
/// substitute commands is flagged so the caller `Ask`s rather than silently
/// honoring a prefix allow rule.
pub fn bash_has_injection(command: &str) -> bool {
    const METACHARS: &[&str] = &[";", "|", "&&", "`", "$(", ">", "<"];
    METACHARS.iter().any(|m| command.contains(m))
}

/// Conservative read-only classifier used only by the scheduler for
/// concurrency grouping; permission checks still apply independently.
pub fn bash_is_read_only(command: &str) -> bool {
    if bash_has_injection(command) {
        return false;
    }
    const READ_ONLY_PREFIXES: &[&str] = &[
        "pwd", "ls", "cat", "head", "tail", "wc", "find", "grep", "rg", "git status",
        "git diff", "git log", "git show", "git branch", "echo", "which", "type", "file",
    ];
    let trimmed = command.trim();
    READ_ONLY_PREFIXES
        .iter()
        .any(|p| trimmed == *p || trimmed.starts_with(&format!("{p} ")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
