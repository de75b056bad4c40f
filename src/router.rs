//! Intent classification for inbound message text.
//!
//! The checks run in a fixed order and the first hit wins: sync, help,
//! clear, tool prefixes, rename, recall, auto-recall, plain chat. The order
//! is a contract — a message containing both a rename phrase and a recall
//! number is a rename, nothing else — and is pinned by the tests below.

use regex::Regex;
use std::sync::LazyLock;

static SYNC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:/|#)?sync\b").expect("hardcoded regex"));

static HELP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(help|ヘルプ|使い方)").expect("hardcoded regex"));

static CLEAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:/|#)clear$").expect("hardcoded regex"));

static TOOL_PREFIX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:/|#)?(web|x(?:search)?|code)\b").expect("hardcoded regex"));

static RECALL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|\s)(?:/|#)?recall\s+(\d+)").expect("hardcoded regex"));

/// Rename phrases: "<name> と/って/で 呼んで/読んで/呼称して ほしい". Tried in
/// declared order, first match anywhere in the text wins; the non-greedy
/// group captures the candidate name.
static PREFERRED_NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(.+?)って呼んでほしい",
        r"(.+?)と呼んでほしい",
        r"(.+?)で呼んでほしい",
        r"(.+?)って読んでほしい",
        r"(.+?)と読んでほしい",
        r"(.+?)って呼称してほしい",
        r"(.+?)と呼称してほしい",
        r"(.+?)で呼称してほしい",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("hardcoded regex"))
    .collect()
});

/// Substituted when an explicit recall command arrives with no residual text.
pub const RECALL_FILLER_CONTENT: &str = "ログを読み取って要点だけ教えてください。";

/// Which auxiliary tools the current turn asked for by prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolFlags {
    pub web: bool,
    pub x: bool,
    pub code: bool,
}

impl ToolFlags {
    pub fn any(&self) -> bool {
        self.web || self.x || self.code
    }
}

/// Recall decision for a chat turn. Explicit counts are clamped by the
/// orchestrator, which knows who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recall {
    None,
    /// `/recall N` — raw requested line count.
    Explicit(usize),
    /// A configured trigger keyword appeared in the content.
    Auto,
}

/// Top-level intent of an inbound message. Exactly one per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Administrative slash-command resync.
    Sync,
    /// Usage summary request.
    Help,
    /// Drop the conversation's rolling memory (the log is untouched).
    Clear,
    /// Tool prefixes with nothing after them; prompt for content.
    EmptyToolQuery { tools: ToolFlags },
    /// "Please call me X". `content` is the residual text after tool-prefix
    /// stripping, kept for the transcript.
    Rename { candidate: String, content: String },
    /// A conversational turn for the model.
    Chat {
        tools: ToolFlags,
        recall: Recall,
        content: String,
    },
}

/// Classify already-mention-stripped, trimmed message text.
pub fn classify(content: &str, auto_recall_keywords: &[String]) -> Intent {
    if SYNC_PATTERN.is_match(content) {
        return Intent::Sync;
    }
    if HELP_PATTERN.is_match(content) {
        return Intent::Help;
    }
    if CLEAR_PATTERN.is_match(content.trim()) {
        return Intent::Clear;
    }

    let (tools, residual) = extract_tool_prefixes(content);
    if tools.any() && residual.is_empty() {
        return Intent::EmptyToolQuery { tools };
    }

    if let Some(candidate) = extract_preferred_name(&residual) {
        return Intent::Rename { candidate, content: residual };
    }

    if let Some(lines) = extract_recall_request(&residual) {
        let stripped = strip_recall_command(&residual);
        let content = if stripped.is_empty() {
            RECALL_FILLER_CONTENT.to_string()
        } else {
            stripped
        };
        return Intent::Chat { tools, recall: Recall::Explicit(lines), content };
    }

    let recall = if auto_recall_keywords
        .iter()
        .any(|keyword| residual.contains(keyword.as_str()))
    {
        Recall::Auto
    } else {
        Recall::None
    };
    Intent::Chat { tools, recall, content: residual }
}

/// Strip leading tool prefixes greedily, left to right, stopping at the
/// first token that is not one.
fn extract_tool_prefixes(content: &str) -> (ToolFlags, String) {
    let mut flags = ToolFlags::default();
    let mut remaining = content.trim();
    while !remaining.is_empty() {
        let Some(captures) = TOOL_PREFIX_PATTERN.captures(remaining) else {
            break;
        };
        let kind = captures.get(1).expect("group 1 always present").as_str().to_lowercase();
        if kind.starts_with("web") {
            flags.web = true;
        } else if kind.starts_with('x') {
            flags.x = true;
        } else {
            flags.code = true;
        }
        let end = captures.get(0).expect("whole match").end();
        remaining = remaining[end..].trim_start();
    }
    (flags, remaining.trim().to_string())
}

fn extract_preferred_name(content: &str) -> Option<String> {
    let stripped = content.trim();
    for pattern in PREFERRED_NAME_PATTERNS.iter() {
        let Some(captures) = pattern.captures(stripped) else {
            continue;
        };
        let candidate = captures.get(1).expect("group 1 always present").as_str().trim();
        if !candidate.is_empty() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn extract_recall_request(content: &str) -> Option<usize> {
    let captures = RECALL_PATTERN.captures(content)?;
    captures
        .get(1)
        .expect("group 1 always present")
        .as_str()
        .parse()
        .ok()
}

fn strip_recall_command(content: &str) -> String {
    RECALL_PATTERN.replace_all(content, "").trim().to_string()
}
