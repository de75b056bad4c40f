//! Durable transcript log: append-only JSON lines plus a small per-user
//! metadata record.
//!
//! Every logical append is written twice — once to the conversation-scope
//! guild log and once to the author's per-user log — so recall can later be
//! filtered either by whole channel or by single user. Nothing in this
//! module ever mutates or deletes an existing line.

use crate::error::Result;
use crate::Role;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt as _;

/// One durable transcript record. `ts` is ISO-8601 UTC at second precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    #[serde(default)]
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub user_id: u64,
    pub display_name: String,
    pub role: Role,
    pub content: String,
    /// Present for user-authored entries, `null` for assistant entries.
    #[serde(default)]
    pub message_id: Option<u64>,
    /// Omitted entirely (not stored as null) when the user has no stored
    /// preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_name: Option<String>,
}

/// Construct an entry stamped with the current UTC time.
#[allow(clippy::too_many_arguments)]
pub fn build_entry(
    guild_id: Option<u64>,
    channel_id: u64,
    user_id: u64,
    display_name: &str,
    role: Role,
    content: &str,
    message_id: Option<u64>,
    preferred_name: Option<&str>,
) -> LogEntry {
    LogEntry {
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        guild_id,
        channel_id,
        user_id,
        display_name: display_name.to_string(),
        role,
        content: content.to_string(),
        message_id,
        preferred_name: preferred_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from),
    }
}

fn scope_dir(base: &Path, guild_id: Option<u64>) -> PathBuf {
    match guild_id {
        Some(guild_id) => base.join(format!("guild_{guild_id}")),
        None => base.join("dm"),
    }
}

fn guild_log_path(base: &Path, guild_id: Option<u64>) -> PathBuf {
    scope_dir(base, guild_id).join("guild.log.jsonl")
}

fn user_log_path(base: &Path, guild_id: Option<u64>, user_id: u64) -> PathBuf {
    scope_dir(base, guild_id)
        .join("users")
        .join(format!("{user_id}.log.jsonl"))
}

fn user_meta_path(base: &Path, guild_id: Option<u64>, user_id: u64) -> PathBuf {
    scope_dir(base, guild_id)
        .join("users")
        .join(format!("{user_id}.meta.json"))
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Append one entry to both the guild log and the author's user log. There
/// is no transaction across the two files; each append is a single line.
pub async fn append_entries(base: &Path, entry: &LogEntry) -> Result<()> {
    let line = serde_json::to_string(entry).map_err(anyhow::Error::from)?;
    append_line(&guild_log_path(base, entry.guild_id), &line).await?;
    append_line(&user_log_path(base, entry.guild_id, entry.user_id), &line).await?;
    Ok(())
}

async fn read_tail(path: &Path, max_lines: usize) -> Result<Vec<LogEntry>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    // Lines that fail to parse are dropped, not surfaced.
    let entries = lines[start..]
        .iter()
        .filter_map(|line| match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!(%error, path = %path.display(), "skipping malformed log line");
                None
            }
        })
        .collect();
    Ok(entries)
}

/// Last `max_lines` valid entries of a user's log, oldest first.
pub async fn read_user_log_tail(
    base: &Path,
    guild_id: Option<u64>,
    user_id: u64,
    max_lines: usize,
) -> Result<Vec<LogEntry>> {
    read_tail(&user_log_path(base, guild_id, user_id), max_lines).await
}

/// Last `max_lines` valid entries of a conversation-scope log, oldest first.
pub async fn read_guild_log_tail(
    base: &Path,
    guild_id: Option<u64>,
    max_lines: usize,
) -> Result<Vec<LogEntry>> {
    read_tail(&guild_log_path(base, guild_id), max_lines).await
}

/// Whole-record metadata read. Missing file or malformed JSON reads as an
/// empty record, never as an error.
pub async fn read_user_meta(
    base: &Path,
    guild_id: Option<u64>,
    user_id: u64,
) -> Map<String, Value> {
    let path = user_meta_path(base, guild_id, user_id);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(_) => return Map::new(),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Whole-record metadata overwrite. Unknown keys the caller carried through
/// from `read_user_meta` round-trip untouched.
pub async fn write_user_meta(
    base: &Path,
    guild_id: Option<u64>,
    user_id: u64,
    meta: &Map<String, Value>,
) -> Result<()> {
    let path = user_meta_path(base, guild_id, user_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string_pretty(meta).map_err(anyhow::Error::from)?;
    tokio::fs::write(&path, body).await?;
    Ok(())
}

/// The stored preferred name for a user, if any non-empty value exists.
pub async fn read_preferred_name(
    base: &Path,
    guild_id: Option<u64>,
    user_id: u64,
) -> Option<String> {
    let meta = read_user_meta(base, guild_id, user_id).await;
    match meta.get("preferred_name") {
        Some(Value::String(name)) if !name.trim().is_empty() => Some(name.trim().to_string()),
        _ => None,
    }
}

/// Store a preferred name, preserving any other keys in the record.
pub async fn write_preferred_name(
    base: &Path,
    guild_id: Option<u64>,
    user_id: u64,
    preferred_name: &str,
) -> Result<()> {
    let mut meta = read_user_meta(base, guild_id, user_id).await;
    meta.insert(
        "preferred_name".to_string(),
        Value::String(preferred_name.to_string()),
    );
    write_user_meta(base, guild_id, user_id, &meta).await
}
