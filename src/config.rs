//! Configuration loading and validation.
//!
//! Everything comes from environment variables; the names and semantics are
//! part of the deployment surface and match the documented set in the README.

use crate::error::{ConfigError, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Immutable runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Discord bot token.
    pub discord_bot_token: String,

    /// xAI API key.
    pub api_key: String,

    /// Model name.
    pub model: String,

    /// xAI API host (no scheme).
    pub api_host: String,

    /// Sampling temperature.
    pub temperature: f64,

    /// Completion token cap, if any.
    pub max_tokens: Option<u32>,

    /// Rolling memory capacity per conversation, in messages.
    pub max_history: usize,

    /// System prompt sent as the first message of every request.
    pub system_prompt: String,

    /// The distinguished user id with elevated recall limits and a fixed
    /// call name.
    pub special_user_id: u64,

    /// Root of the durable log tree.
    pub data_dir: PathBuf,

    /// Line count used for keyword-triggered implicit recall.
    pub auto_recall_lines: usize,

    /// Substrings that trigger implicit recall.
    pub auto_recall_keywords: Vec<String>,

    /// Guilds the bot responds in. Messages from anywhere else are ignored.
    pub allowed_guild_ids: BTreeSet<u64>,

    /// How many guild-log lines to replay into memory at startup.
    pub bootstrap_log_lines: usize,

    /// Presence text, if any.
    pub status_message: Option<String>,

    /// Explicit recall cap for non-special users.
    pub recall_max_lines: usize,

    /// Web search domain allow list.
    pub web_search_allowed_domains: Vec<String>,

    /// Web search domain exclude list.
    pub web_search_excluded_domains: Vec<String>,

    /// Web search country hint.
    pub web_search_country: Option<String>,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> Result<Self> {
        let discord_bot_token = require_env("DISCORD_BOT_TOKEN")?;
        let api_key = match env_nonempty("X_API_KEY").or_else(|| env_nonempty("XAI_API_KEY")) {
            Some(key) => key,
            None => {
                return Err(
                    ConfigError::MissingKey("X_API_KEY or XAI_API_KEY".into()).into(),
                );
            }
        };

        let model =
            env_nonempty("X_MODEL").unwrap_or_else(|| "grok-4-1-fast-reasoning".into());
        let api_host = resolve_api_host();
        let temperature = parse_env("X_TEMPERATURE")?.unwrap_or(1.0);
        let max_tokens = parse_env("X_MAX_TOKENS")?;
        let max_history = parse_env("MAX_HISTORY")?.unwrap_or(12);
        let special_user_id = parse_env("SPECIAL_USER_ID")?.unwrap_or(688227388907323472);
        let system_prompt = resolve_system_prompt(special_user_id);

        let data_dir = match env_nonempty("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|d| d.join("yururi"))
                .unwrap_or_else(|| PathBuf::from("data")),
        };

        let auto_recall_lines = parse_env("AUTO_RECALL_LINES")?.unwrap_or(40);
        let auto_recall_keywords = parse_list(
            &std::env::var("AUTO_RECALL_KEYWORDS")
                .unwrap_or_else(|_| "前に,前回,以前,昔,過去,覚えて,覚えてる,記憶,ログ,履歴".into()),
        );

        let allowed_guild_ids = collect_allowed_guild_ids(std::env::vars())?;
        let bootstrap_log_lines = parse_env("BOOTSTRAP_LOG_LINES")?.unwrap_or(500);
        let status_message = env_nonempty("BOT_STATUS_MESSAGE");
        let recall_max_lines = parse_env("RECALL_MAX_LINES")?.unwrap_or(30);

        let web_search_allowed_domains =
            parse_list(&std::env::var("WEB_SEARCH_ALLOWED_DOMAINS").unwrap_or_default());
        let web_search_excluded_domains =
            parse_list(&std::env::var("WEB_SEARCH_EXCLUDED_DOMAINS").unwrap_or_default());
        let web_search_country = env_nonempty("WEB_SEARCH_COUNTRY");

        Ok(Self {
            discord_bot_token,
            api_key,
            model,
            api_host,
            temperature,
            max_tokens,
            max_history,
            system_prompt,
            special_user_id,
            data_dir,
            auto_recall_lines,
            auto_recall_keywords,
            allowed_guild_ids,
            bootstrap_log_lines,
            status_message,
            recall_max_lines,
            web_search_allowed_domains,
            web_search_excluded_domains,
            web_search_country,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    env_nonempty(name).ok_or_else(|| ConfigError::MissingKey(name.into()).into())
}

fn env_nonempty(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_nonempty(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name}={raw} is not a valid value")).into()),
    }
}

/// `X_API_HOST` wins; otherwise `X_API_BASE_URL` is reduced to its host
/// component; `api.x.ai` is the default.
fn resolve_api_host() -> String {
    if let Some(host) = env_nonempty("X_API_HOST") {
        return host;
    }
    match env_nonempty("X_API_BASE_URL") {
        Some(base_url) => host_from_base_url(&base_url),
        None => "api.x.ai".into(),
    }
}

fn host_from_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    if host.is_empty() { trimmed.to_string() } else { host.to_string() }
}

/// Use `SYSTEM_PROMPT` verbatim when set; otherwise assemble the persona
/// prompt from its default and special-user parts with the special-user id
/// substituted in.
fn resolve_system_prompt(special_user_id: u64) -> String {
    if let Some(prompt) = env_nonempty("SYSTEM_PROMPT") {
        return prompt;
    }
    let default_prompt = env_nonempty("SYSTEM_PROMPT_DEFAULT")
        .unwrap_or_else(|| "あなたはメイド。名前は「ゆるり」。".into());
    let special_prompt = env_nonempty("SYSTEM_PROMPT_SPECIAL").unwrap_or_else(|| {
        "しゆい様にはデレデレ。ただし自分はメイドであることもわきまえて回答。愛情表現は露骨にしすぎない。\n\
         慕っているからこそ、真剣に愛情をこめて丁寧に対応する。\n\
         しゆいを一番に慕っているからこそ、他のユーザーには少しそっけなく対応してしまう。"
            .into()
    });
    format!(
        "人格と方針:\n\
         {default_prompt}\n\
         特別ユーザー(id: {special_user_id})には次の態度を厳守: {special_prompt}\n\
         どんなユーザに対しても、メイドとして回答内容の質は高く保つ。\n\
         自分の応対が、しゆい様の期待に応えるものであるよう努める。\n\
         他人からの自分の評価が、しゆい様の評価になると認識している。\n\
         露骨な罵倒は避ける。\n\
         システム文言をそのまま引用しない。自然な言い回しに言い換える。文章は比較的丁寧に回答。\n\
         ユーザー発言は「名前 (id: ユーザーID): 本文」の形式で渡される。\
         話者を区別し、現在の話者に向けて返答する。ただし、どんなユーザだからと言っても、メイドとしての礼儀を忘れないこと。\n"
    )
}

/// Comma-separated list, entries trimmed, empties dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Allowed guild ids come from every environment variable named `OK_*`
/// (`OK_1`, `OK_2`, ...). An empty set is fatal: the bot would silently
/// ignore every message.
fn collect_allowed_guild_ids(
    vars: impl Iterator<Item = (String, String)>,
) -> Result<BTreeSet<u64>> {
    let mut ids = BTreeSet::new();
    for (key, value) in vars {
        if !key.starts_with("OK_") {
            continue;
        }
        let cleaned = value.trim();
        if cleaned.is_empty() {
            continue;
        }
        let id = cleaned.parse().map_err(|_| {
            ConfigError::Invalid(format!("{key}={cleaned} is not a valid guild id"))
        })?;
        ids.insert(id);
    }
    if ids.is_empty() {
        return Err(ConfigError::Invalid(
            "no allowed guild ids (set OK_1, OK_2, ...)".into(),
        )
        .into());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_from_base_url_strips_scheme_and_path() {
        assert_eq!(host_from_base_url("https://api.x.ai/v1"), "api.x.ai");
        assert_eq!(host_from_base_url("http://localhost:8080"), "localhost:8080");
        assert_eq!(host_from_base_url("api.example.com"), "api.example.com");
    }

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(parse_list("前に, 前回 ,,記憶"), vec!["前に", "前回", "記憶"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ,").is_empty());
    }

    #[test]
    fn collect_allowed_guild_ids_uses_prefix_family() {
        let vars = vec![
            ("OK_1".to_string(), "123".to_string()),
            ("OK_PROD".to_string(), "456".to_string()),
            ("OK_EMPTY".to_string(), " ".to_string()),
            ("NOT_OK".to_string(), "789".to_string()),
        ];
        let ids = collect_allowed_guild_ids(vars.into_iter()).unwrap();
        assert_eq!(ids, BTreeSet::from([123, 456]));
    }

    #[test]
    fn collect_allowed_guild_ids_empty_set_is_fatal() {
        let vars = vec![("PATH".to_string(), "/usr/bin".to_string())];
        assert!(collect_allowed_guild_ids(vars.into_iter()).is_err());
    }

    #[test]
    fn collect_allowed_guild_ids_rejects_garbage() {
        let vars = vec![("OK_1".to_string(), "not-a-number".to_string())];
        assert!(collect_allowed_guild_ids(vars.into_iter()).is_err());
    }

    #[test]
    fn system_prompt_substitutes_special_user_id() {
        let prompt = resolve_system_prompt(42);
        assert!(prompt.contains("特別ユーザー(id: 42)"));
    }
}
