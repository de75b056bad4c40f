//! Conversation orchestration: per-conversation locking, intent dispatch,
//! prompt assembly, and the durable-log/memory bookkeeping around each turn.

use crate::config::Settings;
use crate::error::{Result, TransportError};
use crate::llm::{ChatClient, ChatOptions};
use crate::memory::Memory;
use crate::messaging::{collect_image_urls, ResponseSink};
use crate::names::{is_reserved_name, normalize_preferred_name, resolve_call_name};
use crate::reply::{chunk_text, tool_footer, DEFAULT_CHUNK_LIMIT};
use crate::router::{classify, Intent, Recall, ToolFlags};
use crate::transcript::{self, LogEntry};
use crate::{ChatMessage, ConversationKey, InboundMessage, Role, StatusUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const MENTION_ONLY_CONTENT: &str = "（メンションのみ）";
const RECALL_HEADER: &str = "以下は過去ログの抜粋です。";
const CODE_DIRECTIVE: &str =
    "この入力では code_execution ツールを必ず使う。ツールで計算・検証した結果を根拠に回答する。";

const CLEAR_REPLY: &str = "このチャンネルの会話履歴をクリアしました。ログは保持されます。";
const EMPTY_TOOL_REPLY: &str = "実行したい内容を書いてください。";
const RENAME_EMPTY_REPLY: &str = "呼び方が空でした。もう一度教えてください。";
const RENAME_RESERVED_REPLY: &str = "その呼称は使用できません。別の呼び方を指定してください。";
const API_FAILURE_REPLY: &str = "API呼び出しに失敗しました。しばらくしてから再試行してください。";
const SYNC_OK_REPLY: &str = "スラッシュコマンドを同期しました。";
const SYNC_FORBIDDEN_REPLY: &str = "同期に失敗しました。権限を確認してください。";
const SYNC_FAILED_REPLY: &str = "同期に失敗しました。しばらくして再試行してください。";

/// Binds memory, the durable log, and the LLM client into the per-message
/// control flow. One instance per process, shared by the gateway.
pub struct Orchestrator {
    settings: Arc<Settings>,
    llm: Arc<dyn ChatClient>,
    memory: Arc<dyn Memory>,
    /// One mutex per conversation ever seen, created lazily and never
    /// pruned. Cardinality is the number of channels the bot can see, so
    /// unbounded growth is acceptable here.
    locks: Mutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
    /// Bot display name for assistant log entries, set once the gateway
    /// knows who it logged in as.
    bot_name: std::sync::OnceLock<String>,
}

impl Orchestrator {
    pub fn new(settings: Arc<Settings>, llm: Arc<dyn ChatClient>, memory: Arc<dyn Memory>) -> Self {
        Self {
            settings,
            llm,
            memory,
            locks: Mutex::new(HashMap::new()),
            bot_name: std::sync::OnceLock::new(),
        }
    }

    /// Record the logged-in bot name. Later calls are ignored.
    pub fn set_bot_name(&self, name: impl Into<String>) {
        let _ = self.bot_name.set(name.into());
    }

    fn bot_name(&self) -> &str {
        self.bot_name.get().map(String::as_str).unwrap_or("bot")
    }

    /// Static usage summary, built from the current configuration.
    pub fn help_text(&self) -> String {
        let auto_keywords = self.settings.auto_recall_keywords.join(" / ");
        [
            "使い方".to_string(),
            "- メンション: @bot こんにちは".to_string(),
            "- 呼称指定: @bot 〇〇って呼称してほしい".to_string(),
            "- 過去ログ: @bot /recall 10（末尾10行を追加）".to_string(),
            format!(
                "- /recall 上限: {}（特別ユーザーは無制限）",
                self.settings.recall_max_lines
            ),
            "- 会話履歴クリア: @bot /clear".to_string(),
            "- ツール: Web/X/コードは常時有効（/web /x /code は明示指示用）".to_string(),
            "- Web検索: @bot /web 質問内容".to_string(),
            "- X検索: @bot /x 質問内容".to_string(),
            "- コード実行: @bot /code 計算内容".to_string(),
            "- 画像入力: メンション + 画像（最大2枚）".to_string(),
            format!("- 自動リコール: {auto_keywords}"),
        ]
        .join("\n")
    }

    /// Process one eligible inbound message end to end. The conversation's
    /// lock is held for the whole sequence, including the LLM call and the
    /// log writes, so rapid-fire messages in one channel never interleave.
    pub async fn handle_message(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
    ) -> Result<()> {
        let key = inbound.conversation_key();
        let lock = self.conversation_lock(key).await;
        let _guard = lock.lock().await;

        let mut content = inbound.content.trim().to_string();
        if content.is_empty() {
            content = MENTION_ONLY_CONTENT.to_string();
        }

        let image_urls = collect_image_urls(&inbound.attachments);
        if !image_urls.is_empty() {
            tracing::info!(
                count = image_urls.len(),
                user_id = inbound.author_id,
                %key,
                "image attachments"
            );
        }

        match classify(&content, &self.settings.auto_recall_keywords) {
            Intent::Sync => self.handle_sync(inbound, sink).await,
            Intent::Help => self.handle_help(inbound, sink, key, &content).await,
            Intent::Clear => self.handle_clear(inbound, sink, key, &content).await,
            Intent::EmptyToolQuery { .. } => self.handle_empty_tool(inbound, sink, key).await,
            Intent::Rename { candidate, content } => {
                self.handle_rename(inbound, sink, key, &candidate, &content).await
            }
            Intent::Chat { tools, recall, content } => {
                self.handle_chat(inbound, sink, key, tools, recall, &content, &image_urls)
                    .await
            }
        }
    }

    async fn conversation_lock(&self, key: ConversationKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_default().clone()
    }

    async fn handle_sync(&self, inbound: &InboundMessage, sink: &dyn ResponseSink) -> Result<()> {
        match sink.sync_commands().await {
            Ok(()) => {
                tracing::info!(guild_id = ?inbound.guild_id, "synced commands");
                sink.reply(SYNC_OK_REPLY).await?;
            }
            Err(TransportError::Forbidden) => {
                tracing::warn!(
                    guild_id = ?inbound.guild_id,
                    "missing access to sync commands"
                );
                sink.reply(SYNC_FORBIDDEN_REPLY).await?;
            }
            Err(error) => {
                tracing::error!(%error, guild_id = ?inbound.guild_id, "failed to sync commands");
                sink.reply(SYNC_FAILED_REPLY).await?;
            }
        }
        Ok(())
    }

    async fn handle_help(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
        key: ConversationKey,
        content: &str,
    ) -> Result<()> {
        let reply = self.help_text();
        sink.reply(&reply).await?;
        self.log_exchange(inbound, content, &reply).await?;
        let call_name = self.call_name(inbound).await;
        self.memory.append(
            key,
            ChatMessage::user(format_user_message(&call_name, inbound.author_id, content)),
        );
        self.memory.append(key, ChatMessage::assistant(reply));
        Ok(())
    }

    async fn handle_clear(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
        key: ConversationKey,
        content: &str,
    ) -> Result<()> {
        // Memory is a cache; the durable log is a permanent record and is
        // deliberately left untouched.
        self.memory.clear(key);
        sink.reply(CLEAR_REPLY).await?;
        self.log_exchange(inbound, content, CLEAR_REPLY).await
    }

    async fn handle_empty_tool(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
        key: ConversationKey,
    ) -> Result<()> {
        sink.reply(EMPTY_TOOL_REPLY).await?;
        self.log_exchange(inbound, "", EMPTY_TOOL_REPLY).await?;
        let call_name = self.call_name(inbound).await;
        self.memory.append(
            key,
            ChatMessage::user(format_user_message(&call_name, inbound.author_id, "")),
        );
        self.memory.append(key, ChatMessage::assistant(EMPTY_TOOL_REPLY));
        Ok(())
    }

    async fn handle_rename(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
        key: ConversationKey,
        candidate: &str,
        content: &str,
    ) -> Result<()> {
        let normalized = normalize_preferred_name(candidate);
        let reply = if normalized.is_empty() {
            RENAME_EMPTY_REPLY.to_string()
        } else if inbound.author_id != self.settings.special_user_id
            && is_reserved_name(&normalized)
        {
            RENAME_RESERVED_REPLY.to_string()
        } else {
            transcript::write_preferred_name(
                &self.settings.data_dir,
                inbound.guild_id,
                inbound.author_id,
                &normalized,
            )
            .await?;
            tracing::info!(user_id = inbound.author_id, name = %normalized, "preferred name stored");
            format!("了解しました。これからは「{normalized}」と呼びます。")
        };
        sink.reply(&reply).await?;
        self.log_exchange(inbound, content, &reply).await?;
        self.memory.append(key, ChatMessage::user(content));
        self.memory.append(key, ChatMessage::assistant(reply));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chat(
        &self,
        inbound: &InboundMessage,
        sink: &dyn ResponseSink,
        key: ConversationKey,
        tools: ToolFlags,
        recall: Recall,
        content: &str,
        image_urls: &[String],
    ) -> Result<()> {
        if tools.any() {
            tracing::info!(
                web = tools.web,
                x = tools.x,
                code = tools.code,
                user_id = inbound.author_id,
                %key,
                "tool prefixes requested"
            );
        }

        let recall_lines = self.recall_line_count(inbound.author_id, recall);
        let history = self.memory.get(key);
        let recall_context = match recall_lines {
            Some(lines) => self.recall_context(inbound, lines).await?,
            None => None,
        };
        let call_name = self.call_name(inbound).await;

        let content_for_context = if image_urls.is_empty() {
            content.to_string()
        } else {
            format!("{content}\n（画像{}枚添付）", image_urls.len())
        };

        let messages = self.build_messages(
            &history,
            content,
            recall_context.as_deref(),
            inbound.author_id,
            &call_name,
            tools.code,
        );

        sink.send_status(StatusUpdate::Thinking).await;
        tracing::info!(user_id = inbound.author_id, %key, "calling chat API");
        let options = ChatOptions {
            user_id: Some(inbound.author_id.to_string()),
            enable_web_search: true,
            enable_x_search: true,
            enable_code_execution: true,
            web_search_allowed_domains: self.settings.web_search_allowed_domains.clone(),
            web_search_excluded_domains: self.settings.web_search_excluded_domains.clone(),
            web_search_country: self.settings.web_search_country.clone(),
            image_urls: image_urls.to_vec(),
        };
        let result = self.llm.chat(&messages, options).await;
        sink.send_status(StatusUpdate::StopTyping).await;

        let result = match result {
            Ok(result) => result,
            Err(error) => {
                // The failed turn is dropped: no memory or log mutation.
                tracing::warn!(%error, user_id = inbound.author_id, "chat API call failed");
                sink.reply(API_FAILURE_REPLY).await?;
                return Ok(());
            }
        };
        tracing::info!(user_id = inbound.author_id, "chat API response received");

        let footer = tool_footer(&result.tool_calls, None, Some(result.citations.len()));
        let reply = format!("{}\n{footer}", result.content).trim().to_string();

        self.log_exchange(inbound, &content_for_context, &reply).await?;
        self.memory.append(
            key,
            ChatMessage::user(format_user_message(
                &call_name,
                inbound.author_id,
                &content_for_context,
            )),
        );
        self.memory.append(key, ChatMessage::assistant(reply.clone()));

        for chunk in chunk_text(&reply, DEFAULT_CHUNK_LIMIT) {
            sink.reply(&chunk).await?;
        }
        Ok(())
    }

    /// Effective recall line count: explicit requests are clamped to at
    /// least one line and, for everyone but the special user, to the
    /// configured maximum; keyword-triggered recall uses its own count
    /// without the maximum clamp.
    fn recall_line_count(&self, author_id: u64, recall: Recall) -> Option<usize> {
        match recall {
            Recall::None => None,
            Recall::Auto => Some(self.settings.auto_recall_lines),
            Recall::Explicit(lines) => {
                let mut lines = lines.max(1);
                if author_id != self.settings.special_user_id {
                    lines = lines.min(self.settings.recall_max_lines);
                }
                Some(lines)
            }
        }
    }

    async fn recall_context(
        &self,
        inbound: &InboundMessage,
        lines: usize,
    ) -> Result<Option<String>> {
        let entries = transcript::read_user_log_tail(
            &self.settings.data_dir,
            inbound.guild_id,
            inbound.author_id,
            lines,
        )
        .await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let block = self.format_recall_entries(&entries);
        Ok(Some(format!("{RECALL_HEADER}\n{block}")))
    }

    /// Recalled entries are re-labeled under the current naming policy, not
    /// the labels frozen at write time.
    fn format_recall_entries(&self, entries: &[LogEntry]) -> String {
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| {
                let call_name = resolve_call_name(
                    entry.user_id,
                    self.settings.special_user_id,
                    &entry.display_name,
                    entry.preferred_name.as_deref(),
                );
                format!("[{}] {} ({}): {}", entry.ts, call_name, entry.role, entry.content)
            })
            .collect();
        lines.join("\n")
    }

    fn build_messages(
        &self,
        history: &[ChatMessage],
        content: &str,
        recall_context: Option<&str>,
        user_id: u64,
        call_name: &str,
        code_requested: bool,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.settings.system_prompt.clone())];
        if code_requested {
            messages.push(ChatMessage::system(CODE_DIRECTIVE));
        }
        let content = match recall_context {
            Some(context) => format!("{context}\n\n{content}"),
            None => content.to_string(),
        };
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(format_user_message(call_name, user_id, &content)));
        messages
    }

    async fn call_name(&self, inbound: &InboundMessage) -> String {
        let preferred = transcript::read_preferred_name(
            &self.settings.data_dir,
            inbound.guild_id,
            inbound.author_id,
        )
        .await;
        resolve_call_name(
            inbound.author_id,
            self.settings.special_user_id,
            &inbound.author_display_name,
            preferred.as_deref(),
        )
    }

    /// Write the user and assistant entries of one exchange to both logs.
    async fn log_exchange(
        &self,
        inbound: &InboundMessage,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<()> {
        let preferred = transcript::read_preferred_name(
            &self.settings.data_dir,
            inbound.guild_id,
            inbound.author_id,
        )
        .await;
        let user_entry = transcript::build_entry(
            inbound.guild_id,
            inbound.channel_id,
            inbound.author_id,
            &inbound.author_display_name,
            Role::User,
            user_content,
            Some(inbound.message_id),
            preferred.as_deref(),
        );
        transcript::append_entries(&self.settings.data_dir, &user_entry).await?;
        let assistant_entry = transcript::build_entry(
            inbound.guild_id,
            inbound.channel_id,
            inbound.author_id,
            self.bot_name(),
            Role::Assistant,
            assistant_content,
            None,
            preferred.as_deref(),
        );
        transcript::append_entries(&self.settings.data_dir, &assistant_entry).await
    }

    /// Rebuild rolling memory from the guild log tails. Memory loss is
    /// non-fatal, so any read failure only logs a warning.
    pub async fn bootstrap(&self) {
        let max_lines = self.settings.bootstrap_log_lines;
        if max_lines == 0 {
            return;
        }
        for &guild_id in &self.settings.allowed_guild_ids {
            let entries = match transcript::read_guild_log_tail(
                &self.settings.data_dir,
                Some(guild_id),
                max_lines,
            )
            .await
            {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(%error, guild_id, "failed to read guild log for bootstrap");
                    continue;
                }
            };

            let mut channel_histories: HashMap<ConversationKey, Vec<ChatMessage>> = HashMap::new();
            for entry in entries {
                let key = ConversationKey { guild_id: Some(guild_id), channel_id: entry.channel_id };
                let message = match entry.role {
                    Role::User => {
                        let call_name = resolve_call_name(
                            entry.user_id,
                            self.settings.special_user_id,
                            &entry.display_name,
                            entry.preferred_name.as_deref(),
                        );
                        ChatMessage::user(format_user_message(
                            &call_name,
                            entry.user_id,
                            &entry.content,
                        ))
                    }
                    Role::Assistant => ChatMessage::assistant(entry.content),
                    Role::System => continue,
                };
                channel_histories.entry(key).or_default().push(message);
            }

            for (key, history) in channel_histories {
                tracing::debug!(%key, size = history.len(), "bootstrapping memory");
                self.memory.load_history(key, history);
            }
        }
    }
}

fn format_user_message(call_name: &str, user_id: u64, content: &str) -> String {
    format!("{call_name} (id: {user_id}): {content}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::ChatResult;
    use crate::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    const SPECIAL_USER: u64 = 99;

    fn settings(data_dir: &std::path::Path) -> Arc<Settings> {
        Arc::new(Settings {
            discord_bot_token: "token".into(),
            api_key: "key".into(),
            model: "grok-test".into(),
            api_host: "api.x.ai".into(),
            temperature: 1.0,
            max_tokens: None,
            max_history: 6,
            system_prompt: "system prompt".into(),
            special_user_id: SPECIAL_USER,
            data_dir: data_dir.to_path_buf(),
            auto_recall_lines: 5,
            auto_recall_keywords: vec!["覚えて".into()],
            allowed_guild_ids: BTreeSet::from([1]),
            bootstrap_log_lines: 100,
            status_message: None,
            recall_max_lines: 3,
            web_search_allowed_domains: vec![],
            web_search_excluded_domains: vec![],
            web_search_country: None,
        })
    }

    /// Chat client that records the prompts it receives.
    struct FakeChat {
        result: StdMutex<Option<ChatResult>>,
        calls: StdMutex<Vec<Vec<ChatMessage>>>,
    }

    impl FakeChat {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                result: StdMutex::new(Some(ChatResult {
                    content: content.to_string(),
                    ..Default::default()
                })),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: StdMutex::new(None),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_prompt(&self) -> Vec<ChatMessage> {
            self.calls.lock().unwrap().last().cloned().expect("no chat calls recorded")
        }
    }

    #[async_trait]
    impl ChatClient for FakeChat {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> std::result::Result<ChatResult, LlmError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            match self.result.lock().unwrap().clone() {
                Some(result) => Ok(result),
                None => Err(LlmError::InvalidResponse("test failure".into())),
            }
        }
    }

    /// Sink that records replies and can simulate sync failures.
    #[derive(Default)]
    struct FakeSink {
        replies: StdMutex<Vec<String>>,
        sync_error: StdMutex<Option<TransportError>>,
    }

    impl FakeSink {
        fn replies(&self) -> Vec<String> {
            self.replies.lock().unwrap().clone()
        }

        fn forbidden_sync() -> Self {
            Self {
                replies: StdMutex::new(Vec::new()),
                sync_error: StdMutex::new(Some(TransportError::Forbidden)),
            }
        }
    }

    #[async_trait]
    impl ResponseSink for FakeSink {
        async fn reply(&self, text: &str) -> std::result::Result<(), TransportError> {
            self.replies.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_status(&self, _status: StatusUpdate) {}

        async fn sync_commands(&self) -> std::result::Result<(), TransportError> {
            match self.sync_error.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            message_id: 1000,
            author_id: 3,
            author_display_name: "alice".into(),
            guild_id: Some(1),
            channel_id: 2,
            content: content.to_string(),
            attachments: vec![],
        }
    }

    fn orchestrator(
        dir: &tempfile::TempDir,
        llm: Arc<FakeChat>,
    ) -> (Orchestrator, Arc<InMemoryStore>) {
        let memory = Arc::new(InMemoryStore::new(6));
        let orchestrator = Orchestrator::new(settings(dir.path()), llm, memory.clone());
        (orchestrator, memory)
    }

    #[tokio::test]
    async fn chat_turn_updates_memory_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("こんにちは、alice様。");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator.handle_message(&inbound("やあ"), &sink).await.unwrap();

        let replies = sink.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("こんにちは、alice様。"));
        assert!(replies[0].ends_with("-# tools: none"));

        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        let history = memory.get(key);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ChatMessage::user("alice (id: 3): やあ"));
        assert_eq!(history[1].role, Role::Assistant);

        let tail = transcript::read_user_log_tail(dir.path(), Some(1), 3, 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].role, Role::User);
        assert_eq!(tail[0].content, "やあ");
        assert_eq!(tail[0].message_id, Some(1000));
        assert_eq!(tail[1].role, Role::Assistant);
        assert_eq!(tail[1].message_id, None);
    }

    #[tokio::test]
    async fn prompt_carries_system_history_and_formatted_turn() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        memory.append(key, ChatMessage::user("alice (id: 3): 前の発言"));

        orchestrator
            .handle_message(&inbound("続きをどうぞ"), &FakeSink::default())
            .await
            .unwrap();

        let prompt = llm.last_prompt();
        assert_eq!(prompt[0], ChatMessage::system("system prompt"));
        assert_eq!(prompt[1], ChatMessage::user("alice (id: 3): 前の発言"));
        assert_eq!(prompt[2], ChatMessage::user("alice (id: 3): 続きをどうぞ"));
    }

    #[tokio::test]
    async fn code_prefix_adds_directive_and_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("4");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        orchestrator
            .handle_message(&inbound("/code 2+2"), &FakeSink::default())
            .await
            .unwrap();

        let prompt = llm.last_prompt();
        assert_eq!(prompt[1], ChatMessage::system(CODE_DIRECTIVE));
        assert_eq!(prompt[2], ChatMessage::user("alice (id: 3): 2+2"));
    }

    #[tokio::test]
    async fn clear_drops_memory_but_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        memory.append(key, ChatMessage::user("old"));

        let sink = FakeSink::default();
        orchestrator.handle_message(&inbound("/clear"), &sink).await.unwrap();

        assert!(memory.get(key).is_empty());
        assert_eq!(sink.replies(), vec![CLEAR_REPLY]);
        assert_eq!(llm.call_count(), 0);

        // The durable log keeps the exchange.
        let tail = transcript::read_guild_log_tail(dir.path(), Some(1), 10).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn clear_phrase_inside_chat_is_not_clear() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        memory.append(key, ChatMessage::user("old"));

        orchestrator
            .handle_message(&inbound("clear me please"), &FakeSink::default())
            .await
            .unwrap();

        assert_eq!(llm.call_count(), 1);
        assert!(!memory.get(key).is_empty());
    }

    #[tokio::test]
    async fn failed_chat_call_drops_the_turn() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::failing();
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator.handle_message(&inbound("やあ"), &sink).await.unwrap();

        assert_eq!(sink.replies(), vec![API_FAILURE_REPLY]);
        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        assert!(memory.get(key).is_empty());
        let tail = transcript::read_guild_log_tail(dir.path(), Some(1), 10).await.unwrap();
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn empty_tool_query_prompts_for_content() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator.handle_message(&inbound("/web"), &sink).await.unwrap();

        assert_eq!(sink.replies(), vec![EMPTY_TOOL_REPLY]);
        assert_eq!(llm.call_count(), 0);
        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        let history = memory.get(key);
        assert_eq!(history[0], ChatMessage::user("alice (id: 3): "));
        assert_eq!(history[1], ChatMessage::assistant(EMPTY_TOOL_REPLY));
    }

    #[tokio::test]
    async fn rename_persists_and_later_turns_use_it() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator
            .handle_message(&inbound("「ねこ」って呼んでほしい"), &sink)
            .await
            .unwrap();
        assert_eq!(sink.replies(), vec!["了解しました。これからは「ねこ」と呼びます。"]);
        assert_eq!(llm.call_count(), 0);

        orchestrator.handle_message(&inbound("やあ"), &sink).await.unwrap();
        let prompt = llm.last_prompt();
        assert_eq!(prompt.last().unwrap().content, "ねこ (id: 3): やあ");
    }

    #[tokio::test]
    async fn reserved_rename_is_rejected_for_normal_users() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator
            .handle_message(&inbound("しゆいって呼んでほしい"), &sink)
            .await
            .unwrap();

        assert_eq!(sink.replies(), vec![RENAME_RESERVED_REPLY]);
        assert!(
            transcript::read_preferred_name(dir.path(), Some(1), 3).await.is_none()
        );
    }

    #[tokio::test]
    async fn special_user_may_claim_reserved_name() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        let mut message = inbound("しゆい様って呼んでほしい");
        message.author_id = SPECIAL_USER;
        orchestrator.handle_message(&message, &sink).await.unwrap();

        assert_eq!(
            transcript::read_preferred_name(dir.path(), Some(1), SPECIAL_USER)
                .await
                .as_deref(),
            Some("しゆい様")
        );
    }

    #[tokio::test]
    async fn explicit_recall_prepends_relabeled_context() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        for i in 0..5 {
            let entry = transcript::build_entry(
                Some(1),
                2,
                3,
                "alice",
                Role::User,
                &format!("過去の発言{i}"),
                Some(i),
                None,
            );
            transcript::append_entries(dir.path(), &entry).await.unwrap();
        }

        orchestrator
            .handle_message(&inbound("/recall 10 何の話だった？"), &FakeSink::default())
            .await
            .unwrap();

        let prompt = llm.last_prompt();
        let turn = &prompt.last().unwrap().content;
        assert!(turn.contains(RECALL_HEADER));
        assert!(turn.ends_with("何の話だった？"));
        // recall_max_lines is 3 for non-special users.
        assert!(turn.contains("過去の発言4"));
        assert!(turn.contains("過去の発言2"));
        assert!(!turn.contains("過去の発言1"));
    }

    #[tokio::test]
    async fn special_user_recall_is_unclamped() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        for i in 0..5 {
            let entry = transcript::build_entry(
                Some(1),
                2,
                SPECIAL_USER,
                "boss",
                Role::User,
                &format!("発言{i}"),
                Some(i),
                None,
            );
            transcript::append_entries(dir.path(), &entry).await.unwrap();
        }

        let mut message = inbound("/recall 10 どう？");
        message.author_id = SPECIAL_USER;
        orchestrator.handle_message(&message, &FakeSink::default()).await.unwrap();

        let prompt = llm.last_prompt();
        let turn = &prompt.last().unwrap().content;
        assert!(turn.contains("発言0"));
        // The special user's entries are re-labeled with the fixed name.
        assert!(turn.contains("しゆい (user): 発言0"));
    }

    #[tokio::test]
    async fn auto_recall_triggers_on_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        let entry =
            transcript::build_entry(Some(1), 2, 3, "alice", Role::User, "昔の話", Some(1), None);
        transcript::append_entries(dir.path(), &entry).await.unwrap();

        orchestrator
            .handle_message(&inbound("あれ覚えてる？"), &FakeSink::default())
            .await
            .unwrap();

        let prompt = llm.last_prompt();
        assert!(prompt.last().unwrap().content.contains(RECALL_HEADER));
    }

    #[tokio::test]
    async fn recall_with_no_log_adds_no_context() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("ok");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        orchestrator
            .handle_message(&inbound("recall 3"), &FakeSink::default())
            .await
            .unwrap();

        let prompt = llm.last_prompt();
        let turn = &prompt.last().unwrap().content;
        assert!(!turn.contains(RECALL_HEADER));
        assert!(turn.contains(crate::router::RECALL_FILLER_CONTENT));
    }

    #[tokio::test]
    async fn sync_permission_failure_gets_specific_reply() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        let sink = FakeSink::forbidden_sync();
        orchestrator.handle_message(&inbound("/sync"), &sink).await.unwrap();
        assert_eq!(sink.replies(), vec![SYNC_FORBIDDEN_REPLY]);

        let sink = FakeSink::default();
        orchestrator.handle_message(&inbound("sync"), &sink).await.unwrap();
        assert_eq!(sink.replies(), vec![SYNC_OK_REPLY]);
    }

    #[tokio::test]
    async fn help_replies_with_usage_and_records_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator.handle_message(&inbound("使い方"), &sink).await.unwrap();

        let replies = sink.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("/recall 上限: 3"));
        assert!(replies[0].contains("自動リコール: 覚えて"));
        assert_eq!(llm.call_count(), 0);

        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        assert_eq!(memory.get(key).len(), 2);
    }

    #[tokio::test]
    async fn mention_only_message_gets_placeholder_content() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("はい");
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());

        orchestrator.handle_message(&inbound("   "), &FakeSink::default()).await.unwrap();

        let prompt = llm.last_prompt();
        assert_eq!(
            prompt.last().unwrap().content,
            format!("alice (id: 3): {MENTION_ONLY_CONTENT}")
        );
    }

    #[tokio::test]
    async fn image_attachments_noted_in_context_and_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("見ました");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());

        let mut message = inbound("これ見て");
        message.attachments = vec![crate::Attachment {
            content_type: Some("image/png".into()),
            filename: "a.png".into(),
            size_bytes: 100,
            url: "https://cdn.example/a.png".into(),
        }];
        orchestrator.handle_message(&message, &FakeSink::default()).await.unwrap();

        let key = ConversationKey { guild_id: Some(1), channel_id: 2 };
        let history = memory.get(key);
        assert_eq!(history[0].content, "alice (id: 3): これ見て\n（画像1枚添付）");
    }

    #[tokio::test]
    async fn long_replies_are_chunked_with_footer_on_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying(&"long ".repeat(500));
        let (orchestrator, _memory) = orchestrator(&dir, llm.clone());
        let sink = FakeSink::default();

        orchestrator.handle_message(&inbound("語って"), &sink).await.unwrap();

        let replies = sink.replies();
        assert!(replies.len() >= 2);
        assert!(replies.iter().all(|chunk| chunk.chars().count() <= DEFAULT_CHUNK_LIMIT));
        assert!(replies.last().unwrap().ends_with("-# tools: none"));
    }

    #[tokio::test]
    async fn bootstrap_seeds_memory_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let llm = FakeChat::replying("unused");
        let (orchestrator, memory) = orchestrator(&dir, llm.clone());

        for (channel_id, text) in [(2u64, "一つ目"), (7u64, "二つ目")] {
            let entry = transcript::build_entry(
                Some(1),
                channel_id,
                3,
                "alice",
                Role::User,
                text,
                Some(1),
                None,
            );
            transcript::append_entries(dir.path(), &entry).await.unwrap();
            let reply = transcript::build_entry(
                Some(1),
                channel_id,
                3,
                "bot",
                Role::Assistant,
                "返事",
                None,
                None,
            );
            transcript::append_entries(dir.path(), &reply).await.unwrap();
        }

        orchestrator.bootstrap().await;

        let first = memory.get(ConversationKey { guild_id: Some(1), channel_id: 2 });
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], ChatMessage::user("alice (id: 3): 一つ目"));
        assert_eq!(first[1], ChatMessage::assistant("返事"));

        let second = memory.get(ConversationKey { guild_id: Some(1), channel_id: 7 });
        assert_eq!(second[0], ChatMessage::user("alice (id: 3): 二つ目"));
    }
}
