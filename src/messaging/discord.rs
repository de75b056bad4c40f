//! Discord gateway adapter.
//!
//! Translates serenity events into [`InboundMessage`]s for the orchestrator
//! and implements [`ResponseSink`] over the Discord HTTP API. Only mentions
//! of the bot inside allowed guilds are forwarded; everything else is
//! ignored at this layer.

use crate::config::Settings;
use crate::conversation::Orchestrator;
use crate::error::TransportError;
use crate::messaging::ResponseSink;
use crate::{Attachment, InboundMessage, StatusUpdate};
use serenity::all::{
    ActivityData, Context, CreateCommand, CreateInteractionResponse,
    CreateInteractionResponseMessage, EventHandler, GatewayIntents, GuildId, Interaction, Message,
    Ready, Typing,
};
use serenity::async_trait;
use serenity::http::HttpError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Handler {
    settings: Arc<Settings>,
    orchestrator: Arc<Orchestrator>,
    commands_registered: AtomicBool,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(name = %ready.user.name, id = %ready.user.id, "gateway ready");
        self.orchestrator.set_bot_name(ready.user.name.clone());

        if let Some(status) = &self.settings.status_message {
            ctx.set_activity(Some(ActivityData::playing(status)));
        }

        // Register slash commands once per process, only in guilds the bot
        // is both configured for and actually joined to.
        if self.commands_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        for guild in &ready.guilds {
            if !self.settings.allowed_guild_ids.contains(&guild.id.get()) {
                continue;
            }
            if let Err(error) = register_commands(&ctx, guild.id).await {
                tracing::warn!(%error, guild_id = %guild.id, "failed to register commands");
            }
        }
    }

    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let Some(guild_id) = message.guild_id else {
            return;
        };
        if !self.settings.allowed_guild_ids.contains(&guild_id.get()) {
            return;
        }
        match message.mentions_me(&ctx).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                tracing::warn!(%error, "failed to resolve mentions");
                return;
            }
        }

        let bot_id = ctx.cache.current_user().id.get();
        let inbound = InboundMessage {
            message_id: message.id.get(),
            author_id: message.author.id.get(),
            author_display_name: display_name(&message),
            guild_id: Some(guild_id.get()),
            channel_id: message.channel_id.get(),
            content: strip_bot_mention(&message.content, bot_id),
            attachments: message.attachments.iter().map(adapt_attachment).collect(),
        };

        let sink = DiscordSink::new(&ctx, &message);
        if let Err(error) = self.orchestrator.handle_message(&inbound, &sink).await {
            tracing::error!(
                %error,
                channel_id = %message.channel_id,
                "failed to handle message"
            );
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        if command.data.name != "help" {
            return;
        }
        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(self.orchestrator.help_text())
                .ephemeral(true),
        );
        if let Err(error) = command.create_response(&ctx.http, response).await {
            tracing::warn!(%error, "failed to respond to help command");
        }
    }
}

async fn register_commands(ctx: &Context, guild_id: GuildId) -> serenity::Result<()> {
    guild_id
        .set_commands(
            &ctx.http,
            vec![CreateCommand::new("help").description("使い方を表示します")],
        )
        .await?;
    tracing::info!(%guild_id, "registered guild commands");
    Ok(())
}

/// Nickname if set, then global display name, then account name.
fn display_name(message: &Message) -> String {
    message
        .member
        .as_deref()
        .and_then(|member| member.nick.clone())
        .or_else(|| message.author.global_name.clone())
        .unwrap_or_else(|| message.author.name.clone())
}

/// Remove the first mention token for the bot and trim the remainder.
/// Further mentions stay in the content so the transcript keeps them.
fn strip_bot_mention(content: &str, bot_id: u64) -> String {
    let tokens = [format!("<@{bot_id}>"), format!("<@!{bot_id}>")];
    let first = tokens
        .iter()
        .filter_map(|token| content.find(token.as_str()).map(|at| (at, token.len())))
        .min_by_key(|&(at, _)| at);
    match first {
        Some((at, len)) => {
            format!("{}{}", &content[..at], &content[at + len..]).trim().to_string()
        }
        None => content.trim().to_string(),
    }
}

fn adapt_attachment(attachment: &serenity::all::Attachment) -> Attachment {
    Attachment {
        content_type: attachment.content_type.clone(),
        filename: attachment.filename.clone(),
        size_bytes: u64::from(attachment.size),
        url: attachment.url.clone(),
    }
}

fn classify_error(error: serenity::Error) -> TransportError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &error {
        if response.status_code.as_u16() == 403 {
            return TransportError::Forbidden;
        }
    }
    TransportError::Request(error.to_string())
}

/// Reply surface bound to one inbound message. The typing indicator is held
/// until a stop update or drop.
struct DiscordSink<'a> {
    ctx: &'a Context,
    message: &'a Message,
    typing: Mutex<Option<Typing>>,
}

impl<'a> DiscordSink<'a> {
    fn new(ctx: &'a Context, message: &'a Message) -> Self {
        Self { ctx, message, typing: Mutex::new(None) }
    }
}

#[async_trait]
impl ResponseSink for DiscordSink<'_> {
    async fn reply(&self, text: &str) -> Result<(), TransportError> {
        self.message
            .reply(&self.ctx.http, text)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }

    async fn send_status(&self, status: StatusUpdate) {
        let mut typing = self.typing.lock().expect("typing lock poisoned");
        match status {
            StatusUpdate::Thinking => {
                if typing.is_none() {
                    *typing = Some(self.message.channel_id.start_typing(&self.ctx.http));
                }
            }
            StatusUpdate::StopTyping => {
                if let Some(typing) = typing.take() {
                    typing.stop();
                }
            }
        }
    }

    async fn sync_commands(&self) -> Result<(), TransportError> {
        let Some(guild_id) = self.message.guild_id else {
            return Err(TransportError::Request(
                "command sync is only available inside a guild".into(),
            ));
        };
        register_commands(self.ctx, guild_id)
            .await
            .map_err(classify_error)
    }
}

/// Connect to the gateway and run until the connection ends.
pub async fn run(settings: Arc<Settings>, orchestrator: Arc<Orchestrator>) -> crate::Result<()> {
    let intents =
        GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
    let handler = Handler {
        settings: settings.clone(),
        orchestrator,
        commands_registered: AtomicBool::new(false),
    };
    let mut client = serenity::Client::builder(&settings.discord_bot_token, intents)
        .event_handler(handler)
        .await
        .map_err(|error| TransportError::Request(error.to_string()))?;
    client
        .start()
        .await
        .map_err(|error| TransportError::Request(error.to_string()))?;
    Ok(())
}
