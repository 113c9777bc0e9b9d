//! Discord input using serenity
//!
//! Listens for prefixed commands, mentions, and direct messages, publishes
//! the question on the bus, and posts the engine's answer back to the
//! channel it came from.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serenity::Client;
use serenity::all::{ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Message, Ready};
use serenity::http::Http;
use uuid::Uuid;

use super::{InputFactory, InputModule, ModuleContext};
use crate::bus::{Envelope, EnvelopeKind, MessageBus};
use crate::config::ModuleConfig;
use crate::{Error, Result};

/// Longest message Discord accepts
const MESSAGE_LIMIT: usize = 2000;

/// Questions awaiting an answer; the oldest are forgotten beyond this
const MAX_ROUTES: usize = 256;

/// Discord input settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Falls back to `DISCORD_TOKEN`
    #[serde(alias = "bot_token")]
    pub token: Option<String>,
    #[serde(default = "default_prefix")]
    pub command_prefix: String,
    /// Channel ids allowed to talk to the bot; empty allows all
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    /// User ids allowed to talk to the bot; empty allows all
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

fn default_prefix() -> String {
    "!".to_string()
}

impl DiscordConfig {
    fn token(&self) -> Result<SecretString> {
        self.token
            .clone()
            .or_else(|| std::env::var("DISCORD_TOKEN").ok())
            .filter(|t| !t.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| {
                Error::ConfigValidation(
                    "discord input needs token (or DISCORD_TOKEN)".to_string(),
                )
            })
    }

    fn access(&self) -> Result<Access> {
        Ok(Access {
            channels: parse_ids("allowed_channels", &self.allowed_channels)?,
            users: parse_ids("allowed_users", &self.allowed_users)?,
        })
    }

    fn check(&self) -> Result<()> {
        if self.command_prefix.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "command_prefix must not be empty".to_string(),
            ));
        }
        self.access()?;
        self.token().map(|_| ())
    }
}

fn parse_ids(field: &str, ids: &[String]) -> Result<Vec<u64>> {
    ids.iter()
        .map(|id| {
            id.trim().parse::<u64>().map_err(|_| {
                Error::ConfigValidation(format!("{field}: {id:?} is not a Discord id"))
            })
        })
        .collect()
}

/// Channel and user allow-lists
#[derive(Debug, Clone, Default)]
struct Access {
    channels: Vec<u64>,
    users: Vec<u64>,
}

impl Access {
    fn admits(&self, channel: u64, user: u64) -> bool {
        (self.channels.is_empty() || self.channels.contains(&channel))
            && (self.users.is_empty() || self.users.contains(&user))
    }
}

/// What a Discord message asks of the bot
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Ask(String),
    /// `ask` with nothing after it
    MissingQuestion,
    Status,
    Help,
}

/// Work out what `content` asks for
///
/// Prefixed commands always count. Plain text counts only when the bot was
/// mentioned or messaged directly; its mention tokens are stripped.
fn interpret(content: &str, prefix: &str, bot_id: Option<u64>, addressed: bool) -> Option<Request> {
    if let Some(rest) = content.strip_prefix(prefix) {
        let (command, argument) = rest
            .trim_start()
            .split_once(char::is_whitespace)
            .unwrap_or((rest.trim(), ""));
        let argument = argument.trim();
        return match command.to_lowercase().as_str() {
            "ask" | "a" if argument.is_empty() => Some(Request::MissingQuestion),
            "ask" | "a" => Some(Request::Ask(argument.to_string())),
            "status" => Some(Request::Status),
            "help" => Some(Request::Help),
            _ => None,
        };
    }

    if !addressed {
        return None;
    }
    let text = bot_id.map_or_else(
        || content.to_string(),
        |id| {
            content
                .replace(&format!("<@{id}>"), "")
                .replace(&format!("<@!{id}>"), "")
        },
    );
    let text = text.trim();
    (!text.is_empty()).then(|| Request::Ask(text.to_string()))
}

/// Cut `text` to Discord's message limit
fn fit_message(text: &str) -> String {
    if text.chars().count() <= MESSAGE_LIMIT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MESSAGE_LIMIT - 3).collect();
    cut.push_str("...");
    cut
}

fn help_text(name: &str, prefix: &str) -> String {
    format!(
        "**{name} commands:**\n\
         - `{prefix}ask <question>` ask a question\n\
         - `{prefix}status` check that the assistant is online\n\
         - `{prefix}help` show this help\n\
         You can also mention the bot followed by your message."
    )
}

/// Which channel each pending question came from
#[derive(Debug, Default)]
struct ReplyRoutes {
    routes: Mutex<VecDeque<(Uuid, ChannelId)>>,
}

impl ReplyRoutes {
    fn remember(&self, id: Uuid, channel: ChannelId) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.len() == MAX_ROUTES {
            routes.pop_front();
        }
        routes.push_back((id, channel));
    }

    fn take(&self, id: Uuid) -> Option<ChannelId> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let index = routes.iter().position(|(pending, _)| *pending == id)?;
        routes.remove(index).map(|(_, channel)| channel)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn send_text(http: &Arc<Http>, channel: ChannelId, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        tracing::debug!(%channel, "skipping empty Discord reply");
        return Ok(());
    }
    channel
        .send_message(http, CreateMessage::new().content(fit_message(text)))
        .await
        .map_err(|e| Error::Channel(format!("Discord send error: {e}")))?;
    tracing::debug!(%channel, "Discord message sent");
    Ok(())
}

/// Discord event handler
struct DiscordHandler {
    name: String,
    prefix: String,
    access: Access,
    bus: MessageBus,
    routes: Arc<ReplyRoutes>,
    bot_id: OnceLock<u64>,
}

impl DiscordHandler {
    async fn reply(&self, ctx: &Context, channel: ChannelId, text: &str) {
        if let Err(e) = send_text(&ctx.http, channel, text).await {
            tracing::warn!(input = %self.name, error = %e, "Discord reply failed");
        }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let _ = self.bot_id.set(ready.user.id.get());
        tracing::info!(input = %self.name, user = %ready.user.name, "Discord bot ready");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if !self.access.admits(msg.channel_id.get(), msg.author.id.get()) {
            tracing::debug!(input = %self.name, author = %msg.author.name, "Discord message not allowed");
            return;
        }

        let bot_id = self.bot_id.get().copied();
        let is_dm = msg.guild_id.is_none();
        let is_mention = bot_id.is_some_and(|id| msg.mentions.iter().any(|u| u.id.get() == id));

        let Some(request) = interpret(&msg.content, &self.prefix, bot_id, is_dm || is_mention) else {
            return;
        };

        match request {
            Request::Ask(question) => {
                let inbound = Envelope::inbound(&self.name, question);
                self.routes.remember(inbound.id, msg.channel_id);
                tracing::info!(
                    input = %self.name,
                    author = %msg.author.name,
                    channel = %msg.channel_id,
                    is_dm,
                    id = %inbound.id,
                    "Discord message received"
                );
                self.bus.publish(inbound);
            }
            Request::MissingQuestion => {
                self.reply(&ctx, msg.channel_id, "You need to ask a question.")
                    .await;
            }
            Request::Status => {
                let status = format!("{} is online", self.name);
                self.reply(&ctx, msg.channel_id, &status).await;
            }
            Request::Help => {
                let help = help_text(&self.name, &self.prefix);
                self.reply(&ctx, msg.channel_id, &help).await;
            }
        }
    }
}

/// Discord input module
pub struct DiscordInput {
    name: String,
    token: SecretString,
    prefix: String,
    access: Access,
}

impl std::fmt::Debug for DiscordInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordInput")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl DiscordInput {
    /// Create the input
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` without a token or with malformed ids
    pub fn new(name: &str, config: &DiscordConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            name: name.to_string(),
            token: config.token()?,
            prefix: config.command_prefix.clone(),
            access: config.access()?,
        })
    }
}

#[async_trait]
impl InputModule for DiscordInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let routes = Arc::new(ReplyRoutes::default());
        let handler = DiscordHandler {
            name: self.name.clone(),
            prefix: self.prefix.clone(),
            access: self.access.clone(),
            bus: ctx.bus.clone(),
            routes: Arc::clone(&routes),
            bot_id: OnceLock::new(),
        };

        let mut client = Client::builder(self.token.expose_secret(), intents)
            .event_handler(handler)
            .await
            .map_err(|e| Error::construction(&self.name, format!("Discord client error: {e}")))?;

        let name = self.name.clone();
        let mut responses = ctx.bus.subscribe(format!("input:{name}"), move |e: &Envelope| {
            e.kind == EnvelopeKind::OutboundText && e.target.as_deref() == Some(name.as_str())
        })?;

        let replier = {
            let http = Arc::clone(&client.http);
            let name = self.name.clone();
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = tokio::select! {
                        () = shutdown.cancelled() => break,
                        envelope = responses.recv() => match envelope {
                            Some(envelope) => envelope,
                            None => break,
                        },
                    };
                    let Some(channel) = envelope.correlation_id.and_then(|id| routes.take(id)) else {
                        tracing::warn!(input = %name, id = %envelope.id, "response for unknown Discord message");
                        continue;
                    };
                    let text = envelope.payload.text().unwrap_or_default();
                    if let Err(e) = send_text(&http, channel, text).await {
                        tracing::warn!(input = %name, error = %e, "Discord reply failed");
                    }
                }
            })
        };

        let shards = Arc::clone(&client.shard_manager);
        let stopper = {
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                shards.shutdown_all().await;
            })
        };

        tracing::info!(input = %self.name, "Discord input connecting");
        let ran = client.start().await;

        stopper.abort();
        replier.abort();
        tracing::info!(input = %self.name, "Discord input disconnected");
        ran.map_err(|e| Error::Channel(format!("Discord client error: {e}")))
    }
}

/// Builds [`DiscordInput`]s
#[derive(Debug, Default)]
pub struct DiscordInputFactory;

impl InputFactory for DiscordInputFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<DiscordConfig>()?.check()
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Box<dyn InputModule>> {
        Ok(Box::new(DiscordInput::new(name, &config.parse()?)?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config(value: serde_json::Value) -> ModuleConfig {
        ModuleConfig::new("discord", value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_prefixed_commands() {
        assert_eq!(
            interpret("!ask is it raining?", "!", None, false),
            Some(Request::Ask("is it raining?".to_string()))
        );
        assert_eq!(
            interpret("!A  lights off ", "!", None, false),
            Some(Request::Ask("lights off".to_string()))
        );
        assert_eq!(interpret("!ask", "!", None, false), Some(Request::MissingQuestion));
        assert_eq!(interpret("!status", "!", None, false), Some(Request::Status));
        assert_eq!(interpret("!help", "!", None, true), Some(Request::Help));
        assert_eq!(interpret("!dance", "!", None, true), None);
    }

    #[test]
    fn test_plain_text_needs_addressing() {
        assert_eq!(interpret("turn on the amp", "!", Some(42), false), None);
        assert_eq!(
            interpret("<@42> turn on the amp", "!", Some(42), true),
            Some(Request::Ask("turn on the amp".to_string()))
        );
        assert_eq!(
            interpret("hey <@!42>, weather?", "!", Some(42), true),
            Some(Request::Ask("hey , weather?".to_string()))
        );
        // A bare mention says nothing
        assert_eq!(interpret("<@42>", "!", Some(42), true), None);
    }

    #[test]
    fn test_allow_lists() {
        let open = Access::default();
        assert!(open.admits(1, 2));

        let access = DiscordConfig {
            token: Some("t".to_string()),
            command_prefix: "!".to_string(),
            allowed_channels: vec!["100".to_string()],
            allowed_users: vec!["7".to_string(), "8".to_string()],
        }
        .access()
        .unwrap();
        assert!(access.admits(100, 8));
        assert!(!access.admits(101, 8));
        assert!(!access.admits(100, 9));
    }

    #[test]
    fn test_long_reply_truncated() {
        assert_eq!(fit_message("short"), "short");

        let long = "é".repeat(2500);
        let fitted = fit_message(&long);
        assert_eq!(fitted.chars().count(), MESSAGE_LIMIT);
        assert!(fitted.ends_with("..."));
    }

    #[test]
    fn test_routes_answer_once_and_forget_oldest() {
        let routes = ReplyRoutes::default();
        let first = Uuid::new_v4();
        routes.remember(first, ChannelId::new(1));
        assert_eq!(routes.take(first), Some(ChannelId::new(1)));
        assert_eq!(routes.take(first), None);

        let ids: Vec<Uuid> = (0..=MAX_ROUTES).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            routes.remember(*id, ChannelId::new(2));
        }
        assert_eq!(routes.len(), MAX_ROUTES);
        assert_eq!(routes.take(ids[0]), None);
        assert_eq!(routes.take(ids[MAX_ROUTES]), Some(ChannelId::new(2)));
    }

    #[test]
    fn test_factory_validation() {
        let factory = DiscordInputFactory;
        factory
            .validate_config(&config(json!({"token": "abc", "allowed_users": ["123"]})))
            .unwrap();

        let err = factory
            .validate_config(&config(json!({"token": "abc", "allowed_channels": ["general"]})))
            .unwrap_err();
        assert!(err.to_string().contains("allowed_channels"), "{err}");

        let err = factory
            .validate_config(&config(json!({"token": "abc", "command_prefix": " "})))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));

        assert!(matches!(
            factory.validate_config(&config(json!({"token": "abc", "channel": "x"}))),
            Err(Error::ConfigValidation(_))
        ));
    }
}
