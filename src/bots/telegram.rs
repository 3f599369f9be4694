//! Telegram adapter: Bot API long polling.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::responder::{strip_mention, Incoming, Responder};
use super::stopped;

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

pub struct TelegramClient {
    client: reqwest::Client,
    base: String,
    token: String,
    last_update_id: i64,
}

impl TelegramClient {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base(token, API_BASE)
    }

    pub fn with_base(token: &str, base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            last_update_id: 0,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Telegram {} failed", method))?;
        let body: TelegramApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Invalid Telegram {} response", method))?;
        if !body.ok {
            bail!(
                "Telegram API error in {}: {}",
                method,
                body.description.unwrap_or_default()
            );
        }
        body.result
            .with_context(|| format!("Telegram {} returned no result", method))
    }

    pub async fn get_me(&self) -> Result<TelegramUser> {
        self.call("getMe", serde_json::json!({})).await
    }

    /// Long-poll for new messages, advancing the offset past them.
    pub async fn get_updates(&mut self) -> Result<Vec<TelegramUpdate>> {
        let updates: Vec<TelegramUpdate> = self
            .call(
                "getUpdates",
                serde_json::json!({
                    "offset": self.last_update_id + 1,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"],
                }),
            )
            .await?;
        if let Some(last) = updates.last() {
            self.last_update_id = last.update_id;
        }
        Ok(updates)
    }

    /// Send as Markdown, falling back to plain text when Telegram rejects
    /// the formatting.
    pub async fn send_message(&self, chat_id: i64, reply_to: Option<i64>, text: &str) -> Result<()> {
        let markdown = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "reply_to_message_id": reply_to,
        });
        if self.call::<serde_json::Value>("sendMessage", markdown).await.is_ok() {
            return Ok(());
        }
        let plain = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_to_message_id": reply_to,
        });
        self.call::<serde_json::Value>("sendMessage", plain).await?;
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: i64) {
        let body = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        let _ = self.call::<bool>("sendChatAction", body).await;
    }
}

/// What to do with one incoming message.
#[derive(Debug, PartialEq)]
pub enum Action {
    Help,
    Stats,
    Clear,
    Ask(String),
    Ignore,
}

/// Commands are answered everywhere; questions only in private chats or
/// when the bot is mentioned by `@username`.
pub fn classify(text: &str, chat_type: &str, bot_username: &str) -> Action {
    let trimmed = text.trim();
    if let Some(command) = trimmed.strip_prefix('/') {
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default();
        return match name {
            "start" | "help" => Action::Help,
            "stats" => Action::Stats,
            "clear" => Action::Clear,
            _ => Action::Ignore,
        };
    }

    let mention = format!("@{}", bot_username);
    if !bot_username.is_empty() && trimmed.contains(&mention) {
        let question = strip_mention(trimmed, &mention);
        return if question.is_empty() {
            Action::Ignore
        } else {
            Action::Ask(question)
        };
    }
    if chat_type == "private" && !trimmed.is_empty() {
        return Action::Ask(trimmed.to_string());
    }
    Action::Ignore
}

pub fn help_text(project: &str) -> String {
    format!(
        "🤖 *{project} Documentation Bot*\n\n\
         I can answer questions about {project} using the official documentation!\n\n\
         *How to use:*\n\
         • Just send me a question about Autopools, TOKE staking, or anything {project} related\n\
         • I'll search the documentation and provide an accurate answer with sources\n\n\
         *Examples:*\n\
         • \"What are Autopools?\"\n\
         • \"How does TOKE staking work?\"\n\
         • \"What are the security audits?\"\n\n\
         *Commands:*\n\
         /help - Show this message\n\
         /stats - Show bot statistics\n\
         /clear - Clear conversation history\n\n\
         *In group chats:*\n\
         Mention me with @YourBotName to get my attention!"
    )
}

pub async fn run(token: &str, responder: Arc<Responder>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let client = TelegramClient::new(token)?;
    serve(client, responder, &mut shutdown).await
}

/// Connect with `getMe`, then poll until stopped.
pub async fn serve(
    mut client: TelegramClient,
    responder: Arc<Responder>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let handle = responder.handle().clone();
    let me = client.get_me().await.context("Telegram getMe failed")?;
    let username = me.username.clone().unwrap_or_default();
    handle.log(&format!("Telegram bot: @{} ({})", username, me.first_name));
    handle.mark_running().await;

    loop {
        let updates = tokio::select! {
            _ = stopped(shutdown) => break,
            updates = client.get_updates() => updates,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    if let Some(message) = update.message {
                        handle_message(&client, &responder, &username, message).await;
                    }
                }
            }
            Err(e) => {
                handle.log_error(&format!("Telegram polling error: {:#}", e));
                tokio::select! {
                    _ = stopped(shutdown) => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    handle.log("Telegram polling stopped");
    Ok(())
}

async fn handle_message(
    client: &TelegramClient,
    responder: &Responder,
    bot_username: &str,
    message: TelegramMessage,
) {
    let (Some(text), Some(from)) = (message.text.as_deref(), message.from.as_ref()) else {
        return;
    };
    if from.is_bot {
        return;
    }

    let chat_id = message.chat.id;
    let user_id = from.id.to_string();
    let reply = match classify(text, &message.chat.chat_type, bot_username) {
        Action::Ignore => return,
        Action::Help => help_text(responder.project_name()),
        Action::Clear => {
            responder.clear(&user_id, Some(&chat_id.to_string())).await;
            "✅ Conversation cleared! Starting fresh.".to_string()
        }
        Action::Stats => {
            let stats = responder.stats().await;
            format!(
                "📊 *Bot Statistics*\n\n\
                 Questions answered: {}\n\
                 Documents indexed: {}\n\
                 Active conversations: {}\n\
                 Model: {}",
                stats.questions_answered,
                stats.documents_indexed,
                stats.active_conversations,
                stats.model
            )
        }
        Action::Ask(question) => {
            client.send_typing(chat_id).await;
            responder
                .answer(&Incoming {
                    user_id: user_id.clone(),
                    username: from.username.clone(),
                    chat_id: Some(chat_id.to_string()),
                    chat_type: Some(message.chat.chat_type.clone()),
                    text: question,
                })
                .await
        }
    };

    if let Err(e) = client
        .send_message(chat_id, Some(message.message_id), &reply)
        .await
    {
        responder
            .handle()
            .log_error(&format!("Failed to send Telegram reply: {:#}", e));
    }
}
