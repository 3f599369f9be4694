//! Slack adapter: Socket Mode over a WebSocket plus the Web API for replies.
//!
//! A Slack bot needs two tokens: the bot token (`xoxb-`) for Web API calls
//! and the app-level token (`xapp-`) that opens Socket Mode connections.
//! Both are stored in the bot's token field separated by a comma.

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::responder::{strip_mention, Incoming, Responder};
use super::stopped;

const API_BASE: &str = "https://slack.com/api";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct SlackTokens {
    pub bot_token: String,
    pub app_token: String,
}

impl SlackTokens {
    /// Accepts `bot,app` in either order.
    pub fn parse(token: &str) -> Result<Self> {
        let parts: Vec<&str> = token
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        let bot = parts.iter().find(|t| t.starts_with("xoxb-"));
        let app = parts.iter().find(|t| t.starts_with("xapp-"));
        match (bot, app) {
            (Some(bot), Some(app)) => Ok(Self {
                bot_token: bot.to_string(),
                app_token: app.to_string(),
            }),
            _ => bail!("Slack bots need a bot token (xoxb-) and an app token (xapp-) separated by a comma"),
        }
    }

    pub fn joined(&self) -> String {
        format!("{},{}", self.bot_token, self.app_token)
    }
}

pub struct SlackClient {
    client: reqwest::Client,
    base: String,
    tokens: SlackTokens,
}

impl SlackClient {
    pub fn new(tokens: SlackTokens) -> Result<Self> {
        Self::with_base(tokens, API_BASE)
    }

    pub fn with_base(tokens: SlackTokens, base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    async fn call(&self, method: &str, token: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Slack {} failed", method))?;
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Invalid Slack {} response", method))?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            bail!(
                "Slack API error in {}: {}",
                method,
                body.get("error").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        Ok(body)
    }

    /// The bot's own user id.
    pub async fn auth_test(&self) -> Result<String> {
        let body = self
            .call("auth.test", &self.tokens.bot_token, json!({}))
            .await?;
        body.get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("auth.test returned no user_id")
    }

    /// WebSocket URL for a new Socket Mode connection.
    pub async fn open_connection(&self) -> Result<String> {
        let body = self
            .call("apps.connections.open", &self.tokens.app_token, json!({}))
            .await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("apps.connections.open returned no url")
    }

    pub async fn post_message(&self, channel: &str, text: &str, thread_ts: Option<&str>) -> Result<()> {
        let mut body = json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        self.call("chat.postMessage", &self.tokens.bot_token, body)
            .await?;
        Ok(())
    }

    /// Author of the message that started a thread.
    pub async fn thread_starter(&self, channel: &str, thread_ts: &str) -> Result<Option<String>> {
        let body = self
            .call(
                "conversations.replies",
                &self.tokens.bot_token,
                json!({ "channel": channel, "ts": thread_ts, "limit": 1 }),
            )
            .await?;
        Ok(body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .and_then(|m| m.get("user"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub envelope_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: Option<String>,
    pub bot_id: Option<String>,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub channel_type: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum EventAction {
    Respond,
    /// Respond only if the bot started the thread.
    CheckThread,
    Ignore,
}

/// Decide whether an event is addressed to the bot. Mentions in channels
/// arrive as both `app_mention` and `message`; only the former answers.
pub fn classify_event(event: &SlackEvent, bot_user_id: &str) -> EventAction {
    if event.bot_id.is_some() || event.subtype.is_some() || event.user.is_none() {
        return EventAction::Ignore;
    }
    match event.kind.as_str() {
        "app_mention" => EventAction::Respond,
        "message" => {
            if event.channel_type.as_deref() == Some("im") {
                EventAction::Respond
            } else if event.text.contains(&format!("<@{}>", bot_user_id)) {
                EventAction::Ignore
            } else if event.thread_ts.is_some() {
                EventAction::CheckThread
            } else {
                EventAction::Ignore
            }
        }
        _ => EventAction::Ignore,
    }
}

pub fn stats_text(responder_stats: &super::responder::BotStats) -> String {
    format!(
        "📊 *Bot Statistics*\n\n\
         • Questions Answered: {}\n\
         • Documents Indexed: {}\n\
         • Active Conversations: {}\n\
         • Model: {}",
        responder_stats.questions_answered,
        responder_stats.documents_indexed,
        responder_stats.active_conversations,
        responder_stats.model
    )
}

pub async fn run(token: &str, responder: Arc<Responder>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let client = SlackClient::new(SlackTokens::parse(token)?)?;
    serve(client, responder, &mut shutdown).await
}

/// Authenticate, then keep a Socket Mode connection open until stopped,
/// reconnecting when Slack asks for it or the socket drops.
pub async fn serve(
    client: SlackClient,
    responder: Arc<Responder>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let handle = responder.handle().clone();
    let bot_user_id = client.auth_test().await.context("Slack auth.test failed")?;
    handle.log(&format!("Slack bot authenticated as {}", bot_user_id));

    let mut connected_once = false;
    loop {
        let url = client.open_connection().await?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("Slack Socket Mode connection failed")?;
        let (mut write, mut read) = ws_stream.split();
        if !connected_once {
            handle.mark_running().await;
            connected_once = true;
        } else {
            handle.log("Reconnected to Slack Socket Mode");
        }

        loop {
            let next = tokio::select! {
                _ = stopped(shutdown) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    handle.log("Slack socket closed");
                    return Ok(());
                }
                next = read.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    let envelope: Envelope = match serde_json::from_str(&text) {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unparseable Slack envelope");
                            continue;
                        }
                    };
                    if let Some(id) = &envelope.envelope_id {
                        let ack = json!({ "envelope_id": id }).to_string();
                        if let Err(e) = write.send(WsMessage::Text(ack)).await {
                            handle.log_error(&format!("Failed to ack Slack envelope: {}", e));
                        }
                    }
                    match envelope.kind.as_str() {
                        "disconnect" => {
                            tracing::info!("Slack requested reconnect");
                            break;
                        }
                        "events_api" => {
                            handle_event(&client, &responder, &bot_user_id, &envelope.payload).await
                        }
                        "slash_commands" => {
                            handle_command(&client, &responder, &envelope.payload).await
                        }
                        _ => {}
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(?frame, "Slack socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    handle.log_error(&format!("Slack socket error: {}", e));
                    break;
                }
                None => break,
            }
        }

        tokio::select! {
            _ = stopped(shutdown) => return Ok(()),
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn handle_event(client: &SlackClient, responder: &Responder, bot_user_id: &str, payload: &Value) {
    let Some(event) = payload
        .get("event")
        .and_then(|e| serde_json::from_value::<SlackEvent>(e.clone()).ok())
    else {
        return;
    };

    match classify_event(&event, bot_user_id) {
        EventAction::Ignore => return,
        EventAction::Respond => {}
        EventAction::CheckThread => {
            let (Some(channel), Some(thread_ts)) = (&event.channel, &event.thread_ts) else {
                return;
            };
            match client.thread_starter(channel, thread_ts).await {
                Ok(Some(starter)) if starter == bot_user_id => {}
                Ok(_) => return,
                Err(e) => {
                    tracing::debug!(error = %e, "Could not look up Slack thread");
                    return;
                }
            }
        }
    }

    let (Some(user), Some(channel)) = (event.user.as_deref(), event.channel.as_deref()) else {
        return;
    };
    let question = strip_mention(&event.text, &format!("<@{}>", bot_user_id));
    if question.is_empty() {
        return;
    }

    let answer = responder
        .answer(&Incoming {
            user_id: user.to_string(),
            username: None,
            chat_id: Some(channel.to_string()),
            chat_type: event.channel_type.clone(),
            text: question,
        })
        .await;

    let thread_ts = event.thread_ts.as_deref().or(event.ts.as_deref());
    if let Err(e) = client.post_message(channel, &answer, thread_ts).await {
        responder
            .handle()
            .log_error(&format!("Failed to post Slack reply: {:#}", e));
    }
}

async fn handle_command(client: &SlackClient, responder: &Responder, payload: &Value) {
    let field = |name: &str| payload.get(name).and_then(Value::as_str).unwrap_or_default();
    let (command, text, user_id, channel_id) = (
        field("command"),
        field("text"),
        field("user_id"),
        field("channel_id"),
    );
    if channel_id.is_empty() {
        return;
    }

    let reply = match command {
        "/ask" => {
            if text.trim().is_empty() {
                "Usage: `/ask <question>`".to_string()
            } else {
                tracing::info!(user = %user_id, "Slash command question");
                responder
                    .answer(&Incoming {
                        user_id: user_id.to_string(),
                        username: payload
                            .get("user_name")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        chat_id: Some(channel_id.to_string()),
                        chat_type: Some("slash_command".to_string()),
                        text: text.to_string(),
                    })
                    .await
            }
        }
        "/clear" => {
            responder.clear(user_id, Some(channel_id)).await;
            "✅ Conversation cleared! Starting fresh.".to_string()
        }
        "/stats" => stats_text(&responder.stats().await),
        _ => return,
    };

    if let Err(e) = client.post_message(channel_id, &reply, None).await {
        responder
            .handle()
            .log_error(&format!("Failed to post Slack reply: {:#}", e));
    }
}
