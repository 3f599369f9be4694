//! Discord adapter: gateway events through poise plus slash commands.

use anyhow::Result;
use poise::serenity_prelude as serenity;
use poise::{Framework, FrameworkOptions};
use std::sync::Arc;
use tokio::sync::watch;

use super::responder::{strip_mention, Incoming, Responder};
use super::stopped;

/// Discord rejects messages longer than this.
const MESSAGE_LIMIT: usize = 2000;
const PIECE_CHARS: usize = 1900;

pub struct DiscordData {
    responder: Arc<Responder>,
    bot_user_id: serenity::UserId,
}

type Context<'a> = poise::Context<'a, DiscordData, anyhow::Error>;

/// Split a reply that exceeds the message limit into pieces of at most
/// 1900 characters, preferring newline then space boundaries.
pub fn split_message(text: &str) -> Vec<String> {
    if text.chars().count() <= MESSAGE_LIMIT {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = remaining
            .char_indices()
            .nth(PIECE_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|i| i + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        pieces.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }
    pieces
}

/// Remove both mention forms (`<@id>` and `<@!id>`).
pub fn strip_user_mention(text: &str, user_id: u64) -> String {
    let plain = strip_mention(text, &format!("<@{}>", user_id));
    strip_mention(&plain, &format!("<@!{}>", user_id))
}

pub fn help_text(project: &str) -> String {
    format!(
        "**{project} Bot Help**\n\n\
         I can answer questions about {project}, Autopools, TOKE staking, and DeFi in general!\n\n\
         **How to use:**\n\
         • Mention me with your question\n\
         • Reply to my messages (no mention needed!)\n\
         • Use `/ask` command\n\
         • DM me directly\n\n\
         **Commands:**\n\
         • `/ask <question>` - Ask a question\n\
         • `/clear` - Clear your conversation history\n\
         • `/stats` - Show bot statistics\n\
         • `/help` - Show this message\n\n\
         **Examples:**\n\
         • \"What are Autopools?\"\n\
         • \"What's the current APY on plasmaUSD?\"\n\
         • \"How many autopools are there?\""
    )
}

fn incoming_from(
    author: &serenity::User,
    channel_id: serenity::ChannelId,
    in_guild: bool,
    text: String,
) -> Incoming {
    Incoming {
        user_id: author.id.to_string(),
        username: Some(author.name.clone()),
        chat_id: Some(channel_id.to_string()),
        chat_type: Some(if in_guild { "guild" } else { "dm" }.to_string()),
        text,
    }
}

/// Ask a question
#[poise::command(slash_command)]
async fn ask(
    ctx: Context<'_>,
    #[description = "Your question"] question: String,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;
    let responder = &ctx.data().responder;
    let incoming = incoming_from(
        ctx.author(),
        ctx.channel_id(),
        ctx.guild_id().is_some(),
        question,
    );
    let answer = responder.answer(&incoming).await;
    for piece in split_message(&answer) {
        ctx.say(piece).await?;
    }
    Ok(())
}

/// Clear your conversation history
#[poise::command(slash_command)]
async fn clear(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.to_string();
    let channel_id = ctx.channel_id().to_string();
    ctx.data().responder.clear(&user_id, Some(&channel_id)).await;
    ctx.send(
        poise::CreateReply::default()
            .content("✅ Conversation cleared! Starting fresh.")
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Show bot statistics
#[poise::command(slash_command)]
async fn stats(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let stats = ctx.data().responder.stats().await;
    let embed = serenity::CreateEmbed::new()
        .title("📊 Bot Statistics")
        .colour(serenity::Colour::BLUE)
        .field("Questions Answered", stats.questions_answered.to_string(), true)
        .field("Documents Indexed", stats.documents_indexed.to_string(), true)
        .field("Active Conversations", stats.active_conversations.to_string(), true)
        .field("Model", stats.model, true);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Show help information
#[poise::command(slash_command)]
async fn help(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let text = help_text(ctx.data().responder.project_name());
    ctx.send(poise::CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}

async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, DiscordData, anyhow::Error>,
    data: &DiscordData,
) -> Result<(), anyhow::Error> {
    if let serenity::FullEvent::Message { new_message } = event {
        handle_message(ctx, new_message, data).await?;
    }
    Ok(())
}

/// Answer DMs, mentions and replies to the bot's own messages.
async fn handle_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &DiscordData,
) -> Result<()> {
    if msg.author.bot || msg.author.id == data.bot_user_id {
        return Ok(());
    }

    let is_dm = msg.guild_id.is_none();
    let mentioned = msg.mentions_user_id(data.bot_user_id);
    let replied_to_bot = msg
        .referenced_message
        .as_ref()
        .map(|m| m.author.id == data.bot_user_id)
        .unwrap_or(false);
    if !(is_dm || mentioned || replied_to_bot) {
        return Ok(());
    }

    let question = strip_user_mention(&msg.content, data.bot_user_id.get());
    if question.is_empty() {
        return Ok(());
    }

    let typing = msg.channel_id.start_typing(&ctx.http);
    let incoming = incoming_from(&msg.author, msg.channel_id, !is_dm, question);
    let answer = data.responder.answer(&incoming).await;
    typing.stop();

    for piece in split_message(&answer) {
        msg.reply(ctx, piece).await?;
    }
    Ok(())
}

pub async fn run(token: &str, responder: Arc<Responder>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let intents = serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::DIRECT_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT;

    let setup_responder = responder.clone();
    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![ask(), clear(), stats(), help()],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                let handle = setup_responder.handle();
                handle.log(&format!(
                    "Discord bot logged in as {} ({} servers)",
                    ready.user.name,
                    ready.guilds.len()
                ));
                match poise::builtins::register_globally(ctx, &framework.options().commands).await {
                    Ok(()) => handle.log(&format!(
                        "Synced {} slash command(s)",
                        framework.options().commands.len()
                    )),
                    Err(e) => handle.log_error(&format!("Failed to sync commands: {}", e)),
                }
                handle.mark_running().await;
                Ok(DiscordData {
                    responder: setup_responder,
                    bot_user_id: ready.user.id,
                })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Discord client: {}", e))?;
    let shard_manager = client.shard_manager.clone();

    tokio::select! {
        result = client.start() => {
            result.map_err(|e| anyhow::anyhow!("Discord client error: {}", e))?;
        }
        _ = stopped(&mut shutdown) => {
            shard_manager.shutdown_all().await;
            responder.handle().log("Discord client shut down");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_reply_is_one_piece() {
        let text = "a".repeat(MESSAGE_LIMIT);
        assert_eq!(split_message(&text), vec![text]);
    }

    #[test]
    fn test_long_reply_split_under_piece_size() {
        let text = "word ".repeat(1000);
        let pieces = split_message(&text);
        assert!(pieces.len() >= 3);
        assert!(pieces.iter().all(|p| p.chars().count() <= PIECE_CHARS));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_split_without_spaces_is_char_safe() {
        let text = "é".repeat(4500);
        let pieces = split_message(&text);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].chars().count(), PIECE_CHARS);
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_strip_both_mention_forms() {
        assert_eq!(strip_user_mention("<@123> what is TOKE?", 123), "what is TOKE?");
        assert_eq!(strip_user_mention("hey <@!123> APY?", 123), "hey  APY?");
    }
}
