//! # Support Bot CLI (`sbot`)
//!
//! ## Usage
//!
//! ```bash
//! sbot --config ./config/support.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sbot init` | Create the SQLite database and run schema migrations |
//! | `sbot scrape <docs\|website\|blog\|all>` | Scrape sources, then rebuild the index |
//! | `sbot index build\|verify` | Rebuild or sanity-check the collection |
//! | `sbot search "<query>"` | Show retrieval results |
//! | `sbot ask "<question>"` | Answer one question |
//! | `sbot serve` | HTTP API, bot manager and scraper service |
//! | `sbot bot run <platform>` | Run one bot with the token from the environment |
//! | `sbot bots list\|add\|remove` | Manage stored bot registrations |
//! | `sbot conversations ...` | Analytics, users, exports and data removal |
//! | `sbot stats` | Database overview |

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use support_bot::bot_config::{BotConfigStorage, BotRecord};
use support_bot::bots::slack::SlackTokens;
use support_bot::bots::{BotManager, BotServices, Platform, RunState};
use support_bot::config::{self, Config};
use support_bot::conversation::Summarizer;
use support_bot::export::{self, ExportFormat};
use support_bot::rag::{AskOptions, RagAgent};
use support_bot::scrape::{self, ScrapeTarget};
use support_bot::server::{self, ServeOptions};
use support_bot::storage::ConversationStorage;
use support_bot::{db, index, migrate, search, stats};

/// Support Bot CLI: scrape, index and answer questions about a DeFi
/// protocol on Telegram, Discord, Slack and the web.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/support.example.toml` for a full example. Secrets are
/// read from the environment (a `.env` file is honoured).
#[derive(Parser)]
#[command(
    name = "sbot",
    about = "Support Bot — a retrieval-augmented support bot for Telegram, Discord, Slack and the web",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/support.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Scrape one or all sources.
    ///
    /// Writes JSON (and markdown) under `scraper.output_dir`, then rebuilds
    /// the index unless `--no-index` is given.
    Scrape {
        /// `docs`, `website`, `blog`, or `all`.
        target: ScrapeTarget,

        /// Maximum pages (or posts) per scraper.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Only scrape; leave the index as it is.
        #[arg(long)]
        no_index: bool,
    },

    /// Build or verify the search index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search the active collection.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a single question.
    Ask {
        question: String,

        /// Override `llm.model`.
        #[arg(long)]
        model: Option<String>,

        /// Print the retrieved context before the answer.
        #[arg(long)]
        show_context: bool,
    },

    /// Start the HTTP API with the bot manager and scraper service.
    Serve {
        /// Do not start the background scraper service.
        #[arg(long)]
        no_scheduler: bool,

        /// Do not restore or manage bots.
        #[arg(long)]
        no_bots: bool,
    },

    /// Run a single platform bot in the foreground.
    Bot {
        #[command(subcommand)]
        action: BotAction,
    },

    /// Manage stored bot registrations.
    Bots {
        #[command(subcommand)]
        action: BotsAction,
    },

    /// Inspect and export the conversation log.
    Conversations {
        #[command(subcommand)]
        action: ConversationsAction,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the collection from the scraped JSON files.
    Build,
    /// Print the chunk count and run a sample query.
    Verify,
}

#[derive(Subcommand)]
enum BotAction {
    /// Run one bot with the token from the environment until Ctrl-C.
    ///
    /// Uses `TELEGRAM_BOT_TOKEN`, `DISCORD_BOT_TOKEN`, or
    /// `SLACK_BOT_TOKEN` plus `SLACK_APP_TOKEN`.
    Run {
        platform: Platform,

        /// Override `bot.default_model`.
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum BotsAction {
    /// List stored bots (tokens are never printed).
    List,
    /// Store a bot. `sbot serve` picks it up on the next start.
    Add {
        #[arg(long)]
        platform: Platform,

        #[arg(long)]
        name: String,

        /// Bot token. Slack takes `xoxb-...,xapp-...`.
        #[arg(long)]
        token: String,

        #[arg(long)]
        model: Option<String>,

        /// Prompt name or literal prompt text.
        #[arg(long)]
        system_prompt: Option<String>,

        #[arg(long)]
        bot_id: Option<String>,
    },
    /// Delete a stored bot.
    Remove { bot_id: String },
}

#[derive(Subcommand)]
enum ConversationsAction {
    /// Totals, platforms and the most active user.
    Analytics,
    /// Every user with question and token totals.
    Users,
    /// Most frequently asked questions.
    Top {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Conversations whose question or answer contains a keyword.
    Search {
        keyword: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Write conversations (or the index) to a file.
    Export {
        #[arg(long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
    },
    /// Remove all stored data of one user.
    ClearUser { user_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scrape {
            target,
            max_pages,
            no_index,
        } => {
            run_scrape(&cfg, target, max_pages, no_index).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Build => {
                migrate::run_migrations(&cfg).await?;
                let report = index::build_index(&cfg).await?;
                println!(
                    "Indexed {} chunks into '{}' ({} embedded, {} batches)",
                    report.chunks, report.collection, report.embedded, report.batches
                );
                println!(
                    "  documentation {}, website {}, blog {}",
                    report.counts.gitbook, report.counts.website, report.counts.blog
                );
            }
            IndexAction::Verify => {
                let report = index::verify_index(&cfg).await?;
                println!("Collection '{}' holds {} chunks", report.collection, report.count);
                for result in &report.sample {
                    println!("  [{}] {}", result.source, result.title);
                }
            }
        },
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Ask {
            question,
            model,
            show_context,
        } => {
            run_ask(&cfg, &question, model, show_context).await?;
        }
        Commands::Serve {
            no_scheduler,
            no_bots,
        } => {
            server::run_server(
                &cfg,
                ServeOptions {
                    scheduler: !no_scheduler,
                    bots: !no_bots,
                },
            )
            .await?;
        }
        Commands::Bot {
            action: BotAction::Run { platform, model },
        } => {
            run_single_bot(&cfg, platform, model).await?;
        }
        Commands::Bots { action } => run_bots(&cfg, action).await?,
        Commands::Conversations { action } => match action {
            ConversationsAction::Analytics => stats::run_analytics(&cfg).await?,
            ConversationsAction::Users => stats::run_users(&cfg).await?,
            ConversationsAction::Top { limit } => stats::run_top_questions(&cfg, limit).await?,
            ConversationsAction::Search { keyword, limit } => {
                stats::run_search_conversations(&cfg, &keyword, limit).await?
            }
            ConversationsAction::Export { output, format } => {
                export::run_export(&cfg, &output, format).await?
            }
            ConversationsAction::ClearUser { user_id } => {
                stats::run_clear_user(&cfg, &user_id).await?
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_scrape(
    cfg: &Config,
    target: ScrapeTarget,
    max_pages: Option<usize>,
    no_index: bool,
) -> anyhow::Result<()> {
    let report = scrape::run_scrape(cfg, target, max_pages).await;
    for (name, count) in &report.succeeded {
        println!("{:<8} {} documents", name, count);
    }
    for (name, error) in &report.failed {
        println!("{:<8} FAILED: {}", name, error);
    }

    if !no_index && !report.succeeded.is_empty() {
        migrate::run_migrations(cfg).await?;
        let index = index::build_index(cfg).await?;
        println!("Indexed {} chunks into '{}'", index.chunks, index.collection);
    }

    if !report.is_success() {
        bail!("{} scraper(s) failed", report.failed.len());
    }
    Ok(())
}

async fn build_agent(cfg: &Config) -> anyhow::Result<(Arc<Config>, sqlx::SqlitePool, RagAgent)> {
    let cfg = Arc::new(cfg.clone());
    let pool = db::connect(&cfg).await?;
    migrate::migrate_pool(&pool).await?;
    let agent = RagAgent::from_config(pool.clone(), cfg.clone())?;
    Ok((cfg, pool, agent))
}

async fn run_ask(
    cfg: &Config,
    question: &str,
    model: Option<String>,
    show_context: bool,
) -> anyhow::Result<()> {
    let (_cfg, pool, agent) = build_agent(cfg).await?;
    let result = agent
        .ask(
            question,
            AskOptions {
                model,
                ..Default::default()
            },
        )
        .await;
    pool.close().await;
    let result = result?;

    if show_context {
        println!("--- context ---");
        println!("{}", result.context_used);
        println!("---------------");
    }
    println!("{}", result.answer);
    if !result.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in result.sources.iter().take(5) {
            println!("  [{:.2}] {} — {}", source.relevance, source.title, source.url);
        }
    }
    println!();
    println!(
        "model: {}, tokens: {} in / {} out",
        result.model, result.usage.input_tokens, result.usage.output_tokens
    );
    Ok(())
}

fn env_token(cfg: &Config, platform: Platform) -> anyhow::Result<String> {
    let secrets = &cfg.secrets;
    let token = match platform {
        Platform::Telegram => secrets.telegram_bot_token.clone(),
        Platform::Discord => secrets.discord_bot_token.clone(),
        Platform::Slack => match (&secrets.slack_bot_token, &secrets.slack_app_token) {
            (Some(bot), Some(app)) => Some(
                SlackTokens {
                    bot_token: bot.clone(),
                    app_token: app.clone(),
                }
                .joined(),
            ),
            _ => None,
        },
    };
    token.with_context(|| format!("No token configured for {} in the environment", platform))
}

async fn run_single_bot(
    cfg: &Config,
    platform: Platform,
    model: Option<String>,
) -> anyhow::Result<()> {
    let token = env_token(cfg, platform)?;
    let (cfg, pool, agent) = build_agent(cfg).await?;
    let agent = Arc::new(agent);
    let summarizer = Summarizer {
        model: agent.model(),
        model_name: cfg.llm.summary_model.clone(),
        max_tokens: cfg.llm.summary_max_tokens,
    };
    let manager = BotManager::new(BotServices {
        config: cfg.clone(),
        agent,
        summarizer: Some(summarizer),
        conversations: Some(ConversationStorage::new(pool.clone())),
        bot_storage: None,
    });

    let bot_id = format!("{}_cli", platform);
    let model = model.unwrap_or_else(|| cfg.bot.default_model.clone());
    let record = BotRecord::new(&bot_id, platform.as_str(), &cfg.bot.project_name, &token, &model);
    manager.register(record, true).await?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        state = watch_until_finished(&manager, &bot_id) => state,
    };
    manager.shutdown().await;
    pool.close().await;
    outcome
}

/// Resolves once the bot task has ended on its own.
async fn watch_until_finished(manager: &BotManager, bot_id: &str) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let Some(status) = manager.get_status(bot_id).await else {
            return Ok(());
        };
        match status.status {
            RunState::Error => bail!(
                "{} bot failed: {}",
                status.platform,
                status.error_message.unwrap_or_default()
            ),
            RunState::Stopped => return Ok(()),
            RunState::Starting | RunState::Running => {}
        }
    }
}

async fn run_bots(cfg: &Config, action: BotsAction) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    let storage = BotConfigStorage::new(pool.clone());

    match action {
        BotsAction::List => {
            let bots = storage.get_all_bots().await?;
            if bots.is_empty() {
                println!("No bots registered.");
            }
            for bot in bots {
                println!(
                    "{:<24} {:<9} {:<10} {:<12} {}",
                    bot.bot_id, bot.platform, bot.status, bot.model, bot.name
                );
            }
        }
        BotsAction::Add {
            platform,
            name,
            token,
            model,
            system_prompt,
            bot_id,
        } => {
            if platform == Platform::Slack {
                SlackTokens::parse(&token)?;
            }
            let bot_id = bot_id.unwrap_or_else(|| server::new_bot_id(platform.as_str()));
            if storage.get_bot(&bot_id).await?.is_some() {
                bail!("Bot ID already exists: {}", bot_id);
            }
            let model = model.unwrap_or_else(|| cfg.bot.default_model.clone());
            let mut record = BotRecord::new(&bot_id, platform.as_str(), &name, &token, &model);
            if let Some(prompt) = system_prompt {
                record.system_prompt = prompt;
            }
            storage.save_bot(&record).await?;
            println!("Registered {} ({})", bot_id, platform);
        }
        BotsAction::Remove { bot_id } => {
            if storage.delete_bot(&bot_id).await? {
                println!("Removed {}", bot_id);
            } else {
                bail!("Bot not found: {}", bot_id);
            }
        }
    }

    pool.close().await;
    Ok(())
}
