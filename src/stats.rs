//! Database statistics and conversation reports.
//!
//! `sbot stats` summarises what is indexed (collections, per-source chunk
//! counts, embedding coverage) and what has been asked. The
//! `sbot conversations ...` reports print analytics, users, top questions
//! and keyword matches from the conversation log.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::bot_config::BotConfigStorage;
use crate::config::Config;
use crate::db;
use crate::index::{active_collection, chunk_counts, ChunkCounts};
use crate::migrate::migrate_pool;
use crate::storage::{Analytics, ConversationStorage};

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub chunk_count: i64,
    pub embedded_count: i64,
    pub embedding_model: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub collections: Vec<CollectionStats>,
    pub active_collection: Option<String>,
    pub active_counts: ChunkCounts,
    pub conversations: Analytics,
    pub bots: i64,
}

pub async fn gather_stats(pool: &SqlitePool, config: &Config) -> Result<StatsReport> {
    let rows = sqlx::query(
        r#"
        SELECT
            c.name,
            c.embedding_model,
            c.created_at,
            (SELECT COUNT(*) FROM chunks ch WHERE ch.collection = c.name) AS chunk_count,
            (SELECT COUNT(*) FROM chunk_vectors v WHERE v.collection = c.name) AS embedded_count
        FROM collections c
        ORDER BY c.created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let collections = rows
        .iter()
        .map(|row| CollectionStats {
            name: row.get("name"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
            embedding_model: row.get("embedding_model"),
            created_at: row.get("created_at"),
        })
        .collect();

    let active = active_collection(pool, config).await?;
    let active_counts = match &active {
        Some(name) => chunk_counts(pool, name).await?,
        None => ChunkCounts::default(),
    };

    let conversations = ConversationStorage::new(pool.clone()).get_analytics().await?;
    let bots = BotConfigStorage::new(pool.clone()).get_all_stats().await?.total_bots;

    Ok(StatsReport {
        collections,
        active_collection: active,
        active_counts,
        conversations,
        bots,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    let report = gather_stats(&pool, config).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("{} Support Bot — Database Stats", config.bot.project_name);
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    if report.collections.is_empty() {
        println!("  No collections. Run `sbot scrape all` to build the index.");
    } else {
        println!(
            "  {:<28} {:>8} {:>10}   {}",
            "COLLECTION", "CHUNKS", "EMBEDDED", "BUILT"
        );
        println!("  {}", "-".repeat(64));
        for c in &report.collections {
            let marker = if report.active_collection.as_deref() == Some(c.name.as_str()) {
                " *"
            } else {
                ""
            };
            println!(
                "  {:<28} {:>8} {:>10}   {}{}",
                c.name,
                c.chunk_count,
                c.embedded_count,
                format_ts_relative(c.created_at),
                marker
            );
        }
        println!();
        let counts = &report.active_counts;
        println!(
            "  Active by source: documentation {}, website {}, blog {}",
            counts.gitbook, counts.website, counts.blog
        );
    }

    let a = &report.conversations;
    println!();
    println!("  Conversations: {} ({} in last 24h)", a.total_conversations, a.conversations_24h);
    println!("  Unique users:  {}", a.unique_users);
    println!("  Tokens used:   {}", a.total_tokens_used);
    println!("  Bots:          {}", report.bots);
    println!();

    pool.close().await;
    Ok(())
}

pub async fn run_analytics(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;
    let a = storage.get_analytics().await?;

    println!("Conversation analytics");
    println!("  Total conversations: {}", a.total_conversations);
    println!("  Unique users:        {}", a.unique_users);
    println!("  Last 24h:            {}", a.conversations_24h);
    println!("  Tokens used:         {}", a.total_tokens_used);
    if let Some(user) = &a.most_active_user {
        println!("  Most active user:    {} ({} questions)", user, a.most_active_count);
    }
    if !a.by_platform.is_empty() {
        println!("  By platform:");
        for (platform, count) in &a.by_platform {
            println!("    {:<10} {}", platform, count);
        }
    }
    Ok(())
}

pub async fn run_users(config: &Config) -> Result<()> {
    let storage = open_storage(config).await?;
    let users = storage.get_all_users().await?;
    if users.is_empty() {
        println!("No users yet.");
        return Ok(());
    }
    println!(
        "{:<24} {:<20} {:<9} {:>9} {:>9}   LAST SEEN",
        "USER", "NAME", "PLATFORM", "QUESTIONS", "TOKENS"
    );
    for u in users {
        println!(
            "{:<24} {:<20} {:<9} {:>9} {:>9}   {}",
            u.user_id,
            truncate(&u.username, 20),
            u.platform.as_deref().unwrap_or("-"),
            u.total_questions,
            u.total_tokens,
            u.last_seen.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_top_questions(config: &Config, limit: i64) -> Result<()> {
    let storage = open_storage(config).await?;
    for (i, q) in storage.get_top_questions(limit).await?.iter().enumerate() {
        println!("{:>3}. ({}x, {}) {}", i + 1, q.count, q.platform, q.question);
    }
    Ok(())
}

pub async fn run_search_conversations(config: &Config, keyword: &str, limit: i64) -> Result<()> {
    let storage = open_storage(config).await?;
    let hits = storage.search_conversations(keyword, limit).await?;
    if hits.is_empty() {
        println!("No conversations mention \"{}\".", keyword);
        return Ok(());
    }
    for hit in hits {
        println!(
            "[{}] {} ({}) via {}",
            hit.timestamp.as_deref().unwrap_or("-"),
            hit.username,
            hit.user_id,
            hit.platform
        );
        println!("  Q: {}", truncate(&hit.question, 160));
        println!("  A: {}", truncate(&hit.answer, 160));
    }
    Ok(())
}

pub async fn run_clear_user(config: &Config, user_id: &str) -> Result<()> {
    let storage = open_storage(config).await?;
    let cleared = storage.clear_user_data(user_id).await?;
    println!(
        "Removed {} conversations, {} threads and {} user record(s) for {}",
        cleared.conversations, cleared.threads, cleared.users, user_id
    );
    Ok(())
}

async fn open_storage(config: &Config) -> Result<ConversationStorage> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    Ok(ConversationStorage::new(pool))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
