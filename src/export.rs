//! Export conversations and the search index as files.
//!
//! `json` writes every conversation as one pretty array, `finetune` writes
//! JSONL chat pairs for model fine-tuning and `index` dumps the active
//! collection's chunks for inspection.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::index::active_collection;
use crate::migrate::migrate_pool;
use crate::storage::ConversationStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Finetune,
    Index,
}

#[derive(Serialize)]
struct IndexExport {
    collection: String,
    chunks: Vec<ExportChunk>,
}

#[derive(Serialize)]
struct ExportChunk {
    id: String,
    chunk_index: i64,
    title: String,
    url: String,
    source: String,
    has_live_data: bool,
    text: String,
}

/// Chunks of the active collection in index order.
pub async fn export_index(pool: &SqlitePool, config: &Config, path: &Path) -> Result<usize> {
    let Some(collection) = active_collection(pool, config).await? else {
        bail!("Index not built. Run `sbot index build` first.");
    };

    let rows = sqlx::query(
        "SELECT id, chunk_index, title, url, source, has_live_data, text \
         FROM chunks WHERE collection = ? ORDER BY chunk_index",
    )
    .bind(&collection)
    .fetch_all(pool)
    .await?;

    let chunks: Vec<ExportChunk> = rows
        .iter()
        .map(|row| ExportChunk {
            id: row.get("id"),
            chunk_index: row.get("chunk_index"),
            title: row.get("title"),
            url: row.get("url"),
            source: row.get("source"),
            has_live_data: row.get::<i64, _>("has_live_data") != 0,
            text: row.get("text"),
        })
        .collect();

    let count = chunks.len();
    let json = serde_json::to_string_pretty(&IndexExport { collection, chunks })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(count)
}

pub async fn run_export(config: &Config, output: &Path, format: ExportFormat) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let storage = ConversationStorage::new(pool.clone());
    let (count, what) = match format {
        ExportFormat::Json => (storage.export_to_json(output).await?, "conversations"),
        ExportFormat::Finetune => (storage.export_for_finetuning(output).await?, "training pairs"),
        ExportFormat::Index => (export_index(&pool, config, output).await?, "chunks"),
    };
    eprintln!("Exported {} {} to {}", count, what, output.display());

    pool.close().await;
    Ok(())
}
