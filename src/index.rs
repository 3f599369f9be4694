//! Collection builder.
//!
//! Loads the scraped JSON files, chunks every document and replaces the
//! configured collection with the result. The replacement happens inside a
//! single transaction: readers keep seeing the previous collection until the
//! new one is committed, and a build that produces no chunks leaves the old
//! collection untouched.
//!
//! Website pages carrying `pool_data` get a rendered metrics summary
//! prepended so live numbers land in the page's first chunk.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::path::Path;

use crate::chunk::chunk_document;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, vec_to_blob};
use crate::models::{Chunk, ChunkMetadata, SearchResult, Source};
use crate::scrape::{blog_json_path, docs_json_path, website_json_path};
use crate::search;

/// Query used by [`verify_index`] to sanity-check retrieval.
pub const VERIFY_QUERY: &str = "What are Autopools?";

/// A scraped record after normalisation, ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub title: String,
    pub url: String,
    pub content: String,
    pub source: String,
    pub scraped_at: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ChunkCounts {
    pub gitbook: i64,
    pub website: i64,
    pub blog: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub collection: String,
    pub chunks: usize,
    pub embedded: usize,
    pub batches: usize,
    pub counts: ChunkCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub collection: String,
    pub count: i64,
    pub sample: Vec<SearchResult>,
}

// ============ Loading ============

/// Read one scraper output file.
///
/// A missing or malformed file yields no records (with a warning) so one
/// broken source does not block the others. Records without content are
/// dropped; missing titles fall back to the url, then `{source}_{index}`.
pub fn load_source_file(path: &Path, expected: Source) -> Vec<SourceRecord> {
    let label = expected.as_str();
    if !path.exists() {
        tracing::warn!(source = label, path = %path.display(), "No data found");
        return Vec::new();
    }

    let parsed: Result<Vec<Value>> = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .and_then(|s| serde_json::from_str(&s).with_context(|| format!("Failed to parse {}", path.display())));

    let records = match parsed {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(source = label, error = %format!("{:#}", e), "Skipping source file");
            return Vec::new();
        }
    };

    let normalized: Vec<SourceRecord> = records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| normalize_record(record, index, label))
        .collect();

    tracing::info!(source = label, count = normalized.len(), "Loaded records");
    normalized
}

fn normalize_record(record: Value, index: usize, expected: &str) -> Option<SourceRecord> {
    let Value::Object(mut obj) = record else {
        return None;
    };

    let text = |obj: &Map<String, Value>, key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
    };

    let content = text(&obj, "content")?;
    let fallback = format!("{}_{}", expected, index);
    let url = text(&obj, "url");
    let title = text(&obj, "title")
        .or_else(|| url.clone())
        .unwrap_or_else(|| fallback.clone());

    let metadata = match obj.remove("metadata") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    // Older website dumps kept pool metrics at the top level.
    let mut metadata = metadata;
    if let Some(pool) = obj.remove("pool_data").filter(|v| !v.is_null()) {
        metadata.entry("pool_data").or_insert(pool);
    }

    Some(SourceRecord {
        title,
        url: url.unwrap_or(fallback),
        source: text(&obj, "source").unwrap_or_else(|| expected.to_string()),
        scraped_at: text(&obj, "scraped_at"),
        content,
        metadata,
    })
}

// ============ Pool summary ============

/// Render live pool metrics as a short header block for the page's text.
pub fn render_pool_summary(url: &str, pool_data: &Value) -> String {
    let Some(data) = pool_data.as_object().filter(|m| !m.is_empty()) else {
        return String::new();
    };

    let mut lines = Vec::new();
    if let Some(name) = url.split("/pools/").nth(1) {
        lines.push(format!("=== {} AUTOPOOL ===", name.to_uppercase()));
    } else if url.ends_with("/pools") {
        lines.push("=== AUTOPOOLS OVERVIEW ===".to_string());
    } else if url.ends_with("/stoke") {
        lines.push("=== STOKE STAKING OVERVIEW ===".to_string());
    } else if url.ends_with("/tokelp") {
        lines.push("=== TOKELP OVERVIEW ===".to_string());
    } else {
        lines.push("=== LIVE POOL METRICS ===".to_string());
    }

    let labelled = [
        ("apy", "APY"),
        ("tvl", "TVL (Total Value Locked)"),
        ("daily_returns", "Daily Returns"),
        ("volume", "Total Automated Volume"),
        ("chain", "Chain"),
        ("tokens", "Tokens"),
        ("protocols", "Protocols"),
        ("top_destinations", "Top Allocations"),
        ("total_pools", "Total Autopools"),
        ("total_tvl", "Site-wide Total TVL"),
        ("total_volume", "Site-wide Total Volume"),
        ("summary_metrics", "Summary Metrics"),
    ];

    for (key, label) in labelled {
        if let Some(value) = data.get(key).and_then(render_value) {
            lines.push(format!("{}: {}", label, value));
        }
    }

    lines.join("\n")
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) if !items.is_empty() => Some(
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        _ => None,
    }
}

// ============ Chunking ============

/// Load all three sources and chunk them, docs first, then website, then blog.
pub fn prepare_chunks(config: &Config) -> Vec<Chunk> {
    let sources = [
        (docs_json_path(&config.scraper), Source::Docs),
        (website_json_path(&config.scraper), Source::Website),
        (blog_json_path(&config.scraper), Source::Blog),
    ];

    let mut all = Vec::new();
    for (path, source) in sources {
        let before = all.len();
        for record in load_source_file(&path, source) {
            all.extend(chunk_record(&record, config));
        }
        tracing::info!(source = source.as_str(), chunks = all.len() - before, "Chunked source");
    }
    all
}

fn chunk_record(record: &SourceRecord, config: &Config) -> Vec<Chunk> {
    let pool_data = record.metadata.get("pool_data").filter(|v| !v.is_null());
    let summary = pool_data
        .map(|p| render_pool_summary(&record.url, p))
        .unwrap_or_default();

    let text = if summary.is_empty() {
        record.content.clone()
    } else {
        format!("{}\n\n{}", summary, record.content).trim().to_string()
    };

    let metadata = ChunkMetadata {
        source: record.source.clone(),
        scraped_at: record.scraped_at.clone(),
        has_live_data: pool_data.is_some(),
    };

    chunk_document(&text, &record.title, &record.url, &metadata, &config.chunking)
}

// ============ Build ============

pub async fn build_index(config: &Config) -> Result<IndexReport> {
    let pool = db::connect(config).await?;
    let report = build_index_with_pool(&pool, config).await;
    pool.close().await;
    report
}

/// Replace the configured collection with freshly chunked scraped data.
pub async fn build_index_with_pool(pool: &SqlitePool, config: &Config) -> Result<IndexReport> {
    let chunks = prepare_chunks(config);
    if chunks.is_empty() {
        bail!("No chunks generated; aborting index build");
    }
    write_collection(pool, config, &config.index.collection, &chunks).await
}

/// Delete and recreate `collection` with `chunks`, inserting in batches.
pub async fn write_collection(
    pool: &SqlitePool,
    config: &Config,
    collection: &str,
    chunks: &[Chunk],
) -> Result<IndexReport> {
    let batch_size = config.index.batch_size;
    let total_batches = chunks.len().div_ceil(batch_size);

    // Embed before opening the write transaction; a failed batch is stored
    // without vectors and stays reachable through keyword search.
    let embedding_model = if config.embedding.is_enabled() {
        Some(embedding::create_provider(&config.embedding)?.model_name().to_string())
    } else {
        None
    };
    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
    if embedding_model.is_some() {
        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match embedding::embed_texts(&config.embedding, &texts).await {
                Ok(embedded) if embedded.len() == batch.len() => {
                    for (offset, v) in embedded.into_iter().enumerate() {
                        vectors[batch_no * batch_size + offset] = Some(v);
                    }
                }
                Ok(embedded) => tracing::warn!(
                    batch = batch_no + 1,
                    expected = batch.len(),
                    got = embedded.len(),
                    "Embedding count mismatch, storing batch without vectors"
                ),
                Err(e) => tracing::warn!(
                    batch = batch_no + 1,
                    error = %e,
                    "Embedding failed, storing batch without vectors"
                ),
            }
        }
    }

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks_fts WHERE collection = ?")
        .bind(collection)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM collections WHERE name = ?")
        .bind(collection)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO collections (name, description, embedding_model, chunk_count, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(collection)
    .bind("Complete data: docs + website + blog")
    .bind(embedding_model.as_deref())
    .bind(chunks.len() as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    let mut embedded = 0usize;
    for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
        for (offset, chunk) in batch.iter().enumerate() {
            let position = batch_no * batch_size + offset;
            let id = format!("chunk_{}", position);
            let metadata_json = serde_json::json!({
                "title": chunk.title,
                "url": chunk.url,
                "chunk_id": chunk.chunk_id.to_string(),
                "source": chunk.metadata.source,
                "has_live_data": chunk.metadata.has_live_data,
                "scraped_at": chunk.metadata.scraped_at,
            });

            sqlx::query(
                "INSERT INTO chunks (collection, id, chunk_index, doc_chunk, title, url, source, \
                 text, hash, scraped_at, has_live_data, metadata_json) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&id)
            .bind(position as i64)
            .bind(chunk.chunk_id as i64)
            .bind(&chunk.title)
            .bind(&chunk.url)
            .bind(&chunk.metadata.source)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.metadata.scraped_at.as_deref())
            .bind(chunk.metadata.has_live_data)
            .bind(metadata_json.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (collection, chunk_id, title, text) VALUES (?, ?, ?, ?)")
                .bind(collection)
                .bind(&id)
                .bind(&chunk.title)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;

            if let (Some(vector), Some(model)) = (&vectors[position], &embedding_model) {
                sqlx::query(
                    "INSERT INTO chunk_vectors (collection, chunk_id, model, dims, embedding) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(collection)
                .bind(&id)
                .bind(model)
                .bind(vector.len() as i64)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
                embedded += 1;
            }
        }
        tracing::info!("Batch {}/{}", batch_no + 1, total_batches);
    }

    tx.commit().await?;

    let counts = chunk_counts(pool, collection).await?;
    tracing::info!(collection, chunks = chunks.len(), embedded, "Index built");

    Ok(IndexReport {
        collection: collection.to_string(),
        chunks: chunks.len(),
        embedded,
        batches: total_batches,
        counts,
    })
}

// ============ Queries ============

/// The collection the agent should query: the configured one if it exists,
/// else the first existing fallback.
pub async fn active_collection(pool: &SqlitePool, config: &Config) -> Result<Option<String>> {
    let candidates =
        std::iter::once(&config.index.collection).chain(config.index.fallback_collections.iter());
    for name in candidates {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(name)
                .fetch_one(pool)
                .await?;
        if exists {
            return Ok(Some(name.clone()));
        }
    }
    Ok(None)
}

/// Chunks per source in `collection`. Sources outside the three known ones
/// only count toward the total.
pub async fn chunk_counts(pool: &SqlitePool, collection: &str) -> Result<ChunkCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT source, COUNT(*) FROM chunks WHERE collection = ? GROUP BY source",
    )
    .bind(collection)
    .fetch_all(pool)
    .await?;

    let mut counts = ChunkCounts::default();
    for (source, count) in rows {
        match Source::from_label(&source) {
            Source::Docs => counts.gitbook += count,
            Source::Website => counts.website += count,
            Source::Blog => counts.blog += count,
            Source::Unknown => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

pub async fn verify_index(config: &Config) -> Result<VerifyReport> {
    let pool = db::connect(config).await?;
    let report = verify_with_pool(&pool, config).await;
    pool.close().await;
    report
}

/// Count the active collection and run a test query against it.
pub async fn verify_with_pool(pool: &SqlitePool, config: &Config) -> Result<VerifyReport> {
    let Some(collection) = active_collection(pool, config).await? else {
        bail!(
            "Collection '{}' does not exist. Run `sbot index build` first.",
            config.index.collection
        );
    };

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?")
        .bind(&collection)
        .fetch_one(pool)
        .await?;

    let sample = search::search_collection(pool, config, &collection, VERIFY_QUERY, 3).await?;

    Ok(VerifyReport {
        collection,
        count,
        sample,
    })
}
