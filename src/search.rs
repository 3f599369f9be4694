//! Retrieval over an indexed collection.
//!
//! With an embedding provider configured, candidates are the chunks whose
//! stored vectors are closest to the query by cosine similarity
//! (`distance = 1 - similarity`). Without one, or when the query cannot be
//! embedded, candidates come from FTS5 keyword matching with BM25 scores
//! normalised into the same `[0, 1]` distance range.
//!
//! When `retrieval.prioritize_sources` is set, `n * candidate_multiplier`
//! candidates are fetched and sorted by source priority first (live website
//! data, then docs, then blog) and distance second, so fresh pool figures
//! win over older prose that happens to match more closely.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::index::active_collection;
use crate::models::{SearchResult, Source};

static TERM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}_]+").unwrap());

/// Print the top results for `query` on stdout.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let results = search(&pool, config, query, limit.unwrap_or(config.retrieval.n_results)).await;
    pool.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.relevance(),
            result.source,
            result.title
        );
        println!("    url: {}", result.url);
        let excerpt: String = result.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", result.chunk_id);
        println!();
    }
    Ok(())
}

/// Query the active collection. Returns no results when no collection exists.
pub async fn search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    n: usize,
) -> Result<Vec<SearchResult>> {
    let Some(collection) = active_collection(pool, config).await? else {
        tracing::warn!(collection = %config.index.collection, "No collection available for search");
        return Ok(Vec::new());
    };
    search_collection(pool, config, &collection, query, n).await
}

/// Query one collection, applying source priority when enabled.
pub async fn search_collection(
    pool: &SqlitePool,
    config: &Config,
    collection: &str,
    query: &str,
    n: usize,
) -> Result<Vec<SearchResult>> {
    if n == 0 || query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let prioritize = config.retrieval.prioritize_sources;
    let candidate_k = if prioritize {
        n * config.retrieval.candidate_multiplier
    } else {
        n
    };

    let mut candidates = Vec::new();
    if config.embedding.is_enabled() {
        match fetch_vector_candidates(pool, config, collection, query, candidate_k).await {
            Ok(found) => candidates = found,
            Err(e) => tracing::warn!(error = %e, "Semantic search failed, using keyword search"),
        }
    }
    if candidates.is_empty() {
        candidates = fetch_keyword_candidates(pool, collection, query, candidate_k).await?;
    }

    let hosts = SourceHosts::from_config(config);
    for result in &mut candidates {
        result.source = infer_source(&result.source, &result.url, &hosts)
            .as_str()
            .to_string();
    }

    Ok(rank_results(candidates, n, prioritize))
}

/// Sort by `(priority, distance)` when prioritising, else by distance alone,
/// then keep the top `n`.
pub fn rank_results(mut results: Vec<SearchResult>, n: usize, prioritize: bool) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        let by_distance = a
            .distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal);
        if prioritize {
            let pa = Source::from_label(&a.source).priority();
            let pb = Source::from_label(&b.source).priority();
            pa.cmp(&pb).then(by_distance)
        } else {
            by_distance
        }
    });
    results.truncate(n);
    results
}

// ============ Source inference ============

/// Hostnames of the three scraped sites.
#[derive(Debug, Clone, Default)]
pub struct SourceHosts {
    pub website: Option<String>,
    pub docs: Option<String>,
    pub blog: Option<String>,
}

impl SourceHosts {
    pub fn from_config(config: &Config) -> Self {
        let host = |url: &str| Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
        Self {
            website: host(&config.scraper.website.base_url),
            docs: host(&config.scraper.docs.base_url),
            blog: host(&config.scraper.blog.base_url),
        }
    }
}

/// A stored label wins; otherwise the URL host, then well-known substrings.
pub fn infer_source(label: &str, url: &str, hosts: &SourceHosts) -> Source {
    let stored = Source::from_label(label);
    if stored != Source::Unknown {
        return stored;
    }

    if let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        let matches = |h: &Option<String>| h.as_deref() == Some(host.as_str());
        if matches(&hosts.website) {
            return Source::Website;
        }
        if matches(&hosts.docs) {
            return Source::Docs;
        }
        if matches(&hosts.blog) {
            return Source::Blog;
        }
    }

    let url = url.to_ascii_lowercase();
    if url.contains("website") {
        Source::Website
    } else if url.contains("gitbook") {
        Source::Docs
    } else if url.contains("blog") {
        Source::Blog
    } else {
        Source::Unknown
    }
}

// ============ Keyword search ============

/// Turn free text into an FTS5 expression of quoted terms joined by OR.
/// `None` when the text has no searchable terms.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = TERM_RE
        .find_iter(text)
        .map(|m| format!("\"{}\"", m.as_str().to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    collection: &str,
    query: &str,
    candidate_k: usize,
) -> Result<Vec<SearchResult>> {
    let Some(expr) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.title, c.url, c.source, c.text, chunks_fts.rank AS rank
        FROM chunks_fts
        JOIN chunks c ON c.collection = chunks_fts.collection AND c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ? AND chunks_fts.collection = ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(expr)
    .bind(collection)
    .bind(candidate_k as i64)
    .fetch_all(pool)
    .await?;

    // bm25 rank is negative; negate so higher = better.
    let raw: Vec<f64> = rows.iter().map(|row| -row.get::<f64, _>("rank")).collect();
    let normalized = normalize_scores(&raw);

    Ok(rows
        .iter()
        .zip(normalized)
        .map(|(row, score)| SearchResult {
            chunk_id: row.get("id"),
            title: row.get("title"),
            url: row.get("url"),
            source: row.get("source"),
            text: row.get("text"),
            distance: 1.0 - score,
        })
        .collect())
}

// ============ Vector search ============

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    config: &Config,
    collection: &str,
    query: &str,
    candidate_k: usize,
) -> Result<Vec<SearchResult>> {
    let query_vec = embedding::embed_query(&config.embedding, query).await?;

    // Fetch all vectors and compute cosine similarity in Rust
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.title, c.url, c.source, c.text, cv.embedding
        FROM chunk_vectors cv
        JOIN chunks c ON c.collection = cv.collection AND c.id = cv.chunk_id
        WHERE cv.collection = ?
        "#,
    )
    .bind(collection)
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<SearchResult> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let similarity =
                embedding::cosine_similarity(&query_vec, &embedding::blob_to_vec(&blob)) as f64;
            SearchResult {
                chunk_id: row.get("id"),
                title: row.get("title"),
                url: row.get("url"),
                source: row.get("source"),
                text: row.get("text"),
                distance: 1.0 - similarity,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(candidate_k);
    Ok(candidates)
}

// ============ Score normalization ============

/// Min-max normalize scores to [0, 1]. All-equal scores map to 1.0.
fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}
