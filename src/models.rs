//! Core data models used throughout the support bot.
//!
//! These types represent the scraped documents, chunks, and search results
//! that flow through the scrape → index → answer pipeline.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current UTC time as ISO-8601 with a `Z` suffix and second precision.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Canonical output of every scraper, consumed by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedDocument {
    pub title: String,
    pub url: String,
    pub content: String,
    pub source: String,
    #[serde(default = "utc_now_iso")]
    pub scraped_at: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ScrapedDocument {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        content: impl Into<String>,
        source: Source,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            content: content.into(),
            source: source.as_str().to_string(),
            scraped_at: utc_now_iso(),
            metadata: Map::new(),
        }
    }
}

/// Where a piece of content came from. Ordering of [`Source::priority`]
/// decides which results reach the prompt first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The protocol app, carrying live pool metrics.
    Website,
    /// GitBook documentation.
    #[serde(rename = "gitbook")]
    Docs,
    Blog,
    Unknown,
}

impl Source {
    /// Parses a stored source label. Unrecognised labels map to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "website" | "site" => Source::Website,
            "gitbook" | "docs" => Source::Docs,
            "blog" | "posts" => Source::Blog,
            _ => Source::Unknown,
        }
    }

    /// Storage label (`website`, `gitbook`, `blog`, `unknown`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Website => "website",
            Source::Docs => "gitbook",
            Source::Blog => "blog",
            Source::Unknown => "unknown",
        }
    }

    /// Label shown to the model in the context block.
    pub fn display_label(&self) -> &'static str {
        match self {
            Source::Website => "Website (Live Data)",
            Source::Docs => "Documentation",
            Source::Blog => "Blog",
            Source::Unknown => "Unknown",
        }
    }

    /// Lower sorts first. Unknown sources rank with documentation.
    pub fn priority(&self) -> u8 {
        match self {
            Source::Website => 1,
            Source::Docs | Source::Unknown => 2,
            Source::Blog => 3,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chunk metadata stored alongside the text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source: String,
    pub scraped_at: Option<String>,
    #[serde(default)]
    pub has_live_data: bool,
}

/// A bounded slice of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub title: String,
    pub url: String,
    /// Position of this chunk within its document, contiguous from 0.
    pub chunk_id: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

/// A search hit from the active collection.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub title: String,
    pub url: String,
    pub source: String,
    pub text: String,
    /// `1 - similarity`; smaller is closer.
    pub distance: f64,
}

impl SearchResult {
    pub fn relevance(&self) -> f64 {
        1.0 - self.distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_priority_order() {
        assert!(Source::Website.priority() < Source::Docs.priority());
        assert!(Source::Docs.priority() < Source::Blog.priority());
        assert_eq!(Source::Unknown.priority(), Source::Docs.priority());
    }

    #[test]
    fn test_source_aliases() {
        assert_eq!(Source::from_label("site"), Source::Website);
        assert_eq!(Source::from_label("docs"), Source::Docs);
        assert_eq!(Source::from_label("GitBook"), Source::Docs);
        assert_eq!(Source::from_label("posts"), Source::Blog);
        assert_eq!(Source::from_label("forum"), Source::Unknown);
    }

    #[test]
    fn test_scraped_document_defaults_on_deserialize() {
        let doc: ScrapedDocument = serde_json::from_str(
            r#"{"title":"T","url":"https://x","content":"c","source":"blog"}"#,
        )
        .unwrap();
        assert!(doc.metadata.is_empty());
        assert!(doc.scraped_at.ends_with('Z'));
    }
}
