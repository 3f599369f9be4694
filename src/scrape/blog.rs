//! Blog scraper: collect post links from the blog home, then fetch each post.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::collections::BTreeSet;

use super::{normalize_link, same_host, Fetcher};
use crate::config::ScraperConfig;
use crate::extract::{self, Page, NOISE_TAGS};
use crate::models::{ScrapedDocument, Source};

const POST_SELECTORS: &[&str] = &[
    "article",
    r#"[role="article"]"#,
    ".blog-post",
    ".post-content",
    "main",
];

static READ_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d+)\s*min(?:ute)?s?\s+read\b").unwrap());

pub struct BlogScraper {
    fetcher: Fetcher,
    base: Url,
}

impl BlogScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let base = Url::parse(&config.blog.base_url)
            .with_context(|| format!("Invalid blog base_url: {}", config.blog.base_url))?;
        Ok(Self {
            fetcher: Fetcher::new(config, config.blog.delay_ms)?,
            base,
        })
    }

    pub async fn scrape(&self, max_posts: Option<usize>) -> Result<Vec<ScrapedDocument>> {
        tracing::info!(base = %self.base, "Starting blog scrape");

        // Without the home page there is nothing to crawl.
        let home = self
            .fetcher
            .fetch_html(self.base.as_str())
            .await
            .context("Failed to load blog home page")?;

        let links = post_links(&self.base, &home);
        let total = max_posts.map_or(links.len(), |m| m.min(links.len()));
        tracing::info!(found = links.len(), "Found blog post URLs");

        let mut posts = Vec::new();
        for (i, url) in links.into_iter().take(total).enumerate() {
            tracing::info!("[{}/{}] Scraping {}", i + 1, total, url);
            match self.fetcher.fetch_html(&url).await {
                Ok(html) => match parse_post(&url, &html) {
                    Some(post) => posts.push(post),
                    None => tracing::warn!(url = %url, "No content in blog post"),
                },
                Err(e) => tracing::warn!(url = %url, error = %e, "Skipping blog post"),
            }
            self.fetcher.pause().await;
        }

        tracing::info!(posts = posts.len(), "Blog scrape complete");
        Ok(posts)
    }
}

/// Same-host links that look like posts: not the root, not tag or category pages.
pub fn post_links(base: &Url, html: &str) -> BTreeSet<String> {
    extract::links(html)
        .iter()
        .filter_map(|href| normalize_link(base, href))
        .filter(|u| same_host(base, u))
        .filter(|u| {
            Url::parse(u)
                .map(|parsed| {
                    let path = parsed.path();
                    path != "/"
                        && !path.is_empty()
                        && !path.starts_with("/tag/")
                        && !path.starts_with("/category/")
                })
                .unwrap_or(false)
        })
        .collect()
}

pub fn parse_post(url: &str, html: &str) -> Option<ScrapedDocument> {
    let page = Page::parse(html);
    let content = page.section(POST_SELECTORS, NOISE_TAGS).ok()?.text;
    let title = page.title().unwrap_or_else(|| url.to_string());

    let mut doc = ScrapedDocument::new(title, url, content, Source::Blog);
    if let Some(date) = page.published_date() {
        doc.metadata.insert("date".to_string(), serde_json::Value::String(date));
    }
    let visible = page.visible_text();
    if let Some(m) = READ_TIME_RE.find(&visible) {
        doc.metadata.insert(
            "read_time".to_string(),
            serde_json::Value::String(m.as_str().to_string()),
        );
    }
    Some(doc)
}
