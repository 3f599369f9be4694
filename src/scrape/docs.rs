//! GitBook documentation crawler.
//!
//! Breadth-first over same-host links starting at the docs root. Each page's
//! main content block is rendered to text; the page title, meta description
//! and heading outline go into the document metadata.

use anyhow::{Context, Result};
use reqwest::Url;
use std::collections::{HashSet, VecDeque};

use super::{normalize_link, same_host, Fetcher};
use crate::config::ScraperConfig;
use crate::extract::{self, Page, NOISE_TAGS};
use crate::models::{ScrapedDocument, Source};

/// Content containers tried in order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    r#"[data-testid="page-content"]"#,
    "article",
    "main",
    ".page-inner",
    r#"[role="main"]"#,
];

pub struct DocsScraper {
    fetcher: Fetcher,
    base: Url,
}

impl DocsScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let base = Url::parse(&config.docs.base_url)
            .with_context(|| format!("Invalid docs base_url: {}", config.docs.base_url))?;
        Ok(Self {
            fetcher: Fetcher::new(config, config.docs.delay_ms)?,
            base,
        })
    }

    /// Crawl until the queue is empty or `max_pages` pages were visited.
    pub async fn scrape(&self, max_pages: Option<usize>) -> Result<Vec<ScrapedDocument>> {
        let mut queue: VecDeque<String> = VecDeque::from([self.base.to_string()]);
        let mut seen: HashSet<String> = queue.iter().cloned().collect();
        let mut documents = Vec::new();
        let mut visited = 0usize;

        tracing::info!(base = %self.base, "Starting docs scrape");

        while let Some(url) = queue.pop_front() {
            if max_pages.is_some_and(|max| visited >= max) {
                break;
            }
            visited += 1;

            let html = match self.fetcher.fetch_html(&url).await {
                Ok(html) => html,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Skipping docs page");
                    continue;
                }
            };

            match parse_page(&url, &html) {
                Some(doc) => {
                    tracing::debug!(url = %url, title = %doc.title, "Scraped docs page");
                    documents.push(doc);
                }
                None => tracing::warn!(url = %url, "No content on docs page"),
            }

            let page_url = Url::parse(&url).unwrap_or_else(|_| self.base.clone());
            for link in extract::links(&html) {
                let Some(next) = normalize_link(&page_url, &link) else {
                    continue;
                };
                if same_host(&self.base, &next) && seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }

            tracing::info!(visited, queued = queue.len(), "Docs scrape progress");
            self.fetcher.pause().await;
        }

        tracing::info!(pages = documents.len(), "Docs scrape complete");
        Ok(documents)
    }
}

/// Turn one GitBook page into a document. `None` when the page has no text.
pub fn parse_page(url: &str, html: &str) -> Option<ScrapedDocument> {
    let page = Page::parse(html);
    let title = page
        .title()
        .and_then(|t| t.split('|').next().map(|s| s.trim().to_string()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url.to_string());

    let section = page.section(CONTENT_SELECTORS, NOISE_TAGS).ok()?;

    let mut doc = ScrapedDocument::new(title, url, section.text, Source::Docs);
    if let Some(description) = page.meta_content("description") {
        doc.metadata
            .insert("description".to_string(), serde_json::Value::String(description));
    }
    if !section.headings.is_empty() {
        if let Ok(value) = serde_json::to_value(&section.headings) {
            doc.metadata.insert("headings".to_string(), value);
        }
    }
    Some(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_prefers_content_block() {
        let html = r#"<html><head><title>Autopools | Auto Finance Docs</title>
            <meta name="description" content="What autopools are"></head>
            <body><header>Site header</header>
            <main><h1>Autopools</h1><p>Autopools route liquidity.</p>
            <aside>Related pages</aside></main></body></html>"#;
        let doc = parse_page("https://docs.auto.finance/autopools", html).unwrap();
        assert_eq!(doc.title, "Autopools");
        assert_eq!(doc.source, "gitbook");
        assert!(doc.content.contains("Autopools route liquidity."));
        assert!(!doc.content.contains("Site header"));
        assert!(!doc.content.contains("Related pages"));
        assert_eq!(doc.metadata["description"], "What autopools are");
        assert_eq!(doc.metadata["headings"][0]["level"], 1);
    }

    #[test]
    fn test_parse_page_ignores_markup_in_scripts() {
        let html = r#"<html><head><script>var tpl = "<main>loading</main>";</script></head>
            <body><main><p>Autopools rebalance liquidity.</p></main></body></html>"#;
        let doc = parse_page("https://docs.auto.finance/autopools", html).unwrap();
        assert_eq!(doc.content, "Autopools rebalance liquidity.");
    }

    #[test]
    fn test_parse_page_matches_exact_class() {
        let html = r#"<html><body>
            <div class="page-inner-sidebar">sidebar links</div>
            <div class="page-inner"><p>Autopools rebalance liquidity.</p></div>
            </body></html>"#;
        let doc = parse_page("https://docs.auto.finance/autopools", html).unwrap();
        assert!(doc.content.contains("Autopools rebalance liquidity."));
        assert!(!doc.content.contains("sidebar links"));
    }

    #[test]
    fn test_parse_page_without_title_uses_url() {
        let doc = parse_page("https://docs.x/a", "<body><p>Hello</p></body>").unwrap();
        assert_eq!(doc.title, "https://docs.x/a");
    }

    #[test]
    fn test_parse_empty_page() {
        assert!(parse_page("https://docs.x/a", "<body><script>x()</script></body>").is_none());
    }
}
