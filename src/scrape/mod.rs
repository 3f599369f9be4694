//! Scrapers for the three content sources.
//!
//! Each scraper crawls its site over plain HTTP, turns pages into
//! [`ScrapedDocument`]s and writes them to a JSON file under
//! `scraper.output_dir` (plus one markdown file per document). The indexer
//! reads those files back. A page that fails to load or parse is logged and
//! skipped; only failures that prevent the whole crawl are returned as errors.
//!
//! | Source | Module | Output |
//! |--------|--------|--------|
//! | GitBook docs | [`docs`] | `gitbook_data.json` |
//! | Protocol app | [`website`] | `website/website_data.json` |
//! | Blog | [`blog`] | `blog/blog_posts.json` |

pub mod blog;
pub mod docs;
pub mod website;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, ScraperConfig};
use crate::models::ScrapedDocument;

/// Which scraper(s) to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeTarget {
    Docs,
    Website,
    Blog,
    All,
}

impl std::str::FromStr for ScrapeTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docs" | "gitbook" => Ok(ScrapeTarget::Docs),
            "website" | "site" => Ok(ScrapeTarget::Website),
            "blog" => Ok(ScrapeTarget::Blog),
            "all" => Ok(ScrapeTarget::All),
            other => bail!("Unknown scrape target: '{}'. Must be docs, website, blog, or all.", other),
        }
    }
}

// ============ Output paths ============

pub fn docs_json_path(config: &ScraperConfig) -> PathBuf {
    config.output_dir.join("gitbook_data.json")
}

pub fn website_json_path(config: &ScraperConfig) -> PathBuf {
    config.output_dir.join("website").join("website_data.json")
}

pub fn blog_json_path(config: &ScraperConfig) -> PathBuf {
    config.output_dir.join("blog").join("blog_posts.json")
}

// ============ HTTP ============

/// A polite page fetcher: one shared client, fixed timeout and user agent,
/// and a delay the crawl loops sleep between requests.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    delay: Duration,
}

impl Fetcher {
    pub fn new(config: &ScraperConfig, delay_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            delay: Duration::from_millis(delay_ms),
        })
    }

    /// GET a page and return its body. Non-2xx statuses are errors.
    pub async fn fetch_html(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request failed: {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} for {}", status, url);
        }

        response
            .text()
            .await
            .with_context(|| format!("Failed to read body: {}", url))
    }

    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

// ============ URLs ============

/// Resolve `href` against `base` and drop the fragment and query string.
///
/// Returns `None` for `mailto:`, `tel:`, `javascript:` and non-HTTP links.
pub fn normalize_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.is_empty()
        || href.starts_with('#')
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("javascript:")
    {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    url.set_query(None);

    let mut s = url.to_string();
    if s.ends_with('/') && url.path() != "/" {
        s.pop();
    }
    Some(s)
}

pub fn same_host(a: &Url, b: &str) -> bool {
    Url::parse(b)
        .map(|u| u.host_str() == a.host_str())
        .unwrap_or(false)
}

// ============ Output ============

/// Write documents as a pretty-printed JSON array, creating parent directories.
pub fn save_documents_json(documents: &[ScrapedDocument], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(documents)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write one markdown file per document into `dir`.
pub fn save_documents_markdown(documents: &[ScrapedDocument], dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    for (index, doc) in documents.iter().enumerate() {
        let path = dir.join(format!("{}.md", markdown_file_stem(&doc.title, index)));
        std::fs::write(&path, render_markdown(doc))
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

fn markdown_file_stem(title: &str, index: usize) -> String {
    let safe: String = title
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .take(80)
        .collect();
    if safe.is_empty() {
        format!("document_{}", index)
    } else {
        safe
    }
}

pub fn render_markdown(doc: &ScrapedDocument) -> String {
    let mut out = format!(
        "# {}\n\nSource: {}\nScraped: {}\n\n",
        doc.title, doc.url, doc.scraped_at
    );

    if !doc.metadata.is_empty() {
        out.push_str("## Metadata\n\n");
        for (key, value) in &doc.metadata {
            match value {
                serde_json::Value::String(s) => out.push_str(&format!("- **{}**: {}\n", key, s)),
                other => out.push_str(&format!("- **{}**: {}\n", key, other)),
            }
        }
        out.push('\n');
    }

    out.push_str("## Content\n\n");
    out.push_str(&doc.content);
    out.push('\n');
    out
}

/// Persist one source's documents: JSON always, markdown when enabled.
fn persist(config: &ScraperConfig, documents: &[ScrapedDocument], json_path: &Path) -> Result<()> {
    save_documents_json(documents, json_path)?;
    if config.save_markdown {
        if let Some(parent) = json_path.parent() {
            save_documents_markdown(documents, &parent.join("markdown"))?;
        }
    }
    tracing::info!(count = documents.len(), path = %json_path.display(), "Saved scraped documents");
    Ok(())
}

// ============ Runners ============

pub async fn scrape_docs(config: &Config, max_pages: Option<usize>) -> Result<usize> {
    let scraper = docs::DocsScraper::new(&config.scraper)?;
    let documents = scraper.scrape(max_pages.or(config.scraper.docs.max_pages)).await?;
    persist(&config.scraper, &documents, &docs_json_path(&config.scraper))?;
    Ok(documents.len())
}

pub async fn scrape_website(config: &Config, max_pages: Option<usize>) -> Result<usize> {
    let scraper = website::WebsiteScraper::new(&config.scraper)?;
    let documents = scraper
        .scrape(max_pages.unwrap_or(config.scraper.website.max_pages))
        .await?;
    persist(&config.scraper, &documents, &website_json_path(&config.scraper))?;
    Ok(documents.len())
}

pub async fn scrape_blog(config: &Config, max_posts: Option<usize>) -> Result<usize> {
    let scraper = blog::BlogScraper::new(&config.scraper)?;
    let documents = scraper.scrape(max_posts.or(config.scraper.blog.max_posts)).await?;
    persist(&config.scraper, &documents, &blog_json_path(&config.scraper))?;
    Ok(documents.len())
}

/// Per-source outcome of [`run_scrape`].
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub succeeded: Vec<(&'static str, usize)>,
    pub failed: Vec<(&'static str, String)>,
}

impl ScrapeReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, name: &'static str, result: Result<usize>) {
        match result {
            Ok(count) => self.succeeded.push((name, count)),
            Err(e) => {
                tracing::error!(source = name, error = %e, "Scrape failed");
                self.failed.push((name, format!("{:#}", e)));
            }
        }
    }
}

/// Run the selected scrapers in order (docs, website, blog). A failing
/// source is recorded and the remaining ones still run.
pub async fn run_scrape(
    config: &Config,
    target: ScrapeTarget,
    max_pages: Option<usize>,
) -> ScrapeReport {
    let mut report = ScrapeReport::default();
    if matches!(target, ScrapeTarget::Docs | ScrapeTarget::All) {
        report.record("docs", scrape_docs(config, max_pages).await);
    }
    if matches!(target, ScrapeTarget::Website | ScrapeTarget::All) {
        report.record("website", scrape_website(config, max_pages).await);
    }
    if matches!(target, ScrapeTarget::Blog | ScrapeTarget::All) {
        report.record("blog", scrape_blog(config, max_pages).await);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;

    #[test]
    fn test_normalize_strips_fragment_and_query() {
        let base = Url::parse("https://docs.auto.finance/intro/").unwrap();
        assert_eq!(
            normalize_link(&base, "../autopools?x=1#top").unwrap(),
            "https://docs.auto.finance/autopools"
        );
        assert_eq!(
            normalize_link(&base, "https://docs.auto.finance/").unwrap(),
            "https://docs.auto.finance/"
        );
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        let base = Url::parse("https://docs.auto.finance/").unwrap();
        assert!(normalize_link(&base, "mailto:team@auto.finance").is_none());
        assert!(normalize_link(&base, "tel:123").is_none());
        assert!(normalize_link(&base, "javascript:void(0)").is_none());
        assert!(normalize_link(&base, "#section").is_none());
    }

    #[test]
    fn test_same_host() {
        let base = Url::parse("https://blog.tokemak.xyz").unwrap();
        assert!(same_host(&base, "https://blog.tokemak.xyz/post"));
        assert!(!same_host(&base, "https://twitter.com/tokemak"));
    }

    #[test]
    fn test_markdown_layout() {
        let mut doc = ScrapedDocument::new("Pools", "https://app/pools", "Body text", Source::Website);
        doc.metadata
            .insert("description".to_string(), serde_json::json!("Live pools"));
        let md = render_markdown(&doc);
        assert!(md.starts_with("# Pools\n\nSource: https://app/pools\nScraped: "));
        assert!(md.contains("## Metadata\n\n- **description**: Live pools\n"));
        assert!(md.ends_with("## Content\n\nBody text\n"));
    }

    #[test]
    fn test_save_json_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![ScrapedDocument::new("A/B", "https://x/a", "text", Source::Docs)];
        let path = dir.path().join("nested").join("data.json");
        save_documents_json(&docs, &path).unwrap();
        save_documents_markdown(&docs, &dir.path().join("md")).unwrap();

        let loaded: Vec<ScrapedDocument> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, docs);
        assert!(dir.path().join("md").join("A-B.md").exists());
    }

    #[test]
    fn test_scrape_target_parse() {
        assert_eq!("all".parse::<ScrapeTarget>().unwrap(), ScrapeTarget::All);
        assert_eq!("gitbook".parse::<ScrapeTarget>().unwrap(), ScrapeTarget::Docs);
        assert!("forum".parse::<ScrapeTarget>().is_err());
    }
}
