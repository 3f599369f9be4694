//! Protocol app crawler with live pool metrics.
//!
//! Pages under `/pools`, `/stoke` and `/tokelp` carry numbers (APY, TVL,
//! volumes) that go stale quickly; they are pulled out of the rendered text
//! into a structured `pool_data` object so the indexer can put them at the
//! top of the page's first chunk.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};

use super::{normalize_link, Fetcher};
use crate::config::ScraperConfig;
use crate::extract::{self, Page};
use crate::models::{ScrapedDocument, Source};

/// Characters of page text inspected after the pool name.
const POOL_SECTION_CHARS: usize = 3000;
const MAX_LISTED: usize = 10;
const MAX_DESTINATIONS: usize = 5;

static POOL_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/pools/([\w-]+)").unwrap());
static APY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"APY\s+([\d.]+)%").unwrap());
static TVL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"TVL\s+\$([0-9.]+[MKB]?)").unwrap());
static DAILY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)DAILY RETURNS\s+\$([0-9,.]+[MK]?)").unwrap());
static VOLUME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)TOTAL AUTOMATED VOLUME\s+\$([0-9,.]+[MK]?)").unwrap());
static TOKENS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)Tokens\s+(.*?)\s+Protocols").unwrap());
static PROTOCOLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Protocols\s+(.*?)\s+Chain").unwrap());
static CHAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Chain\s+(\w+)").unwrap());
static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.]+)%\s+([\w\-/]+)\s+DESTINATIONS").unwrap());
static TOTAL_TVL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total Value Locked\s+\$([0-9,.]+[MKB]?)").unwrap());
static TOTAL_VOLUME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total Automated Volume\s+\$([0-9,.]+[MKB]?)").unwrap());
static POOL_COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"All\s+\S{1,3}\s+(\d+)").unwrap());
static SUMMARY_METRIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:APY|TVL|Daily Rewards?|Volume)\s+[:$]?\s*([0-9.,%$]+)").unwrap());

/// Metrics scraped from a pool, staking or listing page. Absent fields are
/// omitted from the JSON.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PoolData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_returns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_destinations: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tvl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pools: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub summary_metrics: Vec<String>,
}

impl PoolData {
    pub fn is_empty(&self) -> bool {
        *self == PoolData::default()
    }
}

pub struct WebsiteScraper {
    fetcher: Fetcher,
    base: Url,
    base_str: String,
    start_paths: Vec<String>,
    skip_patterns: Vec<String>,
    pool_name_patterns: Vec<Regex>,
}

impl WebsiteScraper {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let website = &config.website;
        let base_str = website.base_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_str)
            .with_context(|| format!("Invalid website base_url: {}", website.base_url))?;
        let pool_name_patterns = website
            .pool_name_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid pool name pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fetcher: Fetcher::new(config, website.delay_ms)?,
            base,
            base_str,
            start_paths: website.start_paths.clone(),
            skip_patterns: website.skip_patterns.clone(),
            pool_name_patterns,
        })
    }

    fn should_skip(&self, url: &str) -> bool {
        self.skip_patterns.iter().any(|p| url.contains(p.as_str()))
    }

    fn is_internal(&self, url: &str) -> bool {
        url.starts_with(&self.base_str)
    }

    pub async fn scrape(&self, max_pages: usize) -> Result<Vec<ScrapedDocument>> {
        let mut queue: VecDeque<String> = self
            .start_paths
            .iter()
            .map(|p| format!("{}{}", self.base_str, p))
            .collect();
        let mut seen: HashSet<String> = queue.iter().cloned().collect();
        let mut documents = Vec::new();
        let mut visited = 0usize;

        tracing::info!(base = %self.base_str, "Starting website scrape");

        while let Some(url) = queue.pop_front() {
            if visited >= max_pages {
                break;
            }
            let url = url.trim_end_matches('/').to_string();
            if self.should_skip(&url) {
                continue;
            }
            visited += 1;

            let html = match self.fetcher.fetch_html(&url).await {
                Ok(html) => html,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Skipping website page");
                    continue;
                }
            };

            let text = page_text(&html);
            if let Some(doc) = build_document(&url, &html, &text) {
                documents.push(doc);
            }

            let mut next = self.find_links(&url, &html);
            if url.ends_with("/pools") {
                next.extend(self.discover_pool_pages(&url, &html, &text));
            }
            for link in next {
                if seen.insert(link.clone()) {
                    queue.push_back(link);
                }
            }

            tracing::info!(visited, queued = queue.len(), "Website scrape progress");
            self.fetcher.pause().await;
        }

        tracing::info!(pages = documents.len(), "Website scrape complete");
        Ok(documents)
    }

    fn find_links(&self, page_url: &str, html: &str) -> BTreeSet<String> {
        let page = Url::parse(page_url).unwrap_or_else(|_| self.base.clone());
        extract::links(html)
            .iter()
            .filter_map(|href| normalize_link(&page, href))
            .filter(|u| self.is_internal(u) && !self.should_skip(u))
            .collect()
    }

    /// Pool pages linked from, or named on, the pools listing.
    pub fn discover_pool_pages(&self, page_url: &str, html: &str, text: &str) -> BTreeSet<String> {
        let mut pools: BTreeSet<String> = self
            .find_links(page_url, html)
            .into_iter()
            .filter(|u| u.contains("/pools/"))
            .collect();

        for pattern in &self.pool_name_patterns {
            for caps in pattern.captures_iter(text) {
                if let Some(name) = caps.get(1) {
                    let url = format!("{}/pools/{}", self.base_str, name.as_str());
                    if !self.should_skip(&url) {
                        pools.insert(url);
                    }
                }
            }
        }

        if !pools.is_empty() {
            tracing::info!(count = pools.len(), "Discovered pool pages");
        }
        pools
    }
}

/// Visible text of a page with scripts and styles removed.
fn page_text(html: &str) -> String {
    Page::parse(html)
        .section(&["body"], &["script", "style", "noscript"])
        .map(|section| section.text)
        .unwrap_or_default()
}

fn build_document(url: &str, html: &str, text: &str) -> Option<ScrapedDocument> {
    if text.trim().is_empty() {
        tracing::warn!(url = %url, "No text on website page (client-rendered?)");
        return None;
    }

    let title = Page::parse(html).title().unwrap_or_else(|| url.to_string());
    let mut doc = ScrapedDocument::new(title, url, text, Source::Website);

    if is_pool_page(url) {
        let pool_data = extract_pool_data(url, text);
        if !pool_data.is_empty() {
            if let Ok(value) = serde_json::to_value(&pool_data) {
                doc.metadata.insert("pool_data".to_string(), value);
            }
        }
    }
    Some(doc)
}

/// Whether a URL points at a page with live pool or staking metrics.
pub fn is_pool_page(url: &str) -> bool {
    url.contains("/pools/")
        || url.contains("/stoke/")
        || url.ends_with("/pools")
        || url.ends_with("/stoke")
        || url.ends_with("/tokelp")
}

/// Pull metrics out of a page's text.
///
/// Individual pool pages (`/pools/<name>`) are read from a window starting
/// at the pool name; listing pages yield site-wide totals. When neither
/// matches, any `APY`/`TVL`/`Volume` figures are kept as summary metrics.
pub fn extract_pool_data(url: &str, text: &str) -> PoolData {
    let mut data = PoolData::default();

    if let Some(name) = POOL_PATH_RE.captures(url).and_then(|c| c.get(1)) {
        if let Some(section) = pool_section(text, name.as_str()) {
            extract_single_pool(section, &mut data);
        }
    } else {
        data.total_tvl = capture(&TOTAL_TVL_RE, text).map(|v| format!("${}", v));
        data.total_volume = capture(&TOTAL_VOLUME_RE, text).map(|v| format!("${}", v));
        data.total_pools = capture(&POOL_COUNT_RE, text);
    }

    if data.is_empty() {
        data.summary_metrics = SUMMARY_METRIC_RE
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();
    }
    data
}

fn pool_section<'t>(text: &'t str, name: &str) -> Option<&'t str> {
    let start = text.find(name)?;
    let section = &text[start..];
    let end = section
        .char_indices()
        .nth(POOL_SECTION_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(section.len());
    Some(&section[..end])
}

fn extract_single_pool(section: &str, data: &mut PoolData) {
    data.apy = capture(&APY_RE, section).map(|v| format!("{}%", v));
    data.tvl = capture(&TVL_RE, section).map(|v| format!("${}", v));
    data.daily_returns = capture(&DAILY_RE, section).map(|v| format!("${}", v));
    data.volume = capture(&VOLUME_RE, section).map(|v| format!("${}", v));

    if let Some(tokens) = capture(&TOKENS_RE, section) {
        data.tokens = list_lines(&tokens)
            .into_iter()
            .filter(|t| !t.contains('+'))
            .take(MAX_LISTED)
            .collect();
    }
    if let Some(protocols) = capture(&PROTOCOLS_RE, section) {
        let protocols: Vec<String> = list_lines(&protocols).into_iter().take(MAX_LISTED).collect();
        if !protocols.is_empty() {
            data.protocols = Some(protocols.join(", "));
        }
    }
    data.chain = capture(&CHAIN_RE, section);

    let destinations: Vec<String> = DESTINATION_RE
        .captures_iter(section)
        .take(MAX_DESTINATIONS)
        .map(|c| format!("{} ({}%)", &c[2], &c[1]))
        .collect();
    if !destinations.is_empty() {
        data.top_destinations = Some(destinations.join(", "));
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn list_lines(block: &str) -> Vec<String> {
    block
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
