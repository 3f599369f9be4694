//! HTML text extraction for scraped pages.
//!
//! Scrapers hand raw HTML to [`Page::parse`] and get back plain UTF-8 text
//! plus the few structured bits the index cares about (title, description,
//! headings, links, publication date). Pages are parsed with html5ever via
//! `scraper`, so content blocks are chosen with real CSS selectors; the
//! chosen block is rendered to text with `html2text`.
//!
//! A parsed [`Page`] is not `Send`. Keep it inside synchronous code and
//! return owned values across `.await` points.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

/// Wrap width handed to html2text. Paragraph breaks survive; long lines wrap.
const TEXT_WIDTH: usize = 200;

/// Elements removed before converting a page to text.
pub const NOISE_TAGS: &[&str] = &["script", "style", "nav", "header", "footer", "aside"];

#[derive(Debug)]
pub enum ExtractError {
    /// The page rendered to no text at all.
    Empty,
    Render(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Empty => write!(f, "page contains no text"),
            ExtractError::Render(e) => write!(f, "HTML rendering failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Heading {
    pub level: u8,
    pub text: String,
}

/// Rendered text of one content block and the headings inside it.
#[derive(Debug, Clone)]
pub struct Section {
    pub text: String,
    pub headings: Vec<Heading>,
}

fn css(selector: &str) -> Selector {
    Selector::parse(selector).unwrap()
}

static TITLE: Lazy<Selector> = Lazy::new(|| css("title"));
static META: Lazy<Selector> = Lazy::new(|| css("meta"));
static LINK: Lazy<Selector> = Lazy::new(|| css("a[href]"));
static TIME: Lazy<Selector> = Lazy::new(|| css("time"));
static BODY: Lazy<Selector> = Lazy::new(|| css("body"));
static HEADINGS: Lazy<Selector> = Lazy::new(|| css("h1, h2, h3, h4, h5"));

static FOOTNOTE_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\[\d+\]: .*$").unwrap());
static FOOTNOTE_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]\n]+)\]\[\d+\]").unwrap());
static EMPHASIS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*{1,2}([^*\n]+?)\*{1,2}").unwrap());
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// A parsed HTML document.
pub struct Page {
    doc: Html,
}

impl Page {
    pub fn parse(html: &str) -> Self {
        Self {
            doc: Html::parse_document(html),
        }
    }

    /// Text of the `<title>` element.
    pub fn title(&self) -> Option<String> {
        self.doc
            .select(&TITLE)
            .next()
            .map(element_words)
            .filter(|t| !t.is_empty())
    }

    /// `content` of `<meta name=NAME>` or `<meta property=NAME>`.
    pub fn meta_content(&self, name: &str) -> Option<String> {
        self.doc.select(&META).find_map(|meta| {
            let el = meta.value();
            let named = ["name", "property"]
                .iter()
                .any(|attr| el.attr(attr).is_some_and(|v| v.eq_ignore_ascii_case(name)));
            if named {
                el.attr("content").map(str::to_string)
            } else {
                None
            }
        })
    }

    /// Raw `href` values of every anchor, in document order.
    pub fn links(&self) -> Vec<String> {
        self.doc
            .select(&LINK)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty())
            .collect()
    }

    /// The first `<time>` element: its `datetime` attribute, else its text.
    pub fn published_date(&self) -> Option<String> {
        let time = self.doc.select(&TIME).next()?;
        time.value()
            .attr("datetime")
            .map(|d| d.trim().to_string())
            .or_else(|| Some(element_words(time)))
            .filter(|d| !d.is_empty())
    }

    /// All visible words on the page, whitespace collapsed.
    pub fn visible_text(&self) -> String {
        let mut doc = self.doc.clone();
        remove_elements(&mut doc, &["script", "style", "noscript"]);
        element_words(doc.root_element())
    }

    /// Render the first element matching any of `selectors` (tried in
    /// order, then `<body>`) with every `strip` element removed.
    ///
    /// Headings are collected before stripping so an outline inside a
    /// `<header>` still counts.
    pub fn section(&self, selectors: &[&str], strip: &[&str]) -> Result<Section, ExtractError> {
        let (root_id, headings) = {
            let root = selectors
                .iter()
                .filter_map(|s| Selector::parse(s).ok())
                .find_map(|sel| self.doc.select(&sel).next())
                .or_else(|| self.doc.select(&BODY).next())
                .unwrap_or_else(|| self.doc.root_element());
            (root.id(), collect_headings(root))
        };

        let mut doc = self.doc.clone();
        remove_elements(&mut doc, strip);
        let root = doc
            .tree
            .get(root_id)
            .and_then(ElementRef::wrap)
            .ok_or(ExtractError::Empty)?;
        let text = html_to_text(&root.html())?;
        Ok(Section { text, headings })
    }
}

/// Hrefs of every anchor in `html`.
pub fn links(html: &str) -> Vec<String> {
    Page::parse(html).links()
}

/// Detach every element matching one of `selectors` from the tree.
fn remove_elements(doc: &mut Html, selectors: &[&str]) {
    let ids: Vec<_> = selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .flat_map(|sel| doc.select(&sel).map(|el| el.id()).collect::<Vec<_>>())
        .collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn collect_headings(root: ElementRef<'_>) -> Vec<Heading> {
    root.select(&HEADINGS)
        .filter_map(|h| {
            let level = h.value().name().get(1..)?.parse().ok()?;
            let text = element_words(h);
            (!text.is_empty()).then_some(Heading { level, text })
        })
        .collect()
}

/// Text nodes under `el` joined with single spaces.
fn element_words(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render an HTML fragment to plain text.
///
/// Link footnotes and emphasis markers added by the renderer are removed so
/// regexes over the text see the words as displayed on the page.
pub fn html_to_text(html: &str) -> Result<String, ExtractError> {
    let rendered = html2text::from_read(html.as_bytes(), TEXT_WIDTH)
        .map_err(|e| ExtractError::Render(e.to_string()))?;

    let text = FOOTNOTE_LINE_RE.replace_all(&rendered, "");
    let text = FOOTNOTE_REF_RE.replace_all(&text, "$1");
    let text = EMPHASIS_RE.replace_all(&text, "$1");

    let lines: Vec<&str> = text.lines().map(|l| l.trim_end()).collect();
    let joined = lines.join("\n");
    let text = BLANK_RUN_RE.replace_all(joined.trim(), "\n\n").to_string();

    if text.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}
