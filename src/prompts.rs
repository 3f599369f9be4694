//! System prompts.
//!
//! Two prompts are built in (`default` and `seo_specialist`). A JSON file of
//! `{"name": "prompt text"}` pairs can override them or add named prompts.
//! Bots store a `system_prompt` value that is either one of those names or a
//! literal prompt.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_PROMPT: &str = "default";
pub const SEO_PROMPT: &str = "seo_specialist";

const SEO_KEYWORDS: &[&str] = &[
    "seo",
    "search engine",
    "ranking",
    "keywords",
    "organic traffic",
    "google ranking",
    "search visibility",
    "indexing",
    "meta tags",
    "backlinks",
    "link building",
    "content marketing",
    "semrush",
    "ahrefs",
    "google analytics",
    "serp",
    "search results",
];

/// True when the question is about search-engine optimisation.
pub fn is_seo_query(question: &str) -> bool {
    let lower = question.to_lowercase();
    SEO_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Debug, Clone)]
pub struct PromptLibrary {
    project_name: String,
    named: BTreeMap<String, String>,
}

impl PromptLibrary {
    pub fn builtin(project_name: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            named: BTreeMap::new(),
        }
    }

    /// Built-in prompts plus the ones in `path`. A missing or invalid file is
    /// logged and ignored.
    pub fn load(project_name: &str, path: Option<&Path>) -> Self {
        let mut library = Self::builtin(project_name);
        let Some(path) = path else {
            return library;
        };
        match read_prompt_file(path) {
            Ok(named) => {
                tracing::info!(count = named.len(), path = %path.display(), "Loaded system prompts");
                library.named = named;
            }
            Err(e) => tracing::warn!(error = %format!("{:#}", e), "Using built-in system prompts"),
        }
        library
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = [DEFAULT_PROMPT, SEO_PROMPT].iter().map(|s| s.to_string()).collect();
        for name in self.named.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Prompt for a question without an explicit prompt. A file that lacks
    /// the requested name falls back to its own `default`.
    pub fn for_question(&self, is_seo: bool) -> String {
        let name = if is_seo { SEO_PROMPT } else { DEFAULT_PROMPT };
        if let Some(prompt) = self.named.get(name) {
            return prompt.clone();
        }
        if !self.named.is_empty() {
            if let Some(prompt) = self.named.get(DEFAULT_PROMPT) {
                return prompt.clone();
            }
        }
        if is_seo {
            self.seo_prompt()
        } else {
            self.default_prompt()
        }
    }

    /// Resolve a stored `system_prompt` value: a known name maps to its
    /// prompt, anything else is used verbatim.
    pub fn resolve(&self, name_or_text: &str) -> String {
        let key = name_or_text.trim();
        if let Some(prompt) = self.named.get(key) {
            return prompt.clone();
        }
        match key {
            "" | DEFAULT_PROMPT => self.default_prompt(),
            SEO_PROMPT => self.seo_prompt(),
            _ => name_or_text.to_string(),
        }
    }

    pub fn default_prompt(&self) -> String {
        let p = &self.project_name;
        format!(
            r#"You're a helpful assistant who knows {p} and DeFi well.

RULES:
- Never say "from the docs", "the documentation shows" or "according to"
- Refer to {p} directly ("{p} offers...", "Autopools use..."), never "their" or "the project"
- Be concise: 2-4 sentences for simple questions, 4-6 for complex ones
- Sound natural and conversational, like a knowledgeable friend

DATA PRIORITY:
- Website data is live and current; prefer it first, especially for TVL, APY and allocations
- Documentation is comprehensive; use it for detailed explanations
- Blog articles are historical; use them for background and announcements

KNOWLEDGE:
- Use the provided context for {p} specifics and your general DeFi knowledge otherwise
- If numbers or counts appear in the context, use them
- Don't say "I don't know" when the answer is in the context

FORMATTING:
- Use markdown: **bold** for emphasis, `code` for technical terms, lists for multiple items
- Format metrics clearly (e.g. **$6.32M TVL**, `14.97% APY`)"#
        )
    }

    pub fn seo_prompt(&self) -> String {
        let p = &self.project_name;
        format!(
            r#"You're a crypto SEO practitioner with deep experience in DeFi protocols, especially {p}.

APPROACH:
- Demonstrate expertise through the advice itself; never announce that you are a specialist
- Use SEO terminology naturally (ranking factors, SERP features, semantic search, structured data)
- Reference concrete tools and tactics (Search Console, keyword research, backlink strategy)
- Account for DeFi specifics: technical vocabulary, live on-chain metrics, community content
- Give practical, actionable recommendations

{p} CONTEXT:
- Use the provided context about {p} to ground your recommendations
- Live website data is current; documentation gives technical depth; the blog shows past announcements
- Prefer website over documentation over blog when citing facts

TONE:
- Professional but approachable, strategic and results-focused"#
        )
    }
}

fn read_prompt_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompts file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse prompts file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_seo_detection() {
        assert!(is_seo_query("How do we improve our Google ranking?"));
        assert!(is_seo_query("What about SERP features"));
        assert!(!is_seo_query("What is the APY of autoETH?"));
    }

    #[test]
    fn test_builtin_prompts_use_project_name() {
        let library = PromptLibrary::builtin("Acme");
        assert!(library.for_question(false).contains("Acme and DeFi"));
        assert!(library.for_question(true).contains("SEO"));
        assert_eq!(library.names(), vec!["default", "seo_specialist"]);
    }

    #[test]
    fn test_resolve_name_or_literal() {
        let library = PromptLibrary::builtin("Acme");
        assert_eq!(library.resolve("default"), library.default_prompt());
        assert_eq!(library.resolve("seo_specialist"), library.seo_prompt());
        assert_eq!(library.resolve("Answer like a pirate."), "Answer like a pirate.");
    }

    #[test]
    fn test_prompt_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"default": "Custom default", "pirate": "Arr"}"#)
            .unwrap();
        let library = PromptLibrary::load("Acme", Some(file.path()));
        assert_eq!(library.for_question(false), "Custom default");
        // No seo_specialist in the file: its default wins.
        assert_eq!(library.for_question(true), "Custom default");
        assert_eq!(library.resolve("pirate"), "Arr");
        assert!(library.names().contains(&"pirate".to_string()));
    }

    #[test]
    fn test_bad_prompt_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        let library = PromptLibrary::load("Acme", Some(file.path()));
        assert_eq!(library.for_question(false), library.default_prompt());
    }
}
