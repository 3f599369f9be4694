//! Retrieval-augmented answering.
//!
//! [`RagAgent::ask`] retrieves chunks from the active collection (website
//! first, then documentation, then blog), renders them into a numbered
//! context block and sends the question to the chat model with the chosen
//! system prompt and any prior conversation turns.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::index::active_collection;
use crate::llm::{ChatMessage, ChatModel, ChatRequest, LlmRouter, Usage};
use crate::models::{SearchResult, Source};
use crate::prompts::{is_seo_query, PromptLibrary};
use crate::search;

/// Per-call overrides. Unset fields use the config.
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub n_results: Option<usize>,
    /// A prompt name or literal prompt text. Disables SEO detection.
    pub system_prompt: Option<String>,
    /// Earlier turns, oldest first.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
    pub source: String,
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceCounts {
    pub website: usize,
    pub gitbook: usize,
    pub blog: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResult {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub source_counts: SourceCounts,
    pub is_seo_query: bool,
    pub context_used: String,
    pub model: String,
    pub usage: Usage,
}

pub struct RagAgent {
    pool: SqlitePool,
    config: Arc<Config>,
    model: Arc<dyn ChatModel>,
    prompts: PromptLibrary,
}

impl RagAgent {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        model: Arc<dyn ChatModel>,
        prompts: PromptLibrary,
    ) -> Self {
        Self {
            pool,
            config,
            model,
            prompts,
        }
    }

    /// Agent backed by the configured providers and prompt file.
    pub fn from_config(pool: SqlitePool, config: Arc<Config>) -> Result<Self> {
        let model: Arc<dyn ChatModel> = Arc::new(LlmRouter::from_config(&config)?);
        let prompts = PromptLibrary::load(
            &config.bot.project_name,
            config.bot.prompts_file.as_deref(),
        );
        Ok(Self::new(pool, config, model, prompts))
    }

    pub fn model(&self) -> Arc<dyn ChatModel> {
        self.model.clone()
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }

    pub fn default_model(&self) -> &str {
        &self.config.llm.model
    }

    /// Name and chunk count of the collection questions are answered from.
    pub async fn collection_status(&self) -> Result<Option<(String, i64)>> {
        let Some(name) = active_collection(&self.pool, &self.config).await? else {
            return Ok(None);
        };
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?")
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some((name, count)))
    }

    pub async fn search(&self, query: &str, n: usize) -> Result<Vec<SearchResult>> {
        search::search(&self.pool, &self.config, query, n).await
    }

    pub async fn ask(&self, question: &str, options: AskOptions) -> Result<AskResult> {
        if active_collection(&self.pool, &self.config).await?.is_none() {
            bail!("Index not built. Run `sbot index build` first.");
        }

        let is_seo = options.system_prompt.is_none() && is_seo_query(question);
        let n = options.n_results.unwrap_or(self.config.retrieval.n_results);
        let results = self.search(question, n).await?;

        let (context, counts) = build_context(&results);
        let system = match &options.system_prompt {
            Some(name_or_text) => self.prompts.resolve(name_or_text),
            None => self.prompts.for_question(is_seo),
        };

        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.config.llm.model.clone());

        let mut messages = options.history;
        messages.push(ChatMessage::user(build_user_prompt(
            &self.config.bot.project_name,
            &context,
            question,
            counts.website > 0,
        )));

        tracing::info!(
            model = %model,
            results = results.len(),
            seo = is_seo,
            "Generating answer"
        );

        let response = self
            .model
            .complete(&ChatRequest {
                model: model.clone(),
                system: Some(system),
                messages,
                max_tokens: options.max_tokens.unwrap_or(self.config.llm.max_tokens),
            })
            .await?;

        Ok(AskResult {
            answer: response.text,
            sources: results
                .iter()
                .map(|r| SourceRef {
                    title: r.title.clone(),
                    url: r.url.clone(),
                    source: r.source.clone(),
                    relevance: r.relevance(),
                })
                .collect(),
            source_counts: counts,
            is_seo_query: is_seo,
            context_used: context,
            model,
            usage: response.usage,
        })
    }
}

/// Render results as `[Source i - Label] title\ntext\n` blocks joined by
/// newlines, counting each known source.
pub fn build_context(results: &[SearchResult]) -> (String, SourceCounts) {
    let mut counts = SourceCounts::default();
    let parts: Vec<String> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let source = Source::from_label(&r.source);
            match source {
                Source::Website => counts.website += 1,
                Source::Docs => counts.gitbook += 1,
                Source::Blog => counts.blog += 1,
                Source::Unknown => {}
            }
            format!(
                "[Source {} - {}] {}\n{}\n",
                i + 1,
                source.display_label(),
                r.title,
                r.text
            )
        })
        .collect();
    (parts.join("\n"), counts)
}

pub fn build_user_prompt(project: &str, context: &str, question: &str, has_website: bool) -> String {
    let priority_note = if has_website {
        "Note: Website data is LIVE and CURRENT - prioritize this information first."
    } else {
        ""
    };
    format!(
        "Context ({project} info - prioritized by source: website > documentation > blog):\n\
         {context}\n\n\
         {priority_note}\n\n\
         Question: {question}\n\n\
         Answer directly and concisely using the context above. Prioritize information from \
         website sources when available. If numbers/counts are in the context, USE THEM. \
         Be casual. 2-4 sentences for simple questions."
    )
}
