//! Platform-independent question handling shared by every adapter.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{BotHandle, BotServices, Platform};
use crate::bot_config::BotRecord;
use crate::conversation::{ConversationKey, ConversationManager};
use crate::llm::Role;
use crate::prompts::DEFAULT_PROMPT;
use crate::rag::{AskOptions, AskResult, RagAgent};
use crate::storage::{ConversationStorage, NewConversation};

const SOURCE_KEYWORDS: &[&str] = &["source", "link", "where", "reference", "doc"];
const MAX_SOURCES: usize = 3;
const CONTEXT_MESSAGES: usize = 5;

pub const APOLOGY: &str = "Sorry, I encountered an error processing your question. \
     Please try rephrasing it or contact support if the issue persists.";

/// A question addressed to the bot, mention already removed.
#[derive(Debug, Clone, Default)]
pub struct Incoming {
    pub user_id: String,
    pub username: Option<String>,
    pub chat_id: Option<String>,
    pub chat_type: Option<String>,
    pub text: String,
}

impl Incoming {
    fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, self.chat_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotStats {
    pub questions_answered: u64,
    pub documents_indexed: i64,
    pub active_conversations: usize,
    pub model: String,
}

pub struct Responder {
    platform: Platform,
    project_name: String,
    model: String,
    max_tokens: u32,
    n_results: usize,
    system_prompt: Option<String>,
    agent: Arc<RagAgent>,
    conversations: ConversationManager,
    storage: Option<ConversationStorage>,
    handle: BotHandle,
    questions_answered: AtomicU64,
}

impl Responder {
    pub fn new(
        services: &BotServices,
        platform: Platform,
        record: &BotRecord,
        handle: BotHandle,
    ) -> Self {
        let config = &services.config;
        let system_prompt = match record.system_prompt.trim() {
            "" | DEFAULT_PROMPT => None,
            _ => Some(record.system_prompt.clone()),
        };
        Self {
            platform,
            project_name: config.bot.project_name.clone(),
            model: record.model.clone(),
            max_tokens: config.llm.max_tokens,
            n_results: config.bot.n_results,
            system_prompt,
            agent: services.agent.clone(),
            conversations: ConversationManager::new(
                config.bot.max_messages,
                config.bot.timeout_minutes,
                services.summarizer.clone(),
            ),
            storage: services.conversations.clone(),
            handle,
            questions_answered: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &BotHandle {
        &self.handle
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Answer a question. Failures are logged and turned into an apology.
    pub async fn answer(&self, incoming: &Incoming) -> String {
        match self.try_answer(incoming).await {
            Ok(answer) => answer,
            Err(e) => {
                self.handle.record_error();
                self.handle
                    .log_error(&format!("Error answering question: {:#}", e));
                APOLOGY.to_string()
            }
        }
    }

    pub async fn try_answer(&self, incoming: &Incoming) -> Result<String> {
        let question = incoming.text.trim();
        let who = incoming.username.as_deref().unwrap_or(&incoming.user_id);
        tracing::info!(bot = %self.handle.bot_id(), user = %who, "Question: {}", question);

        let key = incoming.key();
        let context = self.conversations.get_context(&key, CONTEXT_MESSAGES).await;
        let enhanced = if context.is_empty() {
            question.to_string()
        } else {
            format!("{}\n\nCurrent question: {}", context, question)
        };

        let result = self
            .agent
            .ask(
                &enhanced,
                AskOptions {
                    model: Some(self.model.clone()),
                    max_tokens: Some(self.max_tokens),
                    n_results: Some(self.n_results),
                    system_prompt: self.system_prompt.clone(),
                    history: Vec::new(),
                },
            )
            .await?;

        let mut answer = result.answer.clone();
        if wants_sources(question) {
            answer.push_str(&format_sources(self.platform, &result));
        }

        self.conversations.add_message(&key, Role::User, question).await;
        self.conversations
            .add_message(&key, Role::Assistant, &answer)
            .await;
        self.save(incoming, question, &answer, &result).await;

        self.questions_answered.fetch_add(1, Ordering::Relaxed);
        self.handle.record_message();
        tracing::info!(bot = %self.handle.bot_id(), user = %who, "Answered question");
        Ok(answer)
    }

    async fn save(&self, incoming: &Incoming, question: &str, answer: &str, result: &AskResult) {
        let Some(storage) = &self.storage else {
            return;
        };
        let record = NewConversation {
            user_id: incoming.user_id.clone(),
            username: incoming.username.clone(),
            chat_id: incoming
                .chat_id
                .clone()
                .unwrap_or_else(|| incoming.user_id.clone()),
            chat_type: incoming.chat_type.clone(),
            platform: self.platform.as_str().to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            model: Some(result.model.clone()),
            tokens_used: Some(result.usage.total_tokens as i64),
            context_length: Some(result.context_used.len() as i64),
            thread_id: None,
            system_prompt: self.system_prompt.clone(),
        };
        if let Err(e) = storage.save_conversation(&record).await {
            tracing::warn!(bot = %self.handle.bot_id(), error = %e, "Failed to save conversation");
        }
    }

    pub async fn clear(&self, user_id: &str, chat_id: Option<&str>) -> bool {
        self.conversations
            .clear_conversation(&ConversationKey::new(user_id, chat_id))
            .await
    }

    pub async fn stats(&self) -> BotStats {
        let documents_indexed = match self.agent.collection_status().await {
            Ok(Some((_, count))) => count,
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count indexed chunks");
                0
            }
        };
        BotStats {
            questions_answered: self.questions_answered.load(Ordering::Relaxed),
            documents_indexed,
            active_conversations: self.conversations.get_stats().await.active_conversations,
            model: self.model.clone(),
        }
    }
}

/// True when the question asks where the answer comes from.
pub fn wants_sources(question: &str) -> bool {
    let lower = question.to_lowercase();
    SOURCE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Up to three source links in the platform's link syntax.
pub fn format_sources(platform: Platform, result: &AskResult) -> String {
    let mut out = match platform {
        Platform::Telegram => "\n\n📚 *Sources:*\n".to_string(),
        Platform::Discord => "\n\n**Sources:**\n".to_string(),
        Platform::Slack => "\n\n*Sources:*\n".to_string(),
    };
    for source in result.sources.iter().take(MAX_SOURCES) {
        let line = match platform {
            Platform::Slack => format!("• <{}|{}>\n", source.url, source.title),
            Platform::Telegram | Platform::Discord => {
                format!("• [{}]({})\n", source.title, source.url)
            }
        };
        out.push_str(&line);
    }
    out
}

/// Remove every occurrence of `mention` and trim.
pub fn strip_mention(text: &str, mention: &str) -> String {
    if mention.is_empty() {
        return text.trim().to_string();
    }
    text.replace(mention, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot_config::BotConfigStorage;
    use crate::chunk::chunk_document;
    use crate::config::Config;
    use crate::db;
    use crate::index::write_collection;
    use crate::llm::testing::ScriptedModel;
    use crate::llm::Usage;
    use crate::migrate::migrate_pool;
    use crate::models::ChunkMetadata;
    use crate::prompts::PromptLibrary;
    use crate::rag::{SourceCounts, SourceRef};

    fn result_with_sources(n: usize) -> AskResult {
        AskResult {
            answer: "ok".into(),
            sources: (0..n)
                .map(|i| SourceRef {
                    title: format!("Page {}", i),
                    url: format!("https://docs.auto.finance/{}", i),
                    source: "gitbook".into(),
                    relevance: 0.9,
                })
                .collect(),
            source_counts: SourceCounts::default(),
            is_seo_query: false,
            context_used: String::new(),
            model: "gpt-4o".into(),
            usage: Usage::new(1, 1),
        }
    }

    #[test]
    fn test_wants_sources() {
        assert!(wants_sources("Where can I read about this?"));
        assert!(wants_sources("Any docs on autoETH?"));
        assert!(!wants_sources("What is autoETH?"));
    }

    #[test]
    fn test_source_link_syntax_per_platform() {
        let result = result_with_sources(5);
        let telegram = format_sources(Platform::Telegram, &result);
        assert!(telegram.contains("• [Page 0](https://docs.auto.finance/0)"));
        assert!(!telegram.contains("Page 3"));

        let slack = format_sources(Platform::Slack, &result);
        assert!(slack.contains("• <https://docs.auto.finance/1|Page 1>"));
        assert!(format_sources(Platform::Discord, &result).starts_with("\n\n**Sources:**"));
    }

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("@acme_bot what is TOKE?", "@acme_bot"), "what is TOKE?");
        assert_eq!(strip_mention("<@U1> hi <@U1>", "<@U1>"), "hi");
        assert_eq!(strip_mention("  plain ", ""), "plain");
    }

    async fn responder(model: Arc<ScriptedModel>) -> (tempfile::TempDir, Responder, ConversationStorage) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_db_path(dir.path().join("bot.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        let chunks = chunk_document(
            "Autopools rebalance liquidity automatically.",
            "Autopools",
            "https://docs.auto.finance/autopools",
            &ChunkMetadata { source: "gitbook".into(), scraped_at: None, has_live_data: false },
            &config.chunking,
        );
        write_collection(&pool, &config, &config.index.collection, &chunks)
            .await
            .unwrap();

        let config = Arc::new(config);
        let storage = ConversationStorage::new(pool.clone());
        let services = BotServices {
            config: config.clone(),
            agent: Arc::new(RagAgent::new(
                pool.clone(),
                config,
                model,
                PromptLibrary::builtin("Acme"),
            )),
            summarizer: None,
            conversations: Some(storage.clone()),
            bot_storage: Some(BotConfigStorage::new(pool)),
        };
        let record = BotRecord::new("tg", "telegram", "Support", "t", "gpt-4o");
        let handle = BotHandle::new("tg", None);
        let responder = Responder::new(&services, Platform::Telegram, &record, handle);
        (dir, responder, storage)
    }

    fn question(text: &str) -> Incoming {
        Incoming {
            user_id: "42".into(),
            username: Some("alice".into()),
            chat_id: Some("42".into()),
            chat_type: Some("private".into()),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_follow_up_carries_conversation_context() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("Autopools are automated vaults."),
            Ok("They rebalance automatically."),
        ]));
        let (_dir, responder, storage) = responder(model.clone()).await;

        let first = responder.answer(&question("What are Autopools?")).await;
        assert_eq!(first, "Autopools are automated vaults.");
        responder.answer(&question("How do they rebalance?")).await;

        let requests = model.requests.lock().unwrap();
        let last_prompt = &requests[1].messages.last().unwrap().content;
        assert!(last_prompt.contains("Current question: How do they rebalance?"));
        assert!(last_prompt.contains("What are Autopools?"));
        assert_eq!(requests[1].model, "gpt-4o");
        drop(requests);

        let stats = responder.stats().await;
        assert_eq!(stats.questions_answered, 2);
        assert_eq!(stats.active_conversations, 1);
        assert!(stats.documents_indexed > 0);

        let analytics = storage.get_analytics().await.unwrap();
        assert_eq!(analytics.total_conversations, 2);
        assert_eq!(analytics.by_platform.get("telegram"), Some(&2));
    }

    #[tokio::test]
    async fn test_failure_returns_apology() {
        let model = Arc::new(ScriptedModel::new(vec![Err("upstream down")]));
        let (_dir, responder, storage) = responder(model).await;

        let answer = responder.answer(&question("What are Autopools?")).await;
        assert_eq!(answer, APOLOGY);
        assert_eq!(responder.stats().await.questions_answered, 0);
        assert_eq!(storage.get_analytics().await.unwrap().total_conversations, 0);
    }

    #[tokio::test]
    async fn test_sources_appended_on_request() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("See the docs.")]));
        let (_dir, responder, _storage) = responder(model).await;
        let answer = responder
            .answer(&question("Where is the Autopools documentation?"))
            .await;
        assert!(answer.starts_with("See the docs.\n\n📚 *Sources:*"));
        assert!(answer.contains("(https://docs.auto.finance/autopools)"));
    }

    #[tokio::test]
    async fn test_clear_forgets_context() {
        let model = Arc::new(ScriptedModel::default());
        let (_dir, responder, _storage) = responder(model).await;
        responder.answer(&question("What are Autopools?")).await;
        assert!(responder.clear("42", Some("42")).await);
        assert_eq!(responder.stats().await.active_conversations, 0);
    }
}
