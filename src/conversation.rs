//! In-memory conversation memory with rolling summaries.
//!
//! Conversations are keyed by `(user, chat)`; direct messages use the user
//! id for both halves. A conversation idle for longer than the timeout is
//! reset by the next message. Once a conversation holds more than
//! `max_messages`, everything but the last 3 messages is summarised by the
//! chat model and dropped. Without a summariser, or when summarising fails,
//! only the last 5 messages are kept.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::llm::{ChatMessage, ChatModel, ChatRequest, Role};

const KEEP_AFTER_SUMMARY: usize = 3;
const KEEP_WITHOUT_SUMMARY: usize = 5;
const LLM_HISTORY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub user: String,
    pub chat: String,
}

impl ConversationKey {
    pub fn new(user: &str, chat: Option<&str>) -> Self {
        let chat = chat.filter(|c| !c.is_empty()).unwrap_or(user);
        Self {
            user: user.to_string(),
            chat: chat.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Conversation {
    messages: Vec<StoredMessage>,
    summary: Option<String>,
    last_activity: DateTime<Utc>,
    /// Bumped on reset so a summary computed for an older conversation is discarded.
    generation: u64,
}

impl Conversation {
    fn new(now: DateTime<Utc>, generation: u64) -> Self {
        Self {
            messages: Vec::new(),
            summary: None,
            last_activity: now,
            generation,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationStats {
    pub total_users: usize,
    pub active_conversations: usize,
    pub timeout_minutes: i64,
}

/// Model used to summarise old messages.
#[derive(Clone)]
pub struct Summarizer {
    pub model: Arc<dyn ChatModel>,
    pub model_name: String,
    pub max_tokens: u32,
}

pub struct ConversationManager {
    max_messages: usize,
    timeout: Duration,
    summarizer: Option<Summarizer>,
    conversations: Mutex<HashMap<ConversationKey, Conversation>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl ConversationManager {
    pub fn new(max_messages: usize, timeout_minutes: i64, summarizer: Option<Summarizer>) -> Self {
        Self {
            max_messages,
            timeout: Duration::minutes(timeout_minutes),
            summarizer,
            conversations: Mutex::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn add_message(&self, key: &ConversationKey, role: Role, content: &str) {
        self.add_message_at(key, role, content, Utc::now()).await
    }

    pub(crate) async fn add_message_at(
        &self,
        key: &ConversationKey,
        role: Role,
        content: &str,
        now: DateTime<Utc>,
    ) {
        let pending = {
            let mut conversations = self.conversations.lock().await;
            let fresh = || {
                Conversation::new(
                    now,
                    self.next_generation
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
                )
            };
            let conversation = conversations.entry(key.clone()).or_insert_with(fresh);
            if now - conversation.last_activity > self.timeout {
                tracing::debug!(user = %key.user, chat = %key.chat, "Conversation timed out, starting fresh");
                *conversation = fresh();
            }

            conversation.messages.push(StoredMessage {
                role,
                content: content.to_string(),
                timestamp: now,
            });
            conversation.last_activity = now;

            if conversation.messages.len() <= self.max_messages {
                return;
            }

            match &self.summarizer {
                None => {
                    truncate_to_last(&mut conversation.messages, KEEP_WITHOUT_SUMMARY);
                    return;
                }
                Some(summarizer) => {
                    let split = conversation.messages.len() - KEEP_AFTER_SUMMARY;
                    let transcript = render_transcript(&conversation.messages[..split]);
                    (summarizer.clone(), transcript, split, conversation.generation)
                }
            }
        };

        // The model call happens without holding the lock.
        let (summarizer, transcript, split, generation) = pending;
        let result = summarize(&summarizer, &transcript).await;

        let mut conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get_mut(key) else {
            return;
        };
        if conversation.generation != generation || conversation.messages.len() < split {
            return;
        }
        match result {
            Ok(summary) => {
                conversation.summary = Some(match conversation.summary.take() {
                    Some(existing) => format!("{} {}", existing, summary),
                    None => summary,
                });
                conversation.messages.drain(..split);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Summarization failed, truncating instead");
                truncate_to_last(&mut conversation.messages, KEEP_WITHOUT_SUMMARY);
            }
        }
    }

    /// Summary line plus the last `last_n` messages as a text block.
    /// Empty when there is no conversation.
    pub async fn get_context(&self, key: &ConversationKey, last_n: usize) -> String {
        let conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get(key) else {
            return String::new();
        };

        let mut parts = Vec::new();
        if let Some(summary) = &conversation.summary {
            parts.push(format!("Previous conversation summary: {}", summary));
        }
        let start = conversation.messages.len().saturating_sub(last_n);
        let recent = &conversation.messages[start..];
        if !recent.is_empty() {
            parts.push("\nRecent conversation:".to_string());
            for m in recent {
                parts.push(format!("{}: {}", role_label(m.role), m.content));
            }
        }
        parts.join("\n").trim_start().to_string()
    }

    /// History for a chat request: the summary as a user/assistant exchange,
    /// then the last 8 messages.
    pub async fn get_messages_for_llm(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        let conversations = self.conversations.lock().await;
        let Some(conversation) = conversations.get(key) else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        if let Some(summary) = &conversation.summary {
            messages.push(ChatMessage::user(format!(
                "[Previous conversation context: {}]",
                summary
            )));
            messages.push(ChatMessage::assistant(
                "Got it, I remember our previous discussion.",
            ));
        }
        let start = conversation.messages.len().saturating_sub(LLM_HISTORY);
        messages.extend(conversation.messages[start..].iter().map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        }));
        messages
    }

    pub async fn get_messages(&self, key: &ConversationKey) -> Vec<StoredMessage> {
        let conversations = self.conversations.lock().await;
        conversations
            .get(key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub async fn clear_conversation(&self, key: &ConversationKey) -> bool {
        self.conversations.lock().await.remove(key).is_some()
    }

    pub async fn get_stats(&self) -> ConversationStats {
        let now = Utc::now();
        let conversations = self.conversations.lock().await;
        ConversationStats {
            total_users: conversations.len(),
            active_conversations: conversations
                .values()
                .filter(|c| now - c.last_activity < self.timeout)
                .count(),
            timeout_minutes: self.timeout.num_minutes(),
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

fn render_transcript(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", role_label(m.role), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_to_last(messages: &mut Vec<StoredMessage>, keep: usize) {
    let excess = messages.len().saturating_sub(keep);
    messages.drain(..excess);
}

async fn summarize(summarizer: &Summarizer, transcript: &str) -> anyhow::Result<String> {
    let prompt = format!(
        "Summarize this conversation concisely, focusing on key topics discussed and important context:\n\n\
         {}\n\n\
         Keep it brief and conversational. Focus on what the user was asking about and key points established.",
        transcript
    );
    let response = summarizer
        .model
        .complete(&ChatRequest {
            model: summarizer.model_name.clone(),
            system: None,
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: summarizer.max_tokens,
        })
        .await?;
    Ok(response.text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    fn key() -> ConversationKey {
        ConversationKey::new("u1", None)
    }

    fn manager_with(model: Option<Arc<ScriptedModel>>) -> ConversationManager {
        let summarizer = model.map(|m| Summarizer {
            model: m,
            model_name: "summary-model".into(),
            max_tokens: 300,
        });
        ConversationManager::new(10, 30, summarizer)
    }

    async fn fill(manager: &ConversationManager, n: usize) {
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            manager.add_message(&key(), role, &format!("m{}", i)).await;
        }
    }

    #[test]
    fn test_dm_key_uses_user_twice() {
        assert_eq!(ConversationKey::new("u", None), ConversationKey::new("u", Some("u")));
        assert_eq!(ConversationKey::new("u", Some("")).chat, "u");
        assert_ne!(ConversationKey::new("u", Some("c")), ConversationKey::new("u", None));
    }

    #[tokio::test]
    async fn test_summarises_all_but_last_three() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("Asked about pools.")]));
        let manager = manager_with(Some(model.clone()));
        fill(&manager, 11).await;

        let messages = manager.get_messages(&key()).await;
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m8", "m9", "m10"]);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "summary-model");
        assert!(requests[0].messages[0].content.contains("User: m0\nAssistant: m1"));
        assert!(!requests[0].messages[0].content.contains("m8"));
        drop(requests);

        let llm = manager.get_messages_for_llm(&key()).await;
        assert_eq!(llm[0].content, "[Previous conversation context: Asked about pools.]");
        assert_eq!(llm[1].role, Role::Assistant);
        assert_eq!(llm.len(), 5);
    }

    #[tokio::test]
    async fn test_summaries_accumulate() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("First."), Ok("Second.")]));
        let manager = manager_with(Some(model));
        fill(&manager, 19).await;
        let context = manager.get_context(&key(), 5).await;
        assert!(context.starts_with("Previous conversation summary: First. Second."));
    }

    #[tokio::test]
    async fn test_truncates_without_summarizer() {
        let manager = manager_with(None);
        fill(&manager, 11).await;
        assert_eq!(manager.get_messages(&key()).await.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_summary_truncates() {
        let model = Arc::new(ScriptedModel::new(vec![Err("boom")]));
        let manager = manager_with(Some(model));
        fill(&manager, 11).await;
        let messages = manager.get_messages(&key()).await;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content, "m6");
        assert!(manager.get_context(&key(), 5).await.starts_with("Recent conversation:"));
    }

    #[tokio::test]
    async fn test_timeout_resets_conversation() {
        let manager = manager_with(None);
        let start = Utc::now();
        manager.add_message_at(&key(), Role::User, "old", start).await;
        manager
            .add_message_at(&key(), Role::User, "new", start + Duration::minutes(31))
            .await;
        let messages = manager.get_messages(&key()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "new");
    }

    #[tokio::test]
    async fn test_context_format_and_clear() {
        let manager = manager_with(None);
        manager.add_message(&key(), Role::User, "What is autoETH?").await;
        manager.add_message(&key(), Role::Assistant, "An autopool.").await;
        assert_eq!(
            manager.get_context(&key(), 5).await,
            "Recent conversation:\nUser: What is autoETH?\nAssistant: An autopool."
        );
        assert_eq!(
            manager.get_stats().await,
            ConversationStats { total_users: 1, active_conversations: 1, timeout_minutes: 30 }
        );
        assert!(manager.clear_conversation(&key()).await);
        assert_eq!(manager.get_context(&key(), 5).await, "");
        assert!(manager.get_messages_for_llm(&key()).await.is_empty());
    }
}
