//! Persistent conversation log, threads and per-user totals.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

const TITLE_CHARS: usize = 50;
const PREVIEW_CHARS: usize = 100;

/// One question/answer exchange to record.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub user_id: String,
    pub username: Option<String>,
    pub chat_id: String,
    pub chat_type: Option<String>,
    pub platform: String,
    pub question: String,
    pub answer: String,
    pub model: Option<String>,
    pub tokens_used: Option<i64>,
    pub context_length: Option<i64>,
    pub thread_id: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub thread_id: String,
    pub title: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub message_count: i64,
    pub last_message_preview: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub timestamp: Option<String>,
    pub question: String,
    pub answer: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserConversation {
    pub timestamp: Option<String>,
    pub chat_type: Option<String>,
    pub question: String,
    pub answer: String,
    pub model: Option<String>,
    pub tokens_used: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub username: String,
    pub platform: Option<String>,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub total_questions: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationHit {
    pub user_id: String,
    pub username: String,
    pub timestamp: Option<String>,
    pub question: String,
    pub answer: String,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopQuestion {
    pub question: String,
    pub count: i64,
    pub platform: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub total_conversations: i64,
    pub unique_users: i64,
    pub by_platform: BTreeMap<String, i64>,
    pub most_active_user: Option<String>,
    pub most_active_count: i64,
    pub total_tokens_used: i64,
    pub conversations_24h: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ExportedConversation {
    user_id: String,
    username: Option<String>,
    chat_id: String,
    chat_type: Option<String>,
    platform: String,
    timestamp: Option<String>,
    question: String,
    answer: String,
    model: Option<String>,
    tokens_used: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ClearedUserData {
    pub conversations: u64,
    pub threads: u64,
    pub users: u64,
}

/// First `n` characters of `s`.
fn prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn thread_title(question: &str) -> String {
    let mut title = prefix(question, TITLE_CHARS);
    if question.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[derive(Clone)]
pub struct ConversationStorage {
    pool: SqlitePool,
}

impl ConversationStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an exchange. The thread (when given) is created or bumped
    /// first, then the message row, then the user's totals.
    pub async fn save_conversation(&self, record: &NewConversation) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let preview = prefix(&record.question, PREVIEW_CHARS);

        if let Some(thread_id) = &record.thread_id {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM conversation_threads WHERE thread_id = ?",
            )
            .bind(thread_id)
            .fetch_one(&mut *tx)
            .await?;

            if exists {
                sqlx::query(
                    "UPDATE conversation_threads \
                     SET message_count = message_count + 1, updated_at = CURRENT_TIMESTAMP, \
                         last_message_preview = ? \
                     WHERE thread_id = ?",
                )
                .bind(&preview)
                .bind(thread_id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    "INSERT INTO conversation_threads \
                     (thread_id, user_id, title, message_count, last_message_preview) \
                     VALUES (?, ?, ?, 1, ?)",
                )
                .bind(thread_id)
                .bind(&record.user_id)
                .bind(thread_title(&record.question))
                .bind(&preview)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "INSERT INTO conversations \
             (user_id, thread_id, username, chat_id, chat_type, platform, question, answer, \
              model, tokens_used, context_length, system_prompt) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id)
        .bind(record.thread_id.as_deref())
        .bind(record.username.as_deref())
        .bind(&record.chat_id)
        .bind(record.chat_type.as_deref())
        .bind(&record.platform)
        .bind(&record.question)
        .bind(&record.answer)
        .bind(record.model.as_deref())
        .bind(record.tokens_used)
        .bind(record.context_length)
        .bind(record.system_prompt.as_deref())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO users \
             (user_id, username, platform, first_seen, last_seen, total_questions, total_tokens) \
             VALUES (?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP, 1, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 username = excluded.username, \
                 last_seen = CURRENT_TIMESTAMP, \
                 total_questions = total_questions + 1, \
                 total_tokens = total_tokens + COALESCE(excluded.total_tokens, 0)",
        )
        .bind(&record.user_id)
        .bind(record.username.as_deref())
        .bind(&record.platform)
        .bind(record.tokens_used.unwrap_or(0))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn create_thread(&self, user_id: &str, title: Option<&str>) -> Result<String> {
        let thread_id = uuid::Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO conversation_threads (thread_id, user_id, title) VALUES (?, ?, ?)")
            .bind(&thread_id)
            .bind(user_id)
            .bind(title.unwrap_or("New Conversation"))
            .execute(&self.pool)
            .await?;
        Ok(thread_id)
    }

    pub async fn get_user_threads(&self, user_id: &str, limit: i64) -> Result<Vec<Thread>> {
        let rows = sqlx::query(
            "SELECT thread_id, title, created_at, updated_at, message_count, last_message_preview \
             FROM conversation_threads WHERE user_id = ? \
             ORDER BY updated_at DESC, rowid DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Thread {
                thread_id: row.get("thread_id"),
                title: row.get("title"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                message_count: row.get::<Option<i64>, _>("message_count").unwrap_or(0),
                last_message_preview: row.get("last_message_preview"),
            })
            .collect())
    }

    pub async fn get_thread_messages(&self, thread_id: &str, limit: i64) -> Result<Vec<ThreadMessage>> {
        let rows = sqlx::query(
            "SELECT id, timestamp, question, answer, model, system_prompt \
             FROM conversations WHERE thread_id = ? \
             ORDER BY timestamp ASC, id ASC LIMIT ?",
        )
        .bind(thread_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ThreadMessage {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                question: row.get("question"),
                answer: row.get("answer"),
                model: row.get("model"),
                system_prompt: row.get("system_prompt"),
            })
            .collect())
    }

    /// Delete a thread and its messages. `false` when the thread does not
    /// exist or belongs to someone else.
    pub async fn delete_thread(&self, thread_id: &str, user_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM conversation_threads WHERE thread_id = ? AND user_id = ?")
                .bind(thread_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_thread_title(&self, thread_id: &str, user_id: &str, title: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversation_threads SET title = ? WHERE thread_id = ? AND user_id = ?",
        )
        .bind(title)
        .bind(thread_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<UserConversation>> {
        let rows = sqlx::query(
            "SELECT timestamp, chat_type, question, answer, model, tokens_used \
             FROM conversations WHERE user_id = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UserConversation {
                timestamp: row.get("timestamp"),
                chat_type: row.get("chat_type"),
                question: row.get("question"),
                answer: row.get("answer"),
                model: row.get("model"),
                tokens_used: row.get("tokens_used"),
            })
            .collect())
    }

    pub async fn get_all_users(&self) -> Result<Vec<UserSummary>> {
        let rows = sqlx::query(
            "SELECT user_id, username, platform, first_seen, last_seen, total_questions, total_tokens \
             FROM users ORDER BY total_questions DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UserSummary {
                user_id: row.get("user_id"),
                username: row
                    .get::<Option<String>, _>("username")
                    .unwrap_or_else(|| "Unknown".to_string()),
                platform: row.get("platform"),
                first_seen: row.get("first_seen"),
                last_seen: row.get("last_seen"),
                total_questions: row.get::<Option<i64>, _>("total_questions").unwrap_or(0),
                total_tokens: row.get::<Option<i64>, _>("total_tokens").unwrap_or(0),
            })
            .collect())
    }

    /// Case-insensitive substring match on question or answer, newest first.
    pub async fn search_conversations(&self, keyword: &str, limit: i64) -> Result<Vec<ConversationHit>> {
        let pattern = format!("%{}%", keyword);
        let rows = sqlx::query(
            "SELECT user_id, username, timestamp, question, answer, platform \
             FROM conversations WHERE question LIKE ? OR answer LIKE ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversationHit {
                user_id: row.get("user_id"),
                username: row
                    .get::<Option<String>, _>("username")
                    .unwrap_or_else(|| "Unknown".to_string()),
                timestamp: row.get("timestamp"),
                question: row.get("question"),
                answer: row.get("answer"),
                platform: row.get("platform"),
            })
            .collect())
    }

    /// Most asked questions, grouped case-insensitively.
    pub async fn get_top_questions(&self, limit: i64) -> Result<Vec<TopQuestion>> {
        let rows = sqlx::query(
            "SELECT MIN(question) AS question, COUNT(*) AS count, MIN(platform) AS platform \
             FROM conversations GROUP BY LOWER(question) \
             ORDER BY count DESC, question ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TopQuestion {
                question: row.get("question"),
                count: row.get("count"),
                platform: row.get("platform"),
            })
            .collect())
    }

    pub async fn get_analytics(&self) -> Result<Analytics> {
        let total_conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&self.pool)
            .await?;
        let unique_users: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT user_id) FROM users")
            .fetch_one(&self.pool)
            .await?;

        let by_platform: Vec<(String, i64)> =
            sqlx::query_as("SELECT platform, COUNT(*) FROM conversations GROUP BY platform")
                .fetch_all(&self.pool)
                .await?;

        let most_active: Option<(Option<String>, i64)> = sqlx::query_as(
            "SELECT username, COALESCE(total_questions, 0) FROM users \
             ORDER BY total_questions DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let total_tokens_used: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(total_tokens), 0) FROM users")
                .fetch_one(&self.pool)
                .await?;

        let conversations_24h: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversations WHERE datetime(timestamp) > datetime('now', '-1 day')",
        )
        .fetch_one(&self.pool)
        .await?;

        let (most_active_user, most_active_count) = match most_active {
            Some((name, count)) => (name, count),
            None => (None, 0),
        };

        Ok(Analytics {
            total_conversations,
            unique_users,
            by_platform: by_platform.into_iter().collect(),
            most_active_user,
            most_active_count,
            total_tokens_used,
            conversations_24h,
        })
    }

    /// Write every conversation as a pretty JSON array. Returns the count.
    pub async fn export_to_json(&self, path: &Path) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT user_id, username, chat_id, chat_type, platform, timestamp, question, answer, \
                    model, tokens_used \
             FROM conversations ORDER BY timestamp, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let conversations: Vec<ExportedConversation> = rows
            .iter()
            .map(|row| ExportedConversation {
                user_id: row.get("user_id"),
                username: row.get("username"),
                chat_id: row.get("chat_id"),
                chat_type: row.get("chat_type"),
                platform: row.get("platform"),
                timestamp: row.get("timestamp"),
                question: row.get("question"),
                answer: row.get("answer"),
                model: row.get("model"),
                tokens_used: row.get("tokens_used"),
            })
            .collect();

        ensure_parent(path)?;
        std::fs::write(path, serde_json::to_string_pretty(&conversations)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(conversations.len())
    }

    /// Write one `{"messages": [user, assistant]}` object per line.
    pub async fn export_for_finetuning(&self, path: &Path) -> Result<usize> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT question, answer FROM conversations ORDER BY timestamp, id")
                .fetch_all(&self.pool)
                .await?;

        ensure_parent(path)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for (question, answer) in &rows {
            let entry = serde_json::json!({
                "messages": [
                    {"role": "user", "content": question},
                    {"role": "assistant", "content": answer},
                ]
            });
            writeln!(writer, "{}", entry)?;
        }
        writer.flush()?;
        Ok(rows.len())
    }

    /// Remove every trace of a user: messages, threads and the user row.
    pub async fn clear_user_data(&self, user_id: &str) -> Result<ClearedUserData> {
        let mut tx = self.pool.begin().await?;
        let conversations = sqlx::query("DELETE FROM conversations WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let threads = sqlx::query("DELETE FROM conversation_threads WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let users = sqlx::query("DELETE FROM users WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(ClearedUserData {
            conversations,
            threads,
            users,
        })
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
