//! Bot registry and lifecycle.
//!
//! Every registered bot is a [`BotRecord`] plus runtime state: status,
//! start time, counters and a ring buffer of the last 100 log entries.
//! Starting a bot spawns one task running the platform adapter
//! ([`telegram`], [`discord`] or [`slack`]) with a stop signal. Stopping
//! sends the signal, waits briefly for the task and aborts it otherwise.
//!
//! All registry mutations go through a single lock around the bot map.
//! Adapters report back through a [`BotHandle`], which flips the status to
//! `running` once the platform connection is up.

pub mod discord;
pub mod responder;
pub mod slack;
pub mod telegram;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::bot_config::{BotConfigStorage, BotRecord};
use crate::config::Config;
use crate::conversation::Summarizer;
use crate::rag::RagAgent;
use crate::storage::ConversationStorage;

pub use responder::Responder;

const LOG_CAPACITY: usize = 100;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
    Slack,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
            Platform::Slack => "slack",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "telegram" => Ok(Platform::Telegram),
            "discord" => Ok(Platform::Discord),
            "slack" => Ok(Platform::Slack),
            other => anyhow::bail!(
                "Unsupported platform: '{}'. Must be telegram, discord, or slack.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Error => "error",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Public view of one bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub bot_id: String,
    pub platform: String,
    pub name: String,
    pub status: RunState,
    pub model: String,
    pub start_time: Option<String>,
    pub uptime_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub log_count: usize,
}

#[derive(Debug)]
pub enum BotManagerError {
    NotFound(String),
    AlreadyExists(String),
    AlreadyRunning(String),
    NotRunning(String),
    ConfigLocked(String),
    UnsupportedPlatform(String),
    Storage(anyhow::Error),
}

impl std::fmt::Display for BotManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotManagerError::NotFound(id) => write!(f, "Bot not found: {}", id),
            BotManagerError::AlreadyExists(id) => write!(f, "Bot ID already exists: {}", id),
            BotManagerError::AlreadyRunning(id) => write!(f, "Bot is already running: {}", id),
            BotManagerError::NotRunning(id) => write!(f, "Bot is not running: {}", id),
            BotManagerError::ConfigLocked(id) => write!(
                f,
                "Cannot update config while bot {} is running. Stop bot first.",
                id
            ),
            BotManagerError::UnsupportedPlatform(p) => write!(f, "Unsupported platform: {}", p),
            BotManagerError::Storage(e) => write!(f, "Bot storage error: {:#}", e),
        }
    }
}

impl std::error::Error for BotManagerError {}

impl From<anyhow::Error> for BotManagerError {
    fn from(e: anyhow::Error) -> Self {
        BotManagerError::Storage(e)
    }
}

#[derive(Debug)]
struct Runtime {
    status: RunState,
    start_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
    logs: VecDeque<LogEntry>,
    messages_processed: i64,
    errors: i64,
}

impl Runtime {
    fn new() -> Self {
        Self {
            status: RunState::Stopped,
            start_time: None,
            error_message: None,
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            messages_processed: 0,
            errors: 0,
        }
    }

    fn push_log(&mut self, level: &str, message: &str) {
        if self.logs.len() == LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.to_string(),
        });
    }
}

/// Shared runtime state of one bot, handed to its adapter.
#[derive(Clone)]
pub struct BotHandle {
    bot_id: String,
    runtime: Arc<StdMutex<Runtime>>,
    bot_storage: Option<BotConfigStorage>,
}

impl BotHandle {
    fn new(bot_id: &str, bot_storage: Option<BotConfigStorage>) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            runtime: Arc::new(StdMutex::new(Runtime::new())),
            bot_storage,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    fn with_runtime<T>(&self, f: impl FnOnce(&mut Runtime) -> T) -> T {
        let mut guard = match self.runtime.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn log(&self, message: &str) {
        tracing::info!(bot = %self.bot_id, "{}", message);
        self.with_runtime(|rt| rt.push_log("INFO", message));
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(bot = %self.bot_id, "{}", message);
        self.with_runtime(|rt| rt.push_log("ERROR", message));
    }

    /// Called by an adapter once its platform connection is established.
    pub async fn mark_running(&self) {
        self.with_runtime(|rt| {
            rt.status = RunState::Running;
            rt.start_time = Some(Utc::now());
            rt.error_message = None;
        });
        self.log("Bot started successfully");
        self.persist_status(RunState::Running).await;
    }

    pub fn record_message(&self) {
        self.with_runtime(|rt| rt.messages_processed += 1);
    }

    pub fn record_error(&self) {
        self.with_runtime(|rt| rt.errors += 1);
    }

    pub fn status(&self) -> RunState {
        self.with_runtime(|rt| rt.status)
    }

    fn fail(&self, error: &anyhow::Error) {
        let message = format!("{:#}", error);
        self.with_runtime(|rt| {
            rt.status = RunState::Error;
            rt.start_time = None;
            rt.error_message = Some(message.clone());
        });
        self.log_error(&format!("Error running bot: {}", message));
    }

    async fn persist_status(&self, status: RunState) {
        if let Some(storage) = &self.bot_storage {
            if let Err(e) = storage.update_bot_status(&self.bot_id, status.as_str()).await {
                tracing::error!(bot = %self.bot_id, error = %e, "Error saving bot status");
            }
        }
    }
}

/// Runs one platform adapter until the stop signal flips to `true`.
pub type BotRunner = Arc<
    dyn Fn(Platform, String, Arc<Responder>, watch::Receiver<bool>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// The adapter for each platform.
pub fn platform_runner() -> BotRunner {
    Arc::new(
        |platform: Platform,
         token: String,
         responder: Arc<Responder>,
         shutdown: watch::Receiver<bool>|
         -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                match platform {
                    Platform::Telegram => telegram::run(&token, responder, shutdown).await,
                    Platform::Discord => discord::run(&token, responder, shutdown).await,
                    Platform::Slack => slack::run(&token, responder, shutdown).await,
                }
            })
        },
    )
}

/// What every bot needs to answer questions.
#[derive(Clone)]
pub struct BotServices {
    pub config: Arc<Config>,
    pub agent: Arc<RagAgent>,
    pub summarizer: Option<Summarizer>,
    pub conversations: Option<ConversationStorage>,
    pub bot_storage: Option<BotConfigStorage>,
}

struct RunningTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct BotInstance {
    record: BotRecord,
    platform: Platform,
    handle: BotHandle,
    task: Option<RunningTask>,
}

impl BotInstance {
    fn new(record: BotRecord, platform: Platform, bot_storage: Option<BotConfigStorage>) -> Self {
        let handle = BotHandle::new(&record.bot_id, bot_storage);
        Self {
            record,
            platform,
            handle,
            task: None,
        }
    }

    fn status_view(&self) -> BotStatus {
        self.handle.with_runtime(|rt| BotStatus {
            bot_id: self.record.bot_id.clone(),
            platform: self.record.platform.clone(),
            name: self.record.name.clone(),
            status: rt.status,
            model: self.record.model.clone(),
            start_time: rt.start_time.map(|t| t.to_rfc3339()),
            uptime_seconds: match (rt.status, rt.start_time) {
                (RunState::Running, Some(t)) => {
                    Some((Utc::now() - t).num_milliseconds() as f64 / 1000.0)
                }
                _ => None,
            },
            error_message: rt.error_message.clone(),
            log_count: rt.logs.len(),
        })
    }
}

pub struct BotManager {
    services: BotServices,
    runner: BotRunner,
    bots: Mutex<HashMap<String, BotInstance>>,
}

impl BotManager {
    pub fn new(services: BotServices) -> Self {
        Self::with_runner(services, platform_runner())
    }

    pub fn with_runner(services: BotServices, runner: BotRunner) -> Self {
        Self {
            services,
            runner,
            bots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new bot and persist it with status `registered`.
    pub async fn register(
        &self,
        record: BotRecord,
        auto_start: bool,
    ) -> Result<BotStatus, BotManagerError> {
        let platform: Platform = record
            .platform
            .parse()
            .map_err(|_| BotManagerError::UnsupportedPlatform(record.platform.clone()))?;
        let bot_id = record.bot_id.clone();
        {
            let mut bots = self.bots.lock().await;
            if bots.contains_key(&bot_id) {
                return Err(BotManagerError::AlreadyExists(bot_id));
            }

            let mut record = record;
            record.status = "registered".to_string();
            if let Some(storage) = &self.services.bot_storage {
                storage.save_bot(&record).await?;
            }

            let instance = BotInstance::new(record, platform, self.services.bot_storage.clone());
            instance
                .handle
                .log(&format!("Bot registered: {} ({})", instance.record.name, platform));
            bots.insert(bot_id.clone(), instance);
        }

        if auto_start {
            return self.start(&bot_id).await;
        }
        self.get_status(&bot_id)
            .await
            .ok_or(BotManagerError::NotFound(bot_id))
    }

    /// Stop the bot if needed, drop it from the registry and from storage.
    pub async fn unregister(&self, bot_id: &str) -> Result<(), BotManagerError> {
        let instance = {
            let mut bots = self.bots.lock().await;
            bots.remove(bot_id)
                .ok_or_else(|| BotManagerError::NotFound(bot_id.to_string()))?
        };

        if let Some(task) = instance.task {
            self.shutdown_task(&instance.handle, task).await;
        }
        if let Some(storage) = &self.services.bot_storage {
            storage.delete_bot(bot_id).await?;
        }
        tracing::info!(bot = %bot_id, "Bot unregistered");
        Ok(())
    }

    pub async fn start(&self, bot_id: &str) -> Result<BotStatus, BotManagerError> {
        let mut bots = self.bots.lock().await;
        let instance = bots
            .get_mut(bot_id)
            .ok_or_else(|| BotManagerError::NotFound(bot_id.to_string()))?;

        if instance.handle.status().is_active() {
            return Err(BotManagerError::AlreadyRunning(bot_id.to_string()));
        }

        instance.handle.with_runtime(|rt| {
            rt.status = RunState::Starting;
            rt.error_message = None;
            rt.messages_processed = 0;
            rt.errors = 0;
        });
        instance
            .handle
            .log(&format!("Starting {} bot...", instance.platform));

        let responder = Arc::new(Responder::new(
            &self.services,
            instance.platform,
            &instance.record,
            instance.handle.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let future = (self.runner)(
            instance.platform,
            instance.record.token.clone(),
            responder,
            shutdown_rx,
        );
        let handle = instance.handle.clone();
        let join = tokio::spawn(async move {
            match future.await {
                Ok(()) => {
                    handle.with_runtime(|rt| {
                        if rt.status.is_active() {
                            rt.status = RunState::Stopped;
                            rt.start_time = None;
                        }
                    });
                    handle.log("Bot loop exited");
                }
                Err(e) => handle.fail(&e),
            }
        });

        instance.task = Some(RunningTask {
            shutdown: shutdown_tx,
            join,
        });
        Ok(instance.status_view())
    }

    pub async fn stop(&self, bot_id: &str) -> Result<BotStatus, BotManagerError> {
        let (handle, task) = {
            let mut bots = self.bots.lock().await;
            let instance = bots
                .get_mut(bot_id)
                .ok_or_else(|| BotManagerError::NotFound(bot_id.to_string()))?;
            if !instance.handle.status().is_active() {
                return Err(BotManagerError::NotRunning(bot_id.to_string()));
            }
            instance.handle.log("Stopping bot...");
            (instance.handle.clone(), instance.task.take())
        };

        if let Some(task) = task {
            self.shutdown_task(&handle, task).await;
        }

        let (messages, errors, uptime) = handle.with_runtime(|rt| {
            let uptime = rt
                .start_time
                .map(|t| (Utc::now() - t).num_seconds())
                .unwrap_or(0);
            rt.status = RunState::Stopped;
            rt.start_time = None;
            (rt.messages_processed, rt.errors, uptime)
        });
        handle.log("Bot stopped successfully");
        handle.persist_status(RunState::Stopped).await;
        if let Some(storage) = &self.services.bot_storage {
            if let Err(e) = storage.record_bot_stats(bot_id, messages, errors, uptime).await {
                tracing::error!(bot = %bot_id, error = %e, "Failed to record bot stats");
            }
        }

        self.get_status(bot_id)
            .await
            .ok_or_else(|| BotManagerError::NotFound(bot_id.to_string()))
    }

    pub async fn restart(&self, bot_id: &str) -> Result<BotStatus, BotManagerError> {
        self.stop(bot_id).await?;
        self.start(bot_id).await
    }

    pub async fn get_status(&self, bot_id: &str) -> Option<BotStatus> {
        let bots = self.bots.lock().await;
        bots.get(bot_id).map(BotInstance::status_view)
    }

    /// Sorted by bot id.
    pub async fn get_all_status(&self) -> Vec<BotStatus> {
        let bots = self.bots.lock().await;
        let mut all: Vec<BotStatus> = bots.values().map(BotInstance::status_view).collect();
        all.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        all
    }

    /// The most recent `limit` entries, oldest first.
    pub async fn get_logs(&self, bot_id: &str, limit: usize) -> Option<Vec<LogEntry>> {
        let bots = self.bots.lock().await;
        let instance = bots.get(bot_id)?;
        Some(instance.handle.with_runtime(|rt| {
            let skip = rt.logs.len().saturating_sub(limit);
            rt.logs.iter().skip(skip).cloned().collect()
        }))
    }

    pub async fn update_config(
        &self,
        bot_id: &str,
        model: Option<String>,
        system_prompt: Option<String>,
    ) -> Result<BotStatus, BotManagerError> {
        let mut bots = self.bots.lock().await;
        let instance = bots
            .get_mut(bot_id)
            .ok_or_else(|| BotManagerError::NotFound(bot_id.to_string()))?;
        if instance.handle.status().is_active() {
            return Err(BotManagerError::ConfigLocked(bot_id.to_string()));
        }

        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            instance.handle.log(&format!("Model updated to: {}", model));
            instance.record.model = model;
        }
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            instance.record.system_prompt = prompt;
            instance.handle.log("System prompt updated");
        }

        if let Some(storage) = &self.services.bot_storage {
            let mut record = instance.record.clone();
            record.status = instance.handle.status().as_str().to_string();
            storage.save_bot(&record).await?;
        }
        Ok(instance.status_view())
    }

    /// Load stored bots. Bots stored as `running` are started again.
    pub async fn restore_from_storage(&self) -> Result<usize> {
        let Some(storage) = &self.services.bot_storage else {
            return Ok(0);
        };
        let saved = storage.get_all_bots().await?;
        tracing::info!(count = saved.len(), "Found saved bots in storage");

        let mut to_start = Vec::new();
        let mut restored = 0;
        {
            let mut bots = self.bots.lock().await;
            for record in saved {
                let platform: Platform = match record.platform.parse() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(bot = %record.bot_id, error = %e, "Skipping stored bot");
                        continue;
                    }
                };
                if record.status == RunState::Running.as_str() {
                    to_start.push(record.bot_id.clone());
                }
                let instance = BotInstance::new(record, platform, Some(storage.clone()));
                instance
                    .handle
                    .log(&format!("Restored from storage: {}", instance.record.name));
                bots.insert(instance.record.bot_id.clone(), instance);
                restored += 1;
            }
        }

        for bot_id in to_start {
            tracing::info!(bot = %bot_id, "Auto-starting bot (was running before shutdown)");
            if let Err(e) = self.start(&bot_id).await {
                tracing::error!(bot = %bot_id, error = %e, "Failed to auto-start bot");
            }
        }
        Ok(restored)
    }

    /// Restart every running bot, e.g. after the index was rebuilt.
    pub async fn restart_all_running(&self) -> usize {
        let running: Vec<String> = {
            let bots = self.bots.lock().await;
            bots.values()
                .filter(|b| b.handle.status() == RunState::Running)
                .map(|b| b.record.bot_id.clone())
                .collect()
        };
        if running.is_empty() {
            tracing::info!("No running bots to restart");
            return 0;
        }

        let mut restarted = 0;
        for bot_id in &running {
            match self.restart(bot_id).await {
                Ok(_) => restarted += 1,
                Err(e) => tracing::error!(bot = %bot_id, error = %e, "Error restarting bot"),
            }
        }
        restarted
    }

    /// Stop every active bot without changing what storage says about it.
    pub async fn shutdown(&self) {
        let tasks: Vec<(BotHandle, RunningTask)> = {
            let mut bots = self.bots.lock().await;
            bots.values_mut()
                .filter_map(|b| b.task.take().map(|t| (b.handle.clone(), t)))
                .collect()
        };
        for (handle, task) in tasks {
            self.shutdown_task(&handle, task).await;
        }
    }

    async fn shutdown_task(&self, handle: &BotHandle, task: RunningTask) {
        let _ = task.shutdown.send(true);
        let mut join = task.join;
        if tokio::time::timeout(STOP_TIMEOUT, &mut join).await.is_err() {
            handle.log_error("Bot did not stop in time; aborting task");
            join.abort();
        }
    }
}

/// Resolves when the stop signal is set or its sender is dropped.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::llm::testing::ScriptedModel;
    use crate::migrate::migrate_pool;
    use crate::prompts::PromptLibrary;

    fn test_runner<F, Fut>(f: F) -> BotRunner
    where
        F: Fn(Arc<Responder>, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Arc::new(
            move |_platform: Platform,
                  _token: String,
                  responder: Arc<Responder>,
                  shutdown: watch::Receiver<bool>|
                  -> BoxFuture<'static, Result<()>> { Box::pin(f(responder, shutdown)) },
        )
    }

    /// Connects immediately and idles until stopped.
    fn idle_runner() -> BotRunner {
        test_runner(|responder, mut shutdown| async move {
            responder.handle().mark_running().await;
            stopped(&mut shutdown).await;
            Ok::<(), anyhow::Error>(())
        })
    }

    fn failing_runner() -> BotRunner {
        test_runner(|_responder, _shutdown| async move {
            Err::<(), anyhow::Error>(anyhow::anyhow!("Unauthorized: invalid token"))
        })
    }

    async fn services() -> (tempfile::TempDir, BotServices) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_db_path(dir.path().join("bot.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        let config = Arc::new(config);
        let agent = Arc::new(RagAgent::new(
            pool.clone(),
            config.clone(),
            Arc::new(ScriptedModel::default()),
            PromptLibrary::builtin("Acme"),
        ));
        let services = BotServices {
            config,
            agent,
            summarizer: None,
            conversations: Some(ConversationStorage::new(pool.clone())),
            bot_storage: Some(BotConfigStorage::new(pool)),
        };
        (dir, services)
    }

    async fn wait_for(manager: &BotManager, bot_id: &str, state: RunState) {
        for _ in 0..100 {
            if manager.get_status(bot_id).await.map(|s| s.status) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bot {} never reached {:?}", bot_id, state);
    }

    fn record(id: &str) -> BotRecord {
        BotRecord::new(id, "telegram", "Support", "123:abc", "gpt-4o")
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Discord".parse::<Platform>().unwrap(), Platform::Discord);
        assert!("matrix".parse::<Platform>().is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_unknown_platforms() {
        let (_dir, services) = services().await;
        let manager = BotManager::with_runner(services.clone(), idle_runner());

        let status = manager.register(record("a"), false).await.unwrap();
        assert_eq!(status.status, RunState::Stopped);
        assert!(matches!(
            manager.register(record("a"), false).await,
            Err(BotManagerError::AlreadyExists(_))
        ));
        let bad = BotRecord::new("b", "matrix", "B", "t", "gpt-4o");
        assert!(matches!(
            manager.register(bad, false).await,
            Err(BotManagerError::UnsupportedPlatform(_))
        ));

        let stored = services.bot_storage.unwrap().get_bot("a").await.unwrap().unwrap();
        assert_eq!(stored.status, "registered");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_dir, services) = services().await;
        let storage = services.bot_storage.clone().unwrap();
        let manager = BotManager::with_runner(services, idle_runner());
        manager.register(record("a"), true).await.unwrap();
        wait_for(&manager, "a", RunState::Running).await;

        assert!(matches!(
            manager.start("a").await,
            Err(BotManagerError::AlreadyRunning(_))
        ));
        assert!(matches!(
            manager.update_config("a", Some("gpt-4o-mini".into()), None).await,
            Err(BotManagerError::ConfigLocked(_))
        ));
        assert_eq!(storage.get_bot("a").await.unwrap().unwrap().status, "running");
        assert!(manager.get_status("a").await.unwrap().uptime_seconds.is_some());

        let status = manager.stop("a").await.unwrap();
        assert_eq!(status.status, RunState::Stopped);
        assert!(status.start_time.is_none());
        assert!(matches!(
            manager.stop("a").await,
            Err(BotManagerError::NotRunning(_))
        ));
        assert_eq!(storage.get_bot("a").await.unwrap().unwrap().status, "stopped");
        assert_eq!(storage.get_bot_stats("a", 10).await.unwrap().len(), 1);

        let updated = manager
            .update_config("a", Some("gpt-4o-mini".into()), Some("pirate".into()))
            .await
            .unwrap();
        assert_eq!(updated.model, "gpt-4o-mini");
        assert_eq!(
            storage.get_bot("a").await.unwrap().unwrap().system_prompt,
            "pirate"
        );
    }

    #[tokio::test]
    async fn test_runner_failure_sets_error() {
        let (_dir, services) = services().await;
        let manager = BotManager::with_runner(services, failing_runner());
        manager.register(record("a"), true).await.unwrap();
        wait_for(&manager, "a", RunState::Error).await;

        let status = manager.get_status("a").await.unwrap();
        assert!(status.error_message.unwrap().contains("invalid token"));
        let logs = manager.get_logs("a", 50).await.unwrap();
        assert_eq!(logs.last().unwrap().level, "ERROR");
        // An errored bot can be started again.
        assert!(manager.start("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_starts_bots_stored_as_running() {
        let (_dir, services) = services().await;
        let storage = services.bot_storage.clone().unwrap();
        let mut running = record("r");
        running.status = "running".into();
        storage.save_bot(&running).await.unwrap();
        storage.save_bot(&record("s")).await.unwrap();

        let manager = BotManager::with_runner(services, idle_runner());
        assert_eq!(manager.restore_from_storage().await.unwrap(), 2);
        wait_for(&manager, "r", RunState::Running).await;
        assert_eq!(manager.get_status("s").await.unwrap().status, RunState::Stopped);

        assert_eq!(manager.restart_all_running().await, 1);
        wait_for(&manager, "r", RunState::Running).await;

        manager.unregister("r").await.unwrap();
        assert!(manager.get_status("r").await.is_none());
        assert!(storage.get_bot("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_ring_is_bounded() {
        let (_dir, services) = services().await;
        let manager = BotManager::with_runner(services, idle_runner());
        manager.register(record("a"), false).await.unwrap();
        for i in 0..150 {
            manager
                .update_config("a", Some(format!("model-{}", i)), None)
                .await
                .unwrap();
        }
        let status = manager.get_status("a").await.unwrap();
        assert_eq!(status.log_count, LOG_CAPACITY);
        let logs = manager.get_logs("a", 5).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[4].message, "Model updated to: model-149");
    }
}
