//! Background scraping.
//!
//! [`ScraperService`] runs one scrape task at a time. On start it either
//! rebuilds the index from the JSON already on disk or, when nothing has
//! been indexed yet, runs a full scrape. After that a website scrape and
//! rebuild runs every `interval_minutes`. Manual triggers go through the
//! same `is_scraping` guard, an atomic compare-and-swap, so overlapping
//! tasks are impossible. Subscribers receive every finished task.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::index::{self, ChunkCounts};
use crate::scrape::{self, ScrapeTarget};

const MAX_HISTORY: usize = 50;
const RECENT_HISTORY: usize = 10;
const ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Rebuild the index from scraped data already on disk.
    Build,
    /// Docs, website and blog, then a rebuild.
    Full,
    /// Website only, then a rebuild.
    Website,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Build => "build",
            TaskKind::Full => "full",
            TaskKind::Website => "website",
        }
    }
}

/// Outcome of one finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub status: TaskStatus,
    pub scrape_type: TaskKind,
    pub chunks: ChunkCounts,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScraperStatus {
    pub is_running: bool,
    pub is_scraping: bool,
    pub interval_minutes: u64,
    pub last_scrape_time: Option<String>,
    pub last_scrape_status: String,
    pub next_scrape_in_seconds: Option<u64>,
    pub scrape_count: u64,
    pub error_count: u64,
    pub chunk_counts: ChunkCounts,
    pub recent_history: Vec<HistoryEntry>,
}

#[derive(Debug, PartialEq)]
pub enum TriggerError {
    NotRunning,
    InProgress,
}

impl std::fmt::Display for TriggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerError::NotRunning => f.write_str("Scraper service is not running"),
            TriggerError::InProgress => f.write_str("Scrape already in progress"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// The work behind each task.
#[async_trait]
pub trait ScrapeJobs: Send + Sync {
    async fn scrape(&self, target: ScrapeTarget) -> Result<usize>;
    async fn rebuild_index(&self) -> Result<()>;
    /// Chunk counts of the active collection, zero when none exists.
    async fn chunk_counts(&self) -> Result<ChunkCounts>;
}

/// Scrapers and indexer against the configured database.
pub struct PipelineJobs {
    config: Arc<Config>,
    pool: SqlitePool,
}

impl PipelineJobs {
    pub fn new(config: Arc<Config>, pool: SqlitePool) -> Self {
        Self { config, pool }
    }
}

#[async_trait]
impl ScrapeJobs for PipelineJobs {
    async fn scrape(&self, target: ScrapeTarget) -> Result<usize> {
        match target {
            ScrapeTarget::Docs => scrape::scrape_docs(&self.config, None).await,
            ScrapeTarget::Website => scrape::scrape_website(&self.config, None).await,
            ScrapeTarget::Blog => scrape::scrape_blog(&self.config, None).await,
            ScrapeTarget::All => {
                let report = scrape::run_scrape(&self.config, ScrapeTarget::All, None).await;
                if let Some((name, error)) = report.failed.first() {
                    anyhow::bail!("{}: {}", name, error);
                }
                Ok(report.succeeded.iter().map(|(_, count)| count).sum())
            }
        }
    }

    async fn rebuild_index(&self) -> Result<()> {
        let report = index::build_index_with_pool(&self.pool, &self.config).await?;
        tracing::info!(chunks = report.chunks, collection = %report.collection, "Index rebuilt");
        let verify = index::verify_with_pool(&self.pool, &self.config).await?;
        tracing::info!(count = verify.count, samples = verify.sample.len(), "Index verified");
        Ok(())
    }

    async fn chunk_counts(&self) -> Result<ChunkCounts> {
        match index::active_collection(&self.pool, &self.config).await? {
            Some(collection) => index::chunk_counts(&self.pool, &collection).await,
            None => Ok(ChunkCounts::default()),
        }
    }
}

#[derive(Debug)]
struct ServiceState {
    last_scrape_time: Option<DateTime<Utc>>,
    last_scrape_instant: Option<Instant>,
    last_scrape_status: String,
    scrape_count: u64,
    error_count: u64,
    initial_scrape_done: bool,
    chunk_counts: ChunkCounts,
    history: VecDeque<HistoryEntry>,
}

/// Clears the `is_scraping` flag when dropped.
struct ClaimRelease<'a>(&'a AtomicBool);

impl Drop for ClaimRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ScraperService {
    jobs: Arc<dyn ScrapeJobs>,
    interval_minutes: u64,
    interval: Duration,
    is_running: AtomicBool,
    is_scraping: AtomicBool,
    state: Mutex<ServiceState>,
    events: broadcast::Sender<HistoryEntry>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl ScraperService {
    pub fn new(jobs: Arc<dyn ScrapeJobs>, interval_minutes: u64) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            jobs,
            interval_minutes,
            interval: Duration::from_secs(interval_minutes * 60),
            is_running: AtomicBool::new(false),
            is_scraping: AtomicBool::new(false),
            state: Mutex::new(ServiceState {
                last_scrape_time: None,
                last_scrape_instant: None,
                last_scrape_status: "Not started".to_string(),
                scrape_count: 0,
                error_count: 0,
                initial_scrape_done: false,
                chunk_counts: ChunkCounts::default(),
                history: VecDeque::with_capacity(MAX_HISTORY),
            }),
            events,
            loop_task: Mutex::new(None),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ServiceState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Load counts for an index that already exists.
    pub async fn load_existing(&self) {
        match self.jobs.chunk_counts().await {
            Ok(counts) if counts.total > 0 => {
                tracing::info!(chunks = counts.total, "Found existing index");
                self.with_state(|s| {
                    s.chunk_counts = counts;
                    s.last_scrape_status = "Existing data loaded".to_string();
                    s.initial_scrape_done = true;
                });
            }
            Ok(_) => tracing::debug!("No existing index"),
            Err(e) => tracing::debug!(error = %e, "Could not check existing index"),
        }
    }

    /// Start the interval loop and the initial task.
    pub async fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scraper service is already running");
            return;
        }
        self.load_existing().await;
        tracing::info!(interval_minutes = self.interval_minutes, "Data scraper service started");

        let initial = if self.with_state(|s| s.initial_scrape_done) {
            tracing::info!("Existing data detected; rebuilding index from disk");
            TaskKind::Build
        } else {
            tracing::info!("Scheduling initial full scrape");
            TaskKind::Full
        };

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            service.run_task(initial).await;

            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + service.interval,
                service.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while service.is_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !service.is_running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::info!("Starting scheduled website scrape");
                service.run_task(TaskKind::Website).await;
            }
        });
        if let Ok(mut slot) = self.loop_task.lock() {
            *slot = Some(handle);
        }
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.loop_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        tracing::info!("Data scraper service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Start a manual task in the background.
    pub fn trigger(self: &Arc<Self>, full: bool) -> Result<String, TriggerError> {
        if !self.is_running() {
            return Err(TriggerError::NotRunning);
        }
        if !self.try_claim() {
            return Err(TriggerError::InProgress);
        }
        let kind = if full { TaskKind::Full } else { TaskKind::Website };
        tracing::info!(kind = kind.as_str(), "Manual scrape triggered");

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.perform(kind).await;
        });
        Ok(format!("Manual {} scrape started", kind.as_str()))
    }

    /// Run a task now. `None` when another task holds the guard.
    pub async fn run_task(&self, kind: TaskKind) -> Option<HistoryEntry> {
        if !self.try_claim() {
            tracing::warn!("Scrape already in progress");
            return None;
        }
        Some(self.perform(kind).await)
    }

    fn try_claim(&self) -> bool {
        self.is_scraping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Runs with the guard held and releases it, also when the task is
    /// aborted part way.
    async fn perform(&self, kind: TaskKind) -> HistoryEntry {
        let claim = ClaimRelease(&self.is_scraping);
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(kind = kind.as_str(), "Running scrape task");

        let errors = match kind {
            TaskKind::Build => self.rebuild().await,
            TaskKind::Full => self.full_scrape().await,
            TaskKind::Website => match self.jobs.scrape(ScrapeTarget::Website).await {
                Ok(pages) => {
                    tracing::info!(pages, "Website scrape completed");
                    self.rebuild().await
                }
                Err(e) => vec![format!("Website: {:#}", e)],
            },
        };

        let counts = match self.jobs.chunk_counts().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::warn!(error = %e, "Could not refresh chunk counts");
                None
            }
        };

        let status = if errors.is_empty() {
            "Success".to_string()
        } else {
            format!("Partial: {}", errors.join("; "))
        };

        let entry = self.with_state(|s| {
            if let Some(counts) = counts {
                s.chunk_counts = counts;
            }
            if !errors.is_empty() {
                s.error_count += 1;
            }
            s.last_scrape_status = status.clone();
            s.last_scrape_time = Some(started_at);
            s.last_scrape_instant = Some(started);
            s.scrape_count += 1;
            s.initial_scrape_done = true;

            let entry = HistoryEntry {
                timestamp: started_at.to_rfc3339(),
                status: if errors.is_empty() {
                    TaskStatus::Success
                } else {
                    TaskStatus::Failed
                },
                scrape_type: kind,
                chunks: s.chunk_counts.clone(),
                duration_seconds: started.elapsed().as_secs_f64(),
                error: if errors.is_empty() {
                    None
                } else {
                    Some(status.chars().take(ERROR_CHARS).collect())
                },
            };
            if s.history.len() == MAX_HISTORY {
                s.history.pop_front();
            }
            s.history.push_back(entry.clone());
            entry
        });

        tracing::info!(
            status = %status,
            total_chunks = entry.chunks.total,
            "Scrape task finished"
        );
        drop(claim);
        // No receivers is fine.
        let _ = self.events.send(entry.clone());
        entry
    }

    async fn full_scrape(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let steps = [
            (ScrapeTarget::Docs, "Docs"),
            (ScrapeTarget::Website, "Website"),
            (ScrapeTarget::Blog, "Blog"),
        ];
        for (i, (target, label)) in steps.iter().enumerate() {
            tracing::info!("[{}/4] Scraping {}", i + 1, label.to_lowercase());
            match self.jobs.scrape(*target).await {
                Ok(count) => tracing::info!(count, "{} scraped", label),
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "Failed to scrape {}", label.to_lowercase());
                    errors.push(format!("{}: {:#}", label, e));
                }
            }
        }
        if errors.is_empty() {
            errors.extend(self.rebuild().await);
        }
        errors
    }

    async fn rebuild(&self) -> Vec<String> {
        tracing::info!("[4/4] Building complete index");
        match self.jobs.rebuild_index().await {
            Ok(()) => Vec::new(),
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Failed to rebuild index");
                vec![format!("Index: {:#}", e)]
            }
        }
    }

    pub fn status(&self) -> ScraperStatus {
        let is_scraping = self.is_scraping.load(Ordering::SeqCst);
        let interval = self.interval;
        self.with_state(|s| ScraperStatus {
            is_running: self.is_running(),
            is_scraping,
            interval_minutes: self.interval_minutes,
            last_scrape_time: s.last_scrape_time.map(|t| t.to_rfc3339()),
            last_scrape_status: s.last_scrape_status.clone(),
            next_scrape_in_seconds: match (s.last_scrape_instant, is_scraping) {
                (Some(last), false) => Some(interval.saturating_sub(last.elapsed()).as_secs()),
                _ => None,
            },
            scrape_count: s.scrape_count,
            error_count: s.error_count,
            chunk_counts: s.chunk_counts.clone(),
            recent_history: s
                .history
                .iter()
                .skip(s.history.len().saturating_sub(RECENT_HISTORY))
                .cloned()
                .collect(),
        })
    }

    /// Finished tasks, one message each.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEntry> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeJobs {
        fail: Vec<ScrapeTarget>,
        rebuilds: AtomicUsize,
        scrapes: Mutex<Vec<ScrapeTarget>>,
        existing: i64,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ScrapeJobs for FakeJobs {
        async fn scrape(&self, target: ScrapeTarget) -> Result<usize> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.scrapes.lock().unwrap().push(target);
            if self.fail.contains(&target) {
                anyhow::bail!("HTTP 503");
            }
            Ok(3)
        }

        async fn rebuild_index(&self) -> Result<()> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn chunk_counts(&self) -> Result<ChunkCounts> {
            let rebuilt = self.rebuilds.load(Ordering::SeqCst) as i64;
            let total = self.existing + rebuilt * 10;
            Ok(ChunkCounts { gitbook: total, website: 0, blog: 0, total })
        }
    }

    #[tokio::test]
    async fn test_full_scrape_rebuilds_when_all_succeed() {
        let jobs = Arc::new(FakeJobs::default());
        let service = ScraperService::new(jobs.clone(), 10);
        let entry = service.run_task(TaskKind::Full).await.unwrap();

        assert_eq!(entry.status, TaskStatus::Success);
        assert_eq!(entry.chunks.total, 10);
        assert_eq!(jobs.rebuilds.load(Ordering::SeqCst), 1);
        assert_eq!(
            *jobs.scrapes.lock().unwrap(),
            vec![ScrapeTarget::Docs, ScrapeTarget::Website, ScrapeTarget::Blog]
        );

        let status = service.status();
        assert_eq!(status.last_scrape_status, "Success");
        assert_eq!(status.scrape_count, 1);
        assert!(status.next_scrape_in_seconds.unwrap() <= 600);
    }

    #[tokio::test]
    async fn test_failed_scraper_skips_rebuild() {
        let jobs = Arc::new(FakeJobs { fail: vec![ScrapeTarget::Blog], ..Default::default() });
        let service = ScraperService::new(jobs.clone(), 10);
        let entry = service.run_task(TaskKind::Full).await.unwrap();

        assert_eq!(entry.status, TaskStatus::Failed);
        assert!(entry.error.unwrap().starts_with("Partial: Blog: HTTP 503"));
        assert_eq!(jobs.rebuilds.load(Ordering::SeqCst), 0);
        assert_eq!(jobs.scrapes.lock().unwrap().len(), 3);
        assert_eq!(service.status().error_count, 1);
    }

    #[tokio::test]
    async fn test_trigger_requires_running_service() {
        let service = ScraperService::new(Arc::new(FakeJobs::default()), 10);
        assert_eq!(service.trigger(true), Err(TriggerError::NotRunning));
    }

    #[tokio::test]
    async fn test_guard_rejects_overlapping_tasks() {
        let gate = Arc::new(Notify::new());
        let jobs = Arc::new(FakeJobs { gate: Some(gate.clone()), ..Default::default() });
        let service = ScraperService::new(jobs, 10);
        service.is_running.store(true, Ordering::SeqCst);

        let mut events = service.subscribe();
        assert!(service.trigger(false).unwrap().contains("website"));
        assert_eq!(service.trigger(true), Err(TriggerError::InProgress));
        assert!(service.run_task(TaskKind::Build).await.is_none());
        assert!(service.status().is_scraping);
        assert!(service.status().next_scrape_in_seconds.is_none());

        gate.notify_one();
        let finished = events.recv().await.unwrap();
        assert_eq!(finished.scrape_type, TaskKind::Website);
        assert!(!service.status().is_scraping);
    }

    #[tokio::test]
    async fn test_startup_with_existing_index_rebuilds_from_disk() {
        let jobs = Arc::new(FakeJobs { existing: 40, ..Default::default() });
        let service = ScraperService::new(jobs.clone(), 10);
        let mut events = service.subscribe();
        service.start().await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.scrape_type, TaskKind::Build);
        assert!(jobs.scrapes.lock().unwrap().is_empty());
        service.stop();
        assert!(!service.status().is_running);
    }

    #[tokio::test]
    async fn test_stop_mid_task_releases_guard() {
        let gate = Arc::new(Notify::new());
        let jobs = Arc::new(FakeJobs { gate: Some(gate), ..Default::default() });
        let service = ScraperService::new(jobs.clone(), 10);
        service.start().await;

        // The initial full scrape blocks on the gate.
        for _ in 0..100 {
            if service.status().is_scraping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.status().is_scraping);

        service.stop();
        for _ in 0..100 {
            if !service.status().is_scraping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!service.status().is_scraping);

        let entry = service.run_task(TaskKind::Build).await.unwrap();
        assert_eq!(entry.status, TaskStatus::Success);
        assert_eq!(jobs.rebuilds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Success).unwrap(), "success");
        assert_eq!(serde_json::to_value(TaskStatus::Failed).unwrap(), "failed");
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let service = ScraperService::new(Arc::new(FakeJobs::default()), 10);
        for _ in 0..(MAX_HISTORY + 5) {
            service.run_task(TaskKind::Build).await.unwrap();
        }
        let status = service.status();
        assert_eq!(status.recent_history.len(), RECENT_HISTORY);
        assert_eq!(status.scrape_count, (MAX_HISTORY + 5) as u64);
        assert_eq!(service.with_state(|s| s.history.len()), MAX_HISTORY);
    }
}
