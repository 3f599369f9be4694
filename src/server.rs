//! HTTP API for the web chat, the admin dashboard and bot management.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service banner |
//! | `GET`  | `/api/health` | Health check |
//! | `GET`  | `/api/config` | Public client configuration |
//! | `POST` | `/api/auth/google` | Verify a Google ID token |
//! | `POST` | `/api/ask` | Ask a question from the web chat |
//! | `GET`  | `/api/conversation/{user_id}` | In-memory web conversation |
//! | `POST` | `/api/conversation/clear` | Forget the web conversation |
//! | `GET`  | `/api/stats`, `/api/analytics`, `/api/analytics/top-questions` | Usage figures |
//! | `GET`  | `/api/users`, `/api/users/{user_id}/threads` | Users and their threads |
//! | `POST` | `/api/threads` | Create a thread |
//! | `GET`  | `/api/threads/{thread_id}/messages` | Thread messages |
//! | `PUT`/`DELETE` | `/api/threads/{thread_id}` | Rename or delete a thread |
//! | `GET`  | `/api/bots` | All bots plus aggregate stats |
//! | `POST` | `/api/bots/register` | Register a bot |
//! | `GET`/`PUT`/`DELETE` | `/api/bots/{bot_id}` | Inspect, reconfigure or remove a bot |
//! | `POST` | `/api/bots/{bot_id}/start`, `/stop`, `/restart` | Lifecycle |
//! | `GET`  | `/api/bots/{bot_id}/logs`, `/api/bots/{bot_id}/stats` | Bot logs and stats rows |
//! | `GET`  | `/api/scraper/status` | Scraper service status |
//! | `POST` | `/api/scraper/trigger` | Start a manual scrape |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `conflict` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the dashboard can be
//! served from anywhere.

use anyhow::Context as _;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::bot_config::{BotConfigStorage, BotRecord};
use crate::bots::{BotManager, BotManagerError, BotServices};
use crate::config::Config;
use crate::conversation::{ConversationKey, ConversationManager, Summarizer};
use crate::db;
use crate::llm::{provider_for_model, Provider, Role};
use crate::migrate::migrate_pool;
use crate::models::utc_now_iso;
use crate::rag::{AskOptions, RagAgent};
use crate::scheduler::{PipelineJobs, ScraperService, TaskStatus, TriggerError};
use crate::storage::{ConversationStorage, NewConversation};

/// Chat id used for every web conversation.
const WEB_CHAT: &str = "web";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Which background services `serve` starts next to the API.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub scheduler: bool,
    pub bots: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            scheduler: true,
            bots: true,
        }
    }
}

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub agent: Arc<RagAgent>,
    /// Conversation memory of the web chat.
    pub conversations: Arc<ConversationManager>,
    pub storage: ConversationStorage,
    pub bot_storage: BotConfigStorage,
    /// `None` when started with `--no-bots`.
    pub bots: Option<Arc<BotManager>>,
    /// `None` when started with `--no-scheduler`.
    pub scraper: Option<Arc<ScraperService>>,
    pub http: reqwest::Client,
}

impl AppState {
    /// State without bot manager or scraper service.
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        agent: Arc<RagAgent>,
        summarizer: Option<Summarizer>,
    ) -> anyhow::Result<Self> {
        let conversations = Arc::new(ConversationManager::new(
            config.bot.max_messages,
            config.bot.timeout_minutes,
            summarizer,
        ));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            config,
            agent,
            conversations,
            storage: ConversationStorage::new(pool.clone()),
            bot_storage: BotConfigStorage::new(pool),
            bots: None,
            scraper: None,
            http,
        })
    }

    fn bots(&self) -> Result<&Arc<BotManager>, AppError> {
        self.bots
            .as_ref()
            .ok_or_else(|| not_found("bot manager is disabled (server started with --no-bots)"))
    }
}

/// Builds the router with every route and the CORS layer.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/api/health", get(handle_health))
        .route("/api/config", get(handle_config))
        .route("/api/auth/google", post(handle_google_auth))
        .route("/api/ask", post(handle_ask))
        .route("/api/conversation/clear", post(handle_clear_conversation))
        .route("/api/conversation/{user_id}", get(handle_get_conversation))
        .route("/api/stats", get(handle_stats))
        .route("/api/analytics", get(handle_analytics))
        .route("/api/analytics/top-questions", get(handle_top_questions))
        .route("/api/users", get(handle_users))
        .route("/api/users/{user_id}/threads", get(handle_user_threads))
        .route("/api/threads", post(handle_create_thread))
        .route("/api/threads/{thread_id}/messages", get(handle_thread_messages))
        .route(
            "/api/threads/{thread_id}",
            axum::routing::put(handle_rename_thread).delete(handle_delete_thread),
        )
        .route("/api/bots", get(handle_list_bots))
        .route("/api/bots/register", post(handle_register_bot))
        .route(
            "/api/bots/{bot_id}",
            get(handle_get_bot)
                .put(handle_update_bot)
                .delete(handle_delete_bot),
        )
        .route("/api/bots/{bot_id}/start", post(handle_start_bot))
        .route("/api/bots/{bot_id}/stop", post(handle_stop_bot))
        .route("/api/bots/{bot_id}/restart", post(handle_restart_bot))
        .route("/api/bots/{bot_id}/logs", get(handle_bot_logs))
        .route("/api/bots/{bot_id}/stats", get(handle_bot_stats))
        .route("/api/scraper/status", get(handle_scraper_status))
        .route("/api/scraper/trigger", post(handle_scraper_trigger))
        .layer(cors)
        .with_state(state)
}

/// Starts the API plus the bot manager and scraper service.
///
/// Binds to `[server].bind` and runs until Ctrl-C. On shutdown the scraper
/// loop is stopped and every bot task is signalled, leaving the stored bot
/// states untouched so the next start restores them.
pub async fn run_server(config: &Config, options: ServeOptions) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate_pool(&pool).await?;

    let agent = Arc::new(RagAgent::from_config(pool.clone(), config.clone())?);
    let summarizer = Summarizer {
        model: agent.model(),
        model_name: config.llm.summary_model.clone(),
        max_tokens: config.llm.summary_max_tokens,
    };
    let mut state = AppState::new(
        config.clone(),
        pool.clone(),
        agent.clone(),
        Some(summarizer.clone()),
    )?;

    if options.bots {
        let manager = Arc::new(BotManager::new(BotServices {
            config: config.clone(),
            agent: agent.clone(),
            summarizer: Some(summarizer),
            conversations: Some(state.storage.clone()),
            bot_storage: Some(state.bot_storage.clone()),
        }));
        match manager.restore_from_storage().await {
            Ok(count) => tracing::info!(count, "Restored bots from storage"),
            Err(e) => tracing::error!(error = %format!("{:#}", e), "Failed to restore bots"),
        }
        state.bots = Some(manager);
    }

    if options.scheduler {
        let jobs = Arc::new(PipelineJobs::new(config.clone(), pool.clone()));
        let scraper = ScraperService::new(jobs, config.scraper.interval_minutes);
        if config.bot.restart_on_index_update {
            if let Some(manager) = state.bots.clone() {
                spawn_restart_on_update(&scraper, manager);
            }
        }
        scraper.start().await;
        state.scraper = Some(scraper);
    }

    let scraper = state.scraper.clone();
    let bots = state.bots.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(bind = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    if let Some(scraper) = scraper {
        scraper.stop();
    }
    if let Some(bots) = bots {
        bots.shutdown().await;
    }
    pool.close().await;
    Ok(())
}

/// Restart running bots after every successful scrape task.
fn spawn_restart_on_update(scraper: &Arc<ScraperService>, manager: Arc<BotManager>) {
    let mut events = scraper.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(entry) if entry.status == TaskStatus::Success => {
                    let restarted = manager.restart_all_running().await;
                    tracing::info!(restarted, "Restarted bots after index update");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed scraper events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        internal(format!("{:#}", err))
    }
}

impl From<BotManagerError> for AppError {
    fn from(err: BotManagerError) -> Self {
        match err {
            BotManagerError::NotFound(_) => not_found(err.to_string()),
            BotManagerError::UnsupportedPlatform(_) => bad_request(err.to_string()),
            BotManagerError::Storage(e) => AppError::from(e),
            BotManagerError::AlreadyExists(_)
            | BotManagerError::AlreadyRunning(_)
            | BotManagerError::NotRunning(_)
            | BotManagerError::ConfigLocked(_) => conflict(err.to_string()),
        }
    }
}

impl From<TriggerError> for AppError {
    fn from(err: TriggerError) -> Self {
        conflict(err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

fn require(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(bad_request(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

// ============ Service info ============

/// `"openai"` for GPT models, `"claude"` otherwise.
pub fn rag_agent_label(model: &str) -> &'static str {
    match provider_for_model(model) {
        Provider::OpenAi => "openai",
        Provider::Anthropic => "claude",
    }
}

async fn handle_root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "service": format!("{} Bot API", state.config.bot.project_name),
        "model": state.agent.default_model(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let model = state.agent.default_model();
    Json(json!({
        "status": "healthy",
        "model": model,
        "rag_agent": rag_agent_label(model),
        "conversation_manager": "active",
        "storage": "connected",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "google_client_id": state.config.secrets.google_client_id }))
}

// ============ Google sign-in ============

#[derive(Deserialize)]
struct GoogleAuthRequest {
    id_token: String,
}

/// Claims returned by Google's tokeninfo endpoint.
#[derive(Debug, Deserialize)]
pub struct GoogleClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct GoogleUser {
    pub user_id: String,
    pub email: Option<String>,
    pub name: String,
    pub picture: Option<String>,
}

/// Accept the claims only when issued by Google for this client.
pub fn check_google_claims(claims: GoogleClaims, client_id: Option<&str>) -> anyhow::Result<GoogleUser> {
    let Some(client_id) = client_id else {
        anyhow::bail!("GOOGLE_CLIENT_ID is not configured");
    };
    if !GOOGLE_ISSUERS.contains(&claims.iss.as_str()) {
        anyhow::bail!("Wrong issuer: {}", claims.iss);
    }
    if claims.aud != client_id {
        anyhow::bail!("Token was issued for another client");
    }
    Ok(GoogleUser {
        user_id: claims.sub,
        email: claims.email,
        name: claims.name.unwrap_or_else(|| "User".to_string()),
        picture: claims.picture,
    })
}

async fn verify_google_token(state: &AppState, id_token: &str) -> anyhow::Result<GoogleUser> {
    let client_id = state.config.secrets.google_client_id.as_deref();
    if client_id.is_none() {
        anyhow::bail!("GOOGLE_CLIENT_ID is not configured");
    }
    let response = state
        .http
        .get(&state.config.server.google_tokeninfo_url)
        .query(&[("id_token", id_token)])
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("tokeninfo returned {}", response.status());
    }
    let claims: GoogleClaims = response.json().await?;
    check_google_claims(claims, client_id)
}

async fn handle_google_auth(
    State(state): State<AppState>,
    Json(req): Json<GoogleAuthRequest>,
) -> ApiResult<GoogleUser> {
    require(&req.id_token, "id_token")?;
    match verify_google_token(&state, &req.id_token).await {
        Ok(user) => Ok(Json(user)),
        Err(e) => {
            tracing::warn!(error = %e, "Google token rejected");
            Err(unauthorized("Invalid authentication token"))
        }
    }
}

// ============ Web chat ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    user_id: String,
    user_name: Option<String>,
    thread_id: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
    timestamp: String,
    model: String,
    thread_id: Option<String>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> ApiResult<AskResponse> {
    require(&req.question, "question")?;
    require(&req.user_id, "user_id")?;

    let key = ConversationKey::new(&req.user_id, Some(WEB_CHAT));
    let history = state.conversations.get_messages_for_llm(&key).await;

    let result = state
        .agent
        .ask(
            &req.question,
            AskOptions {
                history,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %format!("{:#}", e), "Error processing question");
            internal(format!("Error processing question: {:#}", e))
        })?;

    state
        .conversations
        .add_message(&key, Role::User, &req.question)
        .await;
    state
        .conversations
        .add_message(&key, Role::Assistant, &result.answer)
        .await;

    let record = NewConversation {
        user_id: req.user_id.clone(),
        username: Some(req.user_name.clone().unwrap_or_else(|| "User".to_string())),
        chat_id: "web_chat".to_string(),
        chat_type: Some("web".to_string()),
        platform: "web".to_string(),
        question: req.question.clone(),
        answer: result.answer.clone(),
        model: Some(result.model.clone()),
        tokens_used: Some(i64::from(result.usage.total_tokens)),
        context_length: Some(result.context_used.chars().count() as i64),
        thread_id: req.thread_id.clone(),
        system_prompt: None,
    };
    if let Err(e) = state.storage.save_conversation(&record).await {
        tracing::error!(error = %format!("{:#}", e), "Failed to save conversation");
    }

    Ok(Json(AskResponse {
        answer: result.answer,
        timestamp: utc_now_iso(),
        model: result.model,
        thread_id: req.thread_id,
    }))
}

async fn handle_get_conversation(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let key = ConversationKey::new(&user_id, Some(WEB_CHAT));
    let messages = state.conversations.get_messages(&key).await;
    Json(json!(messages))
}

#[derive(Deserialize)]
struct ClearRequest {
    user_id: String,
}

async fn handle_clear_conversation(
    State(state): State<AppState>,
    Json(req): Json<ClearRequest>,
) -> ApiResult<Value> {
    require(&req.user_id, "user_id")?;
    let key = ConversationKey::new(&req.user_id, Some(WEB_CHAT));
    state.conversations.clear_conversation(&key).await;
    Ok(Json(json!({
        "status": "success",
        "message": "Conversation cleared",
    })))
}

// ============ Analytics ============

async fn handle_stats(State(state): State<AppState>) -> ApiResult<Value> {
    let analytics = state.storage.get_analytics().await?;
    Ok(Json(json!({
        "total_conversations": analytics.total_conversations,
        "unique_users": analytics.unique_users,
        "total_tokens": analytics.total_tokens_used,
        "platforms": analytics.by_platform,
    })))
}

async fn handle_analytics(State(state): State<AppState>) -> ApiResult<Value> {
    let analytics = state.storage.get_analytics().await?;
    Ok(Json(json!(analytics)))
}

async fn handle_top_questions(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Value> {
    let top = state.storage.get_top_questions(q.limit.unwrap_or(10)).await?;
    Ok(Json(json!(top)))
}

async fn handle_users(State(state): State<AppState>) -> ApiResult<Value> {
    let users = state.storage.get_all_users().await?;
    Ok(Json(json!(users)))
}

// ============ Threads ============

async fn handle_user_threads(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Value> {
    let threads = state
        .storage
        .get_user_threads(&user_id, q.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!(threads)))
}

#[derive(Deserialize)]
struct CreateThreadRequest {
    user_id: String,
    title: Option<String>,
}

async fn handle_create_thread(
    State(state): State<AppState>,
    Json(req): Json<CreateThreadRequest>,
) -> ApiResult<Value> {
    require(&req.user_id, "user_id")?;
    let thread_id = state
        .storage
        .create_thread(&req.user_id, req.title.as_deref())
        .await?;
    Ok(Json(json!({ "thread_id": thread_id })))
}

async fn handle_thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Value> {
    let messages = state
        .storage
        .get_thread_messages(&thread_id, q.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!(messages)))
}

#[derive(Deserialize)]
struct RenameThreadRequest {
    user_id: String,
    title: String,
}

async fn handle_rename_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<RenameThreadRequest>,
) -> ApiResult<Value> {
    require(&req.title, "title")?;
    if !state
        .storage
        .update_thread_title(&thread_id, &req.user_id, &req.title)
        .await?
    {
        return Err(not_found(format!("Thread not found: {}", thread_id)));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn handle_delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Value> {
    if !state.storage.delete_thread(&thread_id, &q.user_id).await? {
        return Err(not_found(format!("Thread not found: {}", thread_id)));
    }
    Ok(Json(json!({ "success": true })))
}

// ============ Bots ============

async fn handle_list_bots(State(state): State<AppState>) -> ApiResult<Value> {
    let bots = state.bots()?.get_all_status().await;
    let stats = state.bot_storage.get_all_stats().await?;
    Ok(Json(json!({ "bots": bots, "stats": stats })))
}

#[derive(Deserialize)]
struct RegisterBotRequest {
    platform: String,
    token: String,
    name: String,
    bot_id: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    #[serde(default)]
    auto_start: bool,
}

/// `{platform}_{first 8 hex digits of a v4 uuid}`.
pub fn new_bot_id(platform: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", platform, &uuid[..8])
}

async fn handle_register_bot(
    State(state): State<AppState>,
    Json(req): Json<RegisterBotRequest>,
) -> ApiResult<Value> {
    require(&req.token, "token")?;
    require(&req.name, "name")?;
    let manager = state.bots()?;

    let platform = req.platform.trim().to_lowercase();
    let bot_id = req
        .bot_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| new_bot_id(&platform));
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.bot.default_model.clone());

    let mut record = BotRecord::new(&bot_id, &platform, &req.name, &req.token, &model);
    if let Some(prompt) = req.system_prompt.filter(|p| !p.trim().is_empty()) {
        record.system_prompt = prompt;
    }

    let bot = manager.register(record, req.auto_start).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Bot {} registered", bot.name),
        "bot": bot,
    })))
}

async fn handle_get_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> ApiResult<Value> {
    let bot = state
        .bots()?
        .get_status(&bot_id)
        .await
        .ok_or_else(|| not_found(format!("Bot not found: {}", bot_id)))?;
    Ok(Json(json!(bot)))
}

#[derive(Deserialize)]
struct UpdateBotRequest {
    model: Option<String>,
    system_prompt: Option<String>,
}

async fn handle_update_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Json(req): Json<UpdateBotRequest>,
) -> ApiResult<Value> {
    let bot = state
        .bots()?
        .update_config(&bot_id, req.model, req.system_prompt)
        .await?;
    Ok(Json(json!({ "success": true, "bot": bot })))
}

async fn handle_delete_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> ApiResult<Value> {
    state.bots()?.unregister(&bot_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Bot {} deleted", bot_id),
    })))
}

async fn handle_start_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> ApiResult<Value> {
    let bot = state.bots()?.start(&bot_id).await?;
    Ok(Json(json!({ "success": true, "bot": bot })))
}

async fn handle_stop_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> ApiResult<Value> {
    let bot = state.bots()?.stop(&bot_id).await?;
    Ok(Json(json!({ "success": true, "bot": bot })))
}

async fn handle_restart_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> ApiResult<Value> {
    let bot = state.bots()?.restart(&bot_id).await?;
    Ok(Json(json!({ "success": true, "bot": bot })))
}

async fn handle_bot_logs(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Value> {
    let limit = q.limit.unwrap_or(50).max(0) as usize;
    let logs = state
        .bots()?
        .get_logs(&bot_id, limit)
        .await
        .ok_or_else(|| not_found(format!("Bot not found: {}", bot_id)))?;
    Ok(Json(json!({ "logs": logs })))
}

async fn handle_bot_stats(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Value> {
    let stats = state
        .bot_storage
        .get_bot_stats(&bot_id, q.limit.unwrap_or(24))
        .await?;
    Ok(Json(json!({ "stats": stats })))
}

// ============ Scraper ============

async fn handle_scraper_status(State(state): State<AppState>) -> ApiResult<Value> {
    let scraper = state
        .scraper
        .as_ref()
        .ok_or_else(|| not_found("scraper service is disabled (server started with --no-scheduler)"))?;
    Ok(Json(json!(scraper.status())))
}

#[derive(Deserialize)]
struct TriggerQuery {
    #[serde(default)]
    full: bool,
}

async fn handle_scraper_trigger(
    State(state): State<AppState>,
    Query(q): Query<TriggerQuery>,
) -> ApiResult<Value> {
    let scraper = state.scraper.as_ref().ok_or(TriggerError::NotRunning)?;
    let message = scraper.trigger(q.full)?;
    Ok(Json(json!({ "success": true, "message": message })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_document;
    use crate::index::write_collection;
    use crate::llm::testing::ScriptedModel;
    use crate::models::ChunkMetadata;
    use crate::bots::{stopped, BotRunner, Platform, Responder};
    use crate::index::ChunkCounts;
    use crate::prompts::PromptLibrary;
    use crate::scheduler::{ScrapeJobs, TaskKind};
    use crate::scrape::ScrapeTarget;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::watch;

    fn claims(iss: &str, aud: &str) -> GoogleClaims {
        GoogleClaims {
            iss: iss.to_string(),
            aud: aud.to_string(),
            sub: "1234".to_string(),
            email: Some("ada@example.com".to_string()),
            name: None,
            picture: None,
        }
    }

    #[test]
    fn test_google_claims_accepted_for_both_issuers() {
        for iss in GOOGLE_ISSUERS {
            let user = check_google_claims(claims(iss, "client-1"), Some("client-1")).unwrap();
            assert_eq!(user.user_id, "1234");
            assert_eq!(user.name, "User");
        }
    }

    #[test]
    fn test_google_claims_rejected() {
        assert!(check_google_claims(claims("evil.com", "client-1"), Some("client-1")).is_err());
        assert!(check_google_claims(claims("accounts.google.com", "other"), Some("client-1")).is_err());
        assert!(check_google_claims(claims("accounts.google.com", "client-1"), None).is_err());
    }

    #[test]
    fn test_rag_agent_label() {
        assert_eq!(rag_agent_label("gpt-4o"), "openai");
        assert_eq!(rag_agent_label("claude-sonnet-4-20250514"), "claude");
    }

    #[test]
    fn test_new_bot_id_shape() {
        let id = new_bot_id("telegram");
        assert!(id.starts_with("telegram_"));
        assert_eq!(id.len(), "telegram_".len() + 8);
    }

    #[test]
    fn test_manager_errors_map_to_status() {
        let cases = [
            (BotManagerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BotManagerError::AlreadyRunning("x".into()), StatusCode::CONFLICT),
            (BotManagerError::ConfigLocked("x".into()), StatusCode::CONFLICT),
            (BotManagerError::UnsupportedPlatform("irc".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
        assert_eq!(AppError::from(TriggerError::InProgress).status, StatusCode::CONFLICT);
    }

    struct ScriptedJobs {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ScrapeJobs for ScriptedJobs {
        async fn scrape(&self, _target: ScrapeTarget) -> anyhow::Result<usize> {
            Ok(1)
        }

        async fn rebuild_index(&self) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no documents");
            }
            Ok(())
        }

        async fn chunk_counts(&self) -> anyhow::Result<ChunkCounts> {
            Ok(ChunkCounts::default())
        }
    }

    #[tokio::test]
    async fn test_successful_rebuild_restarts_running_bots() {
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

        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let runner: BotRunner = Arc::new(
            move |_platform: Platform,
                  _token: String,
                  responder: Arc<Responder>,
                  mut shutdown: watch::Receiver<bool>|
                  -> BoxFuture<'static, anyhow::Result<()>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    responder.handle().mark_running().await;
                    stopped(&mut shutdown).await;
                    Ok(())
                })
            },
        );
        let manager = Arc::new(BotManager::with_runner(
            BotServices {
                config,
                agent,
                summarizer: None,
                conversations: None,
                bot_storage: Some(BotConfigStorage::new(pool)),
            },
            runner,
        ));
        let record = BotRecord::new("telegram_a", "telegram", "Support", "123:abc", "gpt-4o");
        manager.register(record, true).await.unwrap();

        let jobs = Arc::new(ScriptedJobs { fail: AtomicBool::new(true) });
        let scraper = ScraperService::new(jobs.clone(), 10);
        spawn_restart_on_update(&scraper, manager.clone());

        let failed = scraper.run_task(TaskKind::Build).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        jobs.fail.store(false, Ordering::SeqCst);
        let entry = scraper.run_task(TaskKind::Build).await.unwrap();
        assert_eq!(entry.status, TaskStatus::Success);
        for _ in 0..100 {
            if starts.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    async fn serve_test_app(model: Arc<ScriptedModel>) -> (tempfile::TempDir, String) {
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
        let prompts = PromptLibrary::builtin(&config.bot.project_name);
        let agent = Arc::new(RagAgent::new(pool.clone(), config.clone(), model, prompts));
        let state = AppState::new(config, pool, agent, None).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (dir, format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_ask_records_web_conversation() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("Autopools rebalance for you.")]));
        let (_dir, base) = serve_test_app(model.clone()).await;
        let client = reqwest::Client::new();

        let resp: Value = client
            .post(format!("{}/api/ask", base))
            .json(&json!({
                "question": "What are Autopools?",
                "user_id": "u1",
                "user_email": "ada@example.com",
                "thread_id": "t1"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["answer"], "Autopools rebalance for you.");
        assert_eq!(resp["thread_id"], "t1");

        let history: Value = client
            .get(format!("{}/api/conversation/u1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["role"], "user");

        let threads: Value = client
            .get(format!("{}/api/users/u1/threads", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(threads[0]["thread_id"], "t1");

        let stats: Value = client
            .get(format!("{}/api/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["total_conversations"], 1);
        assert_eq!(stats["platforms"]["web"], 1);
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let (_dir, base) = serve_test_app(Arc::new(ScriptedModel::default())).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/api/ask", base))
            .json(&json!({ "question": "  ", "user_id": "u1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST.as_u16());
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_disabled_services_answer_not_found() {
        let (_dir, base) = serve_test_app(Arc::new(ScriptedModel::default())).await;
        let client = reqwest::Client::new();

        let bots = client.get(format!("{}/api/bots", base)).send().await.unwrap();
        assert_eq!(bots.status(), StatusCode::NOT_FOUND.as_u16());

        let trigger = client
            .post(format!("{}/api/scraper/trigger?full=true", base))
            .send()
            .await
            .unwrap();
        assert_eq!(trigger.status(), StatusCode::CONFLICT.as_u16());
    }

    #[tokio::test]
    async fn test_thread_rename_and_delete() {
        let (_dir, base) = serve_test_app(Arc::new(ScriptedModel::default())).await;
        let client = reqwest::Client::new();

        let created: Value = client
            .post(format!("{}/api/threads", base))
            .json(&json!({ "user_id": "u1", "title": "Fees" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let thread_id = created["thread_id"].as_str().unwrap().to_string();

        let wrong_user = client
            .put(format!("{}/api/threads/{}", base, thread_id))
            .json(&json!({ "user_id": "u2", "title": "Mine" }))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_user.status(), StatusCode::NOT_FOUND.as_u16());

        let renamed = client
            .put(format!("{}/api/threads/{}", base, thread_id))
            .json(&json!({ "user_id": "u1", "title": "Fee questions" }))
            .send()
            .await
            .unwrap();
        assert!(renamed.status().is_success());

        let deleted = client
            .delete(format!("{}/api/threads/{}?user_id=u1", base, thread_id))
            .send()
            .await
            .unwrap();
        assert!(deleted.status().is_success());

        let again = client
            .delete(format!("{}/api/threads/{}?user_id=u1", base, thread_id))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND.as_u16());
    }
}
