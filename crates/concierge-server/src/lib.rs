use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use concierge_config::Config;
use concierge_contracts::{
    AssistantRequest, AutonomySnapshot, ConversationState, Direction, PrivacyRules, RequestStatus,
    SystemConfig, ToolRun,
};
use concierge_kernel::autonomy::snapshot;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub mod audit;
pub mod calendar;
pub mod contacts;
pub mod conversation;
pub mod habits;
pub mod llm;
pub mod locks;
pub mod memory;
pub mod messaging;
pub mod proactive;
pub mod requests;
pub mod scheduler;
pub mod store;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

use audit::{AuditJsonl, AuditRecord};
use calendar::{build_calendar, CalendarTool};
use contacts::upsert_contact;
use llm::{build_llm, Planner, TextLlm};
use locks::ChatLocks;
use messaging::{build_transport, MessagingTransport};
use requests::ScanContext;
use store::StoreBackend;
use webhook::extract_message_fields;

const DEFAULT_REQUEST_LIMIT: usize = 50;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let collaborators = Collaborators::from_config(&cfg)?;
    let state = AppState::new(cfg, collaborators).await?;
    if state.cfg.scheduler.enabled {
        scheduler::spawn(state.clone());
        tracing::info!(
            tick_interval_secs = state.cfg.scheduler.tick_interval_secs,
            "proactive scheduler started"
        );
    }
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "concierge listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let collaborators = Collaborators::from_config(&cfg)?;
    build_app_with(cfg, collaborators).await
}

/// Same as `build_app` with caller-supplied collaborators.
pub async fn build_app_with(cfg: Config, collaborators: Collaborators) -> Result<Router, String> {
    Ok(router(AppState::new(cfg, collaborators).await?))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/webhooks/waha", post(waha_webhook))
        .route("/v1/proactive/tick", post(proactive_tick))
        .route("/v1/proactive/digest", post(proactive_digest))
        .route("/v1/requests", get(list_requests))
        .route("/v1/requests/{id}/dismiss", post(dismiss_request))
        .route("/v1/conversations/{chat_id}", get(conversation_state))
        .with_state(state)
}

/// The outside world the assistant talks to.
pub struct Collaborators {
    pub calendar: Arc<dyn CalendarTool>,
    pub messaging: Arc<dyn MessagingTransport>,
    pub planner: Arc<dyn Planner>,
    pub text_llm: Arc<dyn TextLlm>,
}

impl Collaborators {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let llm = build_llm(cfg)?;
        Ok(Self {
            calendar: build_calendar(cfg)?,
            messaging: build_transport(cfg)?,
            planner: llm.planner,
            text_llm: llm.text,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    cfg: Config,
    tz: Tz,
    defaults: SystemConfig,
    privacy: PrivacyRules,
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
    calendar: Arc<dyn CalendarTool>,
    messaging: Arc<dyn MessagingTransport>,
    planner: Arc<dyn Planner>,
    text_llm: Arc<dyn TextLlm>,
    locks: ChatLocks,
    tick_guard: Arc<Mutex<()>>,
    digest_guard: Arc<Mutex<()>>,
}

impl AppState {
    pub async fn new(cfg: Config, collaborators: Collaborators) -> Result<Self, String> {
        let tz = cfg.timezone().map_err(|e| e.to_string())?;
        let defaults = cfg.system_defaults().map_err(|e| e.to_string())?;
        let mut store = StoreBackend::open(&cfg.store.kind, cfg.store.sqlite_path.as_deref())?;
        store.system_config(&defaults)?;
        Ok(Self {
            audit: Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path).await?),
            store: Arc::new(Mutex::new(store)),
            tz,
            defaults,
            privacy: PrivacyRules::default(),
            calendar: collaborators.calendar,
            messaging: collaborators.messaging,
            planner: collaborators.planner,
            text_llm: collaborators.text_llm,
            locks: ChatLocks::default(),
            tick_guard: Arc::new(Mutex::new(())),
            digest_guard: Arc::new(Mutex::new(())),
            cfg,
        })
    }

    /// Runs `f` under the store lock. Never await while holding it.
    pub(crate) async fn with_store<T>(
        &self,
        f: impl FnOnce(&mut StoreBackend) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut store = self.store.lock().await;
        f(&mut store)
    }

    pub(crate) fn user_chat_id(&self) -> Option<&str> {
        self.cfg
            .assistant
            .user_chat_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    pub(crate) async fn system_config(&self) -> Result<SystemConfig, String> {
        self.with_store(|s| s.system_config(&self.defaults)).await
    }

    pub(crate) async fn autonomy_snapshot(&self, now: DateTime<Utc>) -> Result<AutonomySnapshot, String> {
        self.with_store(|s| Ok(snapshot(&s.autonomy_rules()?, now))).await
    }

    pub(crate) async fn scan_context(&self) -> ScanContext<'_> {
        ScanContext {
            calendar_has_token: self.calendar.has_token().await,
            user_chat_configured: self.user_chat_id().is_some(),
            public_base_url: &self.cfg.assistant.public_base_url,
        }
    }

    /// Sends through the transport and records the outbound message either way.
    /// Returns whether the transport accepted it.
    pub(crate) async fn send_and_store(
        &self,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let mut raw = json!({"request": {"chatId": chat_id, "text": text}});
        let delivered = match self.messaging.send_text(chat_id, text).await {
            Ok(response) => {
                raw["response"] = response;
                true
            }
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "outbound message not delivered");
                raw["response"] = Value::Null;
                raw["error"] = json!(e.to_string());
                false
            }
        };
        self.with_store(|s| {
            s.add_message(Direction::Outbound, chat_id, None, text, raw, now)
                .map(|_| ())
        })
        .await?;
        Ok(delivered)
    }

    pub(crate) async fn record_tool_run(&self, run: ToolRun) -> Result<(), String> {
        let record = AuditRecord::tool_run(&run)?;
        self.with_store(|s| s.add_tool_run(&run)).await?;
        self.audit.append(record).await
    }

    /// One inbound webhook payload: persisted, then routed to the user or contact flow.
    pub async fn process_inbound(&self, payload: Value, now: DateTime<Utc>) -> Result<(), String> {
        let fields = extract_message_fields(&payload);
        let chat_id = fields.chat_id.clone().unwrap_or_else(|| "unknown".to_string());
        let body = fields.body.clone().unwrap_or_default();
        let display_name = fields.display_name.as_deref();
        tracing::info!(chat_id = %chat_id, chars = body.chars().count(), "webhook received");
        self.with_store(|s| {
            s.add_message(
                Direction::Inbound,
                &chat_id,
                fields.sender_id.as_deref(),
                &body,
                payload,
                now,
            )?;
            upsert_contact(s, &chat_id, display_name).map(|_| ())
        })
        .await?;

        let from_user = self.user_chat_id().map(|id| id == chat_id).unwrap_or(true);
        if !from_user {
            return self
                .handle_contact_message(&chat_id, &body, display_name, now)
                .await;
        }

        let reply = self.handle_message(&chat_id, &body, now).await?;
        let state = self.clone();
        tokio::spawn(async move {
            if let Err(e) = state.send_and_store(&chat_id, &reply, now).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "reply not stored");
            }
        });
        Ok(())
    }
}

fn error_body(status: StatusCode, code: &str, message: String) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
}

fn internal(message: String) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %message, "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn waha_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    state
        .process_inbound(payload, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Debug, Default, Deserialize)]
struct ClockInput {
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

/// An empty body means "now"; otherwise `{"now": "<rfc3339>"}`.
fn requested_now(body: &Bytes) -> Result<DateTime<Utc>, (StatusCode, Json<Value>)> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Utc::now());
    }
    let input: ClockInput = serde_json::from_slice(body).map_err(|e| {
        error_body(StatusCode::BAD_REQUEST, "validation_error", format!("invalid body: {e}"))
    })?;
    Ok(input.now.unwrap_or_else(Utc::now))
}

async fn proactive_tick(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let now = requested_now(&body)?;
    let _guard = state.tick_guard.lock().await;
    let sent = state.tick(now).await.map_err(internal)?;
    Ok(Json(json!({"sent": sent})))
}

async fn proactive_digest(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let now = requested_now(&body)?;
    let sent = state.daily_digest(now).await.map_err(internal)?;
    Ok(Json(json!({"sent": sent})))
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<Vec<AssistantRequest>>, (StatusCode, Json<Value>)> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(RequestStatus::parse(raw).ok_or_else(|| {
            error_body(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("unknown status: {raw}"),
            )
        })?),
        None => None,
    };
    let mut requests = state.with_store(|s| s.requests()).await.map_err(internal)?;
    requests.retain(|r| status.map(|st| r.status == st).unwrap_or(true));
    requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    requests.truncate(query.limit.unwrap_or(DEFAULT_REQUEST_LIMIT));
    Ok(Json(requests))
}

async fn dismiss_request(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<AssistantRequest>, (StatusCode, Json<Value>)> {
    let now = Utc::now();
    let dismissed = state
        .with_store(|s| {
            let Some(mut request) = s.request(id)? else {
                return Ok(None);
            };
            requests::dismiss(s, &mut request, now)?;
            Ok(Some(request))
        })
        .await
        .map_err(internal)?;
    dismissed.map(Json).ok_or_else(|| {
        error_body(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("request {id} not found"),
        )
    })
}

async fn conversation_state(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<ConversationState>, (StatusCode, Json<Value>)> {
    state
        .with_store(|s| s.state(&chat_id))
        .await
        .map(Json)
        .map_err(internal)
}
