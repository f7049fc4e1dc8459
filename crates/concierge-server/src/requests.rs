use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use concierge_contracts::{
    request_dedupe_key, AssistantRequest, AutonomyMode, Direction, RequestStatus, SystemConfig,
};
use concierge_kernel::autonomy::global_mode;
use concierge_kernel::local_day_bounds;
use concierge_kernel::requests::{
    detect_needs, mark_answered, mark_asked, mark_dismissed, merge_existing, new_request,
    should_ask, NeedAction, NeedsInputs, RequestSpec, DURATION_PROMPT_MARKER,
};
use concierge_kernel::text::{fold, has_calendar_intent};

use crate::memory::known_fact_keys;
use crate::store::StoreBackend;

const OPEN_REQUESTS_TRIED: usize = 5;

/// Facts about the deployment the needs detector cannot read from the store.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext<'a> {
    pub calendar_has_token: bool,
    pub user_chat_configured: bool,
    pub public_base_url: &'a str,
}

pub fn auth_needed_message(public_base_url: &str) -> String {
    format!(
        "Necesito autorizacion de Google Calendar. Abri {}/auth/google/start",
        public_base_url.trim_end_matches('/')
    )
}

fn log_transition(
    store: &mut StoreBackend,
    request: &AssistantRequest,
    event: &str,
    now: DateTime<Utc>,
) -> Result<(), String> {
    store.save_request(request)?;
    store.add_request_event(request.id, event, now)
}

pub fn create_or_reopen(
    store: &mut StoreBackend,
    spec: &RequestSpec,
    chat_id: &str,
    now: DateTime<Utc>,
) -> Result<AssistantRequest, String> {
    let dedupe_key = request_dedupe_key(spec.request_type, spec.key, chat_id);
    if let Some(mut existing) = store.request_by_dedupe(&dedupe_key)? {
        match merge_existing(&mut existing, spec, now) {
            Some(event) => log_transition(store, &existing, event, now)?,
            None => store.save_request(&existing)?,
        }
        return Ok(existing);
    }
    let id = store.next_request_id()?;
    let request = new_request(spec, chat_id, id, now);
    log_transition(store, &request, "created", now)?;
    Ok(request)
}

pub fn answer(store: &mut StoreBackend, request: &mut AssistantRequest, now: DateTime<Utc>) -> Result<(), String> {
    let event = mark_answered(request, now);
    log_transition(store, request, event, now)
}

pub fn dismiss(store: &mut StoreBackend, request: &mut AssistantRequest, now: DateTime<Utc>) -> Result<(), String> {
    let event = mark_dismissed(request, now);
    log_transition(store, request, event, now)
}

fn close_need(
    store: &mut StoreBackend,
    request_type: &str,
    key: &str,
    chat_id: &str,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let dedupe_key = request_dedupe_key(request_type, key, chat_id);
    if let Some(mut request) = store.request_by_dedupe(&dedupe_key)? {
        if matches!(request.status, RequestStatus::Open | RequestStatus::Asked) {
            answer(store, &mut request, now)?;
        }
    }
    Ok(())
}

fn duration_prompts(store: &StoreBackend, chat_id: &str) -> Result<usize, String> {
    Ok(store
        .messages()?
        .iter()
        .filter(|m| {
            m.direction == Direction::Outbound
                && m.chat_id == chat_id
                && m.body.contains(DURATION_PROMPT_MARKER)
        })
        .count())
}

/// Runs the needs detector for `chat_id` and applies every action it yields.
pub fn scan(
    store: &mut StoreBackend,
    chat_id: &str,
    text: &str,
    calendar_hint: bool,
    ctx: ScanContext<'_>,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let folded = fold(text);
    let known_facts = known_fact_keys(&store.facts()?);
    let inputs = NeedsInputs {
        folded_text: &folded,
        calendar_intent: calendar_hint || has_calendar_intent(&folded),
        calendar_has_token: ctx.calendar_has_token,
        known_facts: &known_facts,
        duration_prompts: duration_prompts(store, chat_id)?,
        user_chat_configured: ctx.user_chat_configured,
        public_base_url: ctx.public_base_url,
    };
    for action in detect_needs(&inputs) {
        match action {
            NeedAction::Ensure(spec) => {
                create_or_reopen(store, &spec, chat_id, now)?;
            }
            NeedAction::Close { request_type, key } => {
                close_need(store, request_type, key, chat_id, now)?;
            }
        }
    }
    Ok(())
}

pub fn request_for(
    store: &StoreBackend,
    (request_type, key): (&str, &str),
    chat_id: &str,
) -> Result<Option<AssistantRequest>, String> {
    store.request_by_dedupe(&request_dedupe_key(request_type, key, chat_id))
}

/// The request most recently asked in this chat and still waiting for an answer.
pub fn active_request(store: &StoreBackend, chat_id: &str) -> Result<Option<AssistantRequest>, String> {
    Ok(store
        .requests()?
        .into_iter()
        .filter(|r| r.status == RequestStatus::Asked && r.context.chat_id == chat_id)
        .max_by_key(|r| (r.asked_at, r.id)))
}

pub fn open_requests(store: &StoreBackend, chat_id: &str) -> Result<Vec<AssistantRequest>, String> {
    let mut open: Vec<AssistantRequest> = store
        .requests()?
        .into_iter()
        .filter(|r| r.status == RequestStatus::Open && r.context.chat_id == chat_id)
        .collect();
    open.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    open.truncate(OPEN_REQUESTS_TRIED);
    Ok(open)
}

pub fn asked_today(store: &StoreBackend, now: DateTime<Utc>, tz: Tz) -> Result<usize, String> {
    let (start, end) = local_day_bounds(now, tz);
    Ok(store
        .requests()?
        .iter()
        .filter(|r| r.asked_at.map(|at| at >= start && at < end).unwrap_or(false))
        .count())
}

/// Marks the request asked and returns its prompt when the asking policy allows it right now.
pub fn ask_if_allowed(
    store: &mut StoreBackend,
    request: Option<AssistantRequest>,
    config: &SystemConfig,
    global_mode: AutonomyMode,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<String>, String> {
    let Some(mut request) = request else {
        return Ok(None);
    };
    let asked = asked_today(store, now, tz)?;
    let local_time = concierge_kernel::local_time(now, tz);
    if !should_ask(&request, local_time, global_mode, config, asked) {
        return Ok(None);
    }
    let event = mark_asked(&mut request, now);
    log_transition(store, &request, event, now)?;
    tracing::info!(request_id = request.id, key = %request.key, "assistant request asked");
    Ok(Some(request.prompt))
}

/// `ask_if_allowed` against the persisted system config and the live global mode.
pub fn ask_with_policy(
    store: &mut StoreBackend,
    request: Option<AssistantRequest>,
    defaults: &SystemConfig,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<String>, String> {
    let config = store.system_config(defaults)?;
    let global = global_mode(&store.autonomy_rules()?, now).mode;
    ask_if_allowed(store, request, &config, global, now, tz)
}
