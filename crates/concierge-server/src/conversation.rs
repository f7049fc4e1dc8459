use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use concierge_contracts::{
    AutonomyMode, AutonomyScope, CalendarDraft, CalendarEvent, ConversationState, DecisionSource,
    MessageDraft, PendingAction, PendingQuestion, PlannedAction, Requester, RiskLevel,
    ScheduleDraft, SystemConfig, ToolRun, ToolRunStatus,
};
use concierge_kernel::autonomy::{
    autonomy_status, global_mode, proactive_status, snapshot, until_from_hours,
};
use concierge_kernel::requests::{interpret_answer, AnswerOutcome, CALENDAR_AUTH, DEFAULT_BARBERSHOP};
use concierge_kernel::supervisor::{
    input_datetime, input_str, planner_system_prompt, Supervisor, CALENDAR_CREATE_EVENT,
    CALENDAR_IS_FREE, CALENDAR_LIST_EVENTS, MESSAGE_SEND,
};
use concierge_kernel::text::{
    extract_tags, fold, is_cancel, is_confirm, is_dismiss, is_memory_question,
    mentions_usual_place, normalize, parse_autonomy_scope, parse_choice, parse_contact_command,
    parse_datetime, parse_int, parse_list_request, parse_schedule_request, should_skip_request_prompt,
    should_use_llm, tag_label,
};
use concierge_kernel::{format_local, format_local_hm, local_date, local_datetime};
use serde_json::{json, Value};

use crate::calendar::CalendarError;
use crate::contacts::handle_contact_command;
use crate::habits::handle_habit_command;
use crate::memory::{build_context, fact_for_tags, memory_answer, retrieve, MEMORY_ANSWER_CHUNKS};
use crate::requests::{
    active_request, answer, ask_with_policy, dismiss, open_requests, request_for, scan,
};
use crate::store::StoreBackend;
use crate::AppState;

pub const RECEIVED: &str = "Recibi tu mensaje";
const SAVED: &str = "Listo, lo guarde.";
const ASK_START: &str = "Para que dia y hora? (ej: manana 16)";
const ASK_DURATION: &str = "Cuanto dura? 30/60/90";
const ASK_HOURS: &str = "Por cuantas horas?";
const PLAN_PENDING: &str = "Tenes un plan pendiente. Escribi confirmo o cancelar.";
const CALENDAR_NOT_CONFIGURED: &str = "Falta configurar Google Calendar.";
const CALENDAR_UNAVAILABLE: &str = "No pude consultar el calendario. Proba de nuevo.";
const ALTERNATIVE_OFFSETS_MINUTES: [i64; 4] = [30, 60, 90, 120];
const MAX_ALTERNATIVES: usize = 2;
const DEFAULT_DURATION_MINUTES: i64 = 30;

fn with_location(reply: &str, location: Option<&str>) -> String {
    match location {
        Some(loc) => format!("{reply} Voy a usar {loc}."),
        None => reply.to_string(),
    }
}

pub fn plan_text(draft: &CalendarDraft, tz: chrono_tz::Tz) -> String {
    let minutes = (draft.end - draft.start).num_minutes();
    let location = draft
        .location
        .as_deref()
        .map(|loc| format!(" en {loc}"))
        .unwrap_or_default();
    format!(
        "Voy a agendar '{}' el {}{location} por {minutes} min. Confirmas? (si/confirmo)",
        draft.title,
        format_local(draft.start, tz)
    )
}

fn event_line(event: &CalendarEvent, tz: chrono_tz::Tz) -> String {
    let title = if event.title.trim().is_empty() {
        "Sin titulo"
    } else {
        event.title.as_str()
    };
    if event.all_day {
        format!("Todo el dia: {title}")
    } else {
        format!("{} {title}", format_local_hm(event.start, tz))
    }
}

fn set_intent(state: &mut ConversationState, intent: &str) {
    state.last_intent = Some(intent.to_string());
}

fn add_rule(
    store: &mut StoreBackend,
    scope: AutonomyScope,
    mode: AutonomyMode,
    hours: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(), String> {
    store
        .add_autonomy_rule(scope, mode, until_from_hours(now, hours), now)
        .map(|_| ())
}

fn focus_reply(hours: i64) -> String {
    format!("Modo foco activado por {hours} horas.")
}

fn autonomy_on_reply(scope: AutonomyScope, hours: i64) -> String {
    format!("Autonomia activada para {} por {hours} horas.", scope.as_str())
}

/// Autonomy and proactive-mode commands. `None` when the text is none of them.
pub fn focus_command(
    store: &mut StoreBackend,
    state: &mut ConversationState,
    folded: &str,
    defaults: &SystemConfig,
    now: DateTime<Utc>,
) -> Result<Option<String>, String> {
    let (reply, intent) = if folded.starts_with("autonomia on") {
        let Some(scope) = parse_autonomy_scope(folded) else {
            return Ok(Some("Para que scope? calendario/mensajes/tareas".to_string()));
        };
        let Some(hours) = parse_int(folded) else {
            state.pending_question = Some(PendingQuestion::AutonomyHours { scope });
            set_intent(state, "autonomy_on");
            return Ok(Some(ASK_HOURS.to_string()));
        };
        add_rule(store, scope, AutonomyMode::On, Some(hours), now)?;
        (autonomy_on_reply(scope, hours), "autonomy_on")
    } else if folded.starts_with("autonomia off") {
        let reply = match parse_autonomy_scope(folded) {
            Some(scope) => {
                add_rule(store, scope, AutonomyMode::Off, None, now)?;
                format!("Autonomia desactivada para {}.", scope.as_str())
            }
            None => {
                for scope in AutonomyScope::ACTION_SCOPES {
                    add_rule(store, scope, AutonomyMode::Off, None, now)?;
                }
                "Autonomia desactivada para todos los scopes.".to_string()
            }
        };
        (reply, "autonomy_off")
    } else if folded.contains("status autonomia") {
        (autonomy_status(&store.autonomy_rules()?, now), "autonomy_status")
    } else if folded.contains("status proactivo") {
        let config = store.system_config(defaults)?;
        let global = global_mode(&store.autonomy_rules()?, now);
        (proactive_status(&global, config.daily_limit, now), "proactive_status")
    } else if folded.starts_with("modo foco")
        || (folded.starts_with("no me jodas") && !folded.contains("habitos"))
    {
        let Some(hours) = parse_int(folded) else {
            state.pending_question = Some(PendingQuestion::FocusHours);
            set_intent(state, "focus_mode");
            return Ok(Some(ASK_HOURS.to_string()));
        };
        add_rule(store, AutonomyScope::Global, AutonomyMode::Focus, Some(hours), now)?;
        (focus_reply(hours), "focus_mode")
    } else if folded.contains("solo urgencias") {
        add_rule(store, AutonomyScope::Global, AutonomyMode::UrgenciesOnly, None, now)?;
        ("Listo, solo urgencias.".to_string(), "urgencies_only")
    } else if folded == "normal" || folded == "modo normal" {
        add_rule(store, AutonomyScope::Global, AutonomyMode::Normal, None, now)?;
        ("Modo normal activado.".to_string(), "normal")
    } else {
        return Ok(None);
    };
    state.clear_pending();
    set_intent(state, intent);
    Ok(Some(reply))
}

/// Builds the calendar draft an LLM action describes, when its times parse.
fn draft_from_action(action: &PlannedAction) -> Option<CalendarDraft> {
    Some(CalendarDraft {
        title: input_str(&action.input, "title").unwrap_or("Sin titulo").to_string(),
        start: input_datetime(&action.input, "start")?,
        end: input_datetime(&action.input, "end")?,
        location: input_str(&action.input, "location").map(str::to_string),
        notes: input_str(&action.input, "notes").map(str::to_string),
    })
}

impl AppState {
    /// Runs one user message through the conversation state machine and returns the reply.
    pub(crate) async fn handle_message(
        &self,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        let Some(text) = normalize(Some(text)) else {
            return Ok(RECEIVED.to_string());
        };
        let folded = fold(&text);
        let _turn = self.locks.acquire(chat_id).await;
        let mut state = self.with_store(|s| s.state(chat_id)).await?;
        let before = state.clone();
        let reply = self.respond(&mut state, chat_id, &text, &folded, now).await?;
        if state != before {
            self.with_store(|s| s.save_state(&state)).await?;
        }
        tracing::debug!(chat_id, intent = ?state.last_intent, "message handled");
        Ok(reply)
    }

    async fn respond(
        &self,
        state: &mut ConversationState,
        chat_id: &str,
        text: &str,
        folded: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        if is_cancel(folded) {
            state.clear_pending();
            set_intent(state, "cancel");
            return Ok("Listo, cancelado.".to_string());
        }
        if is_confirm(folded) {
            if let Some(action) = state.pending_action.clone() {
                return self.confirm_pending(state, action, chat_id, now).await;
            }
        }
        if let Some(reply) = self.answer_active_request(chat_id, text, folded, now).await? {
            return Ok(reply);
        }

        let (tz, defaults) = (self.tz, &self.defaults);
        let command = self
            .with_store(|s| {
                if let Some(reply) = focus_command(s, state, folded, defaults, now)? {
                    return Ok(Some(reply));
                }
                if let Some(command) = parse_contact_command(folded) {
                    return handle_contact_command(s, command).map(Some);
                }
                let config = s.system_config(defaults)?;
                handle_habit_command(s, folded, text, &config, now, tz)
            })
            .await?;
        if let Some(reply) = command {
            return Ok(reply);
        }

        if let Some(question) = state.pending_question.clone() {
            return self.resolve_pending(state, question, chat_id, text, now).await;
        }
        if state.pending_action.is_some() {
            return Ok(PLAN_PENDING.to_string());
        }

        let today = local_date(now, self.tz);
        if let Some(day) = parse_list_request(text, today) {
            if !self.calendar.has_token().await {
                set_intent(state, "needs_auth");
                return self.calendar_auth_needed(chat_id, now).await;
            }
            return self.list_day(chat_id, day, now).await;
        }

        let mut schedule = parse_schedule_request(text, today, self.tz);
        if let Some(reply) = self
            .memory_request(chat_id, text, folded, &mut schedule, now)
            .await?
        {
            return Ok(reply);
        }
        if let Some(request) = schedule {
            let complete = request.start.is_some() && request.duration_minutes.is_some();
            if complete && !self.calendar.has_token().await {
                set_intent(state, "needs_auth");
                return self.calendar_auth_needed(chat_id, now).await;
            }
            return self.schedule(state, request, chat_id, now).await;
        }

        if should_use_llm(text) {
            if let Some(reply) = self.plan_with_llm(state, chat_id, text, now).await? {
                return Ok(reply);
            }
        }
        if let Some(prompt) = self.maybe_ask(state, chat_id, text, now).await? {
            return Ok(prompt);
        }
        Ok(RECEIVED.to_string())
    }

    fn auth_message(&self) -> String {
        crate::requests::auth_needed_message(&self.cfg.assistant.public_base_url)
    }

    /// Asks for calendar authorization through the request lifecycle, or falls back to the plain link.
    async fn calendar_auth_needed(&self, chat_id: &str, now: DateTime<Utc>) -> Result<String, String> {
        let ctx = self.scan_context().await;
        let (tz, defaults) = (self.tz, &self.defaults);
        let prompt = self
            .with_store(|s| {
                scan(s, chat_id, "calendario", true, ctx, now)?;
                let request = request_for(s, CALENDAR_AUTH, chat_id)?;
                ask_with_policy(s, request, defaults, now, tz)
            })
            .await?;
        Ok(prompt.unwrap_or_else(|| self.auth_message()))
    }

    async fn answer_active_request(
        &self,
        chat_id: &str,
        text: &str,
        folded: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        let auth_message = self.auth_message();
        self.with_store(|s| {
            let Some(mut request) = active_request(s, chat_id)? else {
                return Ok(None);
            };
            let reply = match interpret_answer(&request, text, is_dismiss(folded), chat_id) {
                AnswerOutcome::Dismiss => {
                    dismiss(s, &mut request, now)?;
                    "Listo, lo dejo para mas tarde.".to_string()
                }
                AnswerOutcome::Authorize => {
                    answer(s, &mut request, now)?;
                    auth_message
                }
                AnswerOutcome::Learned(fact) => {
                    s.upsert_fact(fact.key, &fact.value, fact.confidence, now)?;
                    answer(s, &mut request, now)?;
                    SAVED.to_string()
                }
                AnswerOutcome::Answered => {
                    answer(s, &mut request, now)?;
                    SAVED.to_string()
                }
                AnswerOutcome::Invalid(prompt) => prompt.to_string(),
            };
            Ok(Some(reply))
        })
        .await
    }

    async fn confirm_pending(
        &self,
        state: &mut ConversationState,
        action: PendingAction,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        match action {
            PendingAction::MessageSend(draft) => {
                let sent = match draft.thread_id {
                    Some(_) => {
                        self.send_contact_reply(draft.thread_id, &draft.chat_id, &draft.text, now)
                            .await?
                    }
                    None => self.send_and_store(&draft.chat_id, &draft.text, now).await?,
                };
                self.record_tool_run(ToolRun {
                    tool_name: MESSAGE_SEND.to_string(),
                    status: if sent { ToolRunStatus::Success } else { ToolRunStatus::Error },
                    input: json!({"chat_id": draft.chat_id, "text": draft.text}),
                    output: json!({"sent": sent}),
                    decision_source: DecisionSource::User,
                    requested_by: Requester::User,
                    risk_level: RiskLevel::Medium,
                    autonomy_snapshot: self.autonomy_snapshot(now).await?,
                    created_at: now,
                })
                .await?;
                state.clear_pending();
                set_intent(state, "message_send");
                Ok(if sent {
                    "Listo, mensaje enviado.".to_string()
                } else {
                    "No pude enviar el mensaje.".to_string()
                })
            }
            PendingAction::CalendarCreate(draft) => {
                if !self.calendar.has_token().await {
                    set_intent(state, "needs_auth");
                    return self.calendar_auth_needed(chat_id, now).await;
                }
                let created = match self.calendar.create_event(&draft).await {
                    Ok(created) => created,
                    Err(CalendarError::NotAuthorized(_)) => {
                        set_intent(state, "needs_auth");
                        return self.calendar_auth_needed(chat_id, now).await;
                    }
                    Err(CalendarError::Config(_)) => {
                        set_intent(state, "config_error");
                        return Ok(CALENDAR_NOT_CONFIGURED.to_string());
                    }
                    Err(e) => {
                        tracing::warn!(chat_id, error = %e, "calendar create failed");
                        return Ok(CALENDAR_UNAVAILABLE.to_string());
                    }
                };
                self.record_tool_run(ToolRun {
                    tool_name: CALENDAR_CREATE_EVENT.to_string(),
                    status: ToolRunStatus::Success,
                    input: json!({
                        "title": draft.title,
                        "start": draft.start,
                        "end": draft.end,
                        "location": draft.location,
                        "notes": draft.notes,
                    }),
                    output: json!({"event_id": created.event_id, "link": created.link}),
                    decision_source: DecisionSource::User,
                    requested_by: Requester::User,
                    risk_level: RiskLevel::Medium,
                    autonomy_snapshot: self.autonomy_snapshot(now).await?,
                    created_at: now,
                })
                .await?;
                state.clear_pending();
                set_intent(state, "calendar_execute");
                Ok(match created.link {
                    Some(link) => format!("Listo, evento creado. {link}"),
                    None => "Listo, evento creado.".to_string(),
                })
            }
        }
    }

    async fn resolve_pending(
        &self,
        state: &mut ConversationState,
        question: PendingQuestion,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        match question {
            PendingQuestion::DurationMinutes { mut request } => {
                let Some(duration) = parse_int(text) else {
                    return Ok("Indica la duracion en minutos (30/60/90).".to_string());
                };
                state.pending_question = None;
                if request.start.is_none() {
                    return Ok("Para que dia y hora?".to_string());
                }
                request.duration_minutes = Some(duration);
                self.schedule(state, request, chat_id, now).await
            }
            PendingQuestion::StartTime { mut request } => {
                let today = local_date(now, self.tz);
                let Some(start) = parse_datetime(text, today, self.tz) else {
                    return Ok(ASK_START.to_string());
                };
                request.start = Some(start);
                if request.duration_minutes.is_some() {
                    state.pending_question = None;
                    return self.schedule(state, request, chat_id, now).await;
                }
                let location = request.location.clone();
                state.pending_question = Some(PendingQuestion::DurationMinutes { request });
                set_intent(state, "calendar_schedule");
                Ok(with_location(ASK_DURATION, location.as_deref()))
            }
            PendingQuestion::ConflictChoice { request, options } => {
                let Some(start) = parse_choice(text).and_then(|i| options.get(i).copied()) else {
                    return Ok("Responde 1 o 2.".to_string());
                };
                let duration = request.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES);
                let draft = CalendarDraft {
                    title: request.title,
                    start,
                    end: start + Duration::minutes(duration),
                    location: request.location,
                    notes: request.notes,
                };
                let reply = plan_text(&draft, self.tz);
                state.pending_action = Some(PendingAction::CalendarCreate(draft));
                state.pending_question = None;
                set_intent(state, "calendar_schedule");
                Ok(reply)
            }
            PendingQuestion::FocusHours => {
                let Some(hours) = parse_int(text) else {
                    return Ok(ASK_HOURS.to_string());
                };
                self.with_store(|s| {
                    add_rule(s, AutonomyScope::Global, AutonomyMode::Focus, Some(hours), now)
                })
                .await?;
                state.clear_pending();
                set_intent(state, "focus_mode");
                Ok(focus_reply(hours))
            }
            PendingQuestion::AutonomyHours { scope } => {
                let Some(hours) = parse_int(text) else {
                    return Ok(ASK_HOURS.to_string());
                };
                self.with_store(|s| add_rule(s, scope, AutonomyMode::On, Some(hours), now))
                    .await?;
                state.clear_pending();
                set_intent(state, "autonomy_on");
                Ok(autonomy_on_reply(scope, hours))
            }
        }
    }

    /// Asks for whatever the draft is missing, offers alternatives on conflict, or parks the plan.
    async fn schedule(
        &self,
        state: &mut ConversationState,
        request: ScheduleDraft,
        chat_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        let Some(start) = request.start else {
            let reply = with_location(ASK_START, request.location.as_deref());
            state.pending_question = Some(PendingQuestion::StartTime { request });
            set_intent(state, "calendar_schedule");
            return Ok(reply);
        };
        let Some(duration) = request.duration_minutes else {
            let reply = with_location(ASK_DURATION, request.location.as_deref());
            state.pending_question = Some(PendingQuestion::DurationMinutes { request });
            set_intent(state, "calendar_schedule");
            return Ok(reply);
        };
        if !self.calendar.has_token().await {
            set_intent(state, "needs_auth");
            return self.calendar_auth_needed(chat_id, now).await;
        }

        let end = start + Duration::minutes(duration);
        let free = match self.free_alternatives(start, duration).await {
            Ok(free) => free,
            Err(CalendarError::NotAuthorized(_)) => {
                set_intent(state, "needs_auth");
                return self.calendar_auth_needed(chat_id, now).await;
            }
            Err(CalendarError::Config(_)) => {
                set_intent(state, "config_error");
                return Ok(CALENDAR_NOT_CONFIGURED.to_string());
            }
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "calendar availability check failed");
                return Ok(CALENDAR_UNAVAILABLE.to_string());
            }
        };
        if let Some(options) = free {
            if options.is_empty() {
                return Ok("No hay disponibilidad en ese horario. Proba otro.".to_string());
            }
            let mut parts = vec!["Hay conflicto. Opciones:".to_string()];
            parts.extend(
                options
                    .iter()
                    .enumerate()
                    .map(|(i, option)| format!("{}) {}", i + 1, format_local(*option, self.tz))),
            );
            parts.push("Responde 1 o 2.".to_string());
            state.pending_question = Some(PendingQuestion::ConflictChoice { request, options });
            set_intent(state, "calendar_schedule");
            return Ok(parts.join(" "));
        }

        let draft = CalendarDraft {
            title: request.title,
            start,
            end,
            location: request.location,
            notes: request.notes,
        };
        let reply = plan_text(&draft, self.tz);
        state.pending_action = Some(PendingAction::CalendarCreate(draft));
        state.pending_question = None;
        set_intent(state, "calendar_schedule");
        Ok(reply)
    }

    /// `None` when the requested slot is free, otherwise the first free shifted starts.
    async fn free_alternatives(
        &self,
        start: DateTime<Utc>,
        duration: i64,
    ) -> Result<Option<Vec<DateTime<Utc>>>, CalendarError> {
        let length = Duration::minutes(duration);
        if self.calendar.is_free(start, start + length).await? {
            return Ok(None);
        }
        let mut options = Vec::new();
        for offset in ALTERNATIVE_OFFSETS_MINUTES {
            let candidate = start + Duration::minutes(offset);
            if self.calendar.is_free(candidate, candidate + length).await? {
                options.push(candidate);
            }
            if options.len() >= MAX_ALTERNATIVES {
                break;
            }
        }
        Ok(Some(options))
    }

    async fn list_day(&self, chat_id: &str, day: NaiveDate, now: DateTime<Utc>) -> Result<String, String> {
        let from = local_datetime(self.tz, day, NaiveTime::MIN);
        let to = local_datetime(self.tz, day + Duration::days(1), NaiveTime::MIN);
        let events = match self.calendar.list_events(from, to).await {
            Ok(events) => events,
            Err(CalendarError::NotAuthorized(_)) => return self.calendar_auth_needed(chat_id, now).await,
            Err(CalendarError::Config(_)) => return Ok(CALENDAR_NOT_CONFIGURED.to_string()),
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "calendar list failed");
                return Ok(CALENDAR_UNAVAILABLE.to_string());
            }
        };
        if events.is_empty() {
            return Ok(format!("No tenes eventos para {day}."));
        }
        let mut parts = vec![format!("Eventos para {day}:")];
        parts.extend(events.iter().map(|e| event_line(e, self.tz)));
        Ok(parts.join(" "))
    }

    /// "El lugar de siempre" lookups and questions about what was said before.
    ///
    /// A known usual place fills the location of a pending schedule draft instead of replying.
    async fn memory_request(
        &self,
        chat_id: &str,
        text: &str,
        folded: &str,
        schedule: &mut Option<ScheduleDraft>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        let tags = extract_tags(text);
        if tags.is_empty() {
            return Ok(None);
        }
        if mentions_usual_place(folded) {
            let facts = self.with_store(|s| s.facts()).await?;
            if let Some(fact) = fact_for_tags(&facts, &tags) {
                if let Some(draft) = schedule.as_mut() {
                    draft.location = Some(fact.value.clone());
                    return Ok(None);
                }
                return Ok(Some(format!(
                    "Tengo registrado que el lugar de siempre es {}. Queres que lo use?",
                    fact.value
                )));
            }
            let ctx = self.scan_context().await;
            let (tz, defaults) = (self.tz, &self.defaults);
            let prompt = self
                .with_store(|s| {
                    scan(s, chat_id, text, false, ctx, now)?;
                    let request = request_for(s, DEFAULT_BARBERSHOP, chat_id)?;
                    ask_with_policy(s, request, defaults, now, tz)
                })
                .await?;
            return Ok(Some(prompt.unwrap_or_else(|| {
                format!("Ok, cuando quieras decime el {} de siempre.", tag_label(&tags[0]))
            })));
        }
        if is_memory_question(folded) {
            let messages = self.with_store(|s| s.messages()).await?;
            let chunks = retrieve(&messages, text, &tags, Some(chat_id), MEMORY_ANSWER_CHUNKS);
            return Ok(Some(memory_answer(&chunks)));
        }
        Ok(None)
    }

    async fn plan_with_llm(
        &self,
        state: &mut ConversationState,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        let defaults = &self.defaults;
        let (config, facts, messages, contacts, rules) = self
            .with_store(|s| {
                Ok((
                    s.system_config(defaults)?,
                    s.facts()?,
                    s.messages()?,
                    s.contacts()?,
                    s.autonomy_rules()?,
                ))
            })
            .await?;
        let context = build_context(&facts, &messages, snapshot(&rules, now), chat_id, text);
        let output = self
            .planner
            .generate_structured(&config.llm, &planner_system_prompt(), text, &context.prompt)
            .await;
        set_intent(state, &output.intent);

        let decision = Supervisor::new(
            &context.autonomy_snapshot,
            context.evidence_keys.iter().cloned(),
            &contacts,
            &self.privacy,
            now,
        )
        .evaluate(&output);
        tracing::info!(chat_id, intent = %output.intent, reason = decision.reason, "planner output supervised");

        let Some(action) = decision.action else {
            return Ok(Some(decision.reply).filter(|r| !r.trim().is_empty()));
        };
        if decision.requires_confirmation {
            let pending = match action.tool.as_str() {
                CALENDAR_CREATE_EVENT => draft_from_action(&action).map(PendingAction::CalendarCreate),
                MESSAGE_SEND => {
                    let target = input_str(&action.input, "chat_id").unwrap_or_default().to_string();
                    let thread_id = self
                        .with_store(|s| Ok(s.active_thread(&target)?.map(|t| t.id)))
                        .await?;
                    Some(PendingAction::MessageSend(MessageDraft {
                        text: input_str(&action.input, "text").unwrap_or_default().to_string(),
                        chat_id: target,
                        thread_id,
                    }))
                }
                _ => None,
            };
            if let Some(pending) = pending {
                state.pending_action = Some(pending);
                set_intent(state, "llm_plan");
            }
            return Ok(Some(decision.reply));
        }

        let outcome = self.execute_tool(&action, now).await;
        let (status, output_json) = match &outcome {
            Ok(value) => (ToolRunStatus::Success, value.clone()),
            Err(e) => (ToolRunStatus::Error, json!({"error": e})),
        };
        self.record_tool_run(ToolRun {
            tool_name: action.tool.clone(),
            status,
            input: Value::Object(action.input.clone()),
            output: output_json,
            decision_source: DecisionSource::Supervisor,
            requested_by: Requester::Llm,
            risk_level: action.risk_level,
            autonomy_snapshot: context.autonomy_snapshot,
            created_at: now,
        })
        .await?;
        let reply = match outcome {
            Err(e) => {
                tracing::warn!(chat_id, tool = %action.tool, error = %e, "planned action failed");
                "No pude completar la accion.".to_string()
            }
            Ok(value) => match value.get("link").and_then(Value::as_str) {
                Some(link) => format!("{} {link}", decision.reply),
                None => decision.reply,
            },
        };
        Ok(Some(reply))
    }

    async fn execute_tool(&self, action: &PlannedAction, now: DateTime<Utc>) -> Result<Value, String> {
        match action.tool.as_str() {
            CALENDAR_CREATE_EVENT => {
                let draft = draft_from_action(action).ok_or("missing start/end")?;
                let created = self
                    .calendar
                    .create_event(&draft)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"event_id": created.event_id, "link": created.link}))
            }
            CALENDAR_LIST_EVENTS => {
                let from = input_datetime(&action.input, "time_min").ok_or("missing time_min")?;
                let to = input_datetime(&action.input, "time_max").ok_or("missing time_max")?;
                let events = self
                    .calendar
                    .list_events(from, to)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"events": events}))
            }
            CALENDAR_IS_FREE => {
                let start = input_datetime(&action.input, "start").ok_or("missing start/end")?;
                let end = input_datetime(&action.input, "end").ok_or("missing start/end")?;
                let free = self.calendar.is_free(start, end).await.map_err(|e| e.to_string())?;
                Ok(json!({"is_free": free}))
            }
            MESSAGE_SEND => {
                let chat_id = input_str(&action.input, "chat_id").ok_or("missing chat_id")?;
                let text = input_str(&action.input, "text").ok_or("missing text")?;
                let thread_id = self
                    .with_store(|s| Ok(s.active_thread(chat_id)?.map(|t| t.id)))
                    .await?;
                let sent = self.send_contact_reply(thread_id, chat_id, text, now).await?;
                if !sent {
                    return Err("send failed".to_string());
                }
                Ok(json!({"sent": true}))
            }
            other => Err(format!("unknown tool {other}")),
        }
    }

    /// Surfaces one open assistant request when nothing else is in flight.
    async fn maybe_ask(
        &self,
        state: &ConversationState,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, String> {
        if state.pending_action.is_some() || state.pending_question.is_some() {
            return Ok(None);
        }
        let ctx = self.scan_context().await;
        let (tz, defaults) = (self.tz, &self.defaults);
        self.with_store(|s| {
            if active_request(s, chat_id)?.is_some() {
                return Ok(None);
            }
            scan(s, chat_id, text, false, ctx, now)?;
            if should_skip_request_prompt(text) {
                return Ok(None);
            }
            for request in open_requests(s, chat_id)? {
                if let Some(prompt) = ask_with_policy(s, Some(request), defaults, now, tz)? {
                    return Ok(Some(prompt));
                }
            }
            Ok(None)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_state, FakeCalendar, ScriptedPlanner};
    use chrono::TimeZone;
    use concierge_contracts::{PlannerOutput, RequestStatus};
    use concierge_kernel::requests::USER_CHAT_ID;

    const USER: &str = "user@c.us";

    // 15:00 in Buenos Aires, inside the default strong window.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap()
    }

    fn event(id: &str, start: DateTime<Utc>, minutes: i64) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: "Ocupado".to_string(),
            start,
            end: start + Duration::minutes(minutes),
            all_day: false,
            location: None,
            link: None,
        }
    }

    #[test]
    fn focus_command_asks_for_hours_then_clears_on_rule() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        let mut state = ConversationState::new(USER);
        let defaults = SystemConfig::default();
        let reply = focus_command(&mut store, &mut state, "modo foco", &defaults, now()).unwrap();
        assert_eq!(reply.as_deref(), Some("Por cuantas horas?"));
        assert_eq!(state.pending_question, Some(PendingQuestion::FocusHours));

        let reply = focus_command(&mut store, &mut state, "modo foco 2", &defaults, now()).unwrap();
        assert_eq!(reply.as_deref(), Some("Modo foco activado por 2 horas."));
        assert!(state.pending_question.is_none());
        let global = global_mode(&store.autonomy_rules().unwrap(), now());
        assert_eq!(global.mode, AutonomyMode::Focus);
    }

    #[test]
    fn autonomy_off_without_scope_covers_every_action_scope() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        let mut state = ConversationState::new(USER);
        let reply = focus_command(&mut store, &mut state, "autonomia off", &SystemConfig::default(), now())
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Autonomia desactivada para todos los scopes."));
        assert_eq!(store.autonomy_rules().unwrap().len(), 3);
        assert!(focus_command(&mut store, &mut state, "hola", &SystemConfig::default(), now())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn schedule_flow_asks_duration_then_confirms() {
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        let reply = app.handle_message(USER, "agendame dentista manana 16", now()).await.unwrap();
        assert_eq!(reply, "Cuanto dura? 30/60/90");

        let reply = app.handle_message(USER, "45", now()).await.unwrap();
        assert!(reply.starts_with("Voy a agendar 'dentista' el 2026-03-11 16:00 por 45 min."), "{reply}");

        let reply = app.handle_message(USER, "confirmo", now()).await.unwrap();
        assert!(reply.starts_with("Listo, evento creado."), "{reply}");
        assert_eq!(harness.calendar.created().len(), 1);
        let state = app.with_store(|s| s.state(USER)).await.unwrap();
        assert!(state.pending_action.is_none());
        assert_eq!(state.last_intent.as_deref(), Some("calendar_execute"));
        let runs = app.with_store(|s| s.tool_runs()).await.unwrap();
        assert_eq!(runs[0].tool_name, CALENDAR_CREATE_EVENT);
        assert_eq!(runs[0].decision_source, DecisionSource::User);
    }

    #[tokio::test]
    async fn conflict_offers_two_free_alternatives() {
        // 2026-03-11 16:00 local is 19:00 UTC.
        let start = Utc.with_ymd_and_hms(2026, 3, 11, 19, 0, 0).unwrap();
        let busy = vec![event("a", start, 60)];
        let harness = test_state(FakeCalendar::authorized(busy), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        let reply = app
            .handle_message(USER, "agendame reunion manana 16 por 60 min", now())
            .await
            .unwrap();
        assert_eq!(
            reply,
            "Hay conflicto. Opciones: 1) 2026-03-11 17:00 2) 2026-03-11 17:30 Responde 1 o 2."
        );
        assert_eq!(app.handle_message(USER, "3", now()).await.unwrap(), "Responde 1 o 2.");
        let reply = app.handle_message(USER, "2", now()).await.unwrap();
        assert!(reply.contains("2026-03-11 17:30"), "{reply}");
    }

    #[tokio::test]
    async fn list_without_token_points_to_authorization() {
        let harness = test_state(FakeCalendar::unauthorized(), ScriptedPlanner::fallback()).await;
        let reply = harness.state.handle_message(USER, "que tengo hoy", now()).await.unwrap();
        assert!(reply.contains("/auth/google/start"), "{reply}");
        let auth = harness
            .state
            .with_store(|s| request_for(s, CALENDAR_AUTH, USER))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth.status, RequestStatus::Asked);
    }

    #[tokio::test]
    async fn cancel_clears_pending_plan() {
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        app.handle_message(USER, "agendame corte manana 10 por 30 min", now()).await.unwrap();
        assert_eq!(app.handle_message(USER, "hola", now()).await.unwrap(), PLAN_PENDING);
        assert_eq!(app.handle_message(USER, "cancelar", now()).await.unwrap(), "Listo, cancelado.");
        let state = app.with_store(|s| s.state(USER)).await.unwrap();
        assert!(state.pending_action.is_none());
        assert!(state.pending_question.is_none());
        assert!(harness.calendar.created().is_empty());
    }

    #[tokio::test]
    async fn cancel_drops_an_open_question() {
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        assert_eq!(app.handle_message(USER, "agendame dentista manana 16", now()).await.unwrap(), ASK_DURATION);
        let state = app.with_store(|s| s.state(USER)).await.unwrap();
        assert_eq!(state.pending_question.as_ref().map(|q| q.kind()), Some("duration_minutes"));

        assert_eq!(app.handle_message(USER, "cancelar", now()).await.unwrap(), "Listo, cancelado.");
        let state = app.with_store(|s| s.state(USER)).await.unwrap();
        assert!(state.pending_question.is_none());
        assert!(state.pending_action.is_none());
        let reply = app.handle_message(USER, "45", now()).await.unwrap();
        assert!(!reply.starts_with("Voy a agendar"), "{reply}");
    }

    #[tokio::test]
    async fn cancel_clears_question_and_plan_together() {
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        app.handle_message(USER, "agendame corte manana 10 por 30 min", now()).await.unwrap();
        app.with_store(|s| {
            let mut state = s.state(USER)?;
            state.pending_question = Some(PendingQuestion::FocusHours);
            s.save_state(&state)
        })
        .await
        .unwrap();

        assert_eq!(app.handle_message(USER, "cancelar", now()).await.unwrap(), "Listo, cancelado.");
        let state = app.with_store(|s| s.state(USER)).await.unwrap();
        assert!(state.pending_action.is_none());
        assert!(state.pending_question.is_none());
        assert_eq!(state.last_intent.as_deref(), Some("cancel"));
    }

    #[tokio::test]
    async fn asked_request_captures_the_next_answer() {
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        let app = &harness.state;
        let reply = app.handle_message(USER, "hola que tal", now()).await.unwrap();
        assert!(reply.contains("chat"), "{reply}");
        assert_eq!(app.handle_message(USER, "este", now()).await.unwrap(), SAVED);
        let request = app
            .with_store(|s| request_for(s, USER_CHAT_ID, USER))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.status, RequestStatus::Answered);
        let fact = app.with_store(|s| s.fact("user_chat_id")).await.unwrap().unwrap();
        assert_eq!(fact.value, USER);
    }

    #[tokio::test]
    async fn high_risk_plan_is_parked_for_confirmation() {
        let output: PlannerOutput = serde_json::from_value(json!({
            "intent": "message_send",
            "reply": "Le mando el mensaje a Ana?",
            "actions": [{
                "tool": "message.send",
                "input": {"chat_id": "ana@c.us", "text": "Llego 10 min tarde"},
                "risk_level": "high",
                "rationale": "pedido del usuario",
                "requires_confirmation": false
            }]
        }))
        .unwrap();
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::new(output)).await;
        let app = &harness.state;
        let reply = app
            .handle_message(USER, "podes avisarle a ana que llego tarde", now())
            .await
            .unwrap();
        assert_eq!(reply, "Le mando el mensaje a Ana?");
        let reply = app.handle_message(USER, "si", now()).await.unwrap();
        assert_eq!(reply, "Listo, mensaje enviado.");
        let sent = harness.transport.sent();
        assert_eq!(sent, vec![("ana@c.us".to_string(), "Llego 10 min tarde".to_string())]);
    }
}
