use crate::in_window;
use crate::text::{normalize, parse_int};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use concierge_contracts::{
    request_dedupe_key, AssistantRequest, AutonomyMode, RequestContext, RequestStatus,
    SystemConfig, REQUEST_DISMISS_DAYS,
};

pub const ALWAYS_ASK_PRIORITY: i64 = 85;
pub const MAX_ASKED_PER_DAY: usize = 1;
pub const DURATION_PROMPTS_BEFORE_ASKING: usize = 3;
pub const DURATION_PROMPT_MARKER: &str = "Cuanto dura";

pub const CALENDAR_AUTH: (&str, &str) = ("authorize_calendar", "calendar_auth");
pub const DEFAULT_BARBERSHOP: (&str, &str) = ("missing_default_contact", "default_barbershop");
pub const PREFERRED_DURATION: (&str, &str) = ("missing_preference", "preferred_event_duration_minutes");
pub const DIET_STORE_ADDRESS: (&str, &str) = ("missing_address", "diet_store_address");
pub const USER_CHAT_ID: (&str, &str) = ("missing_preference", "user_chat_id");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub request_type: &'static str,
    pub key: &'static str,
    pub prompt: String,
    pub priority: i64,
    pub reopen_if_answered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeedAction {
    Ensure(RequestSpec),
    /// The need is already satisfied; an open or asked request for it gets answered.
    Close {
        request_type: &'static str,
        key: &'static str,
    },
}

/// What the detector needs to know about the world for one scan.
#[derive(Debug, Clone, Default)]
pub struct NeedsInputs<'a> {
    pub folded_text: &'a str,
    pub calendar_intent: bool,
    pub calendar_has_token: bool,
    pub known_facts: &'a [String],
    pub duration_prompts: usize,
    pub user_chat_configured: bool,
    pub public_base_url: &'a str,
}

impl NeedsInputs<'_> {
    fn has_fact(&self, key: &str) -> bool {
        self.known_facts.iter().any(|k| k == key)
    }
}

pub fn calendar_auth_message(public_base_url: &str) -> String {
    format!(
        "Para agendar en tu calendario necesito autorizacion. Lo habilitas ahora? Abri {}/auth/google/start (podes responder 'omitir')",
        public_base_url.trim_end_matches('/')
    )
}

fn mentions_usual_barbershop(folded: &str) -> bool {
    folded.contains("peluquer") && folded.contains("de siempre")
}

fn mentions_diet_store_schedule(folded: &str) -> bool {
    (folded.contains("dietetica") || folded.contains("ascend"))
        && ["agend", "agenda", "bloque", "rutina", "turno"]
            .iter()
            .any(|k| folded.contains(k))
}

fn ensure(
    (request_type, key): (&'static str, &'static str),
    prompt: String,
    priority: i64,
    reopen_if_answered: bool,
) -> NeedAction {
    NeedAction::Ensure(RequestSpec {
        request_type,
        key,
        prompt,
        priority,
        reopen_if_answered,
    })
}

fn close((request_type, key): (&'static str, &'static str)) -> NeedAction {
    NeedAction::Close { request_type, key }
}

/// Rule order matters: the first `Ensure` is the one asked when only one question fits.
pub fn detect_needs(inputs: &NeedsInputs<'_>) -> Vec<NeedAction> {
    let folded = inputs.folded_text;
    let mut actions = Vec::new();

    if inputs.calendar_intent {
        if inputs.calendar_has_token {
            actions.push(close(CALENDAR_AUTH));
        } else {
            actions.push(ensure(
                CALENDAR_AUTH,
                calendar_auth_message(inputs.public_base_url),
                90,
                true,
            ));
        }
    }

    if mentions_usual_barbershop(folded) {
        if inputs.has_fact(DEFAULT_BARBERSHOP.1) {
            actions.push(close(DEFAULT_BARBERSHOP));
        } else {
            actions.push(ensure(
                DEFAULT_BARBERSHOP,
                "Para ayudarte con la peluqueria de siempre, me falta el nombre o numero. Cual es? (podes responder 'omitir')".to_string(),
                75,
                false,
            ));
        }
    }

    if inputs.calendar_intent {
        if inputs.has_fact(PREFERRED_DURATION.1) {
            actions.push(close(PREFERRED_DURATION));
        } else if inputs.duration_prompts >= DURATION_PROMPTS_BEFORE_ASKING {
            actions.push(ensure(
                PREFERRED_DURATION,
                "Para agilizar tus agendas, cual es tu duracion preferida en minutos? (30/60/90). (podes responder 'omitir')".to_string(),
                60,
                false,
            ));
        }
    }

    if mentions_diet_store_schedule(folded) {
        if inputs.has_fact(DIET_STORE_ADDRESS.1) {
            actions.push(close(DIET_STORE_ADDRESS));
        } else {
            actions.push(ensure(
                DIET_STORE_ADDRESS,
                "Para ayudarte con tu dietetica, me falta la direccion. Cual es? (podes responder 'omitir')".to_string(),
                30,
                false,
            ));
        }
    }

    if inputs.user_chat_configured || inputs.has_fact(USER_CHAT_ID.1) {
        actions.push(close(USER_CHAT_ID));
    } else {
        actions.push(ensure(
            USER_CHAT_ID,
            "Para enviarte proactivos y resumen, queres usar este chat como principal? (podes responder 'omitir')".to_string(),
            55,
            false,
        ));
    }

    actions
}

pub fn new_request(spec: &RequestSpec, chat_id: &str, id: i64, now: DateTime<Utc>) -> AssistantRequest {
    AssistantRequest {
        id,
        request_type: spec.request_type.to_string(),
        key: spec.key.to_string(),
        prompt: spec.prompt.clone(),
        context: RequestContext {
            chat_id: chat_id.to_string(),
            dismissed_until: None,
            reopen_if_answered: spec.reopen_if_answered,
            extra: Default::default(),
        },
        priority: spec.priority,
        status: RequestStatus::Open,
        dedupe_key: request_dedupe_key(spec.request_type, spec.key, chat_id),
        asked_at: None,
        answered_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn reopen(request: &mut AssistantRequest, now: DateTime<Utc>) -> Option<&'static str> {
    request.status = RequestStatus::Open;
    request.asked_at = None;
    request.answered_at = None;
    request.context.dismissed_until = None;
    request.updated_at = now;
    Some("reopened")
}

/// Refreshes an existing request from `spec`. Returns the event to log when the status changed.
pub fn merge_existing(
    request: &mut AssistantRequest,
    spec: &RequestSpec,
    now: DateTime<Utc>,
) -> Option<&'static str> {
    request.prompt = spec.prompt.clone();
    request.priority = spec.priority;
    request.context.reopen_if_answered = spec.reopen_if_answered;
    request.updated_at = now;
    match request.status {
        RequestStatus::Dismissed => match request.context.dismissed_until {
            Some(until) if until > now => None,
            _ => reopen(request, now),
        },
        RequestStatus::Answered if spec.reopen_if_answered => reopen(request, now),
        _ => None,
    }
}

pub fn mark_asked(request: &mut AssistantRequest, now: DateTime<Utc>) -> &'static str {
    request.status = RequestStatus::Asked;
    request.asked_at = Some(now);
    request.updated_at = now;
    "asked"
}

pub fn mark_answered(request: &mut AssistantRequest, now: DateTime<Utc>) -> &'static str {
    request.status = RequestStatus::Answered;
    request.answered_at = Some(now);
    request.updated_at = now;
    "answered"
}

pub fn mark_dismissed(request: &mut AssistantRequest, now: DateTime<Utc>) -> &'static str {
    request.status = RequestStatus::Dismissed;
    request.answered_at = Some(now);
    request.context.dismissed_until = Some(now + Duration::days(REQUEST_DISMISS_DAYS));
    request.updated_at = now;
    "dismissed"
}

pub fn is_pending(request: &AssistantRequest) -> bool {
    matches!(request.status, RequestStatus::Open | RequestStatus::Asked)
}

pub fn should_ask(
    request: &AssistantRequest,
    local_time: NaiveTime,
    global_mode: AutonomyMode,
    config: &SystemConfig,
    asked_today: usize,
) -> bool {
    if request.status != RequestStatus::Open {
        return false;
    }
    if in_window(local_time, config.quiet_hours_start, config.quiet_hours_end) {
        return false;
    }
    if matches!(global_mode, AutonomyMode::Focus | AutonomyMode::UrgenciesOnly) {
        return false;
    }
    if asked_today >= MAX_ASKED_PER_DAY {
        return false;
    }
    request.priority >= ALWAYS_ASK_PRIORITY
        || in_window(local_time, config.strong_window_start, config.strong_window_end)
}

/// A user fact learned from answering a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedFact {
    pub key: &'static str,
    pub value: String,
    pub confidence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    Dismiss,
    Authorize,
    Learned(LearnedFact),
    Answered,
    /// The answer could not be used; the request stays asked and the user is re-prompted.
    Invalid(&'static str),
}

pub fn interpret_answer(request: &AssistantRequest, text: &str, dismiss: bool, chat_id: &str) -> AnswerOutcome {
    if dismiss {
        return AnswerOutcome::Dismiss;
    }
    match request.key.as_str() {
        "calendar_auth" => AnswerOutcome::Authorize,
        "preferred_event_duration_minutes" => match parse_int(text) {
            Some(minutes) => AnswerOutcome::Learned(LearnedFact {
                key: PREFERRED_DURATION.1,
                value: minutes.to_string(),
                confidence: 80,
            }),
            None => AnswerOutcome::Invalid("Necesito un numero de minutos (30/60/90)."),
        },
        "default_barbershop" | "diet_store_address" => {
            let Some(value) = normalize(Some(text)) else {
                return AnswerOutcome::Invalid("Decime el dato o responde omitir.");
            };
            let (key, confidence) = if request.key == DEFAULT_BARBERSHOP.1 {
                (DEFAULT_BARBERSHOP.1, 80)
            } else {
                (DIET_STORE_ADDRESS.1, 70)
            };
            AnswerOutcome::Learned(LearnedFact { key, value, confidence })
        }
        "user_chat_id" => AnswerOutcome::Learned(LearnedFact {
            key: USER_CHAT_ID.1,
            value: chat_id.to_string(),
            confidence: 90,
        }),
        _ => AnswerOutcome::Answered,
    }
}

/// Fact keys consulted for "el lugar de siempre" under `tag`, most specific first.
pub fn usual_place_fact_keys(tag: &str) -> Vec<String> {
    if tag == "peluqueria" {
        vec![DEFAULT_BARBERSHOP.1.to_string()]
    } else {
        vec![format!("{tag}_default"), format!("{tag}_lugar")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, 0, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn inputs<'a>(text: &'a str, facts: &'a [String]) -> NeedsInputs<'a> {
        NeedsInputs {
            folded_text: text,
            calendar_intent: false,
            calendar_has_token: false,
            known_facts: facts,
            duration_prompts: 0,
            user_chat_configured: true,
            public_base_url: "http://localhost:8080/",
        }
    }

    fn keys(actions: &[NeedAction]) -> Vec<String> {
        actions
            .iter()
            .map(|a| match a {
                NeedAction::Ensure(spec) => format!("ensure:{}", spec.key),
                NeedAction::Close { key, .. } => format!("close:{key}"),
            })
            .collect()
    }

    #[test]
    fn calendar_intent_without_token_asks_for_auth() {
        let mut input = inputs("agenda dentista", &[]);
        input.calendar_intent = true;
        let actions = detect_needs(&input);
        assert_eq!(keys(&actions), vec!["ensure:calendar_auth", "close:user_chat_id"]);
        match &actions[0] {
            NeedAction::Ensure(spec) => {
                assert_eq!(spec.priority, 90);
                assert!(spec.reopen_if_answered);
                assert!(spec.prompt.contains("http://localhost:8080/auth/google/start"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn duration_preference_needs_repeated_prompts() {
        let mut input = inputs("agenda dentista", &[]);
        input.calendar_intent = true;
        input.calendar_has_token = true;
        input.duration_prompts = 2;
        assert_eq!(keys(&detect_needs(&input)), vec!["close:calendar_auth", "close:user_chat_id"]);
        input.duration_prompts = 3;
        assert!(keys(&detect_needs(&input)).contains(&"ensure:preferred_event_duration_minutes".to_string()));
    }

    #[test]
    fn known_facts_close_requests() {
        let facts = vec!["default_barbershop".to_string()];
        let input = inputs("turno en la peluqueria de siempre", &facts);
        assert_eq!(keys(&detect_needs(&input)), vec!["close:default_barbershop", "close:user_chat_id"]);

        let mut unconfigured = inputs("agenda un bloque en la dietetica", &[]);
        unconfigured.user_chat_configured = false;
        assert_eq!(
            keys(&detect_needs(&unconfigured)),
            vec!["ensure:diet_store_address", "ensure:user_chat_id"]
        );
    }

    fn spec() -> RequestSpec {
        RequestSpec {
            request_type: "missing_default_contact",
            key: "default_barbershop",
            prompt: "Cual es?".to_string(),
            priority: 75,
            reopen_if_answered: false,
        }
    }

    #[test]
    fn dismissed_requests_stay_quiet_until_expiry() {
        let mut request = new_request(&spec(), "me@c.us", 1, at(10));
        assert_eq!(request.dedupe_key, "missing_default_contact:default_barbershop:me@c.us");
        assert_eq!(mark_dismissed(&mut request, at(10)), "dismissed");
        assert_eq!(merge_existing(&mut request, &spec(), at(12)), None);
        assert_eq!(request.status, RequestStatus::Dismissed);

        let later = at(10) + Duration::days(31);
        assert_eq!(merge_existing(&mut request, &spec(), later), Some("reopened"));
        assert_eq!(request.status, RequestStatus::Open);
        assert_eq!(request.answered_at, None);
    }

    #[test]
    fn answered_requests_reopen_only_when_flagged() {
        let mut request = new_request(&spec(), "me@c.us", 1, at(10));
        mark_answered(&mut request, at(11));
        assert_eq!(merge_existing(&mut request, &spec(), at(12)), None);
        assert_eq!(request.status, RequestStatus::Answered);

        let mut flagged = spec();
        flagged.reopen_if_answered = true;
        assert_eq!(merge_existing(&mut request, &flagged, at(12)), Some("reopened"));
        assert!(is_pending(&request));
    }

    #[test]
    fn ask_policy() {
        let cfg = SystemConfig::default();
        let mut request = new_request(&spec(), "me@c.us", 1, at(10));
        assert!(should_ask(&request, t(12, 0), AutonomyMode::Normal, &cfg, 0));
        assert!(!should_ask(&request, t(8, 0), AutonomyMode::Normal, &cfg, 0));
        assert!(!should_ask(&request, t(12, 0), AutonomyMode::Focus, &cfg, 0));
        assert!(!should_ask(&request, t(12, 0), AutonomyMode::Normal, &cfg, 1));
        assert!(!should_ask(&request, t(20, 0), AutonomyMode::Normal, &cfg, 0));
        request.priority = 90;
        assert!(should_ask(&request, t(20, 0), AutonomyMode::Normal, &cfg, 0));
        mark_asked(&mut request, at(12));
        assert!(!should_ask(&request, t(20, 0), AutonomyMode::Normal, &cfg, 0));
    }

    #[test]
    fn answers_become_facts() {
        let mut request = new_request(&spec(), "me@c.us", 1, at(10));
        assert_eq!(
            interpret_answer(&request, "  Barberia   Lopez ", false, "me@c.us"),
            AnswerOutcome::Learned(LearnedFact {
                key: "default_barbershop",
                value: "Barberia Lopez".to_string(),
                confidence: 80,
            })
        );
        assert_eq!(interpret_answer(&request, "omitir", true, "me@c.us"), AnswerOutcome::Dismiss);

        request.key = "preferred_event_duration_minutes".to_string();
        assert_eq!(
            interpret_answer(&request, "muchos", false, "me@c.us"),
            AnswerOutcome::Invalid("Necesito un numero de minutos (30/60/90).")
        );
        request.key = "user_chat_id".to_string();
        match interpret_answer(&request, "si", false, "me@c.us") {
            AnswerOutcome::Learned(fact) => {
                assert_eq!((fact.value.as_str(), fact.confidence), ("me@c.us", 90));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        request.key = "calendar_auth".to_string();
        assert_eq!(interpret_answer(&request, "dale", false, "me@c.us"), AnswerOutcome::Authorize);
    }

    #[test]
    fn usual_place_keys() {
        assert_eq!(usual_place_fact_keys("peluqueria"), vec!["default_barbershop"]);
        assert_eq!(usual_place_fact_keys("fletes"), vec!["fletes_default", "fletes_lugar"]);
    }
}
