use crate::text::fold;
use crate::{format_local_hm, in_window, local_date};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use concierge_contracts::{
    AssistantRequest, AutonomyMode, CalendarEvent, Contact, ConversationThread, Decision,
    ProactiveEvent, Strategy, SystemConfig, Task, ThreadStatus, TriggerType,
};

pub const LOOKAHEAD_MINUTES: i64 = 120;
pub const TASK_DUE_SOON_MINUTES: i64 = 120;
pub const TASK_HIGH_PRIORITY: i64 = 3;
pub const REQUEST_DIGEST_MIN_PRIORITY: i64 = 70;
pub const REQUEST_DIGEST_LIMIT: usize = 3;
pub const THREAD_WAITING_HOURS: i64 = 3;
pub const HABIT_SCORE_CAP: i64 = 95;
pub const DIGEST_VISIBLE_LINES: usize = 10;
pub const DIGEST_HABIT_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub trigger_type: TriggerType,
    pub entity_id: String,
    pub title: String,
    pub score: i64,
    pub priority: Option<i64>,
    pub dedupe_key: String,
    pub message: String,
    pub strategy: Option<Strategy>,
}

impl Candidate {
    pub fn record(
        &self,
        decision: Decision,
        reason: &str,
        sent_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ProactiveEvent {
        ProactiveEvent {
            dedupe_key: self.dedupe_key.clone(),
            trigger_type: self.trigger_type,
            entity_id: self.entity_id.clone(),
            title: self.title.clone(),
            score: self.score,
            decision,
            reason: reason.to_string(),
            sent_at,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: &'static str,
}

impl Verdict {
    fn digest(reason: &'static str) -> Self {
        Self {
            decision: Decision::Digested,
            reason,
        }
    }
}

/// Decides what happens to one candidate. `local_time` is the wall clock in the user's zone.
pub fn decide(
    score: i64,
    local_time: NaiveTime,
    config: &SystemConfig,
    global_mode: AutonomyMode,
    sent_today: u32,
    in_cooldown: bool,
) -> Verdict {
    let urgent = score >= config.urgent_threshold;
    if !urgent && in_window(local_time, config.quiet_hours_start, config.quiet_hours_end) {
        return Verdict::digest("quiet_hours");
    }
    if !urgent && matches!(global_mode, AutonomyMode::Focus | AutonomyMode::UrgenciesOnly) {
        return Verdict::digest("autonomy_mode");
    }
    if score < config.maybe_threshold {
        return Verdict::digest("below_threshold");
    }
    let reason = if urgent {
        "urgent"
    } else {
        if !in_window(local_time, config.strong_window_start, config.strong_window_end) {
            return Verdict::digest("outside_strong_window");
        }
        if in_cooldown {
            return Verdict::digest("cooldown");
        }
        "maybe"
    };
    if sent_today >= config.daily_limit {
        return Verdict::digest("rate_limit");
    }
    Verdict {
        decision: Decision::Sent,
        reason,
    }
}

fn calendar_window(delta_minutes: f64) -> Option<(&'static str, i64)> {
    if delta_minutes <= 10.0 {
        Some(("tminus10", 90))
    } else if delta_minutes <= 30.0 {
        Some(("tminus30", 80))
    } else if delta_minutes <= 60.0 {
        Some(("tminus60", 70))
    } else {
        None
    }
}

pub fn calendar_candidate(event: &CalendarEvent, now: DateTime<Utc>) -> Option<Candidate> {
    if event.id.is_empty() || event.all_day {
        return None;
    }
    let delta_minutes = (event.start - now).num_seconds() as f64 / 60.0;
    if delta_minutes <= 0.0 {
        return None;
    }
    let (window, mut score) = calendar_window(delta_minutes)?;
    let title = if event.title.trim().is_empty() {
        "Sin titulo".to_string()
    } else {
        event.title.clone()
    };
    let folded = fold(&title);
    if folded.contains("cliente") || folded.contains("flete") {
        score += 10;
    }
    if event.location.as_deref().map(str::trim).unwrap_or("").is_empty() {
        score += 5;
    }
    let minutes_to_start = delta_minutes.ceil().max(0.0) as i64;
    Some(Candidate {
        trigger_type: TriggerType::CalendarUpcoming,
        entity_id: event.id.clone(),
        message: format!(
            "En {minutes_to_start} min tenes: *{title}*.\nQueres que revise algo o te recuerde mas tarde?"
        ),
        title,
        score,
        priority: None,
        dedupe_key: format!("calendar:{}:{window}", event.id),
        strategy: None,
    })
}

/// Open tasks whose due instant falls on the local `today`.
pub fn task_candidate(task: &Task, now: DateTime<Utc>, tz: Tz) -> Option<Candidate> {
    let due_at = task.due_at?;
    if task.status == "done" || local_date(due_at, tz) != local_date(now, tz) {
        return None;
    }
    let mut score = 55;
    if task.priority >= TASK_HIGH_PRIORITY {
        score += 15;
    }
    let until_due = due_at - now;
    if until_due > Duration::zero() && until_due <= Duration::minutes(TASK_DUE_SOON_MINUTES) {
        score += 20;
    }
    Some(Candidate {
        trigger_type: TriggerType::TaskDueToday,
        entity_id: task.id.clone(),
        title: task.title.clone(),
        score,
        priority: Some(task.priority),
        dedupe_key: format!("task:{}:due_today", task.id),
        message: format!(
            "Hoy vence: *{}*. Queres que lo agende como bloque de 30 min?",
            task.title
        ),
        strategy: None,
    })
}

pub fn thread_candidate(
    thread: &ConversationThread,
    contact: &Contact,
    now: DateTime<Utc>,
) -> Option<Candidate> {
    if thread.status != ThreadStatus::WaitingMe || !contact.trust_label.is_business() {
        return None;
    }
    let last = thread.last_message_at?;
    if last > now - Duration::hours(THREAD_WAITING_HOURS) {
        return None;
    }
    let name = contact.name().to_string();
    let summary = thread.last_summary.as_deref().unwrap_or("sin resumen");
    Some(Candidate {
        trigger_type: TriggerType::ThreadWaitingMe,
        entity_id: thread.id.to_string(),
        message: format!("Tenes pendiente responder a {name}: {summary}. Queres que redacte respuesta?"),
        title: name,
        score: 80,
        priority: None,
        dedupe_key: format!("thread_waiting_me:{}:{}", thread.id, last.to_rfc3339()),
        strategy: None,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn habit_candidate(
    habit_id: i64,
    habit_name: &str,
    habit_priority: i64,
    trigger: TriggerType,
    bonus: i64,
    strategy: Strategy,
    strategy_score: i64,
    message: String,
    today: NaiveDate,
) -> Candidate {
    Candidate {
        trigger_type: trigger,
        entity_id: habit_id.to_string(),
        title: habit_name.to_string(),
        score: (strategy_score + bonus).min(HABIT_SCORE_CAP),
        priority: Some(habit_priority),
        dedupe_key: format!("habit:{habit_id}:{}:{today}", trigger.as_str()),
        message,
        strategy: Some(strategy),
    }
}

/// Highest score first; equal scores keep generation order.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
}

pub fn calendar_digest_label(event: &CalendarEvent, tz: Tz) -> String {
    let title = if event.title.trim().is_empty() {
        "Sin titulo"
    } else {
        event.title.as_str()
    };
    if event.all_day {
        format!("Evento: {title} (todo el dia)")
    } else {
        format!("Evento: {title} ({})", format_local_hm(event.start, tz))
    }
}

pub fn thread_digest_label(thread: &ConversationThread, contact: &Contact) -> String {
    format!(
        "Pendiente: {} ({})",
        contact.name(),
        thread.last_summary.as_deref().unwrap_or("sin resumen")
    )
}

/// Fallback label for a digested event whose entity can no longer be resolved.
pub fn fallback_digest_label(event: &ProactiveEvent) -> String {
    match event.trigger_type {
        TriggerType::CalendarUpcoming => format!("Evento: {}", event.entity_id),
        TriggerType::TaskDueToday => format!("Tarea: {}", event.entity_id),
        TriggerType::ThreadWaitingMe => "Pendiente: conversacion".to_string(),
        other => format!("{}: {}", other.as_str(), event.entity_id),
    }
}

pub fn request_digest_label(request: &AssistantRequest) -> String {
    let known = match request.key.as_str() {
        "calendar_auth" => Some("Falta autorizar Google Calendar."),
        "default_barbershop" => Some("Falta definir la peluqueria de siempre."),
        "preferred_event_duration_minutes" => Some("Falta definir la duracion preferida."),
        "diet_store_address" => Some("Falta la direccion de tu dietetica."),
        "user_chat_id" => Some("Falta definir el chat principal para proactivos."),
        _ => None,
    };
    if let Some(label) = known {
        return label.to_string();
    }
    let head = request.prompt.split('?').next().unwrap_or("").trim();
    if head.is_empty() {
        format!("Falta: {}", request.key)
    } else {
        head.to_string()
    }
}

/// Open requests worth a digest line, highest priority first and oldest first within a priority.
pub fn digest_requests<'a>(requests: &'a [AssistantRequest], chat_id: &str) -> Vec<&'a AssistantRequest> {
    let mut picked: Vec<&AssistantRequest> = requests
        .iter()
        .filter(|r| {
            r.status == concierge_contracts::RequestStatus::Open
                && r.priority >= REQUEST_DIGEST_MIN_PRIORITY
                && r.context.chat_id == chat_id
        })
        .collect();
    picked.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    picked.truncate(REQUEST_DIGEST_LIMIT);
    picked
}

pub fn format_digest(lines: &[String], request_lines: &[String], habit_lines: &[String]) -> String {
    let mut out = vec!["Resumen de hoy:".to_string()];
    out.extend(lines.iter().take(DIGEST_VISIBLE_LINES).map(|l| format!("- {l}")));
    if lines.len() > DIGEST_VISIBLE_LINES {
        out.push(format!("y {} mas", lines.len() - DIGEST_VISIBLE_LINES));
    }
    if !request_lines.is_empty() {
        out.push("Para mejorar:".to_string());
        out.extend(request_lines.iter().map(|l| format!("- {l}")));
    }
    if !habit_lines.is_empty() {
        out.push("Habitos:".to_string());
        out.extend(habit_lines.iter().take(DIGEST_HABIT_LINES).map(|l| format!("- {l}")));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use concierge_contracts::{RequestContext, RequestStatus, TrustLabel};

    fn tz() -> Tz {
        "America/Argentina/Buenos_Aires".parse().unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2026-03-10 15:00 UTC is 12:00 in Buenos Aires.
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()
    }

    fn event(id: &str, title: &str, minutes: i64, location: Option<&str>) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: title.to_string(),
            start: noon() + Duration::minutes(minutes),
            end: noon() + Duration::minutes(minutes + 60),
            all_day: false,
            location: location.map(|l| l.to_string()),
            link: None,
        }
    }

    #[test]
    fn urgent_bypasses_quiet_hours() {
        let cfg = SystemConfig::default();
        let verdict = decide(90, t(8, 0), &cfg, AutonomyMode::Normal, 0, false);
        assert_eq!(verdict, Verdict { decision: Decision::Sent, reason: "urgent" });
        let quiet = decide(79, t(8, 0), &cfg, AutonomyMode::Normal, 0, false);
        assert_eq!(quiet.reason, "quiet_hours");
    }

    #[test]
    fn focus_mode_digests_non_urgent() {
        let cfg = SystemConfig::default();
        let verdict = decide(70, t(12, 0), &cfg, AutonomyMode::Focus, 0, false);
        assert_eq!(verdict, Verdict::digest("autonomy_mode"));
        let urgent = decide(85, t(12, 0), &cfg, AutonomyMode::UrgenciesOnly, 0, false);
        assert_eq!(urgent.decision, Decision::Sent);
    }

    #[test]
    fn maybe_needs_window_and_no_cooldown() {
        let cfg = SystemConfig::default();
        assert_eq!(decide(40, t(12, 0), &cfg, AutonomyMode::Normal, 0, false).reason, "below_threshold");
        assert_eq!(
            decide(60, t(20, 0), &cfg, AutonomyMode::Normal, 0, false).reason,
            "outside_strong_window"
        );
        assert_eq!(decide(60, t(12, 0), &cfg, AutonomyMode::Normal, 0, true).reason, "cooldown");
        assert_eq!(decide(60, t(12, 0), &cfg, AutonomyMode::Normal, 0, false).reason, "maybe");
    }

    #[test]
    fn daily_cap_applies_to_every_send() {
        let cfg = SystemConfig::default();
        assert_eq!(decide(95, t(12, 0), &cfg, AutonomyMode::Normal, 5, false).reason, "rate_limit");
        assert_eq!(decide(60, t(12, 0), &cfg, AutonomyMode::Normal, 5, false).reason, "rate_limit");
        assert_eq!(decide(60, t(12, 0), &cfg, AutonomyMode::Normal, 4, false).reason, "maybe");
    }

    #[test]
    fn calendar_score_bands_and_bonuses() {
        let near = calendar_candidate(&event("e1", "Flete Ruiz", 8, None), noon()).unwrap();
        assert_eq!(near.score, 105);
        assert_eq!(near.dedupe_key, "calendar:e1:tminus10");
        assert!(near.message.starts_with("En 8 min tenes: *Flete Ruiz*."));

        let mid = calendar_candidate(&event("e2", "Dentista", 25, Some("Centro")), noon()).unwrap();
        assert_eq!((mid.score, mid.dedupe_key.as_str()), (80, "calendar:e2:tminus30"));

        let far = calendar_candidate(&event("e3", "Dentista", 45, Some("Centro")), noon()).unwrap();
        assert_eq!(far.score, 70);

        assert!(calendar_candidate(&event("e4", "Tarde", 90, None), noon()).is_none());
        assert!(calendar_candidate(&event("e5", "Pasado", -5, None), noon()).is_none());
    }

    #[test]
    fn same_event_window_yields_same_dedupe_key() {
        let a = calendar_candidate(&event("e1", "Reunion", 50, None), noon()).unwrap();
        let b = calendar_candidate(&event("e1", "Reunion", 50, None), noon() + Duration::minutes(5))
            .unwrap();
        assert_eq!(a.dedupe_key, "calendar:e1:tminus60");
        assert_eq!(a.dedupe_key, b.dedupe_key);
    }

    #[test]
    fn tasks_due_today_only() {
        let task = |due: DateTime<Utc>, priority: i64| Task {
            id: "7".to_string(),
            title: "Pagar luz".to_string(),
            due_at: Some(due),
            priority,
            status: "open".to_string(),
        };
        let soon = task_candidate(&task(noon() + Duration::minutes(90), 3), noon(), tz()).unwrap();
        assert_eq!(soon.score, 90);
        assert_eq!(soon.dedupe_key, "task:7:due_today");
        let later = task_candidate(&task(noon() + Duration::hours(5), 1), noon(), tz()).unwrap();
        assert_eq!(later.score, 55);
        // 03:30 UTC on the 11th is still the 10th locally.
        let late_local = Utc.with_ymd_and_hms(2026, 3, 11, 2, 30, 0).unwrap();
        assert!(task_candidate(&task(late_local, 1), noon(), tz()).is_some());
        assert!(task_candidate(&task(noon() + Duration::days(1), 1), noon(), tz()).is_none());
    }

    #[test]
    fn threads_wait_on_trusted_contacts_only() {
        let mut contact = Contact::new("prov@c.us", Some("Fletes Ruiz"));
        contact.trust_label = TrustLabel::Provider;
        let thread = ConversationThread {
            id: 4,
            contact_chat_id: contact.chat_id.clone(),
            status: ThreadStatus::WaitingMe,
            last_message_at: Some(noon() - Duration::hours(4)),
            last_summary: Some("precio del flete?".to_string()),
            updated_at: noon(),
        };
        let candidate = thread_candidate(&thread, &contact, noon()).unwrap();
        assert_eq!(candidate.score, 80);
        assert!(candidate.message.contains("Fletes Ruiz: precio del flete?"));

        let mut fresh = thread.clone();
        fresh.last_message_at = Some(noon() - Duration::hours(1));
        assert!(thread_candidate(&fresh, &contact, noon()).is_none());

        contact.trust_label = TrustLabel::Friend;
        assert!(thread_candidate(&thread, &contact, noon()).is_none());
    }

    #[test]
    fn habit_score_is_capped() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let c = habit_candidate(
            3,
            "leer",
            5,
            TriggerType::HabitStreakRisk,
            10,
            Strategy::Reframe,
            90,
            "msg".to_string(),
            today,
        );
        assert_eq!(c.score, 95);
        assert_eq!(c.dedupe_key, "habit:3:habit_streak_risk:2026-03-10");
    }

    #[test]
    fn digest_caps_visible_lines() {
        let lines: Vec<String> = (0..12).map(|i| format!("Tarea: {i}")).collect();
        let text = format_digest(&lines, &["Falta autorizar Google Calendar.".to_string()], &[]);
        assert!(text.starts_with("Resumen de hoy:\n- Tarea: 0"));
        assert!(text.contains("y 2 mas"));
        assert!(!text.contains("Tarea: 10"));
        assert!(text.ends_with("Para mejorar:\n- Falta autorizar Google Calendar."));
    }

    #[test]
    fn request_labels_and_selection() {
        let request = |id: i64, key: &str, priority: i64, status: RequestStatus| AssistantRequest {
            id,
            request_type: "missing_preference".to_string(),
            key: key.to_string(),
            prompt: "Cual es tu color favorito? (responde omitir)".to_string(),
            context: RequestContext {
                chat_id: "me@c.us".to_string(),
                ..RequestContext::default()
            },
            priority,
            status,
            dedupe_key: format!("missing_preference:{key}:me@c.us"),
            asked_at: None,
            answered_at: None,
            created_at: noon() + Duration::minutes(id),
            updated_at: noon(),
        };
        let requests = vec![
            request(1, "color", 70, RequestStatus::Open),
            request(2, "calendar_auth", 90, RequestStatus::Open),
            request(3, "diet_store_address", 30, RequestStatus::Open),
            request(4, "user_chat_id", 95, RequestStatus::Asked),
        ];
        let picked = digest_requests(&requests, "me@c.us");
        let labels: Vec<String> = picked.iter().map(|r| request_digest_label(r)).collect();
        assert_eq!(labels, vec!["Falta autorizar Google Calendar.", "Cual es tu color favorito"]);
        assert!(digest_requests(&requests, "other@c.us").is_empty());
    }
}
