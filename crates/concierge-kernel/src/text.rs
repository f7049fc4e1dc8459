use crate::local_datetime;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use concierge_contracts::{AutonomyScope, ScheduleDraft, ScheduleKind};
use once_cell::sync::Lazy;
use regex::Regex;

pub const CANCEL_COMMANDS: [&str; 3] = ["cancelar", "cancela", "olvidalo"];
pub const CONFIRM_COMMANDS: [&str; 4] = ["confirmo", "si", "s", "ok"];
pub const DISMISS_ANSWERS: [&str; 2] = ["omitir", "despues"];

const GREETINGS: [&str; 5] = ["hola", "buenas", "buen dia", "buenas tardes", "buenas noches"];
const LLM_KEYWORDS: [&str; 11] = [
    "agend",
    "agenda",
    "crear",
    "evento",
    "calendario",
    "recorda",
    "recordar",
    "turno",
    "necesito",
    "queres",
    "pod",
];
const MEMORY_KEYWORDS: [&str; 4] = ["recordas", "acordas", "tenes info", "tenes datos"];

const TAG_RULES: [(&str, &[&str]); 5] = [
    ("fletes", &["flete", "mudanza"]),
    ("camionetas", &["camioneta", "f100", "rastrojero"]),
    ("ascend", &["dietetica", "ascend"]),
    ("peluqueria", &["peluquer"]),
    ("agenda", &["turno", "agenda"]),
];

const DAY_NAMES: [(&str, u32); 14] = [
    ("lunes", 0),
    ("lun", 0),
    ("martes", 1),
    ("mar", 1),
    ("miercoles", 2),
    ("mie", 2),
    ("jueves", 3),
    ("jue", 3),
    ("viernes", 4),
    ("vie", 4),
    ("sabado", 5),
    ("sab", 5),
    ("domingo", 6),
    ("dom", 6),
];

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid regex"));
static CLOCK_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})\b").expect("valid regex"));
static BARE_HOUR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})\b").expect("valid regex"));
static DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,3})\s*(minutos|min|m)\b").expect("valid regex"));
static SMALL_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,3})\b").expect("valid regex"));
static CHOICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([12])\b").expect("valid regex"));
static TITLE_REST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bagend\w*\b\s*(.+)").expect("valid regex"));
static TITLE_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b(hoy|mañana|manana)\b").expect("valid regex"),
        Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("valid regex"),
        Regex::new(r"(?i)\b\d{1,3}\s*(minutos|min|m)\b").expect("valid regex"),
        Regex::new(r"\b\d{1,2}(:\d{2})?\b").expect("valid regex"),
        Regex::new(r"(?i)\bpor\b").expect("valid regex"),
        Regex::new(r"(?i)\ba\s+las\b").expect("valid regex"),
    ]
});
static WEEKLY_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\s*veces\s*por\s*semana").expect("valid regex"));
static HABIT_NAME_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\b\d+\s*veces\s*por\s*semana\b").expect("valid regex"),
        Regex::new(
            r"(?i)\b(lunes|martes|miercoles|miércoles|jueves|viernes|sabado|sábado|domingo|lun|mar|mie|jue|vie|sab|dom)\b",
        )
        .expect("valid regex"),
    ]
});
static CONTACT_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^contacto\s+(.+?)\s+es\s+(proveedor|cliente|amigo|inner)\b").expect("valid regex")
});
static CONTACT_LEVEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^subi confianza\s+(.+?)\s+a\s+(\d{1,3})\b").expect("valid regex"));
static AUTO_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^auto[-\s]?reply\s+(on|off)\s+(.+)$").expect("valid regex"));
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));

/// Lowercased ASCII rendition with accents folded, other non-ASCII dropped and whitespace collapsed.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let mapped = match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' | 'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => 'a',
            'é' | 'è' | 'ë' | 'ê' | 'É' | 'È' | 'Ë' | 'Ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' | 'Í' | 'Ì' | 'Ï' | 'Î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' | 'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'o',
            'ú' | 'ù' | 'ü' | 'û' | 'Ú' | 'Ù' | 'Ü' | 'Û' => 'u',
            'ñ' | 'Ñ' => 'n',
            'ç' | 'Ç' => 'c',
            c if c.is_ascii() => c.to_ascii_lowercase(),
            _ => continue,
        };
        out.push(mapped);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize(text: Option<&str>) -> Option<String> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn is_cancel(folded: &str) -> bool {
    CANCEL_COMMANDS.contains(&folded)
}

pub fn is_confirm(folded: &str) -> bool {
    CONFIRM_COMMANDS.contains(&folded)
}

pub fn is_dismiss(folded: &str) -> bool {
    DISMISS_ANSWERS.contains(&folded)
}

pub fn strip_punctuation(folded: &str) -> String {
    PUNCTUATION.replace_all(folded, "").trim().to_string()
}

pub fn parse_date(folded: &str, today: NaiveDate) -> Option<NaiveDate> {
    if folded.contains("manana") {
        return today.succ_opt();
    }
    if folded.contains("hoy") {
        return Some(today);
    }
    let caps = ISO_DATE.captures(folded)?;
    let year = caps[1].parse::<i32>().ok()?;
    let month = caps[2].parse::<u32>().ok()?;
    let day = caps[3].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Prefers an `HH:MM` reading and falls back to a bare hour once dates are removed.
pub fn parse_time(folded: &str) -> Option<NaiveTime> {
    let cleaned = ISO_DATE.replace_all(folded, "");
    for caps in CLOCK_TIME.captures_iter(&cleaned) {
        let hour = caps[1].parse::<u32>().ok();
        let minute = caps[2].parse::<u32>().ok();
        if let (Some(h), Some(m)) = (hour, minute) {
            if let Some(t) = NaiveTime::from_hms_opt(h, m, 0) {
                return Some(t);
            }
        }
    }
    for caps in BARE_HOUR.captures_iter(&cleaned) {
        if let Some(t) = caps[1]
            .parse::<u32>()
            .ok()
            .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0))
        {
            return Some(t);
        }
    }
    None
}

pub fn parse_datetime(text: &str, today: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    let folded = fold(text);
    let day = parse_date(&folded, today)?;
    let time = parse_time(&folded)?;
    Some(local_datetime(tz, day, time))
}

pub fn parse_duration(text: &str) -> Option<i64> {
    let folded = fold(text);
    let caps = DURATION.captures(&folded)?;
    caps[1].parse::<i64>().ok().filter(|v| *v > 0)
}

pub fn parse_int(text: &str) -> Option<i64> {
    let caps = SMALL_INT.captures(text)?;
    caps[1].parse::<i64>().ok().filter(|v| *v > 0)
}

pub fn parse_choice(text: &str) -> Option<usize> {
    let caps = CHOICE.captures(text)?;
    caps[1].parse::<usize>().ok().map(|v| v - 1)
}

pub fn extract_title(text: &str) -> String {
    let rest = TITLE_REST
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text);
    let mut cleaned = rest.to_string();
    for pattern in TITLE_NOISE.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    let title = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        "Sin titulo".to_string()
    } else {
        title
    }
}

pub fn parse_list_request(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let folded = fold(text);
    if !folded.contains("que tengo") && !folded.contains("que hay") {
        return None;
    }
    Some(parse_date(&folded, today).unwrap_or(today))
}

pub fn parse_schedule_request(text: &str, today: NaiveDate, tz: Tz) -> Option<ScheduleDraft> {
    if !fold(text).contains("agend") {
        return None;
    }
    Some(ScheduleDraft {
        title: extract_title(text),
        start: parse_datetime(text, today, tz),
        duration_minutes: parse_duration(text),
        location: None,
        notes: None,
    })
}

pub fn has_calendar_intent(folded: &str) -> bool {
    ["agend", "agenda", "evento", "calendario", "turno", "que tengo", "que hay"]
        .iter()
        .any(|k| folded.contains(k))
}

pub fn parse_autonomy_scope(folded: &str) -> Option<AutonomyScope> {
    if folded.contains("calendario") {
        Some(AutonomyScope::CalendarCreate)
    } else if folded.contains("mensaje") {
        Some(AutonomyScope::MessageReply)
    } else if folded.contains("tarea") {
        Some(AutonomyScope::TasksManage)
    } else {
        None
    }
}

fn is_trivial(folded: &str) -> bool {
    folded.is_empty() || GREETINGS.contains(&folded) || folded.split_whitespace().count() <= 1
}

pub fn should_use_llm(text: &str) -> bool {
    let folded = fold(text);
    !is_trivial(&folded) && LLM_KEYWORDS.iter().any(|k| folded.contains(k))
}

pub fn should_skip_request_prompt(text: &str) -> bool {
    let folded = fold(text);
    folded == "ok" || is_trivial(&folded)
}

pub fn is_memory_question(folded: &str) -> bool {
    MEMORY_KEYWORDS.iter().any(|k| folded.contains(k))
}

pub fn mentions_usual_place(folded: &str) -> bool {
    folded.contains("de siempre") || folded.contains("lugar de siempre")
}

pub fn extract_tags(text: &str) -> Vec<String> {
    let folded = fold(text);
    TAG_RULES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| folded.contains(k)))
        .map(|(tag, _)| tag.to_string())
        .collect()
}

pub fn tag_label(tag: &str) -> &str {
    match tag {
        "fletes" => "servicio de fletes",
        "camionetas" => "camioneta",
        "ascend" => "dietetica",
        other => other,
    }
}

/// Keeps at most `max_len` characters, ending in "..." when cut.
pub fn truncate(text: &str, max_len: usize) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= max_len {
        return cleaned;
    }
    let kept: String = cleaned.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub fn words_after(text: &str, skip: usize) -> Option<String> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() <= skip {
        return None;
    }
    Some(parts[skip..].join(" "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HabitSchedule {
    pub kind: ScheduleKind,
    pub target_per_week: Option<u32>,
    pub days: Vec<u32>,
}

pub fn parse_habit_schedule(text: &str) -> HabitSchedule {
    let folded = fold(text);
    let target_per_week = WEEKLY_TARGET
        .captures(&folded)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|v| *v > 0);
    let words: Vec<&str> = folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mut days: Vec<u32> = DAY_NAMES
        .iter()
        .filter(|(name, _)| words.contains(name))
        .map(|(_, idx)| *idx)
        .collect();
    days.sort_unstable();
    days.dedup();

    let kind = if !days.is_empty() {
        ScheduleKind::Scheduled
    } else if target_per_week.is_some() {
        ScheduleKind::Weekly
    } else {
        ScheduleKind::Daily
    };
    HabitSchedule {
        kind,
        target_per_week,
        days,
    }
}

pub fn clean_habit_name(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in HABIT_NAME_NOISE.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactCommand {
    Label { identifier: String, label: String },
    Level { identifier: String, level: i64 },
    AutoReply { identifier: String, enabled: bool },
}

pub fn parse_contact_command(folded: &str) -> Option<ContactCommand> {
    if let Some(caps) = CONTACT_LABEL.captures(folded) {
        return Some(ContactCommand::Label {
            identifier: caps[1].trim().to_string(),
            label: caps[2].trim().to_string(),
        });
    }
    if let Some(caps) = CONTACT_LEVEL.captures(folded) {
        let level = caps[2].parse::<i64>().ok()?;
        return Some(ContactCommand::Level {
            identifier: caps[1].trim().to_string(),
            level,
        });
    }
    if let Some(caps) = AUTO_REPLY.captures(folded) {
        return Some(ContactCommand::AutoReply {
            identifier: caps[2].trim().to_string(),
            enabled: &caps[1] == "on",
        });
    }
    None
}

pub fn remaining_hm(until: DateTime<Utc>, now: DateTime<Utc>) -> Option<(i64, i64)> {
    let delta = until - now;
    if delta <= Duration::zero() {
        return None;
    }
    let minutes = delta.num_minutes();
    Some((minutes / 60, minutes % 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tz() -> Tz {
        "America/Argentina/Buenos_Aires".parse().unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    #[test]
    fn fold_strips_accents_and_case() {
        assert_eq!(fold("  Mañana  a las 16 "), "manana a las 16");
        assert_eq!(fold("Dietética Ascend"), "dietetica ascend");
        assert_eq!(fold("ok 👍"), "ok");
    }

    #[test]
    fn date_keywords_and_iso_dates() {
        assert_eq!(
            parse_date("manana 16", today()),
            NaiveDate::from_ymd_opt(2026, 3, 11)
        );
        assert_eq!(parse_date("hoy", today()), Some(today()));
        assert_eq!(
            parse_date("el 2026-04-02 a las 9", today()),
            NaiveDate::from_ymd_opt(2026, 4, 2)
        );
        assert_eq!(parse_date("2026-02-31", today()), None);
        assert_eq!(parse_date("la semana que viene", today()), None);
    }

    #[test]
    fn time_prefers_clock_then_bare_hour() {
        assert_eq!(parse_time("hoy 16:30"), NaiveTime::from_hms_opt(16, 30, 0));
        assert_eq!(parse_time("manana 16"), NaiveTime::from_hms_opt(16, 0, 0));
        assert_eq!(
            parse_time("2026-03-12 por 45 min a las 10"),
            NaiveTime::from_hms_opt(10, 0, 0)
        );
        assert_eq!(parse_time("sin hora"), None);
    }

    #[test]
    fn datetime_needs_date_and_time() {
        let start = parse_datetime("agendar dentista mañana 16", today(), tz()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 11, 19, 0, 0).unwrap());
        assert!(parse_datetime("agendar dentista 16", today(), tz()).is_none());
        assert!(parse_datetime("agendar dentista manana", today(), tz()).is_none());
    }

    #[test]
    fn durations_ints_and_choices() {
        assert_eq!(parse_duration("por 45 min"), Some(45));
        assert_eq!(parse_duration("90 minutos"), Some(90));
        assert_eq!(parse_duration("0 min"), None);
        assert_eq!(parse_int("dale, 60"), Some(60));
        assert_eq!(parse_int("0"), None);
        assert_eq!(parse_choice("la 2"), Some(1));
        assert_eq!(parse_choice("3"), None);
    }

    #[test]
    fn title_drops_schedule_noise() {
        assert_eq!(
            extract_title("Agendar dentista mañana a las 16 por 30 min"),
            "dentista"
        );
        assert_eq!(extract_title("agendá 2026-03-12 10:30"), "Sin titulo");
    }

    #[test]
    fn schedule_request_collects_slots() {
        let draft = parse_schedule_request("agendar corte de pelo hoy 18 por 30 min", today(), tz())
            .unwrap();
        assert_eq!(draft.title, "corte de pelo");
        assert!(draft.start.is_some());
        assert_eq!(draft.duration_minutes, Some(30));
        assert!(parse_schedule_request("hola que tal", today(), tz()).is_none());
    }

    #[test]
    fn list_request_defaults_to_today() {
        assert_eq!(parse_list_request("Qué tengo?", today()), Some(today()));
        assert_eq!(
            parse_list_request("que hay manana", today()),
            today().succ_opt()
        );
        assert_eq!(parse_list_request("agendar algo", today()), None);
    }

    #[test]
    fn llm_gate_skips_greetings_and_single_words() {
        assert!(!should_use_llm("hola"));
        assert!(!should_use_llm("agendame"));
        assert!(should_use_llm("necesito mover la reunion"));
        assert!(!should_use_llm("que lindo dia"));
        assert!(should_skip_request_prompt("ok"));
        assert!(should_skip_request_prompt("Buen día"));
        assert!(!should_skip_request_prompt("que tal todo"));
    }

    #[test]
    fn tags_follow_keyword_rules() {
        assert_eq!(
            extract_tags("Turno en la peluquería de siempre"),
            vec!["peluqueria".to_string(), "agenda".to_string()]
        );
        assert!(extract_tags("nada que ver").is_empty());
    }

    #[test]
    fn habit_schedule_reads_days_and_targets() {
        let weekly = parse_habit_schedule("correr 3 veces por semana");
        assert_eq!(weekly.kind, ScheduleKind::Weekly);
        assert_eq!(weekly.target_per_week, Some(3));

        let scheduled = parse_habit_schedule("gimnasio lunes miércoles vie");
        assert_eq!(scheduled.kind, ScheduleKind::Scheduled);
        assert_eq!(scheduled.days, vec![0, 2, 4]);

        let daily = parse_habit_schedule("meditar");
        assert_eq!(daily.kind, ScheduleKind::Daily);
        assert!(daily.days.is_empty());

        assert_eq!(clean_habit_name("gimnasio lunes miercoles"), "gimnasio");
        assert_eq!(clean_habit_name("correr 3 veces por semana"), "correr");
    }

    #[test]
    fn contact_commands_parse() {
        assert_eq!(
            parse_contact_command("contacto juan es proveedor"),
            Some(ContactCommand::Label {
                identifier: "juan".to_string(),
                label: "proveedor".to_string()
            })
        );
        assert_eq!(
            parse_contact_command("subi confianza 5491100@c.us a 80"),
            Some(ContactCommand::Level {
                identifier: "5491100@c.us".to_string(),
                level: 80
            })
        );
        assert_eq!(
            parse_contact_command("auto-reply off juan"),
            Some(ContactCommand::AutoReply {
                identifier: "juan".to_string(),
                enabled: false
            })
        );
        assert_eq!(parse_contact_command("contacto juan"), None);
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("corto", 10), "corto");
        assert_eq!(truncate("abcdefghijkl", 10), "abcdefg...");
    }
}
