use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use concierge_contracts::{
    CoachingProfile, Habit, HabitLog, HabitNudge, Intensity, NudgeStatus, ScheduleKind, Strategy,
    TriggerType,
};

pub const HABIT_PRIORITY_HIGH: i64 = 4;
pub const HABIT_STREAK_DAYS: i64 = 2;
pub const HABIT_WINDOW_GRACE_MINUTES: i64 = 60;
pub const DEFAULT_HABIT_PRIORITY: i64 = 3;

const DAY_LABELS: [&str; 7] = ["lun", "mar", "mie", "jue", "vie", "sab", "dom"];

pub fn week_bounds(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    (start, start + Duration::days(7))
}

fn habit_logs<'a>(logs: &'a [HabitLog], habit_id: i64) -> impl Iterator<Item = &'a HabitLog> {
    logs.iter().filter(move |l| l.habit_id == habit_id)
}

pub fn log_on(logs: &[HabitLog], habit_id: i64, day: NaiveDate) -> Option<&HabitLog> {
    habit_logs(logs, habit_id).find(|l| l.date == day)
}

pub fn successes_between(logs: &[HabitLog], habit_id: i64, start: NaiveDate, end: NaiveDate) -> usize {
    habit_logs(logs, habit_id)
        .filter(|l| l.date >= start && l.date < end && l.status.is_success())
        .count()
}

pub fn last_success(logs: &[HabitLog], habit_id: i64) -> Option<NaiveDate> {
    habit_logs(logs, habit_id)
        .filter(|l| l.status.is_success())
        .map(|l| l.date)
        .max()
}

/// Consecutive successful days ending today; a day without success breaks the run.
pub fn current_streak(logs: &[HabitLog], habit_id: i64, today: NaiveDate) -> u32 {
    let mut streak = 0;
    let mut cursor = today;
    while log_on(logs, habit_id, cursor)
        .map(|l| l.status.is_success())
        .unwrap_or(false)
    {
        streak += 1;
        match cursor.pred_opt() {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    streak
}

pub fn is_due(habit: &Habit, logs: &[HabitLog], today: NaiveDate) -> bool {
    match habit.schedule {
        ScheduleKind::Daily => true,
        ScheduleKind::Scheduled => {
            habit.days.is_empty() || habit.days.contains(&today.weekday().num_days_from_monday())
        }
        ScheduleKind::Weekly => match habit.target_per_week {
            None => true,
            Some(target) => {
                let (start, end) = week_bounds(today);
                successes_between(logs, habit.id, start, end) < target as usize
            }
        },
    }
}

fn weekly_target_at_risk(habit: &Habit, logs: &[HabitLog], today: NaiveDate) -> bool {
    let Some(target) = habit.target_per_week else {
        return false;
    };
    let (start, end) = week_bounds(today);
    let done = successes_between(logs, habit.id, start, end) as i64;
    let remaining_days = (end - today).num_days().max(0);
    i64::from(target) > done + remaining_days
}

fn window_closing(habit: &Habit, now: NaiveTime) -> bool {
    if now < habit.window_start || now > habit.window_end {
        return false;
    }
    habit.window_end.signed_duration_since(now) <= Duration::minutes(HABIT_WINDOW_GRACE_MINUTES)
}

/// Picks the first matching nudge trigger with its score bonus.
pub fn habit_trigger(
    habit: &Habit,
    logs: &[HabitLog],
    today: NaiveDate,
    now: NaiveTime,
) -> Option<(TriggerType, i64)> {
    if habit.priority >= HABIT_PRIORITY_HIGH {
        let stale = match last_success(logs, habit.id) {
            None => true,
            Some(day) => (today - day).num_days() >= HABIT_STREAK_DAYS,
        };
        if stale {
            return Some((TriggerType::HabitStreakRisk, 10));
        }
    }
    if habit.schedule == ScheduleKind::Weekly && weekly_target_at_risk(habit, logs, today) {
        return Some((TriggerType::HabitWeeklyRisk, 5));
    }
    if window_closing(habit, now) {
        return Some((TriggerType::HabitWindow, 0));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyChoice {
    pub strategy: Strategy,
    pub score: i64,
}

pub fn allowed_strategies(intensity: Intensity) -> Vec<Strategy> {
    let mut allowed = vec![Strategy::MicroAction, Strategy::Frictionless];
    if matches!(intensity, Intensity::Medium | Intensity::High) {
        allowed.push(Strategy::Reframe);
    }
    if intensity == Intensity::High {
        allowed.push(Strategy::Contract);
        allowed.push(Strategy::Humor);
    }
    allowed
}

fn effectiveness_adjustment(profile: &CoachingProfile, strategy: Strategy) -> i64 {
    let Some(stats) = profile.stats.get(&strategy) else {
        return 0;
    };
    if stats.sent < 3 {
        return 0;
    }
    let rate = f64::from(stats.done_after) / f64::from(stats.sent.max(1));
    if rate >= 0.6 {
        5
    } else if rate <= 0.3 {
        -5
    } else {
        0
    }
}

pub fn select_strategy(
    profile: &CoachingProfile,
    habit: &Habit,
    last_strategy: Option<Strategy>,
) -> StrategyChoice {
    let mut allowed = allowed_strategies(profile.intensity);
    if let Some(last) = last_strategy {
        if allowed.len() > 1 {
            allowed.retain(|s| *s != last);
        }
    }
    let base = 50 + habit.priority.clamp(1, 5) * 5;
    let mut best = StrategyChoice {
        strategy: allowed[0],
        score: base + effectiveness_adjustment(profile, allowed[0]),
    };
    for strategy in allowed.iter().skip(1) {
        let score = base + effectiveness_adjustment(profile, *strategy);
        if score > best.score {
            best = StrategyChoice {
                strategy: *strategy,
                score,
            };
        }
    }
    best.score = best.score.clamp(40, 95);
    best
}

pub fn record_nudge_sent(profile: &mut CoachingProfile, strategy: Strategy) {
    profile.stats.entry(strategy).or_default().sent += 1;
}

pub fn record_nudge_success(profile: &mut CoachingProfile, strategy: Strategy) {
    profile.stats.entry(strategy).or_default().done_after += 1;
}

/// Strategy of the latest sent nudge for the habit since `since`, the one a completion is credited to.
pub fn nudge_to_credit(nudges: &[HabitNudge], habit_id: i64, since: DateTime<Utc>) -> Option<Strategy> {
    nudges
        .iter()
        .filter(|n| n.habit_id == habit_id && n.status == NudgeStatus::Sent && n.created_at >= since)
        .max_by_key(|n| n.created_at)
        .map(|n| n.strategy)
}

pub fn last_nudge_strategy(nudges: &[HabitNudge], habit_id: i64) -> Option<Strategy> {
    nudges
        .iter()
        .filter(|n| n.habit_id == habit_id)
        .max_by_key(|n| n.created_at)
        .map(|n| n.strategy)
}

fn min_version(habit: &Habit) -> &str {
    if habit.min_version.trim().is_empty() {
        &habit.name
    } else {
        &habit.min_version
    }
}

pub fn default_min_version(name: &str) -> String {
    format!("{name} 5 min")
}

pub fn template_message(habit: &Habit, strategy: Strategy, profile: &CoachingProfile) -> String {
    let prefix = match profile.style.to_lowercase().as_str() {
        "directo" => "",
        "humor" => "Mini desafio: ",
        _ => "Buen dia. ",
    };
    let min = min_version(habit);
    match strategy {
        Strategy::MicroAction => {
            format!("{prefix}Hacemos la version minima: {min}? Queres que lo marque como hecho?")
        }
        Strategy::Frictionless => format!("{prefix}Plan rapido: {min}. Te lo marco cuando lo hagas?"),
        Strategy::Reframe => {
            format!("{prefix}Un paso chico mantiene el habito: {min}. Lo hacemos ahora?")
        }
        Strategy::Contract => {
            format!("{prefix}Te propongo un acuerdo: {min} y listo por hoy. Te sirve?")
        }
        Strategy::Humor => format!("{prefix}Modo express: {min}. Dos minutos y seguimos, te va?"),
    }
}

pub const NUDGE_SYSTEM_PROMPT: &str = "Sos una secretaria profesional con empuje. \
Redacta un recordatorio breve (max 2 frases) sin juzgar ni manipular. \
No des consejos medicos ni psicologicos. \
Devuelve solo el mensaje final, sin markdown extra.";

pub fn nudge_user_prompt(habit: &Habit, strategy: Strategy, profile: &CoachingProfile) -> String {
    format!(
        "Habito: {}\nEstrategia: {}\nVersion minima: {}\nEstilo: {}\nIncluir una pregunta corta al final.",
        habit.name,
        strategy.as_str(),
        min_version(habit),
        profile.style
    )
}

/// Uses the rewritten text when there is one, the template otherwise.
pub fn finalize_nudge(rewritten: Option<String>, template: String) -> String {
    match rewritten.map(|t| t.trim().to_string()) {
        Some(text) if !text.is_empty() => text,
        _ => template,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailySummary {
    pub done: Vec<String>,
    pub pending: Vec<String>,
    pub streaks: Vec<String>,
}

impl DailySummary {
    pub fn lines(&self) -> [String; 3] {
        let join = |items: &[String]| {
            if items.is_empty() {
                "-".to_string()
            } else {
                items.join(", ")
            }
        };
        [
            format!("Cumplidos: {}", join(&self.done)),
            format!("Pendientes: {}", join(&self.pending)),
            format!("Rachas: {}", join(&self.streaks)),
        ]
    }
}

pub fn daily_summary(habits: &[Habit], logs: &[HabitLog], today: NaiveDate) -> DailySummary {
    let mut summary = DailySummary::default();
    for habit in habits.iter().filter(|h| h.active) {
        let success_today = log_on(logs, habit.id, today)
            .map(|l| l.status.is_success())
            .unwrap_or(false);
        if success_today {
            summary.done.push(habit.name.clone());
        } else if is_due(habit, logs, today) {
            summary.pending.push(habit.name.clone());
        }
        let streak = current_streak(logs, habit.id, today);
        if streak >= 2 {
            summary.streaks.push(format!("{} {streak}d", habit.name));
        }
    }
    summary
}

pub fn weekly_report(habits: &[Habit], logs: &[HabitLog], today: NaiveDate) -> Vec<String> {
    let (start, end) = week_bounds(today);
    habits
        .iter()
        .filter(|h| h.active)
        .map(|habit| {
            let done = successes_between(logs, habit.id, start, end);
            let streak = current_streak(logs, habit.id, today);
            let progress = match habit.target_per_week {
                Some(target) => format!("{done}/{target}"),
                None => done.to_string(),
            };
            format!("{}: {progress}, racha {streak}d", habit.name)
        })
        .collect()
}

pub fn format_schedule(habit: &Habit) -> String {
    match (habit.schedule, habit.target_per_week) {
        (ScheduleKind::Weekly, Some(target)) => format!("{target} por semana"),
        (ScheduleKind::Scheduled, _) if !habit.days.is_empty() => habit
            .days
            .iter()
            .filter_map(|d| DAY_LABELS.get(*d as usize))
            .copied()
            .collect::<Vec<_>>()
            .join(","),
        _ => "diario".to_string(),
    }
}
