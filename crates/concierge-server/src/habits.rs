use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use concierge_contracts::{
    AutonomyMode, AutonomyScope, Habit, HabitLog, HabitLogStatus, SystemConfig,
};
use concierge_kernel::habits::{
    current_streak, daily_summary, default_min_version, format_schedule, log_on,
    nudge_to_credit, record_nudge_success, weekly_report, DEFAULT_HABIT_PRIORITY,
};
use concierge_kernel::text::{clean_habit_name, parse_habit_schedule, words_after, HabitSchedule};
use concierge_kernel::{local_date, local_datetime, local_day_bounds};

use crate::store::StoreBackend;

pub fn list_active(store: &StoreBackend) -> Result<Vec<Habit>, String> {
    let mut habits: Vec<Habit> = store.habits()?.into_iter().filter(|h| h.active).collect();
    habits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(habits)
}

/// Case-insensitive substring match on the habit name, oldest first.
pub fn find_by_name(store: &StoreBackend, query: &str, active_only: bool) -> Result<Vec<Habit>, String> {
    let needle = query.to_lowercase();
    let mut found: Vec<Habit> = store
        .habits()?
        .into_iter()
        .filter(|h| !active_only || h.active)
        .filter(|h| h.name.to_lowercase().contains(&needle))
        .collect();
    found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(found)
}

pub fn create_habit(
    store: &mut StoreBackend,
    name: &str,
    schedule: HabitSchedule,
    config: &SystemConfig,
    now: DateTime<Utc>,
) -> Result<Habit, String> {
    let habit = Habit {
        id: store.next_habit_id()?,
        name: name.to_string(),
        schedule: schedule.kind,
        target_per_week: schedule.target_per_week,
        days: schedule.days,
        window_start: config.strong_window_start,
        window_end: config.strong_window_end,
        min_version: default_min_version(name),
        priority: DEFAULT_HABIT_PRIORITY,
        active: true,
        created_at: now,
    };
    store.save_habit(&habit)?;
    tracing::info!(habit_id = habit.id, name = %habit.name, "habit created");
    Ok(habit)
}

pub fn deactivate_habit(store: &mut StoreBackend, habit: &mut Habit) -> Result<(), String> {
    habit.active = false;
    store.save_habit(habit)
}

fn upsert_log(
    store: &mut StoreBackend,
    habit_id: i64,
    status: HabitLogStatus,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<(HabitLog, bool), String> {
    let today = local_date(now, tz);
    let logs = store.habit_logs()?;
    let was_success = log_on(&logs, habit_id, today)
        .map(|l| l.status.is_success())
        .unwrap_or(false);
    let log = HabitLog {
        habit_id,
        date: today,
        status,
        updated_at: now,
    };
    store.save_habit_log(&log)?;
    Ok((log, was_success))
}

/// Logs today's completion. The first success of the day credits the latest nudge sent today.
pub fn log_done(store: &mut StoreBackend, habit_id: i64, now: DateTime<Utc>, tz: Tz) -> Result<HabitLog, String> {
    let (log, was_success) = upsert_log(store, habit_id, HabitLogStatus::Done, now, tz)?;
    if !was_success {
        let (day_start, _) = local_day_bounds(now, tz);
        if let Some(strategy) = nudge_to_credit(&store.habit_nudges()?, habit_id, day_start) {
            let mut profile = store.coaching_profile()?;
            record_nudge_success(&mut profile, strategy);
            store.save_coaching_profile(&profile)?;
        }
    }
    Ok(log)
}

pub fn log_skip(store: &mut StoreBackend, habit_id: i64, now: DateTime<Utc>, tz: Tz) -> Result<HabitLog, String> {
    upsert_log(store, habit_id, HabitLogStatus::Skipped, now, tz).map(|(log, _)| log)
}

pub fn shift_intensity(store: &mut StoreBackend, up: bool) -> Result<String, String> {
    let mut profile = store.coaching_profile()?;
    profile.intensity = if up {
        profile.intensity.raised()
    } else {
        profile.intensity.lowered()
    };
    store.save_coaching_profile(&profile)?;
    Ok(profile.intensity.as_str().to_string())
}

fn resolve_habit(store: &StoreBackend, name: Option<String>) -> Result<Result<Habit, String>, String> {
    let Some(name) = name else {
        return Ok(Err("Decime el habito.".to_string()));
    };
    let mut matches = find_by_name(store, &name, true)?;
    Ok(match matches.len() {
        0 => Err("No encontre ese habito.".to_string()),
        1 => Ok(matches.remove(0)),
        _ => {
            let names: Vec<&str> = matches.iter().take(5).map(|h| h.name.as_str()).collect();
            Err(format!("Hay varios: {}. Decime cual.", names.join(", ")))
        }
    })
}

/// Chat commands over habits. `None` when the text is not a habit command.
pub fn handle_habit_command(
    store: &mut StoreBackend,
    folded: &str,
    text: &str,
    config: &SystemConfig,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<String>, String> {
    let today = local_date(now, tz);
    let reply = match folded {
        "mis habitos" => {
            let habits = list_active(store)?;
            if habits.is_empty() {
                "No tenes habitos activos.".to_string()
            } else {
                let mut lines = vec!["Habitos activos:".to_string()];
                lines.extend(
                    habits
                        .iter()
                        .map(|h| format!("- {} ({})", h.name, format_schedule(h))),
                );
                lines.join("\n")
            }
        }
        "estado habitos" => {
            let habits = list_active(store)?;
            let summary = daily_summary(&habits, &store.habit_logs()?, today);
            let [done, pending, streaks] = summary.lines();
            format!("Hoy:\n- {done}\n- {pending}\n- {streaks}")
        }
        "resumen habitos" => {
            let habits = list_active(store)?;
            let lines = weekly_report(&habits, &store.habit_logs()?, today);
            if lines.is_empty() {
                "No tenes habitos registrados.".to_string()
            } else {
                let mut reply = vec!["Resumen semanal:".to_string()];
                reply.extend(lines.iter().map(|l| format!("- {l}")));
                reply.join("\n")
            }
        }
        "subi intensidad" => format!("Intensidad actual: {}.", shift_intensity(store, true)?),
        "baja intensidad" => format!("Intensidad actual: {}.", shift_intensity(store, false)?),
        "no me jodas con habitos hoy" => {
            let end_of_day = local_datetime(tz, today, NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN));
            store.add_autonomy_rule(AutonomyScope::Habits, AutonomyMode::Off, Some(end_of_day), now)?;
            "Ok, hoy no te voy a insistir con habitos.".to_string()
        }
        _ if folded.starts_with("crear habito ") => create_command(store, text, config, now)?,
        _ if folded.starts_with("desactivar habito ") => {
            match resolve_habit(store, words_after(text, 2))? {
                Ok(mut habit) => {
                    deactivate_habit(store, &mut habit)?;
                    format!("Habito desactivado: {}.", habit.name)
                }
                Err(message) => message,
            }
        }
        _ if folded.starts_with("hecho ") => match resolve_habit(store, words_after(text, 1))? {
            Ok(habit) => {
                log_done(store, habit.id, now, tz)?;
                let streak = current_streak(&store.habit_logs()?, habit.id, today);
                format!("Listo, registre {}. Racha: {streak}d.", habit.name)
            }
            Err(message) => message,
        },
        _ if folded.starts_with("no hoy ") => match resolve_habit(store, words_after(text, 2))? {
            Ok(habit) => {
                log_skip(store, habit.id, now, tz)?;
                format!("Ok, marcado como no hoy: {}.", habit.name)
            }
            Err(message) => message,
        },
        _ => return Ok(None),
    };
    Ok(Some(reply))
}

fn create_command(
    store: &mut StoreBackend,
    text: &str,
    config: &SystemConfig,
    now: DateTime<Utc>,
) -> Result<String, String> {
    let Some(raw_name) = words_after(text, 2) else {
        return Ok("Decime el nombre del habito.".to_string());
    };
    let schedule = parse_habit_schedule(&raw_name);
    let name = clean_habit_name(&raw_name);
    if name.is_empty() {
        return Ok("Decime el nombre del habito.".to_string());
    }
    let exists = find_by_name(store, &name, false)?
        .iter()
        .any(|h| h.name.to_lowercase() == name.to_lowercase());
    if exists {
        return Ok("Ese habito ya existe.".to_string());
    }
    let habit = create_habit(store, &name, schedule, config, now)?;
    Ok(format!("Listo, cree el habito: {}.", habit.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use concierge_contracts::{HabitNudge, Intensity, NudgeStatus, ScheduleKind, Strategy};
    use concierge_kernel::autonomy::habits_off;

    fn tz() -> Tz {
        "America/Argentina/Buenos_Aires".parse().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()
    }

    fn run(store: &mut StoreBackend, text: &str) -> Option<String> {
        let folded = concierge_kernel::text::fold(text);
        handle_habit_command(store, &folded, text, &SystemConfig::default(), now(), tz()).unwrap()
    }

    #[test]
    fn create_list_and_duplicate() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        assert_eq!(
            run(&mut store, "crear habito Gimnasio 3 veces por semana").as_deref(),
            Some("Listo, cree el habito: Gimnasio.")
        );
        let habit = &store.habits().unwrap()[0];
        assert_eq!(habit.schedule, ScheduleKind::Weekly);
        assert_eq!(habit.target_per_week, Some(3));
        assert_eq!(habit.min_version, "Gimnasio 5 min");
        assert_eq!(habit.priority, 3);
        assert_eq!(
            run(&mut store, "crear habito gimnasio").as_deref(),
            Some("Ese habito ya existe.")
        );
        assert_eq!(
            run(&mut store, "mis habitos").as_deref(),
            Some("Habitos activos:\n- Gimnasio (3 por semana)")
        );
    }

    #[test]
    fn done_credits_todays_nudge_once() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        run(&mut store, "crear habito Leer");
        store
            .add_habit_nudge(&HabitNudge {
                habit_id: 1,
                strategy: Strategy::Reframe,
                status: NudgeStatus::Sent,
                message: "dale".to_string(),
                created_at: now() - chrono::Duration::hours(1),
            })
            .unwrap();
        assert_eq!(
            run(&mut store, "hecho leer").as_deref(),
            Some("Listo, registre Leer. Racha: 1d.")
        );
        run(&mut store, "hecho leer");
        let profile = store.coaching_profile().unwrap();
        assert_eq!(profile.stats[&Strategy::Reframe].done_after, 1);
        assert_eq!(store.habit_logs().unwrap().len(), 1);
    }

    #[test]
    fn ambiguous_and_unknown_names() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        run(&mut store, "crear habito Leer libro");
        run(&mut store, "crear habito Leer diario");
        assert_eq!(
            run(&mut store, "no hoy leer").as_deref(),
            Some("Hay varios: Leer libro, Leer diario. Decime cual.")
        );
        assert_eq!(
            run(&mut store, "desactivar habito correr").as_deref(),
            Some("No encontre ese habito.")
        );
        assert_eq!(run(&mut store, "hola"), None);
    }

    #[test]
    fn intensity_and_habits_off() {
        let mut store = StoreBackend::open("memory", None).unwrap();
        assert_eq!(run(&mut store, "subi intensidad").as_deref(), Some("Intensidad actual: high."));
        run(&mut store, "subi intensidad");
        assert_eq!(store.coaching_profile().unwrap().intensity, Intensity::High);
        run(&mut store, "no me jodas con habitos hoy");
        assert!(habits_off(&store.autonomy_rules().unwrap(), now()));
    }
}
