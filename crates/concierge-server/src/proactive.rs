use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use concierge_contracts::{
    Decision, Digest, HabitNudge, NudgeStatus, ProactiveEvent, SystemConfig, TriggerType,
    FACT_MIN_CONFIDENCE,
};
use concierge_kernel::autonomy::{global_mode, habits_off};
use concierge_kernel::habits::{
    daily_summary, habit_trigger, is_due, last_nudge_strategy, log_on, nudge_user_prompt,
    record_nudge_sent, select_strategy, finalize_nudge, template_message, NUDGE_SYSTEM_PROMPT,
};
use concierge_kernel::proactive::{
    calendar_candidate, calendar_digest_label, decide, digest_requests, fallback_digest_label,
    format_digest, habit_candidate, rank, request_digest_label, task_candidate,
    thread_candidate, thread_digest_label, Candidate, LOOKAHEAD_MINUTES,
};
use concierge_kernel::{local_date, local_day_bounds, local_time};

use crate::audit::AuditRecord;
use crate::habits::list_active;
use crate::store::StoreBackend;
use crate::AppState;

fn nudge_status(decision: Decision) -> NudgeStatus {
    match decision {
        Decision::Sent => NudgeStatus::Sent,
        Decision::Digested => NudgeStatus::Digested,
        Decision::Suppressed => NudgeStatus::Suppressed,
    }
}

pub fn sent_today(events: &[ProactiveEvent], start: DateTime<Utc>, end: DateTime<Utc>) -> u32 {
    events
        .iter()
        .filter(|e| e.sent_at.map(|at| at >= start && at < end).unwrap_or(false))
        .count() as u32
}

/// Whether a candidate of the same trigger type was sent within the cooldown.
pub fn in_cooldown(
    events: &[ProactiveEvent],
    trigger: TriggerType,
    cooldown_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    let since = now - Duration::minutes(cooldown_minutes);
    events.iter().any(|e| {
        e.trigger_type == trigger
            && e.decision == Decision::Sent
            && e.sent_at.map(|at| at >= since).unwrap_or(false)
    })
}

/// The configured user chat, else the chat learned from a confident `user_chat_id` fact.
pub fn resolve_destination(
    store: &StoreBackend,
    configured: Option<&str>,
) -> Result<Option<String>, String> {
    if let Some(chat_id) = configured {
        return Ok(Some(chat_id.to_string()));
    }
    Ok(store
        .fact("user_chat_id")?
        .filter(|f| f.confidence >= FACT_MIN_CONFIDENCE)
        .map(|f| f.value))
}

/// Habit nudge bookkeeping after a decision. Only sent nudges count towards the strategy stats.
fn record_nudge(
    store: &mut StoreBackend,
    candidate: &Candidate,
    decision: Decision,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let (Some(strategy), Ok(habit_id)) = (candidate.strategy, candidate.entity_id.parse::<i64>())
    else {
        return Ok(());
    };
    store.add_habit_nudge(&HabitNudge {
        habit_id,
        strategy,
        status: nudge_status(decision),
        message: candidate.message.clone(),
        created_at: now,
    })?;
    if decision == Decision::Sent {
        let mut profile = store.coaching_profile()?;
        record_nudge_sent(&mut profile, strategy);
        store.save_coaching_profile(&profile)?;
    }
    Ok(())
}

/// Digest lines for digested non-habit events, resolved to human labels where possible.
fn digest_lines(
    store: &StoreBackend,
    events: &[ProactiveEvent],
    calendar_labels: &HashMap<String, String>,
) -> Result<Vec<String>, String> {
    let tasks = store.tasks()?;
    let mut lines = Vec::new();
    for event in events.iter().filter(|e| !e.trigger_type.is_habit()) {
        let label = match event.trigger_type {
            TriggerType::CalendarUpcoming => calendar_labels.get(&event.entity_id).cloned(),
            TriggerType::TaskDueToday => tasks
                .iter()
                .find(|t| t.id == event.entity_id)
                .map(|t| format!("Tarea: {}", t.title)),
            TriggerType::ThreadWaitingMe => {
                let thread = match event.entity_id.parse::<i64>() {
                    Ok(id) => store.thread(id)?,
                    Err(_) => None,
                };
                match thread {
                    Some(thread) => store
                        .contact(&thread.contact_chat_id)?
                        .map(|contact| thread_digest_label(&thread, &contact)),
                    None => None,
                }
            }
            _ => None,
        };
        lines.push(label.unwrap_or_else(|| fallback_digest_label(event)));
    }
    Ok(lines)
}

impl AppState {
    async fn destination(&self) -> Result<Option<String>, String> {
        let configured = self.user_chat_id();
        self.with_store(|s| resolve_destination(s, configured)).await
    }

    /// Inserts the event; the audit record is written only for a first insert.
    pub(crate) async fn record_proactive(&self, event: ProactiveEvent) -> Result<bool, String> {
        let inserted = self.with_store(|s| s.insert_proactive_event(&event)).await?;
        if inserted {
            self.audit.append(AuditRecord::proactive(&event)).await?;
        }
        Ok(inserted)
    }

    async fn candidates(&self, config: &SystemConfig, now: DateTime<Utc>) -> Result<Vec<Candidate>, String> {
        let tz = self.tz;
        let mut candidates = Vec::new();

        match self
            .calendar
            .list_events(now, now + Duration::minutes(LOOKAHEAD_MINUTES))
            .await
        {
            Ok(events) => candidates.extend(events.iter().filter_map(|e| calendar_candidate(e, now))),
            Err(e) => tracing::warn!(error = %e, "calendar candidates skipped"),
        }

        let (tasks, threads, contacts, habits, logs, nudges, profile) = self
            .with_store(|s| {
                Ok((
                    s.tasks()?,
                    s.threads()?,
                    s.contacts()?,
                    list_active(s)?,
                    s.habit_logs()?,
                    s.habit_nudges()?,
                    s.coaching_profile()?,
                ))
            })
            .await?;
        candidates.extend(tasks.iter().filter_map(|t| task_candidate(t, now, tz)));
        candidates.extend(threads.iter().filter_map(|thread| {
            let contact = contacts.iter().find(|c| c.chat_id == thread.contact_chat_id)?;
            thread_candidate(thread, contact, now)
        }));

        let today = local_date(now, tz);
        let clock = local_time(now, tz);
        for habit in &habits {
            if log_on(&logs, habit.id, today).is_some() || !is_due(habit, &logs, today) {
                continue;
            }
            let Some((trigger, bonus)) = habit_trigger(habit, &logs, today, clock) else {
                continue;
            };
            let choice = select_strategy(&profile, habit, last_nudge_strategy(&nudges, habit.id));
            let template = template_message(habit, choice.strategy, &profile);
            let rewritten = self
                .text_llm
                .generate_text(
                    &config.llm,
                    NUDGE_SYSTEM_PROMPT,
                    &nudge_user_prompt(habit, choice.strategy, &profile),
                )
                .await;
            candidates.push(habit_candidate(
                habit.id,
                &habit.name,
                habit.priority,
                trigger,
                bonus,
                choice.strategy,
                choice.score,
                finalize_nudge(rewritten, template),
                today,
            ));
        }

        rank(&mut candidates);
        Ok(candidates)
    }

    /// One proactive pass. Returns how many messages were sent.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, String> {
        let config = self.system_config().await?;
        let candidates = self.candidates(&config, now).await?;
        let destination = self.destination().await?;
        let (day_start, day_end) = local_day_bounds(now, self.tz);
        let clock = local_time(now, self.tz);
        let mut sent_count = 0;

        let (mut sent_so_far, rules) = self
            .with_store(|s| Ok((sent_today(&s.proactive_events()?, day_start, day_end), s.autonomy_rules()?)))
            .await?;
        let mode = global_mode(&rules, now).mode;
        let habits_suppressed = habits_off(&rules, now);

        for candidate in candidates {
            let seen = self
                .with_store(|s| {
                    if s.has_proactive_event(&candidate.dedupe_key)? {
                        return Ok(None);
                    }
                    let events = s.proactive_events()?;
                    Ok(Some(in_cooldown(&events, candidate.trigger_type, config.cooldown_minutes, now)))
                })
                .await?;
            let Some(cooling) = seen else {
                continue;
            };

            let verdict = decide(candidate.score, clock, &config, mode, sent_so_far, cooling);
            let (mut decision, mut reason) = (verdict.decision, verdict.reason);
            if candidate.trigger_type.is_habit() && habits_suppressed {
                (decision, reason) = (Decision::Suppressed, "habits_off");
            }

            if decision != Decision::Sent {
                self.record_proactive(candidate.record(decision, reason, None, now)).await?;
                self.with_store(|s| record_nudge(s, &candidate, decision, now)).await?;
                continue;
            }

            let Some(chat_id) = destination.as_deref() else {
                self.record_proactive(candidate.record(Decision::Suppressed, "no_contact", None, now))
                    .await?;
                self.with_store(|s| record_nudge(s, &candidate, Decision::Suppressed, now)).await?;
                continue;
            };
            if !self.send_and_store(chat_id, &candidate.message, now).await? {
                self.record_proactive(candidate.record(Decision::Suppressed, "send_failed", None, now))
                    .await?;
                self.with_store(|s| record_nudge(s, &candidate, Decision::Suppressed, now)).await?;
                continue;
            }
            self.record_proactive(candidate.record(Decision::Sent, reason, Some(now), now))
                .await?;
            self.with_store(|s| record_nudge(s, &candidate, Decision::Sent, now)).await?;
            tracing::info!(dedupe_key = %candidate.dedupe_key, reason, "proactive message sent");
            sent_so_far += 1;
            sent_count += 1;
        }
        Ok(sent_count)
    }

    /// Sends the daily digest at most once per local day. Returns 1 when a digest was produced.
    pub async fn daily_digest(&self, now: DateTime<Utc>) -> Result<usize, String> {
        let _digest = self.digest_guard.lock().await;
        let day = local_date(now, self.tz);
        let existing = self.with_store(|s| s.digest(day)).await?;
        if existing.map(|d| d.sent_at.is_some()).unwrap_or(false) {
            return Ok(0);
        }
        let Some(chat_id) = self.destination().await? else {
            return Ok(0);
        };

        let (day_start, day_end) = local_day_bounds(now, self.tz);
        let (events, request_lines, habit_lines) = self
            .with_store(|s| {
                let events: Vec<ProactiveEvent> = s
                    .proactive_events()?
                    .into_iter()
                    .filter(|e| {
                        e.decision == Decision::Digested
                            && e.created_at >= day_start
                            && e.created_at < day_end
                    })
                    .collect();
                let requests = s.requests()?;
                let request_lines: Vec<String> = digest_requests(&requests, &chat_id)
                    .into_iter()
                    .map(request_digest_label)
                    .collect();
                let habits = list_active(s)?;
                let habit_lines = if habits.is_empty() {
                    Vec::new()
                } else {
                    daily_summary(&habits, &s.habit_logs()?, day).lines().to_vec()
                };
                Ok((events, request_lines, habit_lines))
            })
            .await?;
        if events.is_empty() && request_lines.is_empty() && habit_lines.is_empty() {
            return Ok(0);
        }

        let calendar_labels: HashMap<String, String> = match self.calendar.list_events(day_start, day_end).await {
            Ok(listed) => listed
                .iter()
                .filter(|e| !e.id.is_empty())
                .map(|e| (e.id.clone(), calendar_digest_label(e, self.tz)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "calendar digest labels skipped");
                HashMap::new()
            }
        };
        let lines = self
            .with_store(|s| digest_lines(s, &events, &calendar_labels))
            .await?;
        let content = format_digest(&lines, &request_lines, &habit_lines);

        let delivered = self.send_and_store(&chat_id, &content, now).await?;
        let digest = Digest {
            date: day,
            content,
            sent_at: delivered.then_some(now),
        };
        self.with_store(|s| s.save_digest(&digest)).await?;
        tracing::info!(date = %day, delivered, "daily digest produced");
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, test_state, FakeCalendar, RecordingTransport, ScriptedPlanner};
    use chrono::{NaiveTime, TimeZone};
    use concierge_contracts::{CalendarEvent, Habit, ScheduleKind, Task};

    fn upcoming(start: DateTime<Utc>) -> CalendarEvent {
        CalendarEvent {
            id: "evt-9".to_string(),
            title: "Dentista".to_string(),
            start,
            end: start + Duration::minutes(30),
            all_day: false,
            location: None,
            link: None,
        }
    }

    async fn learn_user_chat(state: &AppState, now: DateTime<Utc>) {
        state
            .with_store(|s| s.upsert_fact("user_chat_id", "u@c.us", 90, now))
            .await
            .unwrap();
    }

    async fn pay_bill_task(state: &AppState, due_at: DateTime<Utc>) {
        state
            .with_store(|s| {
                s.save_task(&Task {
                    id: "t1".to_string(),
                    title: "Pagar luz".to_string(),
                    due_at: Some(due_at),
                    priority: 1,
                    status: "open".to_string(),
                })
            })
            .await
            .unwrap();
    }

    fn walking_habit(created_at: DateTime<Utc>) -> Habit {
        Habit {
            id: 1,
            name: "Caminar".to_string(),
            schedule: ScheduleKind::Daily,
            target_per_week: None,
            days: Vec::new(),
            window_start: NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
            min_version: "Caminar 5 min".to_string(),
            priority: 5,
            active: true,
            created_at,
        }
    }

    #[tokio::test]
    async fn no_destination_suppresses_sends() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let calendar = FakeCalendar::authorized(vec![upcoming(now + Duration::minutes(8))]);
        let harness = test_state(calendar, ScriptedPlanner::fallback()).await;
        assert_eq!(harness.state.tick(now).await.unwrap(), 0);
        let events = harness.state.with_store(|s| s.proactive_events()).await.unwrap();
        assert_eq!(events[0].decision, Decision::Suppressed);
        assert_eq!(events[0].reason, "no_contact");
        assert!(harness.transport.sent().is_empty());
    }

    #[test]
    fn cooldown_only_counts_sent_events_of_the_same_type() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let candidate = Candidate {
            trigger_type: TriggerType::TaskDueToday,
            entity_id: "t1".to_string(),
            title: "Pagar".to_string(),
            score: 60,
            priority: None,
            dedupe_key: "task:t1:due_today".to_string(),
            message: "Hoy vence".to_string(),
            strategy: None,
        };
        let sent = candidate.record(Decision::Sent, "maybe", Some(now - Duration::minutes(30)), now);
        let digested = candidate.record(Decision::Digested, "cooldown", None, now);
        let events = vec![sent, digested];
        assert!(in_cooldown(&events, TriggerType::TaskDueToday, 240, now));
        assert!(!in_cooldown(&events, TriggerType::CalendarUpcoming, 240, now));
        assert!(!in_cooldown(&events, TriggerType::TaskDueToday, 20, now));
        assert_eq!(sent_today(&events, now - Duration::hours(2), now + Duration::hours(1)), 1);
    }

    #[tokio::test]
    async fn urgent_event_is_sent_once_and_deduplicated() {
        // 15:00 local.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let calendar = FakeCalendar::authorized(vec![upcoming(now + Duration::minutes(8))]);
        let harness = test_state(calendar, ScriptedPlanner::fallback()).await;
        learn_user_chat(&harness.state, now).await;
        assert_eq!(harness.state.tick(now).await.unwrap(), 1);
        assert_eq!(harness.state.tick(now).await.unwrap(), 0);
        assert_eq!(harness.transport.sent().len(), 1);
        let events = harness.state.with_store(|s| s.proactive_events()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, Decision::Sent);
    }

    #[tokio::test]
    async fn quiet_hours_digest_then_daily_digest_is_idempotent() {
        // 05:00 local, inside the default quiet hours.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap();
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        learn_user_chat(&harness.state, now).await;
        pay_bill_task(&harness.state, now + Duration::hours(10)).await;
        assert_eq!(harness.state.tick(now).await.unwrap(), 0);
        let events = harness.state.with_store(|s| s.proactive_events()).await.unwrap();
        assert_eq!(events[0].decision, Decision::Digested);
        assert_eq!(events[0].reason, "quiet_hours");

        let evening = now + Duration::hours(13);
        assert_eq!(harness.state.daily_digest(evening).await.unwrap(), 1);
        let sent = harness.transport.sent();
        assert!(sent[0].1.starts_with("Resumen de hoy:\n- Tarea: Pagar luz"), "{}", sent[0].1);
        assert_eq!(harness.state.daily_digest(evening).await.unwrap(), 0);
        assert_eq!(harness.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_suppressed_and_not_counted() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let calendar = FakeCalendar::authorized(vec![upcoming(now + Duration::minutes(8))]);
        let harness = harness(
            calendar,
            ScriptedPlanner::fallback(),
            RecordingTransport::failing(),
            Some("u@c.us"),
        )
        .await;
        assert_eq!(harness.state.tick(now).await.unwrap(), 0);
        assert_eq!(harness.transport.sent().len(), 1);

        let events = harness.state.with_store(|s| s.proactive_events()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].decision, Decision::Suppressed);
        assert_eq!(events[0].reason, "send_failed");
        assert!(events[0].sent_at.is_none());
        let (start, end) = local_day_bounds(now, harness.state.tz);
        assert_eq!(sent_today(&events, start, end), 0);

        let stored = harness.state.with_store(|s| s.messages()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].raw["error"].as_str().map(|e| e.contains("http 502")), Some(true));
    }

    #[tokio::test]
    async fn undelivered_habit_nudge_is_recorded_as_suppressed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap();
        let harness = test_state(FakeCalendar::authorized(vec![]), ScriptedPlanner::fallback()).await;
        harness
            .state
            .with_store(|s| s.save_habit(&walking_habit(now - Duration::days(7))))
            .await
            .unwrap();
        assert_eq!(harness.state.tick(now).await.unwrap(), 0);

        let events = harness.state.with_store(|s| s.proactive_events()).await.unwrap();
        assert_eq!(events[0].reason, "no_contact");
        let nudges = harness.state.with_store(|s| s.habit_nudges()).await.unwrap();
        assert_eq!(nudges.len(), 1);
        assert_eq!(nudges[0].habit_id, 1);
        assert_eq!(nudges[0].status, NudgeStatus::Suppressed);
        let profile = harness.state.with_store(|s| s.coaching_profile()).await.unwrap();
        assert!(profile.stats.values().all(|stat| stat.sent == 0));
    }

    #[tokio::test]
    async fn concurrent_digests_send_once() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap();
        let calendar = FakeCalendar::authorized(vec![]).with_latency(std::time::Duration::from_millis(30));
        let harness = test_state(calendar, ScriptedPlanner::fallback()).await;
        learn_user_chat(&harness.state, now).await;
        pay_bill_task(&harness.state, now + Duration::hours(10)).await;
        harness.state.tick(now).await.unwrap();

        let evening = now + Duration::hours(13);
        let (first, second) = tokio::join!(
            harness.state.daily_digest(evening),
            harness.state.daily_digest(evening)
        );
        assert_eq!(first.unwrap() + second.unwrap(), 1);
        assert_eq!(harness.transport.sent().len(), 1);
    }
}
