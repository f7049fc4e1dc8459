use crate::jcs_sha256_hex;
use crate::text::remaining_hm;
use chrono::{DateTime, Duration, Utc};
use concierge_contracts::{AutonomyMode, AutonomyRule, AutonomyScope, AutonomySnapshot, RuleView};
use std::collections::BTreeMap;

fn is_live(rule: &AutonomyRule, now: DateTime<Utc>) -> bool {
    rule.until_at.map(|until| until >= now).unwrap_or(true)
}

/// Most recently created rule for `scope` that has not expired at `now`.
pub fn effective_rule(
    rules: &[AutonomyRule],
    scope: AutonomyScope,
    now: DateTime<Utc>,
) -> Option<&AutonomyRule> {
    rules
        .iter()
        .filter(|r| r.scope == scope && is_live(r, now))
        .max_by_key(|r| (r.created_at, r.id))
}

pub fn rule_view(rules: &[AutonomyRule], scope: AutonomyScope, now: DateTime<Utc>) -> RuleView {
    match effective_rule(rules, scope, now) {
        Some(rule) => RuleView {
            mode: rule.mode,
            until_at: rule.until_at,
        },
        None => RuleView {
            mode: scope.default_mode(),
            until_at: None,
        },
    }
}

pub fn global_mode(rules: &[AutonomyRule], now: DateTime<Utc>) -> RuleView {
    rule_view(rules, AutonomyScope::Global, now)
}

pub fn snapshot(rules: &[AutonomyRule], now: DateTime<Utc>) -> AutonomySnapshot {
    let scopes: BTreeMap<AutonomyScope, RuleView> = AutonomyScope::ACTION_SCOPES
        .iter()
        .map(|scope| (*scope, rule_view(rules, *scope, now)))
        .collect();
    AutonomySnapshot {
        global: global_mode(rules, now),
        scopes,
    }
}

pub fn snapshot_digest(snapshot: &AutonomySnapshot) -> Result<String, String> {
    let value = serde_json::to_value(snapshot)
        .map_err(|err| format!("failed to serialize autonomy snapshot: {err}"))?;
    jcs_sha256_hex(&value)
}

pub fn scope_enabled(snapshot: &AutonomySnapshot, scope: AutonomyScope, now: DateTime<Utc>) -> bool {
    match snapshot.scopes.get(&scope) {
        Some(view) => view.mode == AutonomyMode::On && view.until_at.map(|u| u > now).unwrap_or(true),
        None => false,
    }
}

/// Habit nudges are off only when a live `habits` rule says anything other than `on`.
pub fn habits_off(rules: &[AutonomyRule], now: DateTime<Utc>) -> bool {
    effective_rule(rules, AutonomyScope::Habits, now)
        .map(|rule| rule.mode != AutonomyMode::On)
        .unwrap_or(false)
}

pub fn until_from_hours(now: DateTime<Utc>, hours: Option<i64>) -> Option<DateTime<Utc>> {
    hours.filter(|h| *h > 0).map(|h| now + Duration::hours(h))
}

pub fn autonomy_status(rules: &[AutonomyRule], now: DateTime<Utc>) -> String {
    let lines: Vec<String> = AutonomyScope::ACTION_SCOPES
        .iter()
        .map(|scope| {
            let view = rule_view(rules, *scope, now);
            match view.until_at.and_then(|until| remaining_hm(until, now)) {
                Some((h, m)) => format!("{}: {} ({h}h {m}m)", scope.as_str(), view.mode.as_str()),
                None => format!("{}: {}", scope.as_str(), view.mode.as_str()),
            }
        })
        .collect();
    format!("Autonomia: {}", lines.join(", "))
}

pub fn proactive_status(global: &RuleView, daily_limit: u32, now: DateTime<Utc>) -> String {
    let label = match global.mode {
        AutonomyMode::Normal => "normal",
        AutonomyMode::Focus => "foco",
        AutonomyMode::UrgenciesOnly => "solo urgencias",
        other => other.as_str(),
    };
    let mut parts = vec![
        format!("Modo proactivo: {label}."),
        format!("Limite diario: {daily_limit}."),
    ];
    if global.mode == AutonomyMode::Focus {
        if let Some((h, m)) = global.until_at.and_then(|until| remaining_hm(until, now)) {
            parts.push(format!("Foco restante: {h}h {m}m."));
        }
    }
    parts.join(" ")
}
