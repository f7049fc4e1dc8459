pub mod autonomy;
pub mod habits;
pub mod proactive;
pub mod requests;
pub mod supervisor;
pub mod text;
pub mod trust;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts.trim())
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Half-open `[start, end)` membership; a window whose start is after its end wraps midnight.
pub fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= t && t < end
    } else {
        t >= start || t < end
    }
}

pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

pub fn local_time(now: DateTime<Utc>, tz: Tz) -> NaiveTime {
    now.with_timezone(&tz).time()
}

/// Resolves a wall-clock reading in `tz` to an instant, taking the earlier reading on folds.
pub fn local_datetime(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

pub fn local_day_bounds(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = local_date(now, tz);
    let start = local_datetime(tz, day, NaiveTime::MIN);
    let end = day
        .succ_opt()
        .map(|next| local_datetime(tz, next, NaiveTime::MIN))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

pub fn format_local(value: DateTime<Utc>, tz: Tz) -> String {
    value.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string()
}

pub fn format_local_hm(value: DateTime<Utc>, tz: Tz) -> String {
    value.with_timezone(&tz).format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn jcs_digest_is_key_order_independent() {
        let a = json!({"global": {"mode": "normal"}, "scopes": {"habits": {"mode": "off"}}});
        let b = json!({"scopes": {"habits": {"mode": "off"}}, "global": {"mode": "normal"}});
        assert_eq!(jcs_sha256_hex(&a).unwrap(), jcs_sha256_hex(&b).unwrap());
    }

    #[test]
    fn window_membership_is_half_open() {
        assert!(in_window(t(0, 0), t(0, 0), t(9, 30)));
        assert!(in_window(t(9, 29), t(0, 0), t(9, 30)));
        assert!(!in_window(t(9, 30), t(0, 0), t(9, 30)));
    }

    #[test]
    fn window_wraps_midnight() {
        assert!(in_window(t(23, 0), t(22, 0), t(7, 0)));
        assert!(in_window(t(6, 59), t(22, 0), t(7, 0)));
        assert!(!in_window(t(12, 0), t(22, 0), t(7, 0)));
    }

    #[test]
    fn day_bounds_follow_local_midnight() {
        let tz: Tz = "America/Argentina/Buenos_Aires".parse().unwrap();
        let now = parse_rfc3339("2026-03-10T02:00:00Z").unwrap();
        let (start, end) = local_day_bounds(now, tz);
        assert_eq!(start, parse_rfc3339("2026-03-09T03:00:00Z").unwrap());
        assert_eq!(end, parse_rfc3339("2026-03-10T03:00:00Z").unwrap());
    }
}
