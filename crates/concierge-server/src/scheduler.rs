use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use concierge_kernel::{local_date, local_time};
use tokio::time::MissedTickBehavior;

use crate::AppState;

/// Whether the daily digest is due: local clock past the digest time and not yet run today.
pub fn digest_due(
    now: DateTime<Utc>,
    tz: chrono_tz::Tz,
    at: NaiveTime,
    last_run: Option<NaiveDate>,
) -> bool {
    local_time(now, tz) >= at && last_run != Some(local_date(now, tz))
}

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.cfg.scheduler.tick_interval_secs.max(1));
    let digest_at = NaiveTime::from_hms_opt(
        state.cfg.scheduler.digest_hour,
        state.cfg.scheduler.digest_minute,
        0,
    )
    .unwrap_or(NaiveTime::MIN);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_digest: Option<NaiveDate> = None;
        loop {
            interval.tick().await;
            let Ok(_guard) = state.tick_guard.try_lock() else {
                tracing::debug!("proactive tick still running, skipped");
                continue;
            };
            let now = Utc::now();
            match state.tick(now).await {
                Ok(sent) => tracing::info!(sent, "proactive tick finished"),
                Err(error) => tracing::warn!(error = %error, "proactive tick failed"),
            }
            if digest_due(now, state.tz, digest_at, last_digest) {
                match state.daily_digest(now).await {
                    Ok(sent) => {
                        last_digest = Some(local_date(now, state.tz));
                        tracing::info!(sent, "daily digest finished");
                    }
                    Err(error) => tracing::warn!(error = %error, "daily digest failed"),
                }
            }
        }
    })
}
