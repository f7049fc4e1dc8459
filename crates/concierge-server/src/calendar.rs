use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use concierge_config::Config;
use concierge_contracts::{CalendarDraft, CalendarEvent, CreatedEvent};
use concierge_kernel::parse_rfc3339;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("calendar not authorized: {0}")]
    NotAuthorized(String),
    #[error("calendar not configured: {0}")]
    Config(String),
    #[error("calendar transport failed: {0}")]
    Transport(String),
    #[error("calendar request rejected: {0}")]
    Rejected(String),
}

impl CalendarError {
    /// Transport failures (network, 429, 5xx) may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, CalendarError::Transport(_))
    }
}

#[async_trait]
pub trait CalendarTool: Send + Sync {
    async fn has_token(&self) -> bool;

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;

    /// Free means no event of any kind overlaps `[start, end)`.
    async fn is_free(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, CalendarError> {
        Ok(self.list_events(start, end).await?.is_empty())
    }

    async fn create_event(&self, draft: &CalendarDraft) -> Result<CreatedEvent, CalendarError>;
}

pub fn build_calendar(cfg: &Config) -> Result<Arc<dyn CalendarTool>, String> {
    match cfg.calendar.mode.as_str() {
        "google" => Ok(Arc::new(GoogleCalendar::new(cfg)?)),
        _ => Ok(Arc::new(DisabledCalendar)),
    }
}

pub struct DisabledCalendar;

#[async_trait]
impl CalendarTool for DisabledCalendar {
    async fn has_token(&self) -> bool {
        false
    }

    async fn list_events(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        Err(CalendarError::Config("calendar.mode=disabled".to_string()))
    }

    async fn create_event(&self, _draft: &CalendarDraft) -> Result<CreatedEvent, CalendarError> {
        Err(CalendarError::Config("calendar.mode=disabled".to_string()))
    }
}

/// Google Calendar v3 over REST with a bearer token kept on disk.
pub struct GoogleCalendar {
    client: Client,
    api_base: String,
    calendar_id: String,
    token_path: Option<String>,
    timezone: String,
    retries: usize,
    retry_backoff: Duration,
}

impl GoogleCalendar {
    pub fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.calendar.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: cfg.calendar.api_base.trim_end_matches('/').to_string(),
            calendar_id: cfg.calendar.calendar_id.clone(),
            token_path: cfg.calendar.token_path.clone(),
            timezone: cfg.assistant.timezone.clone(),
            retries: cfg.calendar.retries,
            retry_backoff: Duration::from_millis(cfg.calendar.retry_backoff_ms),
        })
    }

    async fn access_token(&self) -> Result<String, CalendarError> {
        let path = self
            .token_path
            .as_deref()
            .ok_or_else(|| CalendarError::Config("calendar.token_path is not set".to_string()))?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| CalendarError::NotAuthorized("missing token".to_string()))?;
        token_from_file(&text).ok_or_else(|| CalendarError::NotAuthorized("empty token".to_string()))
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/{}/events", self.api_base, self.calendar_id)
    }

    async fn fetch_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let token = self.access_token().await?;
        let time_min = from.to_rfc3339();
        let time_max = to.to_rfc3339();
        let response = self
            .client
            .get(self.events_url())
            .bearer_auth(token)
            .query(&[
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("orderBy", "startTime"),
            ])
            .send()
            .await
            .map_err(|e| CalendarError::Transport(e.to_string()))?;
        check_status(response.status())?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| CalendarError::Transport(e.to_string()))?;
        Ok(body
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(parse_event).collect())
            .unwrap_or_default())
    }

    async fn insert_event(&self, body: &Value) -> Result<CreatedEvent, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.events_url())
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| CalendarError::Transport(e.to_string()))?;
        check_status(response.status())?;
        created_from(response).await
    }

    async fn fetch_event(&self, event_id: &str) -> Result<CreatedEvent, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/{event_id}", self.events_url()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CalendarError::Transport(e.to_string()))?;
        check_status(response.status())?;
        created_from(response).await
    }
}

async fn created_from(response: reqwest::Response) -> Result<CreatedEvent, CalendarError> {
    let created: Value = response
        .json()
        .await
        .map_err(|e| CalendarError::Transport(e.to_string()))?;
    let event_id = created
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CalendarError::Transport("event response without id".to_string()))?;
    Ok(CreatedEvent {
        event_id: event_id.to_string(),
        link: created
            .get("htmlLink")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string()),
    })
}

/// Runs `call` again after transient failures, up to `retries` extra attempts with linear backoff.
async fn with_retries<T, F, Fut>(
    retries: usize,
    backoff: Duration,
    operation: &'static str,
    mut call: F,
) -> Result<T, CalendarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CalendarError>>,
{
    let attempts = retries + 1;
    let mut attempt = 0;
    loop {
        match call().await {
            Err(error) if error.is_transient() && attempt + 1 < attempts => {
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    attempts,
                    error = %error,
                    "calendar call failed"
                );
                if backoff > Duration::ZERO {
                    sleep(backoff * (attempt as u32 + 1)).await;
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Accepts either a raw token or a JSON document with `access_token`/`token`.
fn token_from_file(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(doc) => ["access_token", "token"]
            .iter()
            .find_map(|k| doc.get(*k).and_then(|v| v.as_str()))
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.to_string()),
        Err(_) => Some(trimmed.to_string()),
    }
}

fn check_status(status: StatusCode) -> Result<(), CalendarError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CalendarError::NotAuthorized(format!("http {}", status.as_u16())));
    }
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("http {}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CalendarError::Transport(reason));
    }
    Err(CalendarError::Rejected(reason))
}

fn parse_boundary(value: &Value) -> Option<(DateTime<Utc>, bool)> {
    if let Some(ts) = value.get("dateTime").and_then(|v| v.as_str()) {
        return parse_rfc3339(ts).map(|v| (v, false));
    }
    let day = value.get("date").and_then(|v| v.as_str())?;
    let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    Some((date.and_hms_opt(0, 0, 0)?.and_utc(), true))
}

fn parse_event(item: &Value) -> Option<CalendarEvent> {
    let (start, all_day) = parse_boundary(item.get("start")?)?;
    let (end, _) = parse_boundary(item.get("end")?)?;
    Some(CalendarEvent {
        id: item.get("id")?.as_str()?.to_string(),
        title: item
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        start,
        end,
        all_day,
        location: item.get("location").and_then(|v| v.as_str()).map(|v| v.to_string()),
        link: item.get("htmlLink").and_then(|v| v.as_str()).map(|v| v.to_string()),
    })
}

#[async_trait]
impl CalendarTool for GoogleCalendar {
    async fn has_token(&self) -> bool {
        self.access_token().await.is_ok()
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        with_retries(self.retries, self.retry_backoff, "list_events", || {
            self.fetch_events(from, to)
        })
        .await
    }

    async fn create_event(&self, draft: &CalendarDraft) -> Result<CreatedEvent, CalendarError> {
        // Client-chosen base32hex id: a repeated insert answers 409 instead of duplicating the event.
        let event_id = Uuid::new_v4().simple().to_string();
        let mut body = json!({
            "id": event_id,
            "summary": draft.title,
            "start": {"dateTime": draft.start.to_rfc3339(), "timeZone": self.timezone},
            "end": {"dateTime": draft.end.to_rfc3339(), "timeZone": self.timezone},
        });
        if let Some(location) = draft.location.as_deref().filter(|v| !v.is_empty()) {
            body["location"] = json!(location);
        }
        if let Some(notes) = draft.notes.as_deref().filter(|v| !v.is_empty()) {
            body["description"] = json!(notes);
        }
        let inserted = with_retries(self.retries, self.retry_backoff, "create_event", || {
            self.insert_event(&body)
        })
        .await;
        match inserted {
            Err(CalendarError::Rejected(reason)) if reason == "http 409" => {
                with_retries(self.retries, self.retry_backoff, "get_event", || {
                    self.fetch_event(&event_id)
                })
                .await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn token_file_accepts_json_or_raw() {
        assert_eq!(token_from_file("{\"access_token\":\"abc\"}").as_deref(), Some("abc"));
        assert_eq!(token_from_file("{\"token\":\"xyz\"}").as_deref(), Some("xyz"));
        assert_eq!(token_from_file("  raw-token \n").as_deref(), Some("raw-token"));
        assert_eq!(token_from_file("   "), None);
        assert_eq!(token_from_file("{\"refresh_token\":\"r\"}"), None);
    }

    #[test]
    fn date_only_start_is_all_day() {
        let item = json!({
            "id": "ev1",
            "summary": "Feriado",
            "start": {"date": "2026-03-10"},
            "end": {"date": "2026-03-11"},
        });
        let event = parse_event(&item).unwrap();
        assert!(event.all_day);
        assert_eq!(event.title, "Feriado");
    }

    #[test]
    fn auth_statuses_map_to_not_authorized() {
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(CalendarError::NotAuthorized(_))
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN),
            Err(CalendarError::NotAuthorized(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY),
            Err(CalendarError::Transport(_))
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(CalendarError::Transport(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_REQUEST),
            Err(CalendarError::Rejected(_))
        ));
        assert!(check_status(StatusCode::OK).is_ok());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(2, Duration::ZERO, "list_events", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(CalendarError::Transport("http 503".to_string()))
                } else {
                    Ok(call)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(1, Duration::ZERO, "list_events", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CalendarError::Transport("timeout".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CalendarError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_and_rejections_fail_fast() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(3, Duration::ZERO, "create_event", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CalendarError::NotAuthorized("http 401".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CalendarError::NotAuthorized(_))));
        let result: Result<(), _> = with_retries(3, Duration::ZERO, "create_event", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CalendarError::Rejected("http 400".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(CalendarError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
