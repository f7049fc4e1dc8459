use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_config::Config;
use concierge_contracts::{CalendarDraft, CalendarEvent, CreatedEvent, LlmSettings, PlannerOutput};
use serde_json::{json, Value};

use crate::calendar::{CalendarError, CalendarTool};
use crate::llm::{DisabledLlm, Planner};
use crate::messaging::{MessagingTransport, TransportError};
use crate::{AppState, Collaborators};

pub struct FakeCalendar {
    authorized: bool,
    events: Vec<CalendarEvent>,
    latency: Duration,
    created: Mutex<Vec<CalendarDraft>>,
}

impl FakeCalendar {
    pub fn authorized(events: Vec<CalendarEvent>) -> Self {
        Self {
            authorized: true,
            events,
            latency: Duration::ZERO,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            authorized: false,
            events: Vec::new(),
            latency: Duration::ZERO,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every lookup sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn created(&self) -> Vec<CalendarDraft> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl CalendarTool for FakeCalendar {
    async fn has_token(&self) -> bool {
        self.authorized
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if !self.authorized {
            return Err(CalendarError::NotAuthorized("no token".to_string()));
        }
        Ok(self
            .events
            .iter()
            .filter(|e| e.start < to && e.end > from)
            .cloned()
            .collect())
    }

    async fn create_event(&self, draft: &CalendarDraft) -> Result<CreatedEvent, CalendarError> {
        if !self.authorized {
            return Err(CalendarError::NotAuthorized("no token".to_string()));
        }
        self.created.lock().unwrap().push(draft.clone());
        Ok(CreatedEvent {
            event_id: "evt-1".to_string(),
            link: Some("https://calendar.test/evt-1".to_string()),
        })
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    failing: bool,
}

impl RecordingTransport {
    /// Records every attempt but reports each one as undelivered.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<Value, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        if self.failing {
            return Err(TransportError::Exhausted {
                attempts: 1,
                reason: "http 502".to_string(),
            });
        }
        Ok(json!({"id": format!("msg-{}", self.sent.lock().unwrap().len())}))
    }
}

pub struct ScriptedPlanner {
    output: PlannerOutput,
}

impl ScriptedPlanner {
    pub fn new(output: PlannerOutput) -> Self {
        Self { output }
    }

    pub fn fallback() -> Self {
        Self::new(PlannerOutput::fallback())
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn generate_structured(
        &self,
        _settings: &LlmSettings,
        _system_prompt: &str,
        _user_text: &str,
        _context: &str,
    ) -> PlannerOutput {
        self.output.clone()
    }
}

pub struct Harness {
    pub state: AppState,
    pub calendar: Arc<FakeCalendar>,
    pub transport: Arc<RecordingTransport>,
}

static AUDIT_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn test_config(user_chat_id: Option<&str>) -> Config {
    let seq = AUDIT_SEQ.fetch_add(1, Ordering::SeqCst);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let audit_path = std::env::temp_dir().join(format!("concierge-unit-{nanos}-{seq}.jsonl"));
    serde_json::from_value(json!({
        "server": {"listen_addr": "127.0.0.1:0"},
        "store": {"type": "memory"},
        "audit": {"jsonl_path": audit_path.to_string_lossy()},
        "assistant": {
            "public_base_url": "http://localhost:8000",
            "user_chat_id": user_chat_id
        },
        "calendar": {"mode": "disabled"},
        "messaging": {"mode": "log"},
        "llm": {"mode": "disabled"},
        "scheduler": {"enabled": false}
    }))
    .unwrap()
}

pub async fn test_state(calendar: FakeCalendar, planner: ScriptedPlanner) -> Harness {
    harness(calendar, planner, RecordingTransport::default(), None).await
}

pub async fn harness(
    calendar: FakeCalendar,
    planner: ScriptedPlanner,
    transport: RecordingTransport,
    user_chat_id: Option<&str>,
) -> Harness {
    let calendar = Arc::new(calendar);
    let transport = Arc::new(transport);
    let collaborators = Collaborators {
        calendar: calendar.clone(),
        messaging: transport.clone(),
        planner: Arc::new(planner),
        text_llm: Arc::new(DisabledLlm),
    };
    let state = AppState::new(test_config(user_chat_id), collaborators).await.unwrap();
    Harness {
        state,
        calendar,
        transport,
    }
}
