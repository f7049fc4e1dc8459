use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const REQUEST_DISMISS_DAYS: i64 = 30;
pub const FACT_MIN_CONFIDENCE: i64 = 70;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyScope {
    Global,
    CalendarCreate,
    MessageReply,
    TasksManage,
    Habits,
}

impl AutonomyScope {
    pub const ACTION_SCOPES: [AutonomyScope; 3] = [
        AutonomyScope::CalendarCreate,
        AutonomyScope::MessageReply,
        AutonomyScope::TasksManage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyScope::Global => "global",
            AutonomyScope::CalendarCreate => "calendar_create",
            AutonomyScope::MessageReply => "message_reply",
            AutonomyScope::TasksManage => "tasks_manage",
            AutonomyScope::Habits => "habits",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(AutonomyScope::Global),
            "calendar_create" => Some(AutonomyScope::CalendarCreate),
            "message_reply" => Some(AutonomyScope::MessageReply),
            "tasks_manage" => Some(AutonomyScope::TasksManage),
            "habits" => Some(AutonomyScope::Habits),
            _ => None,
        }
    }

    pub fn default_mode(self) -> AutonomyMode {
        match self {
            AutonomyScope::Global => AutonomyMode::Normal,
            _ => AutonomyMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    On,
    Off,
    Focus,
    UrgenciesOnly,
    Normal,
}

impl AutonomyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutonomyMode::On => "on",
            AutonomyMode::Off => "off",
            AutonomyMode::Focus => "focus",
            AutonomyMode::UrgenciesOnly => "urgencies_only",
            AutonomyMode::Normal => "normal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on" => Some(AutonomyMode::On),
            "off" => Some(AutonomyMode::Off),
            "focus" => Some(AutonomyMode::Focus),
            "urgencies_only" => Some(AutonomyMode::UrgenciesOnly),
            "normal" => Some(AutonomyMode::Normal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutonomyRule {
    pub id: i64,
    pub scope: AutonomyScope,
    pub mode: AutonomyMode,
    #[serde(default)]
    pub until_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleView {
    pub mode: AutonomyMode,
    #[serde(default)]
    pub until_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutonomySnapshot {
    pub global: RuleView,
    pub scopes: BTreeMap<AutonomyScope, RuleView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarDraft {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    pub chat_id: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PendingAction {
    CalendarCreate(CalendarDraft),
    MessageSend(MessageDraft),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleDraft {
    pub title: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingQuestion {
    StartTime {
        request: ScheduleDraft,
    },
    DurationMinutes {
        request: ScheduleDraft,
    },
    ConflictChoice {
        request: ScheduleDraft,
        options: Vec<DateTime<Utc>>,
    },
    FocusHours,
    AutonomyHours {
        scope: AutonomyScope,
    },
}

impl PendingQuestion {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingQuestion::StartTime { .. } => "start_time",
            PendingQuestion::DurationMinutes { .. } => "duration_minutes",
            PendingQuestion::ConflictChoice { .. } => "conflict_choice",
            PendingQuestion::FocusHours => "focus_hours",
            PendingQuestion::AutonomyHours { .. } => "autonomy_hours",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationState {
    pub chat_id: String,
    #[serde(default)]
    pub pending_action: Option<PendingAction>,
    #[serde(default)]
    pub pending_question: Option<PendingQuestion>,
    #[serde(default)]
    pub last_intent: Option<String>,
}

impl ConversationState {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            ..Self::default()
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending_action = None;
        self.pending_question = None;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustLabel {
    Unknown,
    Client,
    Provider,
    Friend,
    Inner,
}

impl TrustLabel {
    /// Accepts the Spanish synonyms used in chat commands.
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "client" | "cliente" => TrustLabel::Client,
            "provider" | "proveedor" => TrustLabel::Provider,
            "friend" | "amigo" => TrustLabel::Friend,
            "inner" => TrustLabel::Inner,
            _ => TrustLabel::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLabel::Unknown => "unknown",
            TrustLabel::Client => "client",
            TrustLabel::Provider => "provider",
            TrustLabel::Friend => "friend",
            TrustLabel::Inner => "inner",
        }
    }

    pub fn is_business(self) -> bool {
        matches!(self, TrustLabel::Client | TrustLabel::Provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub chat_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub trust_label: TrustLabel,
    pub trust_level: i64,
    pub allow_auto_reply: bool,
    #[serde(default)]
    pub last_interaction_at: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(chat_id: &str, display_name: Option<&str>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            display_name: display_name.map(|v| v.to_string()),
            trust_label: TrustLabel::Unknown,
            trust_level: 0,
            allow_auto_reply: false,
            last_interaction_at: None,
        }
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.chat_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Open,
    WaitingMe,
    WaitingThem,
    Closed,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Open => "open",
            ThreadStatus::WaitingMe => "waiting_me",
            ThreadStatus::WaitingThem => "waiting_them",
            ThreadStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Question,
    Closing,
    Answer,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationThread {
    pub id: i64,
    pub contact_chat_id: String,
    pub status: ThreadStatus,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Asked,
    Answered,
    Dismissed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Asked => "asked",
            RequestStatus::Answered => "answered",
            RequestStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(RequestStatus::Open),
            "asked" => Some(RequestStatus::Asked),
            "answered" => Some(RequestStatus::Answered),
            "dismissed" => Some(RequestStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub chat_id: String,
    #[serde(default)]
    pub dismissed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reopen_if_answered: bool,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantRequest {
    pub id: i64,
    pub request_type: String,
    pub key: String,
    pub prompt: String,
    pub context: RequestContext,
    pub priority: i64,
    pub status: RequestStatus,
    pub dedupe_key: String,
    #[serde(default)]
    pub asked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn request_dedupe_key(request_type: &str, key: &str, chat_id: &str) -> String {
    format!("{request_type}:{key}:{chat_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestEvent {
    pub request_id: i64,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    CalendarUpcoming,
    TaskDueToday,
    ThreadWaitingMe,
    HabitWindow,
    HabitStreakRisk,
    HabitWeeklyRisk,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::CalendarUpcoming => "calendar_upcoming",
            TriggerType::TaskDueToday => "task_due_today",
            TriggerType::ThreadWaitingMe => "thread_waiting_me",
            TriggerType::HabitWindow => "habit_window",
            TriggerType::HabitStreakRisk => "habit_streak_risk",
            TriggerType::HabitWeeklyRisk => "habit_weekly_risk",
        }
    }

    pub fn is_habit(self) -> bool {
        matches!(
            self,
            TriggerType::HabitWindow | TriggerType::HabitStreakRisk | TriggerType::HabitWeeklyRisk
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Sent,
    Digested,
    Suppressed,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Sent => "sent",
            Decision::Digested => "digested",
            Decision::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProactiveEvent {
    pub dedupe_key: String,
    pub trigger_type: TriggerType,
    pub entity_id: String,
    pub title: String,
    pub score: i64,
    pub decision: Decision,
    pub reason: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub date: NaiveDate,
    pub content: String,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_task_status")]
    pub status: String,
}

fn default_task_status() -> String {
    "open".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedEvent {
    pub event_id: String,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryFact {
    pub subject: String,
    pub key: String,
    pub value: String,
    pub confidence: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryChunk {
    pub source_type: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedAction {
    pub tool: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerOutput {
    pub intent: String,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub evidence_needed: Vec<String>,
}

impl PlannerOutput {
    pub const MAX_QUESTIONS: usize = 1;
    pub const MAX_ACTIONS: usize = 3;

    pub fn fallback() -> Self {
        Self {
            intent: "ask_clarifying_question".to_string(),
            reply: "Necesito un poco mas de detalle.".to_string(),
            questions: vec!["Podrias aclarar que queres hacer?".to_string()],
            actions: vec![],
            evidence_needed: vec![],
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.intent.trim().is_empty()
            && self.questions.len() <= Self::MAX_QUESTIONS
            && self.actions.len() <= Self::MAX_ACTIONS
            && self.actions.iter().all(|a| !a.tool.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolRunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Supervisor,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    Llm,
    User,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRun {
    pub tool_name: String,
    pub status: ToolRunStatus,
    pub input: Value,
    pub output: Value,
    pub decision_source: DecisionSource,
    pub requested_by: Requester,
    pub risk_level: RiskLevel,
    pub autonomy_snapshot: AutonomySnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub direction: Direction,
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub body: String,
    #[serde(default)]
    pub raw: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Daily,
    Weekly,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Habit {
    pub id: i64,
    pub name: String,
    pub schedule: ScheduleKind,
    #[serde(default)]
    pub target_per_week: Option<u32>,
    /// Weekdays counted from Monday = 0.
    #[serde(default)]
    pub days: Vec<u32>,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub min_version: String,
    pub priority: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HabitLogStatus {
    Done,
    Partial,
    Skipped,
}

impl HabitLogStatus {
    pub fn is_success(self) -> bool {
        matches!(self, HabitLogStatus::Done | HabitLogStatus::Partial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HabitLog {
    pub habit_id: i64,
    pub date: NaiveDate,
    pub status: HabitLogStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MicroAction,
    Frictionless,
    Reframe,
    Contract,
    Humor,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::MicroAction => "micro_action",
            Strategy::Frictionless => "frictionless",
            Strategy::Reframe => "reframe",
            Strategy::Contract => "contract",
            Strategy::Humor => "humor",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn as_str(self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }

    pub fn raised(self) -> Self {
        match self {
            Intensity::Low => Intensity::Medium,
            _ => Intensity::High,
        }
    }

    pub fn lowered(self) -> Self {
        match self {
            Intensity::High => Intensity::Medium,
            _ => Intensity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyStats {
    pub sent: u32,
    pub done_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoachingProfile {
    pub intensity: Intensity,
    pub style: String,
    #[serde(default)]
    pub stats: BTreeMap<Strategy, StrategyStats>,
}

impl Default for CoachingProfile {
    fn default() -> Self {
        Self {
            intensity: Intensity::Medium,
            style: "formal".to_string(),
            stats: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NudgeStatus {
    Sent,
    Digested,
    Suppressed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HabitNudge {
    pub habit_id: i64,
    pub strategy: Strategy,
    pub status: NudgeStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    pub quiet_hours_start: NaiveTime,
    pub quiet_hours_end: NaiveTime,
    pub strong_window_start: NaiveTime,
    pub strong_window_end: NaiveTime,
    pub daily_limit: u32,
    pub cooldown_minutes: i64,
    pub urgent_threshold: i64,
    pub maybe_threshold: i64,
    pub llm: LlmSettings,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            quiet_hours_start: hm(0, 0),
            quiet_hours_end: hm(9, 30),
            strong_window_start: hm(11, 0),
            strong_window_end: hm(19, 0),
            daily_limit: 5,
            cooldown_minutes: 240,
            urgent_threshold: 80,
            maybe_threshold: 50,
            llm: LlmSettings {
                provider: "ollama".to_string(),
                model: "qwen2.5:7b-instruct-q4".to_string(),
                temperature: 0.3,
                max_tokens: 512,
                json_mode: true,
            },
        }
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivacyRules {
    pub no_share_address: bool,
    pub no_share_payment: bool,
}

impl Default for PrivacyRules {
    fn default() -> Self {
        Self {
            no_share_address: true,
            no_share_payment: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_action_uses_type_and_payload_tags() {
        let action = PendingAction::MessageSend(MessageDraft {
            chat_id: "prov@c.us".to_string(),
            thread_id: Some(4),
            text: "hola".to_string(),
        });
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "message_send");
        assert_eq!(value["payload"]["chat_id"], "prov@c.us");
    }

    #[test]
    fn pending_question_rejects_unknown_type() {
        let parsed: Result<PendingQuestion, _> =
            serde_json::from_value(json!({"type": "favorite_color"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn trust_label_normalizes_spanish_synonyms() {
        assert_eq!(TrustLabel::normalize("Proveedor"), TrustLabel::Provider);
        assert_eq!(TrustLabel::normalize("cliente"), TrustLabel::Client);
        assert_eq!(TrustLabel::normalize("amigo"), TrustLabel::Friend);
        assert_eq!(TrustLabel::normalize("vecino"), TrustLabel::Unknown);
    }

    #[test]
    fn planner_output_shape_limits() {
        let mut plan = PlannerOutput::fallback();
        assert!(plan.is_well_formed());
        plan.questions.push("otra?".to_string());
        assert!(!plan.is_well_formed());
    }

    #[test]
    fn system_config_defaults() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.quiet_hours_end, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(cfg.daily_limit, 5);
        assert_eq!(cfg.urgent_threshold, 80);
        assert_eq!(cfg.maybe_threshold, 50);
    }
}
