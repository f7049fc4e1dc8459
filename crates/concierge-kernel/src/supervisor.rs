use crate::autonomy::scope_enabled;
use crate::parse_rfc3339;
use crate::trust::allow_auto_send;
use chrono::{DateTime, Utc};
use concierge_contracts::{
    AutonomyScope, AutonomySnapshot, Contact, PlannedAction, PlannerOutput, PrivacyRules,
    RiskLevel,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const MESSAGE_SEND: &str = "message.send";
pub const CALENDAR_CREATE_EVENT: &str = "calendar.create_event";
pub const CALENDAR_LIST_EVENTS: &str = "calendar.list_events";
pub const CALENDAR_IS_FREE: &str = "calendar.is_free";

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub scope: AutonomyScope,
    pub required: &'static [&'static str],
    pub description: &'static str,
}

pub const TOOL_REGISTRY: [ToolSpec; 4] = [
    ToolSpec {
        name: CALENDAR_CREATE_EVENT,
        scope: AutonomyScope::CalendarCreate,
        required: &["title", "start", "end"],
        description: "Crear un evento en Google Calendar",
    },
    ToolSpec {
        name: CALENDAR_LIST_EVENTS,
        scope: AutonomyScope::CalendarCreate,
        required: &["time_min", "time_max"],
        description: "Listar eventos entre fechas",
    },
    ToolSpec {
        name: CALENDAR_IS_FREE,
        scope: AutonomyScope::CalendarCreate,
        required: &["start", "end"],
        description: "Chequear disponibilidad en un rango",
    },
    ToolSpec {
        name: MESSAGE_SEND,
        scope: AutonomyScope::MessageReply,
        required: &["chat_id", "text"],
        description: "Enviar un mensaje de WhatsApp a un contacto",
    },
];

pub fn tool_spec(name: &str) -> Option<&'static ToolSpec> {
    TOOL_REGISTRY.iter().find(|spec| spec.name == name)
}

pub fn tool_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = TOOL_REGISTRY.iter().map(|s| s.name).collect();
    names.sort_unstable();
    names
}

pub fn missing_fields(spec: &ToolSpec, input: &Map<String, Value>) -> Vec<&'static str> {
    spec.required
        .iter()
        .copied()
        .filter(|field| match input.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        })
        .collect()
}

pub fn input_str<'a>(input: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub fn input_datetime(input: &Map<String, Value>, field: &str) -> Option<DateTime<Utc>> {
    input_str(input, field).and_then(parse_rfc3339)
}

pub fn planner_system_prompt() -> String {
    format!(
        "Sos un planner que responde SOLO JSON estricto. No agregues texto extra.\n\
         Herramientas permitidas: {}.\n\
         Schema:\n\
         {{\"intent\": \"...\", \"reply\": \"...\", \"questions\": [\"...\"] , \
         \"actions\": [{{\"tool\":\"...\",\"input\":{{}},\"risk_level\":\"low|medium|high\",\
         \"rationale\":\"...\",\"requires_confirmation\":false}}], \"evidence_needed\": [\"...\"]}}\n\
         Reglas: max 1 pregunta, max 3 acciones. Usa evidencia si es necesaria.",
        tool_names().join(", ")
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorDecision {
    pub reply: String,
    pub action: Option<PlannedAction>,
    pub requires_confirmation: bool,
    pub reason: &'static str,
}

impl SupervisorDecision {
    fn reply_only(reply: String, reason: &'static str) -> Self {
        Self {
            reply,
            action: None,
            requires_confirmation: false,
            reason,
        }
    }

    fn confirm(reply: String, action: PlannedAction, reason: &'static str) -> Self {
        Self {
            reply,
            action: Some(action),
            requires_confirmation: true,
            reason,
        }
    }
}

pub struct Supervisor<'a> {
    snapshot: &'a AutonomySnapshot,
    evidence_keys: BTreeSet<String>,
    contacts: &'a [Contact],
    privacy: &'a PrivacyRules,
    now: DateTime<Utc>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        snapshot: &'a AutonomySnapshot,
        evidence_keys: impl IntoIterator<Item = String>,
        contacts: &'a [Contact],
        privacy: &'a PrivacyRules,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            evidence_keys: evidence_keys.into_iter().map(|k| k.to_lowercase()).collect(),
            contacts,
            privacy,
            now,
        }
    }

    /// Only the first planned action is ever considered.
    pub fn evaluate(&self, output: &PlannerOutput) -> SupervisorDecision {
        if let Some(question) = output.questions.first() {
            return SupervisorDecision::reply_only(question.clone(), "planner_question");
        }
        let Some(action) = output.actions.first() else {
            return SupervisorDecision::reply_only(or_default(&output.reply, "Entendido."), "no_action");
        };
        let Some(spec) = tool_spec(&action.tool) else {
            return SupervisorDecision::reply_only(
                "No puedo ejecutar esa accion.".to_string(),
                "tool_not_allowed",
            );
        };
        if !missing_fields(spec, &action.input).is_empty() {
            return SupervisorDecision::reply_only("Necesito mas detalles.".to_string(), "missing_input");
        }
        let evidence_missing = output
            .evidence_needed
            .iter()
            .any(|item| !self.evidence_keys.contains(&item.to_lowercase()));
        if evidence_missing {
            return SupervisorDecision::reply_only(
                "Necesito confirmar ese dato.".to_string(),
                "missing_evidence",
            );
        }

        let confirm_reply = or_default(&output.reply, "Necesito confirmacion.");
        if action.risk_level == RiskLevel::High {
            return SupervisorDecision::confirm(confirm_reply, action.clone(), "high_risk");
        }
        if action.requires_confirmation {
            return SupervisorDecision::confirm(confirm_reply, action.clone(), "requires_confirmation");
        }
        if action.risk_level == RiskLevel::Medium {
            if spec.name == MESSAGE_SEND && !self.contact_allows(action) {
                return SupervisorDecision::confirm(confirm_reply, action.clone(), "contact_policy");
            }
            if !scope_enabled(self.snapshot, spec.scope, self.now) {
                return SupervisorDecision::confirm(confirm_reply, action.clone(), "autonomy_off");
            }
        }
        SupervisorDecision {
            reply: or_default(&output.reply, "Listo."),
            action: Some(action.clone()),
            requires_confirmation: false,
            reason: "approved",
        }
    }

    fn contact_allows(&self, action: &PlannedAction) -> bool {
        let chat_id = input_str(&action.input, "chat_id").unwrap_or_default();
        let text = input_str(&action.input, "text").unwrap_or_default();
        let contact = self.contacts.iter().find(|c| c.chat_id == chat_id);
        allow_auto_send(contact, text, self.privacy).is_ok()
    }
}

fn or_default(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
