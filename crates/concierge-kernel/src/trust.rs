use crate::text::{fold, strip_punctuation, truncate};
use concierge_contracts::{Contact, MessageKind, PrivacyRules, ThreadStatus, TrustLabel};

pub const AUTO_SEND_MIN_TRUST: i64 = 60;
pub const SUMMARY_MAX_CHARS: usize = 140;
pub const PREVIEW_MAX_CHARS: usize = 160;

const CLOSING: [&str; 5] = ["ok", "gracias", "listo", "ok gracias", "joya"];
const THUMBS_UP: char = '\u{1F44D}';
const QUESTION_WORDS: [&str; 7] = ["?", "cuando", "cuanto", "donde", "como", "podrias", "podes"];
const OPERATIONAL_KEYWORDS: [&str; 13] = [
    "horario",
    "disponibilidad",
    "turno",
    "precio",
    "presupuesto",
    "cotizacion",
    "direccion",
    "pickup",
    "dropoff",
    "retiro",
    "entrega",
    "confirmo",
    "confirmas",
];
const SENSITIVE_KEYWORDS: [&str; 17] = [
    "dni",
    "cbu",
    "alias",
    "tarjeta",
    "cuenta",
    "transfer",
    "pago",
    "reclamo",
    "queja",
    "problema",
    "salud",
    "historia clinica",
    "documento",
    "pasaporte",
    "mi casa",
    "mi domicilio",
    "domicilio",
];
const PAYMENT_WORDS: [&str; 6] = ["pago", "transfer", "cbu", "alias", "tarjeta", "cuenta"];
const REQUEST_WORDS: [&str; 6] = ["necesito", "preciso", "pasame", "avisame", "avisa", "confirmas"];

pub fn default_level(label: TrustLabel) -> i64 {
    match label {
        TrustLabel::Unknown => 20,
        TrustLabel::Client | TrustLabel::Provider => 60,
        TrustLabel::Friend => 70,
        TrustLabel::Inner => 90,
    }
}

/// Labels only ever raise the level; `set_level` is the way to lower it.
pub fn apply_label(contact: &mut Contact, label: &str) {
    let label = TrustLabel::normalize(label);
    contact.trust_label = label;
    contact.trust_level = contact.trust_level.max(default_level(label));
}

pub fn set_level(contact: &mut Contact, level: i64) {
    contact.trust_level = level.clamp(0, 100);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCategory {
    Sensitive,
    Operational,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSafety {
    pub category: SafetyCategory,
    pub operational: bool,
    pub requires_response: bool,
    pub closing: bool,
    pub contains_question: bool,
}

pub fn classify(text: &str, privacy: &PrivacyRules) -> MessageSafety {
    let folded = fold(text);
    let closing = CLOSING.contains(&folded.as_str())
        || CLOSING.contains(&strip_punctuation(&folded).as_str())
        || text.contains(THUMBS_UP);
    let contains_question = text.contains('?') || QUESTION_WORDS.iter().any(|w| folded.contains(w));
    let mut sensitive = SENSITIVE_KEYWORDS.iter().any(|w| folded.contains(w));
    if folded.contains("direccion")
        && (privacy.no_share_address
            || folded.contains("mi casa")
            || folded.contains("mi domicilio"))
    {
        sensitive = true;
    }
    if privacy.no_share_payment && PAYMENT_WORDS.iter().any(|w| folded.contains(w)) {
        sensitive = true;
    }
    let operational = OPERATIONAL_KEYWORDS.iter().any(|w| folded.contains(w));
    let category = if sensitive {
        SafetyCategory::Sensitive
    } else if operational {
        SafetyCategory::Operational
    } else {
        SafetyCategory::Neutral
    };
    let requires_response =
        !closing && (contains_question || REQUEST_WORDS.iter().any(|w| folded.contains(w)));
    MessageSafety {
        category,
        operational,
        requires_response,
        closing,
        contains_question,
    }
}

/// Gate for sending `text` to `contact` without asking the user first.
pub fn allow_auto_send(
    contact: Option<&Contact>,
    text: &str,
    privacy: &PrivacyRules,
) -> Result<(), &'static str> {
    let contact = contact.ok_or("unknown_contact")?;
    if !contact.trust_label.is_business() {
        return Err("untrusted_label");
    }
    if contact.trust_level < AUTO_SEND_MIN_TRUST {
        return Err("low_trust");
    }
    if !contact.allow_auto_reply {
        return Err("auto_reply_off");
    }
    let safety = classify(text, privacy);
    if safety.category == SafetyCategory::Sensitive {
        return Err("sensitive");
    }
    if !safety.operational {
        return Err("not_operational");
    }
    Ok(())
}

pub fn inbound_kind(safety: &MessageSafety, thread_status: ThreadStatus) -> MessageKind {
    if safety.closing {
        MessageKind::Closing
    } else if safety.contains_question {
        MessageKind::Question
    } else if thread_status == ThreadStatus::WaitingThem {
        MessageKind::Answer
    } else {
        MessageKind::Info
    }
}

pub fn outbound_kind(text: &str) -> MessageKind {
    if text.contains('?') {
        MessageKind::Question
    } else {
        MessageKind::Info
    }
}

pub fn status_after_inbound(current: ThreadStatus, kind: MessageKind) -> ThreadStatus {
    match kind {
        MessageKind::Question => ThreadStatus::WaitingMe,
        MessageKind::Closing => ThreadStatus::Closed,
        _ if current == ThreadStatus::WaitingThem => ThreadStatus::Open,
        _ => current,
    }
}

pub fn status_after_outbound(current: ThreadStatus, kind: MessageKind) -> ThreadStatus {
    match kind {
        MessageKind::Question => ThreadStatus::WaitingThem,
        MessageKind::Closing => ThreadStatus::Closed,
        _ if current == ThreadStatus::WaitingMe => ThreadStatus::Open,
        _ => current,
    }
}

pub fn summarize(text: &str) -> String {
    truncate(text, SUMMARY_MAX_CHARS)
}

pub fn build_reply_draft(incoming: &str, contact_name: Option<&str>) -> String {
    let name = contact_name.filter(|n| !n.trim().is_empty()).unwrap_or("Hola");
    let folded = fold(incoming);
    let has = |words: &[&str]| words.iter().any(|w| folded.contains(w));
    if has(&["precio", "presupuesto", "cotizacion"]) {
        format!("{name}, gracias por consultar. Te paso el precio en breve.")
    } else if has(&["horario", "turno", "disponibilidad", "cuando"]) {
        format!("{name}, gracias. Estoy revisando horarios y te confirmo en breve.")
    } else if folded.contains("direccion") {
        format!("{name}, recibido. Te confirmo la direccion en breve.")
    } else {
        format!("{name}, recibido. Lo reviso y te confirmo en breve.")
    }
}

pub fn user_notification(contact_name: &str, body: &str, draft: Option<&str>) -> String {
    let preview = truncate(body, PREVIEW_MAX_CHARS);
    match draft {
        Some(draft) => format!(
            "Mensaje de {contact_name}: \"{preview}\". Borrador sugerido: \"{}\". Responde confirmo para enviar.",
            truncate(draft, PREVIEW_MAX_CHARS)
        ),
        None => format!("Mensaje de {contact_name}: \"{preview}\"."),
    }
}
