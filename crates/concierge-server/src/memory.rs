use std::collections::BTreeSet;

use concierge_contracts::{
    AutonomySnapshot, Direction, MemoryChunk, MemoryFact, StoredMessage, FACT_MIN_CONFIDENCE,
};
use concierge_kernel::requests::usual_place_fact_keys;
use concierge_kernel::text::{extract_tags, fold, truncate};

pub const CONTEXT_MAX_CHARS: usize = 1800;
pub const CONTEXT_CHUNKS: usize = 6;
pub const CONTEXT_FACTS: usize = 10;
pub const MEMORY_ANSWER_CHUNKS: usize = 5;
const CHUNK_PREVIEW_CHARS: usize = 120;
const MESSAGE_SOURCE: &str = "whatsapp_message";

pub const SAFETY_RULES: [&str; 4] = [
    "No compras ni pagos.",
    "No enviar mensajes a terceros.",
    "Confirmar acciones de riesgo alto.",
    "Usar evidencia antes de afirmar.",
];

fn chunk_of(message: &StoredMessage) -> MemoryChunk {
    MemoryChunk {
        source_type: MESSAGE_SOURCE.to_string(),
        content: message.body.clone(),
        tags: extract_tags(&message.body),
        chat_id: Some(message.chat_id.clone()),
    }
}

/// Keyword retrieval over stored inbound messages, newest first.
///
/// With tags the match is on tag overlap; without tags the folded query must appear in the
/// folded content. The message carrying the query itself is never returned.
pub fn retrieve(
    messages: &[StoredMessage],
    query: &str,
    tags: &[String],
    chat_id: Option<&str>,
    limit: usize,
) -> Vec<MemoryChunk> {
    let folded_query = fold(query);
    let mut candidates: Vec<&StoredMessage> = messages
        .iter()
        .filter(|m| m.direction == Direction::Inbound && !m.body.trim().is_empty())
        .filter(|m| m.body.trim() != query.trim())
        .filter(|m| chat_id.map(|c| m.chat_id == c).unwrap_or(true))
        .collect();
    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    candidates
        .into_iter()
        .map(chunk_of)
        .filter(|chunk| {
            if tags.is_empty() {
                !folded_query.is_empty() && fold(&chunk.content).contains(&folded_query)
            } else {
                chunk.tags.iter().any(|t| tags.contains(t))
            }
        })
        .take(limit)
        .collect()
}

pub fn authoritative_fact<'a>(facts: &'a [MemoryFact], key: &str) -> Option<&'a MemoryFact> {
    facts
        .iter()
        .find(|f| f.subject == "user" && f.key == key && f.confidence >= FACT_MIN_CONFIDENCE)
}

pub fn known_fact_keys(facts: &[MemoryFact]) -> Vec<String> {
    facts
        .iter()
        .filter(|f| f.subject == "user" && f.confidence >= FACT_MIN_CONFIDENCE)
        .map(|f| f.key.clone())
        .collect()
}

/// The stored "usual place" for the first tag that has one.
pub fn fact_for_tags<'a>(facts: &'a [MemoryFact], tags: &[String]) -> Option<&'a MemoryFact> {
    tags.iter().find_map(|tag| {
        usual_place_fact_keys(tag)
            .iter()
            .find_map(|key| authoritative_fact(facts, key))
    })
}

fn context_facts<'a>(facts: &'a [MemoryFact], tags: &[String]) -> Vec<&'a MemoryFact> {
    let mut picked: Vec<&MemoryFact> = facts
        .iter()
        .filter(|f| f.subject == "user" && f.confidence >= FACT_MIN_CONFIDENCE)
        .filter(|f| {
            let key = f.key.to_lowercase();
            tags.is_empty() || tags.iter().any(|t| key.contains(t.as_str()))
        })
        .collect();
    picked.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    picked.truncate(CONTEXT_FACTS);
    picked
}

pub fn chunk_preview(chunk: &MemoryChunk) -> String {
    format!("[{}] {}", chunk.source_type, truncate(&chunk.content, CHUNK_PREVIEW_CHARS))
}

pub fn memory_answer(chunks: &[MemoryChunk]) -> String {
    if chunks.is_empty() {
        return "No tengo info registrada sobre eso.".to_string();
    }
    let summary: Vec<String> = chunks.iter().map(chunk_preview).collect();
    format!("Tengo registrado: {}", summary.join(" "))
}

#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub prompt: String,
    pub evidence_keys: BTreeSet<String>,
    pub autonomy_snapshot: AutonomySnapshot,
}

fn or_no_data(mut lines: Vec<String>) -> Vec<String> {
    if lines.is_empty() {
        lines.push("- sin datos".to_string());
    }
    lines
}

fn cap_prompt(prompt: String) -> String {
    if prompt.chars().count() <= CONTEXT_MAX_CHARS {
        return prompt;
    }
    let kept: String = prompt.chars().take(CONTEXT_MAX_CHARS - 3).collect();
    format!("{kept}...")
}

pub fn build_context(
    facts: &[MemoryFact],
    messages: &[StoredMessage],
    autonomy_snapshot: AutonomySnapshot,
    chat_id: &str,
    user_text: &str,
) -> ContextSnapshot {
    let tags = extract_tags(user_text);
    let chunks = retrieve(messages, user_text, &tags, Some(chat_id), CONTEXT_CHUNKS);
    let facts = context_facts(facts, &tags);

    let mut evidence_keys: BTreeSet<String> = facts.iter().map(|f| f.key.to_lowercase()).collect();
    for chunk in &chunks {
        evidence_keys.extend(chunk.tags.iter().map(|t| t.to_lowercase()));
    }

    let fact_lines = facts
        .iter()
        .map(|f| format!("- {}: {} (confianza {})", f.key, f.value, f.confidence))
        .collect();
    let chunk_lines = chunks
        .iter()
        .map(|c| {
            let tags = if c.tags.is_empty() {
                "sin tags".to_string()
            } else {
                c.tags.join(", ")
            };
            format!("- {} (tags: {tags})", chunk_preview(c))
        })
        .collect();
    let mut autonomy_lines = vec![format!("- global: {}", autonomy_snapshot.global.mode.as_str())];
    autonomy_lines.extend(
        autonomy_snapshot
            .scopes
            .iter()
            .map(|(scope, view)| format!("- {}: {}", scope.as_str(), view.mode.as_str())),
    );

    let mut lines = vec!["Hechos:".to_string()];
    lines.extend(or_no_data(fact_lines));
    lines.push("Memoria:".to_string());
    lines.extend(or_no_data(chunk_lines));
    lines.push("Autonomia:".to_string());
    lines.extend(autonomy_lines);
    lines.push("Reglas:".to_string());
    lines.extend(SAFETY_RULES.iter().map(|r| r.to_string()));

    ContextSnapshot {
        prompt: cap_prompt(lines.join("\n")),
        evidence_keys,
        autonomy_snapshot,
    }
}
