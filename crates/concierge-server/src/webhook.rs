use serde_json::Value;

const CHAT_ID_PATHS: &[&[&str]] = &[
    &["payload", "chatId"],
    &["payload", "chat_id"],
    &["payload", "chat", "id"],
    &["payload", "message", "chatId"],
    &["payload", "message", "chat_id"],
    &["payload", "from"],
    &["payload", "chat"],
    &["chatId"],
    &["chat_id"],
    &["chat", "id"],
    &["from"],
    &["chat"],
];

const SENDER_ID_PATHS: &[&[&str]] = &[
    &["payload", "author"],
    &["payload", "senderId"],
    &["payload", "sender_id"],
    &["payload", "sender", "id"],
    &["payload", "sender"],
    &["payload", "participant"],
    &["author"],
    &["senderId"],
    &["sender_id"],
    &["sender", "id"],
];

const TEXT_PATHS: &[&[&str]] = &[
    &["payload", "body"],
    &["payload", "text"],
    &["payload", "message", "text"],
    &["payload", "message", "body"],
    &["payload", "message"],
    &["payload", "caption"],
    &["payload", "content"],
    &["message", "text"],
    &["message", "body"],
    &["text"],
    &["body"],
    &["message"],
];

const DISPLAY_NAME_PATHS: &[&[&str]] = &[
    &["payload", "senderName"],
    &["payload", "pushName"],
    &["payload", "notifyName"],
    &["payload", "profileName"],
    &["payload", "fromName"],
    &["payload", "name"],
    &["senderName"],
    &["pushName"],
    &["notifyName"],
    &["profileName"],
    &["fromName"],
    &["name"],
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundFields {
    pub chat_id: Option<String>,
    pub sender_id: Option<String>,
    pub body: Option<String>,
    pub display_name: Option<String>,
}

/// Scalars only: strings as-is, numbers and booleans stringified. Objects and arrays do not count.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first_value(payload: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        let mut current = payload;
        for key in path.iter() {
            current = current.as_object()?.get(*key)?;
        }
        scalar_text(current).filter(|s| !s.is_empty())
    })
}

pub fn extract_message_fields(payload: &Value) -> InboundFields {
    InboundFields {
        chat_id: first_value(payload, CHAT_ID_PATHS),
        sender_id: first_value(payload, SENDER_ID_PATHS),
        body: first_value(payload, TEXT_PATHS),
        display_name: first_value(payload, DISPLAY_NAME_PATHS),
    }
}
