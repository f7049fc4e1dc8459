use chrono::{DateTime, Utc};
use concierge_contracts::{
    AutonomyScope, Contact, ConversationThread, DecisionSource, MessageDraft, PendingAction,
    PrivacyRules, Requester, RiskLevel, ToolRun, ToolRunStatus,
};
use concierge_kernel::autonomy::{scope_enabled, snapshot};
use concierge_kernel::supervisor::MESSAGE_SEND;
use concierge_kernel::text::ContactCommand;
use concierge_kernel::trust::{
    allow_auto_send, apply_label, build_reply_draft, classify, inbound_kind, outbound_kind,
    set_level, status_after_inbound, status_after_outbound, summarize, user_notification,
    SafetyCategory,
};
use serde_json::json;

use crate::store::StoreBackend;
use crate::AppState;

const CONTACT_NOT_FOUND: &str = "No encontre ese contacto. Usa el chat_id.";

/// What the webhook still has to deliver after an inbound contact message was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactFollowUp {
    Nothing,
    AutoReply { chat_id: String, text: String },
    NotifyUser { chat_id: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactOutcome {
    pub thread_id: i64,
    pub follow_up: ContactFollowUp,
}

pub fn upsert_contact(
    store: &mut StoreBackend,
    chat_id: &str,
    display_name: Option<&str>,
) -> Result<Contact, String> {
    let mut contact = match store.contact(chat_id)? {
        Some(existing) => existing,
        None => Contact::new(chat_id, display_name),
    };
    if let Some(name) = display_name.filter(|n| !n.trim().is_empty()) {
        contact.display_name = Some(name.to_string());
    }
    store.save_contact(&contact)?;
    Ok(contact)
}

/// By exact chat id when the identifier has an `@`, otherwise by a unique display-name match.
pub fn find_contact(store: &StoreBackend, identifier: &str) -> Result<Option<Contact>, String> {
    if identifier.contains('@') {
        return store.contact(identifier);
    }
    let needle = identifier.to_lowercase();
    let mut matches: Vec<Contact> = store
        .contacts()?
        .into_iter()
        .filter(|c| {
            c.display_name
                .as_deref()
                .map(|n| n.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
        .collect();
    Ok(if matches.len() == 1 { matches.pop() } else { None })
}

pub fn handle_contact_command(store: &mut StoreBackend, command: ContactCommand) -> Result<String, String> {
    let identifier = match &command {
        ContactCommand::Label { identifier, .. }
        | ContactCommand::Level { identifier, .. }
        | ContactCommand::AutoReply { identifier, .. } => identifier.clone(),
    };
    let Some(mut contact) = find_contact(store, &identifier)? else {
        return Ok(CONTACT_NOT_FOUND.to_string());
    };
    let reply = match command {
        ContactCommand::Label { label, .. } => {
            apply_label(&mut contact, &label);
            format!("Listo, {identifier} ahora es {label}.")
        }
        ContactCommand::Level { level, .. } => {
            set_level(&mut contact, level);
            format!("Confianza actualizada para {identifier}.")
        }
        ContactCommand::AutoReply { enabled: true, .. } => {
            contact.allow_auto_reply = true;
            format!("Auto-reply activado para {identifier}.")
        }
        ContactCommand::AutoReply { enabled: false, .. } => {
            contact.allow_auto_reply = false;
            format!("Auto-reply desactivado para {identifier}.")
        }
    };
    store.save_contact(&contact)?;
    Ok(reply)
}

fn record_outbound_on_thread(thread: &mut ConversationThread, text: &str, now: DateTime<Utc>) {
    thread.last_message_at = Some(now);
    thread.last_summary = Some(summarize(text));
    thread.status = status_after_outbound(thread.status, outbound_kind(text));
    thread.updated_at = now;
}

/// Parks the draft as the user's pending `message_send` unless something is already pending.
fn park_draft(
    store: &mut StoreBackend,
    user_chat_id: &str,
    contact_chat_id: &str,
    thread_id: i64,
    draft: &str,
) -> Result<bool, String> {
    let mut state = store.state(user_chat_id)?;
    if state.pending_action.is_some() {
        return Ok(false);
    }
    state.pending_action = Some(PendingAction::MessageSend(MessageDraft {
        chat_id: contact_chat_id.to_string(),
        thread_id: Some(thread_id),
        text: draft.to_string(),
    }));
    state.last_intent = Some("message_send".to_string());
    store.save_state(&state)?;
    Ok(true)
}

/// Records an inbound message from a third party and decides how it gets answered.
pub fn contact_inbound(
    store: &mut StoreBackend,
    chat_id: &str,
    body: &str,
    display_name: Option<&str>,
    user_chat_id: Option<&str>,
    privacy: &PrivacyRules,
    now: DateTime<Utc>,
) -> Result<ContactOutcome, String> {
    let mut contact = upsert_contact(store, chat_id, display_name)?;
    contact.last_interaction_at = Some(now);
    store.save_contact(&contact)?;

    let mut thread = match store.active_thread(chat_id)? {
        Some(thread) => thread,
        None => store.open_thread(chat_id, now)?,
    };
    let safety = classify(body, privacy);
    let kind = inbound_kind(&safety, thread.status);
    thread.last_message_at = Some(now);
    thread.last_summary = Some(summarize(body));
    thread.status = status_after_inbound(thread.status, kind);
    thread.updated_at = now;
    store.save_thread(&thread)?;

    let quiet = ContactOutcome {
        thread_id: thread.id,
        follow_up: ContactFollowUp::Nothing,
    };
    if safety.closing || !safety.requires_response {
        return Ok(quiet);
    }

    let draft = build_reply_draft(body, display_name);
    let policy = allow_auto_send(Some(&contact), &draft, privacy);
    let reply_autonomy = scope_enabled(
        &snapshot(&store.autonomy_rules()?, now),
        AutonomyScope::MessageReply,
        now,
    );
    let blocked = match policy {
        Err(reason) => Some(reason),
        Ok(()) if safety.category == SafetyCategory::Sensitive => Some("sensitive"),
        Ok(()) if !reply_autonomy => Some("autonomy_off"),
        Ok(()) => None,
    };
    let Some(reason) = blocked else {
        tracing::info!(chat_id, thread_id = thread.id, "contact reply auto-approved");
        return Ok(ContactOutcome {
            thread_id: thread.id,
            follow_up: ContactFollowUp::AutoReply {
                chat_id: chat_id.to_string(),
                text: draft,
            },
        });
    };
    tracing::info!(chat_id, thread_id = thread.id, reason, "contact reply needs the user");

    let Some(user_chat_id) = user_chat_id else {
        return Ok(quiet);
    };
    let parked = park_draft(store, user_chat_id, chat_id, thread.id, &draft)?;
    let text = user_notification(
        contact.name(),
        body,
        if parked { Some(draft.as_str()) } else { None },
    );
    Ok(ContactOutcome {
        thread_id: thread.id,
        follow_up: ContactFollowUp::NotifyUser {
            chat_id: user_chat_id.to_string(),
            text,
        },
    })
}

impl AppState {
    /// Sends `text` to a contact and moves its thread forward. Returns whether delivery succeeded.
    pub(crate) async fn send_contact_reply(
        &self,
        thread_id: Option<i64>,
        chat_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let delivered = self.send_and_store(chat_id, text, now).await?;
        self.with_store(|store| {
            if let Some(mut thread) = thread_id.map(|id| store.thread(id)).transpose()?.flatten() {
                record_outbound_on_thread(&mut thread, text, now);
                store.save_thread(&thread)?;
            }
            if let Some(mut contact) = store.contact(chat_id)? {
                contact.last_interaction_at = Some(now);
                store.save_contact(&contact)?;
            }
            Ok(())
        })
        .await?;
        Ok(delivered)
    }

    pub(crate) async fn handle_contact_message(
        &self,
        chat_id: &str,
        body: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let user_chat_id = self.user_chat_id();
        let outcome = {
            // Parking a draft writes the user's conversation state.
            let _user_turn = match user_chat_id {
                Some(user) => Some(self.locks.acquire(user).await),
                None => None,
            };
            self.with_store(|store| {
                contact_inbound(store, chat_id, body, display_name, user_chat_id, &self.privacy, now)
            })
            .await?
        };
        match outcome.follow_up {
            ContactFollowUp::Nothing => Ok(()),
            ContactFollowUp::NotifyUser { chat_id, text } => {
                self.send_and_store(&chat_id, &text, now).await.map(|_| ())
            }
            ContactFollowUp::AutoReply { chat_id, text } => {
                let delivered = self
                    .send_contact_reply(Some(outcome.thread_id), &chat_id, &text, now)
                    .await?;
                let autonomy_snapshot = self.with_store(|s| Ok(snapshot(&s.autonomy_rules()?, now))).await?;
                self.record_tool_run(ToolRun {
                    tool_name: MESSAGE_SEND.to_string(),
                    status: if delivered {
                        ToolRunStatus::Success
                    } else {
                        ToolRunStatus::Error
                    },
                    input: json!({"chat_id": chat_id, "text": text}),
                    output: json!({"sent": delivered}),
                    decision_source: DecisionSource::Supervisor,
                    requested_by: Requester::Worker,
                    risk_level: RiskLevel::Medium,
                    autonomy_snapshot,
                    created_at: now,
                })
                .await
            }
        }
    }
}
