//! Per-invocation context, built once by the pipeline and dropped when the
//! invocation returns.

use crate::args::Arg;
use botcore_ipc::{Invocation, MessageRef};
use botcore_storage::{MessageLog, Scope, SettingsStore, ACT_AS_SLOT, REPLY_CHAT_SLOT};
use botcore_types::ContextParam;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub trace_id: String,
    pub module: String,
    pub command: String,
    pub chat_id: i64,
    pub actor_id: i64,
    /// Actor whose state is read and written; differs from `actor_id` while
    /// acting on behalf of someone else.
    pub acting_actor_id: i64,
    /// Chat replies are sent to.
    pub reply_chat_id: i64,
    pub message: Option<MessageRef>,
    pub reply_to: Option<MessageRef>,
    pub source_message: Option<MessageRef>,
    pub entity_type: Option<String>,
}

impl InvocationContext {
    /// Reads the actor overrides and infers the source message. Store
    /// failures degrade to the plain invocation values.
    pub fn load(invocation: &Invocation, settings: &SettingsStore, messages: &MessageLog) -> Self {
        let actor_scope = Scope::actor(invocation.actor_id);
        let acting_actor_id = match settings.read(actor_scope, ACT_AS_SLOT) {
            Ok(value) => value.as_i64().unwrap_or(invocation.actor_id),
            Err(e) => {
                warn!("Failed to read act-as override: {}", e);
                invocation.actor_id
            }
        };
        let reply_chat_id = match settings.read(actor_scope, REPLY_CHAT_SLOT) {
            Ok(value) => value.as_i64().unwrap_or(invocation.chat_id),
            Err(e) => {
                warn!("Failed to read reply chat override: {}", e);
                invocation.chat_id
            }
        };

        let source_message = match &invocation.reply_to {
            Some(reply_to) => Some(reply_to.clone()),
            None => {
                let before = invocation.message.as_ref().map(|m| m.message_id);
                match messages.latest_command(invocation.chat_id, before) {
                    Ok(found) => found.map(|m| m.to_message_ref()),
                    Err(e) => {
                        warn!("Failed to infer source message: {}", e);
                        None
                    }
                }
            }
        };

        Self {
            trace_id: invocation.trace_id.clone(),
            module: invocation.module.clone(),
            command: invocation.command.clone(),
            chat_id: invocation.chat_id,
            actor_id: invocation.actor_id,
            acting_actor_id,
            reply_chat_id,
            message: invocation.message.clone(),
            reply_to: invocation.reply_to.clone(),
            source_message,
            entity_type: invocation.entity_type.clone(),
        }
    }

    /// Scope of remembered selections.
    pub fn scope(&self) -> Scope {
        Scope::chat_actor(self.chat_id, self.acting_actor_id)
    }

    pub fn value(&self, param: ContextParam) -> Arg {
        match param {
            ContextParam::ActorId => Arg::Int(self.acting_actor_id),
            ContextParam::ChatId => Arg::Int(self.chat_id),
            ContextParam::ReplyToMessage => {
                self.reply_to.clone().map_or(Arg::Absent, Arg::Message)
            }
            ContextParam::SourceMessage => {
                self.source_message.clone().map_or(Arg::Absent, Arg::Message)
            }
            ContextParam::ReplyToActorId => self
                .reply_to
                .as_ref()
                .and_then(|m| m.actor_id)
                .map_or(Arg::Absent, Arg::Int),
            ContextParam::EntityTypeFilter => {
                self.entity_type.clone().map_or(Arg::Absent, Arg::Text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botcore_storage::{MessageRecord, Storage};
    use std::sync::Arc;

    fn stores() -> (SettingsStore, MessageLog) {
        let storage = Arc::new(Storage::in_memory().expect("storage"));
        (
            SettingsStore::new(Arc::clone(&storage)),
            MessageLog::new(storage),
        )
    }

    #[test]
    fn overrides_come_from_actor_settings() {
        let (settings, messages) = stores();
        settings
            .write(Scope::actor(3), ACT_AS_SLOT, Some("5"))
            .expect("act as");
        settings
            .write(Scope::actor(3), REPLY_CHAT_SLOT, Some("-100"))
            .expect("reply chat");

        let ctx = InvocationContext::load(&Invocation::new("m1", "show", 7, 3), &settings, &messages);
        assert_eq!(ctx.acting_actor_id, 5);
        assert_eq!(ctx.reply_chat_id, -100);
        assert_eq!(ctx.scope(), Scope::chat_actor(7, 5));
        assert_eq!(ctx.value(ContextParam::ActorId), Arg::Int(5));
    }

    #[test]
    fn source_message_prefers_reply_target() {
        let (settings, messages) = stores();
        let earlier = MessageRef::new(7, 10).from_actor(3).with_text("/pick 4");
        messages
            .record(&MessageRecord::from_message(&earlier).with_command("m1", "pick"))
            .expect("record");

        let current = MessageRef::new(7, 11).from_actor(3).with_text("/show");
        let inv = Invocation::new("m1", "show", 7, 3).with_message(current.clone());
        let ctx = InvocationContext::load(&inv, &settings, &messages);
        assert_eq!(ctx.source_message.as_ref().map(|m| m.message_id), Some(10));

        let target = MessageRef::new(7, 2).from_actor(9).with_text("hello");
        let inv = inv.with_reply_to(target);
        let ctx = InvocationContext::load(&inv, &settings, &messages);
        assert_eq!(ctx.source_message.as_ref().map(|m| m.message_id), Some(2));
        assert_eq!(ctx.value(ContextParam::ReplyToActorId), Arg::Int(9));
        assert_eq!(ctx.value(ContextParam::EntityTypeFilter), Arg::Absent);
    }
}
