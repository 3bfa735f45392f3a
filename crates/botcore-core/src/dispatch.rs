//! Turns pipeline outcomes into outbound chat messages.

use crate::module::HandlerOutput;
use crate::pipeline::{Outcome, Pipeline};
use botcore_ipc::{EventBus, InlineButton, Invocation, OutboundMessage};
use botcore_types::{CoreError, Entity};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EMPTY_LIST: &str = "No data found.";
const ERROR_ICON: &str = "🚫";

#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    bus: EventBus,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, bus: EventBus) -> Self {
        Self { pipeline, bus }
    }

    /// Runs one invocation and publishes the reply, if any.
    pub async fn dispatch(&self, invocation: &Invocation) -> Option<OutboundMessage> {
        let reply = match self.pipeline.run(invocation).await {
            Ok(outcome) => reply_for(invocation, &outcome),
            Err(e) => Some(error_reply(
                Some(&invocation.trace_id),
                invocation.chat_id,
                invocation.message.as_ref().map(|m| m.message_id),
                &e,
            )),
        };

        if let Some(message) = &reply {
            self.publish(message.clone());
        }
        reply
    }

    pub fn publish(&self, message: OutboundMessage) {
        if self.bus.outbound_sender().send(message).is_err() {
            debug!("No outbound subscriber");
        }
    }

    /// Consumes inbound invocations until the bus closes.
    pub async fn run(&self, mut inbound_rx: broadcast::Receiver<Invocation>) {
        info!("Dispatcher started");
        loop {
            match inbound_rx.recv().await {
                Ok(invocation) => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        dispatcher.dispatch(&invocation).await;
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping dispatcher");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} messages", n);
                }
            }
        }
    }
}

fn reply_for(invocation: &Invocation, outcome: &Outcome) -> Option<OutboundMessage> {
    let ctx = &outcome.context;
    let (text, keyboard) = render(&outcome.output)?;
    let reply_to = invocation
        .message
        .as_ref()
        .filter(|_| ctx.reply_chat_id == ctx.chat_id)
        .map(|m| m.message_id);
    Some(OutboundMessage {
        trace_id: Some(ctx.trace_id.clone()),
        chat_id: ctx.reply_chat_id,
        text,
        reply_to,
        inline_keyboard: keyboard,
    })
}

/// The actor-facing message for a failed invocation.
pub fn error_reply(
    trace_id: Option<&str>,
    chat_id: i64,
    reply_to: Option<i64>,
    err: &CoreError,
) -> OutboundMessage {
    let trace = trace_id.unwrap_or("-");
    if err.is_retryable() {
        warn!(trace_id = trace, "Invocation failed: {}", err);
    } else if matches!(
        err,
        CoreError::Handler(_) | CoreError::Config(_) | CoreError::Store(_)
    ) {
        error!(trace_id = trace, "Invocation failed: {}", err);
    } else {
        info!(trace_id = trace, "Invocation rejected: {}", err);
    }
    OutboundMessage {
        trace_id: trace_id.map(String::from),
        chat_id,
        text: format!("{} {}", ERROR_ICON, err.user_message()),
        reply_to,
        inline_keyboard: None,
    }
}

/// Text and optional keyboard of a handler output; `None` when there is
/// nothing to send.
pub fn render(output: &HandlerOutput) -> Option<(String, Option<Vec<Vec<InlineButton>>>)> {
    match output {
        HandlerOutput::Nothing => None,
        HandlerOutput::Text(text) => Some((text.clone(), None)),
        HandlerOutput::Entity(entity) => Some((render_entity(entity), None)),
        HandlerOutput::List(entities) if entities.is_empty() => Some((EMPTY_LIST.to_string(), None)),
        HandlerOutput::List(entities) => Some((
            entities
                .iter()
                .map(Entity::label)
                .collect::<Vec<_>>()
                .join("\n"),
            None,
        )),
        HandlerOutput::Keyboard { text, rows } => Some((text.clone(), Some(rows.clone()))),
    }
}

fn render_entity(entity: &Entity) -> String {
    let mut lines = vec![entity.label()];
    for (field, value) in &entity.fields {
        if value.is_null() {
            continue;
        }
        lines.push(format!("{} = {}", field, value));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_skips_nothing_and_labels_lists() {
        assert!(render(&HandlerOutput::Nothing).is_none());

        let (text, keyboard) = render(&HandlerOutput::List(Vec::new())).expect("empty list");
        assert_eq!(text, EMPTY_LIST);
        assert!(keyboard.is_none());

        let list = HandlerOutput::List(vec![
            Entity::new("folder").with_id(1).with("bkey", "inbox"),
            Entity::new("folder").with_id(2),
        ]);
        let (text, _) = render(&list).expect("list");
        assert_eq!(text, "inbox (1)\nfolder 2");
    }

    #[test]
    fn render_entity_lists_non_null_fields() {
        let entity = Entity::new("note")
            .with_id(4)
            .with("title", "Hello")
            .with("body", botcore_types::Value::Null);
        let (text, _) = render(&HandlerOutput::Entity(entity)).expect("entity");
        assert_eq!(text, "Hello (4)\ntitle = Hello");
    }

    #[test]
    fn keyboards_pass_through() {
        let rows = vec![vec![InlineButton {
            text: "Go".to_string(),
            callback_data: "m:go".to_string(),
        }]];
        let (text, keyboard) = render(&HandlerOutput::Keyboard {
            text: "Pick one".to_string(),
            rows: rows.clone(),
        })
        .expect("keyboard");
        assert_eq!(text, "Pick one");
        assert_eq!(keyboard, Some(rows));
    }

    #[test]
    fn errors_render_with_the_user_message() {
        let reply = error_reply(Some("trace-1"), 7, Some(10), &CoreError::conflict("Folder", "inbox"));
        assert_eq!(reply.chat_id, 7);
        assert_eq!(reply.reply_to, Some(10));
        assert_eq!(reply.text, "🚫 Folder inbox already exists!");
        assert_eq!(reply.trace_id.as_deref(), Some("trace-1"));
    }
}
