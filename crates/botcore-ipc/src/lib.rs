//! Botcore IPC
//!
//! Invocation envelopes from the transport and outbound replies back to it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// A chat message as seen by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub actor_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            message_id,
            chat_id,
            actor_id: None,
            text: None,
            date: None,
        }
    }

    pub fn from_actor(mut self, actor_id: i64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn is_command(&self) -> bool {
        self.text.as_deref().is_some_and(is_command_text)
    }
}

/// Commands start with `/` or `.`.
pub fn is_command_text(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with('/') || text.starts_with('.')
}

/// Splits `/name@bot tail` (or `.name tail`) into the command name and the
/// free-text tail.
pub fn split_command_text(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !is_command_text(text) {
        return None;
    }
    let body = &text[1..];
    let (head, tail) = match body.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (body, ""),
    };
    let name = head.split('@').next().unwrap_or(head).trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), tail.to_string()))
}

/// Raw arguments of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InvocationInput {
    /// Free-text tail after the command name.
    Text(String),
    /// Values keyed by parameter name, e.g. from a test or another command.
    Named(Vec<(String, String)>),
}

impl Default for InvocationInput {
    fn default() -> Self {
        InvocationInput::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub module: String,
    pub command: String,
    pub chat_id: i64,
    pub actor_id: i64,
    #[serde(default)]
    pub input: InvocationInput,
    /// The message carrying the command, when there is one.
    #[serde(default)]
    pub message: Option<MessageRef>,
    #[serde(default)]
    pub reply_to: Option<MessageRef>,
    /// Active entity type filter for generic commands.
    #[serde(default)]
    pub entity_type: Option<String>,
}

impl Invocation {
    pub fn new(module: &str, command: &str, chat_id: i64, actor_id: i64) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            module: module.to_string(),
            command: command.to_string(),
            chat_id,
            actor_id,
            input: InvocationInput::default(),
            message: None,
            reply_to: None,
            entity_type: None,
        }
    }

    /// Builds an invocation from a command message such as `/create My Title`.
    pub fn from_message(module: &str, message: MessageRef) -> Option<Self> {
        let (command, tail) = split_command_text(message.text.as_deref()?)?;
        let actor_id = message.actor_id?;
        let mut invocation = Self::new(module, &command, message.chat_id, actor_id)
            .with_text(&tail);
        invocation.message = Some(message);
        Some(invocation)
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.input = InvocationInput::Text(text.to_string());
        self
    }

    pub fn with_named(mut self, values: &[(&str, &str)]) -> Self {
        self.input = InvocationInput::Named(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn with_message(mut self, message: MessageRef) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_reply_to(mut self, message: MessageRef) -> Self {
        self.reply_to = Some(message);
        self
    }

    pub fn with_entity_type(mut self, entity_type: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub trace_id: Option<String>,
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    pub inline_keyboard: Option<Vec<Vec<InlineButton>>>,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: &str) -> Self {
        Self {
            trace_id: None,
            chat_id,
            text: text.to_string(),
            reply_to: None,
            inline_keyboard: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Invocation>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invocation> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, invocation: Invocation) -> anyhow::Result<()> {
        self.inbound.send(invocation)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
