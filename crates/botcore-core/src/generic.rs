//! Built-in `generic` module: entity listing and actor overrides shared by
//! every bot.

use crate::args::Args;
use crate::context::InvocationContext;
use crate::module::{BotModule, CommandHandler, HandlerOutput};
use async_trait::async_trait;
use botcore_catalog::CommandDef;
use botcore_repo::EntityRepository;
use botcore_storage::{Scope, SettingsStore, ACT_AS_SLOT, REPLY_CHAT_SLOT};
use botcore_types::{ContextParam, ParameterDescriptor};
use std::sync::Arc;

pub const GENERIC_MODULE: &str = "generic";

pub struct GenericModule {
    repo: Arc<EntityRepository>,
    settings: SettingsStore,
}

impl GenericModule {
    pub fn new(repo: Arc<EntityRepository>, settings: SettingsStore) -> Self {
        Self { repo, settings }
    }
}

impl BotModule for GenericModule {
    fn name(&self) -> &str {
        GENERIC_MODULE
    }

    fn commands(&self) -> Vec<(CommandDef, Arc<dyn CommandHandler>)> {
        vec![
            (
                CommandDef::new("ent_ty_li")
                    .description("List entities of the active type")
                    .icon("📋")
                    .param(ParameterDescriptor::context(ContextParam::EntityTypeFilter))
                    .param(ParameterDescriptor::context(ContextParam::ChatId)),
                Arc::new(ListEntities {
                    repo: Arc::clone(&self.repo),
                }),
            ),
            (
                CommandDef::new("setng_li")
                    .description("Show your settings in this chat")
                    .icon("⚙️")
                    .param(ParameterDescriptor::context(ContextParam::ChatId))
                    .param(ParameterDescriptor::context(ContextParam::ActorId)),
                Arc::new(ListSettings {
                    settings: self.settings.clone(),
                }),
            ),
            (
                CommandDef::new("su")
                    .description("Act on behalf of another user")
                    .param(ParameterDescriptor::int("actor")),
                Arc::new(ActorOverride {
                    settings: self.settings.clone(),
                    slot: ACT_AS_SLOT,
                    param: "actor",
                }),
            ),
            (
                CommandDef::new("out")
                    .description("Send replies to another chat")
                    .param(ParameterDescriptor::int("chat")),
                Arc::new(ActorOverride {
                    settings: self.settings.clone(),
                    slot: REPLY_CHAT_SLOT,
                    param: "chat",
                }),
            ),
        ]
    }
}

struct ListEntities {
    repo: Arc<EntityRepository>,
}

#[async_trait]
impl CommandHandler for ListEntities {
    async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
        let Some(entity_type) = args.text(ContextParam::EntityTypeFilter.name()) else {
            return Ok(HandlerOutput::Text("Select an entity type!".to_string()));
        };
        let chat = args.int(ContextParam::ChatId.name());
        Ok(HandlerOutput::List(self.repo.list(entity_type, chat)?))
    }
}

struct ListSettings {
    settings: SettingsStore,
}

#[async_trait]
impl CommandHandler for ListSettings {
    async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
        let chat = args.int(ContextParam::ChatId.name());
        let actor = args.int(ContextParam::ActorId.name());
        let scope = Scope { chat, actor };
        let rows = self.settings.all(scope)?;
        if rows.is_empty() {
            return Ok(HandlerOutput::Text("No settings.".to_string()));
        }
        let width = rows.iter().map(|(slot, _)| slot.len()).max().unwrap_or(0);
        let text = rows
            .iter()
            .map(|(slot, value)| {
                format!(
                    "{:>width$} = {}",
                    slot,
                    value.as_deref().unwrap_or("-"),
                    width = width
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(HandlerOutput::Text(text))
    }
}

/// Sets or clears an actor-scoped override slot.
struct ActorOverride {
    settings: SettingsStore,
    slot: &'static str,
    param: &'static str,
}

#[async_trait]
impl CommandHandler for ActorOverride {
    async fn handle(&self, ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
        let scope = Scope::actor(ctx.actor_id);
        match args.int(self.param) {
            Some(value) => {
                self.settings
                    .write(scope, self.slot, Some(&value.to_string()))?;
                Ok(HandlerOutput::Text(format!("{} set to {}", self.param, value)))
            }
            None => {
                self.settings.clear(scope, self.slot)?;
                Ok(HandlerOutput::Text(format!("{} reset", self.param)))
            }
        }
    }
}
