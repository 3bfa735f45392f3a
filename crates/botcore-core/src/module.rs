//! Module registry: handler sets registered explicitly at startup.

use crate::args::Args;
use crate::context::InvocationContext;
use async_trait::async_trait;
use botcore_catalog::{Catalog, CommandDef};
use botcore_ipc::InlineButton;
use botcore_types::{Entity, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// What a handler hands back to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Nothing,
    Text(String),
    Entity(Entity),
    List(Vec<Entity>),
    Keyboard {
        text: String,
        rows: Vec<Vec<InlineButton>>,
    },
}

impl HandlerOutput {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            HandlerOutput::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput>;
}

/// A domain module: its commands, their handlers and the DDL of its
/// entity tables.
pub trait BotModule: Send + Sync {
    fn name(&self) -> &str;

    fn commands(&self) -> Vec<(CommandDef, Arc<dyn CommandHandler>)>;

    fn schema(&self) -> Option<&str> {
        None
    }
}

#[derive(Default, Clone)]
pub struct ModuleRegistry {
    handlers: HashMap<String, HashMap<String, Arc<dyn CommandHandler>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists the module's commands in the catalog and keeps its handlers.
    pub fn register(&mut self, catalog: &Catalog, module: &dyn BotModule) -> Result<()> {
        let name = module.name().to_string();
        let commands = module.commands();
        let count = commands.len();
        let handlers = self.handlers.entry(name.clone()).or_default();
        for (def, handler) in commands {
            let command = catalog.register_command(&name, def)?;
            handlers.insert(command.name, handler);
        }
        info!(module = %name, commands = count, "Registered module");
        Ok(())
    }

    pub fn handler(&self, module: &str, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(module)?.get(command).cloned()
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
