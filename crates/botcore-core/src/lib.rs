//! Botcore Core
//!
//! Argument resolution pipeline, module registry, menus and the runtime that
//! ties them to the catalog, settings and entity repository

pub mod args;
pub mod context;
pub mod dispatch;
pub mod generic;
pub mod menu;
pub mod module;
pub mod pipeline;

pub use args::{Arg, Args};
pub use context::InvocationContext;
pub use dispatch::Dispatcher;
pub use generic::{GenericModule, GENERIC_MODULE};
pub use menu::{Menu, MenuAction, MenuCallback, MenuItem, MenuRegistry};
pub use module::{BotModule, CommandHandler, HandlerOutput, ModuleRegistry};
pub use pipeline::{Outcome, Pipeline};

use anyhow::Result;
use botcore_catalog::Catalog;
use botcore_config::Config;
use botcore_ipc::{EventBus, Invocation, MessageRef, OutboundMessage};
use botcore_repo::{EntityLookup, EntityRepository};
use botcore_storage::{MessageLog, MessageRecord, SettingsStore, Storage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Collects modules and lookups before the runtime is assembled.
pub struct BotCoreBuilder {
    config: Config,
    storage: Arc<Storage>,
    repo: Arc<EntityRepository>,
    settings: SettingsStore,
    modules: Vec<Box<dyn BotModule>>,
}

impl BotCoreBuilder {
    /// Repository shared with the runtime; modules take it for their
    /// handlers.
    pub fn repository(&self) -> Arc<EntityRepository> {
        Arc::clone(&self.repo)
    }

    pub fn settings(&self) -> SettingsStore {
        self.settings.clone()
    }

    pub fn lookup(self, name: &str, lookup: Arc<dyn EntityLookup>) -> Self {
        self.repo.register_lookup(name, lookup);
        self
    }

    pub fn module(mut self, module: impl BotModule + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    pub fn build(self) -> Result<BotCore> {
        for module in &self.modules {
            if let Some(schema) = module.schema() {
                self.storage.execute_batch(schema)?;
                debug!(module = module.name(), "Applied module schema");
            }
        }

        let catalog = Arc::new(Catalog::new(Arc::clone(&self.storage)));
        let mut modules = ModuleRegistry::new();
        modules.register(
            &catalog,
            &GenericModule::new(Arc::clone(&self.repo), self.settings.clone()),
        )?;
        for module in &self.modules {
            modules.register(&catalog, module.as_ref())?;
        }

        let menus = Arc::new(MenuRegistry::from_config(&self.config.menus, &catalog)?);
        let messages = MessageLog::new(Arc::clone(&self.storage));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&catalog),
            self.settings.clone(),
            Arc::clone(&self.repo),
            messages.clone(),
            Arc::new(modules),
        ));
        let event_bus = EventBus::new();
        let dispatcher = Dispatcher::new(Arc::clone(&pipeline), event_bus.clone());

        info!(
            modules = self.modules.len() + 1,
            menus = self.config.menus.len(),
            entity_types = self.repo.registry().len(),
            "Bot core ready"
        );
        Ok(BotCore {
            config: self.config,
            catalog,
            settings: self.settings,
            repo: self.repo,
            messages,
            menus,
            pipeline,
            dispatcher,
            event_bus,
        })
    }
}

pub struct BotCore {
    config: Config,
    catalog: Arc<Catalog>,
    settings: SettingsStore,
    repo: Arc<EntityRepository>,
    messages: MessageLog,
    menus: Arc<MenuRegistry>,
    pipeline: Arc<Pipeline>,
    dispatcher: Dispatcher,
    event_bus: EventBus,
}

impl BotCore {
    pub fn builder(config: Config, storage: Arc<Storage>) -> Result<BotCoreBuilder> {
        config.validate()?;
        let registry = Arc::new(config.entity_registry()?);
        let repo = Arc::new(EntityRepository::new(Arc::clone(&storage), registry));
        let settings = SettingsStore::new(Arc::clone(&storage));
        Ok(BotCoreBuilder {
            config,
            storage,
            repo,
            settings,
            modules: Vec::new(),
        })
    }

    /// Runs an invocation and returns the raw outcome.
    pub async fn invoke(&self, invocation: &Invocation) -> botcore_types::Result<Outcome> {
        self.pipeline.run(invocation).await
    }

    /// Runs an invocation and publishes the rendered reply.
    pub async fn dispatch(&self, invocation: &Invocation) -> Option<OutboundMessage> {
        self.dispatcher.dispatch(invocation).await
    }

    /// Logs a chat message; command messages are dispatched to `module`.
    pub async fn handle_message(&self, module: &str, message: MessageRef) -> Option<OutboundMessage> {
        match Invocation::from_message(module, message.clone()) {
            Some(invocation) => self.dispatch(&invocation).await,
            None => {
                if let Err(e) = self.messages.record(&MessageRecord::from_message(&message)) {
                    warn!(chat_id = message.chat_id, "Failed to log message: {}", e);
                }
                None
            }
        }
    }

    /// Handles inline keyboard callback data.
    pub async fn select_menu(&self, data: &str, chat_id: i64, actor_id: i64) -> Option<OutboundMessage> {
        let Some(callback) = MenuCallback::parse(data) else {
            warn!(data, "Ignoring malformed menu callback");
            return None;
        };
        match self.menus.select(&callback, chat_id, actor_id) {
            Ok(MenuAction::Invoke(invocation)) => self.dispatch(&invocation).await,
            Ok(MenuAction::Open { text, rows }) => {
                let mut message = OutboundMessage::text(chat_id, &text);
                message.inline_keyboard = Some(rows);
                self.dispatcher.publish(message.clone());
                Some(message)
            }
            Err(e) => {
                let message = dispatch::error_reply(None, chat_id, None, &e);
                self.dispatcher.publish(message.clone());
                Some(message)
            }
        }
    }

    /// Subscribes to the event bus, then dispatches its invocations on a
    /// background task until the bus closes. Invocations published after
    /// this returns are not missed.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inbound_rx = self.event_bus.subscribe();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(inbound_rx).await })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn repository(&self) -> &EntityRepository {
        &self.repo
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn menus(&self) -> &MenuRegistry {
        &self.menus
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use botcore_catalog::CommandDef;
    use botcore_config::{EntityTypeConfig, MenuConfig, MenuItemConfig};
    use botcore_storage::{Scope, SettingValue};
    use botcore_types::{ContextParam, CoreError, Entity, ParameterDescriptor};
    use std::sync::Mutex;

    const DOCS_SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS folder (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bkey TEXT NOT NULL,
            chat_id INTEGER NOT NULL,
            UNIQUE(chat_id, bkey)
        );
        CREATE TABLE IF NOT EXISTS user (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bkey TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS note (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            folder_id INTEGER REFERENCES folder(id)
        );
    "#;

    fn entity_type(id: &str, parent: Option<&str>) -> EntityTypeConfig {
        EntityTypeConfig {
            id: id.to_string(),
            module: "docs".to_string(),
            description: None,
            table: None,
            type_tag: None,
            parent: parent.map(String::from),
            key_column: None,
            expand_depth: None,
            lookup: None,
            enums: Vec::new(),
        }
    }

    fn docs_config() -> Config {
        Config {
            entity_types: vec![
                entity_type("folder", None),
                entity_type("note", Some("folder")),
                entity_type("user", None),
            ],
            menus: vec![MenuConfig {
                id: "docs".to_string(),
                label: Some("Documents".to_string()),
                items: vec![
                    MenuItemConfig {
                        parent: None,
                        id: "folder".to_string(),
                        label: "Folders".to_string(),
                        command: None,
                        args: None,
                    },
                    MenuItemConfig {
                        parent: Some("folder".to_string()),
                        id: "new".to_string(),
                        label: "New folder".to_string(),
                        command: Some("docs:folder_new".to_string()),
                        args: None,
                    },
                ],
            }],
            ..Config::default()
        }
    }

    struct Docs {
        repo: Arc<EntityRepository>,
        seen: Arc<Mutex<Vec<Args>>>,
    }

    impl BotModule for Docs {
        fn name(&self) -> &str {
            "docs"
        }

        fn commands(&self) -> Vec<(CommandDef, Arc<dyn CommandHandler>)> {
            vec![
                (
                    CommandDef::new("folder_new")
                        .icon("📁")
                        .param(ParameterDescriptor::required("bkey"))
                        .param(ParameterDescriptor::context(ContextParam::ChatId)),
                    Arc::new(NewFolder {
                        repo: Arc::clone(&self.repo),
                    }),
                ),
                (
                    CommandDef::new("folder_pick")
                        .param(ParameterDescriptor::required_lookup("folder", "folder", "Folder")),
                    Arc::new(PickFolder),
                ),
                (
                    CommandDef::new("note_new")
                        .param(ParameterDescriptor::required("title"))
                        .param(ParameterDescriptor::current_entity("folder", "folder", "Folder")),
                    Arc::new(NewNote {
                        repo: Arc::clone(&self.repo),
                    }),
                ),
                (
                    CommandDef::new("create")
                        .param(ParameterDescriptor::positional("title"))
                        .param(ParameterDescriptor::current_entity("owner", "user", "User")),
                    Arc::new(Recorder {
                        seen: Arc::clone(&self.seen),
                    }),
                ),
                (
                    CommandDef::new("folder_show")
                        .param(ParameterDescriptor::required_lookup("folder", "folder", "Folder")),
                    Arc::new(Recorder {
                        seen: Arc::clone(&self.seen),
                    }),
                ),
                (
                    CommandDef::new("lang_show").param(ParameterDescriptor::current_value("lang")),
                    Arc::new(Recorder {
                        seen: Arc::clone(&self.seen),
                    }),
                ),
            ]
        }

        fn schema(&self) -> Option<&str> {
            Some(DOCS_SCHEMA)
        }
    }

    struct NewFolder {
        repo: Arc<EntityRepository>,
    }

    #[async_trait]
    impl CommandHandler for NewFolder {
        async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
            let mut folder = Entity::new("folder");
            if let Some(bkey) = args.text("bkey") {
                folder.set("bkey", bkey);
            }
            if let Some(chat) = args.int("chat_id") {
                folder.set("chat_id", chat);
            }
            Ok(HandlerOutput::Entity(self.repo.insert(&folder)?))
        }
    }

    struct PickFolder;

    #[async_trait]
    impl CommandHandler for PickFolder {
        async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
            let folder = args
                .entity("folder")
                .cloned()
                .ok_or_else(|| CoreError::not_found("Folder", "?"))?;
            Ok(HandlerOutput::Entity(folder))
        }
    }

    struct NewNote {
        repo: Arc<EntityRepository>,
    }

    #[async_trait]
    impl CommandHandler for NewNote {
        async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
            let mut note = Entity::new("note");
            if let Some(title) = args.text("title") {
                note.set("title", title);
            }
            if let Some(folder) = args.entity("folder") {
                note.set("folder", folder.clone());
            }
            Ok(HandlerOutput::Entity(self.repo.insert(&note)?))
        }
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<Args>>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn handle(&self, _ctx: &InvocationContext, args: Args) -> anyhow::Result<HandlerOutput> {
            self.seen.lock().expect("seen lock").push(args);
            Ok(HandlerOutput::Nothing)
        }
    }

    fn bot_core() -> (BotCore, Arc<Mutex<Vec<Args>>>) {
        let storage = Arc::new(Storage::in_memory().expect("storage"));
        let builder = BotCore::builder(docs_config(), storage).expect("builder");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let docs = Docs {
            repo: builder.repository(),
            seen: Arc::clone(&seen),
        };
        (builder.module(docs).build().expect("bot"), seen)
    }

    #[tokio::test]
    async fn free_text_binds_in_declaration_order() {
        let (bot, seen) = bot_core();
        let reply = bot
            .dispatch(&Invocation::new("docs", "create", 7, 3).with_text("My Title"))
            .await;
        assert!(reply.is_none());

        {
            let seen = seen.lock().expect("seen lock");
            let args = &seen[0];
            assert_eq!(args.names().collect::<Vec<_>>(), vec!["title", "cu__owner"]);
            assert_eq!(args.text("title"), Some("My Title"));
            assert!(args.get("owner").is_absent());
        }

        // once a current user is remembered the same call binds it
        let alice = bot
            .repository()
            .insert(&Entity::new("user").with("bkey", "alice"))
            .expect("user");
        let user_type = bot.repository().registry().get("user").expect("user type");
        bot.settings()
            .write_entity(Scope::chat_actor(7, 3), user_type, alice.id.expect("id"))
            .expect("remember");
        bot.dispatch(&Invocation::new("docs", "create", 7, 3).with_text("Second"))
            .await;

        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen[1].entity("owner").and_then(|e| e.id), alice.id);
    }

    #[tokio::test]
    async fn named_values_go_through_the_pipeline() {
        let (bot, seen) = bot_core();
        bot.dispatch(&Invocation::new("docs", "create", 7, 3).with_named(&[("title", "My  Title")]))
            .await;
        bot.dispatch(
            &Invocation::new("docs", "create", 7, 3)
                .with_named(&[("owner", "ignored"), ("title", "Named")]),
        )
        .await;

        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen[0].text("title"), Some("My Title"));
        assert!(seen[0].get("owner").is_absent());
        assert_eq!(seen[1].text("title"), Some("Named"));
        assert!(seen[1].get("owner").is_absent());
    }

    #[tokio::test]
    async fn current_scalar_comes_from_the_settings_store() {
        let (bot, seen) = bot_core();
        bot.dispatch(&Invocation::new("docs", "lang_show", 7, 3)).await;
        bot.settings()
            .write(Scope::chat_actor(7, 3), "lang", Some("EN"))
            .expect("write");
        // free text never reaches a current-lookup parameter
        bot.dispatch(&Invocation::new("docs", "lang_show", 7, 3).with_text("VI"))
            .await;

        let seen = seen.lock().expect("seen lock");
        assert!(seen[0].get("lang").is_absent());
        assert_eq!(seen[1].text("lang"), Some("EN"));
    }

    #[tokio::test]
    async fn non_numeric_lookup_tokens_bind_absent() {
        let (bot, seen) = bot_core();
        let created = bot
            .invoke(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("folder_new");
        let folder_id = created.output.entity().and_then(|e| e.id).expect("folder id");

        bot.dispatch(&Invocation::new("docs", "folder_show", 7, 3).with_text("inbox"))
            .await;
        bot.dispatch(&Invocation::new("docs", "folder_show", 7, 3).with_text(&folder_id.to_string()))
            .await;

        let seen = seen.lock().expect("seen lock");
        assert!(seen[0].get("folder").is_absent());
        assert_eq!(seen[1].entity("folder").and_then(|e| e.id), Some(folder_id));
    }

    #[tokio::test]
    async fn picked_entity_becomes_current_for_later_commands() {
        let (bot, _) = bot_core();
        let created = bot
            .invoke(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("folder_new");
        let folder_id = created.output.entity().and_then(|e| e.id).expect("folder id");

        // another folder becomes current, then the first one is picked again
        bot.invoke(&Invocation::new("docs", "folder_new", 7, 3).with_text("archive"))
            .await
            .expect("second folder");
        bot.invoke(&Invocation::new("docs", "folder_pick", 7, 3).with_text(&folder_id.to_string()))
            .await
            .expect("pick");
        assert_eq!(
            bot.settings()
                .read(Scope::chat_actor(7, 3), "folder_id")
                .expect("read"),
            SettingValue::Set(folder_id.to_string())
        );

        let note = bot
            .invoke(&Invocation::new("docs", "note_new", 7, 3).with_text("Hello world"))
            .await
            .expect("note_new");
        let note = note.output.entity().cloned().expect("note");
        assert_eq!(note.text("title"), Some("Hello world"));
        assert_eq!(note.reference("folder").and_then(|f| f.id), Some(folder_id));
    }

    #[tokio::test]
    async fn failures_reach_the_actor_as_messages() {
        let (bot, _) = bot_core();
        let mut outbound = bot.event_bus().outbound_subscribe();

        bot.dispatch(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("created reply");
        let duplicate = bot
            .dispatch(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("conflict reply");
        assert_eq!(duplicate.text, "🚫 Folder inbox already exists!");
        assert_eq!(duplicate.chat_id, 7);

        let missing = bot
            .dispatch(&Invocation::new("docs", "folder_new", 7, 3))
            .await
            .expect("validation reply");
        assert_eq!(missing.text, "🚫 Argument bkey at position 1 required!");

        let unknown = bot
            .dispatch(&Invocation::new("docs", "nope", 7, 3))
            .await
            .expect("not found reply");
        assert!(unknown.text.starts_with("🚫"));

        let published = outbound.try_recv().expect("published");
        assert!(published.text.starts_with("inbox (1)"));
    }

    #[tokio::test]
    async fn bad_lookup_ids_bind_absent() {
        let (bot, _) = bot_core();
        let err = bot
            .invoke(&Invocation::new("docs", "folder_pick", 7, 3).with_text("99"))
            .await
            .expect_err("unknown folder");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn acting_for_another_actor_changes_the_scope() {
        let (bot, _) = bot_core();
        bot.invoke(&Invocation::new(GENERIC_MODULE, "su", 7, 3).with_text("5"))
            .await
            .expect("su");
        bot.invoke(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("folder_new");

        assert!(bot
            .settings()
            .read(Scope::chat_actor(7, 5), "folder_id")
            .expect("read")
            .value()
            .is_some());
        assert!(bot
            .settings()
            .read(Scope::chat_actor(7, 3), "folder_id")
            .expect("read")
            .is_absent());

        bot.invoke(&Invocation::new(GENERIC_MODULE, "su", 7, 3))
            .await
            .expect("su reset");
        let outcome = bot
            .invoke(&Invocation::new("docs", "create", 7, 3))
            .await
            .expect("create");
        assert_eq!(outcome.context.acting_actor_id, 3);
    }

    #[tokio::test]
    async fn entity_listing_follows_the_type_filter() {
        let (bot, _) = bot_core();
        bot.invoke(&Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .await
            .expect("folder_new");
        bot.invoke(&Invocation::new("docs", "folder_new", 8, 3).with_text("elsewhere"))
            .await
            .expect("other chat");

        let reply = bot
            .dispatch(&Invocation::new(GENERIC_MODULE, "ent_ty_li", 7, 3).with_entity_type("folder"))
            .await
            .expect("list reply");
        assert_eq!(reply.text, "inbox (1)");

        let reply = bot
            .dispatch(&Invocation::new(GENERIC_MODULE, "ent_ty_li", 7, 3))
            .await
            .expect("hint reply");
        assert_eq!(reply.text, "Select an entity type!");
    }

    #[tokio::test]
    async fn menu_items_open_levels_and_run_commands() {
        let (bot, _) = bot_core();
        let menu = bot.menus().get("docs").expect("menu");
        assert_eq!(
            menu.item_by_id("folder.new").and_then(|i| i.icon.clone()),
            Some("📁".to_string())
        );

        let open = bot.select_menu("docs:folder", 7, 3).await.expect("open");
        let rows = open.inline_keyboard.expect("keyboard");
        assert_eq!(rows[0][0].text, "📁 New folder");
        assert_eq!(rows[0][0].callback_data, "docs:folder.new");

        let created = bot
            .select_menu("docs:folder.new projects", 7, 3)
            .await
            .expect("created");
        assert!(created.text.starts_with("projects"));

        let missing = bot.select_menu("docs:unknown", 7, 3).await.expect("error");
        assert!(missing.text.starts_with("🚫"));
        assert!(bot.select_menu("garbage", 7, 3).await.is_none());
    }

    #[tokio::test]
    async fn started_core_dispatches_published_invocations() {
        let (bot, _) = bot_core();
        let mut outbound = bot.event_bus().outbound_subscribe();
        let task = bot.start();

        bot.event_bus()
            .publish(Invocation::new("docs", "folder_new", 7, 3).with_text("inbox"))
            .expect("publish");
        let reply = tokio::time::timeout(std::time::Duration::from_secs(5), outbound.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert!(reply.text.starts_with("inbox (1)"));
        task.abort();
    }

    #[tokio::test]
    async fn plain_messages_are_logged_and_commands_dispatched() {
        let (bot, _) = bot_core();
        let plain = MessageRef::new(7, 1).from_actor(3).with_text("hello");
        assert!(bot.handle_message("docs", plain).await.is_none());
        assert!(bot.messages().get(7, 1).expect("get").is_some());

        let command = MessageRef::new(7, 2).from_actor(3).with_text("/folder_new inbox");
        let reply = bot.handle_message("docs", command).await.expect("reply");
        assert_eq!(reply.reply_to, Some(2));
        let logged = bot.messages().get(7, 2).expect("get").expect("logged");
        assert_eq!(logged.command.as_deref(), Some("folder_new"));
    }
}
