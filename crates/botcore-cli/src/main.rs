//! Botcore CLI
//!
//! Operator command line over the bot command core: catalog, settings,
//! entities, menus, one-shot invocations and a line-fed dispatch loop

mod logging;

use anyhow::{anyhow, Context, Result};
use botcore_config::Config;
use botcore_core::{BotCore, MenuAction};
use botcore_ipc::{Invocation, MessageRef, OutboundMessage};
use botcore_storage::{MessageRecord, Scope, SettingValue, Storage};
use botcore_types::{Entity, EntityId, EntityKey};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "botcore")]
#[command(about = "Command catalog, settings and entity store for chat bots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides the configured one)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check the configuration and report what it declares
    Validate,

    /// List the commands of a module
    Commands {
        module: String,
        /// Only commands whose name starts with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Settings store commands
    Setting {
        #[command(subcommand)]
        action: SettingCommands,
    },

    /// Entity repository commands
    Entity {
        #[command(subcommand)]
        action: EntityCommands,
    },

    /// Menu commands
    Menu {
        #[command(subcommand)]
        action: MenuCommands,
    },

    /// Run one command through the argument pipeline
    Invoke {
        module: String,
        command: String,
        /// Free-text arguments
        args: Vec<String>,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        chat: i64,
        #[arg(long, default_value = "0")]
        actor: i64,
        /// Active entity type for generic commands
        #[arg(long)]
        entity_type: Option<String>,
        /// Named argument instead of free text (repeatable)
        #[arg(long = "arg", value_name = "NAME=VALUE")]
        named: Vec<String>,
    },

    /// Feed one chat message to the module serving a bot username
    Message {
        /// Bot username, e.g. acme_docs_bot
        #[arg(long)]
        bot: String,
        /// Message text; commands start with '/'
        text: String,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        chat: i64,
        #[arg(long, default_value = "0")]
        actor: i64,
        /// Message id (defaults to the current unix time)
        #[arg(long)]
        id: Option<i64>,
    },

    /// Message log queries
    Messages {
        #[command(subcommand)]
        action: MessageCommands,
    },

    /// Dispatch JSON invocations read line by line from stdin until
    /// interrupted
    Serve,

    /// Log management commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(clap::Args)]
struct ScopeArgs {
    #[arg(long, allow_hyphen_values = true)]
    chat: Option<i64>,
    #[arg(long)]
    actor: Option<i64>,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        Scope {
            chat: self.chat,
            actor: self.actor,
        }
    }
}

#[derive(Subcommand)]
enum SettingCommands {
    /// Read one slot
    Get {
        slot: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Write one slot
    Set {
        slot: String,
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Clear one slot
    Clear {
        slot: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// All slots of a scope
    List {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(Subcommand)]
enum EntityCommands {
    /// Load one entity by id or business key
    Get {
        entity_type: String,
        key: String,
        #[arg(long, allow_hyphen_values = true)]
        chat: Option<i64>,
    },
    /// Children of an entity
    Children {
        entity_type: String,
        key: String,
        child_type: String,
        #[arg(long, allow_hyphen_values = true)]
        chat: Option<i64>,
    },
    /// All entities of a type
    List {
        entity_type: String,
        #[arg(long, allow_hyphen_values = true)]
        chat: Option<i64>,
    },
    /// Tables holding rows that reference an entity
    Refs {
        entity_type: String,
        key: String,
        #[arg(long, allow_hyphen_values = true)]
        chat: Option<i64>,
    },
}

#[derive(Subcommand)]
enum MenuCommands {
    /// Print menus and their items
    Show {
        /// Only this menu
        id: Option<String>,
    },
    /// Print the first-level keyboard of a menu
    Open { id: String },
    /// Simulate a button press with callback data `menu:item [args]`
    Select {
        data: String,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        chat: i64,
        #[arg(long, default_value = "0")]
        actor: i64,
    },
}

#[derive(Subcommand)]
enum MessageCommands {
    /// Most recent message of a chat
    Latest {
        #[arg(long, allow_hyphen_values = true)]
        chat: i64,
        #[arg(long)]
        actor: Option<i64>,
        /// Only messages whose text was a command
        #[arg(long)]
        explicit: bool,
    },
    /// Messages of a chat between two RFC 3339 timestamps
    Range {
        #[arg(long, allow_hyphen_values = true)]
        chat: i64,
        from: String,
        to: String,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Remove logs older than N days
    Clean {
        #[arg(short, long, default_value = "7")]
        days: u64,
    },
    /// Show the last N lines of today's log
    Tail {
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = config_path(cli.config)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, include_str!("../../../config/config.example.toml"))
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Configuration created at: {}", path.display());
        }

        Commands::Validate => {
            let config = load_config(cli.config)?;
            let registry = config.entity_registry()?;
            println!("Configuration is valid.");
            println!("  modules:      {}", config.modules.len());
            println!("  entity types: {}", registry.len());
            println!("  menus:        {}", config.menus.len());
            println!("  database:     {}", config.db_path()?.display());
        }

        Commands::Commands { module, prefix } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            let lines = bot.catalog().describe(&module, prefix.as_deref())?;
            if lines.is_empty() {
                println!("No commands.");
            }
            for line in lines {
                println!("{}", line);
            }
        }

        Commands::Setting { action } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            let settings = bot.settings();
            match action {
                SettingCommands::Get { slot, scope } => {
                    match settings.read(scope.scope(), &slot)? {
                        SettingValue::Absent => println!("{}: not set", slot),
                        SettingValue::Cleared => println!("{}: cleared", slot),
                        SettingValue::Set(value) => println!("{} = {}", slot, value),
                    }
                }
                SettingCommands::Set { slot, value, scope } => {
                    settings.write(scope.scope(), &slot, Some(&value))?;
                    println!("{} = {} ({})", slot, value, scope.scope());
                }
                SettingCommands::Clear { slot, scope } => {
                    settings.clear(scope.scope(), &slot)?;
                    println!("{} cleared ({})", slot, scope.scope());
                }
                SettingCommands::List { scope } => {
                    let rows = settings.all(scope.scope())?;
                    if rows.is_empty() {
                        println!("No settings.");
                    }
                    for (slot, value) in rows {
                        println!("{} = {}", slot, value.as_deref().unwrap_or("-"));
                    }
                }
            }
        }

        Commands::Entity { action } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            let repo = bot.repository();
            match action {
                EntityCommands::Get {
                    entity_type,
                    key,
                    chat,
                } => {
                    let entity = repo.get(&entity_id(&entity_type, &key), chat)?;
                    print_json(&entity)?;
                }
                EntityCommands::Children {
                    entity_type,
                    key,
                    child_type,
                    chat,
                } => {
                    let parent = repo.get(&entity_id(&entity_type, &key), chat)?;
                    let children = repo.get_children(&parent, &child_type)?;
                    print_labels(&children);
                }
                EntityCommands::List { entity_type, chat } => {
                    print_labels(&repo.list(&entity_type, chat)?);
                }
                EntityCommands::Refs {
                    entity_type,
                    key,
                    chat,
                } => {
                    let entity = repo.get(&entity_id(&entity_type, &key), chat)?;
                    let tables = repo.referencing_tables(&entity)?;
                    if tables.is_empty() {
                        println!("{} is not referenced.", entity.label());
                    }
                    for table in tables {
                        println!("{}", table);
                    }
                }
            }
        }

        Commands::Menu { action } => match action {
            MenuCommands::Show { id } => {
                let (bot, _guard) = open_core(cli.config, cli.log_level)?;
                let mut shown = 0;
                for menu in bot.menus().menus() {
                    if id.as_deref().is_some_and(|id| id != menu.id) {
                        continue;
                    }
                    shown += 1;
                    println!("{} ({})", menu.label, menu.id);
                    for item in menu.items() {
                        let depth = item.id.matches('.').count() + 1;
                        let target = item
                            .command
                            .as_ref()
                            .map(|c| format!(" -> {}:{}", c.module, c.name))
                            .unwrap_or_default();
                        println!(
                            "{}{} [{}]{}",
                            "  ".repeat(depth),
                            item.label_with_icon(),
                            item.id,
                            target
                        );
                    }
                }
                if shown == 0 {
                    return Err(anyhow!("No menu found"));
                }
            }
            MenuCommands::Open { id } => {
                let (bot, _guard) = open_core(cli.config, cli.log_level)?;
                match bot.menus().root(&id)? {
                    MenuAction::Open { text, rows } => {
                        let mut message = OutboundMessage::text(0, &text);
                        message.inline_keyboard = Some(rows);
                        print_reply(&message);
                    }
                    MenuAction::Invoke(invocation) => {
                        println!("{}:{}", invocation.module, invocation.command);
                    }
                }
            }
            MenuCommands::Select { data, chat, actor } => {
                let (bot, _guard) = open_core(cli.config, cli.log_level)?;
                match bot.select_menu(&data, chat, actor).await {
                    Some(reply) => print_reply(&reply),
                    None => println!("Nothing to send."),
                }
            }
        },

        Commands::Invoke {
            module,
            command,
            args,
            chat,
            actor,
            entity_type,
            named,
        } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            let mut invocation = Invocation::new(&module, &command, chat, actor);
            if named.is_empty() {
                invocation = invocation.with_text(&args.join(" "));
            } else {
                let pairs = parse_named(&named)?;
                let pairs: Vec<(&str, &str)> =
                    pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                invocation = invocation.with_named(&pairs);
            }
            if let Some(entity_type) = entity_type {
                invocation = invocation.with_entity_type(&entity_type);
            }
            match bot.dispatch(&invocation).await {
                Some(reply) => print_reply(&reply),
                None => println!("Nothing to send."),
            }
        }

        Commands::Message {
            bot: username,
            text,
            chat,
            actor,
            id,
        } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            let module = bot
                .config()
                .module_for_bot(&username)
                .ok_or_else(|| anyhow!("No module serves bot '{}'", username))?;
            let message_id = id.unwrap_or_else(|| Utc::now().timestamp());
            let message = MessageRef::new(chat, message_id)
                .from_actor(actor)
                .with_text(&text);
            match bot.handle_message(&module, message).await {
                Some(reply) => print_reply(&reply),
                None => println!("Logged message {} for {}.", message_id, module),
            }
        }

        Commands::Messages { action } => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            match action {
                MessageCommands::Latest {
                    chat,
                    actor,
                    explicit,
                } => match bot.messages().latest(chat, actor, explicit)? {
                    Some(record) => print_record(&record),
                    None => println!("No messages."),
                },
                MessageCommands::Range { chat, from, to } => {
                    let records = bot.messages().range(chat, parse_time(&from)?, parse_time(&to)?)?;
                    if records.is_empty() {
                        println!("No messages.");
                    }
                    for record in &records {
                        print_record(record);
                    }
                }
            }
        }

        Commands::Serve => {
            let (bot, _guard) = open_core(cli.config, cli.log_level)?;
            serve(&bot).await?;
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(config.data_dir()?.join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, {})",
                            file.display(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let deleted = manager.cleanup(days)?;
                    println!("Cleaned {} old log file(s)", deleted);
                }
                LogCommands::Tail { lines } => {
                    let current = manager.current_log_path();
                    if current.exists() {
                        let content = fs::read_to_string(&current)?;
                        let all_lines: Vec<&str> = content.lines().collect();
                        let start = all_lines.len().saturating_sub(lines);
                        for line in &all_lines[start..] {
                            println!("{}", line);
                        }
                    } else {
                        println!("No log file found at {}", current.display());
                    }
                }
            }
        }
    }

    Ok(())
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("Cannot resolve config directory")),
    }
}

fn load_config(config_path_arg: Option<String>) -> Result<Config> {
    let path = config_path(config_path_arg)?;
    if !path.exists() {
        anyhow::bail!(
            "No config file at {} (run `botcore init` first)",
            path.display()
        );
    }
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn open_core(
    config_path_arg: Option<String>,
    log_level: Option<String>,
) -> Result<(BotCore, logging::LoggingGuard)> {
    let config = load_config(config_path_arg)?;
    let data_dir = config.data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let level = log_level.unwrap_or_else(|| config.log_level().to_string());
    let guard = logging::init_logging(&data_dir.join("logs"), &level)?;

    let db_path = config.db_path()?;
    let storage = Arc::new(
        Storage::new(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    info!(db = %db_path.display(), "Opened store");
    let bot = BotCore::builder(config, storage)?.build()?;
    Ok((bot, guard))
}

async fn serve(bot: &BotCore) -> Result<()> {
    let mut outbound_rx = bot.event_bus().outbound_subscribe();
    tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(reply) => print_reply(&reply),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Reply printer lagged by {} messages", n);
                }
            }
        }
    });
    let dispatcher = bot.start();

    info!("Reading invocations from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reading = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match Invocation::from_json(&line) {
                    Ok(invocation) => bot.event_bus().publish(invocation)?,
                    Err(e) => warn!("Skipping malformed invocation: {}", e),
                },
                None => {
                    info!("Input closed, dispatching until interrupted");
                    reading = false;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }
    dispatcher.abort();
    Ok(())
}

fn parse_named(values: &[String]) -> Result<Vec<(String, String)>> {
    values
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| anyhow!("Expected NAME=VALUE, got '{}'", pair))
        })
        .collect()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("'{}' is not an RFC 3339 timestamp", value))?
        .with_timezone(&Utc))
}

fn entity_id(entity_type: &str, key: &str) -> EntityId {
    EntityId {
        entity_type: entity_type.to_string(),
        key: EntityKey::parse(key),
        scope: None,
    }
}

fn print_json(entity: &Entity) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(entity)?);
    Ok(())
}

fn print_labels(entities: &[Entity]) {
    if entities.is_empty() {
        println!("No data found.");
    }
    for entity in entities {
        println!("{}", entity.label());
    }
}

fn print_record(record: &MessageRecord) {
    let command = record
        .command
        .as_ref()
        .map(|c| format!(" /{}", c))
        .unwrap_or_default();
    println!(
        "{} #{} actor={}{}: {}",
        record.date.format("%Y-%m-%d %H:%M:%S"),
        record.message_id,
        record
            .actor_id
            .map_or_else(|| "-".to_string(), |a| a.to_string()),
        command,
        record.text.as_deref().unwrap_or("")
    );
}

fn print_reply(reply: &OutboundMessage) {
    println!("[chat {}] {}", reply.chat_id, reply.text);
    for row in reply.inline_keyboard.iter().flatten() {
        let buttons: Vec<String> = row
            .iter()
            .map(|b| format!("[{}] {}", b.callback_data, b.text))
            .collect();
        println!("  {}", buttons.join("  "));
    }
}
