//! Botcore Catalog
//!
//! Persisted module → command → parameter metadata with a process-lifetime
//! cache per module

use botcore_storage::Storage;
use botcore_types::{CoreError, ParameterDescriptor, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Behaviour tag derived from a command's short name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    /// Result becomes the actor's current entity of its type.
    InsertEntity,
    /// Same memory effect as `InsertEntity`, for selection commands.
    PickEntity,
    Plain,
}

impl CommandTag {
    pub fn for_name(name: &str) -> Self {
        if name == "new" || name.ends_with("_new") {
            CommandTag::InsertEntity
        } else if name == "pick" || name.ends_with("_pick") {
            CommandTag::PickEntity
        } else {
            CommandTag::Plain
        }
    }

    pub fn remembers_result(&self) -> bool {
        !matches!(self, CommandTag::Plain)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub module: String,
    pub name: String,
    pub long_name: String,
    pub description: String,
    pub icon: Option<String>,
    pub handler_ref: String,
    pub params: Vec<ParameterDescriptor>,
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        CommandTag::for_name(&self.name)
    }

    /// Parameters that consume raw tokens, in declaration order.
    pub fn bindable_params(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.params.iter().filter(|p| p.kind.binds_token())
    }

    /// `/name <title> [owner]: description`
    pub fn usage(&self) -> String {
        let mut line = format!("/{}", self.name);
        for p in self.bindable_params() {
            if p.is_required() {
                line.push_str(&format!(" <{}>", p.slot()));
            } else {
                line.push_str(&format!(" [{}]", p.slot()));
            }
        }
        if !self.description.is_empty() {
            line.push_str(": ");
            line.push_str(&self.description);
        }
        line
    }
}

/// Registration input for one command.
#[derive(Debug, Clone)]
pub struct CommandDef {
    pub name: String,
    pub description: String,
    pub icon: Option<String>,
    pub handler_ref: Option<String>,
    pub params: Vec<ParameterDescriptor>,
}

impl CommandDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            icon: None,
            handler_ref: None,
            params: Vec::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    pub fn handler(mut self, handler_ref: &str) -> Self {
        self.handler_ref = Some(handler_ref.to_string());
        self
    }

    pub fn param(mut self, param: ParameterDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: Vec<ParameterDescriptor>) -> Self {
        self.params = params;
        self
    }

    fn validate(&self, module: &str) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(char::is_whitespace) {
            return Err(CoreError::Config(format!(
                "invalid command name '{}' in module '{}'",
                self.name, module
            )));
        }
        let mut seen = HashSet::new();
        for p in &self.params {
            if !seen.insert(p.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "parameter '{}' declared twice on {}:{}",
                    p.name, module, self.name
                )));
            }
        }
        Ok(())
    }
}

type ModuleCommands = Arc<BTreeMap<String, Command>>;

pub struct Catalog {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, ModuleCommands>>,
}

impl Catalog {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        module: &str,
        name: &str,
        params: Vec<ParameterDescriptor>,
    ) -> Result<Command> {
        self.register_command(module, CommandDef::new(name).params(params))
    }

    /// Idempotent: an existing (module, name) is returned unchanged.
    pub fn register_command(&self, module: &str, def: CommandDef) -> Result<Command> {
        def.validate(module)?;
        let (command, created) = self.storage.write(|conn| {
            let module_id = ensure_module(conn, module)?;
            if let Some(existing) = load_command(conn, module, module_id, &def.name)? {
                return Ok((existing, false));
            }
            insert_command(conn, module_id, module, &def)?;
            let command = load_command(conn, module, module_id, &def.name)?
                .ok_or_else(|| CoreError::not_found("Command", &def.name))?;
            Ok((command, true))
        })?;

        if created {
            info!(module, command = %command.name, params = command.params.len(), "Registered command");
            self.invalidate(module);
        } else {
            debug!(module, command = %command.name, "Command already registered");
        }
        Ok(command)
    }

    /// Replaces the persisted metadata of a command and drops the module's
    /// cached entry.
    pub fn reregister(&self, module: &str, def: CommandDef) -> Result<Command> {
        def.validate(module)?;
        let command = self.storage.write(|conn| {
            let module_id = ensure_module(conn, module)?;
            conn.execute(
                "DELETE FROM command WHERE module_id = ?1 AND name = ?2",
                params![module_id, def.name],
            )?;
            insert_command(conn, module_id, module, &def)?;
            load_command(conn, module, module_id, &def.name)?
                .ok_or_else(|| CoreError::not_found("Command", &def.name))
        })?;
        info!(module, command = %command.name, "Re-registered command");
        self.invalidate(module);
        Ok(command)
    }

    /// Commands of `module` by short name. A miss loads under the cache
    /// write lock, so an invalidation cannot land between the load and the
    /// insert.
    pub fn lookup(&self, module: &str) -> Result<ModuleCommands> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
        {
            return Ok(Arc::clone(hit));
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(module) {
            return Ok(Arc::clone(hit));
        }
        let commands = self.storage.read(|conn| {
            let module_id = module_id(conn, module)?
                .ok_or_else(|| CoreError::not_found("Module", module))?;
            load_module(conn, module, module_id)
        })?;
        let commands = Arc::new(commands);
        debug!(module, commands = commands.len(), "Loaded module catalog");
        cache.insert(module.to_string(), Arc::clone(&commands));
        Ok(commands)
    }

    pub fn command(&self, module: &str, name: &str) -> Result<Command> {
        self.lookup(module)?
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Command", name))
    }

    /// Usage lines of `module`, optionally limited to names starting with
    /// `prefix`.
    pub fn describe(&self, module: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let commands = self.lookup(module)?;
        Ok(commands
            .values()
            .filter(|c| prefix.map_or(true, |p| c.name.starts_with(p)))
            .map(Command::usage)
            .collect())
    }

    pub fn modules(&self) -> Result<Vec<String>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM module ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn invalidate(&self, module: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
    }
}

fn module_id(conn: &Connection, module: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM module WHERE name = ?1",
            params![module],
            |row| row.get(0),
        )
        .optional()?)
}

fn ensure_module(conn: &Connection, module: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO module (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![module],
    )?;
    module_id(conn, module)?.ok_or_else(|| CoreError::not_found("Module", module))
}

fn insert_command(conn: &Connection, module_id: i64, module: &str, def: &CommandDef) -> Result<()> {
    let long_name = format!("{}_{}", module, def.name);
    let handler_ref = def
        .handler_ref
        .clone()
        .unwrap_or_else(|| format!("cmd_{}", def.name));
    conn.execute(
        "INSERT INTO command (module_id, name, long_name, description, handler_ref, icon)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![module_id, def.name, long_name, def.description, handler_ref, def.icon],
    )?;
    let command_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO command_param (command_id, position, name, type_tag, kind, entity_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (position, p) in def.params.iter().enumerate() {
        stmt.execute(params![
            command_id,
            position as i64,
            p.name,
            p.type_tag,
            p.kind.as_code(),
            p.entity_type,
        ])?;
    }
    Ok(())
}

struct CommandRow {
    id: i64,
    name: String,
    long_name: String,
    description: Option<String>,
    handler_ref: String,
    icon: Option<String>,
}

fn command_rows(conn: &Connection, module_id: i64, name: Option<&str>) -> Result<Vec<CommandRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, long_name, description, handler_ref, icon
         FROM command
         WHERE module_id = ?1 AND (?2 IS NULL OR name = ?2)
         ORDER BY name",
    )?;
    let rows = stmt.query_map(params![module_id, name], |row| {
        Ok(CommandRow {
            id: row.get(0)?,
            name: row.get(1)?,
            long_name: row.get(2)?,
            description: row.get(3)?,
            handler_ref: row.get(4)?,
            icon: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn load_params(conn: &Connection, row: &CommandRow) -> Result<Vec<ParameterDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT name, type_tag, kind, entity_type
         FROM command_param
         WHERE command_id = ?1
         ORDER BY position",
    )?;
    let rows = stmt.query_map(params![row.id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, Option<String>>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (name, type_tag, kind, entity_type) = r?;
        let param = ParameterDescriptor::from_parts(&name, &type_tag, &kind, entity_type)
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "stored parameter '{}' of {} has unknown kind '{}'",
                    name, row.long_name, kind
                ))
            })?;
        out.push(param);
    }
    Ok(out)
}

fn to_command(conn: &Connection, module: &str, row: CommandRow) -> Result<Command> {
    let params = load_params(conn, &row)?;
    Ok(Command {
        module: module.to_string(),
        name: row.name,
        long_name: row.long_name,
        description: row.description.unwrap_or_default(),
        icon: row.icon,
        handler_ref: row.handler_ref,
        params,
    })
}

fn load_command(conn: &Connection, module: &str, module_id: i64, name: &str) -> Result<Option<Command>> {
    match command_rows(conn, module_id, Some(name))?.into_iter().next() {
        Some(row) => Ok(Some(to_command(conn, module, row)?)),
        None => Ok(None),
    }
}

fn load_module(conn: &Connection, module: &str, module_id: i64) -> Result<BTreeMap<String, Command>> {
    let mut out = BTreeMap::new();
    for row in command_rows(conn, module_id, None)? {
        let command = to_command(conn, module, row)?;
        out.insert(command.name.clone(), command);
    }
    Ok(out)
}
