//! Botcore Storage
//!
//! SQLite relational store: catalog, settings and message log schema plus
//! transaction helpers shared by the catalog and the entity repository

pub mod messages;
pub mod settings;

pub use messages::{MessageLog, MessageRecord};
pub use settings::{Scope, SettingValue, SettingsStore, ACT_AS_SLOT, REPLY_CHAT_SLOT};

use botcore_types::Result;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS module (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS command (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                module_id INTEGER NOT NULL REFERENCES module(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                long_name TEXT NOT NULL,
                handler_ref TEXT NOT NULL,
                UNIQUE(module_id, name)
            );

            CREATE TABLE IF NOT EXISTS command_param (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command_id INTEGER NOT NULL REFERENCES command(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                type_tag TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'positional',
                entity_type TEXT,
                UNIQUE(command_id, name),
                UNIQUE(command_id, position)
            );

            CREATE TABLE IF NOT EXISTS setting (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                scope_chat INTEGER,
                scope_actor INTEGER,
                slot TEXT NOT NULL,
                value TEXT,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(scope, slot)
            );

            CREATE TABLE IF NOT EXISTS chat_message (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                actor_id INTEGER,
                date TEXT NOT NULL,
                text TEXT,
                module TEXT,
                command TEXT,
                command_explicit INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_chat_message_date
            ON chat_message(chat_id, date);
            ",
        )?;

        Self::ensure_command_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a deferred (read) transaction.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` inside an immediate transaction; any error rolls it back.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Applies DDL owned by a domain module (its entity tables).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        debug!(sql, "Applying module schema");
        self.lock().execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_command_schema(conn: &Connection) -> Result<()> {
        let mut has_description = false;
        let mut has_icon = false;
        let mut stmt = conn.prepare("PRAGMA table_info(command)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for col in columns {
            let col = col?;
            if col.eq_ignore_ascii_case("description") {
                has_description = true;
            }
            if col.eq_ignore_ascii_case("icon") {
                has_icon = true;
            }
        }

        if !has_description {
            conn.execute("ALTER TABLE command ADD COLUMN description TEXT", [])?;
        }
        if !has_icon {
            conn.execute("ALTER TABLE command ADD COLUMN icon TEXT", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_command_param_position
             ON command_param(command_id, position)",
            [],
        )?;

        Ok(())
    }
}
