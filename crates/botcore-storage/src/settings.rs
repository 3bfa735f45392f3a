//! Actor-scoped settings: remembered "current" selections and per-actor
//! overrides keyed by (chat, actor), chat alone or actor alone.

use crate::Storage;
use botcore_types::{CoreError, EntityId, EntityType, Result};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Actor id an actor currently acts on behalf of.
pub const ACT_AS_SLOT: &str = "su__user_id";
/// Chat that replies to an actor are redirected to.
pub const REPLY_CHAT_SLOT: &str = "out__chat_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub chat: Option<i64>,
    pub actor: Option<i64>,
}

impl Scope {
    pub fn chat_actor(chat: i64, actor: i64) -> Self {
        Self {
            chat: Some(chat),
            actor: Some(actor),
        }
    }

    pub fn chat(chat: i64) -> Self {
        Self {
            chat: Some(chat),
            actor: None,
        }
    }

    pub fn actor(actor: i64) -> Self {
        Self {
            chat: None,
            actor: Some(actor),
        }
    }

    /// Stored scope key. SQLite treats NULLs as distinct in UNIQUE indexes,
    /// so the pair is folded into one non-null column.
    fn key(&self) -> Result<String> {
        match (self.chat, self.actor) {
            (Some(chat), Some(actor)) => Ok(format!("c:{}/a:{}", chat, actor)),
            (Some(chat), None) => Ok(format!("c:{}", chat)),
            (None, Some(actor)) => Ok(format!("a:{}", actor)),
            (None, None) => Err(CoreError::Config(
                "settings scope needs a chat or an actor".to_string(),
            )),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Ok(key) => write!(f, "{}", key),
            Err(_) => write!(f, "-"),
        }
    }
}

/// Result of a settings read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    /// The slot was never written for this scope.
    Absent,
    /// The slot exists but was cleared.
    Cleared,
    Set(String),
}

impl SettingValue {
    pub fn value(&self) -> Option<&str> {
        match self {
            SettingValue::Set(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, SettingValue::Absent)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value().and_then(|v| v.trim().parse().ok())
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    storage: Arc<Storage>,
}

impl SettingsStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Upserts `slot`; `None` clears the value but keeps the row.
    pub fn write(&self, scope: Scope, slot: &str, value: Option<&str>) -> Result<()> {
        let key = scope.key()?;
        debug!(scope = %key, slot, cleared = value.is_none(), "Writing setting");
        self.storage.write(|conn| {
            conn.execute(
                "INSERT INTO setting (scope, scope_chat, scope_actor, slot, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
                 ON CONFLICT(scope, slot) DO UPDATE SET
                    value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP",
                params![key, scope.chat, scope.actor, slot, value],
            )?;
            Ok(())
        })
    }

    /// Reads `slot` for exactly `scope`; broader rows are not consulted.
    pub fn read(&self, scope: Scope, slot: &str) -> Result<SettingValue> {
        let key = scope.key()?;
        let row: Option<Option<String>> = self.storage.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM setting WHERE scope = ?1 AND slot = ?2",
                    params![key, slot],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        Ok(match row {
            None => SettingValue::Absent,
            Some(None) => SettingValue::Cleared,
            Some(Some(value)) => SettingValue::Set(value),
        })
    }

    pub fn clear(&self, scope: Scope, slot: &str) -> Result<()> {
        self.write(scope, slot, None)
    }

    /// Remembers `id` as the current entity of `entity_type`.
    pub fn write_entity(&self, scope: Scope, entity_type: &EntityType, id: i64) -> Result<()> {
        self.write(scope, &entity_type.default_slot(), Some(&id.to_string()))
    }

    /// Current entity of `entity_type`, when one is remembered.
    pub fn read_entity(&self, scope: Scope, entity_type: &EntityType) -> Result<Option<EntityId>> {
        let value = self.read(scope, &entity_type.default_slot())?;
        Ok(value
            .as_i64()
            .map(|id| EntityId::numeric(&entity_type.id, id)))
    }

    /// All slots written for `scope`, ordered by slot name.
    pub fn all(&self, scope: Scope) -> Result<Vec<(String, Option<String>)>> {
        let key = scope.key()?;
        self.storage.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT slot, value FROM setting WHERE scope = ?1 ORDER BY slot")?;
            let rows = stmt.query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::temp_db_path;

    fn store(name: &str) -> SettingsStore {
        let storage = Storage::new(temp_db_path(name)).expect("storage");
        SettingsStore::new(Arc::new(storage))
    }

    #[test]
    fn round_trips_for_every_scope_shape() {
        let settings = store("round-trip");
        for scope in [Scope::chat_actor(7, 3), Scope::chat(7), Scope::actor(3)] {
            settings.write(scope, "lang", Some("EN")).expect("write");
            assert_eq!(
                settings.read(scope, "lang").expect("read"),
                SettingValue::Set("EN".to_string())
            );
        }
    }

    #[test]
    fn cleared_is_distinct_from_absent() {
        let settings = store("cleared");
        let scope = Scope::chat_actor(7, 3);
        assert_eq!(
            settings.read(scope, "folder_id").expect("read"),
            SettingValue::Absent
        );
        settings.write(scope, "folder_id", Some("42")).expect("write");
        settings.clear(scope, "folder_id").expect("clear");
        assert_eq!(
            settings.read(scope, "folder_id").expect("read"),
            SettingValue::Cleared
        );
    }

    #[test]
    fn upsert_never_duplicates_rows() {
        let settings = store("upsert");
        let scope = Scope::chat_actor(7, 3);
        settings.write(scope, "lang", Some("EN")).expect("first");
        settings.write(scope, "lang", Some("VI")).expect("second");
        let all = settings.all(scope).expect("all");
        assert_eq!(all, vec![("lang".to_string(), Some("VI".to_string()))]);
    }

    #[test]
    fn reads_use_exact_scope() {
        let settings = store("exact");
        settings.write(Scope::chat(7), "lang", Some("EN")).expect("write");
        assert!(settings
            .read(Scope::chat_actor(7, 3), "lang")
            .expect("read")
            .is_absent());
    }

    #[test]
    fn remembers_current_entity_under_default_slot() {
        let settings = store("entity");
        let folder = EntityType::new("docs", "folder");
        let scope = Scope::chat_actor(7, 3);
        settings.write_entity(scope, &folder, 42).expect("write");
        assert_eq!(
            settings.read(scope, "folder_id").expect("raw"),
            SettingValue::Set("42".to_string())
        );
        assert_eq!(
            settings.read_entity(scope, &folder).expect("entity"),
            Some(EntityId::numeric("folder", 42))
        );
    }

    #[test]
    fn empty_scope_is_rejected() {
        let settings = store("empty-scope");
        let scope = Scope {
            chat: None,
            actor: None,
        };
        assert!(settings.write(scope, "lang", Some("EN")).is_err());
    }
}
