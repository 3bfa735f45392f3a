//! Table introspection through SQLite pragmas.

use botcore_types::{CoreError, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Columns and foreign keys of one entity table.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<String>,
    /// Column → referenced table, for foreign keys targeting the `id` column.
    pub foreign_keys: BTreeMap<String, String>,
}

impl TableInfo {
    pub fn load(conn: &Connection, table: &str) -> Result<Self> {
        let mut columns = Vec::new();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for col in rows {
            columns.push(col?);
        }
        if columns.is_empty() {
            return Err(CoreError::Config(format!("table '{}' does not exist", table)));
        }

        let mut foreign_keys = BTreeMap::new();
        let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for fk in rows {
            let (target, from, to) = fk?;
            // A bare `REFERENCES t` targets the primary key.
            if to.as_deref().map_or(true, |to| to == "id") {
                foreign_keys.insert(from, target);
            }
        }

        Ok(Self {
            name: table.to_string(),
            columns,
            foreign_keys,
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn has_chat_scope(&self) -> bool {
        self.has_column("chat_id")
    }
}

/// Names of all user tables.
pub fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_columns_and_id_foreign_keys() {
        let conn = Connection::open_in_memory().expect("conn");
        conn.execute_batch(
            "
            CREATE TABLE folder (id INTEGER PRIMARY KEY, bkey TEXT, chat_id INTEGER);
            CREATE TABLE note (
                id INTEGER PRIMARY KEY,
                folder_id INTEGER REFERENCES folder(id),
                owner_id INTEGER REFERENCES folder,
                folder_bkey TEXT REFERENCES folder(bkey)
            );
            ",
        )
        .expect("schema");

        let folder = TableInfo::load(&conn, "folder").expect("folder");
        assert!(folder.has_chat_scope());
        assert!(folder.foreign_keys.is_empty());

        let note = TableInfo::load(&conn, "note").expect("note");
        assert!(!note.has_chat_scope());
        assert_eq!(note.foreign_keys.get("folder_id").map(String::as_str), Some("folder"));
        assert_eq!(note.foreign_keys.get("owner_id").map(String::as_str), Some("folder"));
        assert!(!note.foreign_keys.contains_key("folder_bkey"));

        assert!(TableInfo::load(&conn, "missing").is_err());
        assert_eq!(user_tables(&conn).expect("tables"), vec!["folder", "note"]);
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote("note"), "\"note\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
