//! Botcore Entity Repository
//!
//! Generic lookup, insert, update and delete over registered entity types,
//! with recursive foreign-key expansion and parent → child loading

pub mod table;

pub use table::TableInfo;

use botcore_storage::Storage;
use botcore_types::{
    constraint_violation, is_foreign_key_violation, is_unique_violation, CoreError, Entity, EntityId, EntityKey, EntityType, EntityTypeRegistry,
    OwnerScope, Result, Value,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use table::quote;
use tracing::{debug, info, warn};

/// Custom business-key resolution for an entity type.
pub trait EntityLookup: Send + Sync {
    /// Row id matching `key`, or `None`.
    fn find_id(
        &self,
        conn: &Connection,
        entity_type: &EntityType,
        key: &str,
        scope: Option<OwnerScope>,
    ) -> Result<Option<i64>>;
}

type RawRow = Vec<(String, SqlValue)>;

pub struct EntityRepository {
    storage: Arc<Storage>,
    registry: Arc<EntityTypeRegistry>,
    lookups: RwLock<HashMap<String, Arc<dyn EntityLookup>>>,
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
}

impl EntityRepository {
    pub fn new(storage: Arc<Storage>, registry: Arc<EntityTypeRegistry>) -> Self {
        Self {
            storage,
            registry,
            lookups: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_lookup(self, name: &str, lookup: Arc<dyn EntityLookup>) -> Self {
        self.register_lookup(name, lookup);
        self
    }

    pub fn register_lookup(&self, name: &str, lookup: Arc<dyn EntityLookup>) {
        self.lookups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), lookup);
    }

    pub fn registry(&self) -> &EntityTypeRegistry {
        &self.registry
    }

    /// Loads one entity. Business keys are scoped by `id.scope` when given,
    /// else by `chat` when the table has a `chat_id` column, else global.
    pub fn get(&self, id: &EntityId, chat: Option<i64>) -> Result<Entity> {
        let ty = self.registry.get(&id.entity_type)?;
        self.storage.read(|conn| {
            let row_id = self.row_id(conn, ty, id, chat)?;
            let entity = match row_id {
                Some(row_id) => self.load_row(conn, ty, row_id, ty.expand_depth)?,
                None => None,
            };
            entity.ok_or_else(|| CoreError::not_found(&ty.type_tag, &id.key))
        })
    }

    /// Rows of `child_type` whose foreign key equals `parent`'s id; each
    /// child carries its own declared children.
    pub fn get_children(&self, parent: &Entity, child_type: &str) -> Result<Vec<Entity>> {
        let parent_ty = self.registry.get(&parent.entity_type)?;
        let child_ty = self.registry.get(child_type)?;
        let parent_id = parent
            .id
            .ok_or_else(|| CoreError::not_found(&parent_ty.type_tag, parent.label()))?;

        self.storage.read(|conn| {
            let mut path = HashSet::new();
            path.insert(parent_ty.id.clone());
            self.children_in(conn, parent_ty, parent_id, child_ty, &mut path)
        })
    }

    /// Writes the non-null fields of `entity` and returns the stored row.
    pub fn insert(&self, entity: &Entity) -> Result<Entity> {
        let ty = self.registry.get(&entity.entity_type)?;
        self.storage.write(|conn| {
            let table = self.table(conn, &ty.table)?;
            let mut columns = Vec::new();
            let mut values = Vec::new();
            for (field, value) in &entity.fields {
                if value.is_null() {
                    continue;
                }
                let column = storage_column(&table, field, value)?;
                values.push(to_sql(ty, &column, value)?);
                columns.push(quote(&column));
            }

            let sql = if columns.is_empty() {
                format!("INSERT INTO {} DEFAULT VALUES", quote(&table.name))
            } else {
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("?{}", i)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(&table.name),
                    columns.join(", "),
                    placeholders.join(", ")
                )
            };
            debug!(sql = %sql, "Inserting entity");
            conn.execute(&sql, params_from_iter(values.iter()))
                .map_err(|e| write_error(e, ty, entity))?;

            let id = conn.last_insert_rowid();
            info!(entity_type = %ty.id, id, "Inserted entity");
            self.load_row(conn, ty, id, ty.expand_depth)?
                .ok_or_else(|| CoreError::not_found(&ty.type_tag, id))
        })
    }

    /// Writes `fields` of `entity` by primary id; absent fields are nulled.
    pub fn update(&self, entity: &Entity, fields: &[&str]) -> Result<Entity> {
        let ty = self.registry.get(&entity.entity_type)?;
        let id = entity.id.ok_or_else(|| {
            CoreError::Config(format!("{} without id cannot be updated", ty.type_tag))
        })?;

        self.storage.write(|conn| {
            let table = self.table(conn, &ty.table)?;
            let mut sets = Vec::new();
            let mut values = Vec::new();
            for field in fields {
                let value = entity.get(field).cloned().unwrap_or_default();
                let column = storage_column(&table, field, &value)?;
                values.push(to_sql(ty, &column, &value)?);
                sets.push(format!("{} = ?{}", quote(&column), values.len()));
            }

            if !sets.is_empty() {
                values.push(SqlValue::Integer(id));
                let sql = format!(
                    "UPDATE {} SET {} WHERE id = ?{}",
                    quote(&table.name),
                    sets.join(", "),
                    values.len()
                );
                let changed = conn
                    .execute(&sql, params_from_iter(values.iter()))
                    .map_err(|e| write_error(e, ty, entity))?;
                if changed == 0 {
                    return Err(CoreError::not_found(&ty.type_tag, id));
                }
                debug!(entity_type = %ty.id, id, fields = fields.len(), "Updated entity");
            }

            self.load_row(conn, ty, id, ty.expand_depth)?
                .ok_or_else(|| CoreError::not_found(&ty.type_tag, id))
        })
    }

    /// Removes the row; returns whether one existed. A row other tables
    /// still point at is refused with `Referenced`.
    pub fn delete(&self, id: &EntityId) -> Result<bool> {
        let ty = self.registry.get(&id.entity_type)?;
        let mut target = None;
        let result = self.storage.write(|conn| {
            let Some(row_id) = self.row_id(conn, ty, id, None)? else {
                return Ok(false);
            };
            target = Some(row_id);
            let table = self.table(conn, &ty.table)?;
            let changed = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", quote(&table.name)),
                params![row_id],
            )?;
            Ok(changed > 0)
        });
        let removed = match (result, target) {
            (Err(CoreError::Store(err)), Some(row_id)) if is_foreign_key_violation(&err) => {
                let entity = Entity::new(&ty.id).with_id(row_id);
                let tables = self.referencing_tables(&entity)?;
                warn!(entity = %id, tables = ?tables, "Delete refused, entity still referenced");
                return Err(CoreError::Referenced {
                    kind: ty.type_tag.clone(),
                    key: id.key.to_string(),
                    tables,
                });
            }
            (result, _) => result?,
        };
        if removed {
            info!(entity = %id, "Deleted entity");
        }
        Ok(removed)
    }

    /// All rows of `entity_type`, limited to `chat` when the table is
    /// chat-scoped.
    pub fn list(&self, entity_type: &str, chat: Option<i64>) -> Result<Vec<Entity>> {
        let ty = self.registry.get(entity_type)?;
        self.storage.read(|conn| {
            let table = self.table(conn, &ty.table)?;
            let mut sql = format!(
                "SELECT {} FROM {}",
                select_list(&table),
                quote(&table.name)
            );
            let rows = match chat.filter(|_| table.has_chat_scope()) {
                Some(chat) => {
                    sql.push_str(" WHERE \"chat_id\" = ?1 ORDER BY id");
                    raw_rows(conn, &sql, &table, params![chat])?
                }
                None => {
                    sql.push_str(" ORDER BY id");
                    raw_rows(conn, &sql, &table, [])?
                }
            };
            rows.into_iter()
                .map(|row| self.to_entity(conn, ty, &table, row, ty.expand_depth))
                .collect()
        })
    }

    /// Tables holding at least one row that references `entity`.
    pub fn referencing_tables(&self, entity: &Entity) -> Result<Vec<String>> {
        let ty = self.registry.get(&entity.entity_type)?;
        let id = entity
            .id
            .ok_or_else(|| CoreError::not_found(&ty.type_tag, entity.label()))?;
        let suffix = format!("{}_id", ty.table);

        self.storage.read(|conn| {
            let mut out = Vec::new();
            for name in table::user_tables(conn)? {
                let info = TableInfo::load(conn, &name)?;
                let columns: Vec<&String> = info
                    .columns
                    .iter()
                    .filter(|c| {
                        c.ends_with(&suffix)
                            || info.foreign_keys.get(*c).is_some_and(|t| *t == ty.table)
                    })
                    .collect();
                for column in columns {
                    let sql = format!(
                        "SELECT 1 FROM {} WHERE {} = ?1 LIMIT 1",
                        quote(&name),
                        quote(column)
                    );
                    let hit: Option<i64> =
                        conn.query_row(&sql, params![id], |row| row.get(0)).optional()?;
                    if hit.is_some() {
                        out.push(name.clone());
                        break;
                    }
                }
            }
            Ok(out)
        })
    }

    fn table(&self, conn: &Connection, name: &str) -> Result<Arc<TableInfo>> {
        if let Some(info) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(info));
        }
        let info = Arc::new(TableInfo::load(conn, name)?);
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&info));
        Ok(info)
    }

    fn row_id(
        &self,
        conn: &Connection,
        ty: &EntityType,
        id: &EntityId,
        chat: Option<i64>,
    ) -> Result<Option<i64>> {
        match &id.key {
            EntityKey::Id(row_id) => Ok(Some(*row_id)),
            EntityKey::BusinessKey(key) => self.resolve_key(conn, ty, key, id.scope, chat),
        }
    }

    fn resolve_key(
        &self,
        conn: &Connection,
        ty: &EntityType,
        key: &str,
        scope: Option<OwnerScope>,
        chat: Option<i64>,
    ) -> Result<Option<i64>> {
        let table = self.table(conn, &ty.table)?;
        let scope = scope.or_else(|| chat.filter(|_| table.has_chat_scope()).map(OwnerScope::Chat));

        if let Some(name) = ty.lookup.as_deref() {
            let lookup = self
                .lookups
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    CoreError::Config(format!(
                        "entity type '{}' names unknown lookup '{}'",
                        ty.id, name
                    ))
                })?;
            return lookup.find_id(conn, ty, key, scope);
        }

        if !table.has_column(&ty.key_column) {
            return Err(CoreError::Config(format!(
                "table '{}' has no key column '{}'",
                table.name, ty.key_column
            )));
        }

        let mut sql = format!(
            "SELECT id FROM {} WHERE {} = ?1",
            quote(&table.name),
            quote(&ty.key_column)
        );
        let row_id = match scope {
            Some(scope) => {
                if !table.has_column(scope.column()) {
                    return Err(CoreError::Config(format!(
                        "table '{}' cannot be scoped by {}",
                        table.name,
                        scope.column()
                    )));
                }
                sql.push_str(&format!(" AND {} = ?2 ORDER BY id LIMIT 1", quote(scope.column())));
                conn.query_row(&sql, params![key, scope.value()], |row| row.get(0))
                    .optional()?
            }
            None => {
                sql.push_str(" ORDER BY id LIMIT 1");
                conn.query_row(&sql, params![key], |row| row.get(0))
                    .optional()?
            }
        };
        debug!(entity_type = %ty.id, key, ?scope, ?row_id, "Resolved business key");
        Ok(row_id)
    }

    fn load_row(
        &self,
        conn: &Connection,
        ty: &EntityType,
        id: i64,
        depth: u32,
    ) -> Result<Option<Entity>> {
        let table = self.table(conn, &ty.table)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            select_list(&table),
            quote(&table.name)
        );
        let row = conn
            .query_row(&sql, params![id], |row| read_row(row, &table))
            .optional()?;
        match row {
            Some(row) => Ok(Some(self.to_entity(conn, ty, &table, row, depth)?)),
            None => Ok(None),
        }
    }

    fn to_entity(
        &self,
        conn: &Connection,
        ty: &EntityType,
        table: &TableInfo,
        row: RawRow,
        depth: u32,
    ) -> Result<Entity> {
        let mut entity = Entity::new(&ty.id);
        for (column, raw) in row {
            if column == "id" {
                if let SqlValue::Integer(id) = raw {
                    entity.id = Some(id);
                }
                continue;
            }
            let value = self.column_value(conn, ty, table, &column, raw, depth)?;
            entity.fields.insert(column, value);
        }
        Ok(entity)
    }

    fn column_value(
        &self,
        conn: &Connection,
        ty: &EntityType,
        table: &TableInfo,
        column: &str,
        raw: SqlValue,
        depth: u32,
    ) -> Result<Value> {
        if let SqlValue::Integer(ref_id) = raw {
            let referenced = table
                .foreign_keys
                .get(column)
                .and_then(|target| self.registry.by_table(target));
            if let (Some(ref_ty), true) = (referenced, depth > 0) {
                let nested_depth = (depth - 1).min(ref_ty.expand_depth);
                match self.load_row(conn, ref_ty, ref_id, nested_depth)? {
                    Some(nested) => return Ok(Value::Entity(Box::new(nested))),
                    None => {
                        warn!(table = %table.name, column, ref_id, "Dangling reference");
                        return Ok(Value::Integer(ref_id));
                    }
                }
            }
        }

        if let Some(domain) = ty.enums.get(column) {
            let code = match &raw {
                SqlValue::Text(code) => Some(code.clone()),
                SqlValue::Integer(code) => Some(code.to_string()),
                _ => None,
            };
            if let Some(variant) = code.as_deref().and_then(|code| domain.decode(code)) {
                return Ok(Value::Enum {
                    variant: variant.name.clone(),
                    code: variant.code.clone(),
                });
            }
        }

        Ok(match raw {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(v) => Value::Integer(v),
            SqlValue::Real(v) => Value::Real(v),
            SqlValue::Text(v) => Value::Text(v),
            SqlValue::Blob(v) => Value::Text(String::from_utf8_lossy(&v).into_owned()),
        })
    }

    fn children_in(
        &self,
        conn: &Connection,
        parent_ty: &EntityType,
        parent_id: i64,
        child_ty: &EntityType,
        path: &mut HashSet<String>,
    ) -> Result<Vec<Entity>> {
        let table = self.table(conn, &child_ty.table)?;
        let link = parent_ty.default_slot();
        if !table.has_column(&link) {
            return Err(CoreError::Config(format!(
                "table '{}' has no column '{}' linking it to '{}'",
                table.name, link, parent_ty.id
            )));
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY id",
            select_list(&table),
            quote(&table.name),
            quote(&link)
        );
        let rows = raw_rows(conn, &sql, &table, params![parent_id])?;

        path.insert(child_ty.id.clone());
        let nested_types: Vec<&EntityType> = self
            .registry
            .children_of(&child_ty.id)
            .into_iter()
            .filter(|t| !path.contains(&t.id))
            .collect();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entity = self.to_entity(conn, child_ty, &table, row, child_ty.expand_depth)?;
            if let Some(id) = entity.id {
                for nested_ty in &nested_types {
                    let nested = self.children_in(conn, child_ty, id, nested_ty, path)?;
                    entity.children.insert(nested_ty.id.clone(), nested);
                }
            }
            out.push(entity);
        }
        path.remove(&child_ty.id);
        Ok(out)
    }
}

fn select_list(table: &TableInfo) -> String {
    table
        .columns
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn read_row(row: &Row<'_>, table: &TableInfo) -> rusqlite::Result<RawRow> {
    let mut out = Vec::with_capacity(table.columns.len());
    for (idx, column) in table.columns.iter().enumerate() {
        out.push((column.clone(), row.get::<_, SqlValue>(idx)?));
    }
    Ok(out)
}

fn raw_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    table: &TableInfo,
    params: P,
) -> Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| read_row(row, table))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Column an entity field is stored in; references go to their `_id` column.
fn storage_column(table: &TableInfo, field: &str, value: &Value) -> Result<String> {
    if matches!(value, Value::Entity(_)) && !field.ends_with("_id") {
        let fk = format!("{}_id", field);
        if table.has_column(&fk) {
            return Ok(fk);
        }
    }
    if table.has_column(field) && field != "id" {
        return Ok(field.to_string());
    }
    Err(CoreError::Config(format!(
        "table '{}' has no column for field '{}'",
        table.name, field
    )))
}

fn to_sql(ty: &EntityType, column: &str, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(text) => match ty.enums.get(column) {
            Some(domain) => {
                let variant = domain.encode(text).ok_or_else(|| {
                    CoreError::rejected(
                        &ty.type_tag,
                        format!("'{}' is not a valid {} value", text, column),
                    )
                })?;
                SqlValue::Text(variant.code.clone())
            }
            None => SqlValue::Text(text.clone()),
        },
        Value::Enum { code, .. } => SqlValue::Text(code.clone()),
        Value::Entity(entity) => entity.id.map_or(SqlValue::Null, SqlValue::Integer),
    })
}

fn write_error(err: rusqlite::Error, ty: &EntityType, entity: &Entity) -> CoreError {
    if is_unique_violation(&err) {
        let key = entity
            .get(&ty.key_column)
            .map(Value::to_string)
            .unwrap_or_else(|| entity.label());
        warn!(entity_type = %ty.id, key = %key, "Uniqueness violation");
        CoreError::conflict(&ty.type_tag, key)
    } else if let Some(reason) = constraint_violation(&err) {
        warn!(entity_type = %ty.id, reason, "Write rejected by the schema");
        CoreError::rejected(&ty.type_tag, reason)
    } else {
        CoreError::Store(err)
    }
}
