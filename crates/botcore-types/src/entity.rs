//! Entity type registry and the dynamic entity model

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_KEY_COLUMN: &str = "bkey";
pub const DEFAULT_EXPAND_DEPTH: u32 = 1;

/// Column value of an entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Enum { variant: String, code: String },
    Entity(Box<Entity>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Entity(entity) => entity.id,
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Enum { variant, .. } => Some(variant),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Enum { variant, .. } => write!(f, "{}", variant),
            Value::Entity(entity) => write!(f, "{}", entity.label()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Entity> for Value {
    fn from(value: Entity) -> Self {
        Value::Entity(Box::new(value))
    }
}

/// A materialised row of a registered entity type.
///
/// `fields` never contains the primary `id`; foreign keys that were expanded
/// hold `Value::Entity`. `children` is filled by parent→child loading, keyed
/// by child entity type id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub id: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<Entity>>,
}

impl Entity {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id: None,
            fields: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    /// Expanded reference stored under `field` (or `<field>_id`).
    pub fn reference(&self, field: &str) -> Option<&Entity> {
        self.get(field)
            .or_else(|| self.get(&format!("{}_id", field)))
            .and_then(Value::as_entity)
    }

    pub fn children_of(&self, child_type: &str) -> &[Entity] {
        self.children
            .get(child_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.id.map(|id| EntityId::numeric(&self.entity_type, id))
    }

    /// Short human label: business key or description when present.
    pub fn label(&self) -> String {
        let name = self
            .text(DEFAULT_KEY_COLUMN)
            .or_else(|| self.text("descr"))
            .or_else(|| self.text("title"));
        match (name, self.id) {
            (Some(name), Some(id)) => format!("{} ({})", name, id),
            (Some(name), None) => name.to_string(),
            (None, Some(id)) => format!("{} {}", self.entity_type, id),
            (None, None) => self.entity_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Id(i64),
    BusinessKey(String),
}

impl EntityKey {
    /// Numeric tokens become ids, everything else a business key.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        match token.parse::<i64>() {
            Ok(id) => EntityKey::Id(id),
            Err(_) => EntityKey::BusinessKey(token.to_string()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Id(id) => write!(f, "{}", id),
            EntityKey::BusinessKey(key) => write!(f, "{}", key),
        }
    }
}

/// Owning-scope discriminator used to disambiguate business keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerScope {
    Chat(i64),
    Actor(i64),
}

impl OwnerScope {
    pub fn column(&self) -> &'static str {
        match self {
            OwnerScope::Chat(_) => "chat_id",
            OwnerScope::Actor(_) => "actor_id",
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            OwnerScope::Chat(v) | OwnerScope::Actor(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: String,
    pub key: EntityKey,
    pub scope: Option<OwnerScope>,
}

impl EntityId {
    pub fn numeric(entity_type: &str, id: i64) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            key: EntityKey::Id(id),
            scope: None,
        }
    }

    pub fn business_key(entity_type: &str, key: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            key: EntityKey::BusinessKey(key.to_string()),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: OwnerScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn as_numeric(&self) -> Option<i64> {
        match self.key {
            EntityKey::Id(id) => Some(id),
            EntityKey::BusinessKey(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumVariant {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnumDomain {
    pub variants: Vec<EnumVariant>,
}

impl EnumDomain {
    pub fn decode(&self, code: &str) -> Option<&EnumVariant> {
        self.variants.iter().find(|v| v.code == code)
    }

    pub fn encode(&self, name: &str) -> Option<&EnumVariant> {
        self.variants
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name) || v.code == name)
    }
}

/// A domain entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub id: String,
    pub module: String,
    pub description: String,
    pub table: String,
    pub type_tag: String,
    pub key_column: String,
    pub parent: Option<String>,
    pub lookup: Option<String>,
    pub expand_depth: u32,
    pub enums: BTreeMap<String, EnumDomain>,
}

impl EntityType {
    pub fn new(module: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            module: module.to_string(),
            description: id.to_string(),
            table: id.to_string(),
            type_tag: type_tag_for(id),
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            parent: None,
            lookup: None,
            expand_depth: DEFAULT_EXPAND_DEPTH,
            enums: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_lookup(mut self, lookup: &str) -> Self {
        self.lookup = Some(lookup.to_string());
        self
    }

    pub fn with_expand_depth(mut self, depth: u32) -> Self {
        self.expand_depth = depth;
        self
    }

    pub fn with_enum(mut self, column: &str, domain: EnumDomain) -> Self {
        self.enums.insert(column.to_string(), domain);
        self
    }

    /// Settings slot remembering the "current" entity of this type; also the
    /// name of foreign-key columns pointing at it.
    pub fn default_slot(&self) -> String {
        format!("{}_id", self.id)
    }
}

/// `txt_seq_it` → `TxtSeqIt`.
pub fn type_tag_for(id: &str) -> String {
    id.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct EntityTypeRegistry {
    types: BTreeMap<String, EntityType>,
}

impl EntityTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: EntityType) -> Result<()> {
        if self.types.contains_key(&entity_type.id) {
            return Err(CoreError::Config(format!(
                "entity type '{}' registered twice",
                entity_type.id
            )));
        }
        if let Some(parent) = entity_type.parent.as_deref() {
            if parent == entity_type.id {
                return Err(CoreError::Config(format!(
                    "entity type '{}' cannot be its own parent",
                    parent
                )));
            }
        }
        self.types.insert(entity_type.id.clone(), entity_type);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&EntityType> {
        self.types
            .get(id)
            .ok_or_else(|| CoreError::not_found("entity type", id))
    }

    pub fn find(&self, id: &str) -> Option<&EntityType> {
        self.types.get(id)
    }

    pub fn by_table(&self, table: &str) -> Option<&EntityType> {
        self.types.values().find(|t| t.table == table)
    }

    /// Types declaring `parent_id` as their parent.
    pub fn children_of(&self, parent_id: &str) -> Vec<&EntityType> {
        self.types
            .values()
            .filter(|t| t.parent.as_deref() == Some(parent_id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_and_table_default_from_id() {
        let ty = EntityType::new("trans", "txt_seq_it");
        assert_eq!(ty.type_tag, "TxtSeqIt");
        assert_eq!(ty.table, "txt_seq_it");
        assert_eq!(ty.default_slot(), "txt_seq_it_id");
        assert_eq!(ty.expand_depth, 1);
    }

    #[test]
    fn registry_rejects_duplicates_and_self_parents() {
        let mut registry = EntityTypeRegistry::new();
        registry
            .register(EntityType::new("docs", "folder"))
            .expect("folder");
        assert!(registry.register(EntityType::new("docs", "folder")).is_err());
        assert!(registry
            .register(EntityType::new("docs", "loop").with_parent("loop"))
            .is_err());
    }

    #[test]
    fn registry_lists_children_by_parent() {
        let mut registry = EntityTypeRegistry::new();
        registry
            .register(EntityType::new("docs", "folder"))
            .expect("folder");
        registry
            .register(EntityType::new("docs", "note").with_parent("folder"))
            .expect("note");
        let children = registry.children_of("folder");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "note");
        assert!(registry.children_of("note").is_empty());
        assert!(registry.get("missing").expect_err("missing").is_not_found());
    }

    #[test]
    fn entity_key_parses_numbers_and_keys() {
        assert_eq!(EntityKey::parse(" 42 "), EntityKey::Id(42));
        assert_eq!(
            EntityKey::parse("inbox"),
            EntityKey::BusinessKey("inbox".to_string())
        );
    }

    #[test]
    fn enum_domain_encodes_by_name_or_code() {
        let domain = EnumDomain {
            variants: vec![EnumVariant {
                name: "English".to_string(),
                code: "EN".to_string(),
            }],
        };
        assert_eq!(domain.encode("english").map(|v| v.code.as_str()), Some("EN"));
        assert_eq!(domain.decode("EN").map(|v| v.name.as_str()), Some("English"));
        assert!(domain.decode("VI").is_none());
    }
}
