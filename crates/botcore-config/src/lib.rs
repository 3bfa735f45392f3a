//! Botcore Configuration
//!
//! TOML configuration: storage paths, logging, modules, entity types and menus

use botcore_types::{EntityType, EntityTypeRegistry, EnumDomain, EnumVariant};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILE: &str = "botcore.db";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeConfig>,
    #[serde(default)]
    pub menus: Vec<MenuConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub db_file: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_expand_depth")]
    pub expand_depth: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            expand_depth: default_expand_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Bot usernames (or username segments) served by this module.
    #[serde(default)]
    pub bot_usernames: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeConfig {
    pub id: String,
    pub module: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub type_tag: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub expand_depth: Option<u32>,
    #[serde(default)]
    pub lookup: Option<String>,
    #[serde(default)]
    pub enums: Vec<EnumConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumConfig {
    pub column: String,
    #[serde(default)]
    pub variants: Vec<EnumVariantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumVariantConfig {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuConfig {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub items: Vec<MenuItemConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuItemConfig {
    /// Dotted path of the parent item; empty or absent for first-level items.
    #[serde(default)]
    pub parent: Option<String>,
    pub id: String,
    pub label: String,
    /// Bound command as `module:name`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
}

impl MenuItemConfig {
    pub fn parent_path(&self) -> Option<&str> {
        self.parent
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn path(&self) -> String {
        match self.parent_path() {
            Some(parent) => format!("{}.{}", parent, self.id),
            None => self.id.clone(),
        }
    }
}

fn default_expand_depth() -> u32 {
    botcore_types::DEFAULT_EXPAND_DEPTH
}

/// Splits `module:name` into its parts.
pub fn parse_command_ref(value: &str) -> Option<(String, String)> {
    let (module, name) = value.trim().split_once(':')?;
    let module = module.trim();
    let name = name.trim();
    if module.is_empty() || name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((module.to_string(), name.to_string()))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("botcore").join("config.toml"))
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match self.core.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => {
                if let Some(rest) = dir.strip_prefix("~/") {
                    let home = dirs::home_dir()
                        .ok_or_else(|| anyhow::anyhow!("Cannot resolve home directory"))?;
                    Ok(home.join(rest))
                } else {
                    Ok(PathBuf::from(dir))
                }
            }
            _ => dirs::home_dir()
                .map(|home| home.join(".botcore"))
                .ok_or_else(|| anyhow::anyhow!("Cannot resolve home directory")),
        }
    }

    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        let file = self.core.db_file.as_deref().unwrap_or(DEFAULT_DB_FILE);
        let file = Path::new(file);
        if file.is_absolute() {
            Ok(file.to_path_buf())
        } else {
            Ok(self.data_dir()?.join(file))
        }
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Maps a bot username to the module it serves.
    ///
    /// Explicit `bot_usernames` win; otherwise the second `_`-separated
    /// segment of the username names the module (`acme_docs_bot` → `docs`).
    pub fn module_for_bot(&self, username: &str) -> Option<String> {
        let username = username.trim().trim_start_matches('@');
        for module in &self.modules {
            if module
                .bot_usernames
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(username))
            {
                return Some(module.name.clone());
            }
        }

        let segment = username.split('_').nth(1)?;
        for module in &self.modules {
            if module
                .bot_usernames
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(segment))
            {
                return Some(module.name.clone());
            }
        }
        Some(segment.to_string())
    }

    pub fn entity_registry(&self) -> anyhow::Result<EntityTypeRegistry> {
        let mut registry = EntityTypeRegistry::new();
        for item in &self.entity_types {
            let mut entity_type = EntityType::new(&item.module, &item.id)
                .with_expand_depth(item.expand_depth.unwrap_or(self.repository.expand_depth));
            if let Some(description) = &item.description {
                entity_type = entity_type.with_description(description);
            }
            if let Some(table) = &item.table {
                entity_type = entity_type.with_table(table);
            }
            if let Some(type_tag) = &item.type_tag {
                entity_type.type_tag = type_tag.clone();
            }
            if let Some(key_column) = &item.key_column {
                entity_type.key_column = key_column.clone();
            }
            if let Some(parent) = &item.parent {
                entity_type = entity_type.with_parent(parent);
            }
            if let Some(lookup) = &item.lookup {
                entity_type = entity_type.with_lookup(lookup);
            }
            for domain in &item.enums {
                let variants = domain
                    .variants
                    .iter()
                    .map(|v| EnumVariant {
                        name: v.name.clone(),
                        code: v.code.clone(),
                    })
                    .collect();
                entity_type = entity_type.with_enum(&domain.column, EnumDomain { variants });
            }
            registry.register(entity_type)?;
        }
        Ok(registry)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut module_names = HashSet::new();
        for module in &self.modules {
            let name = module.name.trim();
            if name.is_empty() {
                anyhow::bail!("Module name cannot be empty");
            }
            if !module_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate module name '{}'", name);
            }
        }

        let mut parents: HashMap<&str, Option<&str>> = HashMap::new();
        for item in &self.entity_types {
            let id = item.id.trim();
            if id.is_empty() {
                anyhow::bail!("Entity type id cannot be empty");
            }
            if parents.insert(id, item.parent.as_deref()).is_some() {
                anyhow::bail!("Duplicate entity type '{}'", id);
            }
        }
        for (id, parent) in &parents {
            let mut seen = HashSet::new();
            seen.insert(*id);
            let mut current = *parent;
            while let Some(parent_id) = current {
                if !parents.contains_key(parent_id) {
                    anyhow::bail!("Entity type '{}' has unknown parent '{}'", id, parent_id);
                }
                if !seen.insert(parent_id) {
                    anyhow::bail!("Entity type '{}' has a parent cycle", id);
                }
                current = parents.get(parent_id).copied().flatten();
            }
        }

        let mut menu_ids = HashSet::new();
        for menu in &self.menus {
            if !menu_ids.insert(menu.id.as_str()) {
                anyhow::bail!("Duplicate menu '{}'", menu.id);
            }
            let mut paths = HashSet::new();
            for item in &menu.items {
                if item.id.trim().is_empty() || item.id.contains('.') {
                    anyhow::bail!("Menu '{}' has invalid item id '{}'", menu.id, item.id);
                }
                if let Some(parent) = item.parent_path() {
                    if !paths.contains(parent) {
                        anyhow::bail!(
                            "Menu '{}' item '{}' references undeclared parent '{}'",
                            menu.id,
                            item.id,
                            parent
                        );
                    }
                }
                if let Some(command) = &item.command {
                    if parse_command_ref(command).is_none() {
                        anyhow::bail!(
                            "Menu '{}' item '{}' has invalid command '{}' (expected module:name)",
                            menu.id,
                            item.id,
                            command
                        );
                    }
                }
                if !paths.insert(item.path()) {
                    anyhow::bail!("Menu '{}' declares item '{}' twice", menu.id, item.path());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_command_ref, Config};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn example_config_is_valid() {
        let cfg = parse_config(include_str!("../../../config/config.example.toml"));
        cfg.validate().expect("example validates");
        let registry = cfg.entity_registry().expect("registry");
        assert_eq!(registry.len(), 2);
        assert_eq!(cfg.module_for_bot("@acme_docs_bot").as_deref(), Some("docs"));
        assert_eq!(cfg.menus[0].items[1].path(), "folder.new");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.repository.expand_depth, 1);
        assert_eq!(cfg.log_level(), "info");
    }

    #[test]
    fn builds_entity_registry_with_enums_and_parents() {
        let cfg = parse_config(
            r#"
[repository]
expand_depth = 2

[[entity_types]]
id = "folder"
module = "docs"
description = "Folder"

[[entity_types]]
id = "note"
module = "docs"
parent = "folder"
table = "doc_note"
expand_depth = 1

[[entity_types.enums]]
column = "lc"
variants = [{ name = "English", code = "EN" }]
"#,
        );
        assert!(cfg.validate().is_ok());
        let registry = cfg.entity_registry().expect("registry");
        let folder = registry.get("folder").expect("folder");
        assert_eq!(folder.expand_depth, 2);
        assert_eq!(folder.type_tag, "Folder");
        let note = registry.get("note").expect("note");
        assert_eq!(note.table, "doc_note");
        assert_eq!(note.parent.as_deref(), Some("folder"));
        assert_eq!(note.expand_depth, 1);
        assert!(note.enums.contains_key("lc"));
    }

    #[test]
    fn validate_rejects_unknown_parent_and_cycles() {
        let cfg = parse_config(
            r#"
[[entity_types]]
id = "note"
module = "docs"
parent = "folder"
"#,
        );
        assert!(cfg.validate().is_err());

        let cfg = parse_config(
            r#"
[[entity_types]]
id = "a"
module = "m"
parent = "b"

[[entity_types]]
id = "b"
module = "m"
parent = "a"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_menu_item_before_parent() {
        let cfg = parse_config(
            r#"
[[menus]]
id = "main"

[[menus.items]]
parent = "docs"
id = "new"
label = "New"
command = "docs:folder_new"

[[menus.items]]
id = "docs"
label = "Docs"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn module_for_bot_prefers_aliases() {
        let cfg = parse_config(
            r#"
[[modules]]
name = "trans"
bot_usernames = ["translate"]

[[modules]]
name = "docs"
"#,
        );
        assert_eq!(
            cfg.module_for_bot("@g3_translate_bot").as_deref(),
            Some("trans")
        );
        assert_eq!(cfg.module_for_bot("acme_docs_bot").as_deref(), Some("docs"));
        assert_eq!(cfg.module_for_bot("plainbot"), None);
    }

    #[test]
    fn parses_command_refs() {
        assert_eq!(
            parse_command_ref("docs:folder_new"),
            Some(("docs".to_string(), "folder_new".to_string()))
        );
        assert_eq!(parse_command_ref("docs"), None);
        assert_eq!(parse_command_ref(":x"), None);
    }
}
