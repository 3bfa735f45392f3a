//! Menus: navigable item trees bound to commands, rendered as inline
//! keyboards.

use botcore_catalog::Catalog;
use botcore_config::{parse_command_ref, MenuConfig};
use botcore_ipc::{InlineButton, Invocation};
use botcore_types::{CoreError, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Label of a pseudo item that starts a new keyboard row.
pub const ROW_BREAK: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRef {
    pub module: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    /// Dotted path from the root, e.g. `docs.new`.
    pub id: String,
    pub parent: Option<String>,
    pub label: String,
    pub command: Option<CommandRef>,
    pub icon: Option<String>,
    pub args: Option<String>,
    pub children: Vec<String>,
}

impl MenuItem {
    pub fn label_with_icon(&self) -> String {
        match &self.icon {
            Some(icon) => format!("{} {}", icon, self.label),
            None => self.label.clone(),
        }
    }

    pub fn is_row_break(&self) -> bool {
        self.label == ROW_BREAK
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Menu {
    pub id: String,
    pub label: String,
    items: Vec<MenuItem>,
}

impl Menu {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            items: Vec::new(),
        }
    }

    /// Appends an item under `parent` (a dotted path) or at the first level.
    pub fn add_item(
        &mut self,
        parent: Option<&str>,
        id: &str,
        label: &str,
        command: Option<CommandRef>,
        args: Option<&str>,
    ) -> Result<&MenuItem> {
        let path = match parent {
            Some(parent) => {
                if self.item_by_id(parent).is_none() {
                    return Err(CoreError::not_found("Menu item", parent));
                }
                format!("{}.{}", parent, id)
            }
            None => id.to_string(),
        };
        if self.item_by_id(&path).is_some() {
            return Err(CoreError::conflict("Menu item", &path));
        }

        if let Some(parent) = parent {
            if let Some(parent_item) = self.items.iter_mut().find(|i| i.id == parent) {
                parent_item.children.push(path.clone());
            }
        }
        self.items.push(MenuItem {
            id: path,
            parent: parent.map(String::from),
            label: label.to_string(),
            command,
            icon: None,
            args: args.map(String::from),
            children: Vec::new(),
        });
        let idx = self.items.len() - 1;
        Ok(&self.items[idx])
    }

    pub fn first_level(&self) -> Vec<&MenuItem> {
        self.items.iter().filter(|i| i.parent.is_none()).collect()
    }

    pub fn item_by_id(&self, id: &str) -> Option<&MenuItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn children(&self, id: &str) -> Vec<&MenuItem> {
        match self.item_by_id(id) {
            Some(item) => item
                .children
                .iter()
                .filter_map(|child| self.item_by_id(child))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    /// Inline keyboard for `items`; row-break items start a new row.
    pub fn keyboard(&self, items: &[&MenuItem]) -> Vec<Vec<InlineButton>> {
        let mut rows = Vec::new();
        let mut row = Vec::new();
        for item in items {
            if item.is_row_break() {
                rows.push(std::mem::take(&mut row));
                continue;
            }
            row.push(InlineButton {
                text: item.label_with_icon(),
                callback_data: format!("{}:{}", self.id, item.id),
            });
        }
        rows.push(row);
        rows
    }

    fn set_icon(&mut self, id: &str, icon: Option<String>) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.icon = icon;
        }
    }
}

/// Decoded `"<menu_id>:<item_id> <args>"` callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuCallback {
    pub menu_id: String,
    pub item_id: String,
    pub args: Vec<String>,
}

impl MenuCallback {
    pub fn parse(data: &str) -> Option<Self> {
        let (menu_id, rest) = data.trim().split_once(':')?;
        let mut parts = rest.split_whitespace();
        let item_id = parts.next()?;
        let menu_id = menu_id.trim();
        if menu_id.is_empty() {
            return None;
        }
        Some(Self {
            menu_id: menu_id.to_string(),
            item_id: item_id.to_string(),
            args: parts.map(String::from).collect(),
        })
    }
}

/// What selecting a menu item leads to.
#[derive(Debug, Clone)]
pub enum MenuAction {
    Open {
        text: String,
        rows: Vec<Vec<InlineButton>>,
    },
    Invoke(Invocation),
}

#[derive(Debug, Clone, Default)]
pub struct MenuRegistry {
    menus: BTreeMap<String, Menu>,
}

impl MenuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds menus from configuration; icons come from the bound commands
    /// when they are registered.
    pub fn from_config(menus: &[MenuConfig], catalog: &Catalog) -> Result<Self> {
        let mut registry = Self::new();
        for cfg in menus {
            let mut menu = Menu::new(&cfg.id, cfg.label.as_deref().unwrap_or(&cfg.id));
            for item in &cfg.items {
                let command = match item.command.as_deref() {
                    Some(value) => {
                        let (module, name) = parse_command_ref(value).ok_or_else(|| {
                            CoreError::Config(format!("invalid command reference '{}'", value))
                        })?;
                        Some(CommandRef { module, name })
                    }
                    None => None,
                };
                let path = menu
                    .add_item(
                        item.parent_path(),
                        &item.id,
                        &item.label,
                        command.clone(),
                        item.args.as_deref(),
                    )?
                    .id
                    .clone();
                if let Some(command) = command {
                    match catalog.command(&command.module, &command.name) {
                        Ok(found) => menu.set_icon(&path, found.icon),
                        Err(e) => warn!(menu = %cfg.id, item = %path, "Menu command unavailable: {}", e),
                    }
                }
            }
            debug!(menu = %menu.id, items = menu.items.len(), "Loaded menu");
            registry.insert(menu);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, menu: Menu) {
        self.menus.insert(menu.id.clone(), menu);
    }

    pub fn get(&self, id: &str) -> Option<&Menu> {
        self.menus.get(id)
    }

    pub fn menus(&self) -> impl Iterator<Item = &Menu> {
        self.menus.values()
    }

    /// The first-level keyboard of a menu.
    pub fn root(&self, id: &str) -> Result<MenuAction> {
        let menu = self.get(id).ok_or_else(|| CoreError::not_found("Menu", id))?;
        Ok(MenuAction::Open {
            text: format!("Choose a menu item for {}", menu.label),
            rows: menu.keyboard(&menu.first_level()),
        })
    }

    /// Resolves a callback: items with children open their level, items
    /// bound to a command become an invocation carrying the pre-filled
    /// arguments.
    pub fn select(&self, callback: &MenuCallback, chat_id: i64, actor_id: i64) -> Result<MenuAction> {
        let menu = self
            .get(&callback.menu_id)
            .ok_or_else(|| CoreError::not_found("Menu", &callback.menu_id))?;
        let item = menu
            .item_by_id(&callback.item_id)
            .ok_or_else(|| CoreError::not_found("Menu item", &callback.item_id))?;

        if !item.children.is_empty() {
            return Ok(MenuAction::Open {
                text: format!("Choose a menu item for {}", item.label),
                rows: menu.keyboard(&menu.children(&item.id)),
            });
        }

        let command = item
            .command
            .as_ref()
            .ok_or_else(|| CoreError::not_found("Command", &item.id))?;
        let mut text = item.args.clone().unwrap_or_default();
        for arg in &callback.args {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(arg);
        }
        Ok(MenuAction::Invoke(
            Invocation::new(&command.module, &command.name, chat_id, actor_id).with_text(&text),
        ))
    }
}
