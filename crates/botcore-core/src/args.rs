//! Resolved handler arguments.

use botcore_ipc::MessageRef;
use botcore_types::param::{CURRENT_PREFIX, REQUIRED_PREFIX};
use botcore_types::{Entity, ParameterDescriptor, ScalarType};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Arg {
    #[default]
    Absent,
    Text(String),
    Int(i64),
    Bool(bool),
    Entity(Entity),
    Message(MessageRef),
}

impl Arg {
    /// Converts a raw token string to the parameter's scalar type; values
    /// that do not parse become `Absent`.
    pub fn from_raw(param: &ParameterDescriptor, raw: &str) -> Self {
        match param.scalar_type() {
            ScalarType::Str => Arg::Text(raw.to_string()),
            ScalarType::Int => match raw.trim().parse() {
                Ok(v) => Arg::Int(v),
                Err(_) => {
                    warn!(param = %param.name, raw, "Not an integer, binding absent");
                    Arg::Absent
                }
            },
            ScalarType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "on" => Arg::Bool(true),
                "0" | "false" | "no" | "n" | "off" => Arg::Bool(false),
                _ => {
                    warn!(param = %param.name, raw, "Not a boolean, binding absent");
                    Arg::Absent
                }
            },
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Arg::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v),
            Arg::Entity(entity) => entity.id,
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Arg::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageRef> {
        match self {
            Arg::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Arguments in the handler's declared parameter order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    values: Vec<(String, Arg)>,
}

impl Args {
    pub fn new(values: Vec<(String, Arg)>) -> Self {
        Self { values }
    }

    /// Looks a value up by full parameter name or by its prefix-free slot.
    pub fn get(&self, name: &str) -> &Arg {
        static ABSENT: Arg = Arg::Absent;
        self.values
            .iter()
            .find(|(n, _)| n == name || strip_prefixes(n) == name)
            .map(|(_, v)| v)
            .unwrap_or(&ABSENT)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).as_text()
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).as_int()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.get(name).as_entity()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arg> {
        self.values.iter().map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn strip_prefixes(name: &str) -> &str {
    name.strip_prefix(REQUIRED_PREFIX)
        .or_else(|| name.strip_prefix(CURRENT_PREFIX))
        .unwrap_or(name)
}
