//! Command parameter descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const REQUIRED_PREFIX: &str = "req__";
pub const CURRENT_PREFIX: &str = "cu__";

/// Values injected from the invocation context instead of user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextParam {
    ActorId,
    ChatId,
    ReplyToMessage,
    SourceMessage,
    ReplyToActorId,
    EntityTypeFilter,
}

impl ContextParam {
    pub const ALL: [ContextParam; 6] = [
        ContextParam::ActorId,
        ContextParam::ChatId,
        ContextParam::ReplyToMessage,
        ContextParam::SourceMessage,
        ContextParam::ReplyToActorId,
        ContextParam::EntityTypeFilter,
    ];

    /// Reserved parameter name of this context value.
    pub fn name(&self) -> &'static str {
        match self {
            ContextParam::ActorId => "user_id",
            ContextParam::ChatId => "chat_id",
            ContextParam::ReplyToMessage => "reply_to_msg",
            ContextParam::SourceMessage => "src_msg",
            ContextParam::ReplyToActorId => "reply_to_user_id",
            ContextParam::EntityTypeFilter => "ent_ty",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// How a parameter obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Consumes a raw token.
    Positional { required: bool },
    /// Consumes a raw token holding an id that is resolved to a full entity.
    RequiredLookup,
    /// Recalled from the actor's settings.
    CurrentLookup,
    Context(ContextParam),
}

impl ParamKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            ParamKind::Positional { required: false } => "positional",
            ParamKind::Positional { required: true } => "positional_required",
            ParamKind::RequiredLookup => "required_lookup",
            ParamKind::CurrentLookup => "current_lookup",
            ParamKind::Context(_) => "context",
        }
    }

    /// Parameters that take part in positional token binding.
    pub fn binds_token(&self) -> bool {
        matches!(
            self,
            ParamKind::Positional { .. } | ParamKind::RequiredLookup
        )
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_code())
    }
}

/// Scalar type of a parameter that is not entity-typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Str,
    Int,
    Bool,
}

impl ScalarType {
    pub fn tag(&self) -> &'static str {
        match self {
            ScalarType::Str => "str",
            ScalarType::Int => "int",
            ScalarType::Bool => "bool",
        }
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "str" | "" => Ok(ScalarType::Str),
            "int" => Ok(ScalarType::Int),
            "bool" => Ok(ScalarType::Bool),
            _ => Err(format!("Unknown scalar type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub type_tag: String,
    pub kind: ParamKind,
    pub entity_type: Option<String>,
}

impl ParameterDescriptor {
    pub fn positional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: ScalarType::Str.tag().to_string(),
            kind: ParamKind::Positional { required: false },
            entity_type: None,
        }
    }

    pub fn required(name: &str) -> Self {
        Self {
            kind: ParamKind::Positional { required: true },
            ..Self::positional(name)
        }
    }

    pub fn int(name: &str) -> Self {
        Self {
            type_tag: ScalarType::Int.tag().to_string(),
            ..Self::positional(name)
        }
    }

    /// Caller supplies an id of `entity_type`; `type_tag` is the type's tag.
    pub fn required_lookup(name: &str, entity_type: &str, type_tag: &str) -> Self {
        Self {
            name: prefixed(REQUIRED_PREFIX, name),
            type_tag: type_tag.to_string(),
            kind: ParamKind::RequiredLookup,
            entity_type: Some(entity_type.to_string()),
        }
    }

    /// Entity recalled from the "current" slot of `entity_type`.
    pub fn current_entity(name: &str, entity_type: &str, type_tag: &str) -> Self {
        Self {
            name: prefixed(CURRENT_PREFIX, name),
            type_tag: type_tag.to_string(),
            kind: ParamKind::CurrentLookup,
            entity_type: Some(entity_type.to_string()),
        }
    }

    /// Scalar recalled from the settings slot named like the parameter.
    pub fn current_value(name: &str) -> Self {
        Self {
            name: prefixed(CURRENT_PREFIX, name),
            type_tag: ScalarType::Str.tag().to_string(),
            kind: ParamKind::CurrentLookup,
            entity_type: None,
        }
    }

    pub fn context(param: ContextParam) -> Self {
        Self {
            name: param.name().to_string(),
            type_tag: String::new(),
            kind: ParamKind::Context(param),
            entity_type: None,
        }
    }

    pub fn with_type_tag(mut self, type_tag: &str) -> Self {
        self.type_tag = type_tag.to_string();
        self
    }

    /// Parameter name without the required/current prefix.
    pub fn slot(&self) -> &str {
        self.name
            .strip_prefix(REQUIRED_PREFIX)
            .or_else(|| self.name.strip_prefix(CURRENT_PREFIX))
            .unwrap_or(&self.name)
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.type_tag.parse().unwrap_or(ScalarType::Str)
    }

    pub fn is_entity(&self) -> bool {
        self.entity_type.is_some()
    }

    pub fn is_required(&self) -> bool {
        matches!(self.kind, ParamKind::Positional { required: true })
    }

    /// Rebuilds a descriptor from its persisted columns.
    pub fn from_parts(
        name: &str,
        type_tag: &str,
        kind_code: &str,
        entity_type: Option<String>,
    ) -> Option<Self> {
        let kind = match kind_code {
            "positional" => ParamKind::Positional { required: false },
            "positional_required" => ParamKind::Positional { required: true },
            "required_lookup" => ParamKind::RequiredLookup,
            "current_lookup" => ParamKind::CurrentLookup,
            "context" => ParamKind::Context(ContextParam::from_name(name)?),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            kind,
            entity_type,
        })
    }
}

fn prefixed(prefix: &str, name: &str) -> String {
    if name.starts_with(prefix) {
        name.to_string()
    } else {
        format!("{}{}", prefix, name)
    }
}
