//! Botcore Types
//!
//! Entity type registry, dynamic entity model, parameter descriptors and the
//! shared error taxonomy

pub mod entity;
pub mod error;
pub mod param;

pub use entity::{
    type_tag_for, EnumDomain, EnumVariant, Entity, EntityId, EntityKey, EntityType,
    EntityTypeRegistry, OwnerScope, Value, DEFAULT_EXPAND_DEPTH, DEFAULT_KEY_COLUMN,
};
pub use error::{
    constraint_violation, is_foreign_key_violation, is_unique_violation, CoreError, Result,
};
pub use param::{ContextParam, ParamKind, ParameterDescriptor, ScalarType};
