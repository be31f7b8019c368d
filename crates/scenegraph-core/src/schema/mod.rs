//! Schema model: type definitions, the in-memory schema state, schema
//! statements and their TypeQL rendering.

mod definition;
mod error;
mod state;
mod statement;
pub mod typeql;
mod types;
mod value;

pub use definition::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, TypeDef};
pub use error::SchemaError;
pub use state::SchemaState;
pub use statement::{OperationKind, SchemaStatement};
pub use types::{RoleRef, TypeKind, ValueKind};
pub use value::{ConversionError, Value};
