//! Shared data contracts for chips, labels, and the tensor-record feature schema.

pub mod chip;
pub mod schema;

pub use chip::{Chip, ChipMetadata, ChipShape, ContractError};
pub use schema::{FeatureKind, FeatureSchema, FeatureSpec};
