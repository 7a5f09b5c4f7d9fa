//! Convenient imports for typical `entigraph` usage.
//!
//! ```ignore
//! use entigraph::prelude::*;
//! ```

pub use crate::{
    Cascade, ColumnMetadata, Entity, EntityManager, EntityMetadata, JoinTable, MetadataRegistry,
    OrmError, OrmResult, RelationMetadata, RelationValue, Value,
};

pub use crate::memory::MemoryDatabase;

#[cfg(feature = "pool")]
pub use crate::{PgRunnerConfig, PgRunnerProvider};
