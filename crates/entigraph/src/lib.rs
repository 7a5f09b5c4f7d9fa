//! # entigraph
//!
//! Graph-aware persistence for Postgres.
//!
//! Hand the [`EntityManager`] an in-memory entity graph and it works out what
//! changed against the database: rows to insert, columns to update, junction
//! rows to add or drop, foreign keys to null and rows to delete. The resulting
//! plan runs in one transaction and generated values (ids, timestamps,
//! versions) are written back onto the caller's entities.
//!
//! ## Features
//!
//! - **Explicit metadata**: entities, columns and relations are declared with
//!   builders and validated once into a [`MetadataRegistry`]
//! - **Cascades**: per-relation insert, update and remove cascades
//! - **Many-to-many**: junction rows diffed per owner
//! - **Closure tables**: ancestor rows and tree levels maintained on insert
//! - **Class-table inheritance**: child rows written after their parent row
//! - **Optimistic locking**: version columns checked on update
//! - **Lifecycle events**: entity listeners and [`EntitySubscriber`]s
//! - **Pluggable runners**: Postgres via `tokio-postgres`, or the in-memory
//!   [`MemoryDatabase`](memory::MemoryDatabase) for tests
//!
//! ```ignore
//! use entigraph::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("Post", "posts")
//!             .column(ColumnMetadata::generated_primary("id"))
//!             .column(ColumnMetadata::new("title"))
//!             .relation(RelationMetadata::one_to_many("comments", "Comment", "post").cascade_remove()),
//!     )
//!     .entity(
//!         EntityMetadata::new("Comment", "comments")
//!             .column(ColumnMetadata::generated_primary("id"))
//!             .column(ColumnMetadata::new("body"))
//!             .relation(RelationMetadata::many_to_one("post", "Post", "post_id")),
//!     )
//!     .build()?;
//!
//! let manager = EntityManager::new(registry, PgRunnerProvider::connect(PgRunnerConfig::from_env()?)?);
//!
//! let post = Entity::new("Post")
//!     .with("title", "hello")
//!     .with_many("comments", vec![Entity::new("Comment").with("body", "first")]);
//! manager.persist(&post).await?;
//!
//! manager.remove(&post).await?; // deletes the comments too
//! ```

pub mod broadcaster;
pub mod config;
pub mod entity;
pub mod error;
pub mod lazy;
pub mod loader;
pub mod manager;
pub mod memory;
pub mod metadata;
pub mod persist;
pub mod pg_runner;
pub mod prelude;
pub mod runner;
pub mod sql;
pub mod value;

#[cfg(feature = "pool")]
pub mod pool;

pub use broadcaster::{Broadcaster, EntitySubscriber, InsertEvent, RemoveEvent, UpdateEvent};
pub use config::{ClosureColumns, ManagerConfig, PgRunnerConfig};
pub use entity::{Entity, EntityId, RelationValue};
pub use error::{OrmError, OrmResult};
pub use loader::{EntityLoader, GraphLoader, RelationPath};
pub use manager::{EntityManager, Transaction};
pub use metadata::{
    Cascade, ColumnKind, ColumnMetadata, EntityMetadata, JoinTable, ListenerKind, MetadataRegistry,
    RelationKind, RelationMetadata,
};
pub use persist::{EntityPersister, PersistOperation};
pub use pg_runner::PgQueryRunner;
pub use runner::{QueryRunner, RunnerProvider};
pub use value::{Value, ValueMap};

#[cfg(feature = "pool")]
pub use pg_runner::PgRunnerProvider;
#[cfg(feature = "pool")]
pub use pool::create_pool;
