//! Structural description of entities: tables, columns, relations and listeners.
//!
//! Metadata is declared with plain builders and validated once by
//! [`MetadataRegistry::builder`]. There is no global registry; the registry is
//! owned by whoever constructs the [`EntityManager`](crate::EntityManager).
//!
//! ```ignore
//! use entigraph::metadata::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("Post", "posts")
//!             .column(ColumnMetadata::generated_primary("id"))
//!             .column(ColumnMetadata::new("title"))
//!             .relation(RelationMetadata::one_to_many("comments", "Comment", "post")),
//!     )
//!     .entity(
//!         EntityMetadata::new("Comment", "comments")
//!             .column(ColumnMetadata::generated_primary("id"))
//!             .relation(RelationMetadata::many_to_one("post", "Post", "post_id")),
//!     )
//!     .build()?;
//! ```

mod column;
mod registry;
mod relation;

#[cfg(test)]
mod tests;

pub use column::{ColumnKind, ColumnMetadata};
pub use registry::{JunctionSide, MetadataRegistry, MetadataRegistryBuilder};
pub use relation::{Cascade, JoinTable, RelationKind, RelationMetadata};

use crate::entity::Entity;
use std::fmt;
use std::sync::Arc;

/// How an entity is laid out in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    Regular,
    /// Tree entity whose ancestor/descendant pairs live in `closure_table`.
    Closure { closure_table: String },
    /// Class-table inheritance child: its own table holds the child columns
    /// plus `parent_id_column`, which references the parent row.
    ClassTableChild {
        parent: String,
        parent_id_column: String,
    },
}

/// Lifecycle hook kinds an entity listener can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
}

/// Synchronous callback invoked for entities of one type.
#[derive(Clone)]
pub struct EntityListener {
    pub kind: ListenerKind,
    callback: Arc<dyn Fn(&Entity) + Send + Sync>,
}

impl EntityListener {
    pub fn new(kind: ListenerKind, callback: impl Fn(&Entity) + Send + Sync + 'static) -> Self {
        Self {
            kind,
            callback: Arc::new(callback),
        }
    }

    pub fn call(&self, entity: &Entity) {
        (self.callback)(entity)
    }
}

impl fmt::Debug for EntityListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityListener")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Metadata of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnMetadata>,
    pub relations: Vec<RelationMetadata>,
    pub kind: TableKind,
    /// Value stored in the discriminator column for rows of this entity.
    pub discriminator_value: Option<String>,
    pub listeners: Vec<EntityListener>,
    parent: Option<Arc<EntityMetadata>>,
    identity: Vec<String>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            relations: Vec::new(),
            kind: TableKind::Regular,
            discriminator_value: None,
            listeners: Vec::new(),
            parent: None,
            identity: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    /// Mark as a closure-table tree.
    pub fn closure(mut self, closure_table: impl Into<String>) -> Self {
        self.kind = TableKind::Closure {
            closure_table: closure_table.into(),
        };
        self
    }

    /// Mark as a class-table inheritance child of `parent`.
    pub fn child_of(mut self, parent: impl Into<String>, parent_id_column: impl Into<String>) -> Self {
        self.kind = TableKind::ClassTableChild {
            parent: parent.into(),
            parent_id_column: parent_id_column.into(),
        };
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn listener(
        mut self,
        kind: ListenerKind,
        callback: impl Fn(&Entity) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push(EntityListener::new(kind, callback));
        self
    }

    /// Resolved class-table parent, set by the registry.
    pub fn parent(&self) -> Option<&Arc<EntityMetadata>> {
        self.parent.as_ref()
    }

    pub fn parent_id_column(&self) -> Option<&str> {
        match &self.kind {
            TableKind::ClassTableChild {
                parent_id_column, ..
            } => Some(parent_id_column),
            _ => None,
        }
    }

    pub fn closure_table(&self) -> Option<&str> {
        match &self.kind {
            TableKind::Closure { closure_table } => Some(closure_table),
            _ => None,
        }
    }

    pub fn is_closure(&self) -> bool {
        self.closure_table().is_some()
    }

    /// Properties that identify a row: the parent's primaries first, then the
    /// entity's own primary columns.
    pub fn identity_properties(&self) -> &[String] {
        &self.identity
    }

    pub fn own_primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.primary)
    }

    /// The entity's own database-generated column.
    pub fn generated_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.generated)
    }

    /// Look up a column by property, including inherited columns.
    pub fn find_column(&self, property: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.property == property)
            .or_else(|| self.parent.as_ref()?.find_column(property))
    }

    /// Look up a relation by property, including inherited relations.
    pub fn find_relation(&self, property: &str) -> Option<&RelationMetadata> {
        self.relations
            .iter()
            .find(|r| r.property == property)
            .or_else(|| self.parent.as_ref()?.find_relation(property))
    }

    /// First column of the given kind, own columns before inherited ones.
    pub fn special_column(&self, kind: ColumnKind) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.kind == kind)
            .or_else(|| self.parent.as_ref()?.special_column(kind))
    }

    /// Inherited columns followed by own columns.
    pub fn all_columns(&self) -> Vec<&ColumnMetadata> {
        let mut out: Vec<&ColumnMetadata> = match &self.parent {
            Some(parent) => parent.columns.iter().collect(),
            None => Vec::new(),
        };
        out.extend(self.columns.iter());
        out
    }

    /// Inherited relations followed by own relations.
    pub fn all_relations(&self) -> Vec<&RelationMetadata> {
        let mut out: Vec<&RelationMetadata> = match &self.parent {
            Some(parent) => parent.relations.iter().collect(),
            None => Vec::new(),
        };
        out.extend(self.relations.iter());
        out
    }

    /// Physical table that stores `property` (the parent table for inherited ones).
    pub fn table_of(&self, property: &str) -> &str {
        let own = self.columns.iter().any(|c| c.property == property)
            || self.relations.iter().any(|r| r.property == property);
        match &self.parent {
            Some(parent) if !own => parent.table_of(property),
            _ => &self.table,
        }
    }

    pub fn tree_parent_relation(&self) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.tree_parent)
    }

    pub fn listeners_for(&self, kind: ListenerKind) -> impl Iterator<Item = &EntityListener> {
        let inherited = self.parent.iter().flat_map(move |p| p.listeners_for_own(kind));
        inherited.chain(self.listeners_for_own(kind))
    }

    fn listeners_for_own(&self, kind: ListenerKind) -> impl Iterator<Item = &EntityListener> {
        self.listeners.iter().filter(move |l| l.kind == kind)
    }
}
