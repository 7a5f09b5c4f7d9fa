//! Records making up a persist plan.

use crate::entity::{Entity, EntityId};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::fmt;

/// Insert of one new entity (two rows for a class-table child).
#[derive(Debug, Clone)]
pub struct InsertOperation {
    pub entity: Entity,
    pub target: String,
    pub date: DateTime<Utc>,
    /// Identity known after the insert ran: live values merged with generated ones.
    pub entity_id: Option<EntityId>,
    /// Closure-table level computed during execution.
    pub tree_level: Option<i64>,
    /// Owning to-one properties filled from a parent collection holding this
    /// entity, with the parent whose key they take.
    pub links: Vec<(String, Entity)>,
}

impl InsertOperation {
    pub fn new(entity: Entity, target: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            entity,
            target: target.into(),
            date,
            entity_id: None,
            tree_level: None,
            links: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOperation {
    pub entity: Entity,
    pub target: String,
    /// Identity of the row being updated.
    pub entity_id: EntityId,
    /// Changed column properties.
    pub columns: Vec<String>,
    /// Changed owning to-one relation properties.
    pub relations: Vec<String>,
    pub date: DateTime<Utc>,
    /// Version the row is expected to hold; bumped by one on execution.
    pub version: Option<i64>,
}

impl UpdateOperation {
    /// Columns and relations reported to update listeners.
    pub fn changed(&self) -> Vec<String> {
        self.columns.iter().chain(&self.relations).cloned().collect()
    }
}

/// The relation a removal was discovered through.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveCause {
    pub target: String,
    pub relation: String,
    pub entity_id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveKind {
    /// Delete the row.
    Delete,
    /// Only the owner's to-one foreign key is nulled; the row stays.
    CutRelation,
}

#[derive(Debug, Clone)]
pub struct RemoveOperation {
    /// The db-side instance.
    pub entity: Entity,
    pub target: String,
    pub entity_id: EntityId,
    pub kind: RemoveKind,
    pub cause: Option<RemoveCause>,
}

impl RemoveOperation {
    pub fn is_delete(&self) -> bool {
        self.kind == RemoveKind::Delete
    }
}

/// One side of a junction row: an entity and the property its key is read from.
#[derive(Debug, Clone)]
pub struct JunctionEnd {
    pub entity: Entity,
    pub target: String,
    pub key_property: String,
}

#[derive(Debug, Clone)]
pub struct JunctionInsert {
    pub table: String,
    pub owner_column: String,
    pub inverse_column: String,
    pub owner: JunctionEnd,
    pub inverse: JunctionEnd,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JunctionRemove {
    pub table: String,
    pub owner_column: String,
    pub inverse_column: String,
    pub owner_id: Value,
    pub inverse_id: Value,
}

/// Sets `entity.relation`'s foreign key to the key of `related` once both are known.
#[derive(Debug, Clone)]
pub struct UpdateByRelation {
    pub entity: Entity,
    pub target: String,
    /// Owning to-one property on `entity`.
    pub relation: String,
    pub related: Entity,
    pub related_target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverseUpdateKind {
    /// Point the child at a new parent.
    Update,
    /// Null the child's foreign key.
    Remove,
}

/// Foreign key change on the child of a collection that gained or lost it.
#[derive(Debug, Clone)]
pub struct UpdateByInverseRelation {
    pub kind: InverseUpdateKind,
    pub entity: Entity,
    pub target: String,
    /// Owning to-one property on the child.
    pub relation: String,
    pub related: Option<Entity>,
    pub related_target: Option<String>,
}

/// Everything needed to reconcile one root graph with the database.
#[derive(Debug, Clone, Default)]
pub struct PersistOperation {
    pub inserts: Vec<InsertOperation>,
    pub updates: Vec<UpdateOperation>,
    /// Cuts first in discovery order, then deletions in execution order.
    pub removes: Vec<RemoveOperation>,
    pub junction_inserts: Vec<JunctionInsert>,
    pub junction_removes: Vec<JunctionRemove>,
    pub updates_by_relations: Vec<UpdateByRelation>,
    pub updates_by_inverse_relations: Vec<UpdateByInverseRelation>,
}

impl PersistOperation {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.removes.is_empty()
            && self.junction_inserts.is_empty()
            && self.junction_removes.is_empty()
            && self.updates_by_relations.is_empty()
            && self.updates_by_inverse_relations.is_empty()
    }

    pub fn deletes(&self) -> impl Iterator<Item = &RemoveOperation> {
        self.removes.iter().filter(|r| r.is_delete())
    }

    pub fn cuts(&self) -> impl Iterator<Item = &RemoveOperation> {
        self.removes.iter().filter(|r| !r.is_delete())
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            inserts: self.inserts.len(),
            updates: self.updates.len(),
            deletes: self.deletes().count(),
            cuts: self.cuts().count(),
            junction_inserts: self.junction_inserts.len(),
            junction_removes: self.junction_removes.len(),
            updates_by_relations: self.updates_by_relations.len(),
            updates_by_inverse_relations: self.updates_by_inverse_relations.len(),
        }
    }
}

/// Operation counts of a plan, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub cuts: usize,
    pub junction_inserts: usize,
    pub junction_removes: usize,
    pub updates_by_relations: usize,
    pub updates_by_inverse_relations: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserts={} updates={} deletes={} cuts={} junction_inserts={} junction_removes={} fixups={} inverse_fixups={}",
            self.inserts,
            self.updates,
            self.deletes,
            self.cuts,
            self.junction_inserts,
            self.junction_removes,
            self.updates_by_relations,
            self.updates_by_inverse_relations
        )
    }
}
