use crate::entity::{Entity, EntityId};
use crate::metadata::EntityMetadata;
use std::sync::Arc;

/// An entity instance paired with its metadata for the duration of one diff.
#[derive(Debug, Clone)]
pub struct EntityRef {
    metadata: Arc<EntityMetadata>,
    entity: Entity,
}

impl EntityRef {
    pub fn new(metadata: Arc<EntityMetadata>, entity: Entity) -> Self {
        Self { metadata, entity }
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn target(&self) -> &str {
        &self.metadata.name
    }

    /// Identity values that are currently set.
    pub fn identity(&self) -> EntityId {
        self.entity.id_of(self.metadata.identity_properties())
    }

    /// Every identity property is set.
    pub fn has_identity(&self) -> bool {
        let id = self.identity();
        !id.is_empty() && id.len() == self.metadata.identity_properties().len()
    }

    /// Same target and every identity property set and equal on both sides.
    pub fn same_row_as(&self, target: &str, other: &EntityId) -> bool {
        if target != self.metadata.name {
            return false;
        }
        let own = self.identity();
        self.metadata.identity_properties().iter().all(|p| {
            match (own.get(p), other.get(p)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
    }

    pub fn same_row(&self, other: &EntityRef) -> bool {
        self.same_row_as(other.target(), &other.identity())
    }

    pub fn same_instance(&self, other: &EntityRef) -> bool {
        self.entity.ptr_eq(&other.entity)
    }

    /// Identity is produced by the database (a generated primary column).
    pub fn has_generated_identity(&self) -> bool {
        self.metadata
            .identity_properties()
            .iter()
            .any(|p| self.metadata.find_column(p).is_some_and(|c| c.generated))
    }
}
