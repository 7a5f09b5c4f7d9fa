//! Lifecycle events for persisted entities.
//!
//! Two kinds of listeners receive events: synchronous entity listeners
//! declared on [`EntityMetadata`] and async [`EntitySubscriber`]s registered
//! on the [`Broadcaster`]. Entity listeners run first. An error returned by a
//! subscriber aborts the persist call it was raised in.

use crate::entity::{Entity, EntityId};
use crate::error::OrmResult;
use crate::metadata::{EntityMetadata, ListenerKind};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct InsertEvent {
    pub entity: Entity,
}

#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub entity: Entity,
    /// Properties whose values changed.
    pub updated_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoveEvent {
    /// The db-side instance of the removed row.
    pub entity: Entity,
    /// Identity of the row before removal.
    pub entity_id: EntityId,
    /// `false` when only the relation pointing at the row was cut.
    pub deleted: bool,
}

/// Receives lifecycle events; every hook defaults to a no-op.
#[async_trait]
pub trait EntitySubscriber: Send + Sync {
    /// Restrict the subscriber to one entity name (and its class-table children).
    fn listens_to(&self) -> Option<&str> {
        None
    }

    async fn before_insert(&self, _event: &InsertEvent) -> OrmResult<()> {
        Ok(())
    }

    async fn after_insert(&self, _event: &InsertEvent) -> OrmResult<()> {
        Ok(())
    }

    async fn before_update(&self, _event: &UpdateEvent) -> OrmResult<()> {
        Ok(())
    }

    async fn after_update(&self, _event: &UpdateEvent) -> OrmResult<()> {
        Ok(())
    }

    async fn before_remove(&self, _event: &RemoveEvent) -> OrmResult<()> {
        Ok(())
    }

    async fn after_remove(&self, _event: &RemoveEvent) -> OrmResult<()> {
        Ok(())
    }
}

/// Dispatches events to entity listeners and subscribers.
#[derive(Clone, Default)]
pub struct Broadcaster {
    subscribers: Vec<Arc<dyn EntitySubscriber>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EntitySubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn add_subscriber(&mut self, subscriber: Arc<dyn EntitySubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn subscribers_for<'a>(
        &'a self,
        metadata: &'a EntityMetadata,
    ) -> impl Iterator<Item = &'a Arc<dyn EntitySubscriber>> + 'a {
        self.subscribers.iter().filter(move |s| match s.listens_to() {
            None => true,
            Some(name) => {
                name == metadata.name || metadata.parent().is_some_and(|p| p.name == name)
            }
        })
    }

    fn call_listeners(metadata: &EntityMetadata, kind: ListenerKind, entity: &Entity) {
        for listener in metadata.listeners_for(kind) {
            listener.call(entity);
        }
    }

    pub async fn before_insert(&self, metadata: &EntityMetadata, entity: &Entity) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::BeforeInsert, entity);
        let event = InsertEvent {
            entity: entity.clone(),
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.before_insert(&event))).await?;
        Ok(())
    }

    pub async fn after_insert(&self, metadata: &EntityMetadata, entity: &Entity) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::AfterInsert, entity);
        let event = InsertEvent {
            entity: entity.clone(),
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.after_insert(&event))).await?;
        Ok(())
    }

    pub async fn before_update(
        &self,
        metadata: &EntityMetadata,
        entity: &Entity,
        updated_columns: &[String],
    ) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::BeforeUpdate, entity);
        let event = UpdateEvent {
            entity: entity.clone(),
            updated_columns: updated_columns.to_vec(),
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.before_update(&event))).await?;
        Ok(())
    }

    pub async fn after_update(
        &self,
        metadata: &EntityMetadata,
        entity: &Entity,
        updated_columns: &[String],
    ) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::AfterUpdate, entity);
        let event = UpdateEvent {
            entity: entity.clone(),
            updated_columns: updated_columns.to_vec(),
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.after_update(&event))).await?;
        Ok(())
    }

    pub async fn before_remove(
        &self,
        metadata: &EntityMetadata,
        entity: &Entity,
        entity_id: &EntityId,
        deleted: bool,
    ) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::BeforeRemove, entity);
        let event = RemoveEvent {
            entity: entity.clone(),
            entity_id: entity_id.clone(),
            deleted,
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.before_remove(&event))).await?;
        Ok(())
    }

    pub async fn after_remove(
        &self,
        metadata: &EntityMetadata,
        entity: &Entity,
        entity_id: &EntityId,
        deleted: bool,
    ) -> OrmResult<()> {
        Self::call_listeners(metadata, ListenerKind::AfterRemove, entity);
        let event = RemoveEvent {
            entity: entity.clone(),
            entity_id: entity_id.clone(),
            deleted,
        };
        try_join_all(self.subscribers_for(metadata).map(|s| s.after_remove(&event))).await?;
        Ok(())
    }
}
