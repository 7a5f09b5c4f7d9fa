//! Top-level entry point: [`EntityManager`] and explicit [`Transaction`] scopes.
//!
//! ```ignore
//! use entigraph::prelude::*;
//!
//! let manager = EntityManager::new(registry, MemoryDatabase::new());
//!
//! let post = Entity::new("Post").with("title", "hello");
//! manager.persist(&post).await?;
//! assert!(post.get("id").is_some());
//!
//! let tx = manager.begin().await?;
//! tx.persist(&post.with("title", "edited")).await?;
//! tx.commit().await?;
//! ```

use crate::broadcaster::{Broadcaster, EntitySubscriber};
use crate::config::ManagerConfig;
use crate::entity::{Entity, EntityId, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::lazy;
use crate::loader::{EntityLoader, GraphLoader, RelationPath};
use crate::metadata::MetadataRegistry;
use crate::persist::EntityPersister;
use crate::runner::{QueryRunner, RunnerProvider};
use std::sync::Arc;

/// Owns the metadata registry, the runner provider and the event broadcaster.
///
/// Every call obtains its own runner and gives it back before returning,
/// whether the call succeeded or not.
pub struct EntityManager<P> {
    registry: Arc<MetadataRegistry>,
    provider: P,
    broadcaster: Broadcaster,
    config: ManagerConfig,
}

impl<P> std::fmt::Debug for EntityManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("entities", &self.registry.len())
            .field("broadcaster", &self.broadcaster)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: RunnerProvider> EntityManager<P> {
    pub fn new(registry: impl Into<Arc<MetadataRegistry>>, provider: P) -> Self {
        Self {
            registry: registry.into(),
            provider,
            broadcaster: Broadcaster::new(),
            config: ManagerConfig::default(),
        }
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EntitySubscriber>) -> Self {
        self.broadcaster.add_subscriber(subscriber);
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn persister<'a>(&'a self, runner: &'a P::Runner, loader: &'a dyn EntityLoader) -> EntityPersister<'a, P::Runner> {
        EntityPersister::new(&self.registry, &self.broadcaster, runner, loader)
            .load_missing(self.config.load_missing_entities)
    }

    /// Give `runner` back and return `result`; a failed release only
    /// surfaces when the call itself succeeded.
    async fn finish<T>(&self, runner: P::Runner, result: OrmResult<T>) -> OrmResult<T> {
        let released = self.provider.release(runner).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::warn!(
                    target: "entigraph.persist",
                    error = %release_err,
                    "releasing the query runner after a failed call failed"
                );
                Err(err)
            }
        }
    }

    /// Insert or update `entity` and the graph its cascades reach.
    pub async fn persist(&self, entity: &Entity) -> OrmResult<Entity> {
        let runner = self.provider.provide().await?;
        let result = {
            let loader = GraphLoader::new(&runner, &self.registry);
            self.persister(&runner, &loader).persist(entity).await
        };
        self.finish(runner, result).await
    }

    /// Delete `entity`'s row (and its remove cascades); clears its identity.
    pub async fn remove(&self, entity: &Entity) -> OrmResult<Entity> {
        let runner = self.provider.provide().await?;
        let result = {
            let loader = GraphLoader::new(&runner, &self.registry);
            self.persister(&runner, &loader).remove(entity).await
        };
        self.finish(runner, result).await
    }

    /// Load the row of `target` identified by `id`, without relations.
    pub async fn find_by_id(&self, target: &str, id: &EntityId) -> OrmResult<Option<Entity>> {
        self.find_by_id_with(target, id, &[]).await
    }

    /// Load the row of `target` identified by `id` with the given dotted relation paths.
    pub async fn find_by_id_with(&self, target: &str, id: &EntityId, paths: &[&str]) -> OrmResult<Option<Entity>> {
        let metadata = self.registry.get(target)?.clone();
        let paths: Vec<RelationPath> = paths.iter().map(|p| p.to_string()).collect();
        let runner = self.provider.provide().await?;
        let result = GraphLoader::new(&runner, &self.registry)
            .find_by_id(&metadata, id, &paths)
            .await;
        self.finish(runner, result).await
    }

    /// Fill the lazy relation `property` of `entity`, loading it at most once.
    pub async fn load_relation(&self, entity: &Entity, property: &str) -> OrmResult<RelationValue> {
        let metadata = self.registry.get(&entity.target())?.clone();
        if metadata.find_relation(property).is_some()
            && let Some(value) = entity.relation(property)
        {
            return Ok(value);
        }
        let runner = self.provider.provide().await?;
        let result = {
            let loader = GraphLoader::new(&runner, &self.registry);
            lazy::load_relation(entity, &metadata, property, &loader).await
        };
        self.finish(runner, result).await
    }

    /// Open a transaction on a dedicated runner.
    pub async fn begin(&self) -> OrmResult<Transaction<'_, P>> {
        let runner = self.provider.provide().await?;
        if let Err(err) = runner.begin_transaction().await {
            return self.finish(runner, Err(err)).await;
        }
        tracing::debug!(target: "entigraph.persist", "transaction opened");
        Ok(Transaction {
            manager: self,
            runner: Some(runner),
        })
    }
}

/// A transaction scope holding one runner.
///
/// Persist and remove calls made through the scope run inside its
/// transaction and never commit on their own. Dropping the scope without
/// [`commit`](Transaction::commit) discards the runner and its transaction.
pub struct Transaction<'m, P: RunnerProvider> {
    manager: &'m EntityManager<P>,
    runner: Option<P::Runner>,
}

impl<P: RunnerProvider> std::fmt::Debug for Transaction<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("open", &self.runner.is_some())
            .finish_non_exhaustive()
    }
}

impl<'m, P: RunnerProvider> Transaction<'m, P> {
    /// The runner the transaction is open on.
    pub fn runner(&self) -> OrmResult<&P::Runner> {
        self.runner.as_ref().ok_or(OrmError::RunnerReleased)
    }

    pub async fn persist(&self, entity: &Entity) -> OrmResult<Entity> {
        let runner = self.runner()?;
        let loader = GraphLoader::new(runner, &self.manager.registry);
        self.manager.persister(runner, &loader).persist(entity).await
    }

    pub async fn remove(&self, entity: &Entity) -> OrmResult<Entity> {
        let runner = self.runner()?;
        let loader = GraphLoader::new(runner, &self.manager.registry);
        self.manager.persister(runner, &loader).remove(entity).await
    }

    /// Read inside the transaction, seeing its uncommitted writes.
    pub async fn find_by_id(&self, target: &str, id: &EntityId) -> OrmResult<Option<Entity>> {
        let metadata = self.manager.registry.get(target)?.clone();
        GraphLoader::new(self.runner()?, &self.manager.registry)
            .find_by_id(&metadata, id, &[])
            .await
    }

    pub async fn commit(mut self) -> OrmResult<()> {
        let runner = self.runner.take().ok_or(OrmError::RunnerReleased)?;
        let result = runner.commit_transaction().await;
        tracing::debug!(target: "entigraph.persist", ok = result.is_ok(), "transaction committed");
        self.manager.finish(runner, result).await
    }

    pub async fn rollback(mut self) -> OrmResult<()> {
        let runner = self.runner.take().ok_or(OrmError::RunnerReleased)?;
        let result = runner.rollback_transaction().await;
        tracing::debug!(target: "entigraph.persist", ok = result.is_ok(), "transaction rolled back");
        self.manager.finish(runner, result).await
    }
}

// Neither committed nor rolled back: uncommitted writes are dropped with the runner.
impl<P: RunnerProvider> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            tracing::warn!(target: "entigraph.persist", "transaction dropped without commit or rollback");
            self.manager.provider.discard(runner);
        }
    }
}
