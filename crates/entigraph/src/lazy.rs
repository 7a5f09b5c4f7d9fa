//! Lazy relation slots.
//!
//! A lazy relation starts as [`RelationSlot::Unloaded`]. The first
//! [`load_relation`] call moves it to `Loading`, fetches the related entities
//! through an [`EntityLoader`] and stores them as `Loaded`. Callers arriving
//! while a load is in flight wait for it instead of issuing a second query.

use crate::entity::{Entity, RelationSlot, RelationValue};
use crate::error::{OrmError, OrmResult};
use crate::loader::EntityLoader;
use crate::metadata::EntityMetadata;
use tokio::sync::watch;

/// Resets the slot to `Unloaded` unless the load completed.
struct LoadingGuard<'a> {
    entity: &'a Entity,
    property: &'a str,
    done: Option<watch::Sender<bool>>,
}

impl LoadingGuard<'_> {
    fn finish(mut self, slot: RelationSlot) {
        self.entity.set_slot(self.property, slot);
        if let Some(tx) = self.done.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.done.take() {
            self.entity.set_slot(self.property, RelationSlot::Unloaded);
            let _ = tx.send(true);
        }
    }
}

/// Return the value of `property` on `entity`, loading it once if needed.
pub async fn load_relation(
    entity: &Entity,
    metadata: &EntityMetadata,
    property: &str,
    loader: &dyn EntityLoader,
) -> OrmResult<RelationValue> {
    if metadata.find_relation(property).is_none() {
        return Err(OrmError::invalid_metadata(format!(
            "'{}' has no relation '{property}'",
            metadata.name
        )));
    }

    loop {
        match entity.slot(property) {
            Some(RelationSlot::Loaded(value)) => return Ok(value),
            Some(RelationSlot::Loading(mut rx)) => {
                // A dropped sender means the loader gave up; re-check the slot.
                let _ = rx.wait_for(|settled| *settled).await;
                continue;
            }
            _ => {}
        }

        let Some(tx) = entity.begin_loading(property) else {
            continue;
        };
        let guard = LoadingGuard {
            entity,
            property,
            done: Some(tx),
        };

        let id = entity.id_of(metadata.identity_properties());
        let value = loader.load_relation(metadata, &id, property).await?;
        guard.finish(RelationSlot::Loaded(value.clone()));
        return Ok(value);
    }
}

/// Whether `property` holds a loaded value.
pub fn is_loaded(entity: &Entity, property: &str) -> bool {
    matches!(entity.slot(property), Some(RelationSlot::Loaded(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use crate::loader::RelationPath;
    use crate::metadata::{ColumnMetadata, RelationMetadata};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EntityLoader for CountingLoader {
        async fn find_by_id(
            &self,
            _metadata: &EntityMetadata,
            _id: &EntityId,
            _relations: &[RelationPath],
        ) -> OrmResult<Option<Entity>> {
            Ok(None)
        }

        async fn load_relation(
            &self,
            _metadata: &EntityMetadata,
            _id: &EntityId,
            _relation: &str,
        ) -> OrmResult<RelationValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail {
                return Err(OrmError::Other("boom".to_string()));
            }
            Ok(RelationValue::Many(vec![Entity::new("Comment")]))
        }
    }

    fn post_metadata() -> EntityMetadata {
        EntityMetadata::new("Post", "posts")
            .column(ColumnMetadata::generated_primary("id"))
            .relation(RelationMetadata::one_to_many("comments", "Comment", "post").lazy())
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_query() {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let metadata = post_metadata();
        let post = Entity::new("Post").with("id", 1);
        post.mark_unloaded("comments");

        let (a, b) = tokio::join!(
            load_relation(&post, &metadata, "comments", loader.as_ref()),
            load_relation(&post, &metadata, "comments", loader.as_ref()),
        );

        assert_eq!(a.unwrap().entities().len(), 1);
        assert_eq!(b.unwrap().entities().len(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(is_loaded(&post, "comments"));
    }

    #[tokio::test]
    async fn failed_load_resets_the_slot() {
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let metadata = post_metadata();
        let post = Entity::new("Post").with("id", 1);
        post.mark_unloaded("comments");

        assert!(load_relation(&post, &metadata, "comments", &loader).await.is_err());
        assert!(matches!(post.slot("comments"), Some(RelationSlot::Unloaded)));
    }

    #[tokio::test]
    async fn unknown_relation_is_rejected() {
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let post = Entity::new("Post");
        let err = load_relation(&post, &post_metadata(), "tags", &loader)
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidMetadata(_)));
    }
}
