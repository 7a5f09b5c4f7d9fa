#![allow(dead_code)]

use async_trait::async_trait;
use entigraph::memory::MemoryDatabase;
use entigraph::{
    ColumnMetadata, Entity, EntityManager, EntityMetadata, EntitySubscriber, InsertEvent, JoinTable,
    MetadataRegistry, OrmResult, RelationMetadata, RemoveEvent, UpdateEvent, Value, ValueMap,
};
use std::sync::{Arc, Mutex};

/// Users write posts; posts own comments and share tags.
pub fn blog() -> MetadataRegistry {
    MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("User", "users")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("name"))
                .relation(RelationMetadata::one_to_many("posts", "Post", "author")),
        )
        .entity(
            EntityMetadata::new("Post", "posts")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("title"))
                .column(ColumnMetadata::version("version"))
                .relation(RelationMetadata::many_to_one("author", "User", "author_id").inverse("posts"))
                .relation(RelationMetadata::one_to_many("comments", "Comment", "post").cascade_remove())
                .relation(
                    RelationMetadata::many_to_many("tags", "Tag", JoinTable::new("post_tags", "post_id", "tag_id"))
                        .inverse("posts"),
                ),
        )
        .entity(
            EntityMetadata::new("Comment", "comments")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("body"))
                .relation(RelationMetadata::many_to_one("post", "Post", "post_id").inverse("comments")),
        )
        .entity(
            EntityMetadata::new("Tag", "tags")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("name"))
                .relation(RelationMetadata::many_to_many_inverse("posts", "Post", "tags")),
        )
        .build()
        .unwrap()
}

pub fn manager(db: &MemoryDatabase) -> EntityManager<MemoryDatabase> {
    EntityManager::new(blog(), db.clone())
}

pub fn row(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn id(value: i64) -> ValueMap {
    row(&[("id", value.into())])
}

pub fn comment(body: &str) -> Entity {
    Entity::new("Comment").with("body", body)
}

pub fn tag(name: &str) -> Entity {
    Entity::new("Tag").with("name", name)
}

/// Column values of every row in `table`, ordered by `id`.
pub fn column(db: &MemoryDatabase, table: &str, name: &str) -> Vec<Value> {
    let mut rows = db.rows(table);
    rows.sort_by_key(|r| r.get("id").and_then(Value::as_i64));
    rows.iter()
        .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Records every event as `"<hook> <entity>"`; cut relations are marked `(cut)`.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, hook: &str, entity: &Entity) {
        self.events.lock().unwrap().push(format!("{hook} {}", entity.target()));
    }

    fn push_remove(&self, hook: &str, event: &RemoveEvent) {
        let suffix = if event.deleted { "" } else { " (cut)" };
        self.events
            .lock()
            .unwrap()
            .push(format!("{hook} {}{suffix}", event.entity.target()));
    }
}

#[async_trait]
impl EntitySubscriber for Recorder {
    async fn before_insert(&self, event: &InsertEvent) -> OrmResult<()> {
        self.push("before_insert", &event.entity);
        Ok(())
    }

    async fn after_insert(&self, event: &InsertEvent) -> OrmResult<()> {
        self.push("after_insert", &event.entity);
        Ok(())
    }

    async fn before_update(&self, event: &UpdateEvent) -> OrmResult<()> {
        self.push("before_update", &event.entity);
        Ok(())
    }

    async fn after_update(&self, event: &UpdateEvent) -> OrmResult<()> {
        self.push("after_update", &event.entity);
        Ok(())
    }

    async fn before_remove(&self, event: &RemoveEvent) -> OrmResult<()> {
        self.push_remove("before_remove", event);
        Ok(())
    }

    async fn after_remove(&self, event: &RemoveEvent) -> OrmResult<()> {
        self.push_remove("after_remove", event);
        Ok(())
    }
}

pub fn recorder() -> Arc<Recorder> {
    Arc::new(Recorder::default())
}
