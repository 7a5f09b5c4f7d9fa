mod common;

use common::{column, id, recorder};
use entigraph::memory::{MemoryDatabase, StatementKind};
use entigraph::{ColumnMetadata, Entity, EntityManager, EntityMetadata, MetadataRegistry, Value};

fn contents() -> MetadataRegistry {
    MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Content", "contents")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::discriminator("kind"))
                .column(ColumnMetadata::new("title"))
                .column(ColumnMetadata::create_date("created_at")),
        )
        .entity(
            EntityMetadata::new("Photo", "photos")
                .child_of("Content", "content_id")
                .discriminator_value("photo")
                .column(ColumnMetadata::new("url")),
        )
        .build()
        .unwrap()
}

fn photo() -> Entity {
    Entity::new("Photo").with("title", "sunset").with("url", "s.png")
}

#[tokio::test]
async fn child_insert_writes_parent_row_first() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(contents(), db.clone());
    let photo = photo();

    manager.persist(&photo).await.unwrap();

    let inserts: Vec<_> = db
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Insert)
        .filter_map(|s| s.table)
        .collect();
    assert_eq!(inserts, vec!["contents".to_string(), "photos".to_string()]);
    assert_eq!(photo.get("id"), Some(Value::Int(1)));
    assert_eq!(photo.get("kind"), Some(Value::from("photo")));
    assert!(photo.get("created_at").and_then(|v| v.as_timestamp()).is_some());
    assert_eq!(column(&db, "contents", "kind"), vec![Value::from("photo")]);
    let photos = db.rows("photos");
    assert_eq!(photos[0].get("content_id"), Some(&Value::Int(1)));
    assert_eq!(photos[0].get("url"), Some(&Value::from("s.png")));
    assert_eq!(photos[0].get("title"), None, "parent columns stay in the parent table");
}

#[tokio::test]
async fn updates_are_routed_to_the_owning_table() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(contents(), db.clone());
    let photo = photo();
    manager.persist(&photo).await.unwrap();
    db.clear_statements();

    photo.set("title", "dawn");
    photo.set("url", "d.png");
    manager.persist(&photo).await.unwrap();

    let mut updated: Vec<_> = db
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Update)
        .map(|s| (s.table.unwrap_or_default(), s.conditions))
        .collect();
    updated.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(updated.len(), 2);
    assert_eq!(updated[0].0, "contents");
    assert_eq!(updated[0].1.get("id"), Some(&Value::Int(1)));
    assert_eq!(updated[1].0, "photos");
    assert_eq!(updated[1].1.get("content_id"), Some(&Value::Int(1)));

    let loaded = manager.find_by_id("Photo", &id(1)).await.unwrap().unwrap();
    assert_eq!(loaded.get("title"), Some(Value::from("dawn")));
    assert_eq!(loaded.get("url"), Some(Value::from("d.png")));
}

#[tokio::test]
async fn removing_a_child_deletes_both_rows_child_first() {
    let db = MemoryDatabase::new();
    let events = recorder();
    let manager = EntityManager::new(contents(), db.clone()).with_subscriber(events.clone());
    let photo = photo();
    manager.persist(&photo).await.unwrap();
    db.clear_statements();

    manager.remove(&photo).await.unwrap();

    let deletes: Vec<_> = db
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Delete)
        .filter_map(|s| s.table)
        .collect();
    assert_eq!(deletes, vec!["photos".to_string(), "contents".to_string()]);
    assert!(db.rows("contents").is_empty());
    assert_eq!(photo.get("id"), None);
    assert!(events.events().contains(&"after_remove Photo".to_string()));
}
