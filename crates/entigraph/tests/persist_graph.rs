mod common;

use common::*;
use entigraph::memory::{MemoryDatabase, StatementKind};
use entigraph::{Entity, ManagerConfig, OrmError, Value};

#[tokio::test]
async fn persist_new_graph_inserts_and_writes_back() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![comment("first"), comment("second")]);

    manager.persist(&post).await.unwrap();

    assert_eq!(post.get("id"), Some(Value::Int(1)));
    assert_eq!(post.get("version"), Some(Value::Int(1)));
    let comments = post.relation("comments").unwrap().entities();
    assert!(comments.iter().all(|c| c.get("id").is_some()));
    assert_eq!(column(&db, "comments", "post_id"), vec![Value::Int(1), Value::Int(1)]);
    assert_eq!(column(&db, "posts", "title"), vec![Value::from("hello")]);
    assert_eq!(db.open_runners(), 0);
}

#[tokio::test]
async fn persisting_an_unchanged_graph_writes_nothing() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![comment("first")])
        .with_many("tags", vec![tag("rust")]);
    manager.persist(&post).await.unwrap();
    db.clear_statements();

    manager.persist(&post).await.unwrap();

    assert_eq!(db.mutation_count(), 0);
    assert!(!db.statements().iter().any(|s| s.kind == StatementKind::Begin));
}

#[tokio::test]
async fn changed_column_is_updated_and_version_bumped() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post").with("title", "draft");
    manager.persist(&post).await.unwrap();
    db.clear_statements();

    post.set("title", "final");
    manager.persist(&post).await.unwrap();

    let updates: Vec<_> = db
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Update)
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].values.get("title"), Some(&Value::from("final")));
    assert_eq!(updates[0].conditions.get("version"), Some(&Value::Int(1)));
    assert_eq!(post.get("version"), Some(Value::Int(2)));
    assert_eq!(column(&db, "posts", "version"), vec![Value::Int(2)]);
}

#[tokio::test]
async fn stale_copy_is_rejected() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post").with("title", "draft");
    manager.persist(&post).await.unwrap();

    let first = manager.find_by_id("Post", &id(1)).await.unwrap().unwrap();
    let second = manager.find_by_id("Post", &id(1)).await.unwrap().unwrap();
    first.set("title", "mine");
    manager.persist(&first).await.unwrap();
    second.set("title", "theirs");

    let err = manager.persist(&second).await.unwrap_err();

    assert!(err.is_stale_record(), "{err}");
    assert_eq!(column(&db, "posts", "title"), vec![Value::from("mine")]);
    assert_eq!(db.open_runners(), 0);
}

#[tokio::test]
async fn dropping_a_comment_from_a_cascading_collection_deletes_it() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let keep = comment("keep");
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![keep.clone(), comment("drop")]);
    manager.persist(&post).await.unwrap();

    post.set_many("comments", vec![keep]);
    manager.persist(&post).await.unwrap();

    assert_eq!(column(&db, "comments", "body"), vec![Value::from("keep")]);
}

#[tokio::test]
async fn tags_are_linked_and_unlinked_through_the_junction() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let rust = tag("rust");
    let sql = tag("sql");
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("tags", vec![rust.clone(), sql.clone()]);
    manager.persist(&post).await.unwrap();
    assert_eq!(db.rows("post_tags").len(), 2);

    post.set_many("tags", vec![sql.clone()]);
    manager.persist(&post).await.unwrap();

    let links = db.rows("post_tags");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get("tag_id"), sql.get("id").as_ref());
    assert_eq!(db.rows("tags").len(), 2, "tags themselves are kept");
}

#[tokio::test]
async fn find_by_id_with_loads_requested_paths() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let author = Entity::new("User").with("name", "ada");
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_one("author", author.clone())
        .with_many("comments", vec![comment("a"), comment("b")])
        .with_many("tags", vec![tag("rust")]);
    manager.persist(&post).await.unwrap();

    let loaded = manager
        .find_by_id_with("Post", &id(1), &["comments", "tags", "author.posts"])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loaded.relation("comments").unwrap().entities().len(), 2);
    assert_eq!(loaded.relation("tags").unwrap().entities().len(), 1);
    let loaded_author = loaded.related_one("author").unwrap();
    assert_eq!(loaded_author.get("name"), Some(Value::from("ada")));
    let posts = loaded_author.relation("posts").unwrap().entities();
    assert!(posts[0].ptr_eq(&loaded), "identity map keeps the cycle");
    assert!(manager.find_by_id("Post", &id(99)).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_entity_is_rejected_and_runner_released() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);

    let err = manager.persist(&Entity::new("Nope")).await.unwrap_err();

    assert!(matches!(err, OrmError::MetadataNotFound(_)));
    assert_eq!(db.open_runners(), 0);
}

#[tokio::test]
async fn failed_statement_rolls_back_every_write() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    db.fail_on(StatementKind::Insert, "comments");
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![comment("boom")]);

    assert!(manager.persist(&post).await.is_err());

    assert!(db.rows("posts").is_empty());
    assert!(db.rows("comments").is_empty());
    assert_eq!(post.get("id"), None);
    assert!(db.statements().iter().any(|s| s.kind == StatementKind::Rollback));
    assert_eq!(db.open_runners(), 0);
}

#[tokio::test]
async fn unique_violation_surfaces_as_typed_error() {
    let db = MemoryDatabase::new().unique("tags", "name");
    let manager = manager(&db);
    manager.persist(&tag("rust")).await.unwrap();

    let err = manager.persist(&tag("rust")).await.unwrap_err();

    assert!(matches!(err, OrmError::UniqueViolation(_)), "{err}");
    assert_eq!(db.rows("tags").len(), 1);
}

#[tokio::test]
async fn unmatched_identified_entity_is_inserted_by_default() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);

    manager
        .persist(&Entity::new("Tag").with("id", 7).with("name", "seeded"))
        .await
        .unwrap();

    assert_eq!(column(&db, "tags", "id"), vec![Value::Int(7)]);
}

#[tokio::test]
async fn unmatched_identified_entity_is_skipped_without_missing_lookup() {
    let db = MemoryDatabase::new();
    let manager = manager(&db).with_config(ManagerConfig::new().load_missing_entities(false));

    manager
        .persist(&Entity::new("Tag").with("id", 7).with("name", "seeded"))
        .await
        .unwrap();

    assert!(db.rows("tags").is_empty());
}

#[tokio::test]
async fn subscribers_see_inserts_and_updates() {
    let db = MemoryDatabase::new();
    let events = recorder();
    let manager = manager(&db).with_subscriber(events.clone());
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![comment("a")]);

    manager.persist(&post).await.unwrap();
    post.set("title", "edited");
    manager.persist(&post).await.unwrap();

    let events = events.events();
    for expected in [
        "before_insert Post",
        "before_insert Comment",
        "after_insert Post",
        "after_insert Comment",
        "before_update Post",
        "after_update Post",
    ] {
        assert!(events.contains(&expected.to_string()), "{expected} missing from {events:?}");
    }
    let first_after = events.iter().position(|e| e.starts_with("after_")).unwrap();
    assert!(events[..first_after].iter().all(|e| e.starts_with("before_insert")));
}

#[tokio::test]
async fn reloaded_bidirectional_graph_writes_nothing() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_one("author", Entity::new("User").with("name", "ada"))
        .with_many("comments", vec![comment("a"), comment("b")])
        .with_many("tags", vec![tag("rust")]);
    manager.persist(&post).await.unwrap();
    db.clear_statements();

    let loaded = manager
        .find_by_id_with(
            "Post",
            &id(1),
            &["author", "author.posts", "comments", "comments.post", "tags", "tags.posts"],
        )
        .await
        .unwrap()
        .unwrap();
    manager.persist(&loaded).await.unwrap();

    assert_eq!(db.mutation_count(), 0, "{:?}", db.statements());
    assert_eq!(loaded.get("version"), Some(Value::Int(1)));
}

#[tokio::test]
async fn comment_edited_through_a_reloaded_graph_is_updated() {
    let db = MemoryDatabase::new();
    let manager = manager(&db);
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![comment("a")]);
    manager.persist(&post).await.unwrap();
    db.clear_statements();

    let loaded = manager
        .find_by_id_with("Post", &id(1), &["comments", "comments.post"])
        .await
        .unwrap()
        .unwrap();
    let loaded_comment = loaded.relation("comments").unwrap().entities().remove(0);
    loaded_comment.set("body", "edited");
    manager.persist(&loaded).await.unwrap();

    let updates: Vec<_> = db
        .statements()
        .into_iter()
        .filter(|s| s.kind.is_mutation())
        .collect();
    assert_eq!(updates.len(), 1, "{updates:?}");
    assert_eq!(updates[0].table.as_deref(), Some("comments"));
    assert_eq!(column(&db, "comments", "body"), vec![Value::from("edited")]);
    assert_eq!(loaded.get("version"), Some(Value::Int(1)));
}

#[tokio::test]
async fn clearing_a_to_one_reports_the_cut_target() {
    let db = MemoryDatabase::new();
    let events = recorder();
    let manager = manager(&db).with_subscriber(events.clone());
    let reply = comment("orphan").with_one("post", Entity::new("Post").with("title", "p"));
    manager.persist(&reply).await.unwrap();

    reply.set_one("post", None);
    manager.persist(&reply).await.unwrap();

    assert_eq!(column(&db, "comments", "post_id"), vec![Value::Null]);
    assert_eq!(db.rows("posts").len(), 1, "the post row is kept");
    let events = events.events();
    assert!(events.contains(&"before_remove Post (cut)".to_string()), "{events:?}");
    assert!(events.contains(&"after_remove Post (cut)".to_string()), "{events:?}");
}
