//! Round trip against a live Postgres. Skipped when `DATABASE_URL` is unset.

#![cfg(feature = "pool")]

use entigraph::{
    ColumnMetadata, Entity, EntityManager, EntityMetadata, MetadataRegistry, OrmResult, PgRunnerConfig,
    PgRunnerProvider, QueryRunner, RelationMetadata, RunnerProvider, Value,
};
use std::time::{SystemTime, UNIX_EPOCH};

fn registry(posts: &str, comments: &str) -> OrmResult<MetadataRegistry> {
    MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Post", posts)
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("title"))
                .column(ColumnMetadata::version("version"))
                .relation(RelationMetadata::one_to_many("comments", "Comment", "post").cascade_remove()),
        )
        .entity(
            EntityMetadata::new("Comment", comments)
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("body"))
                .relation(RelationMetadata::many_to_one("post", "Post", "post_id").inverse("comments")),
        )
        .build()
}

#[tokio::test]
async fn persist_update_remove_roundtrip() -> OrmResult<()> {
    dotenvy::dotenv().ok();
    let config = match PgRunnerConfig::from_env() {
        Ok(config) => config,
        Err(_) => {
            eprintln!("DATABASE_URL is not set; skipping persist_update_remove_roundtrip");
            return Ok(());
        }
    };

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before UNIX_EPOCH")
        .as_nanos();
    let posts = format!("entigraph_posts_{}_{}", std::process::id(), nanos);
    let comments = format!("entigraph_comments_{}_{}", std::process::id(), nanos);

    let provider = PgRunnerProvider::connect(config)?;
    let setup = provider.provide().await?;
    setup
        .query(
            &format!("CREATE TABLE {posts} (id BIGSERIAL PRIMARY KEY, title TEXT, version BIGINT NOT NULL)"),
            &[],
        )
        .await?;
    setup
        .query(
            &format!(
                "CREATE TABLE {comments} (id BIGSERIAL PRIMARY KEY, body TEXT, \
                 post_id BIGINT REFERENCES {posts}(id))"
            ),
            &[],
        )
        .await?;

    let manager = EntityManager::new(registry(&posts, &comments)?, provider.clone());
    let post = Entity::new("Post")
        .with("title", "hello")
        .with_many("comments", vec![Entity::new("Comment").with("body", "first")]);
    manager.persist(&post).await?;
    let id = post.get("id").expect("id written back");

    post.set("title", "edited");
    manager.persist(&post).await?;
    assert_eq!(post.get("version"), Some(Value::Int(2)));

    let mut key = entigraph::ValueMap::new();
    key.insert("id".to_string(), id);
    let loaded = manager
        .find_by_id_with("Post", &key, &["comments"])
        .await?
        .expect("post row");
    assert_eq!(loaded.get("title"), Some(Value::from("edited")));
    assert_eq!(loaded.relation("comments").map(|c| c.entities().len()), Some(1));

    manager.remove(&post).await?;
    assert!(manager.find_by_id("Post", &key).await?.is_none());

    setup.query(&format!("DROP TABLE {comments}, {posts}"), &[]).await?;
    provider.release(setup).await?;
    Ok(())
}
