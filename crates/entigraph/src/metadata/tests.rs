use super::*;
use crate::error::{OrmError, OrmResult};

fn post() -> EntityMetadata {
    EntityMetadata::new("Post", "posts")
        .column(ColumnMetadata::generated_primary("id"))
        .column(ColumnMetadata::new("title"))
        .relation(RelationMetadata::one_to_many("comments", "Comment", "post"))
}

fn comment() -> EntityMetadata {
    EntityMetadata::new("Comment", "comments")
        .column(ColumnMetadata::generated_primary("id"))
        .relation(RelationMetadata::many_to_one("post", "Post", "post_id"))
}

fn invalid(result: OrmResult<MetadataRegistry>) -> String {
    match result {
        Err(OrmError::InvalidMetadata(message)) => message,
        other => panic!("expected invalid metadata, got {other:?}"),
    }
}

#[test]
fn builds_and_resolves_identity() {
    let registry = MetadataRegistry::builder()
        .entity(post())
        .entity(comment())
        .build()
        .unwrap();

    assert_eq!(registry.len(), 2);
    let post = registry.get("Post").unwrap();
    assert_eq!(post.identity_properties(), ["id".to_string()]);
    assert_eq!(post.generated_column().map(|c| c.name.as_str()), Some("id"));
}

#[test]
fn unknown_entity_is_metadata_not_found() {
    let registry = MetadataRegistry::builder()
        .entity(EntityMetadata::new("Tag", "tags").column(ColumnMetadata::generated_primary("id")))
        .build()
        .unwrap();

    let err = registry.get("Nope").unwrap_err();

    assert!(matches!(err, OrmError::MetadataNotFound(name) if name == "Nope"));
}

#[test]
fn rejects_entity_without_primary_column() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(EntityMetadata::new("Log", "logs").column(ColumnMetadata::new("line")))
            .build(),
    );
    assert!(message.contains("no primary column"), "{message}");
}

#[test]
fn rejects_duplicate_entity() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(comment())
            .entity(comment())
            .entity(post())
            .build(),
    );
    assert!(message.contains("registered twice"), "{message}");
}

#[test]
fn rejects_unknown_relation_target() {
    let message = invalid(MetadataRegistry::builder().entity(comment()).build());
    assert!(message.contains("unknown target 'Post'"), "{message}");
}

#[test]
fn rejects_inverse_side_without_owning_counterpart() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(post())
            .entity(EntityMetadata::new("Comment", "comments").column(ColumnMetadata::generated_primary("id")))
            .build(),
    );
    assert!(message.contains("has no relation 'post'"), "{message}");
}

#[test]
fn rejects_invalid_identifiers() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Post", "posts; drop table x")
                    .column(ColumnMetadata::generated_primary("id")),
            )
            .build(),
    );
    assert!(message.contains("invalid SQL identifier"), "{message}");
}

#[test]
fn rejects_composite_foreign_keys() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Pair", "pairs")
                    .column(ColumnMetadata::primary("a"))
                    .column(ColumnMetadata::primary("b")),
            )
            .entity(
                EntityMetadata::new("Ref", "refs")
                    .column(ColumnMetadata::generated_primary("id"))
                    .relation(RelationMetadata::many_to_one("pair", "Pair", "pair_id")),
            )
            .build(),
    );
    assert!(message.contains("composite foreign keys"), "{message}");
}

#[test]
fn composite_target_is_fine_with_explicit_reference() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Pair", "pairs")
                .column(ColumnMetadata::primary("a"))
                .column(ColumnMetadata::primary("b"))
                .column(ColumnMetadata::new("code")),
        )
        .entity(
            EntityMetadata::new("Ref", "refs")
                .column(ColumnMetadata::generated_primary("id"))
                .relation(RelationMetadata::many_to_one("pair", "Pair", "pair_code").references("code")),
        )
        .build()
        .unwrap();

    let relation = registry.get("Ref").unwrap().find_relation("pair").unwrap();
    assert_eq!(registry.referenced_property(relation).unwrap(), "code");
    assert_eq!(registry.get("Pair").unwrap().identity_properties().len(), 2);
}

#[test]
fn tree_parent_must_point_at_same_closure_entity() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Category", "categories")
                    .column(ColumnMetadata::generated_primary("id"))
                    .relation(RelationMetadata::many_to_one("parent", "Category", "parent_id").tree_parent()),
            )
            .build(),
    );
    assert!(message.contains("tree parent"), "{message}");

    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Category", "categories")
                .closure("categories_closure")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::tree_level("level"))
                .relation(RelationMetadata::many_to_one("parent", "Category", "parent_id").tree_parent()),
        )
        .build()
        .unwrap();
    let category = registry.get("Category").unwrap();
    assert!(category.is_closure());
    assert_eq!(category.tree_parent_relation().unwrap().property, "parent");
}

#[test]
fn class_table_child_inherits_identity_and_columns() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Photo", "photos")
                .child_of("Content", "content_id")
                .column(ColumnMetadata::new("url")),
        )
        .entity(
            EntityMetadata::new("Content", "contents")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::discriminator("kind"))
                .column(ColumnMetadata::new("title")),
        )
        .build()
        .unwrap();

    let photo = registry.get("Photo").unwrap();
    assert_eq!(photo.parent().unwrap().name, "Content");
    assert_eq!(photo.identity_properties(), ["id".to_string()]);
    assert_eq!(photo.table_of("title"), "contents");
    assert_eq!(photo.table_of("url"), "photos");
    assert_eq!(photo.special_column(ColumnKind::Discriminator).unwrap().name, "kind");
    assert_eq!(photo.all_columns().len(), 4);
    assert!(photo.generated_column().is_none());
}

#[test]
fn class_table_child_needs_registered_parent() {
    let message = invalid(
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Photo", "photos")
                    .child_of("Content", "content_id")
                    .column(ColumnMetadata::new("url")),
            )
            .build(),
    );
    assert!(message.contains("not a registered root entity"), "{message}");
}

#[test]
fn junction_is_normalised_to_owning_side() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Post", "posts")
                .column(ColumnMetadata::generated_primary("id"))
                .relation(RelationMetadata::many_to_many(
                    "tags",
                    "Tag",
                    JoinTable::new("post_tags", "post_id", "tag_id"),
                )),
        )
        .entity(
            EntityMetadata::new("Tag", "tags")
                .column(ColumnMetadata::generated_primary("id"))
                .relation(RelationMetadata::many_to_many_inverse("posts", "Post", "tags")),
        )
        .build()
        .unwrap();

    let tag = registry.get("Tag").unwrap();
    let side = registry.junction("Tag", tag.find_relation("posts").unwrap()).unwrap();
    assert!(side.swapped);
    assert_eq!(side.owner.name, "Post");
    assert_eq!(side.inverse.name, "Tag");
    assert_eq!(side.relation.property, "tags");
}

#[test]
fn listeners_include_inherited_ones() {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Content", "contents")
                .column(ColumnMetadata::generated_primary("id"))
                .listener(ListenerKind::BeforeInsert, |_| {}),
        )
        .entity(
            EntityMetadata::new("Photo", "photos")
                .child_of("Content", "content_id")
                .listener(ListenerKind::BeforeInsert, |_| {})
                .listener(ListenerKind::AfterRemove, |_| {}),
        )
        .build()
        .unwrap();

    let photo = registry.get("Photo").unwrap();
    assert_eq!(photo.listeners_for(ListenerKind::BeforeInsert).count(), 2);
    assert_eq!(photo.listeners_for(ListenerKind::AfterRemove).count(), 1);
}
