mod common;

use common::{column, id};
use entigraph::memory::MemoryDatabase;
use entigraph::{
    ClosureColumns, ColumnMetadata, Entity, EntityManager, EntityMetadata, MetadataRegistry, RelationMetadata,
    Value, ValueMap,
};

fn categories() -> MetadataRegistry {
    MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Category", "categories")
                .closure("categories_closure")
                .column(ColumnMetadata::generated_primary("id"))
                .column(ColumnMetadata::new("name"))
                .column(ColumnMetadata::tree_level("level"))
                .relation(
                    RelationMetadata::many_to_one("parent", "Category", "parent_id")
                        .tree_parent()
                        .inverse("children"),
                )
                .relation(RelationMetadata::one_to_many("children", "Category", "parent")),
        )
        .build()
        .unwrap()
}

fn category(name: &str) -> Entity {
    Entity::new("Category").with("name", name)
}

/// `(ancestor, descendant)` pairs, sorted.
fn closure_pairs(db: &MemoryDatabase) -> Vec<(i64, i64)> {
    let mut pairs: Vec<_> = db
        .rows("categories_closure")
        .iter()
        .map(|r: &ValueMap| {
            (
                r.get("ancestor").and_then(Value::as_i64).unwrap(),
                r.get("descendant").and_then(Value::as_i64).unwrap(),
            )
        })
        .collect();
    pairs.sort();
    pairs
}

fn key(entity: &Entity) -> i64 {
    entity.get("id").and_then(|v| v.as_i64()).unwrap()
}

#[tokio::test]
async fn inserting_a_chain_writes_every_ancestor_row() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let root = category("root");
    let child = category("child").with_one("parent", root.clone());
    let leaf = category("leaf").with_one("parent", child.clone());

    manager.persist(&leaf).await.unwrap();

    let (r, c, l) = (key(&root), key(&child), key(&leaf));
    let mut expected = vec![(r, r), (r, c), (r, l), (c, c), (c, l), (l, l)];
    expected.sort();
    assert_eq!(closure_pairs(&db), expected);
    assert_eq!(root.get("level"), Some(Value::Int(1)));
    assert_eq!(child.get("level"), Some(Value::Int(2)));
    assert_eq!(leaf.get("level"), Some(Value::Int(3)));

    let stored = manager.find_by_id_with("Category", &id(l), &["parent"]).await.unwrap().unwrap();
    assert_eq!(stored.get("level"), Some(Value::Int(3)));
    assert_eq!(stored.related_one("parent").and_then(|p| p.get("id")), Some(Value::Int(c)));
}

#[tokio::test]
async fn children_collection_of_a_new_root_is_inserted_below_it() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let (a, b) = (category("a"), category("b"));
    let root = category("root").with_many("children", vec![a.clone(), b.clone()]);
    a.set_one("parent", Some(root.clone()));
    b.set_one("parent", Some(root.clone()));

    manager.persist(&root).await.unwrap();

    let (r, a, b) = (key(&root), key(&a), key(&b));
    let mut expected = vec![(r, r), (r, a), (r, b), (a, a), (b, b)];
    expected.sort();
    assert_eq!(closure_pairs(&db), expected);
    assert_eq!(
        column(&db, "categories", "level").iter().filter(|v| **v == Value::Int(2)).count(),
        2
    );
}

#[tokio::test]
async fn new_node_under_an_existing_parent_inherits_its_ancestors() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let root = category("root");
    let child = category("child").with_one("parent", root.clone());
    manager.persist(&child).await.unwrap();

    let existing = manager.find_by_id("Category", &id(key(&child))).await.unwrap().unwrap();
    let leaf = category("leaf").with_one("parent", existing);
    manager.persist(&leaf).await.unwrap();

    let (r, c, l) = (key(&root), key(&child), key(&leaf));
    assert_eq!(leaf.get("level"), Some(Value::Int(3)));
    let mut expected = vec![(r, r), (r, c), (r, l), (c, c), (c, l), (l, l)];
    expected.sort();
    assert_eq!(closure_pairs(&db), expected);
}

#[tokio::test]
async fn custom_closure_columns_are_honoured() {
    let db = MemoryDatabase::new().with_closure_columns(ClosureColumns {
        ancestor: "up".to_string(),
        descendant: "down".to_string(),
        level: "depth".to_string(),
    });
    let manager = EntityManager::new(categories(), db.clone());

    manager.persist(&category("root")).await.unwrap();

    let rows = db.rows("categories_closure");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("up"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get("down"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get("depth"), Some(&Value::Int(1)));
}

#[tokio::test]
async fn node_placed_only_in_a_new_parents_collection_gets_ancestor_rows() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let a = category("a");
    let root = category("root").with_many("children", vec![a.clone()]);

    manager.persist(&root).await.unwrap();

    let (r, a_id) = (key(&root), key(&a));
    let mut expected = vec![(r, r), (r, a_id), (a_id, a_id)];
    expected.sort();
    assert_eq!(closure_pairs(&db), expected);
    assert_eq!(a.get("level"), Some(Value::Int(2)));
    let stored = manager.find_by_id_with("Category", &id(a_id), &["parent"]).await.unwrap().unwrap();
    assert_eq!(stored.get("level"), Some(Value::Int(2)));
    assert_eq!(stored.related_one("parent").and_then(|p| p.get("id")), Some(Value::Int(r)));
}

#[tokio::test]
async fn node_pushed_into_a_stored_parents_collection_gets_ancestor_rows() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let root = category("root");
    manager.persist(&root).await.unwrap();

    let b = category("b");
    root.push("children", b.clone());
    manager.persist(&root).await.unwrap();

    let (r, b_id) = (key(&root), key(&b));
    let mut expected = vec![(r, r), (r, b_id), (b_id, b_id)];
    expected.sort();
    assert_eq!(closure_pairs(&db), expected);
    assert_eq!(b.get("level"), Some(Value::Int(2)));
}

#[tokio::test]
async fn reloaded_tree_persists_without_writes() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let root = category("root");
    let child = category("child").with_one("parent", root.clone());
    let leaf = category("leaf").with_one("parent", child.clone());
    manager.persist(&leaf).await.unwrap();
    db.clear_statements();

    let loaded = manager
        .find_by_id_with(
            "Category",
            &id(key(&root)),
            &["children", "children.parent", "children.children", "children.children.parent"],
        )
        .await
        .unwrap()
        .unwrap();
    manager.persist(&loaded).await.unwrap();

    assert_eq!(db.mutation_count(), 0, "{:?}", db.statements());
    assert_eq!(loaded.get("level"), Some(Value::Int(1)));
}

#[tokio::test]
async fn clearing_a_collection_two_levels_down_detaches_its_rows() {
    let db = MemoryDatabase::new();
    let manager = EntityManager::new(categories(), db.clone());
    let root = category("root");
    let child = category("child").with_one("parent", root.clone());
    let leaf = category("leaf").with_one("parent", child.clone());
    let tip = category("tip").with_one("parent", leaf.clone());
    manager.persist(&tip).await.unwrap();

    let loaded = manager
        .find_by_id_with(
            "Category",
            &id(key(&root)),
            &["children", "children.children", "children.children.children"],
        )
        .await
        .unwrap()
        .unwrap();
    let loaded_child = loaded.relation("children").unwrap().entities().remove(0);
    let loaded_leaf = loaded_child.relation("children").unwrap().entities().remove(0);
    assert_eq!(loaded_leaf.get("id"), Some(Value::Int(key(&leaf))));
    loaded_leaf.set_many("children", Vec::new());
    db.clear_statements();

    manager.persist(&loaded).await.unwrap();

    let stored = |entity: &Entity| {
        db.rows("categories")
            .into_iter()
            .find(|r| r.get("id") == Some(&Value::Int(key(entity))))
            .unwrap()
    };
    assert_eq!(stored(&tip).get("parent_id"), Some(&Value::Null));
    assert_eq!(stored(&leaf).get("parent_id"), Some(&Value::Int(key(&child))));
    assert_eq!(db.mutation_count(), 1, "{:?}", db.statements());
}
