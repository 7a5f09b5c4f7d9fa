use super::*;

fn row(pairs: &[(&str, Value)]) -> ValueMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn insert_generates_sequential_ids() {
    let db = MemoryDatabase::new();
    let runner = db.runner();

    let first = runner
        .insert("posts", &row(&[("title", "a".into())]), Some("id"))
        .await
        .unwrap();
    let second = runner
        .insert("posts", &row(&[("title", "b".into())]), Some("id"))
        .await
        .unwrap();

    assert_eq!(first, Some(Value::Int(1)));
    assert_eq!(second, Some(Value::Int(2)));
    assert_eq!(db.rows("posts").len(), 2);
}

#[tokio::test]
async fn update_and_delete_match_all_conditions() {
    let db = MemoryDatabase::new();
    db.seed("tags", row(&[("id", 1.into()), ("name", "a".into())]));
    db.seed("tags", row(&[("id", 2.into()), ("name", "b".into())]));
    let runner = db.runner();

    let updated = runner
        .update("tags", &row(&[("name", "z".into())]), &row(&[("id", 2.into())]))
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let deleted = runner
        .delete("tags", &row(&[("id", 1.into()), ("name", "nope".into())]))
        .await
        .unwrap();
    assert_eq!(deleted, 0);

    let found = runner.select("tags", &row(&[("name", "z".into())])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("id"), Some(&Value::Int(2)));
}

#[tokio::test]
async fn rollback_discards_transaction_writes() {
    let db = MemoryDatabase::new();
    let runner = db.runner();

    runner.begin_transaction().await.unwrap();
    assert!(runner.is_transaction_active());
    runner
        .insert("posts", &row(&[("title", "a".into())]), Some("id"))
        .await
        .unwrap();
    assert!(db.rows("posts").is_empty());
    assert_eq!(runner.select("posts", &ValueMap::new()).await.unwrap().len(), 1);

    runner.rollback_transaction().await.unwrap();
    assert!(!runner.is_transaction_active());
    assert!(db.rows("posts").is_empty());
}

#[tokio::test]
async fn commit_publishes_transaction_writes() {
    let db = MemoryDatabase::new();
    let runner = db.runner();

    runner.begin_transaction().await.unwrap();
    runner
        .insert("posts", &row(&[("title", "a".into())]), Some("id"))
        .await
        .unwrap();
    runner.commit_transaction().await.unwrap();

    assert_eq!(db.rows("posts").len(), 1);
}

#[tokio::test]
async fn transaction_misuse_is_reported() {
    let runner = MemoryDatabase::new().runner();

    assert!(matches!(
        runner.commit_transaction().await,
        Err(OrmError::TransactionNotStarted)
    ));
    runner.begin_transaction().await.unwrap();
    assert!(matches!(
        runner.begin_transaction().await,
        Err(OrmError::TransactionAlreadyStarted)
    ));
}

#[tokio::test]
async fn released_runner_fails_fast() {
    let runner = MemoryDatabase::new().runner();
    runner.release().await.unwrap();

    assert!(runner.is_released());
    let err = runner.select("posts", &ValueMap::new()).await.unwrap_err();
    assert!(err.is_runner_released());
    assert!(runner.begin_transaction().await.unwrap_err().is_runner_released());
    // Releasing twice is harmless.
    runner.release().await.unwrap();
}

#[tokio::test]
async fn unique_constraint_rejects_duplicates() {
    let db = MemoryDatabase::new().unique("users", "email");
    let runner = db.runner();
    runner
        .insert("users", &row(&[("email", "a@x".into())]), Some("id"))
        .await
        .unwrap();

    let err = runner
        .insert("users", &row(&[("email", "a@x".into())]), Some("id"))
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
}

#[tokio::test]
async fn closure_insert_computes_levels() {
    let db = MemoryDatabase::new();
    let runner = db.runner();

    let root = runner
        .insert_into_closure_table("category_closure", &Value::Int(1), None, true)
        .await
        .unwrap();
    let child = runner
        .insert_into_closure_table("category_closure", &Value::Int(2), Some(&Value::Int(1)), true)
        .await
        .unwrap();
    let grandchild = runner
        .insert_into_closure_table("category_closure", &Value::Int(3), Some(&Value::Int(2)), true)
        .await
        .unwrap();

    assert_eq!((root, child, grandchild), (1, 2, 3));

    let rows = db.rows("category_closure");
    let of_three: Vec<_> = rows
        .iter()
        .filter(|r| r.get("descendant") == Some(&Value::Int(3)))
        .collect();
    // self row plus one per ancestor of the parent
    assert_eq!(of_three.len(), 3);
}

#[tokio::test]
async fn injected_failure_fires_once() {
    let db = MemoryDatabase::new();
    db.fail_on(StatementKind::Insert, "posts");
    let runner = db.runner();

    assert!(runner.insert("posts", &ValueMap::new(), None).await.is_err());
    assert!(runner.insert("posts", &ValueMap::new(), None).await.is_ok());
    assert_eq!(db.mutation_count(), 2);
}

#[tokio::test]
async fn provider_tracks_open_runners() {
    let db = MemoryDatabase::new();
    let runner = db.provide().await.unwrap();
    assert_eq!(db.open_runners(), 1);

    RunnerProvider::release(&db, runner).await.unwrap();
    assert_eq!(db.open_runners(), 0);
}
