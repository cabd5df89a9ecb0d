//! Integration tests for transactions, savepoints and ambient scopes.
//!
//! Tests verify that:
//! - An owning scope disposed without completion rolls back
//! - Nested scopes on the same connection join the ambient transaction
//! - Completing a scope twice is an error
//! - A failing savepoint undoes only its own work
//! - Ambient state is isolated between concurrent flows

mod common;

use common::{insert_person, mock_pool, person_names, sqlite_pool};
use dbscope::db::{ScopeContext, Transaction, TransactionScope, TransactionSource};
use dbscope::error::DbError;
use dbscope::models::TransactionStatus;
use std::time::Duration;

#[tokio::test]
async fn test_dispose_without_complete_rolls_back() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let scope = TransactionScope::begin(&ctx, &pool).await.unwrap();
    assert!(scope.is_owner());
    insert_person(scope.transaction(), "x").await.unwrap();
    let tx = scope.transaction().clone();
    scope.dispose().await;

    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert!(ctx.current().is_none());
    assert!(person_names(&pool).await.is_empty());
}

#[tokio::test]
async fn test_complete_commits() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let mut scope = TransactionScope::begin(&ctx, &pool).await.unwrap();
    insert_person(scope.transaction(), "x").await.unwrap();
    scope.complete().await.unwrap();
    assert_eq!(scope.transaction().status(), TransactionStatus::Committed);
    scope.dispose().await;

    assert_eq!(person_names(&pool).await, vec!["x"]);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_within_rolls_back_on_error() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let result: Result<(), DbError> = TransactionScope::within(&ctx, &pool, |tx| async move {
        insert_person(&tx, "x").await?;
        Err(DbError::invalid_input("validation failed"))
    })
    .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert!(person_names(&pool).await.is_empty());
    assert!(ctx.current().is_none());
}

#[tokio::test]
async fn test_failed_savepoint_keeps_transaction_usable() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    TransactionScope::within(&ctx, &pool, |tx| async move {
        insert_person(&tx, "x").await?;
        tx.with_savepoint(|tx| async move { insert_person(&tx, "a").await })
            .await?;

        let failed: Result<(), DbError> = tx
            .with_savepoint(|tx| async move {
                insert_person(&tx, "y").await?;
                Err(DbError::invalid_input("duplicate"))
            })
            .await;
        assert!(matches!(failed, Err(DbError::InvalidInput { .. })));
        assert!(tx.is_active());
        assert_eq!(tx.savepoint_depth(), 0);

        insert_person(&tx, "z").await?;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(person_names(&pool).await, vec!["x", "a", "z"]);
}

#[tokio::test]
async fn test_joined_scope_does_not_end_transaction() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let mut outer = TransactionScope::begin(&ctx, &pool).await.unwrap();
    let tx = outer.transaction().clone();

    let mut inner = TransactionScope::create(&ctx, tx.clone()).unwrap();
    assert!(!inner.is_owner());
    assert!(inner.transaction().ptr_eq(&tx));
    assert_eq!(ctx.depth(), 2);
    insert_person(inner.transaction(), "x").await.unwrap();
    inner.complete().await.unwrap();
    inner.dispose().await;
    assert!(tx.is_active());
    assert_eq!(ctx.current().unwrap().id(), outer.id());

    // A joined scope dropped without completion must not roll back either
    let dropped = TransactionScope::create(&ctx, tx.clone()).unwrap();
    drop(dropped);
    assert!(tx.is_active());
    assert_eq!(ctx.depth(), 1);

    outer.complete().await.unwrap();
    outer.dispose().await;
    assert_eq!(tx.status(), TransactionStatus::Committed);
    assert_eq!(person_names(&pool).await, vec!["x"]);
}

#[tokio::test]
async fn test_scope_on_other_connection_owns_its_transaction() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let outer = TransactionScope::begin(&ctx, &pool).await.unwrap();
    let other = pool.begin_transaction().await.unwrap();
    assert!(!other.same_connection(outer.transaction()));

    let inner = TransactionScope::create(&ctx, other.clone()).unwrap();
    assert!(inner.is_owner());
    assert_eq!(ctx.current().unwrap().parent().unwrap().id(), outer.id());

    inner.dispose().await;
    assert_eq!(other.status(), TransactionStatus::RolledBack);
    assert!(outer.transaction().is_active());
    outer.dispose().await;
}

#[tokio::test]
async fn test_nested_within_shares_transaction() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let nested_ctx = ctx.clone();
    let nested_pool = pool.clone();
    TransactionScope::within(&ctx, &pool, move |tx| async move {
        insert_person(&tx, "outer").await?;
        let outer_tx = tx.clone();
        TransactionScope::within(&nested_ctx, &nested_pool, move |inner| async move {
            assert!(inner.ptr_eq(&outer_tx));
            insert_person(&inner, "inner").await?;
            Ok(())
        })
        .await?;
        // The inner scope completed but the transaction is still ours
        assert!(tx.is_active());
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(person_names(&pool).await, vec!["outer", "inner"]);
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test]
async fn test_nested_failure_rolls_back_outer() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let nested_ctx = ctx.clone();
    let nested_pool = pool.clone();
    let result: Result<(), DbError> = TransactionScope::within(&ctx, &pool, move |tx| async move {
        insert_person(&tx, "outer").await?;
        TransactionScope::within(&nested_ctx, &nested_pool, |inner| async move {
            insert_person(&inner, "inner").await?;
            Err::<(), _>(DbError::invalid_input("inner failed"))
        })
        .await
    })
    .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert!(person_names(&pool).await.is_empty());
}

#[tokio::test]
async fn test_complete_twice_fails() {
    let (pool, _path) = sqlite_pool(2).await;
    let ctx = ScopeContext::new();

    let mut scope = TransactionScope::begin(&ctx, &pool).await.unwrap();
    scope.complete().await.unwrap();
    let err = scope.complete().await.unwrap_err();
    assert!(matches!(err, DbError::TransactionState { .. }));
    scope.dispose().await;

    let outer = TransactionScope::begin(&ctx, &pool).await.unwrap();
    let mut joined = TransactionScope::create(&ctx, outer.transaction().clone()).unwrap();
    joined.complete().await.unwrap();
    assert!(matches!(
        joined.complete().await,
        Err(DbError::TransactionState { .. })
    ));
    joined.dispose().await;
    outer.dispose().await;
}

#[tokio::test]
async fn test_dropped_scope_rolls_back_in_background() {
    let (pool, _path) = sqlite_pool(1).await;
    let ctx = ScopeContext::new();

    {
        let scope = TransactionScope::begin(&ctx, &pool).await.unwrap();
        insert_person(scope.transaction(), "x").await.unwrap();
    }
    assert!(ctx.current().is_none());

    // The single connection only comes back once the rollback has run
    assert!(person_names(&pool).await.is_empty());
}

#[tokio::test]
async fn test_ended_transaction_rejects_operations() {
    let (pool, _path) = sqlite_pool(2).await;
    let tx = pool.begin_transaction().await.unwrap();
    tx.commit().await.unwrap();

    assert!(matches!(
        insert_person(&tx, "x").await,
        Err(DbError::TransactionState { .. })
    ));
    assert!(matches!(tx.commit().await, Err(DbError::TransactionState { .. })));
    assert!(matches!(tx.rollback().await, Err(DbError::TransactionState { .. })));
    assert!(TransactionScope::create(&ScopeContext::new(), tx).is_err());
}

#[tokio::test]
async fn test_savepoint_nesting_rules() {
    let (pool, _path) = sqlite_pool(2).await;
    let tx = pool.begin_transaction().await.unwrap();

    let outer = tx.create_savepoint(Some("before_people")).await.unwrap();
    let inner = tx.create_savepoint(None).await.unwrap();
    assert_eq!(tx.savepoint_depth(), 2);

    assert!(matches!(
        tx.create_savepoint(Some("before_people")).await,
        Err(DbError::Savepoint { .. })
    ));
    assert!(matches!(
        tx.create_savepoint(Some("bad name")).await,
        Err(DbError::InvalidInput { .. })
    ));
    assert!(matches!(
        tx.release_savepoint("before_people").await,
        Err(DbError::Savepoint { .. })
    ));
    assert!(matches!(tx.commit().await, Err(DbError::Savepoint { .. })));
    assert!(tx.is_active());

    insert_person(&tx, "kept").await.unwrap();
    inner.release().await.unwrap();
    insert_person(&tx, "undone").await.unwrap();
    outer.rollback().await.unwrap();
    assert!(matches!(
        tx.release_savepoint("before_people").await,
        Err(DbError::Savepoint { .. })
    ));

    tx.commit().await.unwrap();
    assert!(person_names(&pool).await.is_empty());
}

#[tokio::test]
async fn test_savepoint_rollback_keeps_earlier_work() {
    let (pool, _path) = sqlite_pool(2).await;
    let tx = pool.begin_transaction().await.unwrap();

    insert_person(&tx, "x").await.unwrap();
    let savepoint = tx.create_savepoint(None).await.unwrap();
    insert_person(&tx, "y").await.unwrap();
    savepoint.rollback().await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(person_names(&pool).await, vec!["x"]);
}

#[tokio::test]
async fn test_forked_context_is_isolated() {
    let (pool, _path) = sqlite_pool(3).await;
    let ctx = ScopeContext::new();
    let outer = TransactionScope::begin(&ctx, &pool).await.unwrap();

    let child = ctx.fork();
    let child_pool = pool.clone();
    let outer_id = outer.id().to_string();
    let task = tokio::spawn(async move {
        assert_eq!(child.current().unwrap().id(), outer_id);
        let scope = TransactionScope::begin(&child, &child_pool).await.unwrap();
        assert_eq!(child.depth(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        scope.dispose().await;
        child.depth()
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(ctx.depth(), 1);
    assert_eq!(task.await.unwrap(), 1);
    assert_eq!(ctx.current().unwrap().id(), outer.id());

    // Unrelated flows see no ambient scope at all
    assert!(ScopeContext::new().current().is_none());
    outer.dispose().await;
}

#[tokio::test]
async fn test_statement_order() {
    let (pool, factory) = mock_pool(0, 1).await;
    let ctx = ScopeContext::new();

    TransactionScope::within(&ctx, &pool, |tx| async move {
        tx.execute("INSERT a", &[]).await?;
        tx.with_savepoint(|tx| async move { tx.execute("INSERT b", &[]).await })
            .await?;
        let _ = tx
            .with_savepoint(|tx| async move {
                tx.execute("INSERT c", &[]).await?;
                Err::<(), _>(DbError::invalid_input("c failed"))
            })
            .await;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(
        factory.state.statements(),
        vec![
            "BEGIN",
            "INSERT a",
            "SAVEPOINT sp_1",
            "INSERT b",
            "RELEASE SAVEPOINT sp_1",
            "SAVEPOINT sp_2",
            "INSERT c",
            "ROLLBACK TO SAVEPOINT sp_2",
            "RELEASE SAVEPOINT sp_2",
            "COMMIT",
        ]
    );
}

#[tokio::test]
async fn test_failed_commit_rolls_back_and_discards() {
    let (pool, factory) = mock_pool(0, 1).await;
    factory.state.fail_on("COMMIT");

    let tx: Transaction = pool.begin_transaction().await.unwrap();
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(factory.state.statements(), vec!["BEGIN", "COMMIT", "ROLLBACK"]);
    assert_eq!(pool.size(), 0);
}

#[tokio::test]
async fn test_rollback_failure_during_dispose_is_swallowed() {
    let (pool, factory) = mock_pool(0, 1).await;
    factory.state.fail_on("ROLLBACK");
    let ctx = ScopeContext::new();

    let result: Result<(), DbError> = TransactionScope::within(&ctx, &pool, |tx| async move {
        tx.execute("INSERT a", &[]).await?;
        Err(DbError::invalid_input("original failure"))
    })
    .await;

    // The caller sees the action's error, not the rollback's
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(pool.size(), 0);
    assert!(ctx.current().is_none());
}

#[tokio::test]
async fn test_savepoint_rollback_failure_returns_original_error() {
    let (pool, factory) = mock_pool(0, 1).await;
    let tx = pool.begin_transaction().await.unwrap();
    factory.state.fail_on("ROLLBACK TO");

    let result: Result<(), DbError> = tx
        .with_savepoint(|_| async move { Err(DbError::invalid_input("original failure")) })
        .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert!(tx.is_active());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_completed_ambient_transaction_is_not_joined() {
    let (pool, factory) = mock_pool(0, 1).await;
    let ctx = ScopeContext::new();

    let mut outer = TransactionScope::begin(&ctx, &pool).await.unwrap();
    outer.complete().await.unwrap();

    // The committed transaction's connection is checked out again
    let tx = pool.begin_transaction().await.unwrap();
    assert_eq!(tx.resource_id(), outer.transaction().resource_id());

    let inner = TransactionScope::create(&ctx, tx.clone()).unwrap();
    assert!(inner.is_owner());
    assert!(inner.transaction().ptr_eq(&tx));
    inner.transaction().execute("INSERT a", &[]).await.unwrap();
    inner.dispose().await;
    outer.dispose().await;

    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(
        factory.state.statements(),
        vec!["BEGIN", "COMMIT", "BEGIN", "INSERT a", "ROLLBACK"]
    );
    assert!(ctx.current().is_none());
}

#[tokio::test]
async fn test_failed_complete_rolls_back_on_dispose() {
    let (pool, factory) = mock_pool(0, 1).await;
    let ctx = ScopeContext::new();

    let mut scope = TransactionScope::begin(&ctx, &pool).await.unwrap();
    let savepoint = scope.transaction().create_savepoint(None).await.unwrap();
    assert!(matches!(
        scope.complete().await,
        Err(DbError::Savepoint { .. })
    ));
    assert!(!scope.is_completed());
    assert!(scope.transaction().is_active());

    let tx = scope.transaction().clone();
    scope.dispose().await;
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(
        factory.state.statements(),
        vec!["BEGIN", "SAVEPOINT sp_1", "ROLLBACK"]
    );
    drop(savepoint);
}
