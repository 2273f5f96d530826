//! Connection sharing and transaction nesting against a recording driver.

mod common;

use common::{FAILING_STATEMENT, SLOW_STATEMENT, mock_engine};
use lazydb::{
    ConnectionScope, DbError, DbResult, TransactionScope, current_transaction_depth,
    is_connection_initialized, select, select_one, unit, update, with_connection,
    with_transaction,
};
use std::time::Duration;

/// Nest one `with_transaction` per token around a single `update`.
macro_rules! nested_transactions {
    () => {
        update("a", &[]).await.map(|_| ())
    };
    ($level:tt $($rest:tt)*) => {
        with_transaction(|| async { nested_transactions!($($rest)*) }).await
    };
}

#[tokio::test]
async fn test_one_physical_connection_per_unit() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_connection(|| async {
            update("insert 1", &[]).await?;
            with_transaction(|| async {
                update("insert 2", &[]).await?;
                with_connection(|| async { select("select", &[]).await.map(|_| ()) }).await
            })
            .await?;
            // Inner scopes have exited; the connection stays open.
            assert_eq!(recorder.closes(), 0);
            select_one("select", &[]).await.map(|_| ())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.connects(), 1);
    assert_eq!(recorder.closes(), 1);
    assert_eq!(recorder.statements(), 4);
}

#[tokio::test]
async fn test_flat_commit() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_transaction(|| async {
            update("a", &[]).await?;
            with_transaction(|| async {
                update("b", &[]).await?;
                with_transaction(|| async { update("c", &[]).await.map(|_| ()) }).await
            })
            .await?;
            assert_eq!(recorder.commits(), 0);
            Ok(())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.commits(), 1);
    assert_eq!(recorder.rollbacks(), 0);
    assert_eq!(
        recorder.events(),
        vec!["connect", "statement", "statement", "statement", "commit", "close"]
    );
}

#[tokio::test]
async fn test_failure_at_any_level_rolls_back_once() {
    for failing_level in 1..=3 {
        let (engine, recorder) = mock_engine();

        let result: DbResult<()> = engine
            .scope(with_transaction(|| async {
                update("a", &[]).await?;
                with_transaction(|| async {
                    update("b", &[]).await?;
                    with_transaction(|| async {
                        update("c", &[]).await?;
                        if failing_level == 3 {
                            return Err(DbError::invalid_input("level 3"));
                        }
                        Ok(())
                    })
                    .await?;
                    if failing_level == 2 {
                        return Err(DbError::invalid_input("level 2"));
                    }
                    Ok(())
                })
                .await?;
                if failing_level == 1 {
                    return Err(DbError::invalid_input("level 1"));
                }
                Ok(())
            }))
            .await;

        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
        assert_eq!(recorder.rollbacks(), 1, "level {failing_level}");
        assert_eq!(recorder.commits(), 0, "level {failing_level}");
        assert_eq!(recorder.closes(), 1, "level {failing_level}");
    }
}

#[tokio::test]
async fn test_swallowed_inner_failure_still_rolls_back() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_transaction(|| async {
            update("a", &[]).await?;
            let inner: DbResult<()> = with_transaction(|| async {
                update("b", &[]).await?;
                Err(DbError::invalid_input("inner"))
            })
            .await;
            assert!(inner.is_err());
            Ok(())
        }))
        .await;

    assert!(matches!(result, Err(DbError::RolledBack)));
    assert_eq!(recorder.rollbacks(), 1);
    assert_eq!(recorder.commits(), 0);
}

#[tokio::test]
async fn test_depth_tracks_nesting() {
    let (engine, _recorder) = mock_engine();

    engine
        .scope(async {
            assert_eq!(current_transaction_depth(), 0);
            let outer = TransactionScope::enter().unwrap();
            assert!(outer.is_outermost());
            let middle = TransactionScope::enter().unwrap();
            let inner = TransactionScope::enter().unwrap();
            assert_eq!(current_transaction_depth(), 3);
            inner.finish(false).await.unwrap();
            assert_eq!(current_transaction_depth(), 2);
            middle.finish(false).await.unwrap();
            assert_eq!(current_transaction_depth(), 1);
            outer.finish(false).await.unwrap();
            assert_eq!(current_transaction_depth(), 0);
            assert!(!is_connection_initialized());
        })
        .await;
}

#[tokio::test]
async fn test_update_auto_commits_outside_transaction() {
    let (engine, recorder) = mock_engine();

    engine
        .scope(async {
            let scope = ConnectionScope::enter().unwrap();
            update("a", &[]).await.unwrap();
            assert_eq!(recorder.commits(), 1);

            let tx = TransactionScope::enter().unwrap();
            update("b", &[]).await.unwrap();
            assert_eq!(recorder.commits(), 1);
            tx.finish(false).await.unwrap();
            assert_eq!(recorder.commits(), 2);

            scope.exit().await.unwrap();
        })
        .await;

    assert_eq!(recorder.connects(), 1);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_select_does_not_commit() {
    let (engine, recorder) = mock_engine();

    let row = engine.scope(select_one("select", &[])).await.unwrap();
    assert_eq!(row.and_then(|r| r.get_i64("n")), Some(1));
    assert_eq!(recorder.commits(), 0);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_failed_commit_is_followed_by_rollback() {
    let (engine, recorder) = mock_engine();
    recorder.set_fail_commit(true);

    let result: DbResult<()> = engine
        .scope(with_transaction(|| async { update("a", &[]).await.map(|_| ()) }))
        .await;

    match result {
        Err(DbError::CommitFailed {
            source,
            rollback_error,
        }) => {
            assert!(source.to_string().contains("commit refused"));
            assert!(rollback_error.is_none());
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert_eq!(
        recorder.events(),
        vec!["connect", "statement", "commit_failed", "rollback", "close"]
    );
}

#[tokio::test]
async fn test_empty_transaction_opens_nothing() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<u32> = engine.scope(with_transaction(|| async { Ok(7) })).await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(recorder.connects(), 0);
    assert_eq!(recorder.commits(), 0);
    assert_eq!(recorder.closes(), 0);
}

#[tokio::test]
async fn test_without_engine() {
    // This test binary never configures the process-wide engine.
    let result = update("a", &[]).await;
    assert!(matches!(result, Err(DbError::NotConfigured)));
}

#[tokio::test]
async fn test_failed_connect_can_be_retried_in_scope() {
    let (engine, recorder) = mock_engine();
    recorder.set_fail_connect(true);

    let result: DbResult<()> = engine
        .scope(with_connection(|| async {
            let first = update("a", &[]).await;
            assert!(matches!(first, Err(DbError::Connection { .. })));
            recorder.set_fail_connect(false);
            update("a", &[]).await.map(|_| ())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.connects(), 1);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_cancelled_transaction_discards_connection() {
    let (engine, recorder) = mock_engine();

    engine
        .scope(async {
            let cancelled = tokio::time::timeout(
                Duration::from_millis(20),
                with_transaction(|| async { update(SLOW_STATEMENT, &[]).await.map(|_| ()) }),
            )
            .await;
            assert!(cancelled.is_err());

            assert_eq!(current_transaction_depth(), 0);
            assert!(!is_connection_initialized());

            // The unit keeps working with a fresh connection.
            update("a", &[]).await.unwrap();
        })
        .await;

    assert_eq!(recorder.connects(), 2);
    // The first connection was dropped, not closed and not committed.
    assert_eq!(recorder.closes(), 1);
    assert_eq!(recorder.commits(), 1);
    assert_eq!(recorder.rollbacks(), 0);
}

#[tokio::test]
async fn test_cancelled_nested_transaction_inside_connection_scope() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_connection(|| async {
            let cancelled = tokio::time::timeout(
                Duration::from_millis(20),
                with_transaction(|| async { update(SLOW_STATEMENT, &[]).await.map(|_| ()) }),
            )
            .await;
            assert!(cancelled.is_err());
            assert!(is_connection_initialized());
            update("a", &[]).await.map(|_| ())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.connects(), 2);
    assert_eq!(recorder.closes(), 1);
    assert_eq!(recorder.commits(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_units_do_not_share_state() {
    let (engine, recorder) = mock_engine();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .scope(with_transaction(|| async {
                    update("a", &[]).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    assert_eq!(current_transaction_depth(), 1);
                    update("b", &[]).await.map(|_| ())
                }))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(recorder.connects(), 4);
    assert_eq!(recorder.commits(), 4);
    assert_eq!(recorder.closes(), 4);
}

#[tokio::test]
async fn test_nested_unit_is_independent() {
    let (engine, recorder) = mock_engine();

    engine
        .scope(with_transaction(|| async {
            update("a", &[]).await?;
            // A nested unit gets its own context, so this commits on its own connection.
            engine.scope(update("b", &[])).await?;
            assert_eq!(recorder.commits(), 1);
            unit(async { assert_eq!(current_transaction_depth(), 0) }).await;
            Ok::<_, DbError>(())
        }))
        .await
        .unwrap();

    assert_eq!(recorder.connects(), 2);
    assert_eq!(recorder.commits(), 2);
}

#[tokio::test]
async fn test_deep_nesting_shares_one_transaction() {
    let (engine, recorder) = mock_engine();

    let nested = engine.scope(async { nested_transactions!(1 2 3 4 5 6 7 8 9 10 11 12) });
    // Each level's body lives on the heap, so depth does not grow the future.
    assert!(
        std::mem::size_of_val(&nested) < 16 * 1024,
        "future is {} bytes",
        std::mem::size_of_val(&nested)
    );
    let result: DbResult<()> = nested.await;

    result.unwrap();
    assert_eq!(
        recorder.events(),
        vec!["connect", "statement", "commit", "close"]
    );
}

#[tokio::test]
async fn test_cancelled_commit_clears_owned_context() {
    let (engine, recorder) = mock_engine();

    engine
        .scope(async {
            recorder.set_slow_commit(true);
            let cancelled = tokio::time::timeout(
                Duration::from_millis(20),
                with_transaction(|| async { update("a", &[]).await.map(|_| ()) }),
            )
            .await;
            assert!(cancelled.is_err());

            assert_eq!(current_transaction_depth(), 0);
            assert!(!is_connection_initialized());

            recorder.set_slow_commit(false);
            update("b", &[]).await.unwrap();
        })
        .await;

    assert_eq!(recorder.connects(), 2);
    // The interrupted connection is dropped without commit or close.
    assert_eq!(recorder.commits(), 1);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_cancelled_commit_inside_connection_scope() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_connection(|| async {
            recorder.set_slow_commit(true);
            let cancelled = tokio::time::timeout(
                Duration::from_millis(20),
                with_transaction(|| async { update("a", &[]).await.map(|_| ()) }),
            )
            .await;
            assert!(cancelled.is_err());
            assert!(is_connection_initialized());
            assert_eq!(current_transaction_depth(), 0);

            recorder.set_slow_commit(false);
            update("b", &[]).await.map(|_| ())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.connects(), 2);
    assert_eq!(recorder.commits(), 1);
    assert_eq!(recorder.closes(), 1);
}

#[tokio::test]
async fn test_failed_query_outside_transaction_rolls_back() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_connection(|| async {
            let failed = select(FAILING_STATEMENT, &[]).await;
            assert!(matches!(failed, Err(DbError::Database { .. })));
            assert_eq!(recorder.rollbacks(), 1);
            update("a", &[]).await.map(|_| ())
        }))
        .await;

    result.unwrap();
    assert_eq!(
        recorder.events(),
        vec!["connect", "statement", "rollback", "statement", "commit", "close"]
    );
}

#[tokio::test]
async fn test_failed_query_inside_transaction_leaves_it_to_the_scope() {
    let (engine, recorder) = mock_engine();

    let result: DbResult<()> = engine
        .scope(with_transaction(|| async {
            update("a", &[]).await?;
            let failed = select_one(FAILING_STATEMENT, &[]).await;
            assert!(failed.is_err());
            assert_eq!(recorder.rollbacks(), 0);
            Ok(())
        }))
        .await;

    result.unwrap();
    assert_eq!(recorder.commits(), 1);
    assert_eq!(recorder.rollbacks(), 0);
}

#[tokio::test]
async fn test_commit_error_stays_primary_when_rollback_fails() {
    let (engine, recorder) = mock_engine();
    recorder.set_fail_commit(true);
    recorder.set_fail_rollback(true);

    let result: DbResult<()> = engine
        .scope(with_transaction(|| async { update("a", &[]).await.map(|_| ()) }))
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.suggestion(), Some("Retry later"));
    match err {
        DbError::CommitFailed {
            source,
            rollback_error,
        } => {
            assert!(source.to_string().contains("commit refused"));
            let rollback_error = rollback_error.expect("rollback failure is reported");
            assert!(rollback_error.to_string().contains("connection reset"));
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert_eq!(
        recorder.events(),
        vec!["connect", "statement", "commit_failed", "rollback_failed", "close"]
    );
}
