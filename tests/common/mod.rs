//! Recording test double for the driver seam.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use lazydb::db::PhysicalConnection;
use lazydb::{DbError, DbResult, Engine, QueryParam, ResultSet, SqlSyntax};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Statement text that makes the mock sleep before answering.
pub const SLOW_STATEMENT: &str = "slow statement";

/// Statement text the mock rejects with a database error.
pub const FAILING_STATEMENT: &str = "failing statement";

/// Counts what the engine did to its physical connections.
#[derive(Default)]
pub struct Recorder {
    connects: AtomicUsize,
    closes: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    statements: AtomicUsize,
    fail_connect: AtomicBool,
    fail_commit: AtomicBool,
    slow_commit: AtomicBool,
    fail_rollback: AtomicBool,
    events: Mutex<Vec<&'static str>>,
}

impl Recorder {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_slow_commit(&self, slow: bool) {
        self.slow_commit.store(slow, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    fn record(&self, event: &'static str) {
        self.events.lock().push(event);
    }
}

struct MockConnection {
    recorder: Arc<Recorder>,
}

impl MockConnection {
    async fn run(&self, sql: &str) -> DbResult<()> {
        self.recorder.statements.fetch_add(1, Ordering::SeqCst);
        self.recorder.record("statement");
        match sql {
            SLOW_STATEMENT => tokio::time::sleep(Duration::from_secs(5)).await,
            FAILING_STATEMENT => {
                return Err(DbError::database(
                    "syntax error",
                    Some("42601".to_string()),
                    "Check the SQL syntax",
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

impl PhysicalConnection for MockConnection {
    fn syntax(&self) -> SqlSyntax {
        SqlSyntax::SQLITE
    }

    fn query<'a>(
        &'a mut self,
        sql: &'a str,
        _params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<ResultSet>> {
        Box::pin(async move {
            self.run(sql).await?;
            Ok(ResultSet::new(vec!["n".to_string()], vec![vec![json!(1)]]))
        })
    }

    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        _params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<u64>> {
        Box::pin(async move {
            self.run(sql).await?;
            Ok(1)
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            if self.recorder.slow_commit.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.recorder.fail_commit.load(Ordering::SeqCst) {
                self.recorder.record("commit_failed");
                return Err(DbError::database("commit refused", None, "Retry later"));
            }
            self.recorder.commits.fetch_add(1, Ordering::SeqCst);
            self.recorder.record("commit");
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            if self.recorder.fail_rollback.load(Ordering::SeqCst) {
                self.recorder.record("rollback_failed");
                return Err(DbError::connection("connection reset", "Reconnect"));
            }
            self.recorder.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.recorder.record("rollback");
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>> {
        Box::pin(async move {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
            self.recorder.record("close");
            Ok(())
        })
    }
}

/// An engine backed by recording mock connections.
pub fn mock_engine() -> (Engine, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let shared = recorder.clone();
    let engine = Engine::from_fn(move || {
        let recorder = shared.clone();
        async move {
            if recorder.fail_connect.load(Ordering::SeqCst) {
                return Err(DbError::connection("connection refused", "Start the server"));
            }
            recorder.connects.fetch_add(1, Ordering::SeqCst);
            recorder.record("connect");
            Ok(Box::new(MockConnection { recorder }) as Box<dyn PhysicalConnection>)
        }
    });
    (engine, recorder)
}
