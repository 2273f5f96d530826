//! Per-unit execution state.
//!
//! Every execution unit (a tokio task, or a block run through [`unit`] or
//! [`Engine::scope`](crate::Engine::scope)) owns one [`ExecutionContext`] in task-local
//! storage. The context holds at most one [`LazyConnection`] and the transaction
//! nesting depth. Units never see each other's context.
//!
//! The context lives in a `RefCell` and is only borrowed for short synchronous
//! sections. A statement that needs the physical connection across an `.await`
//! checks it out as a [`Cursor`] and the cursor hands it back when dropped.

use crate::db::driver::{PhysicalConnection, SqlSyntax};
use crate::db::engine::{self, Engine};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, ResultSet};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

tokio::task_local! {
    static CONTEXT: RefCell<ExecutionContext>;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Handle {
    /// No physical connection yet.
    Unopened,
    Idle(Box<dyn PhysicalConnection>),
    /// Checked out by a cursor, or being opened.
    Leased,
    /// Closed or discarded. Never reopened.
    Closed,
}

/// A physical connection opened on first use and closed exactly once.
pub(crate) struct LazyConnection {
    id: u64,
    handle: Handle,
}

impl LazyConnection {
    fn new() -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            handle: Handle::Unopened,
        }
    }

    /// True once a physical connection exists and has not been closed.
    fn is_open(&self) -> bool {
        matches!(self.handle, Handle::Idle(_) | Handle::Leased)
    }

    fn is_closed(&self) -> bool {
        matches!(self.handle, Handle::Closed)
    }

    /// Check out the physical connection. `Ok(None)` reserves the slot for a connect.
    fn lease(&mut self) -> DbResult<Option<Box<dyn PhysicalConnection>>> {
        match std::mem::replace(&mut self.handle, Handle::Leased) {
            Handle::Idle(conn) => Ok(Some(conn)),
            Handle::Unopened => Ok(None),
            Handle::Leased => Err(connection_busy()),
            Handle::Closed => {
                self.handle = Handle::Closed;
                Err(DbError::ConnectionClosed)
            }
        }
    }

    /// Check out an already-open physical connection for `operation`.
    fn lease_open(&mut self, operation: &str) -> DbResult<Box<dyn PhysicalConnection>> {
        match std::mem::replace(&mut self.handle, Handle::Leased) {
            Handle::Idle(conn) => Ok(conn),
            Handle::Leased => Err(connection_busy()),
            other => {
                self.handle = other;
                Err(DbError::not_connected(operation))
            }
        }
    }

    /// Return a checked-out connection. `None` means the connect never finished.
    /// A connection interrupted mid-operation is dropped and the slot closed.
    fn release(&mut self, conn: Option<Box<dyn PhysicalConnection>>, interrupted: bool) {
        if !matches!(self.handle, Handle::Leased) {
            return;
        }
        self.handle = match conn {
            Some(_) if interrupted => {
                warn!(
                    connection_id = self.id,
                    "Statement interrupted; discarding physical connection"
                );
                Handle::Closed
            }
            Some(conn) => Handle::Idle(conn),
            None => Handle::Unopened,
        };
    }

    /// Detach the physical connection for closing. Idempotent.
    fn take_for_close(&mut self) -> Option<Box<dyn PhysicalConnection>> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Idle(conn) => Some(conn),
            _ => None,
        }
    }
}

fn connection_busy() -> DbError {
    DbError::internal(
        "Physical connection is in use by another statement of this execution unit; \
         statements within one unit must run sequentially",
    )
}

/// Connection and transaction state of one execution unit.
pub(crate) struct ExecutionContext {
    connection: Option<LazyConnection>,
    transaction_depth: usize,
    /// Set when a nested transaction failed; the outermost one must roll back.
    rollback_only: bool,
    /// Engine bound with `Engine::scope`; the process-wide engine otherwise.
    engine: Option<Engine>,
}

impl ExecutionContext {
    fn new(engine: Option<Engine>) -> Self {
        Self {
            connection: None,
            transaction_depth: 0,
            rollback_only: false,
            engine,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.connection.is_some()
    }

    pub(crate) fn init(&mut self) -> DbResult<()> {
        if self.is_initialized() {
            return Err(DbError::internal("Execution context is already initialized"));
        }
        self.connection = Some(LazyConnection::new());
        self.transaction_depth = 0;
        self.rollback_only = false;
        Ok(())
    }

    /// Initialize if empty. Returns true if this call performed the initialization.
    pub(crate) fn ensure_initialized(&mut self) -> DbResult<bool> {
        if self.is_initialized() {
            return Ok(false);
        }
        self.init()?;
        Ok(true)
    }

    /// Drop the lazy connection, returning its physical handle for closing.
    pub(crate) fn cleanup(&mut self) -> Option<Box<dyn PhysicalConnection>> {
        let conn = self.connection.take()?.take_for_close();
        self.transaction_depth = 0;
        self.rollback_only = false;
        conn
    }

    pub(crate) fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    pub(crate) fn begin_transaction(&mut self) -> usize {
        self.transaction_depth += 1;
        self.transaction_depth
    }

    /// Decrement the depth. At zero, returns and clears the rollback-only flag.
    pub(crate) fn end_transaction(&mut self, failed: bool) -> TransactionEnd {
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
        if failed {
            self.rollback_only = true;
        }
        let connection = self.connection.as_ref();
        let end = TransactionEnd {
            depth: self.transaction_depth,
            rollback_only: self.rollback_only,
            opened: connection.is_some_and(LazyConnection::is_open),
            lost: connection.is_some_and(LazyConnection::is_closed),
        };
        if end.depth == 0 {
            self.rollback_only = false;
        }
        end
    }

    /// Discard the connection without closing it gracefully.
    ///
    /// The physical handle is dropped, so the server discards uncommitted work.
    fn discard(&mut self) {
        if let Some(mut lazy) = self.connection.take() {
            if lazy.take_for_close().is_some() {
                warn!(
                    connection_id = lazy.id,
                    "Scope dropped before exit; physical connection discarded"
                );
            }
        }
        self.transaction_depth = 0;
        self.rollback_only = false;
    }

    /// Unwind a transaction scope that was dropped before it finished.
    fn abandon_transaction(&mut self, owns_connection: bool) {
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
        if owns_connection {
            self.discard();
            return;
        }
        if self.transaction_depth > 0 {
            warn!(
                depth = self.transaction_depth,
                "Nested transaction dropped before exit; marking transaction rollback-only"
            );
            self.rollback_only = true;
            return;
        }
        self.reset_connection();
    }

    /// Unwind a transaction scope dropped while its exit path was running.
    ///
    /// The depth was already decremented, but a commit, rollback or close may have
    /// been cut short, leaving the physical connection in an unknown state.
    fn abandon_finish(&mut self, owns_connection: bool) {
        if owns_connection {
            self.discard();
        } else if self.transaction_depth == 0 {
            self.reset_connection();
        }
    }

    /// Swap in a fresh lazy connection so the enclosing connection scope stays
    /// usable. Uncommitted work goes away with the old physical connection.
    fn reset_connection(&mut self) {
        if let Some(lazy) = self.connection.as_mut() {
            if lazy.take_for_close().is_some() {
                warn!(
                    connection_id = lazy.id,
                    "Transaction dropped before exit; physical connection discarded"
                );
            }
            *lazy = LazyConnection::new();
        }
        self.rollback_only = false;
    }
}

/// State observed when a transaction scope exits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransactionEnd {
    pub depth: usize,
    pub rollback_only: bool,
    /// A physical connection exists.
    pub opened: bool,
    /// The physical connection was discarded while the scope was active.
    pub lost: bool,
}

/// Run `f` against the current unit's context.
pub(crate) fn with_context<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> DbResult<R> {
    CONTEXT
        .try_with(|cell| f(&mut cell.borrow_mut()))
        .map_err(|_| DbError::OutsideExecutionUnit)
}

/// Best-effort context access for `Drop` paths. Does nothing outside a unit.
pub(crate) fn with_context_in_drop(f: impl FnOnce(&mut ExecutionContext)) {
    let _ = CONTEXT.try_with(|cell| match cell.try_borrow_mut() {
        Ok(mut ctx) => f(&mut ctx),
        Err(_) => warn!("Execution context busy during scope teardown"),
    });
}

pub(crate) fn discard_in_drop() {
    with_context_in_drop(ExecutionContext::discard);
}

pub(crate) fn abandon_transaction_in_drop(owns_connection: bool) {
    with_context_in_drop(|ctx| ctx.abandon_transaction(owns_connection));
}

pub(crate) fn abandon_finish_in_drop(owns_connection: bool) {
    with_context_in_drop(|ctx| ctx.abandon_finish(owns_connection));
}

/// Run `fut` as a new execution unit with an empty context.
pub fn unit<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    run_unit(None, fut)
}

pub(crate) fn run_unit<F: Future>(
    engine: Option<Engine>,
    fut: F,
) -> impl Future<Output = F::Output> {
    CONTEXT.scope(RefCell::new(ExecutionContext::new(engine)), fut)
}

/// Run `fut` in the current unit, or in a new one if the task has none.
///
/// The body arrives boxed so nested wrappers never hold each other inline.
pub(crate) async fn in_unit<F: Future>(fut: Pin<Box<F>>) -> F::Output {
    if in_execution_unit() {
        fut.await
    } else {
        run_unit(None, fut).await
    }
}

/// True when called inside an execution unit.
pub fn in_execution_unit() -> bool {
    CONTEXT.try_with(|_| ()).is_ok()
}

/// Transaction nesting depth of the current unit; 0 outside any unit.
pub fn current_transaction_depth() -> usize {
    CONTEXT
        .try_with(|cell| cell.borrow().transaction_depth())
        .unwrap_or(0)
}

/// True when the current unit has an active lazy connection.
pub fn is_connection_initialized() -> bool {
    CONTEXT
        .try_with(|cell| cell.borrow().is_initialized())
        .unwrap_or(false)
}

/// Close the current unit's connection and clear the context.
pub(crate) async fn cleanup() -> DbResult<()> {
    let conn = with_context(ExecutionContext::cleanup)?;
    match conn {
        Some(conn) => {
            debug!("Closing physical connection");
            conn.close().await
        }
        None => Ok(()),
    }
}

/// Commit the physical transaction of the current unit.
pub(crate) async fn commit() -> DbResult<()> {
    Cursor::open_only("commit")?.commit().await
}

/// Roll back the physical transaction of the current unit.
pub(crate) async fn rollback() -> DbResult<()> {
    Cursor::open_only("rollback")?.rollback().await
}

/// Commit; on failure roll back and report both outcomes.
pub(crate) async fn commit_or_rollback() -> DbResult<()> {
    let Err(commit_error) = commit().await else {
        return Ok(());
    };
    warn!(error = %commit_error, "Commit failed; rolling back");
    let rollback_error = rollback().await.err();
    if let Some(e) = &rollback_error {
        warn!(error = %e, "Rollback after failed commit also failed");
    }
    Err(DbError::commit_failed(commit_error, rollback_error))
}

/// A physical connection checked out of the current unit's lazy connection.
///
/// Dropping the cursor returns the connection. If the cursor is dropped while an
/// operation is in flight, the connection is discarded instead.
pub(crate) struct Cursor {
    conn: Option<Box<dyn PhysicalConnection>>,
    connection_id: u64,
    in_flight: bool,
}

impl Cursor {
    /// Check out the connection, opening it on first use.
    pub(crate) async fn acquire() -> DbResult<Self> {
        let (connection_id, existing, bound_engine) = with_context(|ctx| {
            let bound_engine = ctx.engine.clone();
            let lazy = ctx.connection.as_mut().ok_or(DbError::NotInitialized)?;
            let existing = lazy.lease()?;
            Ok::<_, DbError>((lazy.id, existing, bound_engine))
        })??;

        // From here on, dropping the cursor gives the slot back.
        let mut cursor = Self {
            conn: existing,
            connection_id,
            in_flight: false,
        };

        if cursor.conn.is_none() {
            let engine = match bound_engine {
                Some(engine) => engine,
                None => engine::engine()?,
            };
            cursor.conn = Some(engine.connect().await?);
        }

        Ok(cursor)
    }

    /// Check out an already-open connection without opening one.
    fn open_only(operation: &str) -> DbResult<Self> {
        let (connection_id, conn) = with_context(|ctx| {
            let lazy = ctx.connection.as_mut().ok_or(DbError::NotInitialized)?;
            let conn = lazy.lease_open(operation)?;
            Ok::<_, DbError>((lazy.id, conn))
        })??;
        Ok(Self {
            conn: Some(conn),
            connection_id,
            in_flight: false,
        })
    }

    pub(crate) fn syntax(&self) -> SqlSyntax {
        self.conn
            .as_ref()
            .map(|conn| conn.syntax())
            .unwrap_or_default()
    }

    pub(crate) async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        let conn = self.conn.as_mut().ok_or(DbError::NotInitialized)?;
        self.in_flight = true;
        let result = conn.query(sql, params).await;
        self.in_flight = false;
        result
    }

    pub(crate) async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let conn = self.conn.as_mut().ok_or(DbError::NotInitialized)?;
        self.in_flight = true;
        let result = conn.execute(sql, params).await;
        self.in_flight = false;
        result
    }

    pub(crate) async fn commit(&mut self) -> DbResult<()> {
        let conn = self.conn.as_mut().ok_or(DbError::NotInitialized)?;
        self.in_flight = true;
        let result = conn.commit().await;
        self.in_flight = false;
        if result.is_ok() {
            debug!(connection_id = self.connection_id, "Committed");
        }
        result
    }

    pub(crate) async fn rollback(&mut self) -> DbResult<()> {
        let conn = self.conn.as_mut().ok_or(DbError::NotInitialized)?;
        self.in_flight = true;
        let result = conn.rollback().await;
        self.in_flight = false;
        if result.is_ok() {
            debug!(connection_id = self.connection_id, "Rolled back");
        }
        result
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let conn = self.conn.take();
        let (id, interrupted) = (self.connection_id, self.in_flight);
        with_context_in_drop(move |ctx| {
            if let Some(lazy) = ctx.connection.as_mut().filter(|lazy| lazy.id == id) {
                lazy.release(conn, interrupted);
            }
        });
    }
}
