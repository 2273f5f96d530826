//! Connection and transaction scopes.
//!
//! A scope is entered on the current execution unit and must be exited with
//! [`ConnectionScope::exit`] or [`TransactionScope::finish`]. Nested scopes share the
//! unit's lazy connection; only the scope that initialized it tears it down, and
//! only the outermost transaction scope commits or rolls back.
//!
//! A scope dropped without exiting (its future was cancelled) unwinds synchronously:
//! the depth is decremented and an owned connection is discarded without a commit.
//!
//! [`with_connection`] and [`with_transaction`] wrap a closure in a scope and
//! guarantee the exit path runs.

use crate::db::context::{self, TransactionEnd, with_context};
use crate::error::{DbError, DbResult};
use std::future::Future;
use tracing::{debug, info, warn};

/// Shares the unit's lazy connection for the duration of the scope.
#[must_use = "a scope must be exited with `exit().await`"]
#[derive(Debug)]
pub struct ConnectionScope {
    owns_initialization: bool,
    exited: bool,
}

impl ConnectionScope {
    /// Enter on the current execution unit, initializing its context if empty.
    pub fn enter() -> DbResult<Self> {
        let owns_initialization = with_context(|ctx| ctx.ensure_initialized())??;
        if owns_initialization {
            debug!("Execution context initialized by connection scope");
        }
        Ok(Self {
            owns_initialization,
            exited: false,
        })
    }

    /// True if this scope initialized the context and will tear it down.
    pub fn owns_initialization(&self) -> bool {
        self.owns_initialization
    }

    /// Leave the scope, closing the connection if this scope opened the context.
    pub async fn exit(mut self) -> DbResult<()> {
        self.exited = true;
        if self.owns_initialization {
            context::cleanup().await
        } else {
            Ok(())
        }
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if !self.exited && self.owns_initialization {
            context::discard_in_drop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Active,
    /// Depth already decremented; commit, rollback or close may be in flight.
    Finishing,
    Finished,
}

/// A possibly nested transaction on the unit's lazy connection.
#[must_use = "a transaction scope must be finished with `finish(failed).await`"]
#[derive(Debug)]
pub struct TransactionScope {
    should_close_connection: bool,
    depth: usize,
    stage: Stage,
}

impl TransactionScope {
    /// Enter on the current execution unit and increment the nesting depth.
    pub fn enter() -> DbResult<Self> {
        let (should_close_connection, depth) = with_context(|ctx| {
            let owns = ctx.ensure_initialized()?;
            Ok::<_, DbError>((owns, ctx.begin_transaction()))
        })??;
        debug!(depth, "Transaction scope entered");
        Ok(Self {
            should_close_connection,
            depth,
            stage: Stage::Active,
        })
    }

    /// Nesting depth of this scope; 1 for the outermost.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    /// Leave the scope. `failed` is true when the protected block failed.
    ///
    /// When the depth returns to zero the physical transaction is committed, or
    /// rolled back if this or any nested scope failed. A failed commit is followed by
    /// a rollback attempt and reported as `CommitFailed`. The connection is released
    /// afterwards if this scope opened it, whatever the outcome.
    pub async fn finish(mut self, failed: bool) -> DbResult<()> {
        let end = with_context(|ctx| ctx.end_transaction(failed))?;
        self.stage = Stage::Finishing;

        let outcome = if end.depth == 0 {
            Self::finish_outermost(failed, end).await
        } else {
            Ok(())
        };

        let cleanup = if self.should_close_connection {
            context::cleanup().await
        } else {
            Ok(())
        };

        let result = match (outcome, cleanup) {
            (Err(e), Err(cleanup_error)) => {
                warn!(error = %cleanup_error, "Connection cleanup failed after transaction error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), cleanup) => cleanup,
        };
        self.stage = Stage::Finished;
        result
    }

    async fn finish_outermost(failed: bool, end: TransactionEnd) -> DbResult<()> {
        if !failed && !end.rollback_only {
            if end.lost {
                return Err(DbError::not_connected("commit"));
            }
            if !end.opened {
                debug!("Transaction did not touch the database; nothing to commit");
                return Ok(());
            }
            context::commit_or_rollback().await?;
            info!("Transaction committed");
            return Ok(());
        }

        if end.opened {
            context::rollback().await?;
            info!("Transaction rolled back");
        } else {
            debug!("Transaction did not touch the database; nothing to roll back");
        }

        if failed {
            Ok(())
        } else {
            Err(DbError::RolledBack)
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        match self.stage {
            Stage::Active => context::abandon_transaction_in_drop(self.should_close_connection),
            Stage::Finishing => context::abandon_finish_in_drop(self.should_close_connection),
            Stage::Finished => {}
        }
    }
}

/// Prefer the body's error; a cleanup error only surfaces when the body succeeded.
fn settle<T, E: From<DbError>>(result: Result<T, E>, exit: DbResult<()>) -> Result<T, E> {
    match (result, exit) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(exit_error)) => {
            warn!(error = %exit_error, "Scope exit failed after the body failed");
            Err(e)
        }
    }
}

/// Run `f` inside a [`ConnectionScope`].
///
/// Establishes an execution unit first if the task has none.
pub async fn with_connection<F, Fut, T, E>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    context::in_unit(Box::pin(async move {
        let scope = ConnectionScope::enter()?;
        let result = f().await;
        let exit = scope.exit().await;
        settle(result, exit)
    }))
    .await
}

/// Run `f` inside a [`TransactionScope`].
///
/// An `Err` from `f` rolls the transaction back at the outermost level. Establishes
/// an execution unit first if the task has none.
pub async fn with_transaction<F, Fut, T, E>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    context::in_unit(Box::pin(async move {
        let scope = TransactionScope::enter()?;
        let result = f().await;
        let exit = scope.finish(result.is_err()).await;
        settle(result, exit)
    }))
    .await
}
