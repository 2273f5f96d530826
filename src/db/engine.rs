//! Engine factory.
//!
//! An [`Engine`] opens physical connections on demand. The process-wide engine is
//! configured once with [`create_engine`]; configuring it again without
//! [`reset_engine`] fails with `AlreadyConfigured`. An execution unit can instead be
//! bound to a specific engine with [`Engine::scope`].

use crate::config::EngineConfig;
use crate::db::context;
use crate::db::driver::{Driver, FnDriver, PhysicalConnection};
use crate::db::sqlx_driver::SqlxDriver;
use crate::error::{DbError, DbResult};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

static ENGINE: RwLock<Option<Engine>> = parking_lot::const_rwlock(None);

/// Shared, immutable connection factory.
#[derive(Clone)]
pub struct Engine {
    driver: Arc<dyn Driver>,
}

impl Engine {
    /// Create an engine that connects through sqlx.
    pub fn new(config: EngineConfig) -> Self {
        Self::from_driver(SqlxDriver::new(config))
    }

    pub fn from_driver(driver: impl Driver + 'static) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Create an engine from a connection-construction closure.
    pub fn from_fn<F, Fut>(connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<Box<dyn PhysicalConnection>>> + Send + 'static,
    {
        Self::from_driver(FnDriver::new(connect))
    }

    /// Credential-free description of where connections go.
    pub fn target(&self) -> String {
        self.driver.target()
    }

    /// Open a new physical connection.
    pub async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>> {
        let start = Instant::now();
        let conn = self.driver.connect().await?;
        debug!(
            target_db = %self.driver.target(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened physical connection"
        );
        Ok(conn)
    }

    /// Run `fut` as one execution unit whose connections come from this engine.
    ///
    /// The unit gets a fresh execution context even when called from inside another
    /// unit; the two never share a connection.
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> + use<F> {
        context::run_unit(Some(self.clone()), fut)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("target", &self.driver.target())
            .finish()
    }
}

/// Configure the process-wide engine with a sqlx connection factory.
pub fn create_engine(config: EngineConfig) -> DbResult<Engine> {
    create_engine_with(Engine::new(config))
}

/// Install `engine` as the process-wide engine.
pub fn create_engine_with(engine: Engine) -> DbResult<Engine> {
    let mut slot = ENGINE.write();
    if slot.is_some() {
        return Err(DbError::AlreadyConfigured);
    }
    info!(target_db = %engine.target(), "Engine initialized");
    *slot = Some(engine.clone());
    Ok(engine)
}

/// Remove the process-wide engine, returning it if one was configured.
///
/// Execution units that already hold a connection keep using it.
pub fn reset_engine() -> Option<Engine> {
    let previous = ENGINE.write().take();
    if let Some(engine) = &previous {
        info!(target_db = %engine.target(), "Engine reset");
    }
    previous
}

/// The process-wide engine.
pub fn engine() -> DbResult<Engine> {
    ENGINE.read().clone().ok_or(DbError::NotConfigured)
}
