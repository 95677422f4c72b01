//! Gatehouse Module
//!
//! Wires the store, the lock service and the task runner into one handle
//! the read and write surfaces hang off.

use std::sync::Arc;

use crate::config::GatehouseConfig;
use crate::lock::LockService;
use crate::model::UserId;
use crate::runner::TaskRunner;
use crate::store::Database;

/// Represents the Gatehouse core in its entirety.
#[derive(Debug)]
pub struct Gatehouse {
    config: GatehouseConfig,
    db: Arc<Database>,
    locks: Arc<LockService>,
    runner: Arc<TaskRunner>,
}

impl Gatehouse {
    /// A core over a fresh, empty database.
    pub fn new(config: GatehouseConfig) -> Self {
        Self::with_database(config, Arc::new(Database::new()))
    }

    /// A core over an existing database, e.g. one restored from a snapshot.
    pub fn with_database(config: GatehouseConfig, db: Arc<Database>) -> Self {
        let locks = Arc::new(LockService::new());
        let runner = TaskRunner::new(
            Arc::clone(&db),
            Arc::clone(&locks),
            config.lock_ttl(),
            config.background_worker,
        );
        Gatehouse {
            config,
            db,
            locks,
            runner,
        }
    }

    /// The configuration this core runs with.
    pub fn config(&self) -> &GatehouseConfig {
        &self.config
    }

    /// The authoritative database.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The per-user lock namespace.
    pub fn locks(&self) -> &Arc<LockService> {
        &self.locks
    }

    /// The rebuild task runner.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Kick the background drain worker.
    pub fn submit_rebuilds(&self) {
        self.runner.submit();
    }

    /// Drain every pending rebuild synchronously.
    pub fn drain_rebuilds(&self) {
        self.runner.drain();
    }

    /// Total pending rebuild tasks.
    pub fn pending_rebuild_count(&self) -> usize {
        self.db.read().tasks.len()
    }

    /// Pending rebuild tasks for one user.
    pub fn pending_rebuilds_for(&self, user: UserId) -> usize {
        self.db.read().tasks.count_for_user(user)
    }
}
