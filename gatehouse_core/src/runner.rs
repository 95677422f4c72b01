//! Task runner: drains pending rebuild tasks with per-user serialization.
//!
//! One runner per process. `submit` is an idempotent kick: it spawns the
//! drain worker only when idle. The drain loop walks the task table oldest
//! first, skipping users that already failed this invocation; a later
//! `submit` retries them because the task rows survive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use time::{Duration, OffsetDateTime};
use tracing::{debug, error};

use crate::errors::CoreError;
use crate::lock::{generate_value, user_lock_key, LockService, Stage};
use crate::model::UserId;
use crate::rebuild;
use crate::store::Database;

/// Singleton executor for rebuild tasks.
#[derive(Debug)]
pub struct TaskRunner {
    db: Arc<Database>,
    locks: Arc<LockService>,
    lock_ttl: Duration,
    background: bool,
    running: AtomicBool,
}

impl TaskRunner {
    /// Build the runner. With `background` off, `submit` becomes a no-op
    /// and callers drive [`TaskRunner::drain`] themselves; the read-path
    /// staleness check still rebuilds synchronously either way.
    pub fn new(
        db: Arc<Database>,
        locks: Arc<LockService>,
        lock_ttl: Duration,
        background: bool,
    ) -> Arc<Self> {
        Arc::new(TaskRunner {
            db,
            locks,
            lock_ttl,
            background,
            running: AtomicBool::new(false),
        })
    }

    /// Idempotent kick: start the drain worker if it is idle.
    pub fn submit(self: &Arc<Self>) {
        if !self.background {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let runner = Arc::clone(self);
        thread::spawn(move || {
            runner.drain();
            runner.running.store(false, Ordering::SeqCst);
        });
    }

    /// Drain every eligible task synchronously. Users that fail stay in a
    /// local failed set for this invocation only.
    pub fn drain(&self) {
        debug!("mapping node task drain running");
        let mut failed: HashSet<UserId> = HashSet::new();
        loop {
            let next = {
                let tables = self.db.read();
                tables.tasks.pick_oldest(&failed).map(|task| task.user)
            };
            let Some(user) = next else {
                break;
            };
            match self.run_for_user(user) {
                Ok(()) => {}
                Err(CoreError::SomeoneIsDoingThis) => {
                    debug!(user = %user, "user lock busy, skipping for this drain");
                    failed.insert(user);
                }
                Err(err) => {
                    error!(user = %user, error = %err, "rebuild failed, skipping user for this drain");
                    failed.insert(user);
                }
            }
        }
        debug!("mapping node task drain finished");
    }

    /// Rebuild one user now, if they have pending tasks.
    ///
    /// The two-phase protocol: acquire the user lock in `DOING`; inside one
    /// transaction recompute the rows, replace them, and delete the task
    /// rows created up to now; swap the lock to `COMMITTING`; commit. A
    /// failed swap means the TTL expired mid-write; the transaction rolls
    /// back and the tasks stay for retry.
    pub fn run_for_user(&self, user: UserId) -> Result<(), CoreError> {
        let key = user_lock_key(user);
        let doing = generate_value(Stage::Doing);
        let committing = generate_value(Stage::Committing);

        if !self.locks.acquire(&key, &doing, self.lock_ttl) {
            error!(user = %user, "update mapping node task lock acquire failed");
            return Err(CoreError::SomeoneIsDoingThis);
        }

        let result = self.db.transaction(|tables| {
            if !tables.tasks.has_for_user(user) {
                return Ok(());
            }
            rebuild::rebuild_user(tables, user)?;
            tables
                .tasks
                .delete_for_user_up_to(user, OffsetDateTime::now_utc());
            if !self.locks.change_state(&key, &doing, &committing) {
                error!(user = %user, "update mapping node task lock timed out");
                return Err(CoreError::LockTimeout);
            }
            Ok(())
        });

        self.locks.release(&key, &committing, &doing);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;

    #[test]
    fn drain_consumes_all_tasks_and_builds_trees() {
        let fx = Fixture::tree_undrained();
        assert!(fx.gatehouse.database().read().tasks.any_pending());

        fx.runner().drain();

        let tables = fx.gatehouse.database().read();
        assert!(!tables.tasks.any_pending());
        assert_eq!(tables.mapping.rows_for_user(fx.u1).len(), 2);
        assert_eq!(tables.mapping.rows_for_user(fx.u3).len(), 3);
    }

    #[test]
    fn run_for_user_without_tasks_is_a_no_op() {
        let fx = Fixture::tree();
        fx.runner().run_for_user(fx.u1).unwrap();
        assert_eq!(
            fx.gatehouse.database().read().mapping.rows_for_user(fx.u1).len(),
            2
        );
    }

    #[test]
    fn contended_lock_surfaces_someone_is_doing_this() {
        let fx = Fixture::tree_undrained();
        let key = user_lock_key(fx.u1);
        let other = generate_value(Stage::Doing);
        assert!(fx
            .locks()
            .acquire(&key, &other, Duration::seconds(60)));

        let result = fx.runner().run_for_user(fx.u1);
        assert!(matches!(result, Err(CoreError::SomeoneIsDoingThis)));
        // The foreign holder's lock survives the failed attempt.
        assert_eq!(fx.locks().stage(&key), Some(Stage::Doing));
        // The task is still there for a retry.
        assert!(fx.gatehouse.database().read().tasks.has_for_user(fx.u1));
    }

    #[test]
    fn drain_skips_locked_users_and_finishes_the_rest() {
        let fx = Fixture::tree_undrained();
        let key = user_lock_key(fx.u1);
        let other = generate_value(Stage::Doing);
        assert!(fx.locks().acquire(&key, &other, Duration::seconds(60)));

        fx.runner().drain();

        let tables = fx.gatehouse.database().read();
        assert!(tables.tasks.has_for_user(fx.u1));
        assert!(!tables.tasks.has_for_user(fx.u2));
        assert!(!tables.tasks.has_for_user(fx.u3));
    }

    #[test]
    fn expired_ttl_rolls_the_rebuild_back() {
        // A zero TTL expires the lock before the commit transition, so the
        // CAS fails and the whole rebuild transaction must roll back.
        let fx = Fixture::tree_undrained_with_ttl(Duration::ZERO);
        let result = fx.runner().run_for_user(fx.u1);
        assert!(matches!(result, Err(CoreError::LockTimeout)));

        let tables = fx.gatehouse.database().read();
        assert!(tables.mapping.rows_for_user(fx.u1).is_empty());
        assert!(tables.tasks.has_for_user(fx.u1));
    }
}
